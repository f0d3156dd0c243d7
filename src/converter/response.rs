use super::ConversionError;
use crate::models::openai::{OpenAIContent, OpenAIContentPart, OpenAIResponse, OpenAIToolCall};
use crate::models::{ContentBlock, ImageSource, MessagesResponse, Role, StopReason, Usage};

/// Transform an OpenAI Chat Completions response into an Anthropic Messages response.
///
/// - `message.content` → `text` blocks (and `image` blocks for image parts)
/// - `message.tool_calls` → `tool_use` blocks, arguments parsed into `input`
/// - `finish_reason` → `stop_reason` via [`map_finish_reason`]
/// - missing usage → zero counters
///
/// Only the first choice is used.
pub fn to_client(response: OpenAIResponse) -> Result<MessagesResponse, ConversionError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or(ConversionError::EmptyResponse)?;

    let mut content = Vec::new();

    match choice.message.content {
        Some(OpenAIContent::String(text)) if !text.is_empty() => content.push(ContentBlock::Text { text }),
        Some(OpenAIContent::Parts(parts)) => {
            for part in parts {
                match part {
                    OpenAIContentPart::Text { text } if !text.is_empty() => content.push(ContentBlock::Text { text }),
                    OpenAIContentPart::Text { .. } => {}
                    OpenAIContentPart::ImageUrl { image_url } => content.push(ContentBlock::Image {
                        source: parse_image_url(&image_url.url),
                    }),
                }
            }
        }
        _ => {}
    }

    for tool_call in choice.message.tool_calls.unwrap_or_default() {
        content.push(tool_use_block(tool_call)?);
    }

    let stop_reason = choice.finish_reason.as_deref().map(map_finish_reason);
    let usage = response
        .usage
        .map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    let id = if response.id.is_empty() {
        format!("msg_{}", uuid::Uuid::new_v4().simple())
    } else {
        response.id
    };

    Ok(MessagesResponse {
        id,
        r#type: "message".to_string(),
        role: Role::Assistant,
        content,
        model: response.model,
        stop_reason,
        stop_sequence: None,
        usage,
    })
}

/// Map an upstream finish reason to an Anthropic stop reason.
///
/// Unrecognised reasons are reported as `end_turn` with a warning.
pub fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        other => {
            tracing::warn!("Unrecognized finish_reason '{}', reporting end_turn", other);
            StopReason::EndTurn
        }
    }
}

/// Parse tool call arguments (a JSON string) into a `tool_use` block.
/// An empty argument string means no arguments.
fn tool_use_block(tool_call: OpenAIToolCall) -> Result<ContentBlock, ConversionError> {
    let input = parse_arguments(&tool_call.id, &tool_call.function.arguments)?;
    Ok(ContentBlock::ToolUse {
        id: tool_call.id,
        name: tool_call.function.name,
        input,
    })
}

pub(crate) fn parse_arguments(id: &str, arguments: &str) -> Result<serde_json::Value, ConversionError> {
    if arguments.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(arguments).map_err(|source| ConversionError::MalformedToolArguments {
        id: id.to_string(),
        source,
    })
}

/// `data:<media_type>;base64,<data>` URIs become inline sources, anything else a URL source
fn parse_image_url(url: &str) -> ImageSource {
    url.strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
        .map(|(media_type, data)| ImageSource::Base64 {
            media_type: media_type.to_string(),
            data: data.to_string(),
        })
        .unwrap_or_else(|| ImageSource::Url { url: url.to_string() })
}
