use super::ConversionError;
use crate::models::openai::{
    function_type, OpenAIContent, OpenAIContentPart, OpenAIFunctionCall, OpenAIFunctionDef, OpenAIImageUrl,
    OpenAIMessage, OpenAIRequest, OpenAIStreamOptions, OpenAITool, OpenAIToolCall,
};
use crate::models::{ContentBlock, ImageSource, Message, MessageContent, MessagesRequest, Role, Tool, ToolChoice};
use std::collections::HashSet;

/// Transform an Anthropic Messages request into an OpenAI Chat Completions request.
///
/// # Key Transformations
/// - `system` (string or block list) → leading `system` message
/// - `tool_use` blocks → `tool_calls` on the assistant message
/// - `tool_result` blocks → separate `tool` role messages, placed BEFORE the
///   rest of the user content of the same message
/// - `image` blocks → `image_url` parts (base64 becomes a data URI)
/// - unsupported blocks (thinking, documents) → dropped
///
/// The `model` field is copied verbatim; the router replaces it with the
/// provider's concrete model name.
pub fn to_upstream(request: &MessagesRequest) -> Result<OpenAIRequest, ConversionError> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(ref system) = request.system {
        let text = system.to_text();
        if !text.is_empty() {
            messages.push(OpenAIMessage::new("system", Some(OpenAIContent::String(text))));
        }
    }

    let mut seen_tool_ids = HashSet::new();
    for message in &request.messages {
        convert_message(message, &mut seen_tool_ids, &mut messages)?;
    }

    if request.top_k.is_some() {
        tracing::debug!("Dropping top_k: not supported by chat-completion upstreams");
    }

    let streaming = request.is_streaming();

    Ok(OpenAIRequest {
        model: request.model.clone(),
        messages,
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences.clone(),
        stream: request.stream,
        stream_options: streaming.then_some(OpenAIStreamOptions { include_usage: true }),
        tools: request.tools.as_ref().map(|tools| tools.iter().map(convert_tool).collect()),
        tool_choice: request.tool_choice.as_ref().map(convert_tool_choice),
    })
}

fn convert_message<'a>(
    message: &'a Message,
    seen_tool_ids: &mut HashSet<&'a str>,
    out: &mut Vec<OpenAIMessage>,
) -> Result<(), ConversionError> {
    let role = message.role.as_str();

    let blocks = match &message.content {
        MessageContent::Text(text) => {
            out.push(OpenAIMessage::new(role, Some(OpenAIContent::String(text.clone()))));
            return Ok(());
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut parts = Vec::new();
    let mut tool_calls = Vec::new();
    let mut tool_results = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => parts.push(OpenAIContentPart::Text { text: text.clone() }),
            ContentBlock::Image { source } => parts.push(OpenAIContentPart::ImageUrl {
                image_url: OpenAIImageUrl { url: image_url(source) },
            }),
            ContentBlock::ToolUse { id, name, input } => {
                if message.role != Role::Assistant {
                    return Err(ConversionError::MisplacedBlock { block: "tool_use", role });
                }
                let arguments = serde_json::to_string(input)
                    .map_err(|source| ConversionError::InputEncoding { id: id.clone(), source })?;
                seen_tool_ids.insert(id.as_str());
                tool_calls.push(OpenAIToolCall {
                    id: id.clone(),
                    r#type: function_type(),
                    function: OpenAIFunctionCall {
                        name: name.clone(),
                        arguments,
                    },
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                if message.role != Role::User {
                    return Err(ConversionError::MisplacedBlock { block: "tool_result", role });
                }
                if !seen_tool_ids.contains(tool_use_id.as_str()) {
                    return Err(ConversionError::UnknownToolUse(tool_use_id.clone()));
                }
                let mut text = content.to_text();
                if *is_error == Some(true) {
                    text = format!("Error: {}", text);
                }
                tool_results.push(OpenAIMessage {
                    role: "tool".to_string(),
                    content: Some(OpenAIContent::String(text)),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                });
            }
            ContentBlock::Unsupported => {
                tracing::debug!("Dropping unsupported content block in {} message", role);
            }
        }
    }

    // Tool outputs must directly follow the assistant turn that requested them.
    out.extend(tool_results);

    if !parts.is_empty() || !tool_calls.is_empty() {
        out.push(OpenAIMessage {
            role: role.to_string(),
            content: collapse_parts(parts),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        });
    }

    Ok(())
}

/// A lone text part is sent as a plain string for compatibility
fn collapse_parts(mut parts: Vec<OpenAIContentPart>) -> Option<OpenAIContent> {
    match parts.len() {
        0 => None,
        1 if matches!(parts[0], OpenAIContentPart::Text { .. }) => match parts.pop() {
            Some(OpenAIContentPart::Text { text }) => Some(OpenAIContent::String(text)),
            _ => None,
        },
        _ => Some(OpenAIContent::Parts(parts)),
    }
}

fn image_url(source: &ImageSource) -> String {
    match source {
        ImageSource::Base64 { media_type, data } => format!("data:{};base64,{}", media_type, data),
        ImageSource::Url { url } => url.clone(),
    }
}

fn convert_tool(tool: &Tool) -> OpenAITool {
    OpenAITool {
        r#type: function_type(),
        function: OpenAIFunctionDef {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        },
    }
}

fn convert_tool_choice(choice: &ToolChoice) -> serde_json::Value {
    match choice {
        ToolChoice::Auto => serde_json::json!("auto"),
        ToolChoice::Any => serde_json::json!("required"),
        ToolChoice::None => serde_json::json!("none"),
        ToolChoice::Tool { name } => serde_json::json!({
            "type": "function",
            "function": { "name": name }
        }),
    }
}
