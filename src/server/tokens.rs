use crate::models::{ContentBlock, CountTokensRequest, MessageContent};
use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

static ENCODER: Lazy<Option<CoreBPE>> = Lazy::new(|| match tiktoken_rs::cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        tracing::warn!("cl100k_base unavailable, estimating tokens from length: {}", e);
        None
    }
});

/// Per-message framing overhead, as counted for chat-format prompts
const TOKENS_PER_MESSAGE: u32 = 3;

fn count_text(text: &str) -> u32 {
    match ENCODER.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u32,
        None => (text.chars().count() as u32).div_ceil(4),
    }
}

fn block_text(block: &ContentBlock) -> Option<String> {
    match block {
        ContentBlock::Text { text } => Some(text.clone()),
        ContentBlock::ToolUse { name, input, .. } => Some(format!("{} {}", name, input)),
        ContentBlock::ToolResult { content, .. } => Some(content.to_text()),
        ContentBlock::Image { .. } | ContentBlock::Unsupported => None,
    }
}

/// Local estimate of the prompt size of a request
pub fn estimate_input_tokens(request: &CountTokensRequest) -> u32 {
    let mut total = 0;

    if let Some(system) = &request.system {
        total += count_text(&system.to_text());
    }

    for message in &request.messages {
        total += TOKENS_PER_MESSAGE;
        match &message.content {
            MessageContent::Text(text) => total += count_text(text),
            MessageContent::Blocks(blocks) => {
                for text in blocks.iter().filter_map(block_text) {
                    total += count_text(&text);
                }
            }
        }
    }

    for tool in request.tools.iter().flatten() {
        total += count_text(&tool.name);
        if let Some(description) = &tool.description {
            total += count_text(description);
        }
        if let Some(schema) = &tool.input_schema {
            total += count_text(&schema.to_string());
        }
    }

    total
}
