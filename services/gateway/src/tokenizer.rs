//! Approximate token counting
//!
//! Uses the cl100k_base encoding, which lands close enough to the
//! upstream's tokenizer for usage fallback and preflight estimation. The
//! exact upstream tokenizer is not public, so a correction factor of 1.15
//! (empirical: roughly 15% more tokens than cl100k_base on the same text)
//! is applied to totals. A characters/4 estimate covers encoder failure.

use std::sync::OnceLock;

use serde_json::Value;
use tiktoken_rs::CoreBPE;
use tracing::warn;

use crate::anthropic::{AnthropicTool, MessageParam};
use crate::openai::{ChatMessage, Tool};
use crate::translate::content_to_text;

/// Correction applied to totals: counts run ~15% above cl100k_base.
const CORRECTION_NUMERATOR: u64 = 115;
const CORRECTION_DENOMINATOR: u64 = 100;

/// Per-message structural overhead (role markers, delimiters).
const MESSAGE_OVERHEAD: u64 = 4;
/// Trailing service tokens per request.
const REQUEST_OVERHEAD: u64 = 3;
/// Flat estimate per image block.
const IMAGE_TOKENS: u64 = 100;

static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn encoder() -> Option<&'static CoreBPE> {
    ENCODER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                warn!(error = %e, "cl100k_base unavailable, using length estimate");
                None
            }
        })
        .as_ref()
}

fn apply_correction(tokens: u64) -> u64 {
    tokens * CORRECTION_NUMERATOR / CORRECTION_DENOMINATOR
}

/// Raw token count for a text, without the correction factor.
fn count_raw(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    match encoder() {
        Some(bpe) => bpe.encode_ordinary(text).len() as u64,
        None => text.len() as u64 / 4 + 1,
    }
}

/// Corrected token count for a standalone text.
pub fn count_text(text: &str) -> u64 {
    apply_correction(count_raw(text))
}

/// Token estimate breakdown for one request.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenEstimate {
    pub messages_tokens: u64,
    pub tools_tokens: u64,
    pub system_tokens: u64,
}

impl TokenEstimate {
    pub fn total(&self) -> u64 {
        self.messages_tokens + self.tools_tokens + self.system_tokens
    }
}

/// Corrected count over OpenAI-shaped messages.
pub fn count_openai_messages(messages: &[ChatMessage]) -> u64 {
    if messages.is_empty() {
        return 0;
    }

    let mut tokens = 0u64;
    for message in messages {
        tokens += MESSAGE_OVERHEAD;
        tokens += count_raw(&message.role);
        if let Some(content) = &message.content {
            tokens += count_content_value(content);
        }
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                tokens += MESSAGE_OVERHEAD;
                tokens += count_raw(&call.function.name);
                tokens += count_raw(&call.function.arguments);
            }
        }
        if let Some(id) = &message.tool_call_id {
            tokens += count_raw(id);
        }
    }
    tokens += REQUEST_OVERHEAD;
    apply_correction(tokens)
}

/// Corrected count over OpenAI-shaped tool definitions.
pub fn count_openai_tools(tools: Option<&[Tool]>) -> u64 {
    let Some(tools) = tools else { return 0 };
    if tools.is_empty() {
        return 0;
    }

    let mut tokens = 0u64;
    for tool in tools {
        tokens += MESSAGE_OVERHEAD;
        tokens += count_raw(&tool.function.name);
        if let Some(description) = &tool.function.description {
            tokens += count_raw(description);
        }
        if !tool.function.parameters.is_null() {
            tokens += count_raw(&tool.function.parameters.to_string());
        }
    }
    apply_correction(tokens)
}

/// Full estimate for an OpenAI-shaped request.
pub fn estimate_openai_request(messages: &[ChatMessage], tools: Option<&[Tool]>) -> TokenEstimate {
    TokenEstimate {
        messages_tokens: count_openai_messages(messages),
        tools_tokens: count_openai_tools(tools),
        system_tokens: 0,
    }
}

fn count_content_value(content: &Value) -> u64 {
    match content {
        Value::String(text) => count_raw(text),
        Value::Array(items) => items.iter().map(count_block).sum(),
        other => count_raw(&content_to_text(other)),
    }
}

/// One Anthropic content block, uncorrected.
fn count_block(block: &Value) -> u64 {
    let Some(kind) = block.get("type").and_then(Value::as_str) else {
        return count_raw(&content_to_text(block));
    };
    match kind {
        "text" => count_raw(block.get("text").and_then(Value::as_str).unwrap_or_default()),
        "thinking" => count_raw(
            block
                .get("thinking")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        ),
        "image" | "image_url" => IMAGE_TOKENS,
        "tool_use" => {
            let mut tokens = MESSAGE_OVERHEAD;
            tokens += count_raw(block.get("name").and_then(Value::as_str).unwrap_or_default());
            if let Some(input) = block.get("input") {
                let rendered = match input {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                tokens += count_raw(&rendered);
            }
            tokens
        }
        "tool_result" => {
            let mut tokens = MESSAGE_OVERHEAD;
            tokens += count_raw(
                block
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            );
            match block.get("content") {
                Some(Value::String(text)) => tokens += count_raw(text),
                Some(Value::Array(nested)) => tokens += nested.iter().map(count_block).sum::<u64>(),
                _ => {}
            }
            tokens
        }
        _ => count_raw(&content_to_text(block)),
    }
}

/// Corrected count over Anthropic-shaped messages. Thinking blocks in
/// assistant messages belong to previous turns and are not billed as
/// input, so they are skipped.
pub fn count_anthropic_messages(messages: &[MessageParam]) -> u64 {
    if messages.is_empty() {
        return 0;
    }

    let mut tokens = 0u64;
    for message in messages {
        tokens += MESSAGE_OVERHEAD;
        tokens += count_raw(&message.role);
        match &message.content {
            Value::String(text) => tokens += count_raw(text),
            Value::Array(blocks) => {
                for block in blocks {
                    if message.role == "assistant"
                        && block.get("type").and_then(Value::as_str) == Some("thinking")
                    {
                        continue;
                    }
                    tokens += count_block(block);
                }
            }
            _ => {}
        }
    }
    tokens += REQUEST_OVERHEAD;
    apply_correction(tokens)
}

/// Corrected count over Anthropic-shaped tool definitions.
pub fn count_anthropic_tools(tools: Option<&[AnthropicTool]>) -> u64 {
    let Some(tools) = tools else { return 0 };
    if tools.is_empty() {
        return 0;
    }

    let mut tokens = 0u64;
    for tool in tools {
        tokens += MESSAGE_OVERHEAD;
        tokens += count_raw(&tool.name);
        if let Some(description) = &tool.description {
            tokens += count_raw(description);
        }
        if !tool.input_schema.is_null() {
            tokens += count_raw(&tool.input_schema.to_string());
        }
    }
    apply_correction(tokens)
}

/// Corrected count for an Anthropic system prompt (string or block list).
pub fn count_anthropic_system(system: Option<&Value>) -> u64 {
    let Some(system) = system else { return 0 };
    match system {
        Value::Null => 0,
        Value::String(text) => count_text(text),
        Value::Array(blocks) => {
            let raw: u64 = blocks
                .iter()
                .map(|block| {
                    count_raw(block.get("text").and_then(Value::as_str).unwrap_or_default())
                })
                .sum();
            apply_correction(raw)
        }
        other => count_text(&content_to_text(other)),
    }
}

/// Full estimate for an Anthropic-shaped request, matching the
/// count_tokens endpoint's notion of input tokens.
pub fn estimate_anthropic_request(
    messages: &[MessageParam],
    tools: Option<&[AnthropicTool]>,
    system: Option<&Value>,
) -> TokenEstimate {
    TokenEstimate {
        messages_tokens: count_anthropic_messages(messages),
        tools_tokens: count_anthropic_tools(tools),
        system_tokens: count_anthropic_system(system),
    }
}
