//! Upstream stream handling
//!
//! The demuxer turns upstream binary frames into normalized
//! [`StreamEvent`]s; the encoders turn those into OpenAI SSE, Anthropic
//! SSE, or a collected response object.

pub mod anthropic_sse;
pub mod collect;
pub mod demux;
pub mod openai_sse;

use serde_json::Value;

/// Normalized upstream stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, arguments: String },
    ToolCallEnd { id: String },
    Usage(UsageCounters),
    Stop { finish_reason: String },
    Error { message: String },
}

/// Token counters in the gateway's internal spelling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounters {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_write_tokens: u64,
    pub cache_hit_tokens: u64,
    /// Set when the counters came from the tokenizer fallback rather than
    /// an upstream usage frame; billing may down-weight estimates.
    pub estimated: bool,
}

impl UsageCounters {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Fold another usage frame in (later frames carry cumulative counts,
    /// so larger values win).
    pub fn fold(&mut self, other: &UsageCounters) {
        self.prompt_tokens = self.prompt_tokens.max(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.max(other.completion_tokens);
        self.cache_write_tokens = self.cache_write_tokens.max(other.cache_write_tokens);
        self.cache_hit_tokens = self.cache_hit_tokens.max(other.cache_hit_tokens);
    }

    /// Read counters from a usage object in either the OpenAI or the
    /// Anthropic spelling.
    pub fn from_json(usage: &Value) -> Self {
        fn counter(usage: &Value, names: &[&str]) -> u64 {
            names
                .iter()
                .find_map(|name| usage.get(name).and_then(Value::as_u64))
                .unwrap_or(0)
        }

        Self {
            prompt_tokens: counter(usage, &["prompt_tokens", "input_tokens", "inputTokens"]),
            completion_tokens: counter(
                usage,
                &["completion_tokens", "output_tokens", "outputTokens"],
            ),
            cache_write_tokens: counter(
                usage,
                &[
                    "cache_write_tokens",
                    "cache_creation_input_tokens",
                    "cacheWriteInputTokens",
                ],
            ),
            cache_hit_tokens: counter(
                usage,
                &[
                    "cache_hit_tokens",
                    "cache_read_input_tokens",
                    "cacheReadInputTokens",
                ],
            ),
            estimated: false,
        }
    }

    pub fn to_openai(&self) -> crate::openai::Usage {
        crate::openai::Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens(),
            cache_creation_input_tokens: (self.cache_write_tokens > 0)
                .then_some(self.cache_write_tokens),
            cache_read_input_tokens: (self.cache_hit_tokens > 0).then_some(self.cache_hit_tokens),
        }
    }
}

/// Tracks usage across a stream and supplies the tokenizer fallback when
/// the upstream never reported any.
#[derive(Debug, Default)]
pub struct UsageTracker {
    reported: Option<UsageCounters>,
    emitted_text: String,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Usage(usage) => {
                self.reported.get_or_insert_with(UsageCounters::default).fold(usage);
            }
            StreamEvent::TextDelta(text) => self.emitted_text.push_str(text),
            _ => {}
        }
    }

    /// Final counters: upstream-reported if any frame arrived, otherwise
    /// an estimate from the request-side token count and the emitted text.
    pub fn finalize(&self, fallback_prompt_tokens: u64) -> UsageCounters {
        if let Some(reported) = self.reported {
            return reported;
        }
        UsageCounters {
            prompt_tokens: fallback_prompt_tokens,
            completion_tokens: crate::tokenizer::count_text(&self.emitted_text),
            cache_write_tokens: 0,
            cache_hit_tokens: 0,
            estimated: true,
        }
    }
}
