//! Collected (non-streaming) response assembly
//!
//! Accumulates text, indexes tool calls by id, and folds usage frames into
//! a single OpenAI chat-completion object for the non-stream code path.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::openai::{
    ChatCompletionResponse, Choice, ResponseMessage, ToolCall, ToolCallFunction,
};
use crate::stream::{StreamEvent, UsageCounters};

/// Accumulator for the non-streaming code path.
#[derive(Debug, Default)]
pub struct Collector {
    text: String,
    tool_order: Vec<String>,
    tools: std::collections::HashMap<String, (String, String)>,
    finish_reason: Option<String>,
    error: Option<String>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta(text) => self.text.push_str(text),
            StreamEvent::ToolCallStart { id, name } => {
                self.tool_order.push(id.clone());
                self.tools
                    .insert(id.clone(), (name.clone(), String::new()));
            }
            StreamEvent::ToolCallDelta { id, arguments } => {
                if let Some((_, existing)) = self.tools.get_mut(id) {
                    existing.push_str(arguments);
                }
            }
            StreamEvent::ToolCallEnd { .. } | StreamEvent::Usage(_) => {}
            StreamEvent::Stop { finish_reason } => {
                self.finish_reason = Some(finish_reason.clone());
            }
            StreamEvent::Error { message } => {
                self.error = Some(message.clone());
            }
        }
    }

    /// Stream-level error observed mid-collection, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Build the final response object.
    pub fn into_response(self, model: &str, usage: &UsageCounters) -> ChatCompletionResponse {
        let tool_calls: Vec<ToolCall> = self
            .tool_order
            .iter()
            .filter_map(|id| {
                self.tools.get(id).map(|(name, arguments)| ToolCall {
                    id: id.clone(),
                    kind: "function".into(),
                    function: ToolCallFunction {
                        name: name.clone(),
                        arguments: if arguments.is_empty() {
                            "{}".to_string()
                        } else {
                            arguments.clone()
                        },
                    },
                })
            })
            .collect();

        let finish_reason = if !tool_calls.is_empty() {
            "tool_calls".to_string()
        } else {
            self.finish_reason.unwrap_or_else(|| "stop".to_string())
        };

        ChatCompletionResponse {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            object: "chat.completion".into(),
            created: OffsetDateTime::now_utc().unix_timestamp(),
            model: model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".into(),
                    content: if self.text.is_empty() {
                        None
                    } else {
                        Some(self.text)
                    },
                    tool_calls: if tool_calls.is_empty() {
                        None
                    } else {
                        Some(tool_calls)
                    },
                },
                finish_reason: Some(finish_reason),
            }],
            usage: usage.to_openai(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_text_and_finish_reason() {
        let mut collector = Collector::new();
        collector.observe(&StreamEvent::TextDelta("hello ".into()));
        collector.observe(&StreamEvent::TextDelta("world".into()));
        collector.observe(&StreamEvent::Stop {
            finish_reason: "stop".into(),
        });

        let response = collector.into_response(
            "m",
            &UsageCounters {
                prompt_tokens: 4,
                completion_tokens: 2,
                ..Default::default()
            },
        );
        let choice = &response.choices[0];
        assert_eq!(choice.message.content.as_deref(), Some("hello world"));
        assert_eq!(choice.finish_reason.as_deref(), Some("stop"));
        assert_eq!(response.usage.total_tokens, 6);
    }

    #[test]
    fn collects_tool_calls_in_arrival_order() {
        let mut collector = Collector::new();
        collector.observe(&StreamEvent::ToolCallStart {
            id: "t1".into(),
            name: "first".into(),
        });
        collector.observe(&StreamEvent::ToolCallDelta {
            id: "t1".into(),
            arguments: r#"{"a":1}"#.into(),
        });
        collector.observe(&StreamEvent::ToolCallEnd { id: "t1".into() });
        collector.observe(&StreamEvent::ToolCallStart {
            id: "t2".into(),
            name: "second".into(),
        });
        collector.observe(&StreamEvent::Stop {
            finish_reason: "tool_calls".into(),
        });

        let response = collector.into_response("m", &UsageCounters::default());
        let calls = response.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function.name, "first");
        assert_eq!(calls[0].function.arguments, r#"{"a":1}"#);
        // A tool call with no argument fragments still carries valid JSON
        assert_eq!(calls[1].function.arguments, "{}");
        assert_eq!(
            response.choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
    }

    #[test]
    fn tool_calls_force_tool_calls_finish_reason() {
        let mut collector = Collector::new();
        collector.observe(&StreamEvent::ToolCallStart {
            id: "t1".into(),
            name: "f".into(),
        });
        collector.observe(&StreamEvent::Stop {
            finish_reason: "stop".into(),
        });
        let response = collector.into_response("m", &UsageCounters::default());
        assert_eq!(
            response.choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
    }

    #[test]
    fn error_is_exposed() {
        let mut collector = Collector::new();
        collector.observe(&StreamEvent::Error {
            message: "boom".into(),
        });
        assert_eq!(collector.error(), Some("boom"));
    }
}
