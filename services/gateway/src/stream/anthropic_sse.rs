//! Anthropic SSE encoder
//!
//! Emits typed events in the order clients require: one `message_start`,
//! a text block at index 0, tool_use blocks with fully-parsed input after
//! the text block closes, then `message_delta` with stop reason and usage,
//! then `message_stop`. Mid-stream failures emit `event: error` followed
//! by `message_stop` so clients never hang.

use std::collections::HashMap;

use serde_json::{Value, json};
use uuid::Uuid;

use crate::stream::{StreamEvent, UsageCounters};
use crate::translate::{finish_reason_to_stop_reason, safe_json_loads};

/// Stateful encoder from normalized events to Anthropic SSE frames.
pub struct AnthropicSseEncoder {
    model: String,
    message_id: String,
    started: bool,
    text_block_open: bool,
    block_index: usize,
    /// Argument fragments per open tool call
    pending_tools: HashMap<String, PendingTool>,
    /// Tool ids in arrival order
    tool_order: Vec<String>,
    saw_tool_calls: bool,
    finish_reason: Option<String>,
    closed: bool,
}

struct PendingTool {
    name: String,
    arguments: String,
}

fn sse_event(event: &str, data: &Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

impl AnthropicSseEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            started: false,
            text_block_open: false,
            block_index: 0,
            pending_tools: HashMap::new(),
            tool_order: Vec::new(),
            saw_tool_calls: false,
            finish_reason: None,
            closed: false,
        }
    }

    /// Opening frames: `message_start` plus the index-0 text block.
    pub fn start(&mut self) -> Vec<String> {
        self.started = true;
        self.text_block_open = true;
        vec![
            sse_event(
                "message_start",
                &json!({
                    "type": "message_start",
                    "message": {
                        "id": self.message_id,
                        "type": "message",
                        "role": "assistant",
                        "model": self.model,
                        "content": [],
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": {"input_tokens": 0, "output_tokens": 0},
                    },
                }),
            ),
            sse_event(
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": 0,
                    "content_block": {"type": "text", "text": ""},
                }),
            ),
        ]
    }

    pub fn encode(&mut self, event: &StreamEvent) -> Vec<String> {
        if self.closed {
            return Vec::new();
        }
        match event {
            StreamEvent::TextDelta(text) => {
                if !self.text_block_open {
                    // Text after tool blocks has nowhere to go in this
                    // encoding; drop it rather than corrupt block order
                    return Vec::new();
                }
                vec![sse_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": 0,
                        "delta": {"type": "text_delta", "text": text},
                    }),
                )]
            }
            StreamEvent::ToolCallStart { id, name } => {
                self.saw_tool_calls = true;
                self.tool_order.push(id.clone());
                self.pending_tools.insert(
                    id.clone(),
                    PendingTool {
                        name: name.clone(),
                        arguments: String::new(),
                    },
                );
                Vec::new()
            }
            StreamEvent::ToolCallDelta { id, arguments } => {
                if let Some(pending) = self.pending_tools.get_mut(id) {
                    pending.arguments.push_str(arguments);
                }
                Vec::new()
            }
            // The block is emitted whole once its input is complete
            StreamEvent::ToolCallEnd { id } => self.emit_tool_block(id),
            StreamEvent::Usage(_) => Vec::new(),
            StreamEvent::Stop { finish_reason } => {
                self.finish_reason = Some(finish_reason.clone());
                Vec::new()
            }
            StreamEvent::Error { message } => {
                self.closed = true;
                vec![
                    sse_event(
                        "error",
                        &json!({
                            "type": "error",
                            "error": {"type": "internal_error", "message": message},
                        }),
                    ),
                    sse_event("message_stop", &json!({"type": "message_stop"})),
                ]
            }
        }
    }

    /// Closing frames: any tool calls never explicitly ended, the final
    /// `message_delta` with stop reason and usage, then `message_stop`.
    pub fn finish(&mut self, usage: &UsageCounters) -> Vec<String> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;

        let mut frames = Vec::new();
        for id in self.tool_order.clone() {
            frames.extend(self.emit_tool_block(&id));
        }
        if self.text_block_open {
            self.text_block_open = false;
            frames.push(sse_event(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": 0}),
            ));
        }

        let stop_reason =
            finish_reason_to_stop_reason(self.finish_reason.as_deref(), self.saw_tool_calls);
        frames.push(sse_event(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {
                    "input_tokens": usage.prompt_tokens,
                    "output_tokens": usage.completion_tokens,
                },
            }),
        ));
        frames.push(sse_event("message_stop", &json!({"type": "message_stop"})));
        frames
    }

    fn emit_tool_block(&mut self, id: &str) -> Vec<String> {
        let Some(pending) = self.pending_tools.remove(id) else {
            return Vec::new();
        };

        let mut frames = Vec::new();
        if self.text_block_open {
            self.text_block_open = false;
            frames.push(sse_event(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": 0}),
            ));
        }

        self.block_index += 1;
        let input = if pending.arguments.is_empty() {
            json!({})
        } else {
            safe_json_loads(&pending.arguments)
        };
        frames.push(sse_event(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": {
                    "type": "tool_use",
                    "id": id,
                    "name": pending.name,
                    "input": input,
                },
            }),
        ));
        frames.push(sse_event(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": self.block_index}),
        ));
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_types(frames: &[String]) -> Vec<String> {
        frames
            .iter()
            .map(|f| {
                f.lines()
                    .next()
                    .unwrap()
                    .strip_prefix("event: ")
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    fn data_json(frame: &str) -> Value {
        let data_line = frame.lines().nth(1).unwrap();
        serde_json::from_str(data_line.strip_prefix("data: ").unwrap()).unwrap()
    }

    fn run(events: Vec<StreamEvent>, usage: UsageCounters) -> Vec<String> {
        let mut encoder = AnthropicSseEncoder::new("m");
        let mut frames = encoder.start();
        for event in &events {
            frames.extend(encoder.encode(event));
        }
        frames.extend(encoder.finish(&usage));
        frames
    }

    #[test]
    fn text_only_stream_has_canonical_order() {
        let frames = run(
            vec![
                StreamEvent::TextDelta("hel".into()),
                StreamEvent::TextDelta("lo".into()),
                StreamEvent::Stop {
                    finish_reason: "stop".into(),
                },
            ],
            UsageCounters {
                prompt_tokens: 9,
                completion_tokens: 2,
                ..Default::default()
            },
        );

        assert_eq!(
            event_types(&frames),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        let delta = data_json(&frames[5]);
        assert_eq!(delta["delta"]["stop_reason"], "end_turn");
        assert_eq!(delta["usage"]["input_tokens"], 9);
    }

    #[test]
    fn tool_call_closes_text_block_first() {
        let frames = run(
            vec![
                StreamEvent::TextDelta("thinking".into()),
                StreamEvent::ToolCallStart {
                    id: "t1".into(),
                    name: "get_weather".into(),
                },
                StreamEvent::ToolCallDelta {
                    id: "t1".into(),
                    arguments: r#"{"city":"#.into(),
                },
                StreamEvent::ToolCallDelta {
                    id: "t1".into(),
                    arguments: r#""Oslo"}"#.into(),
                },
                StreamEvent::ToolCallEnd { id: "t1".into() },
                StreamEvent::Stop {
                    finish_reason: "tool_calls".into(),
                },
            ],
            UsageCounters::default(),
        );

        assert_eq!(
            event_types(&frames),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        let tool_block = data_json(&frames[4]);
        assert_eq!(tool_block["index"], 1);
        assert_eq!(tool_block["content_block"]["type"], "tool_use");
        assert_eq!(tool_block["content_block"]["name"], "get_weather");
        // Arguments are fully parsed, not a raw string
        assert_eq!(tool_block["content_block"]["input"]["city"], "Oslo");
        assert_eq!(data_json(&frames[6])["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn multiple_tools_get_increasing_indices() {
        let frames = run(
            vec![
                StreamEvent::ToolCallStart {
                    id: "t1".into(),
                    name: "a".into(),
                },
                StreamEvent::ToolCallEnd { id: "t1".into() },
                StreamEvent::ToolCallStart {
                    id: "t2".into(),
                    name: "b".into(),
                },
                StreamEvent::ToolCallEnd { id: "t2".into() },
                StreamEvent::Stop {
                    finish_reason: "tool_calls".into(),
                },
            ],
            UsageCounters::default(),
        );

        let indices: Vec<u64> = frames
            .iter()
            .filter(|f| f.starts_with("event: content_block_start"))
            .map(|f| data_json(f)["index"].as_u64().unwrap())
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn every_open_block_is_closed() {
        let frames = run(
            vec![
                StreamEvent::TextDelta("x".into()),
                StreamEvent::ToolCallStart {
                    id: "t1".into(),
                    name: "f".into(),
                },
                // No explicit end; finish must still close it
                StreamEvent::Stop {
                    finish_reason: "stop".into(),
                },
            ],
            UsageCounters::default(),
        );
        let types = event_types(&frames);
        let starts = types.iter().filter(|t| *t == "content_block_start").count();
        let stops = types.iter().filter(|t| *t == "content_block_stop").count();
        assert_eq!(starts, stops);
        assert_eq!(types.first().map(String::as_str), Some("message_start"));
        assert_eq!(types.last().map(String::as_str), Some("message_stop"));
    }

    #[test]
    fn error_emits_error_then_message_stop() {
        let mut encoder = AnthropicSseEncoder::new("m");
        encoder.start();
        let frames = encoder.encode(&StreamEvent::Error {
            message: "upstream died".into(),
        });
        assert_eq!(event_types(&frames), vec!["error", "message_stop"]);
        // Closed: finish adds nothing
        assert!(encoder.finish(&UsageCounters::default()).is_empty());
    }
}
