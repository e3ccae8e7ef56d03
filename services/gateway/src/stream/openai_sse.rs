//! OpenAI SSE encoder
//!
//! Emits `data: <chunk-json>\n\n` lines carrying OpenAI chunk deltas,
//! closed by a usage chunk and `data: [DONE]`. A stream-level error still
//! terminates with `[DONE]` so clients never hang.

use std::collections::HashMap;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::openai::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, ToolCallChunk, ToolCallFunctionChunk,
};
use crate::stream::{StreamEvent, UsageCounters};

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Stateful encoder from normalized events to OpenAI SSE frames.
pub struct OpenAiSseEncoder {
    id: String,
    created: i64,
    model: String,
    sent_role: bool,
    tool_indices: HashMap<String, usize>,
    errored: bool,
}

impl OpenAiSseEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created: OffsetDateTime::now_utc().unix_timestamp(),
            model: model.to_string(),
            sent_role: false,
            tool_indices: HashMap::new(),
            errored: false,
        }
    }

    /// Encode one event into zero or more SSE frames.
    pub fn encode(&mut self, event: &StreamEvent) -> Vec<String> {
        if self.errored {
            return Vec::new();
        }
        match event {
            StreamEvent::TextDelta(text) => {
                let mut frames = self.role_preamble();
                frames.push(self.chunk(
                    ChunkDelta {
                        content: Some(text.clone()),
                        ..Default::default()
                    },
                    None,
                    None,
                ));
                frames
            }
            StreamEvent::ToolCallStart { id, name } => {
                let index = self.tool_indices.len();
                self.tool_indices.insert(id.clone(), index);
                let mut frames = self.role_preamble();
                frames.push(self.chunk(
                    ChunkDelta {
                        tool_calls: Some(vec![ToolCallChunk {
                            index,
                            id: Some(id.clone()),
                            kind: Some("function"),
                            function: Some(ToolCallFunctionChunk {
                                name: Some(name.clone()),
                                arguments: Some(String::new()),
                            }),
                        }]),
                        ..Default::default()
                    },
                    None,
                    None,
                ));
                frames
            }
            StreamEvent::ToolCallDelta { id, arguments } => {
                let Some(&index) = self.tool_indices.get(id) else {
                    return Vec::new();
                };
                vec![self.chunk(
                    ChunkDelta {
                        tool_calls: Some(vec![ToolCallChunk {
                            index,
                            id: None,
                            kind: None,
                            function: Some(ToolCallFunctionChunk {
                                name: None,
                                arguments: Some(arguments.clone()),
                            }),
                        }]),
                        ..Default::default()
                    },
                    None,
                    None,
                )]
            }
            StreamEvent::ToolCallEnd { .. } => Vec::new(),
            StreamEvent::Usage(_) => Vec::new(),
            StreamEvent::Stop { finish_reason } => {
                vec![self.chunk(ChunkDelta::default(), Some(finish_reason.clone()), None)]
            }
            StreamEvent::Error { .. } => {
                // Terminate cleanly; the error is reported via logs and the
                // stream's closing [DONE]
                self.errored = true;
                vec![DONE_FRAME.to_string()]
            }
        }
    }

    /// Final frames: the usage chunk and the `[DONE]` terminator.
    pub fn finish(&mut self, usage: &UsageCounters) -> Vec<String> {
        if self.errored {
            return Vec::new();
        }
        vec![
            self.chunk(ChunkDelta::default(), None, Some(usage.to_openai())),
            DONE_FRAME.to_string(),
        ]
    }

    fn role_preamble(&mut self) -> Vec<String> {
        if self.sent_role {
            return Vec::new();
        }
        self.sent_role = true;
        vec![self.chunk(
            ChunkDelta {
                role: Some("assistant"),
                ..Default::default()
            },
            None,
            None,
        )]
    }

    fn chunk(
        &self,
        delta: ChunkDelta,
        finish_reason: Option<String>,
        usage: Option<crate::openai::Usage>,
    ) -> String {
        let chunk = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        };
        // Serialization of a fully-owned chunk cannot fail
        let json = serde_json::to_string(&chunk).unwrap_or_default();
        format!("data: {json}\n\n")
    }
}
