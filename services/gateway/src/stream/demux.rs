//! Upstream frame demuxer
//!
//! The upstream speaks AWS binary event-stream framing: a 12-byte prelude
//! (total length, headers length, prelude CRC32), a header block of
//! name/type/value triples, a JSON payload, and a trailing message CRC32.
//! The demuxer is an incremental push-parser: feed it byte chunks as they
//! arrive, collect normalized [`StreamEvent`]s.
//!
//! Event types carried by the `:event-type` header:
//! - `assistantResponseEvent` — `{"content": "..."}` text delta
//! - `toolUseEvent` — `{"toolUseId", "name", "input", "stop"}` tool-call
//!   fragments; `stop: true` closes the call
//! - `messageMetadataEvent` — usage counters
//! - anything with `:message-type: exception` — stream-level error

use std::collections::HashMap;
use std::collections::HashSet;

use bytes::{Buf, BytesMut};
use crc::{CRC_32_ISO_HDLC, Crc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::stream::{StreamEvent, UsageCounters};

const PRELUDE_LEN: usize = 12;
/// Upper bound on a single frame; anything larger is a corrupt stream.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Incremental decoder from upstream bytes to normalized events.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    /// Tool calls currently open, by toolUseId
    open_tools: HashSet<String>,
    /// Tool calls that already emitted their start event
    started_tools: HashSet<String>,
    saw_tool_calls: bool,
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of upstream bytes, returning every event completed by
    /// it. After a framing error the decoder stays poisoned and yields
    /// nothing further.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if self.poisoned {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        loop {
            match self.try_frame() {
                Ok(Some(frame_events)) => events.extend(frame_events),
                Ok(None) => break,
                Err(message) => {
                    warn!(%message, "upstream frame decode failed");
                    self.poisoned = true;
                    events.push(StreamEvent::Error { message });
                    break;
                }
            }
        }
        events
    }

    /// Close the stream: open tool calls are ended and a stop event is
    /// synthesized since the upstream signals completion by closing.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.poisoned {
            return Vec::new();
        }
        let mut events = Vec::new();
        for id in std::mem::take(&mut self.open_tools) {
            events.push(StreamEvent::ToolCallEnd { id });
        }
        let finish_reason = if self.saw_tool_calls {
            "tool_calls"
        } else {
            "stop"
        };
        events.push(StreamEvent::Stop {
            finish_reason: finish_reason.to_string(),
        });
        events
    }

    fn try_frame(&mut self) -> Result<Option<Vec<StreamEvent>>, String> {
        if self.buffer.len() < PRELUDE_LEN {
            return Ok(None);
        }

        let total_len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        let headers_len = u32::from_be_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ]) as usize;
        let prelude_crc = u32::from_be_bytes([
            self.buffer[8],
            self.buffer[9],
            self.buffer[10],
            self.buffer[11],
        ]);

        if total_len > MAX_FRAME_LEN {
            return Err(format!("frame length {total_len} exceeds limit"));
        }
        if total_len < PRELUDE_LEN + 4 || headers_len > total_len - PRELUDE_LEN - 4 {
            return Err("inconsistent frame lengths".to_string());
        }
        if CRC32.checksum(&self.buffer[0..8]) != prelude_crc {
            return Err("prelude checksum mismatch".to_string());
        }
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(total_len);
        frame.advance(PRELUDE_LEN);
        let headers_bytes = frame.split_to(headers_len);
        // Remaining: payload + 4-byte message CRC
        let payload_len = frame.len() - 4;
        let payload = &frame[..payload_len];

        let headers = parse_headers(&headers_bytes)?;
        Ok(Some(self.frame_events(&headers, payload)?))
    }

    fn frame_events(
        &mut self,
        headers: &HashMap<String, String>,
        payload: &[u8],
    ) -> Result<Vec<StreamEvent>, String> {
        let message_type = headers.get(":message-type").map(String::as_str);
        let event_type = headers.get(":event-type").map(String::as_str);

        let body: Value = if payload.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(payload)
                .map_err(|e| format!("frame payload is not JSON: {e}"))?
        };

        if matches!(message_type, Some("exception") | Some("error")) {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("upstream exception")
                .to_string();
            let kind = headers
                .get(":exception-type")
                .cloned()
                .unwrap_or_else(|| "exception".to_string());
            return Ok(vec![StreamEvent::Error {
                message: format!("{kind}: {message}"),
            }]);
        }

        match event_type {
            Some("assistantResponseEvent") => {
                let text = body
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if text.is_empty() {
                    Ok(Vec::new())
                } else {
                    Ok(vec![StreamEvent::TextDelta(text.to_string())])
                }
            }
            Some("toolUseEvent") => Ok(self.tool_use_events(&body)),
            Some("messageMetadataEvent") => {
                let usage_value = body.get("usage").unwrap_or(&body);
                let usage = UsageCounters::from_json(usage_value);
                if usage == UsageCounters::default() {
                    Ok(Vec::new())
                } else {
                    Ok(vec![StreamEvent::Usage(usage)])
                }
            }
            other => {
                debug!(event_type = ?other, "ignoring unrecognized upstream event");
                Ok(Vec::new())
            }
        }
    }

    fn tool_use_events(&mut self, body: &Value) -> Vec<StreamEvent> {
        let id = body
            .get("toolUseId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if id.is_empty() {
            return Vec::new();
        }

        let mut events = Vec::new();
        self.saw_tool_calls = true;

        if self.started_tools.insert(id.clone()) {
            let name = body
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            self.open_tools.insert(id.clone());
            events.push(StreamEvent::ToolCallStart {
                id: id.clone(),
                name,
            });
        }

        // `input` arrives as string fragments to be concatenated
        let arguments = match body.get("input") {
            Some(Value::String(fragment)) => fragment.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        if !arguments.is_empty() {
            events.push(StreamEvent::ToolCallDelta {
                id: id.clone(),
                arguments,
            });
        }

        if body.get("stop").and_then(Value::as_bool) == Some(true) {
            self.open_tools.remove(&id);
            events.push(StreamEvent::ToolCallEnd { id });
        }

        events
    }
}

fn parse_headers(bytes: &[u8]) -> Result<HashMap<String, String>, String> {
    let mut headers = HashMap::new();
    let mut cursor = 0usize;

    while cursor < bytes.len() {
        let name_len = bytes[cursor] as usize;
        cursor += 1;
        if cursor + name_len > bytes.len() {
            return Err("truncated header name".to_string());
        }
        let name = String::from_utf8_lossy(&bytes[cursor..cursor + name_len]).to_string();
        cursor += name_len;

        if cursor >= bytes.len() {
            return Err("truncated header type".to_string());
        }
        let value_type = bytes[cursor];
        cursor += 1;

        // Only string-typed headers (type 7) appear in this stream
        if value_type != 7 {
            return Err(format!("unsupported header value type {value_type}"));
        }
        if cursor + 2 > bytes.len() {
            return Err("truncated header value length".to_string());
        }
        let value_len = u16::from_be_bytes([bytes[cursor], bytes[cursor + 1]]) as usize;
        cursor += 2;
        if cursor + value_len > bytes.len() {
            return Err("truncated header value".to_string());
        }
        let value = String::from_utf8_lossy(&bytes[cursor..cursor + value_len]).to_string();
        cursor += value_len;

        headers.insert(name, value);
    }

    Ok(headers)
}

#[cfg(test)]
pub(crate) fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut header_bytes = Vec::new();
    for (name, value) in headers {
        header_bytes.push(name.len() as u8);
        header_bytes.extend_from_slice(name.as_bytes());
        header_bytes.push(7u8);
        header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        header_bytes.extend_from_slice(value.as_bytes());
    }

    let total_len = (PRELUDE_LEN + header_bytes.len() + payload.len() + 4) as u32;
    let mut frame = Vec::new();
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&CRC32.checksum(&frame[0..8]).to_be_bytes());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(payload);
    let message_crc = CRC32.checksum(&frame);
    frame.extend_from_slice(&message_crc.to_be_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_frame(event_type: &str, payload: &str) -> Vec<u8> {
        encode_frame(
            &[(":message-type", "event"), (":event-type", event_type)],
            payload.as_bytes(),
        )
    }

    #[test]
    fn decodes_text_delta() {
        let mut decoder = FrameDecoder::new();
        let frame = event_frame("assistantResponseEvent", r#"{"content":"hello"}"#);
        let events = decoder.push(&frame);
        assert_eq!(events, vec![StreamEvent::TextDelta("hello".into())]);
    }

    #[test]
    fn decodes_frame_split_across_chunks() {
        let mut decoder = FrameDecoder::new();
        let frame = event_frame("assistantResponseEvent", r#"{"content":"split"}"#);
        let (first, second) = frame.split_at(7);
        assert!(decoder.push(first).is_empty());
        let events = decoder.push(second);
        assert_eq!(events, vec![StreamEvent::TextDelta("split".into())]);
    }

    #[test]
    fn decodes_multiple_frames_in_one_chunk() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = event_frame("assistantResponseEvent", r#"{"content":"a"}"#);
        bytes.extend(event_frame("assistantResponseEvent", r#"{"content":"b"}"#));
        let events = decoder.push(&bytes);
        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("a".into()),
                StreamEvent::TextDelta("b".into()),
            ]
        );
    }

    #[test]
    fn tool_use_start_delta_end() {
        let mut decoder = FrameDecoder::new();
        let mut events = decoder.push(&event_frame(
            "toolUseEvent",
            r#"{"toolUseId":"t1","name":"get_weather","input":"{\"ci"}"#,
        ));
        events.extend(decoder.push(&event_frame(
            "toolUseEvent",
            r#"{"toolUseId":"t1","input":"ty\":\"Oslo\"}","stop":true}"#,
        )));

        assert_eq!(
            events,
            vec![
                StreamEvent::ToolCallStart {
                    id: "t1".into(),
                    name: "get_weather".into()
                },
                StreamEvent::ToolCallDelta {
                    id: "t1".into(),
                    arguments: "{\"ci".into()
                },
                StreamEvent::ToolCallDelta {
                    id: "t1".into(),
                    arguments: "ty\":\"Oslo\"}".into()
                },
                StreamEvent::ToolCallEnd { id: "t1".into() },
            ]
        );
    }

    #[test]
    fn metadata_event_yields_usage() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(&event_frame(
            "messageMetadataEvent",
            r#"{"usage":{"inputTokens":120,"outputTokens":40,"cacheReadInputTokens":10}}"#,
        ));
        assert_eq!(
            events,
            vec![StreamEvent::Usage(UsageCounters {
                prompt_tokens: 120,
                completion_tokens: 40,
                cache_write_tokens: 0,
                cache_hit_tokens: 10,
                estimated: false,
            })]
        );
    }

    #[test]
    fn exception_frame_yields_error() {
        let mut decoder = FrameDecoder::new();
        let frame = encode_frame(
            &[
                (":message-type", "exception"),
                (":exception-type", "ThrottlingException"),
            ],
            br#"{"message":"slow down"}"#,
        );
        let events = decoder.push(&frame);
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                message: "ThrottlingException: slow down".into()
            }]
        );
    }

    #[test]
    fn corrupt_prelude_poisons_decoder() {
        let mut decoder = FrameDecoder::new();
        let mut frame = event_frame("assistantResponseEvent", r#"{"content":"x"}"#);
        frame[8] ^= 0xff;
        let events = decoder.push(&frame);
        assert!(matches!(events[0], StreamEvent::Error { .. }));
        // Poisoned: further input yields nothing
        let more = event_frame("assistantResponseEvent", r#"{"content":"y"}"#);
        assert!(decoder.push(&more).is_empty());
    }

    #[test]
    fn finish_without_tools_stops_normally() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&event_frame("assistantResponseEvent", r#"{"content":"x"}"#));
        assert_eq!(
            decoder.finish(),
            vec![StreamEvent::Stop {
                finish_reason: "stop".into()
            }]
        );
    }

    #[test]
    fn finish_after_tools_reports_tool_calls() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&event_frame(
            "toolUseEvent",
            r#"{"toolUseId":"t1","name":"f","input":"{}","stop":true}"#,
        ));
        assert_eq!(
            decoder.finish(),
            vec![StreamEvent::Stop {
                finish_reason: "tool_calls".into()
            }]
        );
    }

    #[test]
    fn finish_closes_dangling_tool_calls() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&event_frame(
            "toolUseEvent",
            r#"{"toolUseId":"t1","name":"f","input":"{}"}"#,
        ));
        let events = decoder.finish();
        assert!(events.contains(&StreamEvent::ToolCallEnd { id: "t1".into() }));
        assert!(matches!(events.last(), Some(StreamEvent::Stop { .. })));
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(&event_frame("followupPromptEvent", r#"{"x":1}"#));
        assert!(events.is_empty());
    }
}
