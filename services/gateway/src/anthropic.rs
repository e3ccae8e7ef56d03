//! Anthropic messages dialect types
//!
//! Tolerant by design: content and tool_choice arrive as loosely-typed
//! values because clients send both string and block-list forms, and
//! unknown fields are ignored rather than rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateMessageRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<MessageParam>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub system: Option<Value>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub tools: Option<Vec<AnthropicTool>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageParam {
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CountTokensRequest {
    #[allow(dead_code)]
    pub model: String,
    pub messages: Vec<MessageParam>,
    #[serde(default)]
    pub system: Option<Value>,
    #[serde(default)]
    pub tools: Option<Vec<AnthropicTool>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequestItem {
    pub custom_id: String,
    pub params: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBatchRequest {
    pub requests: Vec<BatchRequestItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_accepts_string_system() {
        let request: CreateMessageRequest = serde_json::from_str(
            r#"{"model":"m","max_tokens":100,"system":"be brief","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();
        assert_eq!(request.system.as_ref().unwrap(), "be brief");
    }

    #[test]
    fn request_accepts_block_content_and_ignores_unknown_fields() {
        let request: CreateMessageRequest = serde_json::from_str(
            r#"{
                "model": "m",
                "max_tokens": 100,
                "metadata": {"user_id": "u1"},
                "messages": [
                    {"role": "user", "content": [{"type": "text", "text": "hi"}]}
                ]
            }"#,
        )
        .unwrap();
        assert!(request.messages[0].content.is_array());
    }

    #[test]
    fn tool_choice_keeps_both_forms() {
        let any: CreateMessageRequest = serde_json::from_str(
            r#"{"model":"m","max_tokens":1,"tool_choice":"any","messages":[{"role":"user","content":"x"}]}"#,
        )
        .unwrap();
        assert_eq!(any.tool_choice.as_ref().unwrap(), "any");

        let named: CreateMessageRequest = serde_json::from_str(
            r#"{"model":"m","max_tokens":1,"tool_choice":{"type":"tool","name":"f"},"messages":[{"role":"user","content":"x"}]}"#,
        )
        .unwrap();
        assert_eq!(named.tool_choice.as_ref().unwrap()["name"], "f");
    }
}
