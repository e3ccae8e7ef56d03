//! Request translation
//!
//! Two translations happen per request. Anthropic-shaped requests are first
//! lifted into the OpenAI intermediate form (system lifting, tool_result
//! splitting, tool_choice mapping). The intermediate form is then compiled
//! into the upstream `conversationState` payload.

use serde_json::{Map, Value, json};

use crate::anthropic::CreateMessageRequest;
use crate::openai::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Tool, ToolFunction,
};

/// Translation failure; surfaces as a 400 without contacting upstream.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TranslateError(pub String);

/// Lift an Anthropic messages request into the OpenAI intermediate form.
pub fn anthropic_to_openai(request: &CreateMessageRequest) -> ChatCompletionRequest {
    let mut messages = Vec::new();

    let system_text = content_to_text(request.system.as_ref().unwrap_or(&Value::Null));
    if !system_text.is_empty() {
        messages.push(ChatMessage::text("system", system_text));
    }

    for message in &request.messages {
        match message.role.as_str() {
            "user" => {
                let (user_message, tool_messages) = convert_user_message(&message.content);
                if let Some(user_message) = user_message {
                    messages.push(user_message);
                }
                messages.extend(tool_messages);
            }
            "assistant" => {
                // Mixed text/tool_use blocks pass through structurally so
                // the payload builder can recover the tool calls.
                messages.push(ChatMessage {
                    role: "assistant".into(),
                    content: Some(message.content.clone()),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
            "system" => {
                let text = content_to_text(&message.content);
                if !text.is_empty() {
                    messages.push(ChatMessage::text("system", text));
                }
            }
            other => {
                messages.push(ChatMessage {
                    role: other.into(),
                    content: Some(message.content.clone()),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
        }
    }

    ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        stream: request.stream,
        temperature: request.temperature,
        top_p: request.top_p,
        max_tokens: Some(request.max_tokens),
        stop: request.stop_sequences.clone(),
        tools: request.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|tool| Tool {
                    kind: "function".into(),
                    function: ToolFunction {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.input_schema.clone(),
                    },
                })
                .collect()
        }),
        tool_choice: request.tool_choice.as_ref().map(map_tool_choice),
    }
}

/// Split an Anthropic user message: text blocks form one `user` message,
/// every `tool_result` block becomes a separate `tool` message carrying
/// the original `tool_use_id`.
fn convert_user_message(content: &Value) -> (Option<ChatMessage>, Vec<ChatMessage>) {
    let Some(blocks) = content.as_array() else {
        let text = content_to_text(content);
        if text.is_empty() {
            return (None, Vec::new());
        }
        return (Some(ChatMessage::text("user", text)), Vec::new());
    };

    let mut text_blocks = Vec::new();
    let mut tool_messages = Vec::new();

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("tool_result") => {
                let tool_use_id = block
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let text = content_to_text(block.get("content").unwrap_or(&Value::Null));
                tool_messages.push(ChatMessage::tool_result(tool_use_id, text));
            }
            Some("text") => {
                let text = block.get("text").and_then(Value::as_str).unwrap_or_default();
                text_blocks.push(json!({"type": "text", "text": text}));
            }
            // Non-text blocks (images and the like) degrade to text
            _ => text_blocks.push(json!({"type": "text", "text": content_to_text(block)})),
        }
    }

    let user_message = if text_blocks.is_empty() {
        None
    } else {
        Some(ChatMessage {
            role: "user".into(),
            content: Some(Value::Array(text_blocks)),
            tool_calls: None,
            tool_call_id: None,
        })
    };

    (user_message, tool_messages)
}

fn map_tool_choice(tool_choice: &Value) -> Value {
    if let Some(raw) = tool_choice.as_str() {
        if raw == "any" {
            return Value::String("required".into());
        }
        return tool_choice.clone();
    }
    if let Some(object) = tool_choice.as_object()
        && object.get("type").and_then(Value::as_str) == Some("tool")
        && let Some(name) = object.get("name").and_then(Value::as_str)
    {
        return json!({"type": "function", "function": {"name": name}});
    }
    tool_choice.clone()
}

/// Concatenated text of a content value: strings pass through, block lists
/// contribute their text parts, anything else serializes.
pub fn content_to_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(items) => items.iter().map(content_to_text).collect(),
        Value::Object(object) => {
            if object.get("type").and_then(Value::as_str) == Some("text") {
                return object
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
            }
            if let Some(text) = object.get("text").and_then(Value::as_str) {
                return text.to_string();
            }
            serde_json::to_string(content).unwrap_or_default()
        }
        other => other.to_string(),
    }
}

/// Map an OpenAI finish reason onto an Anthropic stop reason.
pub fn finish_reason_to_stop_reason(finish_reason: Option<&str>, saw_tool_calls: bool) -> &'static str {
    if finish_reason == Some("length") {
        return "max_tokens";
    }
    if finish_reason == Some("tool_calls") || saw_tool_calls {
        return "tool_use";
    }
    "end_turn"
}

/// Parse tool-call arguments defensively: objects pass through, valid
/// non-object JSON is wrapped, unparseable text is kept raw.
pub fn safe_json_loads(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(object)) => Value::Object(object),
        Ok(other) => json!({"value": other}),
        Err(_) => json!({"_raw": raw}),
    }
}

/// Convert a collected OpenAI response into an Anthropic message object.
pub fn openai_response_to_anthropic_message(response: &ChatCompletionResponse) -> Value {
    let choice = response.choices.first();
    let message = choice.map(|c| &c.message);
    let finish_reason = choice.and_then(|c| c.finish_reason.as_deref());

    let mut content_blocks = Vec::new();
    if let Some(text) = message.and_then(|m| m.content.as_deref())
        && !text.is_empty()
    {
        content_blocks.push(json!({"type": "text", "text": text}));
    }

    let tool_calls = message.and_then(|m| m.tool_calls.as_deref()).unwrap_or(&[]);
    for call in tool_calls {
        content_blocks.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.function.name,
            "input": safe_json_loads(&call.function.arguments),
        }));
    }

    json!({
        "id": response.id,
        "type": "message",
        "role": "assistant",
        "model": response.model,
        "content": content_blocks,
        "stop_reason": finish_reason_to_stop_reason(finish_reason, !tool_calls.is_empty()),
        "stop_sequence": null,
        "usage": {
            "input_tokens": response.usage.prompt_tokens,
            "output_tokens": response.usage.completion_tokens,
        },
    })
}

/// Compile the OpenAI intermediate form into the upstream
/// `conversationState` payload.
///
/// The last user turn (its text plus any pending tool results) becomes
/// `currentMessage`; earlier turns are folded into an alternating
/// user/assistant `history`. System text is prepended to the first user
/// content. `profile_arn` must only be passed for desktop-refresh accounts
/// — the device-OAuth upstream rejects it.
pub fn build_upstream_payload(
    request: &ChatCompletionRequest,
    conversation_id: &str,
    profile_arn: Option<&str>,
) -> Result<Value, TranslateError> {
    let mut system_text = String::new();
    // Turns: (user text, tool results) alternating with assistant messages
    let mut turns: Vec<Turn> = Vec::new();

    for message in &request.messages {
        match message.role.as_str() {
            "system" => {
                let text = message
                    .content
                    .as_ref()
                    .map(content_to_text)
                    .unwrap_or_default();
                if !text.is_empty() {
                    if !system_text.is_empty() {
                        system_text.push('\n');
                    }
                    system_text.push_str(&text);
                }
            }
            "user" => {
                let text = message
                    .content
                    .as_ref()
                    .map(content_to_text)
                    .unwrap_or_default();
                push_user_text(&mut turns, text);
            }
            "tool" => {
                let id = message.tool_call_id.clone().unwrap_or_default();
                let text = message
                    .content
                    .as_ref()
                    .map(content_to_text)
                    .unwrap_or_default();
                push_tool_result(&mut turns, id, text);
            }
            "assistant" => {
                turns.push(Turn::Assistant(assistant_turn(message)));
            }
            other => {
                return Err(TranslateError(format!("unsupported message role: {other}")));
            }
        }
    }

    let Some(last_user_position) = turns.iter().rposition(|t| matches!(t, Turn::User { .. }))
    else {
        return Err(TranslateError(
            "request must contain at least one user message".into(),
        ));
    };

    let current = turns.remove(last_user_position);
    // Assistant turns after the final user turn have nothing to answer
    turns.truncate(last_user_position);

    let history = build_history(&request.model, turns, &mut system_text);

    let Turn::User {
        mut text,
        tool_results,
    } = current
    else {
        return Err(TranslateError("current turn must be a user turn".into()));
    };

    if history.is_empty() && !system_text.is_empty() {
        text = prepend_system(&system_text, &text);
    }

    let mut context = Map::new();
    if let Some(tools) = &request.tools
        && !tools.is_empty()
    {
        context.insert("tools".into(), tool_specifications(tools));
    }
    if !tool_results.is_empty() {
        context.insert("toolResults".into(), tool_result_values(&tool_results));
    }

    let mut user_input = json!({
        "content": text,
        "modelId": request.model,
        "origin": "AI_EDITOR",
    });
    if !context.is_empty() {
        user_input["userInputMessageContext"] = Value::Object(context);
    }

    let mut payload = json!({
        "conversationState": {
            "chatTriggerType": "MANUAL",
            "conversationId": conversation_id,
            "currentMessage": { "userInputMessage": user_input },
            "history": history,
        },
    });
    if let Some(profile_arn) = profile_arn {
        payload["profileArn"] = Value::String(profile_arn.to_string());
    }

    Ok(payload)
}

enum Turn {
    User {
        text: String,
        tool_results: Vec<(String, String)>,
    },
    Assistant(Value),
}

fn push_user_text(turns: &mut Vec<Turn>, text: String) {
    if let Some(Turn::User {
        text: existing, ..
    }) = turns.last_mut()
    {
        if !existing.is_empty() && !text.is_empty() {
            existing.push('\n');
        }
        existing.push_str(&text);
        return;
    }
    turns.push(Turn::User {
        text,
        tool_results: Vec::new(),
    });
}

fn push_tool_result(turns: &mut Vec<Turn>, id: String, text: String) {
    if let Some(Turn::User { tool_results, .. }) = turns.last_mut() {
        tool_results.push((id, text));
        return;
    }
    turns.push(Turn::User {
        text: String::new(),
        tool_results: vec![(id, text)],
    });
}

/// Assistant turn: text content plus any tool uses recovered from either
/// explicit `tool_calls` or passed-through Anthropic `tool_use` blocks.
fn assistant_turn(message: &ChatMessage) -> Value {
    let mut text = String::new();
    let mut tool_uses = Vec::new();

    if let Some(calls) = &message.tool_calls {
        for call in calls {
            tool_uses.push(json!({
                "toolUseId": call.id,
                "name": call.function.name,
                "input": safe_json_loads(&call.function.arguments),
            }));
        }
    }

    match message.content.as_ref() {
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => tool_uses.push(json!({
                        "toolUseId": block.get("id").cloned().unwrap_or_default(),
                        "name": block.get("name").cloned().unwrap_or_default(),
                        "input": block.get("input").cloned().unwrap_or(json!({})),
                    })),
                    _ => text.push_str(&content_to_text(block)),
                }
            }
        }
        Some(content) => text.push_str(&content_to_text(content)),
        None => {}
    }

    let mut assistant = json!({ "content": text });
    if !tool_uses.is_empty() {
        assistant["toolUses"] = Value::Array(tool_uses);
    }
    json!({ "assistantResponseMessage": assistant })
}

/// Fold earlier turns into alternating user/assistant history entries.
/// Historical tool results are inlined as text since only the current
/// message carries a tool-result context upstream.
fn build_history(model: &str, turns: Vec<Turn>, system_text: &mut String) -> Vec<Value> {
    let mut history = Vec::new();
    let mut first_user_seen = false;

    for turn in turns {
        match turn {
            Turn::User { text, tool_results } => {
                let mut content = text;
                for (id, result_text) in tool_results {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str(&format!("[tool result {id}] {result_text}"));
                }
                if !first_user_seen {
                    first_user_seen = true;
                    if !system_text.is_empty() {
                        content = prepend_system(system_text, &content);
                        system_text.clear();
                    }
                }
                history.push(json!({
                    "userInputMessage": {
                        "content": content,
                        "modelId": model,
                        "origin": "AI_EDITOR",
                    }
                }));
            }
            Turn::Assistant(value) => {
                // History must alternate; a leading assistant turn gets an
                // empty user entry in front of it
                if history.len() % 2 == 0 {
                    history.push(json!({
                        "userInputMessage": {
                            "content": "",
                            "modelId": model,
                            "origin": "AI_EDITOR",
                        }
                    }));
                }
                history.push(value);
            }
        }
    }

    // Trailing user entry without an assistant reply cannot be sent
    if history.len() % 2 == 1 {
        history.push(json!({ "assistantResponseMessage": { "content": "" } }));
    }

    history
}

fn prepend_system(system_text: &str, content: &str) -> String {
    if content.is_empty() {
        system_text.to_string()
    } else {
        format!("{system_text}\n\n{content}")
    }
}

fn tool_specifications(tools: &[Tool]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "toolSpecification": {
                        "name": tool.function.name,
                        "description": tool.function.description.clone().unwrap_or_default(),
                        "inputSchema": { "json": tool.function.parameters },
                    }
                })
            })
            .collect(),
    )
}

fn tool_result_values(results: &[(String, String)]) -> Value {
    Value::Array(
        results
            .iter()
            .map(|(id, text)| {
                json!({
                    "toolUseId": id,
                    "content": [{ "text": text }],
                    "status": "success",
                })
            })
            .collect(),
    )
}
