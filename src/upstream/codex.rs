//! Codex (ChatGPT backend) upstream adapter.
//!
//! Requests for `gpt-*` models are mapped from the internal Gemini request
//! onto the Codex Responses wire, and the SSE reply is normalized back into
//! Gemini `GenerateContentResponse` fragments so the relay and the dialect
//! translators never see provider-specific shapes.

use crate::error::RelayError;
use crate::translate::SYSTEM_TURN_PREFIX;
use castor_schema::gemini::{
    Candidate, Content, GenerateContentRequest, GenerateContentResponse, Part,
};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::warn;

pub const CODEX_RESPONSES_URL: &str = "https://chatgpt.com/backend-api/codex/responses";

/// Fixed Codex-style User-Agent, intentionally static.
const CODEX_USER_AGENT: &str = "codex_cli_rs/0.95.0 (Debian 12.0.0; x86_64) vscode/1.108.2";

/// Codex Responses request body. Upstream is always driven in stream mode;
/// non-streaming callers buffer the events.
#[derive(Debug, Clone, Serialize)]
pub struct CodexSubmission {
    pub model: String,
    pub instructions: String,
    pub input: Vec<Value>,
    pub tools: Vec<Value>,
    pub parallel_tool_calls: bool,
    pub stream: bool,
    pub store: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
}

impl CodexSubmission {
    pub fn from_gemini(model: &str, request: &GenerateContentRequest) -> Self {
        let mut instructions = String::new();
        let mut input = Vec::new();

        for (index, content) in request.contents.iter().enumerate() {
            // The translators fold the client's system prompt into a marked
            // leading user turn; Codex has a first-class instructions slot.
            if index == 0 {
                if let Some(system) = system_text(content) {
                    instructions = system;
                    continue;
                }
            }
            push_input_items(&mut input, content);
        }

        let tools = request
            .tools
            .iter()
            .flatten()
            .flat_map(|t| t.function_declarations.iter())
            .map(|decl| {
                json!({
                    "type": "function",
                    "name": decl.name,
                    "description": decl.description,
                    "parameters": decl.parameters,
                    "strict": false,
                })
            })
            .collect();

        let generation = request.generation_config.as_ref();
        let reasoning = generation
            .and_then(|g| g.thinking_config.as_ref())
            .and_then(|t| t.thinking_budget)
            .and_then(reasoning_effort_for_budget)
            .map(|effort| json!({ "effort": effort }));

        CodexSubmission {
            model: model.to_string(),
            instructions,
            input,
            tools,
            parallel_tool_calls: true,
            stream: true,
            store: false,
            reasoning,
            max_output_tokens: generation.and_then(|g| g.max_output_tokens),
        }
    }
}

fn system_text(content: &Content) -> Option<String> {
    if content.role.as_deref() != Some("user") {
        return None;
    }
    let text = content.parts.first()?.text.as_deref()?;
    text.strip_prefix(SYSTEM_TURN_PREFIX).map(str::to_string)
}

fn push_input_items(input: &mut Vec<Value>, content: &Content) {
    let role = match content.role.as_deref() {
        Some("model") => "assistant",
        _ => "user",
    };
    let text_kind = if role == "assistant" {
        "output_text"
    } else {
        "input_text"
    };

    for part in &content.parts {
        if part.is_thought() {
            continue;
        }
        if let Some(text) = part.text.as_deref() {
            input.push(json!({
                "type": "message",
                "role": role,
                "content": [{"type": text_kind, "text": text}],
            }));
        } else if let Some(call) = part.function_call.as_ref() {
            let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
            let args = call.get("args").cloned().unwrap_or(Value::Null);
            input.push(json!({
                "type": "function_call",
                "name": name,
                "arguments": args.to_string(),
                // The Gemini wire keys tool results by name, not id.
                "call_id": name,
            }));
        } else if let Some(response) = part.function_response.as_ref() {
            let name = response
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let output = response.get("response").cloned().unwrap_or(Value::Null);
            input.push(json!({
                "type": "function_call_output",
                "call_id": name,
                "output": output.to_string(),
            }));
        }
    }
}

/// The thinking-budget table, reversed: budgets the proxy itself writes map
/// back onto Codex reasoning efforts. Auto and zero budgets leave the
/// upstream default in place.
fn reasoning_effort_for_budget(budget: i64) -> Option<&'static str> {
    match budget {
        1024 => Some("low"),
        8192 => Some("medium"),
        24576 => Some("high"),
        _ => None,
    }
}

/// POST the adapted request. `account_id` rides in the credential record's
/// project slot for codex accounts.
pub async fn post_responses(
    http: &reqwest::Client,
    token: &str,
    account_id: &str,
    model: &str,
    request: &GenerateContentRequest,
) -> Result<reqwest::Response, RelayError> {
    let body = CodexSubmission::from_gemini(model, request);
    http.post(CODEX_RESPONSES_URL)
        .header(reqwest::header::USER_AGENT, CODEX_USER_AGENT)
        .header("Chatgpt-Account-Id", account_id)
        .bearer_auth(token)
        .json(&body)
        .send()
        .await
        .map_err(RelayError::Transport)
}

/// Normalize one Codex SSE event into a Gemini response fragment.
/// Events that carry no client-visible content yield `None`.
pub fn fragment_from_event(value: &Value) -> Option<GenerateContentResponse> {
    let kind = value.get("type").and_then(Value::as_str)?;
    match kind {
        "response.output_text.delta" => {
            let delta = value.get("delta").and_then(Value::as_str)?;
            Some(text_fragment(delta, false))
        }
        "response.reasoning_text.delta" | "response.reasoning_summary_text.delta" => {
            let delta = value.get("delta").and_then(Value::as_str)?;
            Some(text_fragment(delta, true))
        }
        "response.output_item.done" => {
            let item = value.get("item")?;
            if item.get("type").and_then(Value::as_str) != Some("function_call") {
                return None;
            }
            let name = item.get("name").and_then(Value::as_str)?;
            let args = item
                .get("arguments")
                .and_then(Value::as_str)
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                .unwrap_or(Value::Null);
            Some(parts_fragment(vec![Part::from_function_call(name, args)]))
        }
        "response.completed" => {
            let usage = value.pointer("/response/usage").map(map_usage);
            let mut fragment = GenerateContentResponse {
                usage_metadata: usage,
                ..Default::default()
            };
            fragment.candidates.push(Candidate {
                finish_reason: Some("STOP".to_string()),
                ..Default::default()
            });
            Some(fragment)
        }
        _ => None,
    }
}

fn text_fragment(text: &str, thought: bool) -> GenerateContentResponse {
    let part = Part {
        thought: thought.then_some(true),
        text: Some(text.to_string()),
        ..Default::default()
    };
    parts_fragment(vec![part])
}

fn parts_fragment(parts: Vec<Part>) -> GenerateContentResponse {
    GenerateContentResponse {
        candidates: vec![Candidate {
            content: Some(Content::model(parts)),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn map_usage(usage: &Value) -> Value {
    json!({
        "promptTokenCount": usage.get("input_tokens").cloned().unwrap_or(json!(0)),
        "candidatesTokenCount": usage.get("output_tokens").cloned().unwrap_or(json!(0)),
        "totalTokenCount": usage.get("total_tokens").cloned().unwrap_or(json!(0)),
    })
}

/// Buffer the forced SSE stream into a single merged Gemini response for
/// non-streaming callers.
pub async fn collect_response(
    resp: reqwest::Response,
) -> Result<GenerateContentResponse, RelayError> {
    let mut events = Box::pin(resp.bytes_stream().eventsource());

    let mut text = String::new();
    let mut thoughts = String::new();
    let mut calls: Vec<Part> = Vec::new();
    let mut usage: Option<Value> = None;

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => return Err(RelayError::StreamProtocol(e.to_string())),
        };
        if event.data.is_empty() || event.data == "[DONE]" {
            continue;
        }
        let value: Value = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "skipping invalid codex SSE payload");
                continue;
            }
        };
        let Some(fragment) = fragment_from_event(&value) else {
            continue;
        };
        if let Some(u) = fragment.usage_metadata.clone() {
            usage = Some(u);
        }
        if let Some(content) = fragment.primary_content() {
            for part in &content.parts {
                if let Some(t) = part.text.as_deref() {
                    if part.is_thought() {
                        thoughts.push_str(t);
                    } else {
                        text.push_str(t);
                    }
                } else if part.function_call.is_some() {
                    calls.push(part.clone());
                }
            }
        }
    }

    let mut parts = Vec::new();
    if !thoughts.is_empty() {
        parts.push(Part {
            thought: Some(true),
            text: Some(thoughts),
            ..Default::default()
        });
    }
    if !text.is_empty() {
        parts.push(Part::from_text(text));
    }
    parts.extend(calls);

    Ok(GenerateContentResponse {
        candidates: vec![Candidate {
            content: Some(Content::model(parts)),
            finish_reason: Some("STOP".to_string()),
            index: Some(0),
            extra: BTreeMap::new(),
        }],
        usage_metadata: usage,
        ..Default::default()
    })
}
