//! Bidirectional dialect translators. The canonical internal shape is the
//! Gemini `GenerateContentRequest`; each client dialect converts into it
//! once on the way in and re-materializes on the way out.

pub mod claude;
pub mod openai;

use base64::Engine as _;
use castor_schema::gemini::ThinkingConfig;
use rand::RngCore;
use serde_json::Value;

/// Marker prefixed onto the leading user turn that carries a client's
/// system prompt; the Code Assist wire has no system role.
pub const SYSTEM_TURN_PREFIX: &str = "System instruction:\n";

/// Map a client reasoning hint onto the Gemini thinking budget.
/// Unknown or absent values fall through to auto.
pub fn thinking_config_for_effort(effort: Option<&str>) -> ThinkingConfig {
    match effort {
        Some("none") => ThinkingConfig {
            include_thoughts: None,
            thinking_budget: Some(0),
        },
        Some("low") => ThinkingConfig {
            include_thoughts: Some(true),
            thinking_budget: Some(1024),
        },
        Some("medium") => ThinkingConfig {
            include_thoughts: Some(true),
            thinking_budget: Some(8192),
        },
        Some("high") => ThinkingConfig {
            include_thoughts: Some(true),
            thinking_budget: Some(24576),
        },
        _ => ThinkingConfig {
            include_thoughts: Some(true),
            thinking_budget: Some(-1),
        },
    }
}

/// OpenAI finish-reason mapping. A tool call anywhere in the turn wins.
pub fn openai_finish_reason(gemini_reason: &str, saw_tool_call: bool) -> String {
    if saw_tool_call {
        return "tool_calls".to_string();
    }
    match gemini_reason {
        "MAX_TOKENS" => "length",
        "SAFETY" => "content_filter",
        _ => "stop",
    }
    .to_string()
}

/// Anthropic stop-reason mapping.
pub fn claude_stop_reason(gemini_reason: &str, saw_tool_call: bool) -> String {
    if saw_tool_call {
        return "tool_use".to_string();
    }
    match gemini_reason {
        "MAX_TOKENS" => "max_tokens",
        _ => "end_turn",
    }
    .to_string()
}

/// `data:<mime>;base64,<bytes>` → (mime, bytes).
pub fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (mime, data) = rest.split_once(";base64,")?;
    if mime.is_empty() {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}

/// Random wire-visible id, e.g. `chatcmpl-3yTk0aG9pQxWlFhw`.
pub fn generate_id(prefix: &str) -> String {
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    format!(
        "{prefix}-{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    )
}

/// Pull token counts out of Gemini `usageMetadata`.
pub fn usage_counts(usage: &Value) -> (u64, u64, u64) {
    let prompt = usage
        .get("promptTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let completion = usage
        .get("candidatesTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let total = usage
        .get("totalTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or(prompt + completion);
    (prompt, completion, total)
}

/// Function-response payloads must be JSON objects on the Gemini wire;
/// anything else is wrapped.
pub fn function_response_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => serde_json::json!({ "result": other }),
        Err(_) => serde_json::json!({ "result": raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effort_table_matches_contract() {
        let none = thinking_config_for_effort(Some("none"));
        assert_eq!(none.thinking_budget, Some(0));
        assert_eq!(none.include_thoughts, None);

        assert_eq!(
            thinking_config_for_effort(Some("low")).thinking_budget,
            Some(1024)
        );
        assert_eq!(
            thinking_config_for_effort(Some("medium")).thinking_budget,
            Some(8192)
        );
        assert_eq!(
            thinking_config_for_effort(Some("high")).thinking_budget,
            Some(24576)
        );

        for auto in [Some("auto"), None, Some("whatever")] {
            let cfg = thinking_config_for_effort(auto);
            assert_eq!(cfg.thinking_budget, Some(-1));
            assert_eq!(cfg.include_thoughts, Some(true));
        }
    }

    #[test]
    fn finish_reason_mappings() {
        assert_eq!(openai_finish_reason("STOP", false), "stop");
        assert_eq!(openai_finish_reason("MAX_TOKENS", false), "length");
        assert_eq!(openai_finish_reason("SAFETY", false), "content_filter");
        assert_eq!(openai_finish_reason("STOP", true), "tool_calls");

        assert_eq!(claude_stop_reason("STOP", false), "end_turn");
        assert_eq!(claude_stop_reason("MAX_TOKENS", false), "max_tokens");
        assert_eq!(claude_stop_reason("SAFETY", false), "end_turn");
        assert_eq!(claude_stop_reason("STOP", true), "tool_use");
    }

    #[test]
    fn data_url_parses_mime_and_payload() {
        let (mime, data) = parse_data_url("data:image/png;base64,AAAA").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(data, "AAAA");

        assert!(parse_data_url("https://example.com/cat.png").is_none());
        assert!(parse_data_url("data:;base64,AAAA").is_none());
    }

    #[test]
    fn function_response_wraps_non_objects() {
        assert_eq!(
            function_response_value(r#"{"temperature":15}"#),
            serde_json::json!({"temperature": 15})
        );
        assert_eq!(
            function_response_value("15 degrees"),
            serde_json::json!({"result": "15 degrees"})
        );
        assert_eq!(
            function_response_value("[1,2]"),
            serde_json::json!({"result": [1, 2]})
        );
    }

    #[test]
    fn generated_ids_are_prefixed_and_unique() {
        let a = generate_id("chatcmpl");
        let b = generate_id("chatcmpl");
        assert!(a.starts_with("chatcmpl-"));
        assert_ne!(a, b);
    }
}
