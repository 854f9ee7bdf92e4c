use serde::{Deserialize, Serialize, de::Error};
use serde_json::Value;
use std::collections::BTreeMap;

/// Gemini `generateContent` / `streamGenerateContent` request body.
///
/// Reference: <https://ai.google.dev/gemini-api/docs/text-generation>
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    /// Required conversation turns.
    pub contents: Vec<Content>,

    /// Generation parameters (temperature, topP, thinkingConfig, …).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,

    /// Tool declarations (function calling).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    /// Catch-all for optional fields the proxy forwards untouched,
    /// including `safetySettings`, `toolConfig` and `systemInstruction`.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl GenerateContentRequest {
    /// Mutable access to the generation config, creating it on demand.
    pub fn generation_config_mut(&mut self) -> &mut GenerationConfig {
        self.generation_config.get_or_insert_with(GenerationConfig::default)
    }
}

/// A single conversation turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    /// `"user"` or `"model"`. Kept as a raw string for transparent
    /// pass-through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Ordered parts that constitute a single message.
    #[serde(default, deserialize_with = "deserialize_parts")]
    pub parts: Vec<Part>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Content {
            role: Some("user".to_string()),
            parts,
            extra: BTreeMap::new(),
        }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Content {
            role: Some("model".to_string()),
            parts,
            extra: BTreeMap::new(),
        }
    }
}

/// One atomic piece of content inside a `Content` turn.
///
/// `text` is the most common variant; other part types are explicitly
/// modeled, while unrecognized fields are preserved in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// Model-thought marker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,

    /// Inline text data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Inline media bytes: `{mimeType, data}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Value>,

    /// Function call produced by the model: `{name, args}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<Value>,

    /// Function response fed back as context: `{name, response}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<Value>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Part {
    pub fn from_text(text: impl Into<String>) -> Self {
        Part {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn from_function_call(name: impl Into<String>, args: Value) -> Self {
        Part {
            function_call: Some(serde_json::json!({
                "name": name.into(),
                "args": args,
            })),
            ..Default::default()
        }
    }

    pub fn from_function_response(name: impl Into<String>, response: Value) -> Self {
        Part {
            function_response: Some(serde_json::json!({
                "name": name.into(),
                "response": response,
            })),
            ..Default::default()
        }
    }

    pub fn from_inline_data(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Part {
            inline_data: Some(serde_json::json!({
                "mimeType": mime_type.into(),
                "data": data.into(),
            })),
            ..Default::default()
        }
    }

    pub fn is_thought(&self) -> bool {
        self.thought == Some(true)
    }
}

/// Generation parameters. `thinkingConfig` is typed because the proxy
/// rewrites the thinking budget from client-supplied reasoning hints.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Compute allowance for model deliberation. A budget of −1 means auto.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_thoughts: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<i64>,
}

/// A bundle of function declarations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function_declarations: Vec<FunctionDeclaration>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

fn deserialize_parts<'de, D>(deserializer: D) -> Result<Vec<Part>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let parts = Vec::<Part>::deserialize(deserializer)?;

    for (index, part) in parts.iter().enumerate() {
        let data_fields = usize::from(part.text.is_some())
            + usize::from(part.inline_data.is_some())
            + usize::from(part.function_call.is_some())
            + usize::from(part.function_response.is_some());

        if data_fields > 1 {
            return Err(D::Error::custom(format!(
                "parts[{index}] must contain at most one data field among text, inlineData, functionCall, functionResponse"
            )));
        }
    }

    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_request_deserializes_with_defaults() {
        let req: GenerateContentRequest = serde_json::from_value(json!({"contents": []})).unwrap();
        assert!(req.contents.is_empty());
        assert!(req.generation_config.is_none());
        assert!(req.tools.is_none());
        assert!(req.extra.is_empty());
    }

    #[test]
    fn full_request_roundtrips() {
        let input = json!({
            "contents": [{
                "role": "user",
                "parts": [{"text": "hello"}]
            }],
            "generationConfig": {
                "temperature": 0.7,
                "topP": 0.9,
                "topK": 40.0,
                "maxOutputTokens": 1024,
                "stopSequences": ["END"],
                "thinkingConfig": {
                    "includeThoughts": true,
                    "thinkingBudget": 2048
                }
            },
            "tools": [{"functionDeclarations": [
                {"name": "get_weather", "description": "look up weather", "parameters": {"type": "object"}}
            ]}],
            "safetySettings": [{"category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_NONE"}]
        });

        let req: GenerateContentRequest = serde_json::from_value(input.clone()).unwrap();

        assert_eq!(req.contents[0].role.as_deref(), Some("user"));
        assert_eq!(req.contents[0].parts[0].text.as_deref(), Some("hello"));

        let gc = req.generation_config.as_ref().unwrap();
        assert_eq!(gc.temperature, Some(0.7));
        assert_eq!(gc.top_k, Some(40.0));
        assert_eq!(gc.max_output_tokens, Some(1024));
        assert_eq!(
            gc.thinking_config,
            Some(ThinkingConfig {
                include_thoughts: Some(true),
                thinking_budget: Some(2048),
            })
        );
        assert_eq!(req.tools.as_ref().unwrap()[0].function_declarations[0].name, "get_weather");

        let output = serde_json::to_value(&req).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn part_rejects_multiple_data_fields() {
        let err = serde_json::from_value::<Content>(json!({
            "role": "user",
            "parts": [{
                "text": "hello",
                "inlineData": {"mimeType": "text/plain", "data": "aGVsbG8="}
            }]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("at most one data field"));
    }

    #[test]
    fn function_call_and_response_parts_preserved() {
        let input = json!([
            {
                "role": "model",
                "parts": [{
                    "functionCall": {"name": "get_weather", "args": {"city": "London"}}
                }]
            },
            {
                "role": "user",
                "parts": [{
                    "functionResponse": {"name": "get_weather", "response": {"temperature": 15}}
                }]
            }
        ]);

        let contents: Vec<Content> = serde_json::from_value(input.clone()).unwrap();
        assert_eq!(serde_json::to_value(&contents).unwrap(), input);
    }

    #[test]
    fn thought_marker_roundtrips() {
        let input = json!({
            "role": "model",
            "parts": [{"thought": true, "text": "considering the options"}]
        });

        let content: Content = serde_json::from_value(input.clone()).unwrap();
        assert!(content.parts[0].is_thought());
        assert_eq!(serde_json::to_value(&content).unwrap(), input);
    }

    #[test]
    fn unknown_fields_preserved_in_extra() {
        let input = json!({
            "contents": [{"parts": [{"text": "ping"}]}],
            "cachedContent": "projects/foo/cachedContents/bar",
            "toolConfig": {"functionCallingConfig": {"mode": "AUTO"}}
        });

        let req: GenerateContentRequest = serde_json::from_value(input).unwrap();
        assert_eq!(
            req.extra.get("cachedContent"),
            Some(&json!("projects/foo/cachedContents/bar"))
        );
        assert!(req.extra.contains_key("toolConfig"));
    }
}
