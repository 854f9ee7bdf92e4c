//! OpenAI chat-completions ↔ Gemini translation.

use super::{
    SYSTEM_TURN_PREFIX, function_response_value, generate_id, openai_finish_reason,
    parse_data_url, thinking_config_for_effort, usage_counts,
};
use crate::error::RelayError;
use castor_schema::gemini::{
    Content, FunctionDeclaration, GenerateContentRequest, GenerateContentResponse, Part, Tool,
};
use castor_schema::openai::{
    ChatChoice, ChatChunkChoice, ChatCompletion, ChatCompletionChunk, ChatCompletionRequest,
    ChatDelta, ChatMessageContent, ContentPart, FunctionCall, FunctionCallDelta, ResponseMessage,
    ToolCall, ToolCallDelta, Usage,
};
use serde_json::{Value, json};
use std::collections::HashMap;

/// Convert a chat-completions request into the internal Gemini form.
pub fn request_to_gemini(req: &ChatCompletionRequest) -> Result<GenerateContentRequest, RelayError> {
    if req.messages.is_empty() {
        return Err(RelayError::Translate("messages must not be empty".to_string()));
    }

    let mut system_texts: Vec<String> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();
    // tool_call_id → function name, for resolving `tool` role messages.
    let mut call_names: HashMap<String, String> = HashMap::new();

    for message in &req.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = &message.content {
                    system_texts.push(content.as_text());
                }
            }
            "user" => {
                let parts = user_parts(message.content.as_ref())?;
                if !parts.is_empty() {
                    contents.push(Content::user(parts));
                }
            }
            "assistant" => {
                let mut parts = Vec::new();
                if let Some(content) = &message.content {
                    let text = content.as_text();
                    if !text.is_empty() {
                        parts.push(Part::from_text(text));
                    }
                }
                for call in message.tool_calls.iter().flatten() {
                    call_names.insert(call.id.clone(), call.function.name.clone());
                    let args = serde_json::from_str::<Value>(&call.function.arguments)
                        .unwrap_or(Value::Null);
                    parts.push(Part::from_function_call(&call.function.name, args));
                }
                if !parts.is_empty() {
                    contents.push(Content::model(parts));
                }
            }
            "tool" => {
                let id = message.tool_call_id.as_deref().unwrap_or_default();
                let name = call_names
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| id.to_string());
                let raw = message
                    .content
                    .as_ref()
                    .map(ChatMessageContent::as_text)
                    .unwrap_or_default();
                contents.push(Content::user(vec![Part::from_function_response(
                    name,
                    function_response_value(&raw),
                )]));
            }
            other => {
                return Err(RelayError::Translate(format!(
                    "unsupported message role: {other}"
                )));
            }
        }
    }

    if !system_texts.is_empty() {
        contents.insert(
            0,
            Content::user(vec![Part::from_text(format!(
                "{SYSTEM_TURN_PREFIX}{}",
                system_texts.join("\n")
            ))]),
        );
    }

    let mut gemini = GenerateContentRequest {
        contents,
        ..Default::default()
    };

    if let Some(tools) = &req.tools {
        let declarations: Vec<FunctionDeclaration> = tools
            .iter()
            .filter(|t| t.kind == "function")
            .map(|t| FunctionDeclaration {
                name: t.function.name.clone(),
                description: t.function.description.clone(),
                parameters: t.function.parameters.clone(),
            })
            .collect();
        if !declarations.is_empty() {
            gemini.tools = Some(vec![Tool {
                function_declarations: declarations,
                ..Default::default()
            }]);
        }
    }

    let generation = gemini.generation_config_mut();
    generation.temperature = req.temperature;
    generation.top_p = req.top_p;
    generation.top_k = req.top_k;
    generation.max_output_tokens = req.max_completion_tokens.or(req.max_tokens);
    generation.stop_sequences = req.stop.clone().map(|s| s.into_vec());
    generation.thinking_config =
        Some(thinking_config_for_effort(req.reasoning_effort.as_deref()));

    Ok(gemini)
}

fn user_parts(content: Option<&ChatMessageContent>) -> Result<Vec<Part>, RelayError> {
    let Some(content) = content else {
        return Ok(Vec::new());
    };
    match content {
        ChatMessageContent::Text(text) => Ok(vec![Part::from_text(text.clone())]),
        ChatMessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => Ok(Part::from_text(text.clone())),
                ContentPart::ImageUrl { image_url } => {
                    match parse_data_url(&image_url.url) {
                        Some((mime, data)) => Ok(Part::from_inline_data(mime, data)),
                        None => Err(RelayError::Translate(format!(
                            "image_url must be a base64 data URL, got: {:.64}",
                            image_url.url
                        ))),
                    }
                }
            })
            .collect(),
    }
}

/// Whether thought parts should surface to this client at all.
pub fn include_reasoning(req: &ChatCompletionRequest) -> bool {
    req.reasoning_effort.as_deref() != Some("none")
}

/// Materialize a full (non-streaming) chat completion.
pub fn response_from_gemini(
    model: &str,
    with_reasoning: bool,
    resp: &GenerateContentResponse,
) -> ChatCompletion {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    if let Some(content) = resp.primary_content() {
        for part in &content.parts {
            if let Some(t) = part.text.as_deref() {
                if part.is_thought() {
                    if with_reasoning {
                        reasoning.push_str(t);
                    }
                } else {
                    text.push_str(t);
                }
            } else if let Some(call) = part.function_call.as_ref() {
                let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
                let args = call.get("args").cloned().unwrap_or(json!({}));
                tool_calls.push(ToolCall {
                    id: format!("call_{}", tool_calls.len()),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: name.to_string(),
                        arguments: args.to_string(),
                    },
                });
            }
        }
    }

    let saw_tool_call = !tool_calls.is_empty();
    let finish_reason = resp
        .finish_reason()
        .map(|r| openai_finish_reason(r, saw_tool_call));

    ChatCompletion {
        id: generate_id("chatcmpl"),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: Some(text),
                reasoning: (!reasoning.is_empty()).then_some(reasoning),
                tool_calls: saw_tool_call.then_some(tool_calls),
            },
            finish_reason,
        }],
        usage: resp.usage_metadata.as_ref().map(|u| {
            let (prompt, completion, total) = usage_counts(u);
            Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: total,
            }
        }),
    }
}

/// Per-stream translation state: one upstream fragment may fan out into
/// several chunks, tool-call ids stay stable across argument deltas, and
/// the assistant role prelude is emitted exactly once.
pub struct OpenaiStream {
    id: String,
    created: i64,
    model: String,
    with_reasoning: bool,
    role_sent: bool,
    tool_calls_opened: u32,
    saw_tool_call: bool,
    finish_sent: bool,
}

impl OpenaiStream {
    pub fn new(model: &str, with_reasoning: bool) -> Self {
        OpenaiStream {
            id: generate_id("chatcmpl"),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            with_reasoning,
            role_sent: false,
            tool_calls_opened: 0,
            saw_tool_call: false,
            finish_sent: false,
        }
    }

    fn chunk(&self, delta: ChatDelta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    pub fn on_fragment(&mut self, fragment: &GenerateContentResponse) -> Vec<ChatCompletionChunk> {
        let mut chunks = Vec::new();

        if let Some(content) = fragment.primary_content() {
            if !self.role_sent && !content.parts.is_empty() {
                self.role_sent = true;
                chunks.push(self.chunk(
                    ChatDelta {
                        role: Some("assistant".to_string()),
                        ..Default::default()
                    },
                    None,
                ));
            }

            for part in &content.parts {
                if let Some(text) = part.text.as_deref() {
                    if part.is_thought() {
                        if self.with_reasoning {
                            chunks.push(self.chunk(
                                ChatDelta {
                                    reasoning: Some(text.to_string()),
                                    ..Default::default()
                                },
                                None,
                            ));
                        }
                    } else {
                        chunks.push(self.chunk(
                            ChatDelta {
                                content: Some(text.to_string()),
                                ..Default::default()
                            },
                            None,
                        ));
                    }
                } else if let Some(call) = part.function_call.as_ref() {
                    let index = self.tool_calls_opened;
                    self.tool_calls_opened += 1;
                    self.saw_tool_call = true;

                    let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
                    let args = call.get("args").cloned().unwrap_or(json!({}));
                    let id = format!("call_{index}");

                    // One chunk opens the call, a second carries the
                    // arguments against the same id.
                    chunks.push(self.chunk(
                        ChatDelta {
                            tool_calls: Some(vec![ToolCallDelta {
                                index,
                                id: Some(id),
                                kind: Some("function".to_string()),
                                function: Some(FunctionCallDelta {
                                    name: Some(name.to_string()),
                                    arguments: None,
                                }),
                            }]),
                            ..Default::default()
                        },
                        None,
                    ));
                    chunks.push(self.chunk(
                        ChatDelta {
                            tool_calls: Some(vec![ToolCallDelta {
                                index,
                                id: None,
                                kind: None,
                                function: Some(FunctionCallDelta {
                                    name: None,
                                    arguments: Some(args.to_string()),
                                }),
                            }]),
                            ..Default::default()
                        },
                        None,
                    ));
                }
            }
        }

        if let Some(reason) = fragment.finish_reason() {
            self.finish_sent = true;
            let mut chunk = self.chunk(
                ChatDelta::default(),
                Some(openai_finish_reason(reason, self.saw_tool_call)),
            );
            if let Some(usage) = fragment.usage_metadata.as_ref() {
                let (prompt, completion, total) = usage_counts(usage);
                chunk.usage = Some(Usage {
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                    total_tokens: total,
                });
            }
            chunks.push(chunk);
        }

        chunks
    }

    /// Upstream closed without a finish reason: close the turn cleanly.
    pub fn on_close(&mut self) -> Vec<ChatCompletionChunk> {
        if self.finish_sent || !self.role_sent {
            return Vec::new();
        }
        self.finish_sent = true;
        vec![self.chunk(
            ChatDelta::default(),
            Some(openai_finish_reason("STOP", self.saw_tool_call)),
        )]
    }
}
