//! Anthropic messages ↔ Gemini translation.

use super::{
    SYSTEM_TURN_PREFIX, claude_stop_reason, function_response_value, generate_id,
    thinking_config_for_effort, usage_counts,
};
use crate::error::RelayError;
use castor_schema::claude::{
    ContentBlock, ContentBlockDelta, MessageContent, MessageDeltaBody, MessageStartBody,
    MessagesRequest, MessagesResponse, StreamEvent, ToolResultContent, Usage,
};
use castor_schema::gemini::{
    Content, FunctionDeclaration, GenerateContentRequest, GenerateContentResponse, Part,
    ThinkingConfig, Tool,
};
use serde_json::{Value, json};
use std::collections::HashMap;

/// Convert an Anthropic messages request into the internal Gemini form.
pub fn request_to_gemini(req: &MessagesRequest) -> Result<GenerateContentRequest, RelayError> {
    if req.messages.is_empty() {
        return Err(RelayError::Translate("messages must not be empty".to_string()));
    }

    let mut contents: Vec<Content> = Vec::new();
    // tool_use id → name, for resolving tool_result blocks.
    let mut tool_names: HashMap<String, String> = HashMap::new();

    for message in &req.messages {
        let role_is_user = match message.role.as_str() {
            "user" => true,
            "assistant" => false,
            other => {
                return Err(RelayError::Translate(format!(
                    "unsupported message role: {other}"
                )));
            }
        };

        let parts = match &message.content {
            MessageContent::Text(text) => vec![Part::from_text(text.clone())],
            MessageContent::Blocks(blocks) => {
                let mut parts = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => parts.push(Part::from_text(text.clone())),
                        ContentBlock::Image { source } => {
                            if source.kind != "base64" {
                                return Err(RelayError::Translate(format!(
                                    "unsupported image source type: {}",
                                    source.kind
                                )));
                            }
                            parts.push(Part::from_inline_data(
                                source.media_type.clone().unwrap_or_default(),
                                source.data.clone().unwrap_or_default(),
                            ));
                        }
                        ContentBlock::Thinking { thinking, .. } => {
                            parts.push(Part {
                                thought: Some(true),
                                text: Some(thinking.clone()),
                                ..Default::default()
                            });
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            tool_names.insert(id.clone(), name.clone());
                            parts.push(Part::from_function_call(name.clone(), input.clone()));
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => {
                            let name = tool_names
                                .get(tool_use_id)
                                .cloned()
                                .unwrap_or_else(|| tool_use_id.clone());
                            let raw = content
                                .as_ref()
                                .map(ToolResultContent::as_text)
                                .unwrap_or_default();
                            parts.push(Part::from_function_response(
                                name,
                                function_response_value(&raw),
                            ));
                        }
                    }
                }
                parts
            }
        };

        if parts.is_empty() {
            continue;
        }
        contents.push(if role_is_user {
            Content::user(parts)
        } else {
            Content::model(parts)
        });
    }

    if let Some(system) = &req.system {
        let text = system.as_text();
        if !text.is_empty() {
            contents.insert(
                0,
                Content::user(vec![Part::from_text(format!("{SYSTEM_TURN_PREFIX}{text}"))]),
            );
        }
    }

    let mut gemini = GenerateContentRequest {
        contents,
        ..Default::default()
    };

    if let Some(tools) = &req.tools {
        let declarations: Vec<FunctionDeclaration> = tools
            .iter()
            .map(|t| FunctionDeclaration {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
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
    generation.max_output_tokens = req.max_tokens;
    generation.stop_sequences = req.stop_sequences.clone();
    generation.thinking_config = Some(match req.thinking_budget() {
        Some(budget) => ThinkingConfig {
            include_thoughts: Some(true),
            thinking_budget: Some(budget),
        },
        None => thinking_config_for_effort(None),
    });

    Ok(gemini)
}

/// Materialize a full (non-streaming) messages response.
pub fn response_from_gemini(model: &str, resp: &GenerateContentResponse) -> MessagesResponse {
    let mut blocks: Vec<ContentBlock> = Vec::new();
    let mut tool_count = 0usize;

    if let Some(content) = resp.primary_content() {
        for part in &content.parts {
            if let Some(text) = part.text.as_deref() {
                if part.is_thought() {
                    blocks.push(ContentBlock::Thinking {
                        thinking: text.to_string(),
                        signature: None,
                    });
                } else {
                    blocks.push(ContentBlock::Text {
                        text: text.to_string(),
                    });
                }
            } else if let Some(call) = part.function_call.as_ref() {
                let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
                let input = call.get("args").cloned().unwrap_or(json!({}));
                blocks.push(ContentBlock::ToolUse {
                    id: format!("toolu_{tool_count}"),
                    name: name.to_string(),
                    input,
                });
                tool_count += 1;
            }
        }
    }

    let saw_tool_call = tool_count > 0;
    let (input_tokens, output_tokens) = resp
        .usage_metadata
        .as_ref()
        .map(|u| {
            let (prompt, completion, _) = usage_counts(u);
            (prompt, completion)
        })
        .unwrap_or((0, 0));

    MessagesResponse {
        id: generate_id("msg"),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: model.to_string(),
        content: blocks,
        stop_reason: resp
            .finish_reason()
            .map(|r| claude_stop_reason(r, saw_tool_call)),
        stop_sequence: None,
        usage: Usage {
            input_tokens,
            output_tokens,
        },
    }
}

#[derive(Clone, Copy, PartialEq)]
enum OpenBlock {
    Text,
    Thinking,
}

/// Per-stream translation state for the Anthropic event sequence:
/// `message_start`, block start/delta/stop per content run, a final
/// `message_delta` with the stop reason, then `message_stop`.
pub struct ClaudeStream {
    id: String,
    model: String,
    started: bool,
    index: u32,
    open: Option<OpenBlock>,
    tool_count: usize,
    saw_tool_call: bool,
    stop_sent: bool,
    output_tokens: u64,
}

impl ClaudeStream {
    pub fn new(model: &str) -> Self {
        ClaudeStream {
            id: generate_id("msg"),
            model: model.to_string(),
            started: false,
            index: 0,
            open: None,
            tool_count: 0,
            saw_tool_call: false,
            stop_sent: false,
            output_tokens: 0,
        }
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        events.push(StreamEvent::MessageStart {
            message: MessageStartBody {
                id: self.id.clone(),
                kind: "message".to_string(),
                role: "assistant".to_string(),
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        });
    }

    fn close_open_block(&mut self, events: &mut Vec<StreamEvent>) {
        if self.open.take().is_some() {
            events.push(StreamEvent::ContentBlockStop { index: self.index });
            self.index += 1;
        }
    }

    fn ensure_block(&mut self, kind: OpenBlock, events: &mut Vec<StreamEvent>) {
        if self.open == Some(kind) {
            return;
        }
        self.close_open_block(events);
        let content_block = match kind {
            OpenBlock::Text => ContentBlock::Text {
                text: String::new(),
            },
            OpenBlock::Thinking => ContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
        };
        events.push(StreamEvent::ContentBlockStart {
            index: self.index,
            content_block,
        });
        self.open = Some(kind);
    }

    pub fn on_fragment(&mut self, fragment: &GenerateContentResponse) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if let Some(content) = fragment.primary_content() {
            if !content.parts.is_empty() {
                self.ensure_started(&mut events);
            }

            for part in &content.parts {
                if let Some(text) = part.text.as_deref() {
                    if part.is_thought() {
                        self.ensure_block(OpenBlock::Thinking, &mut events);
                        events.push(StreamEvent::ContentBlockDelta {
                            index: self.index,
                            delta: ContentBlockDelta::ThinkingDelta {
                                thinking: text.to_string(),
                            },
                        });
                    } else {
                        self.ensure_block(OpenBlock::Text, &mut events);
                        events.push(StreamEvent::ContentBlockDelta {
                            index: self.index,
                            delta: ContentBlockDelta::TextDelta {
                                text: text.to_string(),
                            },
                        });
                    }
                } else if let Some(call) = part.function_call.as_ref() {
                    self.close_open_block(&mut events);
                    self.saw_tool_call = true;

                    let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
                    let input = call.get("args").cloned().unwrap_or(json!({}));

                    events.push(StreamEvent::ContentBlockStart {
                        index: self.index,
                        content_block: ContentBlock::ToolUse {
                            id: format!("toolu_{}", self.tool_count),
                            name: name.to_string(),
                            input: json!({}),
                        },
                    });
                    events.push(StreamEvent::ContentBlockDelta {
                        index: self.index,
                        delta: ContentBlockDelta::InputJsonDelta {
                            partial_json: input.to_string(),
                        },
                    });
                    events.push(StreamEvent::ContentBlockStop { index: self.index });
                    self.index += 1;
                    self.tool_count += 1;
                }
            }
        }

        if let Some(usage) = fragment.usage_metadata.as_ref() {
            let (_, completion, _) = usage_counts(usage);
            self.output_tokens = completion;
        }

        if let Some(reason) = fragment.finish_reason() {
            self.ensure_started(&mut events);
            self.close_open_block(&mut events);
            self.stop_sent = true;
            events.push(StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some(claude_stop_reason(reason, self.saw_tool_call)),
                    stop_sequence: None,
                },
                usage: Some(Usage {
                    input_tokens: 0,
                    output_tokens: self.output_tokens,
                }),
            });
        }

        events
    }

    /// Terminal events on upstream close. `message_stop` is emitted exactly
    /// once, preceded by a synthesized stop when the upstream never sent a
    /// finish reason.
    pub fn on_close(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.started {
            return events;
        }
        if !self.stop_sent {
            self.close_open_block(&mut events);
            self.stop_sent = true;
            events.push(StreamEvent::MessageDelta {
                delta: MessageDeltaBody {
                    stop_reason: Some(claude_stop_reason("STOP", self.saw_tool_call)),
                    stop_sequence: None,
                },
                usage: Some(Usage {
                    input_tokens: 0,
                    output_tokens: self.output_tokens,
                }),
            });
        }
        events.push(StreamEvent::MessageStop);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use castor_schema::gemini::Candidate;

    fn claude_request(value: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    fn fragment_with_parts(parts: Vec<Part>) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content::model(parts)),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn finish_fragment(reason: &str) -> GenerateContentResponse {
        GenerateContentResponse {
            candidates: vec![Candidate {
                finish_reason: Some(reason.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn system_field_becomes_marked_user_turn() {
        let req = claude_request(json!({
            "model": "gemini-2.5-pro",
            "max_tokens": 512,
            "system": "be terse",
            "messages": [{"role": "user", "content": "hi"}]
        }));

        let gemini = request_to_gemini(&req).unwrap();
        assert_eq!(
            gemini.contents[0].parts[0].text.as_deref(),
            Some("System instruction:\nbe terse")
        );
        assert_eq!(
            gemini.generation_config.as_ref().unwrap().max_output_tokens,
            Some(512)
        );
    }

    #[test]
    fn tool_use_and_result_map_to_function_parts() {
        let req = claude_request(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_x", "name": "get_weather", "input": {"city": "London"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_x", "content": "15 degrees"}
                ]}
            ],
            "tools": [{"name": "get_weather", "input_schema": {"type": "object"}}]
        }));

        let gemini = request_to_gemini(&req).unwrap();

        let call = gemini.contents[1].parts[0].function_call.as_ref().unwrap();
        assert_eq!(call["name"], "get_weather");
        assert_eq!(call["args"]["city"], "London");

        let response = gemini.contents[2].parts[0]
            .function_response
            .as_ref()
            .unwrap();
        assert_eq!(response["name"], "get_weather");
        assert_eq!(response["response"]["result"], "15 degrees");

        assert_eq!(
            gemini.tools.as_ref().unwrap()[0].function_declarations[0].name,
            "get_weather"
        );
    }

    #[test]
    fn base64_image_becomes_inline_data() {
        let req = claude_request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAAA"}}
            ]}]
        }));

        let gemini = request_to_gemini(&req).unwrap();
        let inline = gemini.contents[0].parts[0].inline_data.as_ref().unwrap();
        assert_eq!(inline["mimeType"], "image/png");
    }

    #[test]
    fn thinking_budget_forwards_directly() {
        let req = claude_request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "thinking": {"type": "enabled", "budget_tokens": 4096}
        }));

        let gemini = request_to_gemini(&req).unwrap();
        let thinking = gemini
            .generation_config
            .as_ref()
            .unwrap()
            .thinking_config
            .as_ref()
            .unwrap();
        assert_eq!(thinking.thinking_budget, Some(4096));
        assert_eq!(thinking.include_thoughts, Some(true));
    }

    #[test]
    fn response_materializes_blocks_and_stop_reason() {
        let resp = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(Content::model(vec![
                    Part {
                        thought: Some(true),
                        text: Some("weighing options".to_string()),
                        ..Default::default()
                    },
                    Part::from_text("Paris."),
                ])),
                finish_reason: Some("STOP".to_string()),
                ..Default::default()
            }],
            usage_metadata: Some(json!({
                "promptTokenCount": 9, "candidatesTokenCount": 2, "totalTokenCount": 11
            })),
            ..Default::default()
        };

        let message = response_from_gemini("gemini-2.5-pro", &resp);
        assert_eq!(message.kind, "message");
        assert!(matches!(message.content[0], ContentBlock::Thinking { .. }));
        assert!(matches!(message.content[1], ContentBlock::Text { .. }));
        assert_eq!(message.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(message.usage.input_tokens, 9);
        assert_eq!(message.usage.output_tokens, 2);
    }

    #[test]
    fn stream_event_sequence_for_plain_text() {
        let mut stream = ClaudeStream::new("m");

        let first = stream.on_fragment(&fragment_with_parts(vec![Part::from_text("Par")]));
        let names: Vec<&str> = first.iter().map(StreamEvent::event_name).collect();
        assert_eq!(
            names,
            ["message_start", "content_block_start", "content_block_delta"]
        );

        let next = stream.on_fragment(&fragment_with_parts(vec![Part::from_text("is")]));
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].event_name(), "content_block_delta");

        let finish = stream.on_fragment(&finish_fragment("STOP"));
        let names: Vec<&str> = finish.iter().map(StreamEvent::event_name).collect();
        assert_eq!(names, ["content_block_stop", "message_delta"]);

        let tail = stream.on_close();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].event_name(), "message_stop");
    }

    #[test]
    fn stream_switches_blocks_between_thinking_and_text() {
        let mut stream = ClaudeStream::new("m");
        stream.on_fragment(&fragment_with_parts(vec![Part {
            thought: Some(true),
            text: Some("hmm".to_string()),
            ..Default::default()
        }]));

        let events = stream.on_fragment(&fragment_with_parts(vec![Part::from_text("Paris")]));
        let names: Vec<&str> = events.iter().map(StreamEvent::event_name).collect();
        assert_eq!(
            names,
            ["content_block_stop", "content_block_start", "content_block_delta"]
        );
    }

    #[test]
    fn stream_tool_use_is_self_contained() {
        let mut stream = ClaudeStream::new("m");
        let events = stream.on_fragment(&fragment_with_parts(vec![Part::from_function_call(
            "get_weather",
            json!({"city": "London"}),
        )]));

        let names: Vec<&str> = events.iter().map(StreamEvent::event_name).collect();
        assert_eq!(
            names,
            [
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop"
            ]
        );

        let finish = stream.on_fragment(&finish_fragment("STOP"));
        match finish.last().unwrap() {
            StreamEvent::MessageDelta { delta, .. } => {
                assert_eq!(delta.stop_reason.as_deref(), Some("tool_use"));
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
    }

    #[test]
    fn close_without_finish_synthesizes_stop() {
        let mut stream = ClaudeStream::new("m");
        stream.on_fragment(&fragment_with_parts(vec![Part::from_text("hi")]));

        let tail = stream.on_close();
        let names: Vec<&str> = tail.iter().map(StreamEvent::event_name).collect();
        assert_eq!(names, ["content_block_stop", "message_delta", "message_stop"]);
    }

    #[test]
    fn silent_stream_emits_nothing_on_close() {
        let mut stream = ClaudeStream::new("m");
        assert!(stream.on_close().is_empty());
    }
}
