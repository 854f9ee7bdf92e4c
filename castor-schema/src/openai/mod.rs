//! OpenAI chat-completions wire schema (client-facing dialect).

mod chat;
mod model_list;

pub use chat::{
    ChatChoice, ChatChunkChoice, ChatCompletion, ChatCompletionChunk, ChatCompletionRequest,
    ChatDelta, ChatMessage, ChatMessageContent, ContentPart, FunctionCall, FunctionCallDelta,
    FunctionObject, ImageUrl, ResponseMessage, StopSequences, ToolCall, ToolCallDelta,
    ToolDefinition, Usage,
};
pub use model_list::{OpenaiModel, OpenaiModelList};
