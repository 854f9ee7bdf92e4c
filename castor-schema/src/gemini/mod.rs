//! Gemini v1beta / Code Assist v1internal wire schema.
//!
//! The `GenerateContentRequest` here is the canonical internal shape of the
//! proxy: every client dialect is converted into it once, and only the
//! outermost boundary serializes. Unknown fields are preserved in `extra`
//! catch-all maps so pass-through traffic survives schema drift upstream.

mod envelope;
mod model_list;
mod request;
mod response;

pub use envelope::{CliEnvelope, CliResponseBody, parse_response_payload};
pub use model_list::{GeminiModel, GeminiModelList};
pub use request::{
    Content, FunctionDeclaration, GenerateContentRequest, GenerationConfig, Part, ThinkingConfig,
    Tool,
};
pub use response::{Candidate, GenerateContentResponse};
