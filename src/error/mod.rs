mod oauth;
mod relay;

pub use oauth::OauthError;
pub use relay::{ClaudeFacing, GoogleErrorBody, GoogleErrorObject, OpenaiFacing, RelayError};

use thiserror::Error as ThisError;

/// Process-level failures. Fatal at startup; logged at runtime.
#[derive(Debug, ThisError)]
pub enum CastorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("credential IO error: {0}")]
    CredentialIo(#[from] std::io::Error),

    #[error("server bind error: {0}")]
    Bind(String),
}

pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}
