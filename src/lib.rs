pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod quota;
pub mod relay;
pub mod server;
pub mod translate;
pub mod upstream;

pub use config::Config;
pub use error::{CastorError, RelayError};
