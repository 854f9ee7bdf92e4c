//! Upstream provider plumbing: endpoint constants, OAuth token exchange,
//! and the per-credential client.

pub mod client;
pub mod codex;
pub mod oauth;

pub use client::UpstreamClient;

/// Fixed Code Assist endpoint used by Gemini CLI.
pub const CODE_ASSIST_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";
pub const CODE_ASSIST_API_VERSION: &str = "v1internal";

/// Generative Language API endpoint for static-key accounts.
pub const GL_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
pub const GL_API_VERSION: &str = "v1beta";

/// Resource Manager project inventory.
pub const RESOURCE_MANAGER_PROJECTS_URL: &str =
    "https://cloudresourcemanager.googleapis.com/v1/projects";

/// Version reported in the CLI plugin headers.
pub const PLUGIN_VERSION: &str = "0.1.9";

/// `User-Agent` for Code Assist calls, e.g. `GeminiCLI/0.1.9 (linux; x86_64)`.
pub fn user_agent() -> String {
    format!(
        "GeminiCLI/{PLUGIN_VERSION} ({}; {})",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Platform tag in the form the Code Assist backend expects.
pub fn platform_string() -> String {
    let arch = std::env::consts::ARCH.to_uppercase();
    match std::env::consts::OS {
        "macos" => format!("DARWIN_{arch}"),
        "linux" => format!("LINUX_{arch}"),
        "windows" => format!("WINDOWS_{arch}"),
        _ => "PLATFORM_UNSPECIFIED".to_string(),
    }
}

/// `Client-Metadata` header value.
pub fn client_metadata_header() -> String {
    format!(
        "ideType=IDE_UNSPECIFIED,platform={},pluginType=GEMINI,pluginVersion={PLUGIN_VERSION}",
        platform_string()
    )
}

/// Client metadata in JSON body form, used by the onboarding calls.
pub fn client_metadata_body() -> serde_json::Value {
    serde_json::json!({
        "ideType": "IDE_UNSPECIFIED",
        "platform": platform_string(),
        "pluginType": "GEMINI",
        "pluginVersion": PLUGIN_VERSION,
    })
}
