use crate::error::CastorError;
use figment::{
    Figment,
    providers::{Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration, loaded from a YAML file merged over defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Port the HTTP server listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding credential JSON files. `~` expands to home.
    #[serde(default = "default_auth_dir")]
    pub auth_dir: String,

    /// Enables debug-level logging.
    #[serde(default)]
    pub debug: bool,

    /// Optional HTTP/SOCKS5 proxy applied to the outbound transport.
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// Keys clients must present as `Authorization: Bearer <key>`.
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Static Generative Language API keys, synthesized into credentials.
    #[serde(default)]
    pub generative_language_api_key: Vec<String>,

    #[serde(default)]
    pub quota_exceeded: QuotaExceeded,
}

/// Behavior when an upstream reports quota exhaustion.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct QuotaExceeded {
    /// Advance to another account after a 429.
    #[serde(default = "default_true")]
    pub switch_project: bool,

    /// Substitute a preview model alias after a 429 (OAuth accounts only).
    #[serde(default = "default_true")]
    pub switch_preview_model: bool,
}

impl Default for QuotaExceeded {
    fn default() -> Self {
        Self {
            switch_project: true,
            switch_preview_model: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            auth_dir: default_auth_dir(),
            debug: false,
            proxy_url: None,
            api_keys: Vec::new(),
            generative_language_api_key: Vec::new(),
            quota_exceeded: QuotaExceeded::default(),
        }
    }
}

fn default_port() -> u16 {
    8317
}

fn default_auth_dir() -> String {
    "~/.cli-proxy-api".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Loads configuration from a YAML file merged over serialized defaults.
    pub fn from_file(path: &Path) -> Result<Self, CastorError> {
        if !path.is_file() {
            return Err(CastorError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .extract()
            .map_err(|e| CastorError::Config(e.to_string()))
    }

    /// The auth directory with `~` expanded against `$HOME`.
    pub fn resolved_auth_dir(&self) -> PathBuf {
        expand_home(&self.auth_dir)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME") {
            let rest = rest.trim_start_matches('/');
            return if rest.is_empty() {
                PathBuf::from(home)
            } else {
                Path::new(&home).join(rest)
            };
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_keys() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 8317);
        assert_eq!(cfg.auth_dir, "~/.cli-proxy-api");
        assert!(cfg.quota_exceeded.switch_project);
        assert!(cfg.quota_exceeded.switch_preview_model);
    }

    #[test]
    fn yaml_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(
            file,
            "port: 9000\napi-keys:\n  - sk-test\nquota-exceeded:\n  switch-preview-model: false\n"
        )
        .unwrap();

        let cfg = Config::from_file(file.path()).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.api_keys, vec!["sk-test"]);
        assert!(cfg.quota_exceeded.switch_project);
        assert!(!cfg.quota_exceeded.switch_preview_model);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = Config::from_file(Path::new("/nonexistent/castor.yaml")).unwrap_err();
        assert!(matches!(err, CastorError::Config(_)));
    }

    #[test]
    fn tilde_expands_against_home() {
        let dir = expand_home("~/creds");
        assert!(!dir.to_string_lossy().starts_with('~'));
        assert!(dir.to_string_lossy().ends_with("creds"));
    }
}
