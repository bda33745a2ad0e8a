use anyhow::{Context, Result};
use lires_client_core::channel::ReconnectPolicy;
use lires_client_core::search::SearchField;
use lires_client_core::stream::MalformedPolicy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable that overrides `server.key`.
pub const KEY_ENV: &str = "LIRES_KEY";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Backend base URL, e.g. `http://localhost:8080`.
    pub url: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoadConfig {
    /// Use `/filelist-stream`; `false` falls back to the one-shot `/filelist`.
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default)]
    pub malformed: MalformedMode,
    /// Restrict the load to documents carrying all of these tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            streaming: true,
            malformed: MalformedMode::Skip,
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MalformedMode {
    #[default]
    Skip,
    Fail,
}

impl From<MalformedMode> for MalformedPolicy {
    fn from(mode: MalformedMode) -> Self {
        match mode {
            MalformedMode::Skip => MalformedPolicy::Skip,
            MalformedMode::Fail => MalformedPolicy::Fail,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl EventsConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    10
}
fn default_backoff_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_selector")]
    pub default_selector: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_selector: default_selector(),
        }
    }
}

fn default_selector() -> String {
    "general".to_string()
}

impl ServerConfig {
    /// Auth token: `LIRES_KEY` if set and non-empty, else `server.key`,
    /// else empty.
    pub fn resolved_key(&self) -> String {
        std::env::var(KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.key.clone())
            .unwrap_or_default()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    let url = config.server.url.trim().trim_end_matches('/').to_string();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        anyhow::bail!(
            "server.url must start with http:// or https://, got '{}'",
            config.server.url
        );
    }
    config.server.url = url;

    if config.server.timeout_secs == 0 {
        anyhow::bail!("server.timeout_secs must be > 0");
    }

    if config.events.max_retries > 1000 {
        anyhow::bail!("events.max_retries must be <= 1000");
    }

    let selector: SearchField = config.search.default_selector.parse().with_context(|| {
        format!(
            "search.default_selector '{}' is not a known selector",
            config.search.default_selector
        )
    })?;
    config.search.default_selector = selector.as_str().to_string();

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config = parse_config("[server]\nurl = \"http://localhost:8080/\"\n").unwrap();
        assert_eq!(config.server.url, "http://localhost:8080");
        assert!(config.load.streaming);
        assert_eq!(config.load.malformed, MalformedMode::Skip);
        assert!(config.events.enabled);
        assert_eq!(config.events.reconnect_policy(), ReconnectPolicy::default());
        assert_eq!(config.search.default_selector, "general");
    }

    #[test]
    fn full_config() {
        let config = parse_config(
            r#"
[server]
url = "https://lires.example.org"
key = "secret"
timeout_secs = 5

[load]
streaming = false
malformed = "fail"
tags = ["ml->nlp"]

[events]
enabled = false
max_retries = 3
backoff_ms = 250

[search]
default_selector = "Author"
"#,
        )
        .unwrap();
        assert!(!config.load.streaming);
        assert_eq!(MalformedPolicy::from(config.load.malformed), MalformedPolicy::Fail);
        assert_eq!(config.events.reconnect_policy().backoff, Duration::from_millis(250));
        assert_eq!(config.search.default_selector, "author");
        assert_eq!(config.server.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse_config("[server]\nurl = \"localhost:8080\"\n").is_err());
        assert!(parse_config("[server]\nurl = \"http://h\"\ntimeout_secs = 0\n").is_err());
        assert!(parse_config("[server]\nurl = \"http://h\"\n[search]\ndefault_selector = \"colour\"\n").is_err());
        assert!(parse_config("[load]\nstreaming = true\n").is_err());
    }

    #[test]
    fn example_config_is_valid() {
        let config = parse_config(include_str!("../config/lires.example.toml")).unwrap();
        assert_eq!(config.server.url, "http://localhost:8080");
        assert_eq!(config.server.key, None);
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("lires.toml");
        std::fs::write(&path, "[server]\nurl = \"http://h:1\"\nkey = \"k\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.server.key.as_deref(), Some("k"));

        let missing = load_config(&dir.path().join("nope.toml")).unwrap_err();
        assert!(missing.to_string().contains("nope.toml"));
    }
}
