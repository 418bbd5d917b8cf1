use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClientError;

/// Client configuration shared by the context, the collaborators and the
/// `pulse` binary.
///
/// Sources, lowest priority first: defaults, a TOML file, `PULSE_*`
/// environment variables, `--key=value` arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the hosted backend (e.g. `https://xyz.example.co`).
    pub backend_url: Option<String>,

    /// Public (anon) API key sent with every backend request.
    pub anon_key: Option<String>,

    /// OpenAI-compatible chat completion endpoint for caption help.
    pub ai_endpoint: Option<String>,

    /// API key for the generative endpoint. Absent means pass-through.
    pub ai_key: Option<String>,

    /// Model name sent to the generative endpoint.
    pub ai_model: String,

    /// Object storage bucket for post, reel and story media.
    pub media_bucket: String,

    /// Posts fetched per feed page.
    pub feed_page_size: usize,

    /// How long a story stays in the active tray.
    pub story_ttl_secs: u64,

    /// Per-story auto-advance interval in the viewer.
    pub story_duration_ms: u64,

    /// How long an own mutation waits for its real-time echo before the
    /// echo guard forgets it.
    pub echo_window_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            anon_key: None,
            ai_endpoint: None,
            ai_key: None,
            ai_model: "gpt-4o-mini".to_string(),
            media_bucket: "media".to_string(),
            feed_page_size: 20,
            story_ttl_secs: 24 * 60 * 60,
            story_duration_ms: 5_000,
            echo_window_ms: 10_000,
        }
    }
}

impl ClientConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        if !path.exists() {
            debug!("config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Validation(format!("read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| ClientError::Validation(format!("parse {}: {}", path.display(), e)))
    }

    /// Overlay `PULSE_*` environment variables.
    pub fn with_env(mut self) -> Self {
        let vars: Vec<(String, String)> = std::env::vars()
            .filter(|(k, _)| k.starts_with("PULSE_"))
            .collect();
        for (key, value) in vars {
            let name = key.trim_start_matches("PULSE_").to_ascii_lowercase();
            self.apply(&name, &value);
        }
        self
    }

    /// Overlay `--key=value` arguments.
    ///
    /// Supported keys: `--backend-url`, `--anon-key`, `--ai-endpoint`,
    /// `--ai-key`, `--ai-model`, `--media-bucket`, `--feed-page-size`,
    /// `--story-ttl-secs`, `--story-duration-ms`, `--echo-window-ms`.
    /// Unknown arguments are ignored.
    pub fn with_args(mut self, args: &[String]) -> Self {
        for arg in args {
            if let Some((key, value)) = arg.strip_prefix("--").and_then(|a| a.split_once('=')) {
                self.apply(&key.replace('-', "_"), value);
            }
        }
        self
    }

    fn apply(&mut self, key: &str, value: &str) {
        let non_empty = || Some(value.to_string()).filter(|v| !v.is_empty());
        match key {
            "backend_url" => self.backend_url = non_empty(),
            "anon_key" => self.anon_key = non_empty(),
            "ai_endpoint" => self.ai_endpoint = non_empty(),
            "ai_key" => self.ai_key = non_empty(),
            "ai_model" => self.ai_model = value.to_string(),
            "media_bucket" => self.media_bucket = value.to_string(),
            "feed_page_size" => parse_into(value, &mut self.feed_page_size),
            "story_ttl_secs" => parse_into(value, &mut self.story_ttl_secs),
            "story_duration_ms" => parse_into(value, &mut self.story_duration_ms),
            "echo_window_ms" => parse_into(value, &mut self.echo_window_ms),
            _ => {}
        }
    }

    /// Both backend URL and anon key are present.
    pub fn is_backend_configured(&self) -> bool {
        self.backend_url.is_some() && self.anon_key.is_some()
    }

    /// Generative text is usable; otherwise captions pass through.
    pub fn is_ai_configured(&self) -> bool {
        self.ai_endpoint.is_some() && self.ai_key.is_some()
    }

    pub fn story_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(Duration::from_secs(self.story_ttl_secs)).unwrap_or(chrono::Duration::MAX)
    }

    pub fn story_duration(&self) -> Duration {
        Duration::from_millis(self.story_duration_ms)
    }

    pub fn echo_window(&self) -> Duration {
        Duration::from_millis(self.echo_window_ms)
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, slot: &mut T) {
    match value.parse() {
        Ok(v) => *slot = v,
        Err(_) => debug!("ignoring unparsable config value {:?}", value),
    }
}
