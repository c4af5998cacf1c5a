//! Configuration for the parley voice client

use std::path::PathBuf;

use crate::delegation::DEFAULT_TRIGGER_PHRASES;

/// Parley client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Relay endpoint that mints a realtime connection URL
    pub relay_url: String,

    /// Reasoning gateway endpoint for delegated queries
    pub reasoning_url: String,

    /// Low-latency conversational model identifier
    pub primary_model: String,

    /// Deeper reasoning model identifier (active while thinking)
    pub secondary_model: String,

    /// Voice identifier for synthesized output
    pub voice: String,

    /// Input transcription model identifier
    pub transcription_model: String,

    /// Server-side turn detection parameters
    pub turn_detection: TurnDetectionConfig,

    /// Phrases that hand the turn to the reasoning model
    pub trigger_phrases: Vec<String>,

    /// Knowledge store file; `None` disables knowledge augmentation
    pub knowledge_path: Option<PathBuf>,
}

/// Server VAD turn-detection parameters
#[derive(Debug, Clone)]
pub struct TurnDetectionConfig {
    /// Speech energy threshold (0.0 to 1.0)
    pub threshold: f32,

    /// Audio included before detected speech start, in milliseconds
    pub prefix_padding_ms: u32,

    /// Trailing silence that ends a turn, in milliseconds
    pub silence_duration_ms: u32,
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: "http://localhost:8787/session".to_string(),
            reasoning_url: "http://localhost:8787/reason".to_string(),
            primary_model: "gpt-4o-realtime-preview".to_string(),
            secondary_model: "o3-mini".to_string(),
            voice: "alloy".to_string(),
            transcription_model: "whisper-1".to_string(),
            turn_detection: TurnDetectionConfig::default(),
            trigger_phrases: DEFAULT_TRIGGER_PHRASES
                .iter()
                .map(ToString::to_string)
                .collect(),
            knowledge_path: Some(default_knowledge_path()),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Reads `PARLEY_RELAY_URL`, `PARLEY_REASONING_URL`, `PARLEY_PRIMARY_MODEL`,
    /// `PARLEY_SECONDARY_MODEL`, `PARLEY_VOICE`, `PARLEY_TRANSCRIPTION_MODEL`,
    /// and `PARLEY_KNOWLEDGE_PATH`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("PARLEY_RELAY_URL") {
            config.relay_url = url;
        }
        if let Ok(url) = std::env::var("PARLEY_REASONING_URL") {
            config.reasoning_url = url;
        }
        if let Ok(model) = std::env::var("PARLEY_PRIMARY_MODEL") {
            config.primary_model = model;
        }
        if let Ok(model) = std::env::var("PARLEY_SECONDARY_MODEL") {
            config.secondary_model = model;
        }
        if let Ok(voice) = std::env::var("PARLEY_VOICE") {
            config.voice = voice;
        }
        if let Ok(model) = std::env::var("PARLEY_TRANSCRIPTION_MODEL") {
            config.transcription_model = model;
        }
        if let Ok(path) = std::env::var("PARLEY_KNOWLEDGE_PATH") {
            config.knowledge_path = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }

        config
    }
}

/// Return the default knowledge store path, creating its parent if needed
///
/// Uses `~/.local/share/parley/knowledge.json` on Linux
#[must_use]
pub fn default_knowledge_path() -> PathBuf {
    let data_dir = directories::ProjectDirs::from("dev", "parley", "parley")
        .map_or_else(|| PathBuf::from(".parley"), |d| d.data_dir().to_path_buf());

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::warn!(
            path = %data_dir.display(),
            error = %e,
            "failed to create data directory"
        );
    }

    data_dir.join("knowledge.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.relay_url.starts_with("http"));
        assert!(!config.primary_model.is_empty());
        assert_ne!(config.primary_model, config.secondary_model);
        assert!(!config.trigger_phrases.is_empty());
    }

    #[test]
    fn turn_detection_defaults() {
        let td = TurnDetectionConfig::default();
        assert!(td.threshold > 0.0 && td.threshold < 1.0);
        assert_eq!(td.prefix_padding_ms, 300);
        assert_eq!(td.silence_duration_ms, 500);
    }
}
