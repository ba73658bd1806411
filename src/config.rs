//! Service configuration
//!
//! Defaults first, then overrides from the recognized environment variables.
//! There is no config file; the deployment surface is the env.

use serde::{Deserialize, Serialize};

use crate::turn::DEFAULT_DEAF_WINDOW_MS;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub vad: VadConfig,
    #[serde(default)]
    pub guardrail: GuardrailConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// API credential; required for the real adapters, absent in tests
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(default = "default_stt_model")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_tts_model")]
    pub model: String,
    #[serde(default = "default_voice_bob")]
    pub voice_bob: String,
    #[serde(default = "default_voice_alice")]
    pub voice_alice: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// RMS energy above which a 20 ms window counts as speech
    #[serde(default = "default_speech_threshold")]
    pub speech_threshold: f32,
    /// Echo-guard window after TTS ends or a barge-in fires
    #[serde(default = "default_silence_ms")]
    pub silence_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> Option<u32> {
    Some(512)
}

fn default_stt_model() -> String {
    "whisper-1".to_string()
}

fn default_tts_model() -> String {
    "tts-1".to_string()
}

fn default_voice_bob() -> String {
    "alloy".to_string()
}

fn default_voice_alice() -> String {
    "shimmer".to_string()
}

fn default_speech_threshold() -> f32 {
    200.0
}

fn default_silence_ms() -> u64 {
    DEFAULT_DEAF_WINDOW_MS
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_llm_model(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            model: default_stt_model(),
        }
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            model: default_tts_model(),
            voice_bob: default_voice_bob(),
            voice_alice: default_voice_alice(),
        }
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speech_threshold: default_speech_threshold(),
            silence_ms: default_silence_ms(),
        }
    }
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

impl Config {
    /// Defaults overridden by the recognized environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.provider.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            config.provider.base_url = url;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            config.llm.model = model;
        }
        if let Ok(model) = std::env::var("STT_MODEL") {
            config.stt.model = model;
        }
        if let Ok(model) = std::env::var("TTS_MODEL") {
            config.tts.model = model;
        }
        if let Ok(voice) = std::env::var("TTS_VOICE_BOB") {
            config.tts.voice_bob = voice;
        }
        if let Ok(voice) = std::env::var("TTS_VOICE_ALICE") {
            config.tts.voice_alice = voice;
        }
        if let Ok(threshold) = std::env::var("VAD_SPEECH_THRESHOLD") {
            config.vad.speech_threshold =
                threshold.parse().unwrap_or_else(|_| default_speech_threshold());
        }
        if let Ok(ms) = std::env::var("VAD_SILENCE_MS") {
            config.vad.silence_ms = ms.parse().unwrap_or_else(|_| default_silence_ms());
        }
        if let Ok(enabled) = std::env::var("GUARDRAIL_ENABLED") {
            config.guardrail.enabled =
                !matches!(enabled.to_lowercase().as_str(), "0" | "false" | "no" | "off");
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.stt.model, "whisper-1");
        assert_eq!(config.tts.voice_bob, "alloy");
        assert_eq!(config.tts.voice_alice, "shimmer");
        assert_eq!(config.vad.speech_threshold, 200.0);
        assert_eq!(config.vad.silence_ms, 700);
        assert!(config.guardrail.enabled);
        assert!(config.provider.api_key.is_none());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: Config =
            serde_json::from_str(r#"{"llm":{"model":"gpt-4o"},"vad":{"silence_ms":500}}"#).unwrap();
        assert_eq!(config.llm.model, "gpt-4o");
        assert_eq!(config.vad.silence_ms, 500);
        // Untouched sections keep their defaults
        assert_eq!(config.vad.speech_threshold, 200.0);
        assert_eq!(config.tts.model, "tts-1");
    }
}
