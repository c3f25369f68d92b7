use anyhow::Result;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Endpoints and credentials for the two speech upstreams.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_voice_agent_url")]
    pub voice_agent_url: String,
    #[serde(default = "default_transcription_url")]
    pub transcription_url: String,
    #[serde(default)]
    pub voice_agent_api_key: String,
    #[serde(default)]
    pub transcription_api_key: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_stt_model")]
    pub stt_model: String,
    #[serde(default = "default_tts_model")]
    pub tts_model: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_coaching_prompt")]
    pub coaching_prompt: String,
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default)]
    pub keyterms: Vec<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Audio encoding the media transport delivers: "linear16" or "opus".
    /// Fixed for the lifetime of each orchestrator.
    #[serde(default = "default_audio_encoding")]
    pub audio_encoding: String,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_function_call_timeout_ms")]
    pub function_call_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Upstream write buffer ceiling; audio above this is dropped, not queued.
    #[serde(default = "default_outbound_buffer_max_bytes")]
    pub outbound_buffer_max_bytes: usize,
    #[serde(default = "default_participant_reconnect_grace_ms")]
    pub participant_reconnect_grace_ms: u64,
    /// Per-participant outbound message queue length.
    #[serde(default = "default_session_queue_capacity")]
    pub session_queue_capacity: usize,
    /// Per-participant inbound audio queue length, in frames.
    #[serde(default = "default_audio_queue_frames")]
    pub audio_queue_frames: usize,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_read_idle_timeout_ms")]
    pub read_idle_timeout_ms: u64,
    /// Sink drops beyond this mark a participant for eviction.
    #[serde(default = "default_eviction_drop_threshold")]
    pub eviction_drop_threshold: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8443
}
fn default_voice_agent_url() -> String {
    "wss://agent.deepgram.com/v1/agent/converse".to_string()
}
fn default_transcription_url() -> String {
    "wss://api.deepgram.com/v1/listen?model=nova-3-medical&encoding=linear16&sample_rate=24000&interim_results=true".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_stt_model() -> String {
    "nova-3-medical".to_string()
}
fn default_tts_model() -> String {
    "aura-2-thalia-en".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_coaching_prompt() -> String {
    "You are a supportive wellness coach assisting a live coaching session. \
     Keep answers short and conversational; they will be spoken aloud."
        .to_string()
}
fn default_language() -> String {
    "en".to_string()
}
fn default_temperature() -> f64 {
    0.7
}
fn default_audio_encoding() -> String {
    "linear16".to_string()
}
fn default_keepalive_interval_ms() -> u64 {
    4_000
}
fn default_function_call_timeout_ms() -> u64 {
    10_000
}
fn default_outbound_buffer_max_bytes() -> usize {
    64 * 1024
}
fn default_participant_reconnect_grace_ms() -> u64 {
    30_000
}
fn default_session_queue_capacity() -> usize {
    256
}
fn default_audio_queue_frames() -> usize {
    64
}
fn default_ping_interval_ms() -> u64 {
    30_000
}
fn default_read_idle_timeout_ms() -> u64 {
    60_000
}
fn default_eviction_drop_threshold() -> u64 {
    64
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            voice_agent_url: default_voice_agent_url(),
            transcription_url: default_transcription_url(),
            voice_agent_api_key: String::new(),
            transcription_api_key: String::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            stt_model: default_stt_model(),
            tts_model: default_tts_model(),
            llm_model: default_llm_model(),
            coaching_prompt: default_coaching_prompt(),
            greeting: None,
            keyterms: Vec::new(),
            language: default_language(),
            temperature: default_temperature(),
            audio_encoding: default_audio_encoding(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            function_call_timeout_ms: default_function_call_timeout_ms(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            outbound_buffer_max_bytes: default_outbound_buffer_max_bytes(),
            participant_reconnect_grace_ms: default_participant_reconnect_grace_ms(),
            session_queue_capacity: default_session_queue_capacity(),
            audio_queue_frames: default_audio_queue_frames(),
            ping_interval_ms: default_ping_interval_ms(),
            read_idle_timeout_ms: default_read_idle_timeout_ms(),
            eviction_drop_threshold: default_eviction_drop_threshold(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `coachbridge.toml`, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("COACHBRIDGE_CONFIG").unwrap_or_else(|_| "coachbridge.toml".to_string());

        let builder = config::Config::builder();

        let builder = if Path::new(&config_path).exists() {
            builder.add_source(config::File::with_name(&config_path))
        } else {
            tracing::warn!("Config file '{}' not found, using defaults", config_path);
            builder
        };

        let settings = builder
            .add_source(
                config::Environment::with_prefix("COACHBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.agent.keepalive_interval_ms)
    }

    pub fn function_call_timeout(&self) -> Duration {
        Duration::from_millis(self.agent.function_call_timeout_ms)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.limits.participant_reconnect_grace_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_all_tunables() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.agent.stt_model, "nova-3-medical");
        assert_eq!(cfg.agent.tts_model, "aura-2-thalia-en");
        assert_eq!(cfg.agent.llm_model, "gpt-4o-mini");
        assert_eq!(cfg.agent.keepalive_interval_ms, 4_000);
        assert_eq!(cfg.agent.function_call_timeout_ms, 10_000);
        assert_eq!(cfg.limits.outbound_buffer_max_bytes, 65_536);
        assert_eq!(cfg.limits.participant_reconnect_grace_ms, 30_000);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn section_overrides_merge_with_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"agent": {"stt_model": "nova-2"}}"#).unwrap();
        assert_eq!(cfg.agent.stt_model, "nova-2");
        assert_eq!(cfg.agent.tts_model, "aura-2-thalia-en");
    }
}
