//! Voice session configuration.
//!
//! Built by the settings layer (or loaded from `.env` / TOML) and handed to
//! `VoiceSession::configure`. Values are clamped by [`VoiceSessionConfig::normalized`]
//! before the controller uses them.

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Where finished audio is turned into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionMode {
    /// Streaming recognizer running next to the session (push-based interim/final results).
    #[default]
    Local,
    /// Record audio and upload it to `server_endpoint`.
    Server,
}

fn default_true() -> bool {
    true
}

fn default_volume() -> f32 {
    1.0
}

fn default_silence_timeout_ms() -> u64 {
    1500
}

fn default_min_confidence() -> f32 {
    0.5
}

fn default_auto_send_grace_ms() -> u64 {
    400
}

fn default_restart_delay_ms() -> u64 {
    500
}

fn default_max_recording_ms() -> u64 {
    30_000
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_voice_keywords() -> Vec<String> {
    vec![
        "enhanced".to_string(),
        "natural".to_string(),
        "premium".to_string(),
    ]
}

/// Per-session voice configuration.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | PAGI_VOICE_ENABLED | true | Master switch. |
/// | PAGI_VOICE_AUTO_LISTEN | false | Listen again after a spoken reply. |
/// | PAGI_VOICE_CONTINUOUS | false | Hands-free: restart capture after every utterance, submit on silence. |
/// | PAGI_VOICE_VOLUME | 1.0 | Playback volume 0.0–1.0. |
/// | PAGI_VOICE_SILENCE_TIMEOUT_MS | 1500 | Silence before a hands-free utterance is submitted. |
/// | PAGI_VOICE_MIN_CONFIDENCE | 0.5 | Final results below this are ignored. |
/// | PAGI_VOICE_AUTO_SEND_THRESHOLD | 0 | Characters before clause-end auto-send kicks in (0 = off). |
/// | PAGI_VOICE_CUSTOM_VOICE | unset | Preferred synthesizer voice name. |
/// | PAGI_VOICE_AUTO_REPLY | false | Re-listen after speaking (with auto-listen or hands-free). |
/// | PAGI_VOICE_TRANSCRIPTION_MODE | local | "local" \| "server". |
/// | PAGI_VOICE_SERVER_ENDPOINT | unset | Transcription upload URL. |
/// | PAGI_VOICE_MAX_RECORDING_MS | 30000 | Upper bound on one recording (0 = no bound). |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSessionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_listen: bool,
    /// Hands-free mode.
    #[serde(default)]
    pub continuous_listening: bool,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// 0 disables auto-send.
    #[serde(default)]
    pub auto_send_threshold: usize,
    /// Extra wait after a clause end so trailing words still make it in.
    #[serde(default = "default_auto_send_grace_ms")]
    pub auto_send_grace_ms: u64,
    /// Optional regex replacing the built-in clause-end heuristic.
    #[serde(default)]
    pub auto_send_pattern: Option<String>,
    #[serde(default)]
    pub custom_voice: Option<String>,
    /// Ranking used when no custom voice matches (first keyword found in a voice name wins).
    #[serde(default = "default_voice_keywords")]
    pub preferred_voice_keywords: Vec<String>,
    #[serde(default)]
    pub auto_reply_enabled: bool,
    #[serde(default)]
    pub transcription_mode: TranscriptionMode,
    #[serde(default)]
    pub server_endpoint: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    /// Delay between the end of a spoken reply and listening again.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Run WebRTC VAD over PCM recordings so hands-free server recording stops on silence.
    #[serde(default = "default_true")]
    pub vad_enabled: bool,
    /// A recording this long is submitted as is. 0 disables the bound.
    #[serde(default = "default_max_recording_ms")]
    pub max_recording_ms: u64,
}

impl Default for VoiceSessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_listen: false,
            continuous_listening: false,
            volume: default_volume(),
            silence_timeout_ms: default_silence_timeout_ms(),
            min_confidence: default_min_confidence(),
            auto_send_threshold: 0,
            auto_send_grace_ms: default_auto_send_grace_ms(),
            auto_send_pattern: None,
            custom_voice: None,
            preferred_voice_keywords: default_voice_keywords(),
            auto_reply_enabled: false,
            transcription_mode: TranscriptionMode::Local,
            server_endpoint: None,
            language: default_language(),
            restart_delay_ms: default_restart_delay_ms(),
            vad_enabled: true,
            max_recording_ms: default_max_recording_ms(),
        }
    }
}

impl VoiceSessionConfig {
    /// A config with `enabled = false`; passing it to `configure` tears the session down.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Load from environment. Unset or invalid values fall back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("PAGI_VOICE_ENABLED", true),
            auto_listen: env_bool("PAGI_VOICE_AUTO_LISTEN", false),
            continuous_listening: env_bool("PAGI_VOICE_CONTINUOUS", false),
            volume: env_parse("PAGI_VOICE_VOLUME", defaults.volume),
            silence_timeout_ms: env_parse("PAGI_VOICE_SILENCE_TIMEOUT_MS", defaults.silence_timeout_ms),
            min_confidence: env_parse("PAGI_VOICE_MIN_CONFIDENCE", defaults.min_confidence),
            auto_send_threshold: env_parse("PAGI_VOICE_AUTO_SEND_THRESHOLD", 0),
            auto_send_grace_ms: env_parse("PAGI_VOICE_AUTO_SEND_GRACE_MS", defaults.auto_send_grace_ms),
            auto_send_pattern: env_opt_string("PAGI_VOICE_AUTO_SEND_PATTERN"),
            custom_voice: env_opt_string("PAGI_VOICE_CUSTOM_VOICE"),
            preferred_voice_keywords: env_opt_string("PAGI_VOICE_PREFERRED_KEYWORDS")
                .map(|s| {
                    s.split(',')
                        .map(|k| k.trim().to_lowercase())
                        .filter(|k| !k.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.preferred_voice_keywords),
            auto_reply_enabled: env_bool("PAGI_VOICE_AUTO_REPLY", false),
            transcription_mode: env_transcription_mode(),
            server_endpoint: env_opt_string("PAGI_VOICE_SERVER_ENDPOINT"),
            language: env_opt_string("PAGI_VOICE_LANGUAGE").unwrap_or(defaults.language),
            restart_delay_ms: env_parse("PAGI_VOICE_RESTART_DELAY_MS", defaults.restart_delay_ms),
            vad_enabled: env_bool("PAGI_VOICE_VAD_ENABLED", true),
            max_recording_ms: env_parse("PAGI_VOICE_MAX_RECORDING_MS", defaults.max_recording_ms),
        }
        .normalized()
    }

    /// Load a TOML file with `PAGI_VOICE__<FIELD>` environment overrides on top.
    /// A missing file is not an error; defaults apply.
    pub fn load_from_path(path: &Path) -> VoiceResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };
        let built = builder
            .add_source(config::Environment::with_prefix("PAGI_VOICE").separator("__"))
            .build()?;
        let cfg: Self = built.try_deserialize()?;
        Ok(cfg.normalized())
    }

    /// Write as TOML.
    pub fn save_to_path(&self, path: &Path) -> VoiceResult<()> {
        let text = toml::to_string_pretty(self).map_err(|e| VoiceError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| VoiceError::Config(e.to_string()))?;
            }
        }
        std::fs::write(path, text).map_err(|e| VoiceError::Config(e.to_string()))
    }

    /// Clamp ranges and drop empty strings.
    pub fn normalized(mut self) -> Self {
        self.volume = if self.volume.is_finite() { self.volume.clamp(0.0, 1.0) } else { 1.0 };
        self.min_confidence = if self.min_confidence.is_finite() {
            self.min_confidence.clamp(0.0, 1.0)
        } else {
            default_min_confidence()
        };
        self.server_endpoint = self
            .server_endpoint
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self.custom_voice = self
            .custom_voice
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self.auto_send_pattern = self.auto_send_pattern.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn auto_send_grace(&self) -> Duration {
        Duration::from_millis(self.auto_send_grace_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Longest a single recording may run, if bounded.
    pub fn max_recording(&self) -> Option<Duration> {
        (self.max_recording_ms > 0).then(|| Duration::from_millis(self.max_recording_ms))
    }

    /// True when a finished reply should lead straight back into listening.
    pub fn wants_listen_after_reply(&self) -> bool {
        self.auto_reply_enabled && (self.continuous_listening || self.auto_listen)
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.trim();
            if v.is_empty() {
                default
            } else {
                v.eq_ignore_ascii_case("true") || v == "1"
            }
        }
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_transcription_mode() -> TranscriptionMode {
    match std::env::var("PAGI_VOICE_TRANSCRIPTION_MODE") {
        Ok(v) if v.trim().eq_ignore_ascii_case("server") => TranscriptionMode::Server,
        _ => TranscriptionMode::Local,
    }
}
