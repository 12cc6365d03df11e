//! Error types for the PAGI voice session

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while driving a voice session.
///
/// Session failures reach the caller through `VoiceListener::on_error`. Control
/// operations themselves only fail with `SessionClosed`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoiceError {
    /// The input device could not be acquired (refused, missing or busy).
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    /// Recording stopped without a single byte of audio.
    #[error("No audio captured")]
    EmptyRecording,

    /// Transcription backend answered with a non-success status or was unreachable.
    #[error("Transcription server error: {0}")]
    ServerError(String),

    /// Transcription backend answered 2xx but without a `transcript` field.
    #[error("Malformed transcription response: {0}")]
    MalformedResponse(String),

    /// Speech synthesis or playback failed.
    #[error("Audio playback error: {0}")]
    Playback(String),

    /// No recognition engine and no server fallback are available.
    #[error("Voice capability missing: {0}")]
    CapabilityMissing(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("VAD initialization failed: {0}")]
    VadInit(String),

    #[error("Recognition error: {0}")]
    Recognition(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// `stop()` was already called on this capture.
    #[error("Capture already stopped")]
    CaptureStopped,

    /// The session actor is gone (shut down or dropped).
    #[error("Voice session closed")]
    SessionClosed,
}

impl VoiceError {
    /// Short machine-friendly tag, handy for UI notices and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            VoiceError::PermissionDenied(_) => "permission_denied",
            VoiceError::EmptyRecording => "empty_recording",
            VoiceError::ServerError(_) => "server_error",
            VoiceError::MalformedResponse(_) => "malformed_response",
            VoiceError::Playback(_) => "playback_error",
            VoiceError::CapabilityMissing(_) => "capability_missing",
            VoiceError::AudioDevice(_) => "audio_device",
            VoiceError::VadInit(_) => "vad_init",
            VoiceError::Recognition(_) => "recognition",
            VoiceError::Tts(_) => "tts",
            VoiceError::Config(_) => "config",
            VoiceError::CaptureStopped => "capture_stopped",
            VoiceError::SessionClosed => "session_closed",
        }
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        VoiceError::ServerError(err.to_string())
    }
}

#[cfg(feature = "mic")]
impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

#[cfg(feature = "mic")]
impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::PermissionDenied(err.to_string())
    }
}

#[cfg(feature = "mic")]
impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::PermissionDenied(err.to_string())
    }
}

#[cfg(feature = "mic")]
impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}
