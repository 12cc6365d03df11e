//! # PAGI Voice Session - hands-free voice interaction
//!
//! This crate coordinates listening, recording, auto-submit and spoken replies for a
//! chat surface. Engines (recognizer, transcription server, microphone, synthesizer)
//! are plugged in through traits; the session owns all state and decides when an
//! utterance is done.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      VoiceSession (actor)                      │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐    │
//! │  │  Recognizer  │ → │  AutoSubmit  │ → │  on_speech_result│    │
//! │  │ (streaming)  │   │   Policy     │   │   (listener)     │    │
//! │  └──────────────┘   └──────────────┘   └──────────────────┘    │
//! │  ┌──────────────┐   ┌──────────────┐          ↑                │
//! │  │ AudioCapture │ → │ Transcriber  │ ─────────┘                │
//! │  │ (+ WebRTC VAD)│  │ (HTTP upload)│                           │
//! │  └──────────────┘   └──────────────┘                           │
//! │  ┌──────────────┐                                              │
//! │  │ SpeechPlayback│ → reply ends → listen again (auto-reply)    │
//! │  └──────────────┘                                              │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ```no_run
//! use pagi_voice_session::{VoiceBackends, VoiceEvent, VoiceSession, VoiceSessionConfig};
//! use std::sync::Arc;
//!
//! # async fn demo() -> pagi_voice_session::VoiceResult<()> {
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<VoiceEvent>();
//! let session = VoiceSession::spawn(VoiceSessionConfig::from_env(), VoiceBackends::default(), Arc::new(tx));
//! session.start_listening().await?;
//! while let Some(event) = rx.recv().await {
//!     if let VoiceEvent::SpeechResult(text) = event {
//!         session.speak(format!("You said {}", text)).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod state;
pub mod stt;
pub mod turn;
pub mod vad;
pub mod voice_output;

pub use audio::{
    default_source, ActiveInput, AudioCapture, AudioChunk, AudioChunkBuffer, AudioPayload, AudioSource,
    CaptureHandle, ChunkEncoding, NoInputSource,
};
#[cfg(feature = "mic")]
pub use audio::{AudioConfig, CpalSource};
pub use config::{TranscriptionMode, VoiceSessionConfig};
pub use error::{VoiceError, VoiceResult};
pub use orchestrator::{VoiceBackends, VoiceEvent, VoiceListener, VoiceSession};
pub use state::{SessionPhase, SessionState};
pub use stt::{
    create_transcriber, select_route, ChannelRecognizer, HttpTranscriber, RecognitionEvent, RecognitionOptions,
    RecognitionRoute, RecognitionSubscription, RecognizerFeed, StreamingRecognizer, Transcriber,
    TranscriptionResult, UnavailableRecognizer,
};
pub use turn::{AutoSubmitPolicy, ClauseBoundary, FinalizeTrigger, PolicyConfig, PunctuationBoundary, UtterancePhase};
pub use vad::{VadConfig, VadDetector};
pub use voice_output::{
    select_voice, HttpTts, NoopSynthesizer, SpeechPlayback, SpeechRequest, SpeechSynthesizer, TtsBackend, VoiceInfo,
};
#[cfg(feature = "speaker")]
pub use voice_output::SpeakerSynthesizer;
