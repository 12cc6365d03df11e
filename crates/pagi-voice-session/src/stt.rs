//! **Speech-to-Text (STT)**: two interchangeable ways to turn speech into text.
//!
//! - [`StreamingRecognizer`]: push-based engine running next to the session; emits interim
//!   and final results through a subscription the session owns.
//! - [`Transcriber`]: request/response upload of one recorded [`AudioPayload`]
//!   (`HttpTranscriber` speaks the `POST <endpoint>` multipart contract).
//!
//! [`select_route`] decides which one a session uses.

use crate::audio::AudioPayload;
use crate::config::{TranscriptionMode, VoiceSessionConfig};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One recognized span with its engine confidence, if reported.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSegment {
    pub text: String,
    pub confidence: Option<f32>,
}

/// Text recognized from one recording.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionResult {
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
}

impl TranscriptionResult {
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            segments: vec![TranscriptSegment {
                text: text.clone(),
                confidence: None,
            }],
            text,
        }
    }

    /// Lowest reported segment confidence.
    pub fn confidence(&self) -> Option<f32> {
        self.segments
            .iter()
            .filter_map(|s| s.confidence)
            .fold(None, |acc: Option<f32>, c| Some(acc.map_or(c, |a| a.min(c))))
    }
}

/// Request/response transcription of a finished recording.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, payload: &AudioPayload) -> VoiceResult<TranscriptionResult>;
}

#[derive(Debug, Deserialize)]
struct TranscriptBody {
    transcript: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Uploads the recording as multipart field `audio` and expects `{ "transcript": "..." }`.
#[derive(Debug, Clone)]
pub struct HttpTranscriber {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpTranscriber {
    pub fn new(endpoint: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key: None,
            client,
        })
    }

    /// Build from environment: `PAGI_VOICE_SERVER_ENDPOINT` and optional `PAGI_VOICE_STT_API_KEY`.
    pub fn from_env() -> VoiceResult<Self> {
        let endpoint = std::env::var("PAGI_VOICE_SERVER_ENDPOINT")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| VoiceError::Config("PAGI_VOICE_SERVER_ENDPOINT not set".to_string()))?;
        let transcriber = Self::new(endpoint)?;
        Ok(match std::env::var("PAGI_VOICE_STT_API_KEY") {
            Ok(key) if !key.trim().is_empty() => transcriber.with_api_key(key.trim()),
            _ => transcriber,
        })
    }

    /// Send `Authorization: Bearer <key>` with every upload.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, payload: &AudioPayload) -> VoiceResult<TranscriptionResult> {
        if payload.is_empty() {
            return Err(VoiceError::EmptyRecording);
        }
        let part = reqwest::multipart::Part::bytes(payload.bytes.clone())
            .file_name(payload.file_name())
            .mime_str(&payload.mime_type)
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("audio", part);

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        debug!("STT: uploading {} bytes ({}) to {}", payload.bytes.len(), payload.mime_type, self.endpoint);
        let res = request.send().await?;

        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(VoiceError::ServerError(format!("status {}: {}", status.as_u16(), body)));
        }
        let parsed: TranscriptBody = serde_json::from_str(&body)
            .map_err(|e| VoiceError::MalformedResponse(e.to_string()))?;
        let text = parsed.transcript.trim().to_string();
        Ok(TranscriptionResult {
            segments: vec![TranscriptSegment {
                text: text.clone(),
                confidence: parsed.confidence,
            }],
            text,
        })
    }
}

/// Build the upload client for a config, if it names an endpoint.
pub fn create_transcriber(config: &VoiceSessionConfig) -> VoiceResult<Option<Arc<dyn Transcriber>>> {
    match config.server_endpoint.as_deref() {
        Some(endpoint) => Ok(Some(Arc::new(HttpTranscriber::new(endpoint)?))),
        None => Ok(None),
    }
}

// -----------------------------------------------------------------------------
// Streaming recognition
// -----------------------------------------------------------------------------

/// What a streaming engine reports.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// Provisional text for the current utterance; may be revised.
    Interim { text: String },
    /// Authoritative text for a segment.
    Final { text: String, confidence: Option<f32> },
    /// The engine heard nothing before its own timeout. Not fatal.
    NoSpeech,
    /// The engine stopped on its own.
    Ended,
    Error(VoiceError),
}

/// Callback a recognizer pushes events into.
pub type RecognitionSink = Arc<dyn Fn(RecognitionEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionOptions {
    pub language: String,
    pub continuous: bool,
    pub interim_results: bool,
}

/// Push-based speech recognizer.
pub trait StreamingRecognizer: Send + Sync {
    /// Whether the engine can run in this environment.
    fn is_available(&self) -> bool;

    /// Start recognizing; events go to `sink` until the subscription is stopped.
    fn start(&self, options: RecognitionOptions, sink: RecognitionSink) -> VoiceResult<Box<dyn RecognitionSubscription>>;

    fn name(&self) -> &str {
        "recognizer"
    }
}

/// Live recognition. After `stop()` returns the sink is never called again.
pub trait RecognitionSubscription: Send {
    fn stop(&mut self);
}

/// Recognizer for environments without a streaming engine.
#[derive(Debug, Default)]
pub struct UnavailableRecognizer;

impl StreamingRecognizer for UnavailableRecognizer {
    fn is_available(&self) -> bool {
        false
    }

    fn start(&self, _options: RecognitionOptions, _sink: RecognitionSink) -> VoiceResult<Box<dyn RecognitionSubscription>> {
        Err(VoiceError::CapabilityMissing("no streaming recognizer available".to_string()))
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

struct FeedShared {
    current: Mutex<Option<(u64, RecognitionSink)>>,
    last_options: Mutex<Option<RecognitionOptions>>,
    next_id: AtomicU64,
    starts: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Recognizer bridged to an external engine through a [`RecognizerFeed`].
///
/// The embedding application runs its own engine and pushes results into the feed;
/// whichever session currently holds the subscription receives them.
pub struct ChannelRecognizer {
    shared: Arc<FeedShared>,
}

/// Producer side of a [`ChannelRecognizer`].
#[derive(Clone)]
pub struct RecognizerFeed {
    shared: Arc<FeedShared>,
}

impl ChannelRecognizer {
    pub fn new() -> (Self, RecognizerFeed) {
        let shared = Arc::new(FeedShared {
            current: Mutex::new(None),
            last_options: Mutex::new(None),
            next_id: AtomicU64::new(1),
            starts: AtomicUsize::new(0),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            RecognizerFeed { shared },
        )
    }
}

impl StreamingRecognizer for ChannelRecognizer {
    fn is_available(&self) -> bool {
        true
    }

    fn start(&self, options: RecognitionOptions, sink: RecognitionSink) -> VoiceResult<Box<dyn RecognitionSubscription>> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let mut current = lock(&self.shared.current);
        if current.is_some() {
            warn!("ChannelRecognizer: replacing an active subscription");
        }
        *current = Some((id, sink));
        *lock(&self.shared.last_options) = Some(options);
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ChannelSubscription {
            shared: Arc::clone(&self.shared),
            id,
            stopped: false,
        }))
    }

    fn name(&self) -> &str {
        "channel"
    }
}

struct ChannelSubscription {
    shared: Arc<FeedShared>,
    id: u64,
    stopped: bool,
}

impl RecognitionSubscription for ChannelSubscription {
    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let mut current = lock(&self.shared.current);
        if matches!(current.as_ref(), Some((id, _)) if *id == self.id) {
            *current = None;
        }
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}

impl RecognizerFeed {
    /// Deliver an event to the active subscription. Returns false when nobody is listening.
    pub fn push(&self, event: RecognitionEvent) -> bool {
        let sink = lock(&self.shared.current).as_ref().map(|(_, s)| Arc::clone(s));
        match sink {
            Some(sink) => {
                sink(event);
                true
            }
            None => {
                debug!("RecognizerFeed: dropped {:?} (no subscriber)", event);
                false
            }
        }
    }

    pub fn interim(&self, text: impl Into<String>) -> bool {
        self.push(RecognitionEvent::Interim { text: text.into() })
    }

    pub fn final_result(&self, text: impl Into<String>, confidence: f32) -> bool {
        self.push(RecognitionEvent::Final {
            text: text.into(),
            confidence: Some(confidence),
        })
    }

    pub fn end(&self) -> bool {
        self.push(RecognitionEvent::Ended)
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.shared.current).is_some()
    }

    /// How many times a session started recognition on this feed.
    pub fn start_count(&self) -> usize {
        self.shared.starts.load(Ordering::SeqCst)
    }

    /// Options passed on the most recent start.
    pub fn last_options(&self) -> Option<RecognitionOptions> {
        lock(&self.shared.last_options).clone()
    }
}

/// Which path turns speech into text for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionRoute {
    /// Streaming recognizer.
    Native,
    /// Record, then upload.
    Server,
}

/// Pick the route for `config`. Local mode falls back to the server when the streaming
/// engine is missing; with no fallback either, the capability is reported missing.
pub fn select_route(config: &VoiceSessionConfig, native_available: bool) -> VoiceResult<RecognitionRoute> {
    let has_server = config.server_endpoint.is_some();
    match config.transcription_mode {
        TranscriptionMode::Local if native_available => Ok(RecognitionRoute::Native),
        TranscriptionMode::Local if has_server => {
            info!("STT: streaming recognizer unavailable, falling back to server upload");
            Ok(RecognitionRoute::Server)
        }
        TranscriptionMode::Local => Err(VoiceError::CapabilityMissing(
            "speech recognition is not available and no transcription server is configured".to_string(),
        )),
        TranscriptionMode::Server if has_server => Ok(RecognitionRoute::Server),
        TranscriptionMode::Server => Err(VoiceError::CapabilityMissing(
            "server transcription selected but no endpoint is configured".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn wav_payload() -> AudioPayload {
        AudioPayload {
            bytes: crate::audio::encode_wav(&[0u8; 32], 16000, 1),
            mime_type: "audio/wav".to_string(),
            captured_at: Utc::now(),
            duration: None,
        }
    }

    #[tokio::test]
    async fn uploads_and_reads_transcript() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "transcript": "  turn on the lights ",
                "confidence": 0.9
            })))
            .expect(1)
            .mount(&server)
            .await;

        let stt = HttpTranscriber::new(format!("{}/transcribe", server.uri())).unwrap();
        let result = stt.transcribe(&wav_payload()).await.unwrap();
        assert_eq!(result.text, "turn on the lights");
        assert_eq!(result.confidence(), Some(0.9));
    }

    #[tokio::test]
    async fn non_success_is_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;
        let stt = HttpTranscriber::new(server.uri()).unwrap();
        let err = stt.transcribe(&wav_payload()).await.unwrap_err();
        assert!(matches!(err, VoiceError::ServerError(ref m) if m.contains("503")));
    }

    #[tokio::test]
    async fn missing_transcript_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "text": "hi" })))
            .mount(&server)
            .await;
        let stt = HttpTranscriber::new(server.uri()).unwrap();
        let err = stt.transcribe(&wav_payload()).await.unwrap_err();
        assert!(matches!(err, VoiceError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn empty_payload_never_hits_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let stt = HttpTranscriber::new(server.uri()).unwrap();
        let mut payload = wav_payload();
        payload.bytes.clear();
        tokio_test::assert_err!(stt.transcribe(&payload).await);
    }

    #[test]
    fn feed_delivers_only_to_active_subscription() {
        let (recognizer, feed) = ChannelRecognizer::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: RecognitionSink = Arc::new(move |e| sink_seen.lock().unwrap().push(e));
        let options = RecognitionOptions {
            language: "en-US".into(),
            continuous: true,
            interim_results: true,
        };

        assert!(!feed.interim("nobody"));
        let mut sub = recognizer.start(options.clone(), sink).unwrap();
        assert!(feed.interim("hello"));
        sub.stop();
        assert!(!feed.interim("late"));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![RecognitionEvent::Interim { text: "hello".into() }]
        );
        assert_eq!(feed.start_count(), 1);
        assert_eq!(feed.last_options(), Some(options));
    }

    #[test]
    fn stale_subscription_does_not_clear_newer_one() {
        let (recognizer, feed) = ChannelRecognizer::new();
        let sink: RecognitionSink = Arc::new(|_| {});
        let options = RecognitionOptions {
            language: "en-US".into(),
            continuous: false,
            interim_results: true,
        };
        let mut first = recognizer.start(options.clone(), Arc::clone(&sink)).unwrap();
        let _second = recognizer.start(options, sink).unwrap();
        first.stop();
        assert!(feed.is_subscribed());
    }

    #[test]
    fn route_selection() {
        let mut c = VoiceSessionConfig::default();
        assert_eq!(select_route(&c, true).unwrap(), RecognitionRoute::Native);
        assert!(matches!(select_route(&c, false), Err(VoiceError::CapabilityMissing(_))));
        c.server_endpoint = Some("http://stt".into());
        assert_eq!(select_route(&c, false).unwrap(), RecognitionRoute::Server);
        c.transcription_mode = TranscriptionMode::Server;
        assert_eq!(select_route(&c, true).unwrap(), RecognitionRoute::Server);
        c.server_endpoint = None;
        assert!(select_route(&c, true).is_err());
    }

    #[test]
    fn unavailable_recognizer_refuses() {
        let r = UnavailableRecognizer;
        assert!(!r.is_available());
        let sink: RecognitionSink = Arc::new(|_| {});
        let options = RecognitionOptions {
            language: "en-US".into(),
            continuous: false,
            interim_results: true,
        };
        assert!(r.start(options, sink).is_err());
    }
}
