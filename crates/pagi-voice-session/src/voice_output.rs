//! **VoiceOutput**: spoken replies.
//!
//! [`SpeechPlayback`] keeps at most one utterance audible: a new `speak` cancels the
//! previous one first. The engine itself sits behind [`SpeechSynthesizer`]
//! (`NoopSynthesizer` when there is nothing to play on, `SpeakerSynthesizer` with
//! feature `speaker`, which plays any [`TtsBackend`] such as `HttpTts` through rodio).

use crate::config::VoiceSessionConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A voice the engine can speak with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceInfo {
    pub name: String,
    pub language: Option<String>,
    pub is_default: bool,
}

impl VoiceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            language: None,
            is_default: false,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }
}

/// What to say and how.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    pub text: String,
    /// `None` means the engine default.
    pub voice: Option<VoiceInfo>,
    /// 0.0–1.0
    pub volume: f32,
    pub language: String,
}

/// Text-to-speech engine with playback.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn voices(&self) -> Vec<VoiceInfo> {
        Vec::new()
    }

    /// Speak `request` and resolve once playback has finished.
    async fn speak(&self, request: SpeechRequest) -> VoiceResult<()>;

    /// Silence the current utterance immediately.
    fn cancel(&self) {}

    fn name(&self) -> &str {
        "synthesizer"
    }
}

/// Synthesizer for sessions without audio output: every utterance completes at once.
#[derive(Debug, Default)]
pub struct NoopSynthesizer;

#[async_trait]
impl SpeechSynthesizer for NoopSynthesizer {
    async fn speak(&self, request: SpeechRequest) -> VoiceResult<()> {
        debug!("NoopSynthesizer: {:?}", request.text);
        Ok(())
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// Pick a voice: the named custom voice, else the first voice matching the ranked
/// keywords (same language first), else the engine's default voice.
pub fn select_voice(
    voices: &[VoiceInfo],
    custom: Option<&str>,
    ranking: &[String],
    language: &str,
) -> Option<VoiceInfo> {
    if let Some(name) = custom {
        if let Some(v) = voices.iter().find(|v| v.name.eq_ignore_ascii_case(name)) {
            return Some(v.clone());
        }
        debug!("Custom voice {:?} not available, ranking instead", name);
    }

    let primary = language
        .split(['-', '_'])
        .next()
        .unwrap_or("")
        .to_lowercase();
    let same_language = |v: &VoiceInfo| match v.language.as_deref() {
        Some(l) => l.to_lowercase().starts_with(&primary),
        None => true,
    };

    for keyword in ranking {
        let keyword = keyword.to_lowercase();
        let mut matching = voices
            .iter()
            .filter(|v| v.name.to_lowercase().contains(&keyword));
        let first_any = matching.clone().next();
        if let Some(v) = matching.find(|v| same_language(v)).or(first_any) {
            return Some(v.clone());
        }
    }

    voices.iter().find(|v| v.is_default).cloned()
}

/// Completion callback: speech id and how playback ended.
pub type SpeechDone = Box<dyn FnOnce(u64, VoiceResult<()>) + Send>;

struct ActiveSpeech {
    id: u64,
    task: JoinHandle<()>,
}

/// Tracks the single audible utterance.
pub struct SpeechPlayback {
    synth: Arc<dyn SpeechSynthesizer>,
    current: Option<ActiveSpeech>,
    next_id: u64,
}

impl SpeechPlayback {
    pub fn new(synth: Arc<dyn SpeechSynthesizer>) -> Self {
        Self {
            synth,
            current: None,
            next_id: 1,
        }
    }

    pub fn synthesizer(&self) -> &Arc<dyn SpeechSynthesizer> {
        &self.synth
    }

    /// Id of the utterance currently playing.
    pub fn current_id(&self) -> Option<u64> {
        self.current.as_ref().map(|a| a.id)
    }

    pub fn is_speaking(&self) -> bool {
        self.current.is_some()
    }

    /// Build the request for `text` under `config` (voice selection and volume).
    pub fn request_for(&self, text: &str, config: &VoiceSessionConfig) -> SpeechRequest {
        let voices = self.synth.voices();
        SpeechRequest {
            text: text.to_string(),
            voice: select_voice(
                &voices,
                config.custom_voice.as_deref(),
                &config.preferred_voice_keywords,
                &config.language,
            ),
            volume: config.volume,
            language: config.language.clone(),
        }
    }

    /// Start speaking. Returns the new id and, if one was cut off, the cancelled id.
    /// `on_done` runs on the playback task when the synthesizer resolves; it does not run
    /// for utterances that are cancelled.
    pub fn speak(&mut self, request: SpeechRequest, on_done: SpeechDone) -> (u64, Option<u64>) {
        let cancelled = self.stop();
        let id = self.next_id;
        self.next_id += 1;

        info!("🔊 Speaking #{} ({} chars)", id, request.text.chars().count());
        let synth = Arc::clone(&self.synth);
        let task = tokio::spawn(async move {
            let result = synth.speak(request).await;
            on_done(id, result);
        });
        self.current = Some(ActiveSpeech { id, task });
        (id, cancelled)
    }

    /// Cancel playback. Returns the id that was cut off.
    pub fn stop(&mut self) -> Option<u64> {
        let active = self.current.take()?;
        self.synth.cancel();
        active.task.abort();
        info!("⏹️ Speech #{} stopped", active.id);
        Some(active.id)
    }

    /// Mark `id` as finished. False when it is not the current utterance (stale).
    pub fn finish(&mut self, id: u64) -> bool {
        match self.current {
            Some(ref a) if a.id == id => {
                self.current = None;
                true
            }
            _ => false,
        }
    }
}

impl Drop for SpeechPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

// -----------------------------------------------------------------------------
// TTS backends
// -----------------------------------------------------------------------------

/// Turns text into audio bytes (WAV/MP3).
#[async_trait]
pub trait TtsBackend: Send + Sync {
    /// Return an empty vec to skip playback.
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> VoiceResult<Vec<u8>>;

    fn voices(&self) -> Vec<VoiceInfo> {
        Vec::new()
    }
}

const OPENAI_VOICES: &[&str] = &["alloy", "echo", "fable", "onyx", "nova", "shimmer"];

/// OpenAI-compatible TTS API (OpenAI, OpenRouter, etc.).
#[derive(Debug, Clone)]
pub struct HttpTts {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    pub api_key: String,
    /// tts-1 (fast) or tts-1-hd (higher quality).
    pub model: String,
    /// Used when the request does not name a voice.
    pub default_voice: String,
    client: reqwest::Client,
}

impl HttpTts {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            default_voice: "shimmer".to_string(),
            client,
        })
    }

    /// Build from environment: TTS_API_URL, TTS_API_KEY (or PAGI_LLM_API_KEY / OPENROUTER_API_KEY), TTS_MODEL.
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = std::env::var("TTS_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("TTS_API_KEY")
            .or_else(|_| std::env::var("PAGI_LLM_API_KEY"))
            .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
            .map_err(|_| VoiceError::Config("TTS requires TTS_API_KEY, PAGI_LLM_API_KEY, or OPENROUTER_API_KEY".to_string()))?;
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        Self::new(base_url, api_key, model)
    }

    pub fn with_default_voice(mut self, voice: impl Into<String>) -> Self {
        self.default_voice = voice.into();
        self
    }
}

#[async_trait]
impl TtsBackend for HttpTts {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice.unwrap_or(&self.default_voice),
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().await.map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn voices(&self) -> Vec<VoiceInfo> {
        OPENAI_VOICES
            .iter()
            .map(|name| {
                let v = VoiceInfo::new(*name);
                if *name == self.default_voice {
                    v.as_default()
                } else {
                    v
                }
            })
            .collect()
    }
}

#[cfg(feature = "speaker")]
pub use speaker::SpeakerSynthesizer;

#[cfg(feature = "speaker")]
mod speaker {
    use super::*;
    use rodio::{OutputStream, Sink, Source};
    use std::io::Cursor;
    use std::sync::mpsc as std_mpsc;
    use std::thread;

    /// Plays a [`TtsBackend`] through the default output device.
    pub struct SpeakerSynthesizer {
        backend: Arc<dyn TtsBackend>,
        sink: Arc<Sink>,
        // Dropping this lets the output thread close the stream
        _keepalive: std_mpsc::Sender<()>,
    }

    impl SpeakerSynthesizer {
        pub fn new(backend: Arc<dyn TtsBackend>) -> VoiceResult<Self> {
            let (sink_tx, sink_rx) = std_mpsc::channel::<VoiceResult<Arc<Sink>>>();
            let (keep_tx, keep_rx) = std_mpsc::channel::<()>();

            // OutputStream is !Send; it lives on its own thread
            thread::spawn(move || {
                let (stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = sink_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                };
                match Sink::try_new(&handle) {
                    Ok(sink) => {
                        let _ = sink_tx.send(Ok(Arc::new(sink)));
                    }
                    Err(e) => {
                        let _ = sink_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                }
                let _ = keep_rx.recv();
                drop(stream);
            });

            let sink = sink_rx
                .recv()
                .map_err(|_| VoiceError::Playback("output thread exited".to_string()))??;
            info!("VoiceOutput: sink ready for TTS playback");
            Ok(Self {
                backend,
                sink,
                _keepalive: keep_tx,
            })
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for SpeakerSynthesizer {
        fn voices(&self) -> Vec<VoiceInfo> {
            self.backend.voices()
        }

        async fn speak(&self, request: SpeechRequest) -> VoiceResult<()> {
            let voice = request.voice.as_ref().map(|v| v.name.as_str());
            let bytes = self
                .backend
                .synthesize(&request.text, voice)
                .await
                .map_err(|e| VoiceError::Playback(e.to_string()))?;
            if bytes.is_empty() {
                return Ok(());
            }
            let source = rodio::Decoder::new(Cursor::new(bytes))
                .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
            self.sink.set_volume(request.volume);
            self.sink.append(source.convert_samples::<f32>());

            let sink = Arc::clone(&self.sink);
            tokio::task::spawn_blocking(move || sink.sleep_until_end())
                .await
                .map_err(|e| VoiceError::Playback(e.to_string()))
        }

        fn cancel(&self) {
            self.sink.stop();
        }

        fn name(&self) -> &str {
            "speaker"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ranking() -> Vec<String> {
        VoiceSessionConfig::default().preferred_voice_keywords
    }

    #[test]
    fn custom_voice_wins() {
        let voices = vec![
            VoiceInfo::new("Samantha (Enhanced)").with_language("en-US"),
            VoiceInfo::new("Daniel").with_language("en-GB"),
        ];
        let v = select_voice(&voices, Some("daniel"), &ranking(), "en-US").unwrap();
        assert_eq!(v.name, "Daniel");
    }

    #[test]
    fn ranked_keywords_then_default() {
        let voices = vec![
            VoiceInfo::new("Basic").as_default(),
            VoiceInfo::new("Ava (Premium)").with_language("en-US"),
            VoiceInfo::new("Thomas (Natural)").with_language("fr-FR"),
            VoiceInfo::new("Jenny Natural").with_language("en-US"),
        ];
        // "enhanced" absent, "natural" present: same-language match preferred
        let v = select_voice(&voices, Some("Missing"), &ranking(), "en-US").unwrap();
        assert_eq!(v.name, "Jenny Natural");

        let plain = vec![VoiceInfo::new("A"), VoiceInfo::new("B").as_default()];
        assert_eq!(select_voice(&plain, None, &ranking(), "en-US").unwrap().name, "B");
        assert!(select_voice(&[], None, &ranking(), "en-US").is_none());
    }

    struct Slow {
        cancels: Mutex<usize>,
    }

    #[async_trait]
    impl SpeechSynthesizer for Slow {
        async fn speak(&self, _request: SpeechRequest) -> VoiceResult<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        fn cancel(&self) {
            *self.cancels.lock().unwrap() += 1;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn new_speech_cancels_previous() {
        let synth = Arc::new(Slow {
            cancels: Mutex::new(0),
        });
        let mut playback = SpeechPlayback::new(synth.clone());
        let config = VoiceSessionConfig::default();
        let done = Arc::new(Mutex::new(Vec::new()));

        let d = Arc::clone(&done);
        let (first, cut) = playback.speak(
            playback.request_for("first", &config),
            Box::new(move |id: u64, r: VoiceResult<()>| d.lock().unwrap().push((id, r.is_ok()))),
        );
        assert!(cut.is_none());

        let d = Arc::clone(&done);
        let (second, cut) = playback.speak(
            playback.request_for("second", &config),
            Box::new(move |id: u64, r: VoiceResult<()>| d.lock().unwrap().push((id, r.is_ok()))),
        );
        assert_eq!(cut, Some(first));
        assert_eq!(*synth.cancels.lock().unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        // only the surviving utterance reports completion
        assert_eq!(*done.lock().unwrap(), vec![(second, true)]);
        assert!(playback.finish(second));
        assert!(!playback.finish(first));
        assert!(!playback.is_speaking());
    }

    #[tokio::test]
    async fn request_applies_volume_and_voice() {
        let playback = SpeechPlayback::new(Arc::new(NoopSynthesizer));
        let config = VoiceSessionConfig {
            volume: 0.3,
            ..Default::default()
        };
        let req = playback.request_for("hi", &config);
        assert_eq!(req.volume, 0.3);
        assert!(req.voice.is_none());
        assert_eq!(req.language, "en-US");
    }

    #[tokio::test]
    async fn http_tts_posts_openai_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .and(body_partial_json(serde_json::json!({ "input": "hello", "voice": "nova" })))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .expect(1)
            .mount(&server)
            .await;

        let tts = HttpTts::new(format!("{}/v1", server.uri()), "key", "tts-1").unwrap();
        let bytes = tts.synthesize(" hello ", Some("nova")).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert!(tts.synthesize("   ", None).await.unwrap().is_empty());
        assert!(tts.voices().iter().any(|v| v.name == "shimmer" && v.is_default));
    }
}
