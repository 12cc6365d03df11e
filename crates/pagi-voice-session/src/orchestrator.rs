//! Voice Session - the coordination layer
//!
//! One tokio task owns every piece of session state: the recognizer subscription,
//! the open capture, the in-flight upload, the auto-submit policy and playback.
//! [`VoiceSession`] is a cheap handle that sends commands to it and waits for the ack,
//! so when an operation returns its transition has already happened.
//!
//! Anything asynchronous (recognizer callbacks, VAD activity, transcription results,
//! playback completion) comes back as an event tagged with the epoch or speech id it
//! was started under. Every stop and reconfigure bumps the epoch, which is what keeps
//! stale results from landing in a newer utterance.

use crate::audio::{default_source, ActivityCallback, AudioCapture, AudioSource, CaptureHandle};
use crate::config::VoiceSessionConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::state::SessionState;
use crate::stt::{
    create_transcriber, select_route, RecognitionEvent, RecognitionOptions, RecognitionRoute, RecognitionSink,
    RecognitionSubscription, StreamingRecognizer, Transcriber, TranscriptionResult, UnavailableRecognizer,
};
use crate::turn::{
    boundary_for, is_confident, AutoSubmitPolicy, ClauseBoundary, Finalization, PolicyConfig, PunctuationBoundary,
};
use crate::vad::SpeechActivity;
use crate::voice_output::{NoopSynthesizer, SpeechPlayback, SpeechSynthesizer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Caller-facing notifications. Called synchronously from the session task; keep them quick.
pub trait VoiceListener: Send + Sync {
    /// Exactly once per finalized utterance.
    fn on_speech_result(&self, text: &str);

    /// Provisional text for the current utterance. Never authoritative.
    fn on_interim_result(&self, _text: &str) {}

    /// The single side channel for every failure.
    fn on_error(&self, _error: &VoiceError) {}

    fn on_speech_started(&self, _id: u64) {}

    /// Once per started utterance, whether it completed, failed or was cut off.
    fn on_speech_ended(&self, _id: u64) {}
}

/// Listener callbacks as values, for callers that prefer a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    SpeechResult(String),
    InterimResult(String),
    Error(VoiceError),
    SpeechStarted(u64),
    SpeechEnded(u64),
}

impl VoiceListener for mpsc::UnboundedSender<VoiceEvent> {
    fn on_speech_result(&self, text: &str) {
        let _ = self.send(VoiceEvent::SpeechResult(text.to_string()));
    }

    fn on_interim_result(&self, text: &str) {
        let _ = self.send(VoiceEvent::InterimResult(text.to_string()));
    }

    fn on_error(&self, error: &VoiceError) {
        let _ = self.send(VoiceEvent::Error(error.clone()));
    }

    fn on_speech_started(&self, id: u64) {
        let _ = self.send(VoiceEvent::SpeechStarted(id));
    }

    fn on_speech_ended(&self, id: u64) {
        let _ = self.send(VoiceEvent::SpeechEnded(id));
    }
}

/// The engines a session runs on.
#[derive(Clone)]
pub struct VoiceBackends {
    pub recognizer: Arc<dyn StreamingRecognizer>,
    /// Overrides the HTTP client built from `server_endpoint`.
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub audio: Arc<dyn AudioSource>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

impl Default for VoiceBackends {
    fn default() -> Self {
        Self {
            recognizer: Arc::new(UnavailableRecognizer),
            transcriber: None,
            audio: default_source(),
            synthesizer: Arc::new(NoopSynthesizer),
        }
    }
}

impl VoiceBackends {
    pub fn with_recognizer(mut self, recognizer: Arc<dyn StreamingRecognizer>) -> Self {
        self.recognizer = recognizer;
        self
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn with_audio(mut self, audio: Arc<dyn AudioSource>) -> Self {
        self.audio = audio;
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }
}

#[derive(Debug)]
enum Command {
    Configure(VoiceSessionConfig),
    StartListening,
    StopListening,
    StartRecording,
    StopRecording,
    Speak(String),
    StopSpeaking,
    Shutdown,
}

type Envelope = (Command, oneshot::Sender<()>);

#[derive(Debug)]
enum Event {
    Recognition { epoch: u64, event: RecognitionEvent },
    Activity { epoch: u64 },
    Transcribed { epoch: u64, result: VoiceResult<TranscriptionResult> },
    SpeechFinished { id: u64, result: VoiceResult<()> },
}

/// Handle to a running voice session.
///
/// Dropping the last handle (or calling [`VoiceSession::shutdown`]) tears the session
/// down: capture released, recognition unsubscribed, playback cancelled.
pub struct VoiceSession {
    commands: mpsc::UnboundedSender<Envelope>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<()>,
}

impl VoiceSession {
    /// Start the session task and apply `config`. Must be called inside a tokio runtime.
    pub fn spawn(config: VoiceSessionConfig, backends: VoiceBackends, listener: Arc<dyn VoiceListener>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::default());

        let controller = Controller::new(backends, listener, state_tx, event_tx);
        let task = tokio::spawn(controller.run(config, cmd_rx, event_rx));

        Self {
            commands: cmd_tx,
            state: state_rx,
            task,
        }
    }

    async fn send(&self, command: Command) -> VoiceResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send((command, ack_tx))
            .map_err(|_| VoiceError::SessionClosed)?;
        ack_rx.await.map_err(|_| VoiceError::SessionClosed)
    }

    /// Replace the config. `enabled = false` stops listening, recording and speaking
    /// before this returns.
    pub async fn configure(&self, config: VoiceSessionConfig) -> VoiceResult<()> {
        self.send(Command::Configure(config)).await
    }

    /// No-op when already listening, disabled, or when recognition is unavailable.
    pub async fn start_listening(&self) -> VoiceResult<()> {
        self.send(Command::StartListening).await
    }

    /// Abandons the current utterance. No-op when not listening.
    pub async fn stop_listening(&self) -> VoiceResult<()> {
        self.send(Command::StopListening).await
    }

    /// Push-to-record: capture audio until [`VoiceSession::stop_recording`], then upload it.
    pub async fn start_recording(&self) -> VoiceResult<()> {
        self.send(Command::StartRecording).await
    }

    /// Submit the current recording for transcription. No-op when not recording.
    pub async fn stop_recording(&self) -> VoiceResult<()> {
        self.send(Command::StopRecording).await
    }

    /// Speak `text`, cutting off whatever is playing.
    pub async fn speak(&self, text: impl Into<String>) -> VoiceResult<()> {
        self.send(Command::Speak(text.into())).await
    }

    pub async fn stop_speaking(&self) -> VoiceResult<()> {
        self.send(Command::StopSpeaking).await
    }

    /// Current state snapshot.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver that is notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Tear everything down and wait for the session task to exit.
    pub async fn shutdown(self) -> VoiceResult<()> {
        let result = self.send(Command::Shutdown).await;
        let _ = self.task.await;
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureMode {
    /// Server-route listening; may stop itself on silence.
    HandsFree,
    PushToRecord,
}

/// The open recording and what it is for.
struct ActiveCapture {
    handle: CaptureHandle,
    mode: CaptureMode,
    opened_at: Instant,
    voiced: bool,
}

impl ActiveCapture {
    /// When a hands-free recording that heard nothing should drop its audio and start over.
    fn idle_deadline(&self, silence: Duration) -> Option<Instant> {
        let watched = self.mode == CaptureMode::HandsFree && self.handle.reports_activity();
        (watched && !self.voiced && !silence.is_zero()).then(|| self.opened_at + silence)
    }

    fn limit_deadline(&self, limit: Option<Duration>) -> Option<Instant> {
        limit.map(|limit| self.opened_at + limit)
    }
}

fn earliest(deadlines: impl IntoIterator<Item = Option<Instant>>) -> Option<Instant> {
    deadlines.into_iter().flatten().min()
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

struct Controller {
    config: VoiceSessionConfig,
    backends: VoiceBackends,
    transcriber: Option<Arc<dyn Transcriber>>,
    listener: Arc<dyn VoiceListener>,

    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    events: mpsc::UnboundedSender<Event>,

    epoch: u64,
    policy: AutoSubmitPolicy,
    recognition: Option<Box<dyn RecognitionSubscription>>,
    capture: Option<ActiveCapture>,
    transcription: Option<JoinHandle<()>>,
    // Hands-free server capture: listen again once the upload is back
    resume_after_transcription: bool,
    playback: SpeechPlayback,
    restart_at: Option<Instant>,
    capability_missing: bool,
}

impl Controller {
    fn new(
        backends: VoiceBackends,
        listener: Arc<dyn VoiceListener>,
        state_tx: watch::Sender<SessionState>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let config = VoiceSessionConfig::disabled();
        let policy = AutoSubmitPolicy::new(PolicyConfig::from(&config), Arc::new(PunctuationBoundary));
        let playback = SpeechPlayback::new(Arc::clone(&backends.synthesizer));
        Self {
            config,
            backends,
            transcriber: None,
            listener,
            state: SessionState::default(),
            state_tx,
            events,
            epoch: 0,
            policy,
            recognition: None,
            capture: None,
            transcription: None,
            resume_after_transcription: false,
            playback,
            restart_at: None,
            capability_missing: false,
        }
    }

    async fn run(
        mut self,
        initial: VoiceSessionConfig,
        mut commands: mpsc::UnboundedReceiver<Envelope>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        info!("🎭 Voice session started");
        self.configure(initial);

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                command = commands.recv() => {
                    let Some((command, ack)) = command else { break };
                    let keep_running = self.handle_command(command);
                    let _ = ack.send(());
                    if !keep_running {
                        break;
                    }
                }
                Some(event) = events.recv() => self.handle_event(event),
                _ = wait_until(deadline) => self.on_deadline(Instant::now()),
            }
        }

        self.teardown();
        info!("🛑 Voice session closed");
    }

    fn handle_command(&mut self, command: Command) -> bool {
        debug!("Voice command: {:?}", command);
        match command {
            Command::Configure(config) => self.configure(config),
            Command::StartListening => self.start_listening(),
            Command::StopListening => self.stop_listening(),
            Command::StartRecording => self.start_recording(),
            Command::StopRecording => self.stop_recording(),
            Command::Speak(text) => self.speak(text),
            Command::StopSpeaking => self.stop_speaking(),
            Command::Shutdown => {
                self.teardown();
                return false;
            }
        }
        true
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    fn next_deadline(&self) -> Option<Instant> {
        let (idle, limit) = self.capture_deadlines();
        earliest([self.policy.next_deadline(), self.restart_at, idle, limit])
    }

    /// (discard idle audio, recording limit) for the open capture.
    fn capture_deadlines(&self) -> (Option<Instant>, Option<Instant>) {
        match &self.capture {
            Some(capture) => (
                capture.idle_deadline(self.config.silence_timeout()),
                capture.limit_deadline(self.config.max_recording()),
            ),
            None => (None, None),
        }
    }

    // -------------------------------------------------------------------------
    // Configuration and teardown
    // -------------------------------------------------------------------------

    fn configure(&mut self, config: VoiceSessionConfig) {
        let config = config.normalized();
        if !config.enabled {
            if self.state.enabled {
                info!("🔕 Voice disabled");
            }
            self.teardown();
            self.config = config;
            return;
        }

        let was_enabled = self.state.enabled;
        let was_listening = self.state.is_listening;
        self.halt_input();
        self.capability_missing = false;

        let boundary: Arc<dyn ClauseBoundary> = match boundary_for(&config) {
            Ok(b) => b,
            Err(e) => {
                warn!("Auto-send pattern rejected, using punctuation: {}", e);
                self.listener.on_error(&e);
                Arc::new(PunctuationBoundary)
            }
        };
        self.policy.reconfigure(PolicyConfig::from(&config), boundary);

        self.transcriber = match &self.backends.transcriber {
            Some(t) => Some(Arc::clone(t)),
            None => match create_transcriber(&config) {
                Ok(t) => t,
                Err(e) => {
                    warn!("Transcription client unavailable: {}", e);
                    self.listener.on_error(&e);
                    None
                }
            },
        };

        info!(
            "⚙️ Voice configured (hands-free: {}, mode: {:?}, silence: {}ms, auto-send: {})",
            config.continuous_listening, config.transcription_mode, config.silence_timeout_ms, config.auto_send_threshold
        );
        self.config = config;
        self.state.enabled = true;
        self.publish();

        if was_listening || (!was_enabled && self.config.continuous_listening) {
            self.start_listening();
        }
    }

    /// Stop everything on the input side: recognition, capture, upload, timers.
    fn halt_input(&mut self) {
        self.epoch += 1;
        self.policy.abandon();
        if let Some(mut subscription) = self.recognition.take() {
            subscription.stop();
        }
        self.capture = None;
        if let Some(task) = self.transcription.take() {
            task.abort();
        }
        self.resume_after_transcription = false;
        self.restart_at = None;

        self.state.is_listening = false;
        self.state.is_recording = false;
        self.state.is_processing = false;
        self.state.pending_transcript.clear();
    }

    fn teardown(&mut self) {
        self.halt_input();
        if let Some(id) = self.playback.stop() {
            self.listener.on_speech_ended(id);
        }
        self.state = SessionState::default();
        self.publish();
    }

    fn report_capability(&mut self, error: VoiceError) {
        self.publish();
        if self.capability_missing {
            return;
        }
        self.capability_missing = true;
        warn!("🚫 Voice input unavailable: {}", error);
        self.listener.on_error(&error);
    }

    fn report_start_failure(&mut self, error: VoiceError) {
        self.state.is_listening = false;
        self.state.is_recording = false;
        match error {
            VoiceError::CapabilityMissing(_) => self.report_capability(error),
            _ => {
                warn!("Could not start voice input: {}", error);
                self.publish();
                self.listener.on_error(&error);
            }
        }
    }

    fn startable(&self, what: &str) -> bool {
        if !self.state.enabled {
            debug!("{} ignored: voice disabled", what);
            return false;
        }
        if self.capability_missing {
            debug!("{} ignored: voice input unavailable", what);
            return false;
        }
        true
    }

    // -------------------------------------------------------------------------
    // Listening
    // -------------------------------------------------------------------------

    fn start_listening(&mut self) {
        if !self.startable("start_listening") {
            return;
        }
        if self.state.is_listening || self.state.is_recording {
            debug!("start_listening ignored: already capturing");
            return;
        }
        self.restart_at = None;

        match select_route(&self.config, self.backends.recognizer.is_available()) {
            Ok(RecognitionRoute::Native) => self.start_recognition(),
            Ok(RecognitionRoute::Server) if self.state.is_processing => {
                debug!("start_listening deferred: upload in flight");
                self.resume_after_transcription = true;
            }
            Ok(RecognitionRoute::Server) => self.start_capture(CaptureMode::HandsFree),
            Err(e) => self.report_capability(e),
        }
    }

    fn stop_listening(&mut self) {
        self.restart_at = None;
        self.resume_after_transcription = false;
        if !self.state.is_listening && !self.state.is_processing {
            debug!("stop_listening ignored: not listening");
            return;
        }

        self.epoch += 1;
        self.policy.abandon();
        self.close_recognition();
        if self.capture.as_ref().is_some_and(|c| c.mode == CaptureMode::HandsFree) {
            self.capture = None;
            self.state.is_recording = false;
        }
        if let Some(task) = self.transcription.take() {
            task.abort();
        }
        self.state.is_listening = false;
        self.state.is_processing = false;
        self.state.pending_transcript.clear();
        self.publish();
        info!("⏹️ Listening stopped");
    }

    fn start_recognition(&mut self) {
        self.policy.begin();
        let options = RecognitionOptions {
            language: self.config.language.clone(),
            continuous: self.config.continuous_listening,
            interim_results: true,
        };
        let tx = self.events.clone();
        let epoch = self.epoch;
        let sink: RecognitionSink = Arc::new(move |event| {
            let _ = tx.send(Event::Recognition { epoch, event });
        });

        match self.backends.recognizer.start(options, sink) {
            Ok(subscription) => {
                self.recognition = Some(subscription);
                self.state.is_listening = true;
                self.state.pending_transcript.clear();
                self.publish();
                info!("🎤 Listening ({})", self.backends.recognizer.name());
            }
            Err(e) => self.report_start_failure(e),
        }
    }

    /// Unsubscribe and invalidate anything the old subscription still has queued.
    fn close_recognition(&mut self) {
        if let Some(mut subscription) = self.recognition.take() {
            subscription.stop();
            self.epoch += 1;
        }
        self.state.is_listening = false;
    }

    fn restart_recognition(&mut self) {
        self.close_recognition();
        self.start_recognition();
    }

    fn on_recognition(&mut self, event: RecognitionEvent) {
        let now = Instant::now();
        match event {
            RecognitionEvent::Interim { text } => {
                self.policy.observe_interim(&text, now);
                let pending = self.policy.pending();
                self.state.transcript = pending.clone();
                self.state.pending_transcript = pending.clone();
                self.publish();
                self.listener.on_interim_result(&pending);
            }
            RecognitionEvent::Final { text, confidence } => match self.policy.observe_final(&text, confidence, now) {
                Some(finalization) => self.finish_utterance(finalization),
                None => {
                    self.state.pending_transcript = self.policy.pending();
                    self.publish();
                }
            },
            RecognitionEvent::NoSpeech => debug!("🤫 Recognizer heard nothing"),
            RecognitionEvent::Ended => {
                if self.config.continuous_listening {
                    info!("🔄 Recognizer ended, restarting");
                    self.restart_recognition();
                } else {
                    self.policy.abandon();
                    self.close_recognition();
                    self.state.pending_transcript.clear();
                    self.publish();
                }
            }
            RecognitionEvent::Error(e) => {
                warn!("Recognition error: {}", e);
                self.halt_input();
                match e {
                    VoiceError::CapabilityMissing(_) => self.report_capability(e),
                    _ => {
                        self.publish();
                        self.listener.on_error(&e);
                    }
                }
            }
        }
    }

    fn finish_utterance(&mut self, finalization: Finalization) {
        if self.capture.is_some() {
            // Server route: the recording is the utterance
            self.submit_recording();
            return;
        }
        self.deliver(&finalization.text);
        if self.config.continuous_listening {
            self.restart_recognition();
        } else {
            self.close_recognition();
            self.publish();
        }
    }

    fn deliver(&mut self, text: &str) {
        self.state.transcript = text.to_string();
        // a live utterance may still be accumulating next to a finished upload
        self.state.pending_transcript = self.policy.pending();
        self.publish();
        self.listener.on_speech_result(text);
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    fn start_recording(&mut self) {
        if !self.startable("start_recording") {
            return;
        }
        if self.state.is_recording {
            debug!("start_recording ignored: already recording");
            return;
        }
        self.restart_at = None;
        if self.state.is_listening {
            self.stop_listening();
        }
        self.start_capture(CaptureMode::PushToRecord);
    }

    fn stop_recording(&mut self) {
        if self.capture.is_none() {
            debug!("stop_recording ignored: not recording");
            return;
        }
        self.submit_recording();
    }

    fn start_capture(&mut self, mode: CaptureMode) {
        if self.transcriber.is_none() {
            self.report_capability(VoiceError::CapabilityMissing(
                "recording needs a transcription server".to_string(),
            ));
            return;
        }
        if mode == CaptureMode::HandsFree {
            self.policy.begin();
        }

        let on_activity: Option<ActivityCallback> =
            if mode == CaptureMode::HandsFree && self.config.continuous_listening && self.config.vad_enabled {
                let tx = self.events.clone();
                let epoch = self.epoch;
                Some(Arc::new(move |_activity: SpeechActivity| {
                    let _ = tx.send(Event::Activity { epoch });
                }))
            } else {
                None
            };

        let watch_silence = on_activity.is_some();
        match AudioCapture::begin(self.backends.audio.as_ref(), on_activity) {
            Ok(handle) => {
                if mode == CaptureMode::HandsFree && self.config.continuous_listening && !handle.reports_activity() {
                    let vad = if watch_silence { "unsupported for this input" } else { "disabled" };
                    match self.config.max_recording() {
                        Some(limit) => {
                            warn!("Hands-free recording cannot detect silence (VAD {}); submitting every {:?}", vad, limit)
                        }
                        None => warn!("Hands-free recording cannot detect silence (VAD {}), no length limit", vad),
                    }
                }
                self.capture = Some(ActiveCapture {
                    handle,
                    mode,
                    opened_at: Instant::now(),
                    voiced: false,
                });
                self.state.is_recording = true;
                self.state.is_listening = mode == CaptureMode::HandsFree;
                self.publish();
            }
            Err(e) => self.report_start_failure(e),
        }
    }

    fn submit_recording(&mut self) {
        let Some(ActiveCapture { mut handle, mode, .. }) = self.capture.take() else {
            return;
        };
        self.epoch += 1;
        if mode == CaptureMode::HandsFree {
            self.policy.abandon();
            self.state.is_listening = false;
        }
        self.state.is_recording = false;

        let payload = handle.stop();
        drop(handle);

        let (payload, transcriber) = match (payload, self.transcriber.clone()) {
            (Ok(payload), Some(transcriber)) => (payload, transcriber),
            (Ok(_), None) => {
                self.publish();
                self.listener.on_error(&VoiceError::CapabilityMissing(
                    "recording needs a transcription server".to_string(),
                ));
                return;
            }
            (Err(e), _) => {
                warn!("Recording discarded: {}", e);
                self.publish();
                self.listener.on_error(&e);
                return;
            }
        };

        info!("📤 Uploading {} bytes ({})", payload.bytes.len(), payload.mime_type);
        let tx = self.events.clone();
        let epoch = self.epoch;
        self.transcription = Some(tokio::spawn(async move {
            let result = transcriber.transcribe(&payload).await;
            let _ = tx.send(Event::Transcribed { epoch, result });
        }));
        self.state.is_processing = true;
        self.resume_after_transcription = mode == CaptureMode::HandsFree && self.config.continuous_listening;
        self.publish();
    }

    /// An upload came back. The live policy belongs to whatever is listening now,
    /// so the result is judged on its own.
    fn on_transcribed(&mut self, result: VoiceResult<TranscriptionResult>) {
        self.transcription = None;
        self.state.is_processing = false;
        let resume = std::mem::take(&mut self.resume_after_transcription);

        match result {
            Ok(result) => {
                let text = result.text.trim();
                if is_confident(result.confidence(), self.config.min_confidence) && !text.is_empty() {
                    self.deliver(&format!("{} ", text));
                } else {
                    info!("🤫 No usable speech in recording");
                    self.publish();
                }
                if resume {
                    self.start_listening();
                }
            }
            Err(e) => {
                warn!("Transcription failed: {}", e);
                self.publish();
                self.listener.on_error(&e);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Speaking
    // -------------------------------------------------------------------------

    fn speak(&mut self, text: String) {
        if !self.state.enabled {
            debug!("speak ignored: voice disabled");
            return;
        }
        if text.trim().is_empty() {
            debug!("speak ignored: empty text");
            return;
        }
        self.restart_at = None;

        let request = self.playback.request_for(&text, &self.config);
        let tx = self.events.clone();
        let (id, cancelled) = self.playback.speak(
            request,
            Box::new(move |id, result| {
                let _ = tx.send(Event::SpeechFinished { id, result });
            }),
        );
        if let Some(old) = cancelled {
            self.state.is_speaking = false;
            self.publish();
            self.listener.on_speech_ended(old);
        }
        self.state.is_speaking = true;
        self.publish();
        self.listener.on_speech_started(id);
    }

    fn stop_speaking(&mut self) {
        self.restart_at = None;
        match self.playback.stop() {
            Some(id) => {
                self.state.is_speaking = false;
                self.publish();
                self.listener.on_speech_ended(id);
            }
            None => debug!("stop_speaking ignored: not speaking"),
        }
    }

    fn on_speech_finished(&mut self, id: u64, result: VoiceResult<()>) {
        if !self.playback.finish(id) {
            debug!("Stale playback completion #{}", id);
            return;
        }
        self.state.is_speaking = false;
        self.publish();
        self.listener.on_speech_ended(id);

        match result {
            Ok(()) => {
                if self.config.wants_listen_after_reply() && !self.state.is_listening {
                    let delay = self.config.restart_delay();
                    debug!("🔁 Listening again in {:?}", delay);
                    self.restart_at = Some(Instant::now() + delay);
                }
            }
            Err(e) => {
                let e = match e {
                    VoiceError::Playback(_) => e,
                    other => VoiceError::Playback(other.to_string()),
                };
                warn!("Playback failed: {}", e);
                self.listener.on_error(&e);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Events and timers
    // -------------------------------------------------------------------------

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Recognition { epoch, event } => {
                if epoch != self.epoch || self.recognition.is_none() {
                    debug!("Stale recognition event dropped: {:?}", event);
                    return;
                }
                self.on_recognition(event);
            }
            Event::Activity { epoch } => {
                if epoch != self.epoch {
                    return;
                }
                if let Some(capture) = self.capture.as_mut() {
                    capture.voiced = true;
                    self.policy.observe_activity(Instant::now());
                }
            }
            Event::Transcribed { epoch, result } => {
                if epoch != self.epoch || self.transcription.is_none() {
                    debug!("Stale transcription dropped");
                    return;
                }
                self.on_transcribed(result);
            }
            Event::SpeechFinished { id, result } => self.on_speech_finished(id, result),
        }
    }

    fn on_deadline(&mut self, now: Instant) {
        if self.restart_at.is_some_and(|at| at <= now) {
            self.restart_at = None;
            info!("🔁 Listening again after reply");
            self.start_listening();
        }
        let (idle, limit) = self.capture_deadlines();
        if idle.is_some_and(|at| at <= now) {
            self.recycle_capture();
        } else if limit.is_some_and(|at| at <= now) {
            warn!("⏱️ Recording reached {}ms, submitting", self.config.max_recording_ms);
            self.submit_recording();
            return;
        }
        if let Some(finalization) = self.policy.on_deadline(now) {
            self.finish_utterance(finalization);
        }
    }

    /// Nothing voiced yet: drop the buffered audio and reopen the input.
    fn recycle_capture(&mut self) {
        debug!("🤫 Nothing voiced for {:?}, discarding buffered audio", self.config.silence_timeout());
        self.epoch += 1;
        self.capture = None;
        self.state.is_recording = false;
        self.state.is_listening = false;
        self.start_capture(CaptureMode::HandsFree);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::tests::ScriptedSource;
    use crate::audio::AudioPayload;
    use crate::config::TranscriptionMode;
    use crate::stt::{ChannelRecognizer, RecognizerFeed};
    use crate::voice_output::SpeechRequest;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StubTranscriber {
        calls: AtomicUsize,
        delay: Duration,
        reply: VoiceResult<TranscriptionResult>,
    }

    impl StubTranscriber {
        fn ok(text: &str) -> Arc<Self> {
            Self::slow(text, Duration::from_millis(100))
        }

        fn slow(text: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                reply: Ok(TranscriptionResult::from_text(text)),
            })
        }

        fn failing(error: VoiceError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(100),
                reply: Err(error),
            })
        }
    }

    #[async_trait]
    impl Transcriber for StubTranscriber {
        async fn transcribe(&self, _payload: &AudioPayload) -> VoiceResult<TranscriptionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.reply.clone()
        }
    }

    struct FailingSynth;

    #[async_trait]
    impl SpeechSynthesizer for FailingSynth {
        async fn speak(&self, _request: SpeechRequest) -> VoiceResult<()> {
            Err(VoiceError::Playback("no output device".into()))
        }
    }

    fn listener() -> (Arc<dyn VoiceListener>, mpsc::UnboundedReceiver<VoiceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<VoiceEvent>) -> Vec<VoiceEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn native() -> (VoiceBackends, RecognizerFeed) {
        let (recognizer, feed) = ChannelRecognizer::new();
        (VoiceBackends::default().with_recognizer(Arc::new(recognizer)), feed)
    }

    fn server_config() -> VoiceSessionConfig {
        VoiceSessionConfig {
            transcription_mode: TranscriptionMode::Server,
            server_endpoint: Some("http://127.0.0.1:9/transcribe".into()),
            ..Default::default()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_start_and_stop_are_no_ops() {
        let (backends, feed) = native();
        let (listener, mut rx) = listener();
        let session = VoiceSession::spawn(VoiceSessionConfig::default(), backends, listener);

        session.stop_listening().await.unwrap();
        session.start_listening().await.unwrap();
        session.start_listening().await.unwrap();
        assert_eq!(feed.start_count(), 1);
        assert!(session.state().is_listening);

        session.stop_listening().await.unwrap();
        session.stop_listening().await.unwrap();
        assert!(!feed.is_subscribed());
        assert!(session.state().is_quiet());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn capability_missing_is_reported_once() {
        let (listener, mut rx) = listener();
        let session = VoiceSession::spawn(VoiceSessionConfig::default(), VoiceBackends::default(), listener);

        session.start_listening().await.unwrap();
        session.start_listening().await.unwrap();
        session.start_recording().await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], VoiceEvent::Error(VoiceError::CapabilityMissing(_))));
        assert!(session.state().is_quiet());

        // re-enabling through configure allows one more notice
        session.configure(VoiceSessionConfig::default()).await.unwrap();
        session.start_listening().await.unwrap();
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn local_mode_falls_back_to_server_recording() {
        let transcriber = StubTranscriber::ok("turn on the lights");
        let source = Arc::new(ScriptedSource::pcm(vec![vec![0u8; 64]], vec![]));
        let backends = VoiceBackends::default()
            .with_transcriber(transcriber.clone())
            .with_audio(source.clone());
        let config = VoiceSessionConfig {
            server_endpoint: Some("http://127.0.0.1:9/transcribe".into()),
            ..Default::default()
        };
        let (listener, mut rx) = listener();
        let session = VoiceSession::spawn(config, backends, listener);

        session.start_listening().await.unwrap();
        let state = session.state();
        assert!(state.is_listening && state.is_recording);

        session.stop_recording().await.unwrap();
        assert!(session.state().is_processing);
        assert_eq!(source.releases.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(drain(&mut rx), vec![VoiceEvent::SpeechResult("turn on the lights ".into())]);
        let state = session.state();
        assert!(!state.is_processing && !state.is_listening);
        assert_eq!(state.transcript, "turn on the lights ");
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_during_upload_drops_the_result() {
        let transcriber = StubTranscriber::ok("too late");
        let backends = VoiceBackends::default()
            .with_transcriber(transcriber.clone())
            .with_audio(Arc::new(ScriptedSource::pcm(vec![vec![1, 0]], vec![])));
        let (listener, mut rx) = listener();
        let session = VoiceSession::spawn(server_config(), backends, listener);

        session.start_recording().await.unwrap();
        session.stop_recording().await.unwrap();
        assert!(session.state().is_processing);
        session.stop_listening().await.unwrap();
        assert!(!session.state().is_processing);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_push_to_record_never_uploads() {
        let transcriber = StubTranscriber::ok("unused");
        let source = Arc::new(ScriptedSource::pcm(vec![], vec![]));
        let backends = VoiceBackends::default()
            .with_transcriber(transcriber.clone())
            .with_audio(source.clone());
        let (listener, mut rx) = listener();
        let session = VoiceSession::spawn(server_config(), backends, listener);

        session.start_recording().await.unwrap();
        let state = session.state();
        assert!(state.is_recording && !state.is_listening);

        session.stop_recording().await.unwrap();
        session.stop_recording().await.unwrap();
        settle().await;
        assert_eq!(drain(&mut rx), vec![VoiceEvent::Error(VoiceError::EmptyRecording)]);
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 0);
        assert_eq!(source.releases.load(Ordering::SeqCst), 1);
        assert!(session.state().is_quiet());
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_clears_processing() {
        let transcriber = StubTranscriber::failing(VoiceError::ServerError("status 502: bad gateway".into()));
        let backends = VoiceBackends::default()
            .with_transcriber(transcriber)
            .with_audio(Arc::new(ScriptedSource::pcm(vec![vec![1, 0]], vec![])));
        let (listener, mut rx) = listener();
        let session = VoiceSession::spawn(server_config(), backends, listener);

        session.start_recording().await.unwrap();
        session.stop_recording().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], VoiceEvent::Error(VoiceError::ServerError(_))));
        assert!(session.state().is_quiet());
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_returns_to_idle() {
        let mut source = ScriptedSource::pcm(vec![], vec![]);
        source.deny = true;
        let backends = VoiceBackends::default()
            .with_transcriber(StubTranscriber::ok("x"))
            .with_audio(Arc::new(source));
        let (listener, mut rx) = listener();
        let session = VoiceSession::spawn(server_config(), backends, listener);

        session.start_listening().await.unwrap();
        let events = drain(&mut rx);
        assert!(matches!(events[..], [VoiceEvent::Error(VoiceError::PermissionDenied(_))]));
        assert!(session.state().is_quiet());
        assert!(session.state().enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn recognition_error_stops_listening() {
        let (backends, feed) = native();
        let (listener, mut rx) = listener();
        let session = VoiceSession::spawn(VoiceSessionConfig::default(), backends, listener);

        session.start_listening().await.unwrap();
        feed.interim("half a");
        feed.push(RecognitionEvent::Error(VoiceError::Recognition("network".into())));
        settle().await;

        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&VoiceEvent::Error(VoiceError::Recognition("network".into()))));
        assert!(!session.state().is_listening);
        assert!(!feed.is_subscribed());
    }

    #[tokio::test(start_paused = true)]
    async fn ended_without_hands_free_abandons() {
        let (backends, feed) = native();
        let (listener, mut rx) = listener();
        let session = VoiceSession::spawn(VoiceSessionConfig::default(), backends, listener);

        session.start_listening().await.unwrap();
        feed.interim("never finished");
        feed.end();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(drain(&mut rx), vec![VoiceEvent::InterimResult("never finished".into())]);
        let state = session.state();
        assert!(!state.is_listening);
        assert!(state.pending_transcript.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn playback_failure_is_reported_and_suppresses_restart() {
        let (backends, feed) = native();
        let backends = backends.with_synthesizer(Arc::new(FailingSynth));
        let config = VoiceSessionConfig {
            auto_reply_enabled: true,
            auto_listen: true,
            ..Default::default()
        };
        let (listener, mut rx) = listener();
        let session = VoiceSession::spawn(config, backends, listener);

        session.speak("hello").await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let events = drain(&mut rx);
        assert_eq!(events[0], VoiceEvent::SpeechStarted(1));
        assert_eq!(events[1], VoiceEvent::SpeechEnded(1));
        assert!(matches!(events[2], VoiceEvent::Error(VoiceError::Playback(_))));
        assert!(!session.state().is_speaking);
        assert_eq!(feed.start_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_result_keeps_live_utterance() {
        let (backends, feed) = native();
        let transcriber = StubTranscriber::slow("recorded", Duration::from_millis(300));
        let backends = backends
            .with_transcriber(transcriber.clone())
            .with_audio(Arc::new(ScriptedSource::pcm(vec![vec![1, 0]], vec![])));
        let config = VoiceSessionConfig {
            continuous_listening: true,
            server_endpoint: Some("http://127.0.0.1:9/transcribe".into()),
            ..Default::default()
        };
        let (listener, mut rx) = listener();
        let session = VoiceSession::spawn(config, backends, listener);

        session.start_recording().await.unwrap();
        session.stop_recording().await.unwrap();
        session.start_listening().await.unwrap();
        assert!(session.state().is_listening && session.state().is_processing);
        feed.interim("hello world");

        tokio::time::sleep(Duration::from_millis(400)).await;
        // the upload landed mid-utterance; the live text is still pending
        let state = session.state();
        assert!(!state.is_processing && state.is_listening);
        assert_eq!(state.pending_transcript, "hello world");

        tokio::time::sleep(Duration::from_secs(5)).await;
        let results: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                VoiceEvent::SpeechResult(text) => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(results, vec!["recorded ".to_string(), "hello world".to_string()]);
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn server_listening_waits_for_upload() {
        let transcriber = StubTranscriber::ok("first");
        let source = Arc::new(ScriptedSource::pcm(vec![vec![1, 0]], vec![]));
        let backends = VoiceBackends::default()
            .with_transcriber(transcriber.clone())
            .with_audio(source.clone());
        let (listener, mut rx) = listener();
        let session = VoiceSession::spawn(server_config(), backends, listener);

        session.start_recording().await.unwrap();
        session.stop_recording().await.unwrap();
        session.start_listening().await.unwrap();
        assert!(!session.state().is_recording);
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(drain(&mut rx), vec![VoiceEvent::SpeechResult("first ".into())]);
        let state = session.state();
        assert!(state.is_listening && state.is_recording);
        assert_eq!(source.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn voiced_hands_free_recording_submits_on_silence_and_reopens() {
        let transcriber = StubTranscriber::ok("turn on the lights");
        let source = Arc::new(ScriptedSource::pcm(vec![vec![0u8; 960]], vec![]));
        let backends = VoiceBackends::default()
            .with_transcriber(transcriber.clone())
            .with_audio(source.clone());
        let (listener, mut rx) = listener();
        let (state_tx, state_rx) = watch::channel(SessionState::default());
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut controller = Controller::new(backends, listener, state_tx, event_tx);

        let start = Instant::now();
        controller.configure(VoiceSessionConfig {
            continuous_listening: true,
            ..server_config()
        });
        let state = state_rx.borrow().clone();
        assert!(state.is_listening && state.is_recording);
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);

        // VAD reports speech half a second in
        tokio::time::advance(Duration::from_millis(500)).await;
        controller.handle_event(Event::Activity { epoch: controller.epoch });
        let deadline = controller.next_deadline().unwrap();
        assert_eq!(deadline, start + Duration::from_millis(2000));

        tokio::time::sleep_until(deadline).await;
        controller.on_deadline(Instant::now());
        assert!(state_rx.borrow().is_processing);
        assert_eq!(source.releases.load(Ordering::SeqCst), 1);
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 1);

        let event = event_rx.recv().await.unwrap();
        controller.handle_event(event);
        assert_eq!(drain(&mut rx), vec![VoiceEvent::SpeechResult("turn on the lights ".into())]);
        let state = state_rx.borrow().clone();
        assert!(state.is_listening && state.is_recording && !state.is_processing);
        assert_eq!(source.opens.load(Ordering::SeqCst), 2);
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_hands_free_recording_is_discarded() {
        let transcriber = StubTranscriber::ok("unused");
        let source = Arc::new(ScriptedSource::pcm(vec![vec![0u8; 960]], vec![]));
        let backends = VoiceBackends::default()
            .with_transcriber(transcriber.clone())
            .with_audio(source.clone());
        let config = VoiceSessionConfig {
            continuous_listening: true,
            ..server_config()
        };
        let (listener, mut rx) = listener();
        let session = VoiceSession::spawn(config, backends, listener);
        settle().await;
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(1400)).await;
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(source.opens.load(Ordering::SeqCst), 2);
        assert_eq!(source.releases.load(Ordering::SeqCst), 1);
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 0);
        let state = session.state();
        assert!(state.is_listening && state.is_recording && !state.is_processing);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recording_without_vad_is_submitted_at_the_limit() {
        let transcriber = StubTranscriber::ok("turn on the lights");
        let source = Arc::new(ScriptedSource::pcm(vec![vec![1, 0]], vec![]));
        let backends = VoiceBackends::default()
            .with_transcriber(transcriber.clone())
            .with_audio(source.clone());
        let config = VoiceSessionConfig {
            continuous_listening: true,
            vad_enabled: false,
            max_recording_ms: 2000,
            ..server_config()
        };
        let (listener, mut rx) = listener();
        let session = VoiceSession::spawn(config, backends, listener);
        settle().await;

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 0);
        assert!(session.state().is_recording);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(transcriber.calls.load(Ordering::SeqCst), 1);
        assert_eq!(drain(&mut rx), vec![VoiceEvent::SpeechResult("turn on the lights ".into())]);
        // hands-free: the next recording is already open
        assert_eq!(source.opens.load(Ordering::SeqCst), 2);
        assert!(session.state().is_recording);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_the_handle() {
        let (backends, feed) = native();
        let (listener, _rx) = listener();
        let session = VoiceSession::spawn(VoiceSessionConfig::default(), backends, listener);
        session.start_listening().await.unwrap();
        let mut watcher = session.subscribe();

        session.shutdown().await.unwrap();
        assert!(!feed.is_subscribed());
        assert!(!watcher.borrow_and_update().enabled);
    }
}
