//! Audio capture: acquire an input, collect chunks, hand back one payload on stop.
//!
//! The device side is behind [`AudioSource`] so the session can run against a real
//! microphone (`CpalSource`, feature `mic`) or anything else that produces chunks.

use crate::error::{VoiceError, VoiceResult};
use crate::vad::{SpeechActivity, VadConfig, VadDetector};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How the bytes of each chunk are laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEncoding {
    /// Little-endian signed 16-bit PCM, interleaved.
    Pcm16 { sample_rate: u32, channels: u16 },
    /// Already-encoded container fragments (e.g. `audio/webm`), concatenated as-is.
    Encoded { mime_type: String },
}

impl ChunkEncoding {
    /// Mime type of the payload produced from chunks in this encoding.
    pub fn payload_mime_type(&self) -> &str {
        match self {
            ChunkEncoding::Pcm16 { .. } => "audio/wav",
            ChunkEncoding::Encoded { mime_type } => mime_type,
        }
    }
}

/// One binary fragment delivered by a source.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    /// Timestamp when captured
    pub timestamp: Instant,
}

impl AudioChunk {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            timestamp: Instant::now(),
        }
    }
}

/// A finished recording, ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub captured_at: DateTime<Utc>,
    /// Known for PCM recordings only.
    pub duration: Option<Duration>,
}

impl AudioPayload {
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// File name matching the mime type, used for multipart uploads.
    pub fn file_name(&self) -> &'static str {
        match self.mime_type.as_str() {
            "audio/wav" | "audio/x-wav" => "audio.wav",
            "audio/ogg" => "audio.ogg",
            "audio/mpeg" => "audio.mp3",
            "audio/mp4" => "audio.m4a",
            _ => "audio.webm",
        }
    }
}

/// Ordered chunks of a single recording. Consumed once by [`AudioChunkBuffer::into_payload`].
#[derive(Debug)]
pub struct AudioChunkBuffer {
    encoding: ChunkEncoding,
    chunks: Vec<AudioChunk>,
}

impl AudioChunkBuffer {
    pub fn new(encoding: ChunkEncoding) -> Self {
        Self {
            encoding,
            chunks: Vec::new(),
        }
    }

    pub fn push(&mut self, chunk: AudioChunk) {
        self.chunks.push(chunk);
    }

    pub fn byte_len(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.byte_len() == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Join all chunks into one payload. Fails with `EmptyRecording` when nothing was captured.
    pub fn into_payload(self) -> VoiceResult<AudioPayload> {
        if self.is_empty() {
            return Err(VoiceError::EmptyRecording);
        }
        let mut joined = Vec::with_capacity(self.byte_len());
        for chunk in &self.chunks {
            joined.extend_from_slice(&chunk.data);
        }
        let (bytes, duration) = match &self.encoding {
            ChunkEncoding::Pcm16 {
                sample_rate,
                channels,
            } => {
                let frames = joined.len() / 2 / (*channels).max(1) as usize;
                let duration = Duration::from_secs_f64(frames as f64 / (*sample_rate).max(1) as f64);
                (encode_wav(&joined, *sample_rate, *channels), Some(duration))
            }
            ChunkEncoding::Encoded { .. } => (joined, None),
        };
        Ok(AudioPayload {
            bytes,
            mime_type: self.encoding.payload_mime_type().to_string(),
            captured_at: Utc::now(),
            duration,
        })
    }
}

/// Wrap little-endian PCM16 bytes in a 44-byte RIFF/WAVE header.
pub fn encode_wav(pcm16_le: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let data_len = pcm16_le.len() as u32;
    let block_align = channels * 2;
    let byte_rate = sample_rate * block_align as u32;

    let mut buf = Vec::with_capacity(44 + pcm16_le.len());
    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes());
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    buf.extend_from_slice(pcm16_le);
    buf
}

/// Convert normalized f32 samples to little-endian PCM16 bytes.
pub fn f32_to_pcm16_le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Something that can open an audio input and stream chunks into a channel.
pub trait AudioSource: Send + Sync {
    /// Layout of the chunks this source sends.
    fn encoding(&self) -> ChunkEncoding;

    /// Acquire the device and start sending chunks on `chunk_tx`.
    ///
    /// Fails with `PermissionDenied` when the device cannot be acquired. Every clone of
    /// `chunk_tx` must be dropped by the time [`ActiveInput::release`] returns.
    fn open(&self, chunk_tx: mpsc::UnboundedSender<AudioChunk>) -> VoiceResult<Box<dyn ActiveInput>>;

    fn name(&self) -> String {
        "audio source".to_string()
    }
}

/// An acquired input device.
pub trait ActiveInput: Send {
    /// Flush whatever the encoder is still holding onto the chunk channel.
    fn request_data(&mut self);

    /// Stop and release the device. Must be safe to call more than once.
    fn release(&mut self);
}

/// Called from the capture side whenever voiced audio is seen.
pub type ActivityCallback = Arc<dyn Fn(SpeechActivity) + Send + Sync>;

/// Starts recordings.
pub struct AudioCapture;

impl AudioCapture {
    /// Acquire `source` and start recording.
    ///
    /// With `on_activity` set and a PCM source at a VAD-compatible rate, chunks pass
    /// through a WebRTC VAD thread first and voiced frames are reported.
    pub fn begin(source: &dyn AudioSource, on_activity: Option<ActivityCallback>) -> VoiceResult<CaptureHandle> {
        let encoding = source.encoding();
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();

        let vad_rate = match (&encoding, &on_activity) {
            (ChunkEncoding::Pcm16 { sample_rate, channels: 1 }, Some(_)) if VadConfig::supports(*sample_rate) => {
                Some(*sample_rate)
            }
            (_, Some(_)) => {
                warn!("VAD skipped: {:?} is not mono PCM16 at 8/16/32/48 kHz", encoding);
                None
            }
            _ => None,
        };

        let (input, vad_thread) = match (vad_rate, on_activity) {
            (Some(sample_rate), Some(callback)) => {
                let (raw_tx, raw_rx) = mpsc::unbounded_channel();
                let input = source.open(raw_tx)?;
                let vad_thread = spawn_vad_thread(sample_rate, raw_rx, chunk_tx, callback);
                (input, Some(vad_thread))
            }
            _ => (source.open(chunk_tx)?, None),
        };

        info!("🎤 Recording started ({})", source.name());

        Ok(CaptureHandle {
            input: Some(input),
            chunk_rx,
            encoding,
            vad_thread,
        })
    }
}

fn spawn_vad_thread(
    sample_rate: u32,
    mut raw_rx: mpsc::UnboundedReceiver<AudioChunk>,
    chunk_tx: mpsc::UnboundedSender<AudioChunk>,
    on_activity: ActivityCallback,
) -> thread::JoinHandle<()> {
    // Dedicated thread: webrtc-vad is not Send
    thread::spawn(move || {
        let mut vad = match VadDetector::new(VadConfig {
            sample_rate,
            ..Default::default()
        }) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Capture: VAD init failed, recording without it: {}", e);
                None
            }
        };
        while let Some(chunk) = raw_rx.blocking_recv() {
            if let Some(ref mut vad) = vad {
                if vad.push_pcm16_le(&chunk.data) > 0 {
                    on_activity(SpeechActivity::Voiced);
                }
            }
            if chunk_tx.send(chunk).is_err() {
                break;
            }
        }
        debug!("Capture: VAD thread finished");
    })
}

/// A running recording. Drop it to discard the audio and release the device.
pub struct CaptureHandle {
    input: Option<Box<dyn ActiveInput>>,
    chunk_rx: mpsc::UnboundedReceiver<AudioChunk>,
    encoding: ChunkEncoding,
    vad_thread: Option<thread::JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn is_active(&self) -> bool {
        self.input.is_some()
    }

    /// Whether voiced audio is being reported for this recording.
    pub fn reports_activity(&self) -> bool {
        self.vad_thread.is_some()
    }

    /// Stop recording and return the payload.
    ///
    /// Requests the final buffered data, releases the device (also when the recording
    /// turns out empty) and joins all chunks. Only the first call does anything; later
    /// calls return `CaptureStopped`.
    ///
    /// Flushing and joining the device threads may block; on a multi-threaded runtime
    /// the worker is handed off first so other tasks keep running.
    pub fn stop(&mut self) -> VoiceResult<AudioPayload> {
        let mut input = match self.input.take() {
            Some(i) => i,
            None => return Err(VoiceError::CaptureStopped),
        };
        let vad_thread = self.vad_thread.take();
        off_runtime(move || {
            input.request_data();
            input.release();
            drop(input);

            if let Some(vad_thread) = vad_thread {
                if vad_thread.join().is_err() {
                    warn!("Capture: VAD thread thread panicked");
                }
            }
        });

        let mut buffer = AudioChunkBuffer::new(self.encoding.clone());
        while let Ok(chunk) = self.chunk_rx.try_recv() {
            buffer.push(chunk);
        }
        info!("⏹️ Recording stopped: {} chunks, {} bytes", buffer.chunk_count(), buffer.byte_len());
        buffer.into_payload()
    }
}

/// Run blocking device work without stalling the runtime's other tasks.
///
/// `block_in_place` is only allowed on the multi-threaded scheduler; elsewhere the
/// work runs inline.
fn off_runtime<T>(work: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(tokio::runtime::RuntimeFlavor::MultiThread) => tokio::task::block_in_place(work),
        _ => work(),
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.release();
            debug!("Capture: released input on drop");
        }
    }
}

/// Source used when no input backend is compiled in.
#[derive(Debug, Default)]
pub struct NoInputSource;

impl AudioSource for NoInputSource {
    fn encoding(&self) -> ChunkEncoding {
        ChunkEncoding::Pcm16 {
            sample_rate: 16000,
            channels: 1,
        }
    }

    fn open(&self, _chunk_tx: mpsc::UnboundedSender<AudioChunk>) -> VoiceResult<Box<dyn ActiveInput>> {
        Err(VoiceError::CapabilityMissing(
            "no audio input backend (build with --features mic)".to_string(),
        ))
    }

    fn name(&self) -> String {
        "no input".to_string()
    }
}

/// Pick the platform input: the default microphone when built with `mic`.
pub fn default_source() -> Arc<dyn AudioSource> {
    #[cfg(feature = "mic")]
    {
        Arc::new(mic::CpalSource::new(mic::AudioConfig::default()))
    }
    #[cfg(not(feature = "mic"))]
    {
        Arc::new(NoInputSource)
    }
}

#[cfg(feature = "mic")]
pub use mic::{AudioConfig, CpalSource};

#[cfg(feature = "mic")]
mod mic {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::StreamConfig;
    use std::sync::mpsc as std_mpsc;
    use std::sync::Mutex;

    /// Audio configuration
    #[derive(Debug, Clone)]
    pub struct AudioConfig {
        /// Sample rate in Hz (default: 16000)
        pub sample_rate: u32,

        /// Number of channels (default: 1 for mono)
        pub channels: u16,

        /// Samples per chunk (default: 480 for 30ms at 16kHz)
        pub buffer_size: usize,
    }

    impl Default for AudioConfig {
        fn default() -> Self {
            Self {
                sample_rate: 16000,
                channels: 1,
                buffer_size: 480, // 30ms at 16kHz
            }
        }
    }

    enum InputCommand {
        Flush(std_mpsc::Sender<()>),
        Release,
    }

    /// Default microphone through CPAL. The stream lives on its own thread
    /// (cpal `Stream` is !Send on some platforms).
    pub struct CpalSource {
        config: AudioConfig,
    }

    impl CpalSource {
        pub fn new(config: AudioConfig) -> Self {
            Self { config }
        }

        /// List available input devices
        pub fn list_input_devices() -> VoiceResult<Vec<String>> {
            let host = cpal::default_host();
            let devices = host.input_devices()?;
            Ok(devices.filter_map(|d| d.name().ok()).collect())
        }
    }

    impl AudioSource for CpalSource {
        fn encoding(&self) -> ChunkEncoding {
            ChunkEncoding::Pcm16 {
                sample_rate: self.config.sample_rate,
                channels: self.config.channels,
            }
        }

        fn open(&self, chunk_tx: mpsc::UnboundedSender<AudioChunk>) -> VoiceResult<Box<dyn ActiveInput>> {
            let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
            let (cmd_tx, cmd_rx) = std_mpsc::channel::<InputCommand>();
            let config = self.config.clone();
            let handle = thread::spawn(move || run_input(config, chunk_tx, ready_tx, cmd_rx));
            match ready_rx.recv() {
                Ok(Ok(())) => Ok(Box::new(CpalInput {
                    cmd_tx,
                    handle: Some(handle),
                })),
                Ok(Err(e)) => {
                    let _ = handle.join();
                    Err(e)
                }
                Err(_) => Err(VoiceError::AudioDevice("input thread exited".to_string())),
            }
        }

        fn name(&self) -> String {
            format!("cpal {}Hz x{}", self.config.sample_rate, self.config.channels)
        }
    }

    fn run_input(
        config: AudioConfig,
        chunk_tx: mpsc::UnboundedSender<AudioChunk>,
        ready_tx: std_mpsc::Sender<VoiceResult<()>>,
        cmd_rx: std_mpsc::Receiver<InputCommand>,
    ) {
        let device = match cpal::default_host().default_input_device() {
            Some(d) => d,
            None => {
                let _ = ready_tx.send(Err(VoiceError::PermissionDenied("No input device available".to_string())));
                return;
            }
        };
        info!("📱 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let pending: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::with_capacity(config.buffer_size)));
        let cb_pending = Arc::clone(&pending);
        let cb_tx = chunk_tx.clone();
        let chunk_samples = config.buffer_size.max(1);

        let stream = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let Ok(mut buf) = cb_pending.lock() else { return };
                for &sample in data {
                    buf.push(sample);
                    if buf.len() >= chunk_samples {
                        if let Err(e) = cb_tx.send(AudioChunk::new(f32_to_pcm16_le(&buf))) {
                            warn!("Failed to send audio chunk: {}", e);
                        }
                        buf.clear();
                    }
                }
            },
            move |err| {
                warn!("Audio stream error: {}", err);
            },
            None,
        );
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                let _ = ready_tx.send(Err(e.into()));
                return;
            }
        };
        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(e.into()));
            return;
        }
        let _ = ready_tx.send(Ok(()));

        while let Ok(cmd) = cmd_rx.recv() {
            match cmd {
                InputCommand::Flush(ack) => {
                    if let Ok(mut buf) = pending.lock() {
                        if !buf.is_empty() {
                            let _ = chunk_tx.send(AudioChunk::new(f32_to_pcm16_le(&buf)));
                            buf.clear();
                        }
                    }
                    let _ = ack.send(());
                }
                InputCommand::Release => break,
            }
        }
        drop(stream);
        info!("🔇 Input device released");
    }

    struct CpalInput {
        cmd_tx: std_mpsc::Sender<InputCommand>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl ActiveInput for CpalInput {
        fn request_data(&mut self) {
            let (ack_tx, ack_rx) = std_mpsc::channel();
            if self.cmd_tx.send(InputCommand::Flush(ack_tx)).is_ok() {
                let _ = ack_rx.recv();
            }
        }

        fn release(&mut self) {
            if let Some(handle) = self.handle.take() {
                let _ = self.cmd_tx.send(InputCommand::Release);
                let _ = handle.join();
            }
        }
    }

    impl Drop for CpalInput {
        fn drop(&mut self) {
            self.release();
        }
    }
}
