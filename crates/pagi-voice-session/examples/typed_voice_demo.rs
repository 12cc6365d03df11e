//! Example: Typed Voice Session
//!
//! Every line typed on stdin is fed to the session as a recognized utterance, as if it
//! had been spoken, and the reply is read back through the configured synthesizer.
//! Build with `--features speaker` and set TTS_API_KEY to hear it; otherwise replies
//! are silent and only logged.
//!
//! ```text
//! cargo run -p pagi-voice-session --example typed_voice_demo
//! ```

use anyhow::Result;
use pagi_voice_session::{
    ChannelRecognizer, NoopSynthesizer, SpeechSynthesizer, VoiceBackends, VoiceEvent, VoiceSession,
    VoiceSessionConfig,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🎤 PAGI Voice Session (typed)");
    info!("Type a line and press enter; /quit to exit.");

    let mut config = VoiceSessionConfig::from_env();
    config.continuous_listening = true;

    let (recognizer, feed) = ChannelRecognizer::new();
    let backends = VoiceBackends::default()
        .with_recognizer(Arc::new(recognizer))
        .with_synthesizer(synthesizer());

    let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    let session = VoiceSession::spawn(config, backends, Arc::new(tx));
    session.start_listening().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim() == "/quit" => break,
                Some(line) => {
                    if !feed.final_result(line, 1.0) {
                        warn!("Not listening right now, line dropped");
                    }
                }
                None => break,
            },
            Some(event) = events.recv() => match event {
                VoiceEvent::SpeechResult(text) => {
                    info!("📝 Heard: {}", text.trim());
                    session.speak(format!("You said: {}", text.trim())).await?;
                }
                VoiceEvent::Error(e) => warn!("⚠️ {}", e),
                VoiceEvent::SpeechEnded(id) => info!("🔇 Reply #{} finished", id),
                other => debug!("{:?}", other),
            },
        }
    }

    session.shutdown().await?;
    info!("👋 Goodbye!");
    Ok(())
}

fn synthesizer() -> Arc<dyn SpeechSynthesizer> {
    #[cfg(feature = "speaker")]
    {
        use pagi_voice_session::{HttpTts, SpeakerSynthesizer};
        match HttpTts::from_env().and_then(|tts| SpeakerSynthesizer::new(Arc::new(tts))) {
            Ok(speaker) => return Arc::new(speaker),
            Err(e) => warn!("Speaker unavailable, replies are silent: {}", e),
        }
    }
    Arc::new(NoopSynthesizer)
}
