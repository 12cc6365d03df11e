//! Speech-energy detection using WebRTC VAD
//!
//! Used while recording for server transcription: voiced 30ms frames reset the
//! session's silence countdown so hands-free recordings stop on their own.

use crate::error::{VoiceError, VoiceResult};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Configuration for VAD detection
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Sample rate (must be 8000, 16000, 32000, or 48000 Hz for WebRTC VAD)
    pub sample_rate: u32,

    /// Detection mode (0-3, where 3 is most aggressive)
    pub mode: u8,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            mode: 2,
        }
    }
}

impl VadConfig {
    pub fn supports(sample_rate: u32) -> bool {
        matches!(sample_rate, 8000 | 16000 | 32000 | 48000)
    }
}

/// Emitted for every voiced frame seen during a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechActivity {
    Voiced,
}

/// Voice Activity Detector using WebRTC VAD.
///
/// Not `Send`: build it on the thread that feeds it.
pub struct VadDetector {
    vad: Vad,
    config: VadConfig,
    frame_size: usize,
    carry: Vec<i16>,
}

impl VadDetector {
    pub fn new(config: VadConfig) -> VoiceResult<Self> {
        info!("🎙️ Initializing WebRTC VAD (sample_rate: {}Hz, mode: {})",
              config.sample_rate, config.mode);

        if !VadConfig::supports(config.sample_rate) {
            return Err(VoiceError::VadInit(format!(
                "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                config.sample_rate
            )));
        }
        if config.mode > 3 {
            return Err(VoiceError::VadInit(format!("VAD mode must be 0-3, got {}", config.mode)));
        }

        // 30ms windows: 16000 * 0.03 = 480 samples
        let frame_size = (config.sample_rate as usize * 30) / 1000;
        let vad = build_vad(&config)?;

        Ok(Self {
            vad,
            config,
            frame_size,
            carry: Vec::with_capacity(frame_size),
        })
    }

    /// Classify exactly one frame of `frame_size()` samples.
    pub fn is_voiced_frame(&mut self, frame: &[i16]) -> VoiceResult<bool> {
        if frame.len() != self.frame_size {
            return Err(VoiceError::VadInit(format!(
                "Expected {} samples, got {}",
                self.frame_size,
                frame.len()
            )));
        }
        self.vad
            .is_voice_segment(frame)
            .map_err(|_| VoiceError::VadInit("VAD processing failed".to_string()))
    }

    /// Feed arbitrary-length PCM; returns how many complete frames were voiced.
    /// Leftover samples are kept for the next call.
    pub fn push_samples(&mut self, samples: &[i16]) -> usize {
        let mut voiced = 0;
        self.carry.extend_from_slice(samples);
        let mut offset = 0;
        while self.carry.len() - offset >= self.frame_size {
            let frame = &self.carry[offset..offset + self.frame_size];
            match self.vad.is_voice_segment(frame) {
                Ok(true) => voiced += 1,
                Ok(false) => {}
                Err(_) => debug!("VAD rejected frame"),
            }
            offset += self.frame_size;
        }
        self.carry.drain(..offset);
        voiced
    }

    /// Convenience for little-endian PCM16 bytes as produced by capture sources.
    pub fn push_pcm16_le(&mut self, bytes: &[u8]) -> usize {
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        self.push_samples(&samples)
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// Forget buffered samples and detector history.
    pub fn reset(&mut self) -> VoiceResult<()> {
        // WebRTC VAD doesn't have explicit reset, recreate it
        self.vad = build_vad(&self.config)?;
        self.carry.clear();
        Ok(())
    }
}

fn build_vad(config: &VadConfig) -> VoiceResult<Vad> {
    let vad_mode = match config.mode {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    };
    let sample_rate = match config.sample_rate {
        8000 => SampleRate::Rate8kHz,
        16000 => SampleRate::Rate16kHz,
        32000 => SampleRate::Rate32kHz,
        48000 => SampleRate::Rate48kHz,
        other => return Err(VoiceError::VadInit(format!("Invalid sample rate: {}", other))),
    };
    let mut vad = Vad::new();
    vad.set_mode(vad_mode);
    vad.set_sample_rate(sample_rate);
    Ok(vad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vad_initialization() {
        let detector = VadDetector::new(VadConfig::default()).unwrap();
        assert_eq!(detector.frame_size(), 480); // 30ms at 16kHz
    }

    #[test]
    fn test_invalid_sample_rate() {
        let config = VadConfig {
            sample_rate: 44100,
            ..Default::default()
        };
        assert!(VadDetector::new(config).is_err());
    }

    #[test]
    fn test_frame_size_validation() {
        let mut detector = VadDetector::new(VadConfig::default()).unwrap();
        assert!(detector.is_voiced_frame(&[0i16; 100]).is_err());
    }

    #[test]
    fn test_silence_is_not_voiced() {
        let mut detector = VadDetector::new(VadConfig::default()).unwrap();
        assert!(!detector.is_voiced_frame(&[0i16; 480]).unwrap());
        assert_eq!(detector.push_pcm16_le(&[0u8; 960 * 3]), 0);
    }

    #[test]
    fn partial_frames_are_carried() {
        let mut detector = VadDetector::new(VadConfig::default()).unwrap();
        detector.push_samples(&[0i16; 300]);
        assert_eq!(detector.carry.len(), 300);
        detector.push_samples(&[0i16; 300]);
        assert_eq!(detector.carry.len(), 120);
        detector.reset().unwrap();
        assert!(detector.carry.is_empty());
    }
}
