//! Observable session state, owned by the controller and published through a watch channel.

use serde::Serialize;

/// Session-level phase. Speaking is orthogonal and reported by `SessionState::is_speaking`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Disabled,
    Idle,
    Listening,
    Recording,
    Processing,
}

/// Snapshot of everything a view needs to render voice controls.
///
/// The four flags are independent: server recording and streaming recognition
/// start and stop differently, so `is_recording` and `is_listening` are not
/// folded into one.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionState {
    pub enabled: bool,
    pub is_listening: bool,
    pub is_recording: bool,
    pub is_speaking: bool,
    pub is_processing: bool,
    /// Best current guess for the utterance (or the last submitted one).
    pub transcript: String,
    /// Text still waiting for the auto-submit decision.
    pub pending_transcript: String,
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        if !self.enabled {
            SessionPhase::Disabled
        } else if self.is_processing {
            SessionPhase::Processing
        } else if self.is_recording {
            SessionPhase::Recording
        } else if self.is_listening {
            SessionPhase::Listening
        } else {
            SessionPhase::Idle
        }
    }

    /// Nothing captured, uploaded or played.
    pub fn is_quiet(&self) -> bool {
        !self.is_listening && !self.is_recording && !self.is_speaking && !self.is_processing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_priority() {
        let mut s = SessionState {
            enabled: true,
            ..Default::default()
        };
        assert_eq!(s.phase(), SessionPhase::Idle);
        s.is_listening = true;
        assert_eq!(s.phase(), SessionPhase::Listening);
        s.is_recording = true;
        assert_eq!(s.phase(), SessionPhase::Recording);
        s.is_processing = true;
        assert_eq!(s.phase(), SessionPhase::Processing);
        s.enabled = false;
        assert_eq!(s.phase(), SessionPhase::Disabled);
    }

    #[test]
    fn speaking_does_not_change_phase() {
        let s = SessionState {
            enabled: true,
            is_speaking: true,
            ..Default::default()
        };
        assert_eq!(s.phase(), SessionPhase::Idle);
        assert!(!s.is_quiet());
    }
}
