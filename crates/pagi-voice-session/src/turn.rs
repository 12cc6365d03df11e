//! Utterance finalization: when is the user done talking?
//!
//! `AutoSubmitPolicy` is a pure state machine (`Idle → Accumulating → Finalized | Abandoned`)
//! fed with transcript updates and timestamps. It never sleeps; the session asks it for
//! the next deadline and calls back when that deadline passes. Clearing a deadline is
//! therefore all it takes to cancel a timer.
//!
//! An utterance finalizes on the first of:
//! - an authoritative final result with confidence ≥ `min_confidence`
//! - hands-free silence: `silence_timeout` since the last speech, with something pending
//! - auto-send: more than `auto_send_threshold` chars ending at a clause boundary, after a
//!   short grace period for trailing words

use crate::config::VoiceSessionConfig;
use crate::error::{VoiceError, VoiceResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Decides whether pending text looks like a finished clause.
pub trait ClauseBoundary: Send + Sync {
    fn is_clause_end(&self, text: &str) -> bool;
}

static CLAUSE_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:[.!?…。！？]\s*|\S\s+)$").expect("clause-end pattern is valid")
});

/// Terminal punctuation, or whitespace after a completed word.
#[derive(Debug, Default, Clone, Copy)]
pub struct PunctuationBoundary;

impl ClauseBoundary for PunctuationBoundary {
    fn is_clause_end(&self, text: &str) -> bool {
        CLAUSE_END.is_match(text)
    }
}

/// Clause boundary from a caller-supplied regex (matched against the whole pending text).
#[derive(Debug, Clone)]
pub struct RegexClauseBoundary {
    re: Regex,
}

impl RegexClauseBoundary {
    pub fn new(pattern: &str) -> VoiceResult<Self> {
        let re = Regex::new(pattern).map_err(|e| VoiceError::Config(format!("auto_send_pattern: {}", e)))?;
        Ok(Self { re })
    }
}

impl ClauseBoundary for RegexClauseBoundary {
    fn is_clause_end(&self, text: &str) -> bool {
        self.re.is_match(text)
    }
}

/// Engines that report no confidence are trusted.
pub fn is_confident(confidence: Option<f32>, min_confidence: f32) -> bool {
    confidence.unwrap_or(1.0) >= min_confidence
}

/// The boundary a config asks for.
pub fn boundary_for(config: &VoiceSessionConfig) -> VoiceResult<Arc<dyn ClauseBoundary>> {
    match config.auto_send_pattern.as_deref() {
        Some(pattern) => Ok(Arc::new(RegexClauseBoundary::new(pattern)?)),
        None => Ok(Arc::new(PunctuationBoundary)),
    }
}

/// Policy knobs, taken from the session config.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyConfig {
    pub hands_free: bool,
    pub silence_timeout: Duration,
    pub min_confidence: f32,
    /// 0 disables auto-send.
    pub auto_send_threshold: usize,
    pub auto_send_grace: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self::from(&VoiceSessionConfig::default())
    }
}

impl From<&VoiceSessionConfig> for PolicyConfig {
    fn from(c: &VoiceSessionConfig) -> Self {
        Self {
            hands_free: c.continuous_listening,
            silence_timeout: c.silence_timeout(),
            min_confidence: c.min_confidence,
            auto_send_threshold: c.auto_send_threshold,
            auto_send_grace: c.auto_send_grace(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtterancePhase {
    Idle,
    Accumulating,
    Finalized,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeTrigger {
    FinalResult,
    Silence,
    AutoSend,
}

/// The one authoritative result of an utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalization {
    /// Empty only for a silence finalization driven purely by voiced audio (server recording).
    pub text: String,
    pub trigger: FinalizeTrigger,
}

/// Per-utterance auto-submit state machine.
pub struct AutoSubmitPolicy {
    config: PolicyConfig,
    boundary: Arc<dyn ClauseBoundary>,
    phase: UtterancePhase,

    // Authoritative finals, each followed by a space
    committed: String,
    // Latest provisional text
    interim: String,
    // Voiced audio seen (recording path)
    voiced: bool,

    last_speech: Option<Instant>,
    grace_deadline: Option<Instant>,
}

impl AutoSubmitPolicy {
    pub fn new(config: PolicyConfig, boundary: Arc<dyn ClauseBoundary>) -> Self {
        Self {
            config,
            boundary,
            phase: UtterancePhase::Idle,
            committed: String::new(),
            interim: String::new(),
            voiced: false,
            last_speech: None,
            grace_deadline: None,
        }
    }

    /// Swap knobs mid-session. Pending text is kept; deadlines are recomputed from it.
    pub fn reconfigure(&mut self, config: PolicyConfig, boundary: Arc<dyn ClauseBoundary>) {
        self.config = config;
        self.boundary = boundary;
        if self.config.auto_send_threshold == 0 {
            self.grace_deadline = None;
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn phase(&self) -> UtterancePhase {
        self.phase
    }

    /// Committed finals plus the current interim text.
    pub fn pending(&self) -> String {
        let mut s = String::with_capacity(self.committed.len() + self.interim.len());
        s.push_str(&self.committed);
        s.push_str(&self.interim);
        s
    }

    fn has_text(&self) -> bool {
        !self.committed.trim().is_empty() || !self.interim.trim().is_empty()
    }

    /// Start a fresh utterance (`Idle`), dropping anything left from the previous one.
    pub fn begin(&mut self) {
        self.clear();
        self.phase = UtterancePhase::Idle;
    }

    /// Stop mid-utterance without emitting anything.
    pub fn abandon(&mut self) {
        if self.phase == UtterancePhase::Accumulating {
            debug!("🗑️ Utterance abandoned ({} chars pending)", self.pending().len());
            self.phase = UtterancePhase::Abandoned;
        }
        self.clear();
    }

    fn clear(&mut self) {
        self.committed.clear();
        self.interim.clear();
        self.voiced = false;
        self.last_speech = None;
        self.grace_deadline = None;
    }

    fn accepting(&mut self) -> bool {
        match self.phase {
            UtterancePhase::Idle => {
                self.phase = UtterancePhase::Accumulating;
                true
            }
            UtterancePhase::Accumulating => true,
            UtterancePhase::Finalized | UtterancePhase::Abandoned => false,
        }
    }

    /// Provisional text replaced the previous provisional text.
    pub fn observe_interim(&mut self, text: &str, now: Instant) -> Option<Finalization> {
        if !self.accepting() {
            debug!("Interim after utterance closed, ignoring");
            return None;
        }
        self.interim.clear();
        self.interim.push_str(text);
        self.last_speech = Some(now);
        self.arm_auto_send(now);
        None
    }

    /// An engine-final segment. Finalizes immediately when confident enough.
    pub fn observe_final(&mut self, text: &str, confidence: Option<f32>, now: Instant) -> Option<Finalization> {
        if !self.accepting() {
            debug!("Final after utterance closed, ignoring");
            return None;
        }
        self.last_speech = Some(now);
        self.interim.clear();

        if !is_confident(confidence, self.config.min_confidence) {
            debug!("Final result below confidence ({:?} < {:.2}), dropped", confidence, self.config.min_confidence);
            return None;
        }
        let text = text.trim();
        if !text.is_empty() {
            self.committed.push_str(text);
            self.committed.push(' ');
        }
        if !self.has_text() {
            return None;
        }
        Some(self.finalize(FinalizeTrigger::FinalResult))
    }

    /// Voiced audio without text (server recording). Counts as speech for the silence timer.
    pub fn observe_activity(&mut self, now: Instant) {
        if self.accepting() {
            self.voiced = true;
            self.last_speech = Some(now);
        }
    }

    fn arm_auto_send(&mut self, now: Instant) {
        let threshold = self.config.auto_send_threshold;
        if threshold == 0 || self.grace_deadline.is_some() {
            return;
        }
        let pending = self.pending();
        if pending.chars().count() > threshold && self.boundary.is_clause_end(&pending) {
            debug!("✂️ Clause end after {} chars, auto-send in {:?}", pending.chars().count(), self.config.auto_send_grace);
            self.grace_deadline = Some(now + self.config.auto_send_grace);
        }
    }

    fn silence_deadline(&self) -> Option<Instant> {
        if !self.config.hands_free || self.phase != UtterancePhase::Accumulating {
            return None;
        }
        if !self.has_text() && !self.voiced {
            return None;
        }
        self.last_speech.map(|t| t + self.config.silence_timeout)
    }

    /// Earliest pending timer, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.phase != UtterancePhase::Accumulating {
            return None;
        }
        match (self.silence_deadline(), self.grace_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire whichever deadline has passed; the earlier one wins when both have.
    pub fn on_deadline(&mut self, now: Instant) -> Option<Finalization> {
        if self.phase != UtterancePhase::Accumulating {
            return None;
        }
        let silence = self.silence_deadline().filter(|d| *d <= now);
        let grace = self.grace_deadline.filter(|d| *d <= now);
        let trigger = match (silence, grace) {
            (Some(s), Some(g)) if g < s => FinalizeTrigger::AutoSend,
            (Some(_), _) => FinalizeTrigger::Silence,
            (None, Some(_)) => FinalizeTrigger::AutoSend,
            (None, None) => return None,
        };
        if trigger == FinalizeTrigger::AutoSend && !self.has_text() {
            self.grace_deadline = None;
            return None;
        }
        Some(self.finalize(trigger))
    }

    fn finalize(&mut self, trigger: FinalizeTrigger) -> Finalization {
        let text = self.pending();
        info!("✅ Utterance finalized by {:?}: {:?}", trigger, text);
        self.clear();
        self.phase = UtterancePhase::Finalized;
        Finalization { text, trigger }
    }
}
