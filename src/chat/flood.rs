//! Flood detection with warn-then-ban escalation.
//!
//! Each user keeps the instants of their recent messages. A message floods when the
//! window holds more than `rate * window` messages, or when it fully matches one of
//! the banned-word patterns. The first offence warns; a second one while the warning
//! stands is a ban.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

use crate::config::{FloodConfig, ModerationConfig};

/// Compiled flood rules shared by every user.
#[derive(Debug, Clone)]
pub struct FloodPolicy {
    threshold: usize,
    window: Duration,
    banned_words: Vec<Regex>,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid banned word pattern '{pattern}': {source}")]
pub struct PatternError {
    pattern: String,
    #[source]
    source: regex::Error,
}

impl FloodPolicy {
    pub fn new(threshold: usize, window: Duration, patterns: &[String]) -> Result<Self, PatternError> {
        let banned_words = patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("^(?:{})$", p)).map_err(|source| PatternError {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            threshold,
            window,
            banned_words,
        })
    }

    pub fn from_config(flood: &FloodConfig, moderation: &ModerationConfig) -> Result<Self, PatternError> {
        Self::new(flood.threshold(), flood.window(), &moderation.banned_words)
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Full-match test against every banned pattern.
    pub fn is_banned_text(&self, text: &str) -> bool {
        self.banned_words.iter().any(|re| re.is_match(text))
    }
}

/// Why a message was considered flooding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FloodReason {
    RateExceeded { count: usize, limit: usize },
    BannedWord,
}

impl fmt::Display for FloodReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FloodReason::RateExceeded { count, limit } => {
                write!(f, "{} messages in window (limit {})", count, limit)
            }
            FloodReason::BannedWord => write!(f, "banned word"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FloodVerdict {
    Clean,
    /// First offence. `generation` identifies this warning for its expiry timer.
    Warn { generation: u64, reason: FloodReason },
    Ban { reason: FloodReason },
}

#[derive(Debug, Default, Clone)]
pub struct FloodGuard {
    stamps: VecDeque<Instant>,
    warned: bool,
    generation: u64,
}

impl FloodGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_warned(&self) -> bool {
        self.warned
    }

    /// Record one message and judge it.
    pub fn check(&mut self, policy: &FloodPolicy, text: &str, now: Instant) -> FloodVerdict {
        self.stamps.push_back(now);
        while let Some(oldest) = self.stamps.front() {
            if now.saturating_duration_since(*oldest) >= policy.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }

        let reason = if self.stamps.len() > policy.threshold {
            FloodReason::RateExceeded {
                count: self.stamps.len(),
                limit: policy.threshold,
            }
        } else if policy.is_banned_text(text) {
            FloodReason::BannedWord
        } else {
            return FloodVerdict::Clean;
        };

        if self.warned {
            self.warned = false;
            self.stamps.clear();
            return FloodVerdict::Ban { reason };
        }

        // forgive the overflow only; a user still at the limit re-offends on the next message
        while self.stamps.len() > policy.threshold {
            self.stamps.pop_front();
        }
        self.warned = true;
        self.generation += 1;
        FloodVerdict::Warn {
            generation: self.generation,
            reason,
        }
    }

    /// Lift the warning if it is still the one issued as `generation`.
    pub fn clear_warning(&mut self, generation: u64) -> bool {
        if self.warned && self.generation == generation {
            self.warned = false;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> FloodPolicy {
        FloodPolicy::new(
            12,
            Duration::from_secs(4),
            &[r"(?i).*\bstuff\b.*".to_string(), r"^[0-9]{2}.*".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn threshold_messages_do_not_flag() {
        let policy = policy();
        let mut guard = FloodGuard::new();
        let now = Instant::now();
        for i in 0..12 {
            let at = now + Duration::from_millis(i * 100);
            assert_eq!(guard.check(&policy, "hello", at), FloodVerdict::Clean);
        }
        assert!(matches!(
            guard.check(&policy, "hello", now + Duration::from_millis(1300)),
            FloodVerdict::Warn { generation: 1, reason: FloodReason::RateExceeded { count: 13, limit: 12 } }
        ));
    }

    #[test]
    fn old_messages_leave_the_window() {
        let policy = policy();
        let mut guard = FloodGuard::new();
        let now = Instant::now();
        for i in 0..40u64 {
            let at = now + Duration::from_millis(i * 400);
            assert_eq!(guard.check(&policy, "slow", at), FloodVerdict::Clean);
        }
    }

    #[test]
    fn second_offence_while_warned_bans() {
        let policy = policy();
        let mut guard = FloodGuard::new();
        let now = Instant::now();
        for _ in 0..12 {
            guard.check(&policy, "x", now);
        }
        assert!(matches!(guard.check(&policy, "x", now), FloodVerdict::Warn { .. }));
        assert!(guard.is_warned());
        assert!(matches!(guard.check(&policy, "x", now), FloodVerdict::Ban { .. }));
        assert!(!guard.is_warned());
    }

    #[test]
    fn warning_expires_by_generation() {
        let policy = policy();
        let mut guard = FloodGuard::new();
        let now = Instant::now();
        let FloodVerdict::Warn { generation, .. } = guard.check(&policy, "some stuff", now) else {
            panic!("expected warning");
        };
        assert!(!guard.clear_warning(generation + 1));
        assert!(guard.clear_warning(generation));
        assert!(!guard.is_warned());
        // a fresh offence is only a warning again
        assert!(matches!(
            guard.check(&policy, "STUFF", now),
            FloodVerdict::Warn { reason: FloodReason::BannedWord, .. }
        ));
    }

    #[test]
    fn banned_words_use_full_match() {
        let policy = policy();
        assert!(policy.is_banned_text("something stuff and things"));
        assert!(!policy.is_banned_text("something stuf and things"));
        assert!(policy.is_banned_text("10 something"));
        assert!(!policy.is_banned_text("1 something"));
    }

    #[test]
    fn bad_pattern_is_an_error() {
        assert!(FloodPolicy::new(1, Duration::from_secs(1), &["(".to_string()]).is_err());
    }
}
