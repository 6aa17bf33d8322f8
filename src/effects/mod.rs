//! # Effects
//!
//! Timed transformations attached to a user and folded over each message while it is
//! rendered. Every effect belongs to one of five kinds, which decides the stage of the
//! pipeline it runs at:
//!
//! | Kind            | Input                         | Seen by                  |
//! |-----------------|-------------------------------|--------------------------|
//! | explicit text   | the displayed chat line       | everyone                 |
//! | hidden text     | the spoken text only          | listeners                |
//! | phonemic        | phonemes before synthesis     | listeners                |
//! | voice           | synthesizer parameters        | listeners                |
//! | audio           | rendered PCM                  | listeners                |
//!
//! Effects expire a fixed time after creation. A user holds at most
//! [`MAX_EFFECTS_PER_KIND`] effects of each kind; adding more evicts the oldest.

pub mod catalog;
pub mod value;

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use log::warn;
use serde::Serialize;
use tokio::time::Instant;

pub use catalog::EffectSpec;
pub use value::{AudioClip, EffectValue, Phoneme, VoiceParams};

pub const MAX_EFFECTS_PER_KIND: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    ExplicitText,
    HiddenText,
    Phonemic,
    Voice,
    Audio,
}

impl EffectKind {
    pub const ALL: [EffectKind; 5] = [
        EffectKind::ExplicitText,
        EffectKind::HiddenText,
        EffectKind::Phonemic,
        EffectKind::Voice,
        EffectKind::Audio,
    ];

    fn slot(self) -> usize {
        match self {
            EffectKind::ExplicitText => 0,
            EffectKind::HiddenText => 1,
            EffectKind::Phonemic => 2,
            EffectKind::Voice => 3,
            EffectKind::Audio => 4,
        }
    }

    /// Whether `value` is the input type this kind transforms.
    pub fn accepts(self, value: &EffectValue) -> bool {
        matches!(
            (self, value),
            (EffectKind::ExplicitText | EffectKind::HiddenText, EffectValue::Text(_))
                | (EffectKind::Phonemic, EffectValue::Phonemes(_))
                | (EffectKind::Voice, EffectValue::Voice(_))
                | (EffectKind::Audio, EffectValue::Audio(_))
        )
    }
}

impl fmt::Display for EffectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EffectKind::ExplicitText => "explicit-text",
            EffectKind::HiddenText => "hidden-text",
            EffectKind::Phonemic => "phonemic",
            EffectKind::Voice => "voice",
            EffectKind::Audio => "audio",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EffectError {
    #[error("effect '{effect}' cannot transform a {got} value")]
    KindMismatch { effect: &'static str, got: &'static str },
    #[error("effect '{effect}' has an invalid parameter: {reason}")]
    InvalidParameter { effect: &'static str, reason: String },
}

/// One live effect instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Effect {
    spec: EffectSpec,
    created: Instant,
    timeout: Duration,
}

impl Effect {
    /// Create an effect with its catalog timeout.
    pub fn new(spec: EffectSpec, now: Instant) -> Self {
        let timeout = spec.descriptor().timeout;
        Self {
            spec,
            created: now,
            timeout,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn spec(&self) -> &EffectSpec {
        &self.spec
    }

    pub fn kind(&self) -> EffectKind {
        self.spec.descriptor().kind
    }

    pub fn name(&self) -> String {
        self.spec.display_name()
    }

    pub fn tag(&self) -> &'static str {
        self.spec.descriptor().tag
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn expires_at(&self) -> Instant {
        self.created + self.timeout
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    pub fn apply(&self, value: EffectValue) -> Result<EffectValue, EffectError> {
        self.spec.apply(value)
    }
}

/// Several effects handed out together under one name; they all expire together.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectGroup {
    pub name: &'static str,
    pub tag: &'static str,
    pub timeout: Duration,
    pub members: Vec<EffectSpec>,
}

impl EffectGroup {
    /// Instantiate every member with the group's shared expiry.
    pub fn unpack(&self, now: Instant) -> Vec<Effect> {
        self.members
            .iter()
            .cloned()
            .map(|spec| Effect::new(spec, now).with_timeout(self.timeout))
            .collect()
    }
}

/// What an attack, an object or an event hands to a user.
#[derive(Debug, Clone, PartialEq)]
pub enum EffectBundle {
    Single(Effect),
    Group(EffectGroup),
}

impl EffectBundle {
    pub fn name(&self) -> String {
        match self {
            EffectBundle::Single(e) => e.name(),
            EffectBundle::Group(g) => g.name.to_string(),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            EffectBundle::Single(e) => e.tag(),
            EffectBundle::Group(g) => g.tag,
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            EffectBundle::Single(e) => e.timeout(),
            EffectBundle::Group(g) => g.timeout,
        }
    }
}

impl From<Effect> for EffectBundle {
    fn from(effect: Effect) -> Self {
        EffectBundle::Single(effect)
    }
}

impl From<EffectGroup> for EffectBundle {
    fn from(group: EffectGroup) -> Self {
        EffectBundle::Group(group)
    }
}

/// The five per-kind effect queues of a user.
#[derive(Debug, Clone, Default)]
pub struct EffectQueueSet {
    queues: [VecDeque<Effect>; 5],
}

impl EffectQueueSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an effect, or every member of a group, evicting the oldest past the cap.
    pub fn add(&mut self, bundle: impl Into<EffectBundle>, now: Instant) {
        match bundle.into() {
            EffectBundle::Single(effect) => self.push(effect),
            EffectBundle::Group(group) => {
                for effect in group.unpack(now) {
                    self.push(effect);
                }
            }
        }
    }

    fn push(&mut self, effect: Effect) {
        let queue = &mut self.queues[effect.kind().slot()];
        queue.push_back(effect);
        while queue.len() > MAX_EFFECTS_PER_KIND {
            queue.pop_front();
        }
    }

    /// Fold every live effect of `kind` over `value` in insertion order.
    ///
    /// Expired effects are dropped on the way. An effect that fails is logged and
    /// skipped; the fold continues with the value it was given.
    pub fn apply_all(&mut self, kind: EffectKind, value: EffectValue, now: Instant) -> EffectValue {
        let queue = &mut self.queues[kind.slot()];
        queue.retain(|e| !e.is_expired(now));
        let mut value = value;
        for effect in queue.iter() {
            match effect.apply(value.clone()) {
                Ok(next) => value = next,
                Err(e) => warn!("Skipping effect '{}': {}", effect.name(), e),
            }
        }
        value
    }

    /// Live effects of one kind, oldest first.
    pub fn active(&mut self, kind: EffectKind, now: Instant) -> Vec<Effect> {
        let queue = &mut self.queues[kind.slot()];
        queue.retain(|e| !e.is_expired(now));
        queue.iter().cloned().collect()
    }

    /// Resident effects of one kind, expired or not.
    pub fn len(&self, kind: EffectKind) -> usize {
        self.queues[kind.slot()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    pub fn iter(&self, kind: EffectKind) -> impl Iterator<Item = &Effect> {
        self.queues[kind.slot()].iter()
    }
}

/// Fold a detached list of effects, as the renderer does with its snapshots.
pub fn fold_effects(effects: &[Effect], value: EffectValue) -> EffectValue {
    effects.iter().fold(value, |value, effect| match effect.apply(value.clone()) {
        Ok(next) => next,
        Err(e) => {
            warn!("Skipping effect '{}': {}", effect.name(), e);
            value
        }
    })
}
