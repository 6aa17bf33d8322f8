//! World events.
//!
//! Room-wide happenings that fire on their own schedule, independently of what clients
//! send: a choir of autotuned voices, a curse, shuffled voices, and so on. Each event
//! has a [`Cadence`]; after every firing the next occurrence is computed and pushed back
//! into the delayed-action queue of the runtime.

pub mod scheduler;

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info};
use rand::seq::{IteratorRandom, SliceRandom};
use rand::Rng;
use tokio::time::Instant;

use crate::chat::channel::Channel;
use crate::chat::protocol::Outbound;
use crate::config::{CadenceConfig, EventsConfig};
use crate::effects::catalog::EffectSpec;
use crate::effects::Effect;
use crate::metrics;
use scheduler::{DelayedAction, EventScheduler};

/// A user counts as active when they talked within this window.
pub const ACTIVITY_WINDOW: Duration = Duration::from_secs(20 * 60);
/// Users picked per room by the choir and the curse.
pub const CHOSEN_PER_CHANNEL: usize = 3;
/// Shortest interval a jittered cadence may draw.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

const TWO_HOURS: Duration = Duration::from_secs(2 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorldEventKind {
    /// Autotune and reverb on a few recently active users.
    Choir,
    /// Four nasty effects on a few recently active users.
    Curse,
    /// Everyone speaks with someone else's voice.
    VoiceShuffle,
    Amphetamine,
    Tunnel,
    Musical,
}

impl WorldEventKind {
    pub const ALL: [WorldEventKind; 6] = [
        WorldEventKind::Choir,
        WorldEventKind::Curse,
        WorldEventKind::VoiceShuffle,
        WorldEventKind::Amphetamine,
        WorldEventKind::Tunnel,
        WorldEventKind::Musical,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WorldEventKind::Choir => "choir",
            WorldEventKind::Curse => "curse",
            WorldEventKind::VoiceShuffle => "voice_shuffle",
            WorldEventKind::Amphetamine => "amphetamine",
            WorldEventKind::Tunnel => "tunnel",
            WorldEventKind::Musical => "musical",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cadence {
    Fixed(Duration),
    /// Every interval drawn from a normal distribution, clamped to [`MIN_INTERVAL`].
    Gaussian { mean: Duration, std_dev: Duration },
}

impl Cadence {
    pub fn from_config(config: &CadenceConfig) -> Self {
        let mean = Duration::from_secs_f64((config.period_mins * 60.0).max(1.0));
        match config.std_dev_mins {
            Some(sd) if sd > 0.0 => Cadence::Gaussian {
                mean,
                std_dev: Duration::from_secs_f64(sd * 60.0),
            },
            _ => Cadence::Fixed(mean),
        }
    }

    pub fn next_interval(&self, rng: &mut impl Rng) -> Duration {
        match self {
            Cadence::Fixed(period) => *period,
            Cadence::Gaussian { mean, std_dev } => {
                let secs = mean.as_secs_f64() + std_dev.as_secs_f64() * standard_normal(rng);
                Duration::from_secs_f64(secs.max(MIN_INTERVAL.as_secs_f64()))
            }
        }
    }
}

/// Box-Muller draw from N(0, 1).
fn standard_normal(rng: &mut impl Rng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorldEvent {
    pub kind: WorldEventKind,
    pub cadence: Cadence,
}

/// The registered events; a [`DelayedAction::WorldEvent`] refers to one by index.
#[derive(Debug, Clone, Default)]
pub struct WorldEvents {
    events: Vec<WorldEvent>,
}

impl WorldEvents {
    pub fn new(events: Vec<WorldEvent>) -> Self {
        Self { events }
    }

    pub fn from_config(config: &EventsConfig) -> Self {
        if !config.enabled {
            return Self::default();
        }
        let events = config
            .cadences()
            .into_iter()
            .filter_map(|(name, cadence)| {
                WorldEventKind::from_name(name).map(|kind| WorldEvent {
                    kind,
                    cadence: Cadence::from_config(cadence),
                })
            })
            .collect();
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&WorldEvent> {
        self.events.get(index)
    }

    /// Queue the first occurrence of every event.
    pub fn start(&self, timers: &mut EventScheduler, now: Instant, rng: &mut impl Rng) {
        for (index, event) in self.events.iter().enumerate() {
            let due = now + event.cadence.next_interval(rng);
            timers.schedule(due, DelayedAction::WorldEvent(index));
        }
        info!("Scheduled {} world events", self.events.len());
    }

    /// Run the event at `index`, due at `due`, and queue its next occurrence.
    pub fn fire(
        &self,
        index: usize,
        channels: &mut HashMap<String, Channel>,
        timers: &mut EventScheduler,
        due: Instant,
        now: Instant,
        rng: &mut impl Rng,
    ) {
        let Some(event) = self.events.get(index) else {
            debug!("Ignoring unknown world event #{}", index);
            return;
        };
        happen(event.kind, channels, now, rng);
        let fired = metrics::record_event_firing(event.kind.name());
        let mut next = due + event.cadence.next_interval(rng);
        if next <= now {
            next = now + event.cadence.next_interval(rng);
        }
        timers.schedule(next, DelayedAction::WorldEvent(index));
        info!("World event '{}' fired (#{})", event.kind.name(), fired);
    }
}

fn add_timed(channel: &mut Channel, user_id: &str, spec: EffectSpec, timeout: Duration, now: Instant) {
    if let Some(user) = channel.user_mut(user_id) {
        user.effects.add(Effect::new(spec, now).with_timeout(timeout), now);
    }
}

/// Up to [`CHOSEN_PER_CHANNEL`] users who talked recently.
fn chosen_users(channel: &Channel, now: Instant, rng: &mut impl Rng) -> Vec<String> {
    let since = now.checked_sub(ACTIVITY_WINDOW);
    channel
        .users()
        .filter(|u| match since {
            Some(since) => u.is_active_since(since),
            None => u.last_message.is_some(),
        })
        .map(|u| u.id.clone())
        .choose_multiple(rng, CHOSEN_PER_CHANNEL)
}

fn creature_name(channel: &Channel, user_id: &str) -> String {
    channel
        .user(user_id)
        .map(|u| u.persona.name.to_string())
        .unwrap_or_default()
}

/// Apply one event to every room.
pub fn happen(kind: WorldEventKind, channels: &mut HashMap<String, Channel>, now: Instant, rng: &mut impl Rng) {
    for channel in channels.values_mut() {
        match kind {
            WorldEventKind::Choir => {
                for user_id in chosen_users(channel, now, rng) {
                    add_timed(channel, &user_id, EffectSpec::Autotune, TWO_HOURS, now);
                    add_timed(channel, &user_id, EffectSpec::Reverb, TWO_HOURS, now);
                    let msg = format!("{} was visited by the spirit of the good reverb!", creature_name(channel, &user_id));
                    channel.broadcast(&Outbound::event_notification("autotune", msg));
                }
            }
            WorldEventKind::Curse => {
                for user_id in chosen_users(channel, now, rng) {
                    let curse = [
                        EffectSpec::GrandSpeechMaster,
                        EffectSpec::Robot,
                        EffectSpec::Shout,
                        EffectSpec::PitchShift {
                            delta: rng.gen_range(-40..=40),
                        },
                    ];
                    for spec in curse {
                        add_timed(channel, &user_id, spec, TWO_HOURS, now);
                    }
                    let msg = format!("{} has been cursed!", creature_name(channel, &user_id));
                    channel.broadcast(&Outbound::event_notification("curse", msg));
                }
            }
            WorldEventKind::VoiceShuffle => {
                let mut voices: Vec<_> = channel.users().map(|u| u.voice).collect();
                voices.shuffle(rng);
                for (user, voice) in channel.users_mut().zip(voices) {
                    user.effects.add(Effect::new(EffectSpec::VoiceClone(voice), now), now);
                }
                channel.broadcast(&Outbound::event_notification("voice_shuffle", "Voices have been shuffled!"));
            }
            WorldEventKind::Amphetamine => {
                for user in channel.users_mut() {
                    let effect = Effect::new(EffectSpec::SpeedUp { factor: 2.4 }, now).with_timeout(Duration::from_secs(600));
                    user.effects.add(effect, now);
                }
                channel.broadcast(&Outbound::event_notification("amphetamine", "THE ROOM IS ON SPEED!"));
            }
            WorldEventKind::Tunnel => {
                for user in channel.users_mut() {
                    let spec = EffectSpec::BadCellphone {
                        signal: rng.gen_range(1..=2),
                    };
                    user.effects.add(Effect::new(spec, now).with_timeout(Duration::from_secs(300)), now);
                }
                channel.broadcast(&Outbound::event_notification("tunnel", "The room is going through a tunnel!"));
            }
            WorldEventKind::Musical => {
                for user in channel.users_mut() {
                    for spec in [EffectSpec::Rhythmic, EffectSpec::Autotune, EffectSpec::Reverb] {
                        user.effects.add(Effect::new(spec, now).with_timeout(Duration::from_secs(400)), now);
                    }
                }
                channel.broadcast(&Outbound::event_notification("musical", "The room is a musical!"));
            }
        }
    }
}
