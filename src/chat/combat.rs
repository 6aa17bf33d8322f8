//! Dice duels between two users of a room.
//!
//! Both sides roll 1-100; the attacker adds a bonus for every resting period elapsed
//! since their last attack. The outcome decides who, if anyone, receives effects:
//!
//! 1. attacker rolls 100: one global effect on every other user
//! 2. attacker rolls 1, or defender rolls 100: four random effects on the attacker
//! 3. defender rolls 1: four random effects on the defender
//! 4. defender total higher: the effect rebounds (see [`Rebound`])
//! 5. attacker total higher: one random effect on the defender
//! 6. tie: nothing

use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::time::Instant;

use super::channel::Channel;
use crate::effects::catalog::{global_effect, random_effect};
use crate::effects::{Effect, EffectBundle};

/// Effects handed out by a fumble.
pub const FUMBLE_EFFECTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rolls {
    pub attacker: u32,
    pub defender: u32,
    pub attacker_bonus: u32,
    pub defender_bonus: u32,
}

impl Rolls {
    pub fn roll(rng: &mut impl Rng, attacker_bonus: u32) -> Self {
        Self {
            attacker: rng.gen_range(1..=100),
            defender: rng.gen_range(1..=100),
            attacker_bonus,
            defender_bonus: 0,
        }
    }

    pub fn attack_total(&self) -> u32 {
        self.attacker + self.attacker_bonus
    }

    pub fn defense_total(&self) -> u32 {
        self.defender + self.defender_bonus
    }
}

/// Where a rebounding effect lands, from a 1-3 draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rebound {
    Attacker,
    RandomUser,
    Nowhere,
}

impl Rebound {
    pub fn from_draw(draw: u8) -> Self {
        match draw {
            1 => Rebound::Attacker,
            2 => Rebound::RandomUser,
            _ => Rebound::Nowhere,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Global,
    AttackerFumble,
    DefenderFumble,
    Rebound(Rebound),
    Hit,
    Tie,
}

/// Pure decision from the dice and the rebound draw.
pub fn decide(rolls: &Rolls, rebound_draw: u8) -> Outcome {
    if rolls.attacker == 100 {
        Outcome::Global
    } else if rolls.attacker == 1 || rolls.defender == 100 {
        Outcome::AttackerFumble
    } else if rolls.defender == 1 {
        Outcome::DefenderFumble
    } else if rolls.defense_total() > rolls.attack_total() {
        Outcome::Rebound(Rebound::from_draw(rebound_draw))
    } else if rolls.attack_total() > rolls.defense_total() {
        Outcome::Hit
    } else {
        Outcome::Tie
    }
}

/// Attack bonus: one point per full resting period since the last attack.
pub fn attack_bonus(last_attack: Instant, now: Instant, resting: Duration) -> u32 {
    let resting = resting.as_secs().max(1);
    (now.saturating_duration_since(last_attack).as_secs() / resting) as u32
}

fn fumble(who: &str, now: Instant, rng: &mut impl Rng) -> Vec<(String, EffectBundle)> {
    (0..FUMBLE_EFFECTS)
        .map(|_| (who.to_string(), random_effect(now, rng)))
        .collect()
}

/// Turn an outcome into `(user id, effect)` assignments. Nothing is applied here.
pub fn assign(
    outcome: Outcome,
    attacker: &str,
    defender: &str,
    channel: &Channel,
    now: Instant,
    rng: &mut impl Rng,
) -> Vec<(String, EffectBundle)> {
    match outcome {
        Outcome::Global => {
            let spec = global_effect(rng);
            channel
                .users()
                .filter(|u| u.id != attacker)
                .map(|u| (u.id.clone(), EffectBundle::from(Effect::new(spec.clone(), now))))
                .collect()
        }
        Outcome::AttackerFumble => fumble(attacker, now, rng),
        Outcome::DefenderFumble => fumble(defender, now, rng),
        Outcome::Rebound(Rebound::Attacker) => vec![(attacker.to_string(), random_effect(now, rng))],
        Outcome::Rebound(Rebound::RandomUser) => {
            let others: Vec<&str> = channel
                .users()
                .map(|u| u.id.as_str())
                .filter(|id| *id != attacker)
                .collect();
            let target = others.choose(rng).copied().unwrap_or(attacker).to_string();
            vec![(target, random_effect(now, rng))]
        }
        Outcome::Rebound(Rebound::Nowhere) | Outcome::Tie => Vec::new(),
        Outcome::Hit => vec![(defender.to_string(), random_effect(now, rng))],
    }
}
