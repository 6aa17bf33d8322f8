//! The concrete effects, their descriptors and the random draws used by combat,
//! objects and world events.

use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::time::Instant;

use super::{Effect, EffectBundle, EffectError, EffectGroup, EffectKind, EffectValue};
use super::value::{AudioClip, Phoneme, VoiceParams};

/// Static facts about an effect variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectDescriptor {
    pub name: &'static str,
    pub tag: &'static str,
    pub kind: EffectKind,
    pub timeout: Duration,
}

const fn descriptor(name: &'static str, tag: &'static str, kind: EffectKind, secs: u64) -> EffectDescriptor {
    EffectDescriptor {
        name,
        tag,
        kind,
        timeout: Duration::from_secs(secs),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EffectSpec {
    // explicit text
    Shout,
    Skyblog,
    Stutter,
    // hidden text
    Tourette,
    SpeechMaster,
    // phonemic
    Autotune,
    Rhythmic,
    PitchRandomizer,
    VowelExchange,
    Crapwe { intensity: u8 },
    GrandSpeechMaster,
    // voice
    SpeedUp { factor: f32 },
    PitchShift { delta: i16 },
    VoiceClone(VoiceParams),
    // audio
    Reverb,
    Robot,
    BadCellphone { signal: u8 },
    Ghost,
}

const TOURETTE_WORDS: &[&str] = &["dammit", "crap", "bloody hell", "shoot", "bugger", "blimey"];
const HESITATIONS: &[&str] = &["uh", "hmm", "like", "you know", "well"];
const EXCHANGE_VOWELS: &[&str] = &["a", "e", "i", "o", "u", "y"];
/// Pitch classes of the major scale.
const MAJOR_SCALE: [i32; 7] = [0, 2, 4, 5, 7, 9, 11];

impl EffectSpec {
    pub fn descriptor(&self) -> EffectDescriptor {
        use EffectKind::*;
        match self {
            EffectSpec::Shout => descriptor("shouty", "shout", ExplicitText, 120),
            EffectSpec::Skyblog => descriptor("skyblog", "skyblog", ExplicitText, 120),
            EffectSpec::Stutter => descriptor("b-b-bad day", "stutter", ExplicitText, 150),
            EffectSpec::Tourette => descriptor("tourette syndrome", "tourette", HiddenText, 120),
            EffectSpec::SpeechMaster => descriptor("master of elocution", "speech_master", HiddenText, 120),
            EffectSpec::Autotune => descriptor("loud and talented", "autotune", Phonemic, 150),
            EffectSpec::Rhythmic => descriptor("rhythm section", "rhythmic", Phonemic, 150),
            EffectSpec::PitchRandomizer => descriptor("sore throat", "pitch_randomizer", Phonemic, 150),
            EffectSpec::VowelExchange => descriptor("huh, what?", "vowel_exchange", Phonemic, 200),
            EffectSpec::Crapwe { .. } => descriptor("crapwe force", "crapwe", Phonemic, 150),
            EffectSpec::GrandSpeechMaster => descriptor("grand master of elocution", "grand_speech_master", Phonemic, 150),
            EffectSpec::SpeedUp { .. } => descriptor("stressed out", "speedup", Voice, 150),
            EffectSpec::PitchShift { .. } => descriptor("helium", "pitch_shift", Voice, 150),
            EffectSpec::VoiceClone(_) => descriptor("voice thief", "voice_clone", Voice, 300),
            EffectSpec::Reverb => descriptor("reverbman", "reverb", Audio, 180),
            EffectSpec::Robot => descriptor("cyborg", "robot", Audio, 180),
            EffectSpec::BadCellphone { .. } => descriptor("bad signal", "bad_cellphone", Audio, 300),
            EffectSpec::Ghost => descriptor("ghost", "ghost", Audio, 120),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            EffectSpec::Crapwe { intensity } => format!("{} {}", self.descriptor().name, intensity),
            _ => self.descriptor().name.to_string(),
        }
    }

    pub fn apply(&self, value: EffectValue) -> Result<EffectValue, EffectError> {
        let name = self.descriptor().name;
        if !self.descriptor().kind.accepts(&value) {
            return Err(EffectError::KindMismatch {
                effect: name,
                got: value_name(&value),
            });
        }
        let mut rng = rand::thread_rng();
        match (self, value) {
            (EffectSpec::Shout, EffectValue::Text(t)) => Ok(EffectValue::Text(format!("{}!!!", t.to_uppercase()))),
            (EffectSpec::Skyblog, EffectValue::Text(t)) => Ok(EffectValue::Text(skyblog(&t))),
            (EffectSpec::Stutter, EffectValue::Text(t)) => Ok(EffectValue::Text(stutter(&t, &mut rng))),
            (EffectSpec::Tourette, EffectValue::Text(t)) => {
                Ok(EffectValue::Text(interject(&t, TOURETTE_WORDS, 4, &mut rng)))
            }
            (EffectSpec::SpeechMaster, EffectValue::Text(t)) => {
                Ok(EffectValue::Text(interject(&t, HESITATIONS, 3, &mut rng)))
            }
            (EffectSpec::Autotune, EffectValue::Phonemes(p)) => Ok(EffectValue::Phonemes(autotune(p))),
            (EffectSpec::Rhythmic, EffectValue::Phonemes(p)) => Ok(EffectValue::Phonemes(rhythmic(p))),
            (EffectSpec::PitchRandomizer, EffectValue::Phonemes(mut p)) => {
                for ph in p.iter_mut().filter(|ph| ph.pitch_hz > 0) {
                    ph.pitch_hz = (ph.pitch_hz as f32 * rng.gen_range(0.7..1.4)) as u32;
                }
                Ok(EffectValue::Phonemes(p))
            }
            (EffectSpec::VowelExchange, EffectValue::Phonemes(mut p)) => {
                for ph in p.iter_mut().filter(|ph| ph.is_vowel()) {
                    if let Some(v) = EXCHANGE_VOWELS.choose(&mut rng) {
                        ph.symbol = v.to_string();
                    }
                }
                Ok(EffectValue::Phonemes(p))
            }
            (EffectSpec::Crapwe { intensity }, EffectValue::Phonemes(mut p)) => {
                if !(1..=5).contains(intensity) {
                    return Err(EffectError::InvalidParameter {
                        effect: name,
                        reason: format!("intensity {} outside 1..=5", intensity),
                    });
                }
                let max = 1.0 + *intensity as f32;
                for ph in p.iter_mut() {
                    ph.duration_ms = (ph.duration_ms as f32 * rng.gen_range(1.0..max)) as u32;
                }
                Ok(EffectValue::Phonemes(p))
            }
            (EffectSpec::GrandSpeechMaster, EffectValue::Phonemes(mut p)) => {
                for ph in p.iter_mut().filter(|ph| ph.is_vowel()) {
                    ph.duration_ms = ph.duration_ms.saturating_mul(3);
                }
                Ok(EffectValue::Phonemes(p))
            }
            (EffectSpec::SpeedUp { factor }, EffectValue::Voice(v)) => {
                if !factor.is_finite() || *factor <= 0.0 {
                    return Err(EffectError::InvalidParameter {
                        effect: name,
                        reason: format!("speed factor {}", factor),
                    });
                }
                let speed = (v.speed as f32 * factor).round() as u32;
                let speed = speed.clamp(VoiceParams::MIN_SPEED as u32, VoiceParams::MAX_SPEED as u32) as u16;
                Ok(EffectValue::Voice(VoiceParams { speed, ..v }))
            }
            (EffectSpec::PitchShift { delta }, EffectValue::Voice(v)) => {
                let pitch = (v.pitch as i32 + *delta as i32).clamp(0, VoiceParams::MAX_PITCH as i32) as u16;
                Ok(EffectValue::Voice(VoiceParams { pitch, ..v }))
            }
            (EffectSpec::VoiceClone(params), EffectValue::Voice(_)) => Ok(EffectValue::Voice(*params)),
            (EffectSpec::Reverb, EffectValue::Audio(clip)) => Ok(EffectValue::Audio(reverb(clip))),
            (EffectSpec::Robot, EffectValue::Audio(clip)) => Ok(EffectValue::Audio(ring_modulate(clip, 50.0))),
            (EffectSpec::BadCellphone { signal }, EffectValue::Audio(clip)) => {
                if !(1..=3).contains(signal) {
                    return Err(EffectError::InvalidParameter {
                        effect: name,
                        reason: format!("signal strength {} outside 1..=3", signal),
                    });
                }
                Ok(EffectValue::Audio(bad_cellphone(clip, *signal, &mut rng)))
            }
            (EffectSpec::Ghost, EffectValue::Audio(mut clip)) => {
                clip.samples.reverse();
                Ok(EffectValue::Audio(clip))
            }
            (_, value) => Err(EffectError::KindMismatch {
                effect: name,
                got: value_name(&value),
            }),
        }
    }
}

fn value_name(value: &EffectValue) -> &'static str {
    match value {
        EffectValue::Text(_) => "text",
        EffectValue::Phonemes(_) => "phonemes",
        EffectValue::Voice(_) => "voice",
        EffectValue::Audio(_) => "audio",
    }
}

fn skyblog(text: &str) -> String {
    let mut letters = 0usize;
    text.chars()
        .flat_map(|c| {
            if c.is_alphabetic() {
                letters += 1;
                if letters % 2 == 1 {
                    c.to_uppercase().collect::<Vec<_>>()
                } else {
                    c.to_lowercase().collect::<Vec<_>>()
                }
            } else {
                vec![c]
            }
        })
        .collect()
}

fn stutter(text: &str, rng: &mut impl Rng) -> String {
    text.split_whitespace()
        .map(|word| {
            let first = word.chars().next();
            match first {
                Some(c) if c.is_alphabetic() && word.chars().count() > 1 && rng.gen_ratio(1, 3) => {
                    format!("{c}-{c}-{word}")
                }
                _ => word.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Insert a word from `pool` after each word with probability 1/`one_in`.
fn interject(text: &str, pool: &[&str], one_in: u32, rng: &mut impl Rng) -> String {
    let mut out: Vec<&str> = Vec::new();
    for word in text.split_whitespace() {
        out.push(word);
        if rng.gen_ratio(1, one_in) {
            if let Some(extra) = pool.choose(rng) {
                out.push(*extra);
            }
        }
    }
    out.join(" ")
}

fn snap_to_scale(hz: u32) -> u32 {
    let midi = 69.0 + 12.0 * (hz as f64 / 440.0).log2();
    let rounded = midi.round() as i32;
    let octave = rounded.div_euclid(12);
    let class = rounded.rem_euclid(12);
    let snapped = MAJOR_SCALE
        .iter()
        .copied()
        .min_by_key(|c| (c - class).abs())
        .unwrap_or(0);
    let note = octave * 12 + snapped;
    (440.0 * 2f64.powf((note as f64 - 69.0) / 12.0)).round() as u32
}

fn autotune(mut phonemes: Vec<Phoneme>) -> Vec<Phoneme> {
    for ph in phonemes.iter_mut().filter(|ph| ph.pitch_hz > 0) {
        ph.pitch_hz = snap_to_scale(ph.pitch_hz);
    }
    phonemes
}

fn rhythmic(mut phonemes: Vec<Phoneme>) -> Vec<Phoneme> {
    const BEATS: [u32; 2] = [300, 150];
    for (i, ph) in phonemes.iter_mut().filter(|ph| ph.is_vowel()).enumerate() {
        ph.duration_ms = BEATS[i % 2];
    }
    phonemes
}

fn clamp_sample(v: f32) -> i16 {
    v.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

fn reverb(clip: AudioClip) -> AudioClip {
    let delay = (clip.sample_rate as usize * 60 / 1000).max(1);
    let mut out: Vec<f32> = clip.samples.iter().map(|s| *s as f32).collect();
    out.resize(clip.samples.len() + delay * 3, 0.0);
    for i in delay..out.len() {
        out[i] += out[i - delay] * 0.4;
    }
    AudioClip::new(clip.sample_rate, out.into_iter().map(clamp_sample).collect())
}

fn ring_modulate(clip: AudioClip, carrier_hz: f32) -> AudioClip {
    let rate = clip.sample_rate.max(1) as f32;
    let samples = clip
        .samples
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let t = i as f32 / rate;
            clamp_sample(*s as f32 * (2.0 * std::f32::consts::PI * carrier_hz * t).sin())
        })
        .collect();
    AudioClip::new(clip.sample_rate, samples)
}

fn bad_cellphone(clip: AudioClip, signal: u8, rng: &mut impl Rng) -> AudioClip {
    let dropped_bits = 12 - 2 * signal as u32;
    let chunk = (clip.sample_rate as usize / 20).max(1);
    let mut samples: Vec<i16> = clip.samples.iter().map(|s| (s >> dropped_bits) << dropped_bits).collect();
    for block in samples.chunks_mut(chunk) {
        if rng.gen_ratio((4 - signal) as u32, 8) {
            block.iter_mut().for_each(|s| *s = 0);
        }
    }
    AudioClip::new(clip.sample_rate, samples)
}

/// Effects used by the global branch of an attack.
pub fn global_effect(rng: &mut impl Rng) -> EffectSpec {
    match rng.gen_range(0..4) {
        0 => EffectSpec::Tourette,
        1 => EffectSpec::Shout,
        2 => EffectSpec::Crapwe {
            intensity: rng.gen_range(1..=5),
        },
        _ => EffectSpec::VowelExchange,
    }
}

pub fn drunk_group() -> EffectGroup {
    EffectGroup {
        name: "drunk",
        tag: "drunk",
        timeout: Duration::from_secs(300),
        members: vec![
            EffectSpec::Stutter,
            EffectSpec::SpeedUp { factor: 0.7 },
            EffectSpec::PitchRandomizer,
        ],
    }
}

pub fn angry_robot_group() -> EffectGroup {
    EffectGroup {
        name: "angry robot",
        tag: "angry_robot",
        timeout: Duration::from_secs(180),
        members: vec![EffectSpec::Shout, EffectSpec::Robot],
    }
}

/// Uniform draw over every single effect and group handed out by attacks and scrolls.
pub fn random_effect(now: Instant, rng: &mut impl Rng) -> EffectBundle {
    let spec = match rng.gen_range(0..17) {
        0 => EffectSpec::Shout,
        1 => EffectSpec::Skyblog,
        2 => EffectSpec::Stutter,
        3 => EffectSpec::Tourette,
        4 => EffectSpec::SpeechMaster,
        5 => EffectSpec::Autotune,
        6 => EffectSpec::Rhythmic,
        7 => EffectSpec::PitchRandomizer,
        8 => EffectSpec::VowelExchange,
        9 => EffectSpec::Crapwe {
            intensity: rng.gen_range(1..=5),
        },
        10 => EffectSpec::GrandSpeechMaster,
        11 => EffectSpec::SpeedUp {
            factor: rng.gen_range(1.5..2.5),
        },
        12 => EffectSpec::PitchShift {
            delta: rng.gen_range(-40..=40),
        },
        13 => EffectSpec::Reverb,
        14 => EffectSpec::Robot,
        15 => return EffectBundle::Group(drunk_group()),
        _ => return EffectBundle::Group(angry_robot_group()),
    };
    EffectBundle::Single(Effect::new(spec, now))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice() -> VoiceParams {
        VoiceParams {
            speed: 100,
            pitch: 50,
            voice_id: 3,
        }
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let err = EffectSpec::Shout.apply(EffectValue::Voice(voice())).unwrap_err();
        assert!(matches!(err, EffectError::KindMismatch { got: "voice", .. }));
    }

    #[test]
    fn pitch_shift_clamps() {
        let out = EffectSpec::PitchShift { delta: 90 }
            .apply(EffectValue::Voice(voice()))
            .unwrap();
        assert_eq!(out, EffectValue::Voice(VoiceParams { pitch: 99, ..voice() }));
    }

    #[test]
    fn speedup_scales_speed() {
        let out = EffectSpec::SpeedUp { factor: 2.0 }
            .apply(EffectValue::Voice(voice()))
            .unwrap();
        assert_eq!(out, EffectValue::Voice(VoiceParams { speed: 200, ..voice() }));
    }

    #[test]
    fn autotune_snaps_to_scale() {
        // 440 Hz is A, already in C major; 466 Hz (A#) snaps to A or B
        assert_eq!(snap_to_scale(440), 440);
        let snapped = snap_to_scale(466);
        assert!(snapped == 440 || snapped == 494, "got {}", snapped);
    }

    #[test]
    fn grand_speech_master_stretches_vowels_only() {
        let input = vec![Phoneme::new("b", 50, 0), Phoneme::new("a", 100, 120)];
        let out = EffectSpec::GrandSpeechMaster
            .apply(EffectValue::Phonemes(input))
            .unwrap();
        assert_eq!(
            out,
            EffectValue::Phonemes(vec![Phoneme::new("b", 50, 0), Phoneme::new("a", 300, 120)])
        );
    }

    #[test]
    fn reverb_extends_the_tail() {
        let clip = AudioClip::new(1000, vec![1000; 10]);
        let out = reverb(clip);
        assert_eq!(out.samples.len(), 10 + 60 * 3);
        assert_eq!(out.samples[0], 1000);
    }

    #[test]
    fn ghost_reverses() {
        let out = EffectSpec::Ghost
            .apply(EffectValue::Audio(AudioClip::new(8000, vec![1, 2, 3])))
            .unwrap();
        assert_eq!(out, EffectValue::Audio(AudioClip::new(8000, vec![3, 2, 1])));
    }

    #[test]
    fn crapwe_rejects_bad_intensity() {
        assert!(EffectSpec::Crapwe { intensity: 9 }
            .apply(EffectValue::Phonemes(vec![]))
            .is_err());
        assert_eq!(EffectSpec::Crapwe { intensity: 2 }.display_name(), "crapwe force 2");
    }

    #[test]
    fn random_effects_have_names() {
        let now = Instant::now();
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let bundle = random_effect(now, &mut rng);
            assert!(!bundle.name().is_empty());
            assert!(bundle.timeout() > Duration::ZERO);
        }
    }
}
