//! Values flowing through effect folds.

use serde::{Deserialize, Serialize};

/// Synthesizer parameters of a persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoiceParams {
    /// Words per minute, 90..=169 when derived from an identity.
    pub speed: u16,
    /// Base pitch, 0..=99.
    pub pitch: u16,
    /// Index into the renderer's voice bank.
    pub voice_id: u8,
}

impl VoiceParams {
    pub const MIN_SPEED: u16 = 20;
    pub const MAX_SPEED: u16 = 450;
    pub const MAX_PITCH: u16 = 99;
}

/// One phoneme of a synthesized utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phoneme {
    pub symbol: String,
    pub duration_ms: u32,
    /// Pitch target in Hz; 0 for unvoiced phonemes.
    pub pitch_hz: u32,
}

impl Phoneme {
    pub fn new(symbol: impl Into<String>, duration_ms: u32, pitch_hz: u32) -> Self {
        Self {
            symbol: symbol.into(),
            duration_ms,
            pitch_hz,
        }
    }

    pub fn is_vowel(&self) -> bool {
        matches!(
            self.symbol.as_str(),
            "a" | "e" | "E" | "i" | "o" | "O" | "u" | "y" | "2" | "9" | "@" | "a~" | "e~" | "o~" | "9~"
        )
    }
}

/// Mono 16-bit PCM.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioClip {
    pub sample_rate: u32,
    pub samples: Vec<i16>,
}

impl AudioClip {
    pub fn new(sample_rate: u32, samples: Vec<i16>) -> Self {
        Self {
            sample_rate,
            samples,
        }
    }

    /// Encode as a canonical 44-byte-header WAV file.
    pub fn to_wav(&self) -> Vec<u8> {
        let data_len = (self.samples.len() * 2) as u32;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&self.sample_rate.to_le_bytes());
        out.extend_from_slice(&(self.sample_rate * 2).to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    /// Parse raw little-endian PCM; a trailing odd byte is ignored.
    pub fn from_pcm_le(sample_rate: u32, bytes: &[u8]) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self::new(sample_rate, samples)
    }
}

/// Input and output of one effect application.
#[derive(Debug, Clone, PartialEq)]
pub enum EffectValue {
    Text(String),
    Phonemes(Vec<Phoneme>),
    Voice(VoiceParams),
    Audio(AudioClip),
}
