//! Speech rendering collaborators.
//!
//! The runtime never awaits a renderer itself: it builds a [`RenderJob`] holding
//! everything the render needs (snapshots of the speaker's phonemic and audio effects
//! included), spawns the call, and gets the result back as an event.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::session::SessionId;
use crate::config::RendererConfig;
use crate::effects::{fold_effects, AudioClip, Effect, EffectValue, Phoneme, VoiceParams};

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to run renderer: {0}")]
    Io(#[from] std::io::Error),
    #[error("renderer timed out after {0:?}")]
    Timeout(Duration),
    #[error("renderer exited with {0}")]
    Failed(std::process::ExitStatus),
    #[error("render task aborted")]
    Aborted,
}

/// Message kinds that go through the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpokenKind {
    /// Regular chat line.
    Msg,
    /// Sound broadcaster speaking without a text line.
    AudioOnly,
}

#[derive(Debug, Clone)]
pub struct RenderJob {
    pub channel: String,
    pub user_id: String,
    pub session: SessionId,
    /// Issue order among the renders of `session`.
    pub seq: u64,
    pub kind: SpokenKind,
    /// What the room reads, after explicit text effects.
    pub displayed: String,
    /// What the room hears, after hidden text effects.
    pub spoken: String,
    pub lang: String,
    /// Voice after voice effects.
    pub voice: VoiceParams,
    pub phonemic: Vec<Effect>,
    pub audio: Vec<Effect>,
    pub shadowbanned: bool,
}

pub type Finished = (RenderJob, Result<Option<Bytes>, RenderError>);

/// Holds back finished renders until every earlier render of the same session is done,
/// so a speaker's lines reach the room in the order they were sent.
#[derive(Debug, Default)]
pub struct RenderSequencer {
    lanes: HashMap<SessionId, Lane>,
}

#[derive(Debug, Default)]
struct Lane {
    issued: u64,
    next: u64,
    ready: BTreeMap<u64, Finished>,
}

impl RenderSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number for the next render of `session`.
    pub fn issue(&mut self, session: SessionId) -> u64 {
        let lane = self.lanes.entry(session).or_default();
        let seq = lane.issued;
        lane.issued += 1;
        seq
    }

    /// Record a finished render and return every render now deliverable, in issue order.
    pub fn complete(&mut self, job: RenderJob, result: Result<Option<Bytes>, RenderError>) -> Vec<Finished> {
        let session = job.session;
        let Some(lane) = self.lanes.get_mut(&session) else {
            return vec![(job, result)];
        };
        lane.ready.insert(job.seq, (job, result));
        let mut out = Vec::new();
        while let Some(finished) = lane.ready.remove(&lane.next) {
            lane.next += 1;
            out.push(finished);
        }
        if lane.next == lane.issued {
            self.lanes.remove(&session);
        }
        out
    }

    /// Sessions with renders still in flight.
    pub fn in_flight(&self) -> usize {
        self.lanes.len()
    }
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render a job to an encoded clip. `None` means there is nothing to play.
    async fn render(&self, job: &RenderJob) -> Result<Option<Bytes>, RenderError>;
}

/// Text-only chat.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentRenderer;

#[async_trait]
impl Renderer for SilentRenderer {
    async fn render(&self, _job: &RenderJob) -> Result<Option<Bytes>, RenderError> {
        Ok(None)
    }
}

/// Built-in babble synthesizer: one tone per vowel, a hiss per consonant.
///
/// Every effect stage applies, which makes it the reference pipeline for tests.
#[derive(Debug, Clone, Copy)]
pub struct SynthRenderer {
    pub sample_rate: u32,
}

impl SynthRenderer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1000),
        }
    }

    pub fn synthesize(&self, job: &RenderJob) -> Option<AudioClip> {
        let phonemes = text_to_phonemes(&job.spoken, &job.voice);
        if phonemes.is_empty() {
            return None;
        }
        let phonemes = match fold_effects(&job.phonemic, EffectValue::Phonemes(phonemes)) {
            EffectValue::Phonemes(p) => p,
            _ => return None,
        };
        let clip = synth(&phonemes, self.sample_rate, job.voice.voice_id);
        match fold_effects(&job.audio, EffectValue::Audio(clip)) {
            EffectValue::Audio(clip) => Some(clip),
            _ => None,
        }
    }
}

#[async_trait]
impl Renderer for SynthRenderer {
    async fn render(&self, job: &RenderJob) -> Result<Option<Bytes>, RenderError> {
        Ok(self.synthesize(job).map(|clip| Bytes::from(clip.to_wav())))
    }
}

/// External synthesizer reading the text on stdin and writing raw 16-bit mono PCM to
/// stdout. Arguments may use `{lang}`, `{speed}`, `{pitch}` and `{voice}`.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    command: String,
    args: Vec<String>,
    sample_rate: u32,
    timeout: Duration,
}

impl CommandRenderer {
    pub fn new(command: impl Into<String>, args: Vec<String>, sample_rate: u32, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            sample_rate,
            timeout,
        }
    }

    fn expand_args(&self, job: &RenderJob) -> Vec<String> {
        self.args
            .iter()
            .map(|a| {
                a.replace("{lang}", &job.lang)
                    .replace("{speed}", &job.voice.speed.to_string())
                    .replace("{pitch}", &job.voice.pitch.to_string())
                    .replace("{voice}", &job.voice.voice_id.to_string())
            })
            .collect()
    }

    async fn run(&self, job: &RenderJob) -> Result<Vec<u8>, RenderError> {
        let mut child = Command::new(&self.command)
            .args(self.expand_args(job))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(job.spoken.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(RenderError::Failed(output.status));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    async fn render(&self, job: &RenderJob) -> Result<Option<Bytes>, RenderError> {
        if job.spoken.trim().is_empty() {
            return Ok(None);
        }
        if !job.phonemic.is_empty() {
            debug!("{} phonemic effects skipped by external renderer", job.phonemic.len());
        }
        let pcm = tokio::time::timeout(self.timeout, self.run(job))
            .await
            .map_err(|_| RenderError::Timeout(self.timeout))??;
        let clip = AudioClip::from_pcm_le(self.sample_rate, &pcm);
        let clip = match fold_effects(&job.audio, EffectValue::Audio(clip)) {
            EffectValue::Audio(clip) => clip,
            _ => return Ok(None),
        };
        Ok(Some(Bytes::from(clip.to_wav())))
    }
}

pub fn from_config(config: &RendererConfig) -> Arc<dyn Renderer> {
    match &config.command {
        Some(command) => Arc::new(CommandRenderer::new(
            command.clone(),
            config.args.clone(),
            config.sample_rate,
            Duration::from_secs(config.timeout_secs),
        )),
        None => Arc::new(SynthRenderer::new(config.sample_rate)),
    }
}

const VOWELS: &str = "aeiouyàâäéèêëîïôöùûü";

/// Crude grapheme-to-phoneme pass: one phoneme per letter, a pause per word gap.
pub fn text_to_phonemes(text: &str, voice: &VoiceParams) -> Vec<Phoneme> {
    let speed = voice.speed.clamp(VoiceParams::MIN_SPEED, VoiceParams::MAX_SPEED) as u32;
    // about five phonemes per word
    let base_ms = 60_000 / (speed * 5);
    let pitch_hz = 80 + voice.pitch.min(VoiceParams::MAX_PITCH) as u32 * 2;
    let mut out = Vec::new();
    for c in text.chars().flat_map(char::to_lowercase) {
        if c.is_whitespace() {
            if out.last().map_or(false, |p: &Phoneme| p.symbol != "_") {
                out.push(Phoneme::new("_", base_ms, 0));
            }
        } else if VOWELS.contains(c) {
            out.push(Phoneme::new(c.to_string(), base_ms * 3 / 2, pitch_hz));
        } else if c.is_alphabetic() {
            out.push(Phoneme::new(c.to_string(), base_ms / 2, 0));
        }
    }
    out
}

fn synth(phonemes: &[Phoneme], sample_rate: u32, voice_id: u8) -> AudioClip {
    let harmonics = 1 + (voice_id % 3) as usize;
    let mut samples = Vec::new();
    // deterministic noise source for unvoiced phonemes
    let mut noise: u32 = 0x1234_5678;
    for ph in phonemes {
        let n = (sample_rate as u64 * ph.duration_ms as u64 / 1000) as usize;
        if ph.symbol == "_" {
            samples.extend(std::iter::repeat(0i16).take(n));
        } else if ph.pitch_hz == 0 {
            for _ in 0..n {
                noise = noise.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                samples.push(((noise >> 16) as i16) / 16);
            }
        } else {
            let step = std::f32::consts::TAU * ph.pitch_hz as f32 / sample_rate as f32;
            for i in 0..n {
                let phase = step * i as f32;
                let v: f32 = (1..=harmonics).map(|h| (phase * h as f32).sin() / h as f32).sum();
                samples.push((v * 8000.0) as i16);
            }
        }
    }
    AudioClip::new(sample_rate, samples)
}
