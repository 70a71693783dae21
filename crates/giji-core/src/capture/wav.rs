//! A WAV file as an [`AudioSource`]: drives the engine end-to-end without
//! platform capture drivers. The file's header declares the rate and
//! channel count; frames are delivered in 10 ms steps.

use std::path::Path;

use crate::capture::AudioSource;
use crate::error::StoreError;
use crate::store::wav::read_wav;
use crate::types::StreamTag;

pub struct WavFileSource {
    tag: StreamTag,
    sample_rate: u32,
    channels: u16,
    samples: Vec<f32>,
    pos: usize,
    step: usize,
}

impl WavFileSource {
    pub fn open(path: &Path, tag: StreamTag) -> Result<Self, StoreError> {
        let audio = read_wav(path)?;
        let step = (audio.sample_rate as usize / 100).max(1) * audio.channels as usize;
        Ok(Self {
            tag,
            sample_rate: audio.sample_rate,
            channels: audio.channels,
            samples: audio.samples,
            pos: 0,
            step,
        })
    }

    pub fn duration_ms(&self) -> u64 {
        let frames = self.samples.len() as u64 / u64::from(self.channels);
        frames * 1000 / u64::from(self.sample_rate)
    }
}

impl AudioSource for WavFileSource {
    fn tag(&self) -> StreamTag {
        self.tag
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn next_frame(&mut self) -> Option<Vec<f32>> {
        if self.pos >= self.samples.len() {
            return None;
        }
        let end = (self.pos + self.step).min(self.samples.len());
        let frame = self.samples[self.pos..end].to_vec();
        self.pos = end;
        Some(frame)
    }
}
