use std::collections::VecDeque;

use crate::types::{CaptureMode, StreamTag};

/// Default echo-subtraction weight for standard mode.
pub const DEFAULT_ECHO_ALPHA: f32 = 0.4;

/// What the mixer hands the segmenter for one block.
#[derive(Debug, Clone)]
pub enum SegmenterFeed {
    /// Echo-subtracted mono mix.
    Mono(Vec<f32>),
    /// Per-channel samples in lockstep; both have the block's length.
    Stereo { mic: Vec<f32>, sys: Vec<f32> },
}

/// One mixer tick's output: the lossless interleaved block for the recorder
/// and the segmenter feed for the same samples.
#[derive(Debug, Clone)]
pub struct MixBlock {
    /// Interleaved `(mic, sys)` pairs; length is twice the block length.
    pub stereo: Vec<f32>,
    pub feed: SegmenterFeed,
}

/// Pairs the two session-rate streams sample-for-sample. Samples wait in
/// their FIFO until the other stream catches up; nothing is dropped and
/// nothing is reordered.
pub struct StreamMixer {
    mic: VecDeque<f32>,
    sys: VecDeque<f32>,
    mode: CaptureMode,
    alpha: f32,
}

impl StreamMixer {
    pub fn new(mode: CaptureMode, alpha: f32) -> Self {
        Self {
            mic: VecDeque::new(),
            sys: VecDeque::new(),
            mode,
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    pub fn push(&mut self, tag: StreamTag, samples: &[f32]) {
        match tag {
            StreamTag::Mic => self.mic.extend(samples.iter().copied()),
            StreamTag::Sys => self.sys.extend(samples.iter().copied()),
        }
    }

    pub fn buffered(&self, tag: StreamTag) -> usize {
        match tag {
            StreamTag::Mic => self.mic.len(),
            StreamTag::Sys => self.sys.len(),
        }
    }

    /// Consume the paired prefix of both FIFOs, if any.
    pub fn tick(&mut self) -> Option<MixBlock> {
        let len = self.mic.len().min(self.sys.len());
        if len == 0 {
            return None;
        }

        let mic: Vec<f32> = self.mic.drain(..len).collect();
        let sys: Vec<f32> = self.sys.drain(..len).collect();

        let mut stereo = Vec::with_capacity(len * 2);
        for i in 0..len {
            stereo.push(mic[i]);
            stereo.push(sys[i]);
        }

        let feed = match self.mode {
            CaptureMode::Standard => {
                let mut mono = Vec::with_capacity(len);
                for i in 0..len {
                    let cleaned = (mic[i] - self.alpha * sys[i]).clamp(-1.0, 1.0);
                    mono.push((cleaned + sys[i]) / 2.0);
                }
                SegmenterFeed::Mono(mono)
            }
            CaptureMode::VoiceIsolation => SegmenterFeed::Stereo { mic, sys },
        };

        Some(MixBlock { stereo, feed })
    }

    /// Samples still waiting for their counterpart on the other stream.
    /// Discarded at session stop: an unpaired tail has nothing to mix with.
    pub fn unpaired(&self) -> (usize, usize) {
        (self.mic.len(), self.sys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_block_until_both_streams_have_data() {
        let mut mixer = StreamMixer::new(CaptureMode::Standard, DEFAULT_ECHO_ALPHA);
        mixer.push(StreamTag::Mic, &[0.1; 100]);
        assert!(mixer.tick().is_none());
        assert_eq!(mixer.buffered(StreamTag::Mic), 100);

        mixer.push(StreamTag::Sys, &[0.2; 40]);
        let block = mixer.tick().unwrap();
        assert_eq!(block.stereo.len(), 80);
        // Leftover mic samples wait for the next sys arrival.
        assert_eq!(mixer.buffered(StreamTag::Mic), 60);
        assert_eq!(mixer.buffered(StreamTag::Sys), 0);
    }

    #[test]
    fn stereo_block_interleaves_mic_then_sys() {
        let mut mixer = StreamMixer::new(CaptureMode::VoiceIsolation, 0.0);
        mixer.push(StreamTag::Mic, &[0.1, 0.2]);
        mixer.push(StreamTag::Sys, &[0.3, 0.4]);
        let block = mixer.tick().unwrap();
        assert_eq!(block.stereo, vec![0.1, 0.3, 0.2, 0.4]);
    }

    #[test]
    fn standard_mode_subtracts_echo_before_mixing() {
        let mut mixer = StreamMixer::new(CaptureMode::Standard, 0.4);
        mixer.push(StreamTag::Mic, &[0.5]);
        mixer.push(StreamTag::Sys, &[0.5]);
        let block = mixer.tick().unwrap();
        let SegmenterFeed::Mono(mono) = block.feed else {
            panic!("standard mode must feed mono");
        };
        // mic' = 0.5 - 0.4*0.5 = 0.3; mono = (0.3 + 0.5) / 2
        assert!((mono[0] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn echo_subtraction_clips_to_unit_range() {
        let mut mixer = StreamMixer::new(CaptureMode::Standard, 1.0);
        mixer.push(StreamTag::Mic, &[-1.0]);
        mixer.push(StreamTag::Sys, &[1.0]);
        let block = mixer.tick().unwrap();
        let SegmenterFeed::Mono(mono) = block.feed else {
            panic!("standard mode must feed mono");
        };
        // mic' clips at -1.0, mono = (-1.0 + 1.0) / 2
        assert_eq!(mono[0], 0.0);
    }

    #[test]
    fn voice_isolation_feeds_both_channels_in_lockstep() {
        let mut mixer = StreamMixer::new(CaptureMode::VoiceIsolation, DEFAULT_ECHO_ALPHA);
        mixer.push(StreamTag::Mic, &[0.1, 0.2, 0.3]);
        mixer.push(StreamTag::Sys, &[0.4, 0.5]);
        let block = mixer.tick().unwrap();
        let SegmenterFeed::Stereo { mic, sys } = block.feed else {
            panic!("voice-isolation mode must feed stereo");
        };
        assert_eq!(mic, vec![0.1, 0.2]);
        assert_eq!(sys, vec![0.4, 0.5]);
    }

    #[test]
    fn samples_are_conserved_across_ticks() {
        let mut mixer = StreamMixer::new(CaptureMode::Standard, DEFAULT_ECHO_ALPHA);
        let mut consumed = 0;
        for round in 0..10 {
            mixer.push(StreamTag::Mic, &vec![0.1; 30 + round]);
            mixer.push(StreamTag::Sys, &vec![0.2; 45 - round]);
            if let Some(block) = mixer.tick() {
                consumed += block.stereo.len() / 2;
            }
        }
        let (mic_left, sys_left) = mixer.unpaired();
        let mic_in: usize = (0..10).map(|r| 30 + r).sum();
        let sys_in: usize = (0..10).map(|r| 45 - r).sum();
        assert_eq!(consumed + mic_left, mic_in);
        assert_eq!(consumed + sys_left, sys_in);
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut mixer = StreamMixer::new(CaptureMode::VoiceIsolation, 0.0);
        mixer.push(StreamTag::Mic, &[1.0, 2.0]);
        mixer.push(StreamTag::Sys, &[1.0, 2.0, 3.0, 4.0]);
        mixer.push(StreamTag::Mic, &[3.0, 4.0]);

        let first = mixer.tick().unwrap();
        let SegmenterFeed::Stereo { mic, .. } = first.feed else {
            panic!();
        };
        assert_eq!(mic, vec![1.0, 2.0, 3.0, 4.0]);
    }
}
