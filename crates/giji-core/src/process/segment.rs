use std::collections::VecDeque;

use tracing::warn;

use crate::error::SegmenterError;
use crate::process::vad::{NeuralVad, VadScorer, frame_samples};
use crate::types::{ChunkEvent, SpeechRegion, StereoSamples};

/// Window searched for a low-energy cut point when `max_chunk_ms` forces a
/// close mid-speech.
const MAX_CUT_SEARCH_MS: u64 = 200;

/// How chunk boundaries are chosen, before resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentMode {
    /// Pick by recognizer affinity. The bundled recognizer favours long
    /// context, so this resolves to `Compression`.
    #[default]
    Auto,
    /// Concatenate adjacent speech spans separated by at most `gap_ms`.
    Compression,
    /// Every speech span becomes its own chunk.
    PerRegion,
    /// Fixed-length chunking every `max_chunk_ms`, no VAD.
    Off,
}

/// Which frame scorer to use, before resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VadMethodChoice {
    Energy,
    Neural,
    /// Neural when the capability is available, energy otherwise.
    #[default]
    Auto,
}

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub mode: SegmentMode,
    pub method: VadMethodChoice,
    /// Analysis frame size.
    pub frame_ms: u32,
    /// Hysteresis: a frame above `start_threshold` opens speech, frames below
    /// `stop_threshold` accumulate towards a close. `start > stop` required.
    pub start_threshold: f32,
    pub stop_threshold: f32,
    /// Speech spans shorter than this are discarded.
    pub min_voiced_ms: u64,
    /// Silence run that ends a speech span.
    pub min_silence_ms: u64,
    /// Longest silence merged into a chunk in compression mode.
    pub gap_ms: u64,
    /// Bounds on emitted chunk duration. `max_chunk_ms` forces a cut;
    /// `min_chunk_ms` delays a natural close until enough audio accumulates.
    pub min_chunk_ms: u64,
    pub max_chunk_ms: u64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            mode: SegmentMode::Auto,
            method: VadMethodChoice::Auto,
            frame_ms: 30,
            start_threshold: 0.6,
            stop_threshold: 0.4,
            min_voiced_ms: 200,
            min_silence_ms: 500,
            gap_ms: 2000,
            min_chunk_ms: 1000,
            max_chunk_ms: 30_000,
        }
    }
}

impl SegmenterConfig {
    pub fn validate(&self) -> Result<(), SegmenterError> {
        if self.frame_ms == 0 {
            return Err(SegmenterError::InvalidConfig("frame_ms must be non-zero".into()));
        }
        if self.start_threshold <= self.stop_threshold {
            return Err(SegmenterError::InvalidConfig(format!(
                "start_threshold {} must exceed stop_threshold {}",
                self.start_threshold, self.stop_threshold
            )));
        }
        if self.min_chunk_ms > self.max_chunk_ms {
            return Err(SegmenterError::InvalidConfig(format!(
                "min_chunk_ms {} exceeds max_chunk_ms {}",
                self.min_chunk_ms, self.max_chunk_ms
            )));
        }
        if self.max_chunk_ms < u64::from(self.frame_ms) {
            return Err(SegmenterError::InvalidConfig(
                "max_chunk_ms must cover at least one frame".into(),
            ));
        }
        Ok(())
    }
}

/// Boundary policy after resolution; fixed for the segmenter's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CutPolicy {
    PerRegion,
    Compression { gap_ms: u64 },
    Fixed { max_ms: u64 },
}

/// A maximal run of voiced frames, in absolute frame indices (end exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameSpan {
    start: u64,
    end: u64,
}

/// Per-channel speech-span detection with the same hysteresis the chunk
/// state machine uses.
struct RegionTracker {
    state: RegionState,
    finalized: Vec<FrameSpan>,
}

enum RegionState {
    Idle,
    Open { start: u64, last_voiced: u64, silence: u64 },
}

impl RegionTracker {
    fn new() -> Self {
        Self {
            state: RegionState::Idle,
            finalized: Vec::new(),
        }
    }

    fn observe(&mut self, frame: u64, probability: f32, cfg: &SegmenterConfig, frames: &FrameMath) {
        match &mut self.state {
            RegionState::Idle => {
                if probability > cfg.start_threshold {
                    self.state = RegionState::Open {
                        start: frame,
                        last_voiced: frame,
                        silence: 0,
                    };
                }
            }
            RegionState::Open {
                start,
                last_voiced,
                silence,
            } => {
                if probability >= cfg.stop_threshold {
                    *last_voiced = frame;
                    *silence = 0;
                } else {
                    *silence += 1;
                    if frames.to_ms(*silence) >= cfg.min_silence_ms {
                        let span = FrameSpan {
                            start: *start,
                            end: *last_voiced + 1,
                        };
                        if frames.to_ms(span.end - span.start) >= cfg.min_voiced_ms {
                            self.finalized.push(span);
                        }
                        self.state = RegionState::Idle;
                    }
                }
            }
        }
    }

    /// Spans overlapping `[open, close)`, clipped, with the tracker advanced
    /// past `close` so a span continuing across a cut is split, not lost.
    fn take_spans(
        &mut self,
        open: u64,
        close: u64,
        cfg: &SegmenterConfig,
        frames: &FrameMath,
    ) -> Vec<FrameSpan> {
        let mut spans: Vec<FrameSpan> = self
            .finalized
            .iter()
            .filter(|s| s.end > open && s.start < close)
            .map(|s| FrameSpan {
                start: s.start.max(open),
                end: s.end.min(close),
            })
            .collect();

        if let RegionState::Open {
            start, last_voiced, ..
        } = &mut self.state
        {
            let current_end = (*last_voiced + 1).min(close);
            if *start < close && current_end > open {
                spans.push(FrameSpan {
                    start: (*start).max(open),
                    end: current_end,
                });
            }
            if *start < close {
                *start = close;
                *last_voiced = (*last_voiced).max(close);
            }
        }

        self.finalized.retain(|s| s.end > close);
        spans.retain(|s| frames.to_ms(s.end - s.start) >= cfg.min_voiced_ms);
        spans
    }

    fn reset(&mut self) {
        self.state = RegionState::Idle;
        self.finalized.clear();
    }
}

#[derive(Clone, Copy)]
enum ChunkState {
    Idle,
    Voiced {
        open: u64,
        last_voiced: u64,
        silence: u64,
    },
}

struct FrameMath {
    frame_ms: u64,
}

impl FrameMath {
    fn to_ms(&self, frames: u64) -> u64 {
        frames * self.frame_ms
    }
}

/// Transforms a continuous 16 kHz stream into speech-bounded [`ChunkEvent`]s.
///
/// One instance per session; mono mode scores the mixed stream, stereo mode
/// scores each channel and cuts on their combined activity.
pub struct Segmenter {
    config: SegmenterConfig,
    policy: CutPolicy,
    stereo: bool,
    scorers: Vec<VadScorer>,
    vad_method: &'static str,
    fell_back: bool,
    frame_len: usize,
    frames: FrameMath,
    /// Per-channel samples not yet forming a whole frame.
    pending: Vec<Vec<f32>>,
    /// Absolute index of the next frame to be scored.
    frame_pos: u64,
    state: ChunkState,
    /// Per-channel samples from `window_start` onward, whole frames only.
    window: Vec<Vec<f32>>,
    window_start: u64,
    trackers: Vec<RegionTracker>,
    /// Combined probabilities of recent frames, for the max-cut search.
    recent: VecDeque<(u64, f32)>,
}

impl Segmenter {
    /// `neural` supplies one scorer per channel when the neural method is
    /// wanted; too few instances falls back to energy and records it.
    pub fn new(
        config: SegmenterConfig,
        stereo: bool,
        mut neural: Vec<Box<dyn NeuralVad>>,
    ) -> Result<Self, SegmenterError> {
        config.validate()?;

        let channels = if stereo { 2 } else { 1 };
        let policy = match config.mode {
            SegmentMode::Auto | SegmentMode::Compression => CutPolicy::Compression {
                gap_ms: config.gap_ms.max(config.min_silence_ms),
            },
            SegmentMode::PerRegion => CutPolicy::PerRegion,
            SegmentMode::Off => CutPolicy::Fixed {
                max_ms: config.max_chunk_ms,
            },
        };

        let want_neural = matches!(
            config.method,
            VadMethodChoice::Neural | VadMethodChoice::Auto
        );
        let mut fell_back = false;
        let scorers: Vec<VadScorer> = if want_neural && neural.len() >= channels {
            neural
                .drain(..channels)
                .map(VadScorer::Neural)
                .collect()
        } else {
            if matches!(config.method, VadMethodChoice::Neural) {
                warn!("neural vad requested but unavailable; falling back to energy");
                fell_back = true;
            }
            (0..channels).map(|_| VadScorer::Energy).collect()
        };
        let vad_method = scorers[0].name();

        let frame_len = frame_samples(config.frame_ms);
        let frames = FrameMath {
            frame_ms: u64::from(config.frame_ms),
        };

        Ok(Self {
            config,
            policy,
            stereo,
            scorers,
            vad_method,
            fell_back,
            frame_len,
            frames,
            pending: vec![Vec::new(); channels],
            frame_pos: 0,
            state: ChunkState::Idle,
            window: vec![Vec::new(); channels],
            window_start: 0,
            trackers: (0..channels).map(|_| RegionTracker::new()).collect(),
            recent: VecDeque::new(),
        })
    }

    pub fn vad_method(&self) -> &'static str {
        self.vad_method
    }

    pub fn fell_back(&self) -> bool {
        self.fell_back
    }

    pub fn push_mono(&mut self, samples: &[f32]) -> Vec<ChunkEvent> {
        debug_assert!(!self.stereo);
        self.pending[0].extend_from_slice(samples);
        self.consume_frames()
    }

    /// Both slices must cover the same time range; the mixer guarantees this.
    pub fn push_stereo(&mut self, mic: &[f32], sys: &[f32]) -> Vec<ChunkEvent> {
        debug_assert!(self.stereo);
        let len = mic.len().min(sys.len());
        self.pending[0].extend_from_slice(&mic[..len]);
        self.pending[1].extend_from_slice(&sys[..len]);
        self.consume_frames()
    }

    /// End of stream: close any open span and emit the voiced tail.
    /// Residual silence is discarded.
    pub fn flush(&mut self) -> Option<ChunkEvent> {
        // A partial trailing frame still gets scored so a speech tail is not
        // dropped on the floor.
        if !self.pending[0].is_empty() {
            let partial: Vec<Vec<f32>> = self.pending.iter_mut().map(std::mem::take).collect();
            if let Err(e) = self.score_and_step(&partial) {
                warn!("segmenter flush scoring failed: {e}");
            }
        }

        match self.policy {
            CutPolicy::Fixed { .. } => {
                let end = self.frame_pos;
                if end > self.window_start && !self.window[0].is_empty() {
                    let event = self.emit(self.window_start, end);
                    self.clear_window();
                    return Some(event);
                }
                None
            }
            _ => {
                if let ChunkState::Voiced {
                    open, last_voiced, ..
                } = self.state
                {
                    let close = last_voiced + 1;
                    let event = self.emit(open, close);
                    self.state = ChunkState::Idle;
                    self.clear_window();
                    if !event.regions.is_empty() {
                        return Some(event);
                    }
                }
                None
            }
        }
    }

    fn consume_frames(&mut self) -> Vec<ChunkEvent> {
        let mut events = Vec::new();
        while self.pending[0].len() >= self.frame_len
            && (!self.stereo || self.pending[1].len() >= self.frame_len)
        {
            let frame: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|p| p.drain(..self.frame_len.min(p.len())).collect())
                .collect();
            match self.score_and_step(&frame) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => {
                    // Non-fatal: drop the chunk being assembled and resume.
                    warn!("segmenter internal failure, dropping open chunk: {e}");
                    self.state = ChunkState::Idle;
                    self.clear_window();
                    for tracker in &mut self.trackers {
                        tracker.reset();
                    }
                }
            }
        }
        events
    }

    fn score_and_step(
        &mut self,
        frame: &[Vec<f32>],
    ) -> Result<Option<ChunkEvent>, SegmenterError> {
        let mut combined = 0.0f32;
        let mut probs = Vec::with_capacity(self.scorers.len());
        for (scorer, channel) in self.scorers.iter_mut().zip(frame) {
            let p = if matches!(self.policy, CutPolicy::Fixed { .. }) {
                0.0
            } else {
                scorer
                    .frame_probabilities(channel, self.config.frame_ms)?
                    .first()
                    .copied()
                    .unwrap_or(0.0)
            };
            combined = combined.max(p);
            probs.push(p);
        }

        let frame_idx = self.frame_pos;
        self.frame_pos += 1;

        if !matches!(self.policy, CutPolicy::Fixed { .. }) {
            for (tracker, p) in self.trackers.iter_mut().zip(&probs) {
                tracker.observe(frame_idx, *p, &self.config, &self.frames);
            }
            self.recent.push_back((frame_idx, combined));
            let keep = (MAX_CUT_SEARCH_MS / self.frames.frame_ms).max(1) as usize;
            while self.recent.len() > keep {
                self.recent.pop_front();
            }
        }

        Ok(self.step(frame_idx, combined, frame))
    }

    fn step(&mut self, frame_idx: u64, probability: f32, frame: &[Vec<f32>]) -> Option<ChunkEvent> {
        if let CutPolicy::Fixed { max_ms } = self.policy {
            if self.window[0].is_empty() {
                self.window_start = frame_idx;
            }
            self.append_to_window(frame);
            let end = frame_idx + 1;
            if self.frames.to_ms(end - self.window_start) >= max_ms {
                let event = self.emit(self.window_start, end);
                self.clear_window();
                return Some(event);
            }
            return None;
        }

        match self.state {
            ChunkState::Idle => {
                if probability > self.config.start_threshold {
                    self.state = ChunkState::Voiced {
                        open: frame_idx,
                        last_voiced: frame_idx,
                        silence: 0,
                    };
                    self.window_start = frame_idx;
                    self.clear_window_samples();
                    self.append_to_window(frame);
                }
                None
            }
            ChunkState::Voiced {
                open,
                mut last_voiced,
                mut silence,
            } => {
                self.append_to_window(frame);
                if probability >= self.config.stop_threshold {
                    last_voiced = frame_idx;
                    silence = 0;
                } else {
                    silence += 1;
                }
                self.state = ChunkState::Voiced {
                    open,
                    last_voiced,
                    silence,
                };

                let close_silence_ms = match self.policy {
                    CutPolicy::PerRegion => self.config.min_silence_ms,
                    CutPolicy::Compression { gap_ms } => gap_ms,
                    CutPolicy::Fixed { .. } => unreachable!(),
                };
                let duration_ms = self.frames.to_ms(last_voiced + 1 - open);

                // Natural close wins over a simultaneous max cut.
                if self.frames.to_ms(silence) >= close_silence_ms
                    && duration_ms >= self.config.min_chunk_ms
                {
                    let event = self.emit(open, last_voiced + 1);
                    self.state = ChunkState::Idle;
                    self.clear_window();
                    return (!event.regions.is_empty()).then_some(event);
                }

                if self.frames.to_ms(frame_idx + 1 - open) >= self.config.max_chunk_ms {
                    let cut = self.pick_cut_frame(open, frame_idx);
                    let event = self.emit(open, cut);
                    self.drain_window_to(cut);
                    self.state = ChunkState::Voiced {
                        open: cut,
                        last_voiced: last_voiced.max(cut),
                        silence,
                    };
                    return Some(event);
                }
                None
            }
        }
    }

    /// Best-effort low-energy frame in the trailing search window, else the
    /// exact max boundary.
    fn pick_cut_frame(&self, open: u64, now: u64) -> u64 {
        let quiet = self
            .recent
            .iter()
            .filter(|(f, p)| *f > open && *p < self.config.stop_threshold)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(f, _)| *f);
        match quiet {
            Some(frame) => frame,
            None => open + self.config.max_chunk_ms / self.frames.frame_ms,
        }
        .min(now + 1)
    }

    fn emit(&mut self, open: u64, close: u64) -> ChunkEvent {
        let start_offset = ((open - self.window_start) as usize) * self.frame_len;
        let sample_count = ((close - open) as usize) * self.frame_len;

        let take = |w: &Vec<f32>| -> Vec<f32> {
            let end = (start_offset + sample_count).min(w.len());
            w[start_offset.min(w.len())..end].to_vec()
        };

        let (mono, stereo) = if self.stereo {
            let mic = take(&self.window[0]);
            let sys = take(&self.window[1]);
            let mono = mic
                .iter()
                .zip(&sys)
                .map(|(m, s)| (m + s) / 2.0)
                .collect();
            (mono, Some(StereoSamples { mic, sys }))
        } else {
            (take(&self.window[0]), None)
        };

        let per_channel: Vec<Vec<FrameSpan>> = self
            .trackers
            .iter_mut()
            .map(|t| t.take_spans(open, close, &self.config, &self.frames))
            .collect();
        let regions = unify_spans(per_channel.concat(), open, &self.frames);
        let (mic_regions, sys_regions) = if self.stereo {
            let mut lists = per_channel
                .into_iter()
                .map(|spans| unify_spans(spans, open, &self.frames));
            (lists.next(), lists.next())
        } else {
            (None, None)
        };

        ChunkEvent {
            start_ms: self.frames.to_ms(open),
            end_ms: self.frames.to_ms(close),
            mono,
            stereo,
            regions,
            mic_regions,
            sys_regions,
            vad_method: self.vad_method,
        }
    }

    fn append_to_window(&mut self, frame: &[Vec<f32>]) {
        for (window, channel) in self.window.iter_mut().zip(frame) {
            window.extend_from_slice(channel);
        }
    }

    fn clear_window(&mut self) {
        self.clear_window_samples();
        self.window_start = self.frame_pos;
    }

    fn clear_window_samples(&mut self) {
        for window in &mut self.window {
            window.clear();
        }
    }

    fn drain_window_to(&mut self, frame: u64) {
        let drop_samples = ((frame - self.window_start) as usize) * self.frame_len;
        for window in &mut self.window {
            window.drain(..drop_samples.min(window.len()));
        }
        self.window_start = frame;
    }
}

/// Merge per-channel spans into the disjoint, strictly increasing unified
/// region list, converted to chunk-local milliseconds.
fn unify_spans(mut spans: Vec<FrameSpan>, open: u64, frames: &FrameMath) -> Vec<SpeechRegion> {
    if spans.is_empty() {
        return Vec::new();
    }
    spans.sort_by_key(|s| (s.start, s.end));

    let mut merged: Vec<FrameSpan> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }

    merged
        .into_iter()
        .map(|s| SpeechRegion {
            start_ms: frames.to_ms(s.start - open),
            end_ms: frames.to_ms(s.end - open),
        })
        .collect()
}
