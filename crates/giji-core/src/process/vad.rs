use voice_activity_detector::VoiceActivityDetector;

use crate::error::SegmenterError;
use crate::types::TRANSCRIBE_RATE;

/// dBFS level mapped to probability 0.0.
const ENERGY_FLOOR_DBFS: f32 = -50.0;
/// dBFS span over which probability rises from 0.0 to 1.0.
const ENERGY_SPAN_DB: f32 = 30.0;
/// Zero-crossing rate below which a frame reads as a tone or DC offset
/// rather than speech.
const MIN_SPEECH_ZCR: f32 = 0.02;

/// Optional host capability: a neural model producing per-frame speech
/// probabilities for 16 kHz mono audio.
pub trait NeuralVad: Send {
    fn frame_probabilities(
        &mut self,
        samples: &[f32],
        frame_ms: u32,
    ) -> Result<Vec<f32>, SegmenterError>;
}

/// Energy-based speech scoring: smoothed RMS level in dBFS, gated by
/// zero-crossing rate so sustained tones do not read as speech.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnergyVad;

impl EnergyVad {
    pub fn frame_probability(frame: &[f32]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let power: f32 = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
        let rms = power.sqrt();
        if rms <= 0.0 {
            return 0.0;
        }

        let dbfs = 20.0 * rms.log10();
        let mut probability = ((dbfs - ENERGY_FLOOR_DBFS) / ENERGY_SPAN_DB).clamp(0.0, 1.0);
        if zero_crossing_rate(frame) < MIN_SPEECH_ZCR {
            probability *= 0.5;
        }
        probability
    }

    pub fn frame_probabilities(samples: &[f32], frame_ms: u32) -> Vec<f32> {
        let frame_len = frame_samples(frame_ms);
        samples
            .chunks(frame_len)
            .map(Self::frame_probability)
            .collect()
    }
}

fn zero_crossing_rate(frame: &[f32]) -> f32 {
    if frame.len() < 2 {
        return 0.0;
    }
    let crossings = frame.windows(2).filter(|w| w[0] * w[1] < 0.0).count();
    crossings as f32 / frame.len() as f32
}

pub fn frame_samples(frame_ms: u32) -> usize {
    (TRANSCRIBE_RATE as usize * frame_ms as usize) / 1000
}

/// Silero VAD behind the `NeuralVad` capability.
pub struct SileroVad {
    detector: VoiceActivityDetector,
    chunk_size: usize,
}

impl SileroVad {
    pub fn new(frame_ms: u32) -> Result<Self, SegmenterError> {
        let chunk_size = frame_samples(frame_ms);
        let detector = VoiceActivityDetector::builder()
            .sample_rate(i64::from(TRANSCRIBE_RATE))
            .chunk_size(chunk_size)
            .build()
            .map_err(|e| SegmenterError::Vad(e.to_string()))?;
        Ok(Self {
            detector,
            chunk_size,
        })
    }
}

impl NeuralVad for SileroVad {
    fn frame_probabilities(
        &mut self,
        samples: &[f32],
        frame_ms: u32,
    ) -> Result<Vec<f32>, SegmenterError> {
        let frame_len = frame_samples(frame_ms);
        if frame_len != self.chunk_size {
            return Err(SegmenterError::Vad(format!(
                "frame size {frame_len} does not match detector chunk size {}",
                self.chunk_size
            )));
        }

        let mut probabilities = Vec::with_capacity(samples.len() / frame_len + 1);
        for frame in samples.chunks(frame_len) {
            if frame.len() == frame_len {
                probabilities.push(self.detector.predict(frame.iter().copied()));
            } else {
                // Trailing partial frame: zero-pad to the model's chunk size.
                let padded = frame
                    .iter()
                    .copied()
                    .chain(std::iter::repeat(0.0))
                    .take(frame_len);
                probabilities.push(self.detector.predict(padded));
            }
        }
        Ok(probabilities)
    }
}

/// The frame-scoring method the segmenter ended up with.
pub enum VadScorer {
    Energy,
    Neural(Box<dyn NeuralVad>),
}

impl VadScorer {
    pub fn name(&self) -> &'static str {
        match self {
            VadScorer::Energy => "energy",
            VadScorer::Neural(_) => "neural",
        }
    }

    pub fn frame_probabilities(
        &mut self,
        samples: &[f32],
        frame_ms: u32,
    ) -> Result<Vec<f32>, SegmenterError> {
        match self {
            VadScorer::Energy => Ok(EnergyVad::frame_probabilities(samples, frame_ms)),
            VadScorer::Neural(vad) => vad.frame_probabilities(samples, frame_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise_at_dbfs(len: usize, dbfs: f32) -> Vec<f32> {
        // Deterministic pseudo-noise with roughly unit RMS, scaled to the
        // requested level.
        let gain = 10f32.powf(dbfs / 20.0);
        let mut state = 0x2545_f491u32;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                let uniform = (state >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0;
                uniform * gain * 1.732
            })
            .collect()
    }

    #[test]
    fn silence_scores_zero() {
        let frame = vec![0.0f32; 480];
        assert_eq!(EnergyVad::frame_probability(&frame), 0.0);
    }

    #[test]
    fn noise_floor_scores_below_stop_threshold() {
        let frame = noise_at_dbfs(480, -60.0);
        assert!(EnergyVad::frame_probability(&frame) < 0.2);
    }

    #[test]
    fn speech_level_scores_above_start_threshold() {
        let frame = noise_at_dbfs(480, -20.0);
        assert!(EnergyVad::frame_probability(&frame) > 0.6);
    }

    #[test]
    fn dc_offset_is_penalized() {
        // Loud but constant: no zero crossings, so not speech-like.
        let frame = vec![0.5f32; 480];
        assert!(EnergyVad::frame_probability(&frame) <= 0.5);
    }

    #[test]
    fn probabilities_cover_every_frame() {
        let samples = noise_at_dbfs(480 * 10 + 100, -30.0);
        let probs = EnergyVad::frame_probabilities(&samples, 30);
        // Ten full frames plus a partial tail.
        assert_eq!(probs.len(), 11);
    }

    #[test]
    fn frame_samples_follows_rate() {
        assert_eq!(frame_samples(30), 480);
        assert_eq!(frame_samples(20), 320);
    }
}
