pub mod scheduler;
pub mod whisper;

use crate::error::RecognizerError;

/// A word as the recognizer reported it, in recognizer-local milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct RawWord {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    /// Probability in [0, 1].
    pub probability: f32,
}

/// A segment as the recognizer reported it, in recognizer-local milliseconds.
/// Silent stretches of the input may have been compressed out of this clock;
/// the reconciler restores wall alignment.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSegment {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    pub words: Vec<RawWord>,
}

/// Host capability: the speech recognizer. Calls are synchronous, may take
/// seconds, and are serialized by the scheduler, which owns the only
/// reference.
pub trait Recognizer: Send {
    /// Plain text for 16 kHz mono samples.
    fn transcribe(&mut self, samples: &[f32]) -> Result<String, RecognizerError>;

    /// Timed segments (with words where the implementation supports them)
    /// for 16 kHz mono samples.
    fn transcribe_with_segments(
        &mut self,
        samples: &[f32],
    ) -> Result<Vec<RawSegment>, RecognizerError>;
}
