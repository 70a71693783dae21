use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::error::RecognizerError;
use crate::transcribe::{RawSegment, RawWord, Recognizer};

struct WordAccum {
    text: String,
    start_cs: i64,
    end_cs: i64,
    prob_sum: f32,
    tokens: u32,
}

fn flush_word(accum: Option<WordAccum>, words: &mut Vec<RawWord>) {
    if let Some(w) = accum {
        let text = w.text.trim().to_string();
        if !text.is_empty() {
            words.push(RawWord {
                start_ms: (w.start_cs.max(0) * 10) as u64,
                end_ms: (w.end_cs.max(0) * 10) as u64,
                text,
                probability: (w.prob_sum / w.tokens.max(1) as f32).clamp(0.0, 1.0),
            });
        }
    }
}

/// Local recognizer backed by whisper.cpp via whisper-rs.
///
/// whisper compresses long silences out of its output clock, which is
/// exactly what the reconciler corrects for downstream.
pub struct WhisperRecognizer {
    ctx: WhisperContext,
}

impl WhisperRecognizer {
    pub fn new(model_path: &str) -> Result<Self, RecognizerError> {
        let ctx = WhisperContext::new_with_params(model_path, WhisperContextParameters::new())
            .map_err(|e| RecognizerError::ModelLoad(format!("{e}")))?;
        Ok(Self { ctx })
    }

    fn run(&mut self, samples: &[f32], with_words: bool) -> Result<Vec<RawSegment>, RecognizerError> {
        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| RecognizerError::Failed(format!("{e}")))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 5 });
        params.set_language(Some("en"));
        params.set_n_threads(4);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_token_timestamps(with_words);

        state
            .full(params, samples)
            .map_err(|e| RecognizerError::Failed(format!("{e}")))?;

        let eot_id = self.ctx.token_eot();
        let n_segments = state.full_n_segments();
        let mut segments = Vec::with_capacity(n_segments as usize);

        for i in 0..n_segments {
            let Some(seg) = state.get_segment(i) else {
                continue;
            };
            let text = match seg.to_str() {
                Ok(t) => t.trim().to_owned(),
                Err(e) => {
                    tracing::warn!("failed to decode segment {i} text: {e}");
                    continue;
                }
            };
            if text.is_empty() {
                continue;
            }

            // whisper timestamps are centiseconds.
            let start_ms = (seg.start_timestamp().max(0) * 10) as u64;
            let end_ms = (seg.end_timestamp().max(0) * 10) as u64;

            // Group tokens into words: a token opening with a space starts a
            // new word. Word confidence is the mean token probability.
            let mut words: Vec<RawWord> = Vec::new();
            if with_words {
                let mut current: Option<WordAccum> = None;
                for j in 0..seg.n_tokens() {
                    let Some(token) = seg.get_token(j) else {
                        continue;
                    };
                    if token.token_id() >= eot_id {
                        continue;
                    }
                    let Ok(piece) = token.to_str_lossy() else {
                        continue;
                    };
                    let piece = piece.to_string();
                    let data = token.token_data();

                    if piece.starts_with(' ') || current.is_none() {
                        flush_word(current.take(), &mut words);
                        current = Some(WordAccum {
                            text: piece,
                            start_cs: data.t0,
                            end_cs: data.t1,
                            prob_sum: token.token_probability(),
                            tokens: 1,
                        });
                    } else if let Some(accum) = current.as_mut() {
                        accum.text.push_str(&piece);
                        accum.end_cs = data.t1;
                        accum.prob_sum += token.token_probability();
                        accum.tokens += 1;
                    }
                }
                flush_word(current, &mut words);
            }

            segments.push(RawSegment {
                start_ms,
                end_ms: end_ms.max(start_ms),
                text,
                words,
            });
        }

        Ok(segments)
    }
}

impl Recognizer for WhisperRecognizer {
    fn transcribe(&mut self, samples: &[f32]) -> Result<String, RecognizerError> {
        let segments = self.run(samples, false)?;
        Ok(segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string())
    }

    fn transcribe_with_segments(
        &mut self,
        samples: &[f32],
    ) -> Result<Vec<RawSegment>, RecognizerError> {
        self.run(samples, true)
    }
}
