pub mod ring;
pub mod wav;

use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use tracing::warn;

use crate::error::AudioError;
use crate::process::resample::StreamConverter;
use crate::stats::PipelineStats;
use crate::types::{SESSION_RATE, StreamTag};

/// Host capability: one continuous capture stream delivering interleaved
/// float frames at a declared rate and channel count.
pub trait AudioSource: Send {
    fn tag(&self) -> StreamTag;
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    /// Blocking read of the next interleaved frame. `None` signals
    /// end-of-stream.
    fn next_frame(&mut self) -> Option<Vec<f32>>;
}

/// One normalized block on its way to the mixer: mono at the session rate.
pub struct IngressFrame {
    pub tag: StreamTag,
    pub samples: Vec<f32>,
}

/// Spawn the ingress dispatcher for one stream: pulls frames from the
/// source, normalizes them to 48 kHz mono, and forwards them to the mixer.
/// The declared format is validated here, before any thread starts.
pub fn spawn_ingress(
    mut source: Box<dyn AudioSource>,
    tx: Sender<IngressFrame>,
    stats: PipelineStats,
) -> Result<JoinHandle<()>, AudioError> {
    let tag = source.tag();
    let mut converter =
        StreamConverter::new(tag, source.sample_rate(), source.channels(), SESSION_RATE)?;

    let handle = thread::Builder::new()
        .name(format!("giji-ingress-{}", tag.as_str()))
        .spawn(move || {
            while let Some(frame) = source.next_frame() {
                stats.inc_frames_in();
                match converter.convert(&frame) {
                    Ok(samples) => {
                        if samples.is_empty() {
                            continue;
                        }
                        if tx.send(IngressFrame { tag, samples }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // A single malformed frame is dropped; the stream
                        // carries on.
                        warn!("{} ingress dropped a frame: {e}", tag.as_str());
                    }
                }
            }
        })
        .map_err(|e| AudioError::InvalidFormat(format!("ingress thread spawn failed: {e}")))?;

    Ok(handle)
}
