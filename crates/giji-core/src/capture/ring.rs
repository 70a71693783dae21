//! RT-safe bridge between a host capture callback and the ingress thread.
//!
//! The producer half is meant to live inside a real-time audio callback: it
//! never allocates, never blocks, and drops samples when the ring is full.
//! The consumer half is an [`AudioSource`] the engine can drive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::capture::AudioSource;
use crate::types::StreamTag;

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Producer half, owned by the capture callback.
pub struct RingProducer {
    producer: rtrb::Producer<f32>,
    closed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl RingProducer {
    /// Push interleaved samples; returns how many were accepted. Overflow
    /// drops the tail and counts it.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        let mut written = 0;
        for &sample in samples {
            if self.producer.push(sample).is_err() {
                self.dropped
                    .fetch_add((samples.len() - written) as u64, Ordering::Relaxed);
                break;
            }
            written += 1;
        }
        written
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Signal end-of-stream. The consumer drains what is buffered, then
    /// reports closure.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer half: an [`AudioSource`] backed by the ring.
pub struct RingSource {
    tag: StreamTag,
    sample_rate: u32,
    channels: u16,
    consumer: rtrb::Consumer<f32>,
    closed: Arc<AtomicBool>,
    frame_samples: usize,
}

/// Create a connected producer/source pair. `capacity` is in samples.
pub fn ring_source(
    tag: StreamTag,
    sample_rate: u32,
    channels: u16,
    capacity: usize,
) -> (RingProducer, RingSource) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity.max(1));
    let closed = Arc::new(AtomicBool::new(false));
    // 10 ms frames, whole interleaved groups.
    let frame_samples = (sample_rate as usize / 100).max(1) * channels as usize;

    (
        RingProducer {
            producer,
            closed: Arc::clone(&closed),
            dropped: Arc::new(AtomicU64::new(0)),
        },
        RingSource {
            tag,
            sample_rate,
            channels,
            consumer,
            closed,
            frame_samples,
        },
    )
}

impl AudioSource for RingSource {
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
        loop {
            let available = self.consumer.slots();
            if available > 0 {
                let take = available.min(self.frame_samples);
                // Whole interleaved groups only; a ragged remainder waits
                // for its channel partner.
                let take = take - take % self.channels as usize;
                if take > 0 {
                    let mut frame = Vec::with_capacity(take);
                    for _ in 0..take {
                        match self.consumer.pop() {
                            Ok(sample) => frame.push(sample),
                            Err(_) => break,
                        }
                    }
                    return Some(frame);
                }
            }
            if self.closed.load(Ordering::Acquire) && self.consumer.slots() < self.channels as usize
            {
                return None;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_flow_through_the_ring() {
        let (mut producer, mut source) = ring_source(StreamTag::Mic, 48_000, 1, 4096);
        assert_eq!(producer.push(&[0.1; 960]), 960);

        let mut collected = Vec::new();
        while collected.len() < 960 {
            collected.extend(source.next_frame().unwrap());
        }
        assert_eq!(collected.len(), 960);
        assert!((collected[0] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn close_drains_then_ends() {
        let (mut producer, mut source) = ring_source(StreamTag::Sys, 48_000, 1, 4096);
        producer.push(&[0.5; 100]);
        producer.close();

        let mut total = 0;
        while let Some(frame) = source.next_frame() {
            total += frame.len();
        }
        assert_eq!(total, 100);
    }

    #[test]
    fn overflow_drops_and_counts() {
        let (mut producer, _source) = ring_source(StreamTag::Mic, 48_000, 1, 64);
        producer.push(&[0.1; 100]);
        assert!(producer.dropped() >= 36);
    }

    #[test]
    fn stereo_frames_stay_in_whole_groups() {
        let (mut producer, mut source) = ring_source(StreamTag::Mic, 48_000, 2, 4096);
        producer.push(&[0.1, 0.2, 0.3, 0.4, 0.5]);
        producer.close();

        let frame = source.next_frame().unwrap();
        assert_eq!(frame.len() % 2, 0);
    }
}
