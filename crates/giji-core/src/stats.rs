use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for a live session's pipeline. Cheap to clone; all clones
/// share the same counters.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    frames_in: Arc<AtomicU64>,
    samples_mixed: Arc<AtomicU64>,
    chunks_emitted: Arc<AtomicU64>,
    chunks_failed: Arc<AtomicU64>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_frames_in(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_samples_mixed(&self, count: u64) {
        self.samples_mixed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_chunks_emitted(&self) {
        self.chunks_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chunks_failed(&self) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    pub fn samples_mixed(&self) -> u64 {
        self.samples_mixed.load(Ordering::Relaxed)
    }

    pub fn chunks_emitted(&self) -> u64 {
        self.chunks_emitted.load(Ordering::Relaxed)
    }

    pub fn chunks_failed(&self) -> u64 {
        self.chunks_failed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let stats = PipelineStats::new();
        let clone = stats.clone();
        stats.inc_chunks_emitted();
        clone.inc_chunks_emitted();
        assert_eq!(stats.chunks_emitted(), 2);
    }
}
