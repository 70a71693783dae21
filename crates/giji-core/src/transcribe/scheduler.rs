//! Serialized access to the one recognizer instance.
//!
//! A single worker thread holds the model slot; at no instant are two
//! recognizer calls in flight anywhere in the process. Jobs queue FIFO,
//! duplicate submissions for a chunk coalesce (most recent parameters win),
//! and cancellation is cooperative: an in-flight call finishes and only its
//! result is dropped.

use std::collections::VecDeque;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{CancelReason, RecognizerError, ScheduleError};
use crate::store::chunks::{AudioChannel, ChunkAudioSource};
use crate::transcribe::{RawSegment, Recognizer};
use crate::types::ChunkRecord;

/// Default span length for full-file plans without usable chunk boundaries:
/// 20 minutes.
pub const DEFAULT_FULL_SEGMENT_MS: u64 = 20 * 60 * 1000;

/// Audio handed to the worker for one chunk.
pub enum JobAudio {
    Mono(Vec<f32>),
    Stereo { mic: Vec<f32>, sys: Vec<f32> },
}

/// One chunk transcription request.
pub struct ChunkJob {
    pub session_id: String,
    pub chunk_id: String,
    pub chunk_index: u64,
    pub audio: JobAudio,
}

/// What the recognizer produced for a chunk.
#[derive(Debug, Clone)]
pub enum ChunkTranscription {
    Mono { text: String },
    Stereo {
        mic: Vec<RawSegment>,
        sys: Vec<RawSegment>,
    },
}

/// How a full-file plan is segmented. Explicit configuration, never a
/// runtime heuristic blend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FullPlanPolicy {
    /// Existing chunk boundaries when the session has at least one chunk
    /// with valid bounds, fixed spans otherwise.
    #[default]
    Auto,
    ChunkBoundaries,
    FixedSpans,
}

/// Build the segment plan for a full-file transcription.
pub fn build_full_plan(
    chunks: &[ChunkRecord],
    total_ms: u64,
    policy: FullPlanPolicy,
    full_segment_ms: u64,
) -> Vec<(u64, u64)> {
    let valid: Vec<(u64, u64)> = chunks
        .iter()
        .filter(|c| c.start_ms < c.end_ms && c.end_ms <= total_ms)
        .map(|c| (c.start_ms, c.end_ms))
        .collect();

    let use_chunks = match policy {
        FullPlanPolicy::ChunkBoundaries => true,
        FullPlanPolicy::FixedSpans => false,
        FullPlanPolicy::Auto => !valid.is_empty(),
    };

    if use_chunks {
        return valid;
    }

    let span = full_segment_ms.max(1);
    let mut plan = Vec::new();
    let mut start = 0;
    while start < total_ms {
        plan.push((start, (start + span).min(total_ms)));
        start += span;
    }
    plan
}

/// One full-file transcription request with its prepared plan.
pub struct FullJob {
    pub session_id: String,
    pub spans: Vec<(u64, u64)>,
    pub stereo: bool,
    pub source: Arc<dyn ChunkAudioSource>,
}

/// Terminal state of a full-file job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FullOutcome {
    Completed,
    Cancelled,
    Error(String),
}

/// Results delivered to the session manager.
pub enum SchedulerOutcome {
    Chunk {
        session_id: String,
        chunk_id: String,
        chunk_index: u64,
        result: Result<ChunkTranscription, ScheduleError>,
    },
    FullSegment {
        session_id: String,
        span_index: u64,
        total: u64,
        span: (u64, u64),
        result: Result<ChunkTranscription, RecognizerError>,
    },
    FullFinished {
        session_id: String,
        outcome: FullOutcome,
    },
}

enum Job {
    Chunk(ChunkJob),
    Full(FullJob),
}

struct RunningChunk {
    session_id: String,
    chunk_id: String,
    discard: Option<CancelReason>,
}

struct RunningFull {
    session_id: String,
    cancel: bool,
}

struct SchedState {
    queue: VecDeque<Job>,
    running_chunk: Option<RunningChunk>,
    running_full: Option<RunningFull>,
    shutdown: bool,
}

impl SchedState {
    fn has_work_for(&self, session_id: &str) -> bool {
        let queued = self.queue.iter().any(|job| match job {
            Job::Chunk(c) => c.session_id == session_id,
            Job::Full(f) => f.session_id == session_id,
        });
        queued
            || self
                .running_chunk
                .as_ref()
                .is_some_and(|r| r.session_id == session_id)
            || self
                .running_full
                .as_ref()
                .is_some_and(|r| r.session_id == session_id)
    }
}

struct Shared {
    state: Mutex<SchedState>,
    work: Condvar,
    idle: Condvar,
}

/// Single-slot scheduler in front of the recognizer.
pub struct TranscribeScheduler {
    shared: Arc<Shared>,
    outcomes: Sender<SchedulerOutcome>,
    worker: Option<JoinHandle<()>>,
}

impl TranscribeScheduler {
    /// `watchdog` is the optional per-chunk timeout: an overrunning
    /// recognizer call cannot be interrupted, but its result is discarded
    /// and the chunk reports a timeout cancellation.
    pub fn start(
        recognizer: Box<dyn Recognizer>,
        outcomes: Sender<SchedulerOutcome>,
        watchdog: Option<Duration>,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedState {
                queue: VecDeque::new(),
                running_chunk: None,
                running_full: None,
                shutdown: false,
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            let outcomes = outcomes.clone();
            thread::Builder::new()
                .name("giji-transcribe-worker".into())
                .spawn(move || worker_loop(shared, recognizer, outcomes, watchdog))
                .expect("spawn transcribe worker")
        };

        Self {
            shared,
            outcomes,
            worker: Some(worker),
        }
    }

    /// Enqueue a chunk. A queued entry for the same chunk id is replaced in
    /// place; an in-flight one is marked superseded so its result is
    /// discarded when it lands.
    pub fn submit_chunk(&self, job: ChunkJob) {
        let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
        if state.shutdown {
            return;
        }
        if let Some(running) = state.running_chunk.as_mut() {
            if running.chunk_id == job.chunk_id {
                running.discard = Some(CancelReason::Superseded);
            }
        }
        let existing = state.queue.iter_mut().find_map(|queued| match queued {
            Job::Chunk(c) if c.chunk_id == job.chunk_id => Some(c),
            _ => None,
        });
        match existing {
            Some(slot) => *slot = job,
            None => state.queue.push_back(Job::Chunk(job)),
        }
        self.shared.work.notify_one();
    }

    /// Start a full-file job, cancelling any prior one for the session.
    pub fn submit_full(&self, job: FullJob) {
        self.cancel_full(&job.session_id);
        let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
        if state.shutdown {
            return;
        }
        state.queue.push_back(Job::Full(job));
        self.shared.work.notify_one();
    }

    /// Remove a queued chunk. An in-flight call is left alone.
    pub fn cancel_chunk(&self, chunk_id: &str) {
        let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
        let mut removed = Vec::new();
        state.queue.retain(|job| match job {
            Job::Chunk(c) if c.chunk_id == chunk_id => {
                removed.push((c.session_id.clone(), c.chunk_id.clone(), c.chunk_index));
                false
            }
            _ => true,
        });
        drop(state);
        for (session_id, chunk_id, chunk_index) in removed {
            let _ = self.outcomes.send(SchedulerOutcome::Chunk {
                session_id,
                chunk_id,
                chunk_index,
                result: Err(ScheduleError::Cancelled(CancelReason::Requested)),
            });
        }
    }

    /// Cancel everything queued for a session and discard the result of its
    /// in-flight work.
    pub fn cancel_session(&self, session_id: &str) {
        let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
        let mut removed_chunks = Vec::new();
        let mut removed_full = false;
        state.queue.retain(|job| match job {
            Job::Chunk(c) if c.session_id == session_id => {
                removed_chunks.push((c.chunk_id.clone(), c.chunk_index));
                false
            }
            Job::Full(f) if f.session_id == session_id => {
                removed_full = true;
                false
            }
            _ => true,
        });
        if let Some(running) = state.running_chunk.as_mut() {
            if running.session_id == session_id && running.discard.is_none() {
                running.discard = Some(CancelReason::SessionCancelled);
            }
        }
        if let Some(running) = state.running_full.as_mut() {
            if running.session_id == session_id {
                running.cancel = true;
            }
        }
        drop(state);
        for (chunk_id, chunk_index) in removed_chunks {
            let _ = self.outcomes.send(SchedulerOutcome::Chunk {
                session_id: session_id.to_string(),
                chunk_id,
                chunk_index,
                result: Err(ScheduleError::Cancelled(CancelReason::SessionCancelled)),
            });
        }
        if removed_full {
            let _ = self.outcomes.send(SchedulerOutcome::FullFinished {
                session_id: session_id.to_string(),
                outcome: FullOutcome::Cancelled,
            });
        }
    }

    /// Abort a full-file job at its next segment boundary.
    pub fn cancel_full(&self, session_id: &str) {
        let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
        let mut removed = false;
        state.queue.retain(|job| match job {
            Job::Full(f) if f.session_id == session_id => {
                removed = true;
                false
            }
            _ => true,
        });
        if let Some(running) = state.running_full.as_mut() {
            if running.session_id == session_id {
                running.cancel = true;
            }
        }
        drop(state);
        if removed {
            let _ = self.outcomes.send(SchedulerOutcome::FullFinished {
                session_id: session_id.to_string(),
                outcome: FullOutcome::Cancelled,
            });
        }
    }

    /// Block until no queued or in-flight work remains for the session.
    pub fn wait_idle(&self, session_id: &str) {
        let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
        while state.has_work_for(session_id) {
            state = self.shared.idle.wait(state).expect("scheduler lock poisoned");
        }
    }
}

impl Drop for TranscribeScheduler {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("scheduler lock poisoned");
            state.shutdown = true;
            self.shared.work.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn is_silent(samples: &[f32]) -> bool {
    if samples.is_empty() {
        return true;
    }
    let power: f32 = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    power.sqrt() < 1.0e-4
}

fn worker_loop(
    shared: Arc<Shared>,
    mut recognizer: Box<dyn Recognizer>,
    outcomes: Sender<SchedulerOutcome>,
    watchdog: Option<Duration>,
) {
    loop {
        let job = {
            let mut state = shared.state.lock().expect("scheduler lock poisoned");
            loop {
                if let Some(job) = state.queue.pop_front() {
                    match &job {
                        Job::Chunk(c) => {
                            state.running_chunk = Some(RunningChunk {
                                session_id: c.session_id.clone(),
                                chunk_id: c.chunk_id.clone(),
                                discard: None,
                            });
                        }
                        Job::Full(f) => {
                            state.running_full = Some(RunningFull {
                                session_id: f.session_id.clone(),
                                cancel: false,
                            });
                        }
                    }
                    break job;
                }
                if state.shutdown {
                    return;
                }
                state = shared.work.wait(state).expect("scheduler lock poisoned");
            }
        };

        match job {
            Job::Chunk(job) => run_chunk(&shared, &mut *recognizer, &outcomes, watchdog, job),
            Job::Full(job) => run_full(&shared, &mut *recognizer, &outcomes, job),
        }

        shared.idle.notify_all();
    }
}

fn chunk_discard_reason(shared: &Shared) -> Option<CancelReason> {
    shared
        .state
        .lock()
        .expect("scheduler lock poisoned")
        .running_chunk
        .as_ref()
        .and_then(|r| r.discard)
}

fn run_chunk(
    shared: &Shared,
    recognizer: &mut dyn Recognizer,
    outcomes: &Sender<SchedulerOutcome>,
    watchdog: Option<Duration>,
    job: ChunkJob,
) {
    let started = Instant::now();
    let mut result: Result<ChunkTranscription, ScheduleError> = match &job.audio {
        JobAudio::Mono(samples) => recognizer
            .transcribe(samples)
            .and_then(|text| {
                if text.is_empty() && !is_silent(samples) {
                    Err(RecognizerError::EmptyOutput)
                } else {
                    Ok(ChunkTranscription::Mono { text })
                }
            })
            .map_err(ScheduleError::from),
        JobAudio::Stereo { mic, sys } => {
            match recognizer.transcribe_with_segments(mic) {
                Err(e) => Err(ScheduleError::from(e)),
                Ok(mic_segments) => {
                    // Coarse-grained cancellation point between the two
                    // sub-calls.
                    if let Some(reason) = chunk_discard_reason(shared) {
                        Err(ScheduleError::Cancelled(reason))
                    } else {
                        match recognizer.transcribe_with_segments(sys) {
                            Err(e) => Err(ScheduleError::from(e)),
                            Ok(sys_segments) => {
                                let silent = is_silent(mic) && is_silent(sys);
                                if mic_segments.is_empty() && sys_segments.is_empty() && !silent {
                                    Err(ScheduleError::from(RecognizerError::EmptyOutput))
                                } else {
                                    Ok(ChunkTranscription::Stereo {
                                        mic: mic_segments,
                                        sys: sys_segments,
                                    })
                                }
                            }
                        }
                    }
                }
            }
        }
    };

    if let Some(limit) = watchdog {
        if result.is_ok() && started.elapsed() > limit {
            warn!(
                chunk = %job.chunk_id,
                "recognizer call exceeded watchdog, discarding result"
            );
            result = Err(ScheduleError::Cancelled(CancelReason::Timeout));
        }
    }

    let discard = {
        let mut state = shared.state.lock().expect("scheduler lock poisoned");
        let discard = state
            .running_chunk
            .as_ref()
            .and_then(|r| r.discard);
        state.running_chunk = None;
        discard
    };
    if let Some(reason) = discard {
        debug!(chunk = %job.chunk_id, %reason, "discarding in-flight result");
        result = Err(ScheduleError::Cancelled(reason));
    }

    let _ = outcomes.send(SchedulerOutcome::Chunk {
        session_id: job.session_id,
        chunk_id: job.chunk_id,
        chunk_index: job.chunk_index,
        result,
    });
}

fn run_full(
    shared: &Shared,
    recognizer: &mut dyn Recognizer,
    outcomes: &Sender<SchedulerOutcome>,
    job: FullJob,
) {
    let total = job.spans.len() as u64;
    let mut outcome = FullOutcome::Completed;
    let mut failures = 0u64;

    for (index, span) in job.spans.iter().copied().enumerate() {
        let cancelled = shared
            .state
            .lock()
            .expect("scheduler lock poisoned")
            .running_full
            .as_ref()
            .is_some_and(|r| r.cancel);
        if cancelled {
            outcome = FullOutcome::Cancelled;
            break;
        }

        // Segment-level errors are reported per segment; the plan continues.
        let result = transcribe_span(recognizer, &*job.source, span, job.stereo);
        if result.is_err() {
            failures += 1;
        }
        let _ = outcomes.send(SchedulerOutcome::FullSegment {
            session_id: job.session_id.clone(),
            span_index: index as u64,
            total,
            span,
            result,
        });
    }
    if outcome == FullOutcome::Completed && total > 0 && failures == total {
        outcome = FullOutcome::Error("every segment failed".to_string());
    }

    {
        let mut state = shared.state.lock().expect("scheduler lock poisoned");
        if state
            .running_full
            .as_ref()
            .is_some_and(|r| r.cancel)
        {
            outcome = FullOutcome::Cancelled;
        }
        state.running_full = None;
    }
    let _ = outcomes.send(SchedulerOutcome::FullFinished {
        session_id: job.session_id,
        outcome,
    });
}

fn transcribe_span(
    recognizer: &mut dyn Recognizer,
    source: &dyn ChunkAudioSource,
    span: (u64, u64),
    stereo: bool,
) -> Result<ChunkTranscription, RecognizerError> {
    let (start_ms, end_ms) = span;
    if stereo {
        let mic_audio = source
            .read_span(start_ms, end_ms, AudioChannel::Mic)
            .map_err(|e| RecognizerError::Failed(e.to_string()))?;
        let sys_audio = source
            .read_span(start_ms, end_ms, AudioChannel::Sys)
            .map_err(|e| RecognizerError::Failed(e.to_string()))?;
        let mic = recognizer.transcribe_with_segments(&mic_audio)?;
        let sys = recognizer.transcribe_with_segments(&sys_audio)?;
        Ok(ChunkTranscription::Stereo { mic, sys })
    } else {
        let audio = source
            .read_span(start_ms, end_ms, AudioChannel::Mix)
            .map_err(|e| RecognizerError::Failed(e.to_string()))?;
        let text = recognizer.transcribe(&audio)?;
        Ok(ChunkTranscription::Mono { text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::mpsc;

    /// Scripted recognizer: sleeps briefly, returns its call count, asserts
    /// it is never entered concurrently.
    struct MockRecognizer {
        in_flight: Arc<AtomicBool>,
        calls: Arc<AtomicU64>,
        delay: Duration,
        fail_on_call: Option<u64>,
    }

    impl MockRecognizer {
        fn new(delay: Duration) -> (Self, Arc<AtomicU64>) {
            let calls = Arc::new(AtomicU64::new(0));
            (
                Self {
                    in_flight: Arc::new(AtomicBool::new(false)),
                    calls: Arc::clone(&calls),
                    delay,
                    fail_on_call: None,
                },
                calls,
            )
        }

        fn enter(&self) -> u64 {
            assert!(
                !self.in_flight.swap(true, Ordering::SeqCst),
                "two recognizer calls in flight"
            );
            self.calls.fetch_add(1, Ordering::SeqCst)
        }

        fn exit(&self) {
            self.in_flight.store(false, Ordering::SeqCst);
        }
    }

    impl Recognizer for MockRecognizer {
        fn transcribe(&mut self, _samples: &[f32]) -> Result<String, RecognizerError> {
            let call = self.enter();
            thread::sleep(self.delay);
            self.exit();
            if self.fail_on_call == Some(call) {
                return Err(RecognizerError::Failed("injected".into()));
            }
            Ok(format!("call-{call}"))
        }

        fn transcribe_with_segments(
            &mut self,
            samples: &[f32],
        ) -> Result<Vec<RawSegment>, RecognizerError> {
            let text = self.transcribe(samples)?;
            Ok(vec![RawSegment {
                start_ms: 0,
                end_ms: 100,
                text,
                words: Vec::new(),
            }])
        }
    }

    struct ConstantAudio;

    impl ChunkAudioSource for ConstantAudio {
        fn read_span(
            &self,
            start_ms: u64,
            end_ms: u64,
            _channel: AudioChannel,
        ) -> Result<Vec<f32>, StoreError> {
            Ok(vec![0.2; ((end_ms - start_ms) * 16) as usize])
        }
    }

    fn job(session: &str, chunk: &str, index: u64) -> ChunkJob {
        ChunkJob {
            session_id: session.into(),
            chunk_id: chunk.into(),
            chunk_index: index,
            audio: JobAudio::Mono(vec![0.2; 1600]),
        }
    }

    fn collect_chunk_results(
        rx: &mpsc::Receiver<SchedulerOutcome>,
        n: usize,
    ) -> Vec<(String, Result<String, ScheduleError>)> {
        let mut out = Vec::new();
        while out.len() < n {
            match rx.recv_timeout(Duration::from_secs(5)).expect("outcome") {
                SchedulerOutcome::Chunk {
                    chunk_id, result, ..
                } => out.push((
                    chunk_id,
                    result.map(|t| match t {
                        ChunkTranscription::Mono { text } => text,
                        ChunkTranscription::Stereo { .. } => "stereo".into(),
                    }),
                )),
                _ => {}
            }
        }
        out
    }

    #[test]
    fn fifo_order_single_flight() {
        let (recognizer, _) = MockRecognizer::new(Duration::from_millis(5));
        let (tx, rx) = mpsc::channel();
        let scheduler = TranscribeScheduler::start(Box::new(recognizer), tx, None);

        for i in 0..4 {
            scheduler.submit_chunk(job("s", &format!("c{i}"), i));
        }
        let results = collect_chunk_results(&rx, 4);
        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["c0", "c1", "c2", "c3"]);
        for (_, result) in results {
            assert!(result.is_ok());
        }
    }

    #[test]
    fn duplicate_submit_coalesces_in_queue() {
        let (recognizer, calls) = MockRecognizer::new(Duration::from_millis(30));
        let (tx, rx) = mpsc::channel();
        let scheduler = TranscribeScheduler::start(Box::new(recognizer), tx, None);

        // First job occupies the worker; the next two land in the queue and
        // coalesce into one entry.
        scheduler.submit_chunk(job("s", "busy", 0));
        thread::sleep(Duration::from_millis(10));
        scheduler.submit_chunk(job("s", "dup", 1));
        scheduler.submit_chunk(job("s", "dup", 1));

        let results = collect_chunk_results(&rx, 2);
        assert_eq!(results[0].0, "busy");
        assert_eq!(results[1].0, "dup");
        scheduler.wait_idle("s");
        // busy ran once, dup ran once: two mono calls total.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn in_flight_resubmit_is_superseded() {
        let (recognizer, _) = MockRecognizer::new(Duration::from_millis(40));
        let (tx, rx) = mpsc::channel();
        let scheduler = TranscribeScheduler::start(Box::new(recognizer), tx, None);

        scheduler.submit_chunk(job("s", "c0", 0));
        thread::sleep(Duration::from_millis(10));
        // Resubmit while in flight: first result is discarded, the new run
        // lands.
        scheduler.submit_chunk(job("s", "c0", 0));

        let results = collect_chunk_results(&rx, 2);
        assert!(matches!(
            results[0].1,
            Err(ScheduleError::Cancelled(CancelReason::Superseded))
        ));
        assert!(results[1].1.is_ok());
    }

    #[test]
    fn cancel_chunk_removes_queued_only() {
        let (recognizer, _) = MockRecognizer::new(Duration::from_millis(40));
        let (tx, rx) = mpsc::channel();
        let scheduler = TranscribeScheduler::start(Box::new(recognizer), tx, None);

        scheduler.submit_chunk(job("s", "running", 0));
        thread::sleep(Duration::from_millis(10));
        scheduler.submit_chunk(job("s", "queued", 1));
        scheduler.cancel_chunk("queued");
        // Cancelling the in-flight chunk id leaves it alone.
        scheduler.cancel_chunk("running");

        let results = collect_chunk_results(&rx, 2);
        let queued = results.iter().find(|(id, _)| id == "queued").unwrap();
        assert!(matches!(
            queued.1,
            Err(ScheduleError::Cancelled(CancelReason::Requested))
        ));
        let running = results.iter().find(|(id, _)| id == "running").unwrap();
        assert!(running.1.is_ok());
    }

    #[test]
    fn cancel_session_discards_in_flight_result() {
        let (recognizer, _) = MockRecognizer::new(Duration::from_millis(40));
        let (tx, rx) = mpsc::channel();
        let scheduler = TranscribeScheduler::start(Box::new(recognizer), tx, None);

        scheduler.submit_chunk(job("s", "c0", 0));
        scheduler.submit_chunk(job("s", "c1", 1));
        scheduler.submit_chunk(job("other", "x0", 0));
        thread::sleep(Duration::from_millis(10));
        scheduler.cancel_session("s");

        let results = collect_chunk_results(&rx, 3);
        for (id, result) in &results {
            match id.as_str() {
                "c0" | "c1" => assert!(
                    matches!(result, Err(ScheduleError::Cancelled(_))),
                    "{id}: {result:?}"
                ),
                "x0" => assert!(result.is_ok()),
                other => panic!("unexpected id {other}"),
            }
        }
    }

    #[test]
    fn recognizer_error_propagates_per_chunk() {
        let (mut recognizer, _) = MockRecognizer::new(Duration::from_millis(2));
        recognizer.fail_on_call = Some(1);
        let (tx, rx) = mpsc::channel();
        let scheduler = TranscribeScheduler::start(Box::new(recognizer), tx, None);

        scheduler.submit_chunk(job("s", "ok0", 0));
        scheduler.submit_chunk(job("s", "bad", 1));
        scheduler.submit_chunk(job("s", "ok1", 2));

        let results = collect_chunk_results(&rx, 3);
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(ScheduleError::Recognizer(_))));
        assert!(results[2].1.is_ok());
    }

    #[test]
    fn silent_empty_output_is_not_an_error() {
        struct SilentRecognizer;
        impl Recognizer for SilentRecognizer {
            fn transcribe(&mut self, _s: &[f32]) -> Result<String, RecognizerError> {
                Ok(String::new())
            }
            fn transcribe_with_segments(
                &mut self,
                _s: &[f32],
            ) -> Result<Vec<RawSegment>, RecognizerError> {
                Ok(Vec::new())
            }
        }
        let (tx, rx) = mpsc::channel();
        let scheduler = TranscribeScheduler::start(Box::new(SilentRecognizer), tx, None);

        // Silence in, empty out: completed with empty text.
        scheduler.submit_chunk(ChunkJob {
            session_id: "s".into(),
            chunk_id: "quiet".into(),
            chunk_index: 0,
            audio: JobAudio::Mono(vec![0.0; 1600]),
        });
        // Clear speech in, empty out: recognizer error.
        scheduler.submit_chunk(ChunkJob {
            session_id: "s".into(),
            chunk_id: "loud".into(),
            chunk_index: 1,
            audio: JobAudio::Mono(vec![0.3; 1600]),
        });

        let results = collect_chunk_results(&rx, 2);
        assert!(results[0].1.as_ref().is_ok_and(|t| t.is_empty()));
        assert!(matches!(
            results[1].1,
            Err(ScheduleError::Recognizer(RecognizerError::EmptyOutput))
        ));
    }

    #[test]
    fn full_plan_prefers_chunk_boundaries() {
        let chunk = |index, start_ms, end_ms| ChunkRecord {
            id: format!("c{index}"),
            index,
            start_ms,
            end_ms,
            is_stereo: false,
            status: crate::types::ChunkStatus::Completed,
            transcription: None,
            mic_text: None,
            sys_text: None,
            mic_segments: None,
            sys_segments: None,
            dialogue: None,
            error: None,
            vad_method: None,
            sidecar: None,
            mic_sidecar: None,
            sys_sidecar: None,
            regions: None,
            mic_regions: None,
            sys_regions: None,
        };
        let chunks = vec![chunk(0, 0, 9000), chunk(1, 9500, 20_000)];

        let plan = build_full_plan(&chunks, 25_000, FullPlanPolicy::Auto, 10_000);
        assert_eq!(plan, vec![(0, 9000), (9500, 20_000)]);

        // No chunks: fixed spans cover [0, total).
        let plan = build_full_plan(&[], 25_000, FullPlanPolicy::Auto, 10_000);
        assert_eq!(plan, vec![(0, 10_000), (10_000, 20_000), (20_000, 25_000)]);

        // Explicit policy beats the heuristic.
        let plan = build_full_plan(&chunks, 25_000, FullPlanPolicy::FixedSpans, 10_000);
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn full_job_runs_segments_in_order() {
        let (recognizer, _) = MockRecognizer::new(Duration::from_millis(2));
        let (tx, rx) = mpsc::channel();
        let scheduler = TranscribeScheduler::start(Box::new(recognizer), tx, None);

        scheduler.submit_full(FullJob {
            session_id: "s".into(),
            spans: vec![(0, 1000), (1000, 2000), (2000, 2500)],
            stereo: false,
            source: Arc::new(ConstantAudio),
        });

        let mut segments = Vec::new();
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).expect("outcome") {
                SchedulerOutcome::FullSegment {
                    span_index,
                    total,
                    result,
                    ..
                } => {
                    assert_eq!(total, 3);
                    assert!(result.is_ok());
                    segments.push(span_index);
                }
                SchedulerOutcome::FullFinished { outcome, .. } => {
                    assert_eq!(outcome, FullOutcome::Completed);
                    break;
                }
                SchedulerOutcome::Chunk { .. } => panic!("no chunk jobs submitted"),
            }
        }
        assert_eq!(segments, vec![0, 1, 2]);
    }

    #[test]
    fn full_job_cancels_at_segment_boundary() {
        let (recognizer, _) = MockRecognizer::new(Duration::from_millis(30));
        let (tx, rx) = mpsc::channel();
        let scheduler = TranscribeScheduler::start(Box::new(recognizer), tx, None);

        scheduler.submit_full(FullJob {
            session_id: "s".into(),
            spans: (0..5).map(|i| (i * 1000, (i + 1) * 1000)).collect(),
            stereo: false,
            source: Arc::new(ConstantAudio),
        });

        let mut seen = 0u64;
        let mut finished = None;
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).expect("outcome") {
                SchedulerOutcome::FullSegment { .. } => {
                    seen += 1;
                    if seen == 2 {
                        scheduler.cancel_full("s");
                    }
                }
                SchedulerOutcome::FullFinished { outcome, .. } => {
                    finished = Some(outcome);
                    break;
                }
                SchedulerOutcome::Chunk { .. } => {}
            }
        }
        assert_eq!(finished, Some(FullOutcome::Cancelled));
        assert!(seen < 5, "cancel must stop the plan, saw {seen} segments");
    }

    #[test]
    fn wait_idle_blocks_until_session_drained() {
        let (recognizer, _) = MockRecognizer::new(Duration::from_millis(10));
        let (tx, rx) = mpsc::channel();
        let scheduler = TranscribeScheduler::start(Box::new(recognizer), tx, None);

        for i in 0..3 {
            scheduler.submit_chunk(job("s", &format!("c{i}"), i));
        }
        scheduler.wait_idle("s");
        // All three outcomes must already be available without blocking.
        let results = collect_chunk_results(&rx, 3);
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn watchdog_discards_slow_results() {
        let (recognizer, _) = MockRecognizer::new(Duration::from_millis(50));
        let (tx, rx) = mpsc::channel();
        let scheduler =
            TranscribeScheduler::start(Box::new(recognizer), tx, Some(Duration::from_millis(5)));

        scheduler.submit_chunk(job("s", "slow", 0));
        let results = collect_chunk_results(&rx, 1);
        assert!(matches!(
            results[0].1,
            Err(ScheduleError::Cancelled(CancelReason::Timeout))
        ));
    }
}
