//! Session lifecycle and pipeline orchestration.
//!
//! One active session at a time. Per session the engine runs: one ingress
//! thread per capture stream, the mixer/recorder loop, and the segmenter
//! loop, all joined by channels. Transcription runs on the scheduler's
//! single worker; results come back on the engine's results thread, which
//! reconciles timestamps, updates the record under a short lock, and
//! publishes events in chunk-index order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, EventReceiver};
use crate::capture::{AudioSource, IngressFrame, spawn_ingress};
use crate::error::{ScheduleError, SessionError, StoreError};
use crate::process::mixer::{SegmenterFeed, StreamMixer};
use crate::process::resample::StreamDownsampler;
use crate::process::segment::{Segmenter, SegmenterConfig};
use crate::process::vad::NeuralVad;
use crate::reconcile::{merge_dialogue, reconcile_segments};
use crate::stats::PipelineStats;
use crate::store::chunks::{AudioChannel, ChunkAudioSource, ChunkStore, LongFormAudio, SidecarAudio};
use crate::store::meta::{self, SessionLayout};
use crate::store::recorder::LongFormRecorder;
use crate::transcribe::Recognizer;
use crate::transcribe::scheduler::{
    ChunkJob, ChunkTranscription, FullJob, FullOutcome, FullPlanPolicy, JobAudio,
    SchedulerOutcome, TranscribeScheduler, build_full_plan, DEFAULT_FULL_SEGMENT_MS,
};
use crate::types::{
    CaptureMode, ChunkEvent, ChunkRecord, ChunkStatus, EngineEvent, SessionRecord, SessionStatus,
    StreamTag, TRANSCRIBE_RATE, SESSION_RATE,
};

const MIXER_POLL: Duration = Duration::from_millis(50);

/// Configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: CaptureMode,
    /// Echo-subtraction weight for standard mode, in [0, 1].
    pub echo_alpha: f32,
    pub segmenter: SegmenterConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Standard,
            echo_alpha: crate::process::mixer::DEFAULT_ECHO_ALPHA,
            segmenter: SegmenterConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if !(0.0..=1.0).contains(&self.echo_alpha) {
            return Err(SessionError::InvalidConfig(format!(
                "echo_alpha {} outside [0, 1]",
                self.echo_alpha
            )));
        }
        self.segmenter.validate()?;
        Ok(())
    }
}

/// Parameters for a full-file retranscription.
#[derive(Debug, Clone)]
pub struct FullTranscriptionParams {
    pub policy: FullPlanPolicy,
    pub full_segment_ms: u64,
}

impl Default for FullTranscriptionParams {
    fn default() -> Self {
        Self {
            policy: FullPlanPolicy::Auto,
            full_segment_ms: DEFAULT_FULL_SEGMENT_MS,
        }
    }
}

struct SessionEntry {
    record: SessionRecord,
    store: ChunkStore,
    /// Chunk jobs submitted and not yet resolved by the results thread.
    outstanding: u64,
    /// Next chunk index whose `chunk_transcribed` event may be published.
    publish_cursor: u64,
    /// At most one completion held for in-order release.
    held: Vec<(u64, EngineEvent)>,
}

struct Shared {
    data_dir: PathBuf,
    bus: EventBus,
    records: Mutex<HashMap<String, SessionEntry>>,
    work_done: Condvar,
}

struct ActiveSession {
    session_id: String,
    stop: Arc<AtomicBool>,
    stats: PipelineStats,
    ingress: Vec<JoinHandle<()>>,
    mixer: JoinHandle<()>,
    segmenter: JoinHandle<()>,
}

/// The meeting-capture engine: owns the event bus, the scheduler slot, and
/// every session's lifecycle.
pub struct Engine {
    shared: Arc<Shared>,
    scheduler: Option<Arc<TranscribeScheduler>>,
    active: Mutex<Option<ActiveSession>>,
    results: Option<JoinHandle<()>>,
}

impl Engine {
    /// `watchdog` bounds a single chunk's recognizer call; `None` disables
    /// the watchdog.
    pub fn new(
        data_dir: &Path,
        recognizer: Box<dyn Recognizer>,
        watchdog: Option<Duration>,
    ) -> Result<Self, SessionError> {
        std::fs::create_dir_all(data_dir)?;
        let shared = Arc::new(Shared {
            data_dir: data_dir.to_path_buf(),
            bus: EventBus::new(),
            records: Mutex::new(HashMap::new()),
            work_done: Condvar::new(),
        });

        let (outcome_tx, outcome_rx) = mpsc::channel();
        let scheduler = Arc::new(TranscribeScheduler::start(
            recognizer,
            outcome_tx,
            watchdog,
        ));

        let results = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("giji-results".into())
                .spawn(move || results_loop(shared, outcome_rx))
                .map_err(|e| SessionError::Bug(format!("results thread spawn failed: {e}")))?
        };

        Ok(Self {
            shared,
            scheduler: Some(scheduler),
            active: Mutex::new(None),
            results: Some(results),
        })
    }

    /// Subscribe to the engine's event stream.
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.bus.subscribe()
    }

    fn scheduler(&self) -> &Arc<TranscribeScheduler> {
        self.scheduler.as_ref().expect("scheduler present")
    }

    /// Create a session and start its pipeline. Exactly one mic source and
    /// one sys source are required.
    pub fn start_session(
        &self,
        config: SessionConfig,
        sources: Vec<Box<dyn AudioSource>>,
        neural_vads: Vec<Box<dyn NeuralVad>>,
    ) -> Result<SessionRecord, SessionError> {
        config.validate()?;
        let tags: Vec<StreamTag> = sources.iter().map(|s| s.tag()).collect();
        if sources.len() != 2 || !tags.contains(&StreamTag::Mic) || !tags.contains(&StreamTag::Sys)
        {
            return Err(SessionError::InvalidConfig(
                "exactly one mic source and one sys source are required".into(),
            ));
        }

        let mut active = self.active.lock().expect("active lock poisoned");
        if active.is_some() {
            return Err(SessionError::AlreadyActive);
        }

        let session_id = Uuid::now_v7().to_string();
        let start_time = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|e| SessionError::Bug(format!("time format: {e}")))?;

        let layout = SessionLayout::new(&self.shared.data_dir, &session_id);
        layout.ensure_dirs()?;
        let record = SessionRecord::new(session_id.clone(), start_time.clone());
        let store = ChunkStore::new(layout.clone());
        store.save(&record)?;

        let recorder = LongFormRecorder::create(&layout)?;
        let segmenter = Segmenter::new(config.segmenter.clone(), config.mode.is_stereo(), neural_vads)?;

        let stats = PipelineStats::new();
        let stop = Arc::new(AtomicBool::new(false));
        let (ingress_tx, ingress_rx) = mpsc::channel::<IngressFrame>();
        let (seg_tx, seg_rx) = mpsc::channel::<SegmenterFeed>();

        let mut ingress = Vec::with_capacity(sources.len());
        for source in sources {
            ingress.push(spawn_ingress(source, ingress_tx.clone(), stats.clone())?);
        }
        drop(ingress_tx);

        let mixer_handle = {
            let shared = Arc::clone(&self.shared);
            let stop = Arc::clone(&stop);
            let stats = stats.clone();
            let session_id = session_id.clone();
            let mixer = StreamMixer::new(config.mode, config.echo_alpha);
            thread::Builder::new()
                .name("giji-mixer".into())
                .spawn(move || {
                    mixer_loop(shared, session_id, mixer, recorder, ingress_rx, seg_tx, stop, stats)
                })
                .map_err(|e| SessionError::Bug(format!("mixer thread spawn failed: {e}")))?
        };

        let segmenter_handle = {
            let shared = Arc::clone(&self.shared);
            let scheduler = Arc::clone(self.scheduler());
            let stats = stats.clone();
            let session_id = session_id.clone();
            thread::Builder::new()
                .name("giji-segmenter".into())
                .spawn(move || {
                    segmenter_loop(shared, scheduler, session_id, segmenter, seg_rx, stats)
                })
                .map_err(|e| SessionError::Bug(format!("segmenter thread spawn failed: {e}")))?
        };

        self.shared
            .records
            .lock()
            .expect("records lock poisoned")
            .insert(
                session_id.clone(),
                SessionEntry {
                    record: record.clone(),
                    store,
                    outstanding: 0,
                    publish_cursor: 0,
                    held: Vec::new(),
                },
            );

        *active = Some(ActiveSession {
            session_id: session_id.clone(),
            stop,
            stats,
            ingress,
            mixer: mixer_handle,
            segmenter: segmenter_handle,
        });
        drop(active);

        info!(session = %session_id, "session started");
        self.shared.bus.publish(&EngineEvent::SessionStarted {
            session_id,
            start_time,
        });
        Ok(record)
    }

    /// Stop the active session: stop capture, drain the segmenter (emitting
    /// the tail chunk), close the recording, and wait for in-flight
    /// transcription work to resolve.
    pub fn stop_session(&self) -> Result<SessionRecord, SessionError> {
        let Some(active) = self.active.lock().expect("active lock poisoned").take() else {
            return Err(SessionError::NotFound("no active session".into()));
        };
        let session_id = active.session_id;

        active.stop.store(true, Ordering::Release);
        if let Err(e) = active.mixer.join() {
            error!("mixer thread panicked: {e:?}");
        }
        for handle in active.ingress {
            if let Err(e) = handle.join() {
                error!("ingress thread panicked: {e:?}");
            }
        }
        if let Err(e) = active.segmenter.join() {
            error!("segmenter thread panicked: {e:?}");
        }

        // All chunk submissions happened on the segmenter thread, which has
        // now exited; drain the scheduler and then the results channel.
        self.scheduler().wait_idle(&session_id);
        let mut records = self.shared.records.lock().expect("records lock poisoned");
        while records
            .get(&session_id)
            .is_some_and(|entry| entry.outstanding > 0)
        {
            records = self
                .shared
                .work_done
                .wait(records)
                .expect("records lock poisoned");
        }

        let entry = records
            .get_mut(&session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
        if entry.record.status == SessionStatus::Active {
            entry.record.status = SessionStatus::Stopped;
        }
        entry.store.save(&entry.record)?;
        let record = entry.record.clone();
        drop(records);

        info!(
            session = %session_id,
            duration_ms = record.total_duration,
            chunks = record.chunks.len(),
            "session stopped"
        );
        // A session that already failed published its failure; it does not
        // also report a clean stop.
        if record.status == SessionStatus::Stopped {
            self.shared.bus.publish(&EngineEvent::SessionStopped {
                session_id,
                total_duration_ms: record.total_duration,
                chunk_count: record.chunks.len() as u64,
            });
        }
        Ok(record)
    }

    /// Reset a chunk to `pending` and resubmit it. Audio comes from its
    /// sidecars when they still exist, else from the finalized long-form
    /// recording.
    pub fn retranscribe_chunk(
        &self,
        session_id: &str,
        chunk_id: &str,
    ) -> Result<(), SessionError> {
        let mut records = self.shared.records.lock().expect("records lock poisoned");
        self.ensure_entry(&mut records, session_id)?;
        let entry = records
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let layout = entry.store.layout().clone();
        let chunks_snapshot = entry.record.chunks.clone();
        let chunk = entry
            .record
            .chunk_by_id_mut(chunk_id)
            .ok_or_else(|| SessionError::ChunkNotFound(chunk_id.to_string()))?;

        let has_sidecars = chunk.sidecar.is_some() || chunk.mic_sidecar.is_some();
        let source: Arc<dyn ChunkAudioSource> = if has_sidecars {
            Arc::new(SidecarAudio::new(layout, chunks_snapshot))
        } else {
            Arc::new(LongFormAudio::new(layout).map_err(SessionError::Store)?)
        };

        let audio = if chunk.is_stereo {
            JobAudio::Stereo {
                mic: source
                    .read_span(chunk.start_ms, chunk.end_ms, AudioChannel::Mic)
                    .map_err(SessionError::Store)?,
                sys: source
                    .read_span(chunk.start_ms, chunk.end_ms, AudioChannel::Sys)
                    .map_err(SessionError::Store)?,
            }
        } else {
            JobAudio::Mono(
                source
                    .read_span(chunk.start_ms, chunk.end_ms, AudioChannel::Mix)
                    .map_err(SessionError::Store)?,
            )
        };

        chunk.reset_for_retranscribe();
        chunk.status = ChunkStatus::Transcribing;
        let job = ChunkJob {
            session_id: session_id.to_string(),
            chunk_id: chunk_id.to_string(),
            chunk_index: chunk.index,
            audio,
        };
        entry.outstanding += 1;
        entry.store.save(&entry.record)?;
        drop(records);

        self.scheduler().submit_chunk(job);
        Ok(())
    }

    /// Cancel any running full-file job for the session and start a new one.
    pub fn retranscribe_full(
        &self,
        session_id: &str,
        params: FullTranscriptionParams,
    ) -> Result<(), SessionError> {
        let mut records = self.shared.records.lock().expect("records lock poisoned");
        self.ensure_entry(&mut records, session_id)?;
        let entry = records
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let spans = build_full_plan(
            &entry.record.chunks,
            entry.record.total_duration,
            params.policy,
            params.full_segment_ms,
        );
        if spans.is_empty() {
            return Err(SessionError::InvalidConfig(
                "session has no audio to transcribe".into(),
            ));
        }

        let layout = entry.store.layout().clone();
        let stereo = entry.record.chunks.iter().any(|c| c.is_stereo);
        let has_sidecars = entry
            .record
            .chunks
            .iter()
            .any(|c| c.sidecar.is_some() || c.mic_sidecar.is_some());
        let source: Arc<dyn ChunkAudioSource> = if longform_readable(&layout) {
            Arc::new(LongFormAudio::new(layout).map_err(SessionError::Store)?)
        } else if has_sidecars {
            Arc::new(SidecarAudio::new(layout, entry.record.chunks.clone()))
        } else {
            return Err(SessionError::Store(StoreError::MissingAudio(
                session_id.to_string(),
            )));
        };
        let session_id_owned = session_id.to_string();
        drop(records);

        self.scheduler().submit_full(FullJob {
            session_id: session_id_owned,
            spans,
            stereo,
            source,
        });
        Ok(())
    }

    /// Abort a running full-file job at its next segment boundary.
    pub fn cancel_full_transcription(&self, session_id: &str) {
        self.scheduler().cancel_full(session_id);
    }

    /// Delete a stopped session's data directory.
    pub fn delete_session(&self, session_id: &str) -> Result<(), SessionError> {
        {
            let active = self.active.lock().expect("active lock poisoned");
            if active.as_ref().is_some_and(|a| a.session_id == session_id) {
                return Err(SessionError::StillActive(session_id.to_string()));
            }
        }
        self.scheduler().cancel_session(session_id);

        let layout = SessionLayout::new(&self.shared.data_dir, session_id);
        if !layout.exists() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        layout.remove()?;
        self.shared
            .records
            .lock()
            .expect("records lock poisoned")
            .remove(session_id);
        self.shared.bus.publish(&EngineEvent::SessionDeleted {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// Current record for a session, from memory when live, disk otherwise.
    pub fn get_session(&self, session_id: &str) -> Result<SessionRecord, SessionError> {
        let records = self.shared.records.lock().expect("records lock poisoned");
        if let Some(entry) = records.get(session_id) {
            return Ok(entry.record.clone());
        }
        drop(records);
        let layout = SessionLayout::new(&self.shared.data_dir, session_id);
        if !layout.exists() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        Ok(meta::load_meta(&layout)?)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>, SessionError> {
        let mut sessions = meta::list_sessions(&self.shared.data_dir)?;
        let records = self.shared.records.lock().expect("records lock poisoned");
        for session in &mut sessions {
            if let Some(entry) = records.get(&session.id) {
                *session = entry.record.clone();
            }
        }
        Ok(sessions)
    }

    /// Pipeline counters for the active session, if any.
    pub fn active_stats(&self) -> Option<PipelineStats> {
        self.active
            .lock()
            .expect("active lock poisoned")
            .as_ref()
            .map(|a| a.stats.clone())
    }

    /// Publish a model lifecycle event on behalf of the host.
    pub fn publish_model_progress(&self, model: &str, progress: f32) {
        self.shared.bus.publish(&EngineEvent::ModelProgress {
            model: model.to_string(),
            progress,
        });
    }

    fn ensure_entry(
        &self,
        records: &mut HashMap<String, SessionEntry>,
        session_id: &str,
    ) -> Result<(), SessionError> {
        if records.contains_key(session_id) {
            return Ok(());
        }
        let layout = SessionLayout::new(&self.shared.data_dir, session_id);
        if !layout.exists() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        let record = meta::load_meta(&layout)?;
        let publish_cursor = record.chunks.len() as u64;
        records.insert(
            session_id.to_string(),
            SessionEntry {
                record,
                store: ChunkStore::new(layout),
                outstanding: 0,
                publish_cursor,
                held: Vec::new(),
            },
        );
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let has_active = { self.active.lock().expect("active lock poisoned").is_some() };
        if has_active {
            if let Err(e) = self.stop_session() {
                warn!("stopping active session on engine drop failed: {e}");
            }
        }
        // Dropping the scheduler joins its worker and closes the outcome
        // channel, which ends the results thread.
        self.scheduler = None;
        if let Some(results) = self.results.take() {
            let _ = results.join();
        }
    }
}

fn longform_readable(layout: &SessionLayout) -> bool {
    crate::store::wav::wav_frame_count(&layout.longform_path()).is_ok()
}

fn fail_session(shared: &Shared, session_id: &str, reason: &str) {
    let mut publish = false;
    {
        let mut records = shared.records.lock().expect("records lock poisoned");
        if let Some(entry) = records.get_mut(session_id) {
            if entry.record.status != SessionStatus::Failed {
                entry.record.status = SessionStatus::Failed;
                if let Err(e) = entry.store.save(&entry.record) {
                    error!("saving failed session: {e}");
                }
                publish = true;
            }
        }
    }
    if publish {
        error!(session = %session_id, "session failed: {reason}");
        shared.bus.publish(&EngineEvent::SessionFailed {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
        });
    }
}

#[allow(clippy::too_many_arguments)]
fn mixer_loop(
    shared: Arc<Shared>,
    session_id: String,
    mut mixer: StreamMixer,
    mut recorder: LongFormRecorder,
    ingress_rx: Receiver<IngressFrame>,
    seg_tx: Sender<SegmenterFeed>,
    stop: Arc<AtomicBool>,
    stats: PipelineStats,
) {
    let mut failed = false;
    'run: loop {
        let frame = match ingress_rx.recv_timeout(MIXER_POLL) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Acquire) {
                    // Drain whatever capture already delivered, then leave.
                    for frame in ingress_rx.try_iter() {
                        mixer.push(frame.tag, &frame.samples);
                    }
                    None
                } else {
                    continue;
                }
            }
            Err(RecvTimeoutError::Disconnected) => None,
        };

        if let Some(frame) = frame {
            mixer.push(frame.tag, &frame.samples);
        }

        while let Some(block) = mixer.tick() {
            stats.add_samples_mixed((block.stereo.len() / 2) as u64);
            if let Err(e) = recorder.write_stereo(&block.stereo) {
                // Long-form write failures are session-fatal.
                fail_session(&shared, &session_id, &format!("long-form write failed: {e}"));
                failed = true;
                break 'run;
            }
            if seg_tx.send(block.feed).is_err() {
                break 'run;
            }
        }

        if frame.is_none() {
            break;
        }
    }

    if let Err(e) = recorder.close() {
        if !failed {
            fail_session(&shared, &session_id, &format!("long-form close failed: {e}"));
        }
    }

    let frames = recorder.samples_written();
    let mut records = shared.records.lock().expect("records lock poisoned");
    if let Some(entry) = records.get_mut(&session_id) {
        entry.record.set_sample_count(frames);
        if let Err(e) = entry.store.save(&entry.record) {
            error!("saving sample count: {e}");
        }
    }
}

fn segmenter_loop(
    shared: Arc<Shared>,
    scheduler: Arc<TranscribeScheduler>,
    session_id: String,
    mut segmenter: Segmenter,
    seg_rx: Receiver<SegmenterFeed>,
    stats: PipelineStats,
) {
    let mut down_mic = match StreamDownsampler::new(SESSION_RATE, TRANSCRIBE_RATE) {
        Ok(d) => d,
        Err(e) => {
            fail_session(&shared, &session_id, &format!("downsampler init: {e}"));
            return;
        }
    };
    let mut down_sys = match StreamDownsampler::new(SESSION_RATE, TRANSCRIBE_RATE) {
        Ok(d) => d,
        Err(e) => {
            fail_session(&shared, &session_id, &format!("downsampler init: {e}"));
            return;
        }
    };

    for feed in seg_rx.iter() {
        let events = match feed {
            SegmenterFeed::Mono(samples) => match down_mic.push(&samples) {
                Ok(s16) => segmenter.push_mono(&s16),
                Err(e) => {
                    warn!("downsample failed, dropping block: {e}");
                    continue;
                }
            },
            SegmenterFeed::Stereo { mic, sys } => {
                match (down_mic.push(&mic), down_sys.push(&sys)) {
                    (Ok(m16), Ok(s16)) => segmenter.push_stereo(&m16, &s16),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!("downsample failed, dropping block: {e}");
                        continue;
                    }
                }
            }
        };
        for event in events {
            handle_chunk_event(&shared, &scheduler, &session_id, event, &stats);
        }
    }

    if let Some(tail) = segmenter.flush() {
        handle_chunk_event(&shared, &scheduler, &session_id, tail, &stats);
    }
}

/// Persist a segmenter event, publish `chunk_created`, and enqueue it for
/// transcription. Runs on the segmenter thread, so chunk order and event
/// order agree by construction.
fn handle_chunk_event(
    shared: &Shared,
    scheduler: &TranscribeScheduler,
    session_id: &str,
    event: ChunkEvent,
    stats: &PipelineStats,
) {
    let mut to_publish: Vec<EngineEvent> = Vec::new();
    let mut job = None;

    {
        let mut records = shared.records.lock().expect("records lock poisoned");
        let Some(entry) = records.get_mut(session_id) else {
            return;
        };
        if entry.record.status != SessionStatus::Active {
            // Stopped and failed sessions never gain new chunks.
            return;
        }

        match entry.store.append(&mut entry.record, &event) {
            Ok(record) => {
                stats.inc_chunks_emitted();
                to_publish.push(EngineEvent::ChunkCreated {
                    session_id: session_id.to_string(),
                    chunk_id: record.id.clone(),
                    index: record.index,
                    start_ms: record.start_ms,
                    end_ms: record.end_ms,
                    is_stereo: record.is_stereo,
                });

                if let Some(stored) = entry.record.chunk_by_id_mut(&record.id) {
                    stored.status = ChunkStatus::Transcribing;
                }
                entry.outstanding += 1;
                let audio = match event.stereo {
                    Some(channels) => JobAudio::Stereo {
                        mic: channels.mic,
                        sys: channels.sys,
                    },
                    None => JobAudio::Mono(event.mono),
                };
                job = Some(ChunkJob {
                    session_id: session_id.to_string(),
                    chunk_id: record.id,
                    chunk_index: record.index,
                    audio,
                });
            }
            Err(StoreError::IndexGap { expected, got }) => {
                drop(records);
                fail_session(
                    shared,
                    session_id,
                    &format!("chunk index gap: expected {expected}, got {got}"),
                );
                return;
            }
            Err(e) => {
                // Local failure: record a failed chunk, session stays active.
                stats.inc_chunks_failed();
                warn!("chunk persist failed: {e}");
                let index = entry.record.chunks.len() as u64;
                let failed = ChunkRecord {
                    id: Uuid::now_v7().to_string(),
                    index,
                    start_ms: event.start_ms,
                    end_ms: event.end_ms,
                    is_stereo: event.stereo.is_some(),
                    status: ChunkStatus::Failed,
                    transcription: None,
                    mic_text: None,
                    sys_text: None,
                    mic_segments: None,
                    sys_segments: None,
                    dialogue: None,
                    error: Some(e.to_string()),
                    vad_method: Some(event.vad_method.to_string()),
                    sidecar: None,
                    mic_sidecar: None,
                    sys_sidecar: None,
                    regions: Some(event.regions.clone()),
                    mic_regions: event.mic_regions.clone(),
                    sys_regions: event.sys_regions.clone(),
                };
                to_publish.push(EngineEvent::ChunkCreated {
                    session_id: session_id.to_string(),
                    chunk_id: failed.id.clone(),
                    index,
                    start_ms: failed.start_ms,
                    end_ms: failed.end_ms,
                    is_stereo: failed.is_stereo,
                });
                let transcribed = EngineEvent::ChunkTranscribed {
                    session_id: session_id.to_string(),
                    chunk_id: failed.id.clone(),
                    index,
                    status: ChunkStatus::Failed,
                    error: failed.error.clone(),
                };
                if entry.store.append_record(&mut entry.record, failed).is_err() {
                    drop(records);
                    fail_session(shared, session_id, "failed chunk could not be recorded");
                    return;
                }
                if let Err(bug) = queue_transcribed_event(entry, index, transcribed, &mut to_publish)
                {
                    drop(records);
                    fail_session(shared, session_id, &bug);
                    return;
                }
            }
        }
    }

    for event in &to_publish {
        shared.bus.publish(event);
    }
    if let Some(job) = job {
        scheduler.submit_chunk(job);
    }
}

/// In-order release of `chunk_transcribed` events: publish at the cursor,
/// hold at cursor+1, anything deeper is a scheduler bug.
fn queue_transcribed_event(
    entry: &mut SessionEntry,
    index: u64,
    event: EngineEvent,
    to_publish: &mut Vec<EngineEvent>,
) -> Result<(), String> {
    if index < entry.publish_cursor {
        // A retranscribe of an already-released chunk publishes directly.
        to_publish.push(event);
        return Ok(());
    }
    if index == entry.publish_cursor {
        to_publish.push(event);
        entry.publish_cursor += 1;
        release_held(entry, to_publish);
        return Ok(());
    }
    if index == entry.publish_cursor + 1 && entry.held.is_empty() {
        entry.held.push((index, event));
        return Ok(());
    }
    Err(format!(
        "completion for chunk {index} arrived with cursor at {} and {} held",
        entry.publish_cursor,
        entry.held.len()
    ))
}

fn release_held(entry: &mut SessionEntry, to_publish: &mut Vec<EngineEvent>) {
    while let Some(pos) = entry
        .held
        .iter()
        .position(|(index, _)| *index == entry.publish_cursor)
    {
        let (_, event) = entry.held.remove(pos);
        to_publish.push(event);
        entry.publish_cursor += 1;
    }
}

/// Advance the cursor for a chunk that resolved without an event
/// (cancellation back to its prior state).
fn skip_transcribed_event(entry: &mut SessionEntry, index: u64, to_publish: &mut Vec<EngineEvent>) {
    if index == entry.publish_cursor {
        entry.publish_cursor += 1;
        release_held(entry, to_publish);
    }
}

fn apply_transcription(chunk: &mut ChunkRecord, transcription: ChunkTranscription) {
    let duration = chunk.duration_ms();
    match transcription {
        ChunkTranscription::Mono { text } => {
            chunk.transcription = Some(text);
        }
        ChunkTranscription::Stereo { mic, sys } => {
            let empty: Vec<crate::types::SpeechRegion> = Vec::new();
            let mic_regions = chunk
                .mic_regions
                .as_deref()
                .or(chunk.regions.as_deref())
                .unwrap_or(&empty);
            let sys_regions = chunk
                .sys_regions
                .as_deref()
                .or(chunk.regions.as_deref())
                .unwrap_or(&empty);
            let mic_segments =
                reconcile_segments(mic_regions, &mic, chunk.start_ms, duration, "mic");
            let sys_segments =
                reconcile_segments(sys_regions, &sys, chunk.start_ms, duration, "sys");

            chunk.mic_text = Some(join_texts(&mic_segments));
            chunk.sys_text = Some(join_texts(&sys_segments));
            chunk.dialogue = Some(merge_dialogue(&mic_segments, &sys_segments));
            chunk.mic_segments = Some(mic_segments);
            chunk.sys_segments = Some(sys_segments);
        }
    }
    chunk.status = ChunkStatus::Completed;
    chunk.error = None;
}

fn join_texts(segments: &[crate::types::TranscriptSegment]) -> String {
    segments
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

fn results_loop(shared: Arc<Shared>, outcomes: Receiver<SchedulerOutcome>) {
    for outcome in outcomes.iter() {
        match outcome {
            SchedulerOutcome::Chunk {
                session_id,
                chunk_id,
                chunk_index,
                result,
            } => {
                handle_chunk_outcome(&shared, &session_id, &chunk_id, chunk_index, result);
            }
            SchedulerOutcome::FullSegment {
                session_id,
                span_index,
                total,
                span,
                result,
            } => {
                handle_full_segment(&shared, &session_id, span_index, total, span, result);
            }
            SchedulerOutcome::FullFinished {
                session_id,
                outcome,
            } => {
                let event = match outcome {
                    FullOutcome::Completed => {
                        EngineEvent::FullTranscriptionCompleted { session_id }
                    }
                    FullOutcome::Cancelled => {
                        EngineEvent::FullTranscriptionCancelled { session_id }
                    }
                    FullOutcome::Error(reason) => EngineEvent::FullTranscriptionError {
                        session_id,
                        reason,
                    },
                };
                shared.bus.publish(&event);
            }
        }
    }
}

fn handle_chunk_outcome(
    shared: &Shared,
    session_id: &str,
    chunk_id: &str,
    chunk_index: u64,
    result: Result<ChunkTranscription, ScheduleError>,
) {
    let mut to_publish: Vec<EngineEvent> = Vec::new();
    let mut bug: Option<String> = None;

    {
        let mut records = shared.records.lock().expect("records lock poisoned");
        let Some(entry) = records.get_mut(session_id) else {
            return;
        };
        entry.outstanding = entry.outstanding.saturating_sub(1);
        shared.work_done.notify_all();

        // A result is written only while the chunk still exists and the
        // session has not aborted.
        if entry.record.status == SessionStatus::Failed
            || entry.record.chunk_by_id(chunk_id).is_none()
        {
            return;
        }

        // Outcome of the chunk mutation: the event to order-release, or a
        // cursor skip for a cancellation.
        let mut event: Option<EngineEvent> = None;
        let mut skipped = false;
        {
            let chunk = entry
                .record
                .chunk_by_id_mut(chunk_id)
                .expect("checked above");
            match result {
                Ok(transcription) => {
                    apply_transcription(chunk, transcription);
                    // Sidecars are reclaimed on successful completion; later
                    // retranscribes read the long-form recording.
                    entry.store.delete_sidecars(chunk);
                    event = Some(EngineEvent::ChunkTranscribed {
                        session_id: session_id.to_string(),
                        chunk_id: chunk_id.to_string(),
                        index: chunk_index,
                        status: ChunkStatus::Completed,
                        error: None,
                    });
                }
                Err(ScheduleError::Cancelled(reason)) => {
                    // Back to the prior state, no result committed.
                    chunk.status = ChunkStatus::Pending;
                    info!(chunk = %chunk_id, %reason, "chunk transcription cancelled");
                    skipped = true;
                }
                Err(e) => {
                    chunk.status = ChunkStatus::Failed;
                    chunk.error = Some(e.to_string());
                    event = Some(EngineEvent::ChunkTranscribed {
                        session_id: session_id.to_string(),
                        chunk_id: chunk_id.to_string(),
                        index: chunk_index,
                        status: ChunkStatus::Failed,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if skipped {
            skip_transcribed_event(entry, chunk_index, &mut to_publish);
        } else if let Some(event) = event {
            if let Err(e) = queue_transcribed_event(entry, chunk_index, event, &mut to_publish) {
                bug = Some(e);
            }
        }
        if let Err(e) = entry.store.save(&entry.record) {
            error!("saving chunk outcome: {e}");
        }
    }

    for event in &to_publish {
        shared.bus.publish(event);
    }
    if let Some(reason) = bug {
        fail_session(shared, session_id, &reason);
    }
}

fn handle_full_segment(
    shared: &Shared,
    session_id: &str,
    span_index: u64,
    total: u64,
    span: (u64, u64),
    result: Result<ChunkTranscription, crate::error::RecognizerError>,
) {
    let mut to_publish: Vec<EngineEvent> = Vec::new();
    {
        let mut records = shared.records.lock().expect("records lock poisoned");
        let Some(entry) = records.get_mut(session_id) else {
            return;
        };

        match result {
            Ok(transcription) => {
                if let Some(chunk) = entry
                    .record
                    .chunks
                    .iter_mut()
                    .find(|c| c.start_ms == span.0 && c.end_ms == span.1)
                {
                    chunk.reset_for_retranscribe();
                    apply_transcription(chunk, transcription);
                } else if span_index == entry.record.chunks.len() as u64 {
                    // Fixed-span plan over a chunkless session: segments
                    // materialize as chunks as they complete.
                    let mut chunk = ChunkRecord {
                        id: Uuid::now_v7().to_string(),
                        index: span_index,
                        start_ms: span.0,
                        end_ms: span.1,
                        is_stereo: matches!(transcription, ChunkTranscription::Stereo { .. }),
                        status: ChunkStatus::Pending,
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
                    apply_transcription(&mut chunk, transcription);
                    if let Err(e) = entry.store.append_record(&mut entry.record, chunk) {
                        warn!("full-segment chunk append failed: {e}");
                    }
                    entry.publish_cursor = entry.publish_cursor.max(span_index + 1);
                } else {
                    warn!(
                        "full segment {span_index} span {span:?} matches no chunk; result dropped"
                    );
                }
            }
            Err(e) => {
                if let Some(chunk) = entry
                    .record
                    .chunks
                    .iter_mut()
                    .find(|c| c.start_ms == span.0 && c.end_ms == span.1)
                {
                    chunk.status = ChunkStatus::Failed;
                    chunk.error = Some(e.to_string());
                }
            }
        }
        if let Err(e) = entry.store.save(&entry.record) {
            error!("saving full segment: {e}");
        }
        to_publish.push(EngineEvent::FullTranscriptionProgress {
            session_id: session_id.to_string(),
            segment: span_index + 1,
            total,
        });
    }

    for event in &to_publish {
        shared.bus.publish(event);
    }
}
