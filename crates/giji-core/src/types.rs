use serde::{Deserialize, Serialize};

/// Session-rate audio: everything downstream of ingress runs at 48 kHz.
pub const SESSION_RATE: u32 = 48_000;

/// Transcription-rate audio: the segmenter, sidecars, and recognizer run at 16 kHz.
pub const TRANSCRIBE_RATE: u32 = 16_000;

/// Identifies the origin of an audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamTag {
    Mic,
    Sys,
}

impl StreamTag {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamTag::Mic => "mic",
            StreamTag::Sys => "sys",
        }
    }
}

/// How the pair of streams is turned into transcription input. Fixed for the
/// lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureMode {
    /// Echo-subtracted mono mix; one transcription per chunk.
    Standard,
    /// Mic and sys kept separate; each chunk is transcribed per channel.
    VoiceIsolation,
}

impl CaptureMode {
    pub fn is_stereo(self) -> bool {
        matches!(self, CaptureMode::VoiceIsolation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Transcribing,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::Failed)
    }
}

/// A single word with session-global timing and recognizer confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WordTiming {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    /// Recognizer confidence in [0, 1].
    pub confidence: f32,
}

/// One transcript span in session-global time, attributed to a speaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSegment {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    /// `"mic"`, `"sys"`, or an opaque diarization label.
    pub speaker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<WordTiming>>,
}

/// A maximal detected-speech interval in audio-local time (relative to the
/// start of the chunk's audio).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechRegion {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl SpeechRegion {
    pub fn duration_ms(self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Per-channel 16 kHz samples for a voice-isolation chunk. Both buffers cover
/// exactly the same time range.
#[derive(Debug, Clone)]
pub struct StereoSamples {
    pub mic: Vec<f32>,
    pub sys: Vec<f32>,
}

/// Segmenter output: one speech-bounded span of session audio, ready to be
/// persisted and scheduled.
#[derive(Debug, Clone)]
pub struct ChunkEvent {
    /// Session-relative bounds, monotonic across events.
    pub start_ms: u64,
    pub end_ms: u64,
    /// 16 kHz mono samples for the span. In voice-isolation mode this is the
    /// equal-weight average of the two channels.
    pub mono: Vec<f32>,
    /// Present in voice-isolation mode only.
    pub stereo: Option<StereoSamples>,
    /// Detected-speech regions, audio-local. Unified across channels in
    /// voice-isolation mode.
    pub regions: Vec<SpeechRegion>,
    /// Per-channel regions on the same chunk-local axis; present in
    /// voice-isolation mode and required to reconcile each channel's
    /// recognizer clock.
    pub mic_regions: Option<Vec<SpeechRegion>>,
    pub sys_regions: Option<Vec<SpeechRegion>>,
    /// Which VAD method actually ran (`"energy"` or `"neural"`); records the
    /// neural-to-energy fallback when it happens.
    pub vad_method: &'static str,
}

impl ChunkEvent {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Persisted record of one chunk, as stored in `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub id: String,
    pub index: u64,
    pub start_ms: u64,
    pub end_ms: u64,
    pub is_stereo: bool,
    pub status: ChunkStatus,
    /// Mono transcription text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mic_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sys_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mic_segments: Option<Vec<TranscriptSegment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sys_segments: Option<Vec<TranscriptSegment>>,
    /// Mic and sys segments merged and sorted by start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialogue: Option<Vec<TranscriptSegment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// VAD method that produced this chunk (`"energy"` or `"neural"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vad_method: Option<String>,
    /// Sidecar paths relative to the session directory. Cleared when the
    /// sidecars are reclaimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mic_sidecar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sys_sidecar: Option<String>,
    /// Audio-local speech regions captured at segmentation time; drives
    /// timestamp reconciliation, including after a retranscribe. Unified
    /// across channels for stereo chunks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regions: Option<Vec<SpeechRegion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mic_regions: Option<Vec<SpeechRegion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sys_regions: Option<Vec<SpeechRegion>>,
}

impl ChunkRecord {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    /// Drop any previous transcription output, returning the record to
    /// `pending` ahead of a retranscribe.
    pub fn reset_for_retranscribe(&mut self) {
        self.status = ChunkStatus::Pending;
        self.transcription = None;
        self.mic_text = None;
        self.sys_text = None;
        self.mic_segments = None;
        self.sys_segments = None;
        self.dialogue = None;
        self.error = None;
    }
}

/// Persisted record of one session, the root document of `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    /// RFC3339 wall-clock instant of session start.
    pub start_time: String,
    pub status: SessionStatus,
    /// Derived: `sample_count * 1000 / 48000`, in milliseconds.
    pub total_duration: u64,
    /// Stereo frames durably handed to the long-form recorder.
    pub sample_count: u64,
    pub chunks: Vec<ChunkRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl SessionRecord {
    pub fn new(id: String, start_time: String) -> Self {
        Self {
            id,
            start_time,
            status: SessionStatus::Active,
            total_duration: 0,
            sample_count: 0,
            chunks: Vec::new(),
            summary: None,
        }
    }

    /// Recompute `total_duration` from the recorded frame count.
    pub fn set_sample_count(&mut self, frames: u64) {
        self.sample_count = frames;
        self.total_duration = frames * 1000 / u64::from(SESSION_RATE);
    }

    pub fn chunk_by_id(&self, chunk_id: &str) -> Option<&ChunkRecord> {
        self.chunks.iter().find(|c| c.id == chunk_id)
    }

    pub fn chunk_by_id_mut(&mut self, chunk_id: &str) -> Option<&mut ChunkRecord> {
        self.chunks.iter_mut().find(|c| c.id == chunk_id)
    }
}

/// Lifecycle and result events published on the engine bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    SessionStarted {
        session_id: String,
        start_time: String,
    },
    SessionStopped {
        session_id: String,
        total_duration_ms: u64,
        chunk_count: u64,
    },
    SessionFailed {
        session_id: String,
        reason: String,
    },
    SessionDeleted {
        session_id: String,
    },
    ChunkCreated {
        session_id: String,
        chunk_id: String,
        index: u64,
        start_ms: u64,
        end_ms: u64,
        is_stereo: bool,
    },
    ChunkTranscribed {
        session_id: String,
        chunk_id: String,
        index: u64,
        status: ChunkStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ModelProgress {
        model: String,
        progress: f32,
    },
    FullTranscriptionProgress {
        session_id: String,
        segment: u64,
        total: u64,
    },
    FullTranscriptionCompleted {
        session_id: String,
    },
    FullTranscriptionCancelled {
        session_id: String,
    },
    FullTranscriptionError {
        session_id: String,
        reason: String,
    },
}

impl EngineEvent {
    /// The session this event belongs to, when it has one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            EngineEvent::SessionStarted { session_id, .. }
            | EngineEvent::SessionStopped { session_id, .. }
            | EngineEvent::SessionFailed { session_id, .. }
            | EngineEvent::SessionDeleted { session_id }
            | EngineEvent::ChunkCreated { session_id, .. }
            | EngineEvent::ChunkTranscribed { session_id, .. }
            | EngineEvent::FullTranscriptionProgress { session_id, .. }
            | EngineEvent::FullTranscriptionCompleted { session_id }
            | EngineEvent::FullTranscriptionCancelled { session_id }
            | EngineEvent::FullTranscriptionError { session_id, .. } => Some(session_id),
            EngineEvent::ModelProgress { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_duration_tracks_sample_count() {
        let mut session = SessionRecord::new("s1".into(), "2026-01-01T00:00:00Z".into());
        session.set_sample_count(48_000 * 90);
        assert_eq!(session.total_duration, 90_000);

        // Sub-frame remainders truncate, never round up.
        session.set_sample_count(48_000 + 47);
        assert_eq!(session.total_duration, 1000);
    }

    #[test]
    fn chunk_reset_clears_outputs_only() {
        let mut chunk = ChunkRecord {
            id: "c1".into(),
            index: 3,
            start_ms: 1000,
            end_ms: 2500,
            is_stereo: false,
            status: ChunkStatus::Failed,
            transcription: Some("hello".into()),
            mic_text: None,
            sys_text: None,
            mic_segments: None,
            sys_segments: None,
            dialogue: None,
            error: Some("boom".into()),
            vad_method: Some("energy".into()),
            sidecar: Some("chunks/003.wav".into()),
            mic_sidecar: None,
            sys_sidecar: None,
            regions: Some(vec![SpeechRegion {
                start_ms: 0,
                end_ms: 1500,
            }]),
            mic_regions: None,
            sys_regions: None,
        };

        chunk.reset_for_retranscribe();
        assert_eq!(chunk.status, ChunkStatus::Pending);
        assert!(chunk.transcription.is_none());
        assert!(chunk.error.is_none());
        // Identity, bounds, and segmentation metadata survive.
        assert_eq!(chunk.index, 3);
        assert_eq!(chunk.start_ms, 1000);
        assert!(chunk.regions.is_some());
        assert!(chunk.sidecar.is_some());
    }

    #[test]
    fn meta_json_field_names_are_stable() {
        let mut session = SessionRecord::new("abc".into(), "2026-01-01T00:00:00Z".into());
        session.set_sample_count(48_000);
        session.chunks.push(ChunkRecord {
            id: "c0".into(),
            index: 0,
            start_ms: 0,
            end_ms: 1000,
            is_stereo: true,
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
            mic_sidecar: Some("chunks/000_mic.wav".into()),
            sys_sidecar: Some("chunks/000_sys.wav".into()),
            regions: None,
            mic_regions: None,
            sys_regions: None,
        });

        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["startTime"], "2026-01-01T00:00:00Z");
        assert_eq!(json["totalDuration"], 1000);
        assert_eq!(json["sampleCount"], 48_000);
        assert_eq!(json["status"], "active");
        let chunk = &json["chunks"][0];
        assert_eq!(chunk["startMs"], 0);
        assert_eq!(chunk["endMs"], 1000);
        assert_eq!(chunk["isStereo"], true);
        assert_eq!(chunk["status"], "pending");
        // Absent optionals are omitted, not null.
        assert!(chunk.get("transcription").is_none());
        assert!(chunk.get("error").is_none());
    }

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = EngineEvent::ChunkTranscribed {
            session_id: "s1".into(),
            chunk_id: "c1".into(),
            index: 2,
            status: ChunkStatus::Completed,
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "chunk_transcribed");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["chunkId"], "c1");
        assert_eq!(json["status"], "completed");
    }
}
