//! Chunk persistence: sidecar PCM files plus the session's chunk table.
//!
//! Appends are atomic with respect to observers: sidecars land on their
//! final paths (tmp + rename) before the record joins the session, so a
//! chunk the session can see always has its audio, and a failed append
//! leaves nothing behind.

use std::fs;

use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;
use crate::process::resample::LinearResampler;
use crate::store::meta::{self, SessionLayout};
use crate::store::wav::{read_wav, read_wav_range, write_pcm16_wav};
use crate::types::{
    ChunkEvent, ChunkRecord, ChunkStatus, SESSION_RATE, SessionRecord, StreamTag, TRANSCRIBE_RATE,
};

/// Which view of a chunk's audio to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioChannel {
    /// The mono mix.
    Mix,
    Mic,
    Sys,
}

/// Where transcription input comes from. The scheduler reads through this
/// seam and never learns whether sidecars or the finalized long-form
/// recording are behind it.
pub trait ChunkAudioSource: Send + Sync {
    /// 16 kHz mono samples covering `[start_ms, end_ms)` of session audio.
    fn read_span(&self, start_ms: u64, end_ms: u64, channel: AudioChannel)
    -> Result<Vec<f32>, StoreError>;
}

pub struct ChunkStore {
    layout: SessionLayout,
}

impl ChunkStore {
    pub fn new(layout: SessionLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    /// Materialize a segmenter event: sidecars on disk, then the record
    /// appended to the session and the session saved.
    pub fn append(
        &self,
        session: &mut SessionRecord,
        event: &ChunkEvent,
    ) -> Result<ChunkRecord, StoreError> {
        let index = session.chunks.len() as u64;
        let stereo = event.stereo.is_some();

        let mut written: Vec<String> = Vec::new();
        let result = if let Some(channels) = &event.stereo {
            let mic_rel = SessionLayout::sidecar_rel(index, Some(StreamTag::Mic));
            let sys_rel = SessionLayout::sidecar_rel(index, Some(StreamTag::Sys));
            write_pcm16_wav(
                &self.layout.resolve(&mic_rel),
                &channels.mic,
                TRANSCRIBE_RATE,
                1,
            )
            .map(|()| written.push(mic_rel.clone()))
            .and_then(|()| {
                write_pcm16_wav(
                    &self.layout.resolve(&sys_rel),
                    &channels.sys,
                    TRANSCRIBE_RATE,
                    1,
                )
                .map(|()| written.push(sys_rel.clone()))
            })
            .map(|()| (None, Some(mic_rel), Some(sys_rel)))
        } else {
            let rel = SessionLayout::sidecar_rel(index, None);
            write_pcm16_wav(&self.layout.resolve(&rel), &event.mono, TRANSCRIBE_RATE, 1)
                .map(|()| {
                    written.push(rel.clone());
                    (Some(rel), None, None)
                })
        };

        let (sidecar, mic_sidecar, sys_sidecar) = match result {
            Ok(paths) => paths,
            Err(e) => {
                for rel in written {
                    let _ = fs::remove_file(self.layout.resolve(&rel));
                }
                return Err(e);
            }
        };

        let record = ChunkRecord {
            id: Uuid::now_v7().to_string(),
            index,
            start_ms: event.start_ms,
            end_ms: event.end_ms,
            is_stereo: stereo,
            status: ChunkStatus::Pending,
            transcription: None,
            mic_text: None,
            sys_text: None,
            mic_segments: None,
            sys_segments: None,
            dialogue: None,
            error: None,
            vad_method: Some(event.vad_method.to_string()),
            sidecar,
            mic_sidecar,
            sys_sidecar,
            regions: Some(event.regions.clone()),
            mic_regions: event.mic_regions.clone(),
            sys_regions: event.sys_regions.clone(),
        };

        self.append_record(session, record.clone())?;
        Ok(record)
    }

    /// Append a prepared record. The index must be dense: exactly the count
    /// of chunks the session already has. A gap is an invariant violation
    /// the caller must escalate.
    pub fn append_record(
        &self,
        session: &mut SessionRecord,
        record: ChunkRecord,
    ) -> Result<(), StoreError> {
        let expected = session.chunks.len() as u64;
        if record.index != expected {
            return Err(StoreError::IndexGap {
                expected,
                got: record.index,
            });
        }
        session.chunks.push(record);
        meta::save_meta(&self.layout, session)?;
        Ok(())
    }

    /// Reclaim a chunk's sidecars after a terminal transition. Missing files
    /// are fine; the paths are cleared either way.
    pub fn delete_sidecars(&self, record: &mut ChunkRecord) {
        for rel in [
            record.sidecar.take(),
            record.mic_sidecar.take(),
            record.sys_sidecar.take(),
        ]
        .into_iter()
        .flatten()
        {
            if let Err(e) = fs::remove_file(self.layout.resolve(&rel)) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove sidecar {rel}: {e}");
                }
            }
        }
    }

    pub fn save(&self, session: &SessionRecord) -> Result<(), StoreError> {
        meta::save_meta(&self.layout, session)
    }
}

/// Reads chunk audio from per-chunk sidecar WAVs.
pub struct SidecarAudio {
    layout: SessionLayout,
    chunks: Vec<ChunkRecord>,
}

impl SidecarAudio {
    pub fn new(layout: SessionLayout, chunks: Vec<ChunkRecord>) -> Self {
        Self { layout, chunks }
    }

    fn containing_chunk(&self, start_ms: u64, end_ms: u64) -> Result<&ChunkRecord, StoreError> {
        self.chunks
            .iter()
            .find(|c| c.start_ms <= start_ms && end_ms <= c.end_ms)
            .ok_or_else(|| {
                StoreError::MissingAudio(format!("span {start_ms}..{end_ms} has no chunk"))
            })
    }

    fn read_sidecar(&self, record: &ChunkRecord, rel: Option<&str>) -> Result<Vec<f32>, StoreError> {
        let rel = rel.ok_or_else(|| StoreError::MissingAudio(record.id.clone()))?;
        let audio = read_wav(&self.layout.resolve(rel))?;
        Ok(audio.samples)
    }
}

impl ChunkAudioSource for SidecarAudio {
    fn read_span(
        &self,
        start_ms: u64,
        end_ms: u64,
        channel: AudioChannel,
    ) -> Result<Vec<f32>, StoreError> {
        let record = self.containing_chunk(start_ms, end_ms)?;
        let samples = match (channel, record.is_stereo) {
            (AudioChannel::Mix, false) => self.read_sidecar(record, record.sidecar.as_deref())?,
            (AudioChannel::Mic, true) => {
                self.read_sidecar(record, record.mic_sidecar.as_deref())?
            }
            (AudioChannel::Sys, true) => {
                self.read_sidecar(record, record.sys_sidecar.as_deref())?
            }
            (AudioChannel::Mix, true) => {
                let mic = self.read_sidecar(record, record.mic_sidecar.as_deref())?;
                let sys = self.read_sidecar(record, record.sys_sidecar.as_deref())?;
                mic.iter().zip(&sys).map(|(m, s)| (m + s) / 2.0).collect()
            }
            (AudioChannel::Mic | AudioChannel::Sys, false) => {
                return Err(StoreError::MissingAudio(format!(
                    "chunk {} is mono, no per-channel sidecar",
                    record.id
                )));
            }
        };

        // Slice the requested sub-span out of the chunk's audio.
        let offset = ((start_ms - record.start_ms) * u64::from(TRANSCRIBE_RATE) / 1000) as usize;
        let len = ((end_ms - start_ms) * u64::from(TRANSCRIBE_RATE) / 1000) as usize;
        let end = (offset + len).min(samples.len());
        Ok(samples[offset.min(samples.len())..end].to_vec())
    }
}

/// Reads chunk audio out of the finalized long-form recording, downmixed and
/// resampled to the transcription rate.
pub struct LongFormAudio {
    layout: SessionLayout,
    resampler: LinearResampler,
}

impl LongFormAudio {
    pub fn new(layout: SessionLayout) -> Result<Self, StoreError> {
        let resampler = LinearResampler::new(SESSION_RATE, TRANSCRIBE_RATE)
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        Ok(Self { layout, resampler })
    }
}

impl ChunkAudioSource for LongFormAudio {
    fn read_span(
        &self,
        start_ms: u64,
        end_ms: u64,
        channel: AudioChannel,
    ) -> Result<Vec<f32>, StoreError> {
        let start_frame = start_ms * u64::from(SESSION_RATE) / 1000;
        let frame_count = end_ms.saturating_sub(start_ms) * u64::from(SESSION_RATE) / 1000;
        let audio = read_wav_range(&self.layout.longform_path(), start_frame, frame_count)?;
        if audio.channels != 2 {
            return Err(StoreError::Malformed(format!(
                "long-form recording has {} channels, expected 2",
                audio.channels
            )));
        }

        let mono: Vec<f32> = audio
            .samples
            .chunks_exact(2)
            .map(|frame| match channel {
                AudioChannel::Mic => frame[0],
                AudioChannel::Sys => frame[1],
                AudioChannel::Mix => (frame[0] + frame[1]) / 2.0,
            })
            .collect();

        self.resampler
            .resample(&mono)
            .map_err(|e| StoreError::Malformed(e.to_string()))
    }
}
