use std::io;

use crate::error::{RecorderError, StoreError};
use crate::store::meta::SessionLayout;
use crate::store::wav::WavWriter;
use crate::types::SESSION_RATE;

fn to_recorder_error(e: StoreError) -> RecorderError {
    match e {
        StoreError::Io(io_err) => RecorderError::Io(io_err),
        other => RecorderError::Io(io::Error::other(other.to_string())),
    }
}

/// Streaming long-form recorder: one 48 kHz stereo WAV per session
/// (L = mic, R = sys). Write failures are session-fatal at the call site.
pub struct LongFormRecorder {
    writer: WavWriter,
}

impl LongFormRecorder {
    pub fn create(layout: &SessionLayout) -> Result<Self, RecorderError> {
        let writer = WavWriter::create(&layout.longform_path(), SESSION_RATE, 2)
            .map_err(to_recorder_error)?;
        Ok(Self { writer })
    }

    /// Append an interleaved `(mic, sys)` block.
    pub fn write_stereo(&mut self, interleaved: &[f32]) -> Result<(), RecorderError> {
        debug_assert!(interleaved.len() % 2 == 0);
        self.writer
            .write_samples(interleaved)
            .map_err(to_recorder_error)
    }

    /// Stereo frames durably handed off; the session derives its duration
    /// from this count.
    pub fn samples_written(&self) -> u64 {
        self.writer.frames_written()
    }

    /// Finalize the container. Idempotent; must complete before any post-hoc
    /// extraction from the recording.
    pub fn close(&mut self) -> Result<(), RecorderError> {
        self.writer.finalize().map_err(to_recorder_error)
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_finalized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::wav::read_wav;
    use tempfile::tempdir;

    #[test]
    fn records_and_counts_stereo_frames() {
        let dir = tempdir().unwrap();
        let layout = SessionLayout::new(dir.path(), "s");
        layout.ensure_dirs().unwrap();

        let mut recorder = LongFormRecorder::create(&layout).unwrap();
        recorder.write_stereo(&[0.1; 9600]).unwrap();
        recorder.write_stereo(&[0.2; 960]).unwrap();
        assert_eq!(recorder.samples_written(), 5280);

        recorder.close().unwrap();
        // close() is idempotent.
        recorder.close().unwrap();
        assert!(recorder.is_closed());

        let audio = read_wav(&layout.longform_path()).unwrap();
        assert_eq!(audio.sample_rate, SESSION_RATE);
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.samples.len(), 10_560);
    }
}
