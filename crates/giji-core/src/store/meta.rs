//! Session directory layout and `meta.json` persistence.
//!
//! Layout per session:
//! ```text
//! <data_dir>/<session_id>/
//!   meta.json
//!   full.wav          48 kHz stereo long-form recording (L=mic, R=sys)
//!   chunks/
//!     NNN.wav         mono sidecar, NNN = zero-padded chunk index
//!     NNN_mic.wav     voice-isolation mic sidecar
//!     NNN_sys.wav     voice-isolation sys sidecar
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::StoreError;
use crate::types::{SessionRecord, StreamTag};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const META_FILE: &str = "meta.json";
pub const LONGFORM_FILE: &str = "full.wav";
pub const CHUNKS_DIR: &str = "chunks";

/// Paths for one session's on-disk footprint.
#[derive(Debug, Clone)]
pub struct SessionLayout {
    root: PathBuf,
}

impl SessionLayout {
    pub fn new(data_dir: &Path, session_id: &str) -> Self {
        Self {
            root: data_dir.join(session_id),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta_path(&self) -> PathBuf {
        self.root.join(META_FILE)
    }

    pub fn longform_path(&self) -> PathBuf {
        self.root.join(LONGFORM_FILE)
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.root.join(CHUNKS_DIR)
    }

    /// Sidecar path relative to the session root; `channel` selects the
    /// voice-isolation variant.
    pub fn sidecar_rel(index: u64, channel: Option<StreamTag>) -> String {
        match channel {
            None => format!("{CHUNKS_DIR}/{index:03}.wav"),
            Some(tag) => format!("{CHUNKS_DIR}/{index:03}_{}.wav", tag.as_str()),
        }
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn ensure_dirs(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.chunks_dir())?;
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.meta_path().is_file()
    }

    /// Remove the whole session directory.
    pub fn remove(&self) -> Result<(), StoreError> {
        fs::remove_dir_all(&self.root)?;
        Ok(())
    }
}

fn set_strict_permissions(path: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        let perm = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perm)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Io(io::Error::other("path missing parent directory")))?;
    let tmp = parent.join(".tmp-meta");
    fs::write(&tmp, contents)?;
    set_strict_permissions(&tmp)?;
    fs::rename(tmp, path)?;
    Ok(())
}

pub fn save_meta(layout: &SessionLayout, record: &SessionRecord) -> Result<(), StoreError> {
    let payload = serde_json::to_string_pretty(record)?;
    write_atomic(&layout.meta_path(), payload.as_bytes())
}

pub fn load_meta(layout: &SessionLayout) -> Result<SessionRecord, StoreError> {
    let contents = fs::read_to_string(layout.meta_path())?;
    Ok(serde_json::from_str(&contents)?)
}

/// All sessions under `data_dir`, newest first. Unreadable entries are
/// skipped with a warning rather than failing the listing.
pub fn list_sessions(data_dir: &Path) -> Result<Vec<SessionRecord>, StoreError> {
    let mut sessions = Vec::new();
    let entries = match fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(sessions),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let layout = SessionLayout {
            root: entry.path(),
        };
        if !layout.exists() {
            continue;
        }
        match load_meta(&layout) {
            Ok(record) => sessions.push(record),
            Err(e) => warn!("skipping unreadable session {:?}: {e}", entry.path()),
        }
    }
    sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionStatus;
    use tempfile::tempdir;

    #[test]
    fn sidecar_names_are_zero_padded() {
        assert_eq!(SessionLayout::sidecar_rel(7, None), "chunks/007.wav");
        assert_eq!(
            SessionLayout::sidecar_rel(42, Some(StreamTag::Mic)),
            "chunks/042_mic.wav"
        );
        assert_eq!(
            SessionLayout::sidecar_rel(123, Some(StreamTag::Sys)),
            "chunks/123_sys.wav"
        );
    }

    #[test]
    fn meta_round_trip() {
        let dir = tempdir().unwrap();
        let layout = SessionLayout::new(dir.path(), "abc");
        layout.ensure_dirs().unwrap();

        let mut record = SessionRecord::new("abc".into(), "2026-03-01T10:00:00Z".into());
        record.set_sample_count(48_000 * 5);
        save_meta(&layout, &record).unwrap();

        let loaded = load_meta(&layout).unwrap();
        assert_eq!(loaded.id, "abc");
        assert_eq!(loaded.total_duration, 5000);
        assert_eq!(loaded.status, SessionStatus::Active);
    }

    #[test]
    fn save_replaces_atomically() {
        let dir = tempdir().unwrap();
        let layout = SessionLayout::new(dir.path(), "abc");
        layout.ensure_dirs().unwrap();

        let mut record = SessionRecord::new("abc".into(), "2026-03-01T10:00:00Z".into());
        save_meta(&layout, &record).unwrap();
        record.status = SessionStatus::Stopped;
        save_meta(&layout, &record).unwrap();

        let loaded = load_meta(&layout).unwrap();
        assert_eq!(loaded.status, SessionStatus::Stopped);
        // No stray tmp file left behind.
        assert!(!layout.root().join(".tmp-meta").exists());
    }

    #[test]
    fn list_sessions_skips_non_sessions() {
        let dir = tempdir().unwrap();
        let a = SessionLayout::new(dir.path(), "a");
        a.ensure_dirs().unwrap();
        save_meta(
            &a,
            &SessionRecord::new("a".into(), "2026-03-01T10:00:00Z".into()),
        )
        .unwrap();
        let b = SessionLayout::new(dir.path(), "b");
        b.ensure_dirs().unwrap();
        save_meta(
            &b,
            &SessionRecord::new("b".into(), "2026-03-02T10:00:00Z".into()),
        )
        .unwrap();
        // A directory without meta.json is not a session.
        fs::create_dir_all(dir.path().join("junk")).unwrap();

        let sessions = list_sessions(dir.path()).unwrap();
        assert_eq!(sessions.len(), 2);
        // Newest first.
        assert_eq!(sessions[0].id, "b");
    }

    #[test]
    fn listing_missing_data_dir_is_empty() {
        let dir = tempdir().unwrap();
        let sessions = list_sessions(&dir.path().join("nope")).unwrap();
        assert!(sessions.is_empty());
    }
}
