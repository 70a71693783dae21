use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use giji_core::process::segment::{SegmentMode, SegmenterConfig, VadMethodChoice};
use giji_core::session::SessionConfig;
use giji_core::types::CaptureMode;

const CONFIG_VERSION: u32 = 1;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("home directory not found; set HOME")]
    HomeMissing,
    #[error("config io error: {0}")]
    Io(#[from] io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("config validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub base_dir: PathBuf,
    pub config_path: PathBuf,
    pub models_dir: PathBuf,
    pub sessions_dir: PathBuf,
}

impl ConfigPaths {
    pub fn from_home() -> Result<Self, ConfigError> {
        let home = std::env::var("HOME").map_err(|_| ConfigError::HomeMissing)?;
        Ok(Self::from_base(PathBuf::from(home).join(".giji")))
    }

    pub fn from_base(base_dir: PathBuf) -> Self {
        let config_path = base_dir.join("config.toml");
        let models_dir = base_dir.join("models");
        let sessions_dir = base_dir.join("sessions");
        Self {
            base_dir,
            config_path,
            models_dir,
            sessions_dir,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub version: u32,
    pub audio: AudioConfig,
    pub segmenter: SegmenterTable,
    pub recognizer: RecognizerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            audio: AudioConfig::default(),
            segmenter: SegmenterTable::default(),
            recognizer: RecognizerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// `standard` (echo-subtracted mono mix) or `voice-isolation`
    /// (per-channel transcription).
    pub mode: String,
    pub echo_alpha: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            mode: "standard".to_string(),
            echo_alpha: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterTable {
    /// `auto`, `compression`, `per-region`, or `off`.
    pub mode: String,
    /// `auto`, `energy`, or `neural`.
    pub method: String,
    pub frame_ms: u32,
    pub start_threshold: f32,
    pub stop_threshold: f32,
    pub min_voiced_ms: u64,
    pub min_silence_ms: u64,
    pub gap_ms: u64,
    pub min_chunk_ms: u64,
    pub max_chunk_ms: u64,
}

impl Default for SegmenterTable {
    fn default() -> Self {
        let defaults = SegmenterConfig::default();
        Self {
            mode: "auto".to_string(),
            method: "auto".to_string(),
            frame_ms: defaults.frame_ms,
            start_threshold: defaults.start_threshold,
            stop_threshold: defaults.stop_threshold,
            min_voiced_ms: defaults.min_voiced_ms,
            min_silence_ms: defaults.min_silence_ms,
            gap_ms: defaults.gap_ms,
            min_chunk_ms: defaults.min_chunk_ms,
            max_chunk_ms: defaults.max_chunk_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Path to a GGML whisper model file.
    pub model: String,
    /// Optional per-chunk watchdog; 0 disables it.
    pub watchdog_ms: u64,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            watchdog_ms: 0,
        }
    }
}

impl Config {
    pub fn load_or_create(paths: &ConfigPaths) -> Result<Self, ConfigError> {
        ensure_dirs(paths)?;
        if paths.config_path.exists() {
            return Self::load(paths);
        }
        let config = Self::default();
        Self::write(paths, &config)?;
        Ok(config)
    }

    pub fn load(paths: &ConfigPaths) -> Result<Self, ConfigError> {
        ensure_dirs(paths)?;
        let content = fs::read_to_string(&paths.config_path)?;
        let raw: toml::Value = toml::from_str(&content)?;
        let file_version = raw
            .get("version")
            .and_then(|value| value.as_integer())
            .unwrap_or(0) as u32;

        let mut config: Config = toml::from_str(&content)?;
        let mut migrated = false;

        if file_version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
            migrated = true;
        } else if file_version > CONFIG_VERSION {
            eprintln!(
                "config version {file_version} is newer than supported {CONFIG_VERSION}; proceeding"
            );
        }

        if migrated {
            Self::write(paths, &config)?;
        }

        Ok(config)
    }

    pub fn write(paths: &ConfigPaths, config: &Config) -> Result<(), ConfigError> {
        ensure_dirs(paths)?;
        let content = toml::to_string_pretty(config)?;
        write_atomic(&paths.config_path, content.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.capture_mode()?;
        self.session_config()?
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(())
    }

    pub fn capture_mode(&self) -> Result<CaptureMode, ConfigError> {
        match self.audio.mode.as_str() {
            "standard" => Ok(CaptureMode::Standard),
            "voice-isolation" => Ok(CaptureMode::VoiceIsolation),
            other => Err(ConfigError::Validation(format!(
                "unknown audio mode: {other}"
            ))),
        }
    }

    fn segment_mode(&self) -> Result<SegmentMode, ConfigError> {
        match self.segmenter.mode.as_str() {
            "auto" => Ok(SegmentMode::Auto),
            "compression" => Ok(SegmentMode::Compression),
            "per-region" => Ok(SegmentMode::PerRegion),
            "off" => Ok(SegmentMode::Off),
            other => Err(ConfigError::Validation(format!(
                "unknown segmenter mode: {other}"
            ))),
        }
    }

    pub fn vad_method(&self) -> Result<VadMethodChoice, ConfigError> {
        match self.segmenter.method.as_str() {
            "auto" => Ok(VadMethodChoice::Auto),
            "energy" => Ok(VadMethodChoice::Energy),
            "neural" => Ok(VadMethodChoice::Neural),
            other => Err(ConfigError::Validation(format!(
                "unknown vad method: {other}"
            ))),
        }
    }

    /// Resolve the TOML tables into the engine's session configuration.
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        Ok(SessionConfig {
            mode: self.capture_mode()?,
            echo_alpha: self.audio.echo_alpha,
            segmenter: SegmenterConfig {
                mode: self.segment_mode()?,
                method: self.vad_method()?,
                frame_ms: self.segmenter.frame_ms,
                start_threshold: self.segmenter.start_threshold,
                stop_threshold: self.segmenter.stop_threshold,
                min_voiced_ms: self.segmenter.min_voiced_ms,
                min_silence_ms: self.segmenter.min_silence_ms,
                gap_ms: self.segmenter.gap_ms,
                min_chunk_ms: self.segmenter.min_chunk_ms,
                max_chunk_ms: self.segmenter.max_chunk_ms,
            },
        })
    }
}

fn ensure_dirs(paths: &ConfigPaths) -> Result<(), ConfigError> {
    fs::create_dir_all(&paths.base_dir)?;
    fs::create_dir_all(&paths.models_dir)?;
    fs::create_dir_all(&paths.sessions_dir)?;
    Ok(())
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ConfigError> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("config path missing parent directory"))?;
    let tmp_path = parent.join(".tmp-write");
    fs::write(&tmp_path, contents)?;
    set_strict_permissions(&tmp_path)?;
    fs::rename(tmp_path, path)?;
    Ok(())
}

fn set_strict_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let perm = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perm)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
