//! Canonical RIFF/WAVE handling: PCM16 with a fixed 44-byte header.
//!
//! The header's declared rate and channel count are authoritative for every
//! consumer; the `data` chunk length must match the file size exactly.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::StoreError;

fn write_header<W: Write>(
    writer: &mut W,
    sample_rate: u32,
    channels: u16,
    data_bytes: u32,
) -> io::Result<()> {
    let block_align = channels * 2;
    let byte_rate = sample_rate * u32::from(block_align);

    writer.write_all(b"RIFF")?;
    writer.write_all(&(36 + data_bytes).to_le_bytes())?;
    writer.write_all(b"WAVE")?;

    writer.write_all(b"fmt ")?;
    writer.write_all(&16u32.to_le_bytes())?;
    writer.write_all(&1u16.to_le_bytes())?; // PCM
    writer.write_all(&channels.to_le_bytes())?;
    writer.write_all(&sample_rate.to_le_bytes())?;
    writer.write_all(&byte_rate.to_le_bytes())?;
    writer.write_all(&block_align.to_le_bytes())?;
    writer.write_all(&16u16.to_le_bytes())?;

    writer.write_all(b"data")?;
    writer.write_all(&data_bytes.to_le_bytes())?;
    Ok(())
}

fn sample_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Write a whole PCM16 WAV atomically (tmp file + rename).
pub fn write_pcm16_wav(
    path: &Path,
    samples: &[f32],
    sample_rate: u32,
    channels: u16,
) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        let data_bytes = (samples.len() * 2) as u32;
        write_header(&mut writer, sample_rate, channels, data_bytes)?;
        for &sample in samples {
            writer.write_all(&sample_to_i16(sample).to_le_bytes())?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Streaming PCM16 writer: header first with zero sizes, sizes patched on
/// finalize. A crash before finalize leaves the sizes zeroed, which readers
/// reject as unfinalized.
pub struct WavWriter {
    file: Option<BufWriter<File>>,
    path: PathBuf,
    sample_rate: u32,
    channels: u16,
    frames_written: u64,
}

impl WavWriter {
    pub fn create(path: &Path, sample_rate: u32, channels: u16) -> Result<Self, StoreError> {
        let mut file = BufWriter::new(File::create(path)?);
        write_header(&mut file, sample_rate, channels, 0)?;
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
            sample_rate,
            channels,
            frames_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Interleaved frames durably handed off so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn is_finalized(&self) -> bool {
        self.file.is_none()
    }

    /// Append interleaved samples; the slice length must be a whole number
    /// of frames.
    pub fn write_samples(&mut self, samples: &[f32]) -> Result<(), StoreError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::Malformed("write after finalize".into()))?;
        for &sample in samples {
            file.write_all(&sample_to_i16(sample).to_le_bytes())?;
        }
        self.frames_written += samples.len() as u64 / u64::from(self.channels);
        Ok(())
    }

    /// Patch the header sizes and close. Idempotent: a second call is a
    /// no-op.
    pub fn finalize(&mut self) -> Result<(), StoreError> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        let data_bytes =
            (self.frames_written * u64::from(self.channels) * 2).min(u64::from(u32::MAX)) as u32;
        file.flush()?;
        file.seek(SeekFrom::Start(4))?;
        file.write_all(&(36 + data_bytes).to_le_bytes())?;
        file.seek(SeekFrom::Start(40))?;
        file.write_all(&data_bytes.to_le_bytes())?;
        file.flush()?;
        Ok(())
    }
}

/// Decoded WAV audio with its authoritative format.
#[derive(Debug, Clone)]
pub struct WavAudio {
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved samples as f32.
    pub samples: Vec<f32>,
}

struct WavLayout {
    sample_rate: u32,
    channels: u16,
    bits_per_sample: u16,
    format: u16,
    data_offset: u64,
    data_bytes: u64,
}

fn parse_layout(reader: &mut BufReader<File>, file_len: u64) -> Result<WavLayout, StoreError> {
    let mut magic = [0u8; 12];
    reader.read_exact(&mut magic)?;
    if &magic[0..4] != b"RIFF" || &magic[8..12] != b"WAVE" {
        return Err(StoreError::Malformed("not a RIFF/WAVE file".into()));
    }

    let mut format = None;
    let mut offset = 12u64;
    loop {
        let mut chunk_header = [0u8; 8];
        if reader.read_exact(&mut chunk_header).is_err() {
            return Err(StoreError::Malformed("missing data chunk".into()));
        }
        let chunk_size = u64::from(u32::from_le_bytes([
            chunk_header[4],
            chunk_header[5],
            chunk_header[6],
            chunk_header[7],
        ]));
        offset += 8;

        match &chunk_header[0..4] {
            b"fmt " => {
                let mut body = vec![0u8; chunk_size as usize];
                reader.read_exact(&mut body)?;
                if body.len() < 16 {
                    return Err(StoreError::Malformed("fmt chunk too short".into()));
                }
                format = Some((
                    u16::from_le_bytes([body[0], body[1]]),
                    u16::from_le_bytes([body[2], body[3]]),
                    u32::from_le_bytes([body[4], body[5], body[6], body[7]]),
                    u16::from_le_bytes([body[14], body[15]]),
                ));
                offset += chunk_size;
            }
            b"data" => {
                let (fmt, channels, sample_rate, bits) = format
                    .ok_or_else(|| StoreError::Malformed("data chunk before fmt".into()))?;
                if chunk_size == 0 || offset + chunk_size > file_len {
                    return Err(StoreError::Malformed(
                        "data chunk length inconsistent with file size".into(),
                    ));
                }
                return Ok(WavLayout {
                    sample_rate,
                    channels,
                    bits_per_sample: bits,
                    format: fmt,
                    data_offset: offset,
                    data_bytes: chunk_size,
                });
            }
            _ => {
                reader.seek(SeekFrom::Current(chunk_size as i64))?;
                offset += chunk_size;
            }
        }
    }
}

fn decode_samples(bytes: &[u8], format: u16, bits: u16) -> Result<Vec<f32>, StoreError> {
    match (format, bits) {
        (1, 16) => Ok(bytes
            .chunks_exact(2)
            .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
            .collect()),
        (3, 32) => Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()),
        other => Err(StoreError::Malformed(format!(
            "unsupported wav encoding {other:?}"
        ))),
    }
}

/// Read a whole WAV file.
pub fn read_wav(path: &Path) -> Result<WavAudio, StoreError> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let layout = parse_layout(&mut reader, file_len)?;

    let mut bytes = vec![0u8; layout.data_bytes as usize];
    reader.read_exact(&mut bytes)?;
    Ok(WavAudio {
        sample_rate: layout.sample_rate,
        channels: layout.channels,
        samples: decode_samples(&bytes, layout.format, layout.bits_per_sample)?,
    })
}

/// Read a frame range out of a WAV file without loading the rest.
pub fn read_wav_range(
    path: &Path,
    start_frame: u64,
    frame_count: u64,
) -> Result<WavAudio, StoreError> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let layout = parse_layout(&mut reader, file_len)?;

    let bytes_per_frame = u64::from(layout.channels) * u64::from(layout.bits_per_sample / 8);
    let total_frames = layout.data_bytes / bytes_per_frame;
    let start = start_frame.min(total_frames);
    let count = frame_count.min(total_frames - start);

    reader.seek(SeekFrom::Start(layout.data_offset + start * bytes_per_frame))?;
    let mut bytes = vec![0u8; (count * bytes_per_frame) as usize];
    reader.read_exact(&mut bytes)?;
    Ok(WavAudio {
        sample_rate: layout.sample_rate,
        channels: layout.channels,
        samples: decode_samples(&bytes, layout.format, layout.bits_per_sample)?,
    })
}

/// Total frames in a finalized WAV file.
pub fn wav_frame_count(path: &Path) -> Result<u64, StoreError> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let layout = parse_layout(&mut reader, file_len)?;
    let bytes_per_frame = u64::from(layout.channels) * u64::from(layout.bits_per_sample / 8);
    Ok(layout.data_bytes / bytes_per_frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pcm16_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        let samples = vec![0.0f32, 0.5, -0.5, 1.0, -1.0];
        write_pcm16_wav(&path, &samples, 16_000, 1).unwrap();

        let audio = read_wav(&path).unwrap();
        assert_eq!(audio.sample_rate, 16_000);
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.samples.len(), 5);
        for (got, want) in audio.samples.iter().zip(&samples) {
            assert!((got - want).abs() < 1.0 / 32000.0, "{got} vs {want}");
        }
    }

    #[test]
    fn header_layout_is_the_44_byte_form() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("h.wav");
        write_pcm16_wav(&path, &[0.25; 160], 16_000, 1).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(&bytes[12..16], b"fmt ");
        assert_eq!(u16::from_le_bytes([bytes[20], bytes[21]]), 1);
        assert_eq!(
            u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
            16_000
        );
        assert_eq!(&bytes[36..40], b"data");
        // data length consistent with file size, exactly.
        let data_len = u32::from_le_bytes([bytes[40], bytes[41], bytes[42], bytes[43]]);
        assert_eq!(bytes.len(), 44 + data_len as usize);
        assert_eq!(data_len, 320);
    }

    #[test]
    fn out_of_range_samples_clip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        write_pcm16_wav(&path, &[2.0, -3.0], 16_000, 1).unwrap();
        let audio = read_wav(&path).unwrap();
        assert!((audio.samples[0] - 1.0).abs() < 0.001);
        assert!((audio.samples[1] + 1.0).abs() < 0.001);
    }

    #[test]
    fn streaming_writer_counts_frames_and_finalizes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stream.wav");
        let mut writer = WavWriter::create(&path, 48_000, 2).unwrap();
        writer.write_samples(&[0.1; 96]).unwrap();
        writer.write_samples(&[0.2; 4]).unwrap();
        assert_eq!(writer.frames_written(), 50);
        assert!(!writer.is_finalized());

        writer.finalize().unwrap();
        assert!(writer.is_finalized());
        // Second finalize is a no-op.
        writer.finalize().unwrap();

        let audio = read_wav(&path).unwrap();
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.samples.len(), 100);
    }

    #[test]
    fn unfinalized_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crash.wav");
        let mut writer = WavWriter::create(&path, 48_000, 2).unwrap();
        writer.write_samples(&[0.1; 960]).unwrap();
        // Simulate a crash: drop without finalize. The buffered bytes may or
        // may not land, but the header sizes stay zero either way.
        drop(writer);

        assert!(matches!(read_wav(&path), Err(StoreError::Malformed(_))));
    }

    #[test]
    fn range_read_slices_frames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("range.wav");
        let samples: Vec<f32> = (0..1000).map(|i| (i as f32 / 1000.0) - 0.5).collect();
        write_pcm16_wav(&path, &samples, 16_000, 1).unwrap();

        let slice = read_wav_range(&path, 100, 50).unwrap();
        assert_eq!(slice.samples.len(), 50);
        assert!((slice.samples[0] - samples[100]).abs() < 0.001);

        // Past-the-end reads clamp instead of failing.
        let tail = read_wav_range(&path, 990, 100).unwrap();
        assert_eq!(tail.samples.len(), 10);
        assert_eq!(wav_frame_count(&path).unwrap(), 1000);
    }

    #[test]
    fn stereo_range_read_keeps_interleaving() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("st.wav");
        // Left channel rising, right channel falling.
        let mut samples = Vec::new();
        for i in 0..100 {
            samples.push(i as f32 / 200.0);
            samples.push(-(i as f32) / 200.0);
        }
        write_pcm16_wav(&path, &samples, 48_000, 2).unwrap();

        let slice = read_wav_range(&path, 10, 5).unwrap();
        assert_eq!(slice.samples.len(), 10);
        assert!(slice.samples[0] > 0.0);
        assert!(slice.samples[1] < 0.0);
    }
}
