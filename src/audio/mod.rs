//! WAV io, the PCM contract, and full-episode assembly.
//!
//! Per-chunk audio is stored as 24 kHz mono 16-bit WAV. Assembly validates
//! that contract on every input file, concatenates sample-accurately (no
//! cross-fades; the breathing pauses in the text are the only inter-chunk
//! silence), and delegates lossy encoding to the external codec.

use crate::error::AppError;
use crate::tts::PcmAudio;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

pub const CONTRACT_SAMPLE_RATE: u32 = 24_000;
pub const CONTRACT_CHANNELS: u16 = 1;
pub const CONTRACT_BITS: u16 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Wav,
    Mp3,
    Opus,
    Flac,
    Pcm,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Wav
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wav => write!(f, "wav"),
            Self::Mp3 => write!(f, "mp3"),
            Self::Opus => write!(f, "opus"),
            Self::Flac => write!(f, "flac"),
            Self::Pcm => write!(f, "pcm"),
        }
    }
}

impl From<String> for OutputFormat {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "mp3" | "mpeg" => Self::Mp3,
            "opus" => Self::Opus,
            "flac" => Self::Flac,
            "pcm" => Self::Pcm,
            _ => Self::Wav,
        }
    }
}

impl OutputFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Wav => "audio/wav",
            Self::Mp3 => "audio/mpeg",
            Self::Opus => "audio/opus",
            Self::Flac => "audio/flac",
            Self::Pcm => "audio/L16",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Opus => "opus",
            Self::Flac => "flac",
            Self::Pcm => "pcm",
        }
    }

}

// ── WAV io ─────────────────────────────────────────────────────────────────

pub fn write_wav(path: &Path, pcm: &PcmAudio) -> Result<(), AppError> {
    let spec = hound::WavSpec {
        channels: pcm.channels,
        sample_rate: pcm.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer =
        hound::WavWriter::create(path, spec).map_err(|e| AppError::Internal(e.to_string()))?;
    for sample in &pcm.samples {
        writer
            .write_sample(*sample)
            .map_err(|e| AppError::Internal(e.to_string()))?;
    }
    writer
        .finalize()
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(())
}

pub fn read_wav(path: &Path) -> Result<PcmAudio, AppError> {
    let reader = hound::WavReader::open(path)
        .map_err(|e| AppError::Internal(format!("could not read {path:?}: {e}")))?;
    let spec = reader.spec();
    if spec.bits_per_sample != CONTRACT_BITS || spec.sample_format != hound::SampleFormat::Int {
        return Err(AppError::AudioContractMismatch(format!(
            "{path:?} is {}-bit {:?}; expected {}-bit PCM",
            spec.bits_per_sample, spec.sample_format, CONTRACT_BITS
        )));
    }
    let samples = reader
        .into_samples::<i16>()
        .collect::<Result<Vec<i16>, _>>()
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(PcmAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Read a chunk file and insist on the synthesis contract.
pub fn read_wav_checked(path: &Path) -> Result<PcmAudio, AppError> {
    let pcm = read_wav(path)?;
    if pcm.sample_rate != CONTRACT_SAMPLE_RATE || pcm.channels != CONTRACT_CHANNELS {
        return Err(AppError::AudioContractMismatch(format!(
            "{path:?} is {} Hz {} channel(s); contract is {} Hz mono",
            pcm.sample_rate, pcm.channels, CONTRACT_SAMPLE_RATE
        )));
    }
    Ok(pcm)
}

pub fn wav_bytes(pcm: &PcmAudio) -> Result<Vec<u8>, AppError> {
    let spec = hound::WavSpec {
        channels: pcm.channels,
        sample_rate: pcm.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buffer = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut buffer), spec)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        for sample in &pcm.samples {
            writer
                .write_sample(*sample)
                .map_err(|e| AppError::Internal(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| AppError::Internal(e.to_string()))?;
    }
    Ok(buffer)
}

fn pcm_bytes(pcm: &PcmAudio) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(pcm.samples.len() * 2);
    for sample in &pcm.samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

// ── Codec delegation ───────────────────────────────────────────────────────

/// Encodes PCM into a target format. Lossless targets are handled natively;
/// lossy ones are delegated to the external codec executable.
pub struct Encoder {
    ffmpeg_command: String,
}

impl Encoder {
    pub fn new(ffmpeg_command: String) -> Self {
        Self { ffmpeg_command }
    }

    pub fn encode(&self, pcm: &PcmAudio, format: OutputFormat) -> Result<Vec<u8>, AppError> {
        match format {
            OutputFormat::Wav => wav_bytes(pcm),
            OutputFormat::Pcm => Ok(pcm_bytes(pcm)),
            OutputFormat::Mp3 | OutputFormat::Opus | OutputFormat::Flac => {
                self.encode_external(pcm, format)
            }
        }
    }

    fn encode_external(&self, pcm: &PcmAudio, format: OutputFormat) -> Result<Vec<u8>, AppError> {
        let workspace = tempfile::tempdir()?;
        let in_path = workspace.path().join("in.wav");
        let out_path = workspace.path().join(format!("out.{}", format.extension()));
        write_wav(&in_path, pcm)?;

        let codec_args: &[&str] = match format {
            OutputFormat::Mp3 => &["-f", "mp3"],
            OutputFormat::Opus => &["-c:a", "libopus", "-f", "ogg"],
            OutputFormat::Flac => &["-f", "flac"],
            _ => unreachable!(),
        };

        let output = Command::new(&self.ffmpeg_command)
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(&in_path)
            .args(codec_args)
            .arg(&out_path)
            .output()
            .map_err(|e| {
                AppError::Internal(format!("could not run {}: {e}", self.ffmpeg_command))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Internal(format!(
                "{} failed encoding {format}: {}",
                self.ffmpeg_command,
                stderr.trim()
            )));
        }
        Ok(std::fs::read(&out_path)?)
    }
}

// ── Full-episode assembly ──────────────────────────────────────────────────

/// Stitches per-chunk audio into a single contiguous artifact, cached on
/// disk beside the chunks. A per-episode advisory mutex prevents duplicate
/// concatenation on concurrent download requests.
pub struct Assembler {
    audio_root: PathBuf,
    encoder: Encoder,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Assembler {
    pub fn new(audio_root: PathBuf, encoder: Encoder) -> Self {
        Self {
            audio_root,
            encoder,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn episode_dir(&self, episode_id: &str) -> PathBuf {
        self.audio_root.join(episode_id)
    }

    pub fn full_artifact_path(&self, episode_id: &str, format: OutputFormat) -> PathBuf {
        self.episode_dir(episode_id)
            .join(format!("full.{}", format.extension()))
    }

    /// Produce (or reuse) the full-episode artifact from an ordered list of
    /// ready chunk files.
    pub fn assemble(
        &self,
        episode_id: &str,
        chunk_paths: &[PathBuf],
        format: OutputFormat,
    ) -> Result<PathBuf, AppError> {
        let lock = self.episode_lock(episode_id);
        let _guard = lock.lock().unwrap();

        let target = self.full_artifact_path(episode_id, format);
        if target.is_file() {
            return Ok(target);
        }

        let mut combined = PcmAudio {
            samples: Vec::new(),
            sample_rate: CONTRACT_SAMPLE_RATE,
            channels: CONTRACT_CHANNELS,
        };
        for path in chunk_paths {
            let pcm = read_wav_checked(path)?;
            combined.samples.extend_from_slice(&pcm.samples);
        }

        let encoded = self.encoder.encode(&combined, format)?;
        let staging = target.with_extension("tmp");
        std::fs::write(&staging, &encoded)?;
        std::fs::rename(&staging, &target)?;
        tracing::info!(
            "Assembled {} ({} chunks, {:.1}s)",
            target.display(),
            chunk_paths.len(),
            combined.duration_secs()
        );
        Ok(target)
    }

    /// Drop any cached full-episode artifacts. Called whenever a chunk
    /// transitions away from ready; failures are logged, not surfaced.
    pub fn invalidate(&self, episode_id: &str) {
        let dir = self.episode_dir(episode_id);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("full.") {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    tracing::warn!("Could not remove stale artifact {:?}: {}", entry.path(), e);
                }
            }
        }
    }

    fn episode_lock(&self, episode_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(episode_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tone(samples: usize, value: i16) -> PcmAudio {
        PcmAudio {
            samples: vec![value; samples],
            sample_rate: CONTRACT_SAMPLE_RATE,
            channels: CONTRACT_CHANNELS,
        }
    }

    #[test]
    fn wav_round_trip_preserves_samples() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.wav");
        let pcm = PcmAudio {
            samples: vec![0, 1, -1, i16::MAX, i16::MIN],
            sample_rate: CONTRACT_SAMPLE_RATE,
            channels: 1,
        };
        write_wav(&path, &pcm).unwrap();
        let back = read_wav(&path).unwrap();
        assert_eq!(back.samples, pcm.samples);
        assert_eq!(back.sample_rate, CONTRACT_SAMPLE_RATE);
    }

    #[test]
    fn contract_mismatch_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.wav");
        let pcm = PcmAudio {
            samples: vec![0; 100],
            sample_rate: 44_100,
            channels: 1,
        };
        write_wav(&path, &pcm).unwrap();
        assert!(matches!(
            read_wav_checked(&path),
            Err(AppError::AudioContractMismatch(_))
        ));
    }

    #[test]
    fn assembly_concatenates_sample_accurately() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("0.wav");
        let b = dir.path().join("1.wav");
        write_wav(&a, &tone(100, 7)).unwrap();
        write_wav(&b, &tone(50, -3)).unwrap();

        let assembler = Assembler::new(
            dir.path().to_path_buf(),
            Encoder::new("ffmpeg".to_string()),
        );
        std::fs::create_dir_all(assembler.episode_dir("ep")).unwrap();
        let full = assembler
            .assemble("ep", &[a, b], OutputFormat::Wav)
            .unwrap();

        let combined = read_wav(&full).unwrap();
        assert_eq!(combined.samples.len(), 150);
        assert_eq!(&combined.samples[..100], &[7i16; 100][..]);
        assert_eq!(&combined.samples[100..], &[-3i16; 50][..]);
    }

    #[test]
    fn invalidate_removes_cached_artifacts() {
        let dir = TempDir::new().unwrap();
        let assembler = Assembler::new(
            dir.path().to_path_buf(),
            Encoder::new("ffmpeg".to_string()),
        );
        let ep_dir = assembler.episode_dir("ep");
        std::fs::create_dir_all(&ep_dir).unwrap();
        let cached = ep_dir.join("full.wav");
        std::fs::write(&cached, b"stale").unwrap();
        assembler.invalidate("ep");
        assert!(!cached.exists());
    }

    #[test]
    fn pcm_encoding_is_little_endian_samples() {
        let encoder = Encoder::new("ffmpeg".to_string());
        let pcm = tone(2, 258);
        let bytes = encoder.encode(&pcm, OutputFormat::Pcm).unwrap();
        assert_eq!(bytes, vec![2, 1, 2, 1]);
    }
}
