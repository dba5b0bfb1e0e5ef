//! The TTS collaborator boundary.
//!
//! The model itself is a black box behind `Synthesizer`; nothing about its
//! internals leaks into the worker. The default implementation drives an
//! external piper-style executable: text on stdin, a WAV file out.

use crate::error::AppError;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Voice names resolved by the engine itself, without a voice file.
pub const BUILTIN_VOICES: &[&str] = &[
    "alba", "marius", "javert", "jean", "fantine", "cosette", "eponine", "azelma",
];

/// File extensions recognized as custom voices in the voices directory.
const VOICE_EXTENSIONS: &[&str] = &["wav", "mp3", "flac", "safetensors", "onnx"];

/// Raw synthesized audio.
#[derive(Debug, Clone)]
pub struct PcmAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmAudio {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.channels as f64 / self.sample_rate as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceKind {
    Builtin,
    Custom,
}

#[derive(Debug, Clone, Serialize)]
pub struct Voice {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: VoiceKind,
}

/// Narrow interface to the speech model. Synthesis blocks and may take
/// seconds; callers must not hold any database lock across it.
pub trait Synthesizer: Send + Sync {
    fn synthesize(&self, text: &str, voice_id: &str) -> Result<PcmAudio, AppError>;
    fn voices(&self) -> Vec<Voice>;
}

/// Synthesizer backed by an external CLI (piper-compatible): the chunk text
/// is written to stdin and the engine writes a WAV file we read back.
pub struct CommandSynthesizer {
    command: String,
    voices_dir: Option<PathBuf>,
}

impl CommandSynthesizer {
    pub fn new(command: String, voices_dir: Option<PathBuf>) -> Self {
        Self {
            command,
            voices_dir,
        }
    }

    fn voice_argument(&self, voice_id: &str) -> String {
        if let Some(dir) = &self.voices_dir {
            for extension in VOICE_EXTENSIONS {
                let candidate = dir.join(format!("{voice_id}.{extension}"));
                if candidate.is_file() {
                    return candidate.to_string_lossy().into_owned();
                }
            }
        }
        voice_id.to_string()
    }
}

impl Synthesizer for CommandSynthesizer {
    fn synthesize(&self, text: &str, voice_id: &str) -> Result<PcmAudio, AppError> {
        let workspace =
            tempfile::tempdir().map_err(|e| AppError::SynthesisFailed(e.to_string()))?;
        let out_path = workspace.path().join("out.wav");

        let mut child = Command::new(&self.command)
            .args(["--voice", &self.voice_argument(voice_id)])
            .arg("--output_file")
            .arg(&out_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                AppError::SynthesisFailed(format!("could not start {}: {e}", self.command))
            })?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(text.as_bytes())
                .map_err(|e| AppError::SynthesisFailed(e.to_string()))?;
        }
        drop(child.stdin.take());

        let output = child
            .wait_with_output()
            .map_err(|e| AppError::SynthesisFailed(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::SynthesisFailed(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        let reader = hound::WavReader::open(&out_path)
            .map_err(|e| AppError::SynthesisFailed(format!("engine produced no audio: {e}")))?;
        let spec = reader.spec();
        let samples = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<i16>, _>>()
            .map_err(|e| AppError::SynthesisFailed(e.to_string()))?;

        Ok(PcmAudio {
            samples,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        })
    }

    fn voices(&self) -> Vec<Voice> {
        let mut voices: Vec<Voice> = BUILTIN_VOICES
            .iter()
            .map(|id| Voice {
                id: id.to_string(),
                name: capitalize(id),
                kind: VoiceKind::Builtin,
            })
            .collect();

        if let Some(dir) = &self.voices_dir {
            let mut custom = Vec::new();
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let extension = path
                        .extension()
                        .and_then(|e| e.to_str())
                        .map(str::to_ascii_lowercase)
                        .unwrap_or_default();
                    if !VOICE_EXTENSIONS.contains(&extension.as_str()) {
                        continue;
                    }
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        custom.push(Voice {
                            id: stem.to_string(),
                            name: stem.replace(['-', '_'], " "),
                            kind: VoiceKind::Custom,
                        });
                    }
                }
            }
            custom.sort_by(|a, b| a.id.cmp(&b.id));
            voices.extend(custom);
        }

        voices
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_accounts_for_rate_and_channels() {
        let pcm = PcmAudio {
            samples: vec![0; 48_000],
            sample_rate: 24_000,
            channels: 1,
        };
        assert!((pcm.duration_secs() - 2.0).abs() < f64::EPSILON);

        let stereo = PcmAudio {
            samples: vec![0; 48_000],
            sample_rate: 24_000,
            channels: 2,
        };
        assert!((stereo.duration_secs() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn builtin_voices_are_listed() {
        let synth = CommandSynthesizer::new("piper".to_string(), None);
        let voices = synth.voices();
        assert!(voices.iter().any(|v| v.id == "alba" && v.kind == VoiceKind::Builtin));
    }
}
