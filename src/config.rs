use std::env;
use std::path::PathBuf;

/// Process-wide configuration, loaded once at startup from `LECTERN_*`
/// environment variables. Everything that is a user preference rather than a
/// deployment concern (default voice, chunk strategy, cleaning flags) lives
/// in the persisted settings table instead.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of all persisted state: `library.db`, `sources/`, `audio/`.
    /// Copying this directory while the service is stopped is a backup.
    pub data_dir: PathBuf,
    /// Optional directory of custom voice files.
    pub voices_dir: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// External TTS executable (piper-style: text on stdin, WAV out).
    pub tts_command: String,
    /// External codec executable for lossy output formats.
    pub ffmpeg_command: String,
    /// Grace period for undoing regenerate-with-settings, in seconds.
    pub undo_window_secs: u64,
    /// Upper bound on ingested text, in bytes.
    pub max_text_bytes: usize,
    /// Wall-clock timeout for URL fetches, in seconds.
    pub fetch_timeout_secs: u64,
    /// Wall-clock timeout for git clones, in seconds.
    pub git_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            data_dir: PathBuf::from(env_or("LECTERN_DATA_DIR", "./data")),
            voices_dir: env::var("LECTERN_VOICES_DIR").ok().map(PathBuf::from),
            host: env_or("LECTERN_HOST", "127.0.0.1"),
            port: parse_or("LECTERN_PORT", 8787),
            log_level: env_or("LECTERN_LOG_LEVEL", "info"),
            tts_command: env_or("LECTERN_TTS_COMMAND", "piper"),
            ffmpeg_command: env_or("LECTERN_FFMPEG_COMMAND", "ffmpeg"),
            undo_window_secs: parse_or("LECTERN_UNDO_WINDOW_SECS", 120),
            max_text_bytes: parse_or("LECTERN_MAX_TEXT_BYTES", 512 * 1024),
            fetch_timeout_secs: parse_or("LECTERN_FETCH_TIMEOUT_SECS", 30),
            git_timeout_secs: parse_or("LECTERN_GIT_TIMEOUT_SECS", 120),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("library.db")
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.data_dir.join("sources")
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.data_dir.join("audio")
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
