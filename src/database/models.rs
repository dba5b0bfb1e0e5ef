use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Pending,
    Generating,
    Ready,
    Error,
    Cancelled,
}

impl Default for EpisodeStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Generating => write!(f, "generating"),
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<String> for EpisodeStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => Self::Pending,
            "generating" => Self::Generating,
            "ready" => Self::Ready,
            "error" => Self::Error,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Generating,
    Ready,
    Error,
}

impl Default for ChunkStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Generating => write!(f, "generating"),
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl From<String> for ChunkStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => Self::Pending,
            "generating" => Self::Generating,
            "ready" => Self::Ready,
            "error" => Self::Error,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Text,
    File,
    Url,
    Git,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::File => write!(f, "file"),
            Self::Url => write!(f, "url"),
            Self::Git => write!(f, "git"),
        }
    }
}

impl From<String> for SourceType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "file" => Self::File,
            "url" => Self::Url,
            "git" => Self::Git,
            _ => Self::Text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub title: String,
    pub source_type: SourceType,
    pub original_filename: Option<String>,
    pub original_url: Option<String>,
    pub raw_text: String,
    pub cleaned_text: String,
    /// JSON snapshot of the CleaningOptions used to produce cleaned_text.
    pub cleaning_settings: String,
    pub cover_art: Option<String>,
    pub folder_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Listing row for sources: the full texts are omitted, only their size is
/// reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSummary {
    pub id: String,
    pub title: String,
    pub source_type: SourceType,
    pub original_url: Option<String>,
    pub folder_id: Option<String>,
    pub text_length: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub source_id: String,
    pub title: String,
    pub voice_id: String,
    pub output_format: String,
    pub chunk_strategy: String,
    pub chunk_max_chars: i64,
    pub breathing_intensity: String,
    pub status: EpisodeStatus,
    pub total_duration_secs: Option<f64>,
    pub error_message: Option<String>,
    pub folder_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub last_played_at: Option<String>,
    // Joined from playback_state when present:
    pub percent_listened: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub episode_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub label: String,
    pub status: ChunkStatus,
    pub duration_secs: Option<f64>,
    pub audio_path: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub sort_order: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackState {
    pub episode_id: String,
    pub current_chunk_index: i64,
    pub position_secs: f64,
    pub percent_listened: f64,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UndoTicket {
    pub id: String,
    pub episode_id: String,
    pub operation_kind: String,
    /// JSON blob sufficient to restore the pre-operation state.
    pub inverse_payload: String,
    pub backup_audio_dir: Option<String>,
    pub created_at: String,
    pub expires_at: String,
}

/// Aggregate chunk-status counts for one episode, used to derive the
/// episode's terminal state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkTally {
    pub pending: i64,
    pub generating: i64,
    pub ready: i64,
    pub error: i64,
}

impl ChunkTally {
    pub fn total(&self) -> i64 {
        self.pending + self.generating + self.ready + self.error
    }
}

/// Per-status episode counts for the generation status endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EpisodeStatusCounts {
    pub pending: i64,
    pub generating: i64,
    pub ready: i64,
    pub error: i64,
    pub cancelled: i64,
}
