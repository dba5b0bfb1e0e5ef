use thiserror::Error;

/// Typed application error hierarchy shared by the library service, the
/// worker, and the HTTP surface.
///
/// Every variant maps to one stable `error_kind` string so clients always
/// receive a `{error_kind, message}` body instead of a stack trace.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Text produced no chunks")]
    EmptyContent,

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Too large: {0}")]
    TooLarge(String),

    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    #[error("Synthesis failed: {0}")]
    SynthesisFailed(String),

    #[error("Audio contract mismatch: {0}")]
    AudioContractMismatch(String),

    #[error("Undo window expired")]
    UndoExpired,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable kind, used in API bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::InvalidState(_) => "invalid_state",
            AppError::EmptyContent => "empty_content",
            AppError::FetchFailed(_) => "fetch_failed",
            AppError::Timeout(_) => "timeout",
            AppError::TooLarge(_) => "too_large",
            AppError::UnsupportedType(_) => "unsupported_type",
            AppError::SynthesisFailed(_) => "synthesis_failed",
            AppError::AudioContractMismatch(_) => "audio_contract_mismatch",
            AppError::UndoExpired => "undo_expired",
            AppError::Internal(_) => "internal",
        }
    }
}

/// Serialize as the `{error_kind, message}` structure clients expect.
impl serde::Serialize for AppError {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut body = s.serialize_struct("AppError", 2)?;
        body.serialize_field("error_kind", self.kind())?;
        body.serialize_field("message", &self.to_string())?;
        body.end()
    }
}

// ── From impls ─────────────────────────────────────────────────────────────

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Internal(e.to_string())
    }
}
