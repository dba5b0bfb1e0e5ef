//! Content ingestion: raw text, file uploads, URLs, and git repositories.
//!
//! Every variant produces the same `IngestedDocument`; nothing is persisted
//! here, so a failed ingestion leaves no artifact behind.

pub mod git;
pub mod url;

use crate::config::Config;
use crate::database::SourceType;
use crate::error::AppError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

/// Extensions accepted for file uploads and git-repo traversal.
pub const ALLOWED_EXTENSIONS: &[&str] = &["md", "txt", "markdown", "mdx"];

/// An ingestion request, dispatched on its variant.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestInput {
    Text {
        text: String,
        title: Option<String>,
    },
    File {
        filename: String,
        content: String,
    },
    Url {
        url: String,
    },
    Git {
        url: String,
        subpath: Option<String>,
    },
}

/// Raw content plus metadata, ready for normalization and persistence.
#[derive(Debug, Clone)]
pub struct IngestedDocument {
    pub title: String,
    pub raw_text: String,
    pub source_type: SourceType,
    pub original_filename: Option<String>,
    pub original_url: Option<String>,
}

pub async fn run(input: IngestInput, config: &Config) -> Result<IngestedDocument, AppError> {
    match input {
        IngestInput::Text { text, title } => ingest_text(text, title, config),
        IngestInput::File { filename, content } => ingest_file(filename, content, config),
        IngestInput::Url { url } => url::fetch(&url, config).await,
        IngestInput::Git { url, subpath } => git::clone_and_collect(&url, subpath.as_deref(), config).await,
    }
}

fn ingest_text(
    text: String,
    title: Option<String>,
    config: &Config,
) -> Result<IngestedDocument, AppError> {
    if text.trim().is_empty() {
        return Err(AppError::EmptyContent);
    }
    check_size(text.len(), config)?;
    let title = title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| derive_title(&text, "Pasted Text"));
    Ok(IngestedDocument {
        title,
        raw_text: text,
        source_type: SourceType::Text,
        original_filename: None,
        original_url: None,
    })
}

fn ingest_file(
    filename: String,
    content: String,
    config: &Config,
) -> Result<IngestedDocument, AppError> {
    let extension = std::path::Path::new(&filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(AppError::UnsupportedType(format!(
            "file type .{extension} not supported; allowed: .md .txt .markdown .mdx"
        )));
    }
    check_size(content.len(), config)?;
    if content.trim().is_empty() {
        return Err(AppError::EmptyContent);
    }
    // The uploaded filename is the title; content-derived titles are for
    // pasted text only.
    let title = std::path::Path::new(&filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| filename.clone());
    Ok(IngestedDocument {
        title,
        raw_text: content,
        source_type: SourceType::File,
        original_filename: Some(filename),
        original_url: None,
    })
}

pub(crate) fn check_size(bytes: usize, config: &Config) -> Result<(), AppError> {
    if bytes > config.max_text_bytes {
        return Err(AppError::TooLarge(format!(
            "{bytes} bytes exceeds the {} byte limit",
            config.max_text_bytes
        )));
    }
    Ok(())
}

static RE_TITLE_JUNK: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[^\w\s\-.,!?'"]+"#).unwrap());
static RE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Derive a title from the first heading or non-empty line, truncated and
/// cleaned; fall back to the given name's stem.
pub(crate) fn derive_title(text: &str, fallback: &str) -> String {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // Horizontal rules are decoration, not titles.
        if line.chars().all(|c| matches!(c, '-' | '*' | '_')) {
            continue;
        }
        let candidate = line.trim_start_matches('#').trim();
        let cleaned = clean_title(&truncate(candidate, 80));
        if !cleaned.is_empty() {
            return cleaned;
        }
    }
    std::path::Path::new(fallback)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "Untitled".to_string())
}

pub(crate) fn clean_title(title: &str) -> String {
    let title = RE_TITLE_JUNK.replace_all(title, " ");
    let title = RE_SPACES.replace_all(&title, " ");
    title.trim().trim_matches(['-', '.', ' ']).to_string()
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::from_env();
        config.max_text_bytes = 1024;
        config
    }

    #[test]
    fn text_ingestion_derives_title_from_first_line() {
        let doc = ingest_text("# My Notes\n\nBody here.".into(), None, &test_config()).unwrap();
        assert_eq!(doc.title, "My Notes");
        assert_eq!(doc.source_type, SourceType::Text);
    }

    #[test]
    fn explicit_title_wins() {
        let doc =
            ingest_text("body".into(), Some("Given".into()), &test_config()).unwrap();
        assert_eq!(doc.title, "Given");
    }

    #[test]
    fn empty_text_is_rejected() {
        assert!(matches!(
            ingest_text("   ".into(), None, &test_config()),
            Err(AppError::EmptyContent)
        ));
    }

    #[test]
    fn oversized_text_is_rejected() {
        let big = "a".repeat(2048);
        assert!(matches!(
            ingest_text(big, None, &test_config()),
            Err(AppError::TooLarge(_))
        ));
    }

    #[test]
    fn file_extension_allow_list() {
        let err = ingest_file("evil.exe".into(), "hi".into(), &test_config());
        assert!(matches!(err, Err(AppError::UnsupportedType(_))));

        let ok = ingest_file("notes.md".into(), "# Hi\nbody".into(), &test_config()).unwrap();
        assert_eq!(ok.original_filename.as_deref(), Some("notes.md"));
        assert_eq!(ok.title, "notes");
        assert_eq!(ok.source_type, SourceType::File);
    }

    #[test]
    fn title_skips_rules_and_decoration() {
        assert_eq!(derive_title("---\n\n# Real Title\n", "x.md"), "Real Title");
        assert_eq!(derive_title("", "fallback.txt"), "fallback");
    }
}
