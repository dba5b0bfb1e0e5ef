//! Git repository ingestion: shallow clone into a temporary workspace,
//! then concatenate its markdown/text files in a stable depth-first,
//! lexicographic order.

use super::{check_size, clean_title, truncate, IngestedDocument, ALLOWED_EXTENSIONS};
use crate::config::Config;
use crate::database::SourceType;
use crate::error::AppError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

#[derive(Debug, Clone, Serialize)]
pub struct GitPreviewFile {
    pub path: String,
    pub chars: usize,
}

/// What a repository would import, without persisting anything.
#[derive(Debug, Clone, Serialize)]
pub struct GitPreview {
    pub files: Vec<GitPreviewFile>,
    pub total_files: usize,
    pub total_chars: usize,
    pub suggested_title: String,
    pub preview_text: String,
}

pub async fn clone_and_collect(
    url: &str,
    subpath: Option<&str>,
    config: &Config,
) -> Result<IngestedDocument, AppError> {
    let files = collect_repo_files(url, subpath, config).await?;
    if files.is_empty() {
        return Err(AppError::EmptyContent);
    }

    let total: usize = files.iter().map(|f| f.content.len()).sum();
    if total > config.max_text_bytes {
        return Err(AppError::TooLarge(format!(
            "repository text is {total} bytes; limit is {}. Try a subdirectory.",
            config.max_text_bytes
        )));
    }

    let mut parts = Vec::new();
    for file in &files {
        parts.push(format!("\n\n---\n\n## File: {}\n\n", file.path));
        parts.push(file.content.clone());
    }
    let raw_text = parts.concat().trim().to_string();
    check_size(raw_text.len(), config)?;

    Ok(IngestedDocument {
        title: repo_title(url, &files),
        raw_text,
        source_type: SourceType::Git,
        original_filename: None,
        original_url: Some(url.to_string()),
    })
}

/// Preview the repository's text files without importing.
pub async fn preview(
    url: &str,
    subpath: Option<&str>,
    config: &Config,
) -> Result<GitPreview, AppError> {
    let files = collect_repo_files(url, subpath, config).await?;
    let total_chars: usize = files.iter().map(|f| f.content.chars().count()).sum();

    let mut preview_text = files
        .first()
        .map(|f| truncate(&f.content, 2000))
        .unwrap_or_default();
    if files.len() > 1 {
        preview_text.push_str(&format!("\n\n... and {} more files", files.len() - 1));
    }

    Ok(GitPreview {
        suggested_title: repo_title(url, &files),
        total_files: files.len(),
        total_chars,
        files: files
            .into_iter()
            .map(|f| GitPreviewFile {
                chars: f.content.chars().count(),
                path: f.path,
            })
            .collect(),
        preview_text,
    })
}

struct RepoFile {
    path: String,
    content: String,
}

async fn collect_repo_files(
    url: &str,
    subpath: Option<&str>,
    config: &Config,
) -> Result<Vec<RepoFile>, AppError> {
    if !(url.starts_with("https://") || url.starts_with("http://") || url.starts_with("git://")) {
        return Err(AppError::UnsupportedType(
            "git import takes an http(s) or git clone URL".to_string(),
        ));
    }

    let workspace = tempfile::tempdir()?;
    let checkout = workspace.path().join("repo");

    tracing::info!("Cloning repository: {}", url);
    let clone = tokio::process::Command::new("git")
        .args(["clone", "--depth", "1", "--quiet", url])
        .arg(&checkout)
        .output();
    let output = tokio::time::timeout(Duration::from_secs(config.git_timeout_secs), clone)
        .await
        .map_err(|_| {
            AppError::Timeout(format!(
                "git clone exceeded {} seconds",
                config.git_timeout_secs
            ))
        })?
        .map_err(|e| AppError::FetchFailed(format!("could not run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::FetchFailed(format!(
            "git clone failed: {}",
            stderr.trim()
        )));
    }

    let root = match subpath {
        Some(subpath) => checkout.join(sanitize_subpath(subpath)?),
        None => checkout.clone(),
    };
    if !root.is_dir() {
        return Err(AppError::NotFound(format!(
            "subpath {:?} does not exist in the repository",
            subpath.unwrap_or("")
        )));
    }

    // Depth-first, lexicographic traversal keeps the concatenation order
    // stable across imports.
    let mut files = Vec::new();
    let walker = WalkDir::new(&root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e.path()));
    for entry in walker {
        let entry = entry.map_err(|e| AppError::Internal(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let extension = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            continue;
        }
        let bytes = std::fs::read(entry.path())?;
        let relative = entry
            .path()
            .strip_prefix(&checkout)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        files.push(RepoFile {
            path: relative,
            content: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    Ok(files)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// A subpath must stay inside the checkout.
fn sanitize_subpath(subpath: &str) -> Result<PathBuf, AppError> {
    let path = Path::new(subpath);
    if path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    }) {
        return Err(AppError::UnsupportedType(
            "subpath must be relative to the repository root".to_string(),
        ));
    }
    Ok(path.to_path_buf())
}

static RE_MD_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#\s+(.+)$").unwrap());

/// Prefer the first README heading; fall back to the repository name.
fn repo_title(url: &str, files: &[RepoFile]) -> String {
    for file in files {
        if file.path.to_ascii_lowercase().ends_with("readme.md") {
            if let Some(caps) = RE_MD_HEADING.captures(&file.content) {
                let cleaned = clean_title(&truncate(caps[1].trim(), 100));
                if !cleaned.is_empty() {
                    return cleaned;
                }
            }
        }
    }
    let name = url
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .rsplit('/')
        .next()
        .unwrap_or("Repository");
    let name = name.replace(['-', '_'], " ");
    if name.trim().is_empty() {
        "Repository".to_string()
    } else {
        truncate(name.trim(), 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subpaths_cannot_escape_the_checkout() {
        assert!(sanitize_subpath("docs/guide").is_ok());
        assert!(sanitize_subpath("../outside").is_err());
        assert!(sanitize_subpath("/etc").is_err());
    }

    #[test]
    fn repo_title_prefers_readme_heading() {
        let files = vec![RepoFile {
            path: "README.md".to_string(),
            content: "# Great Project\n\nIntro.".to_string(),
        }];
        assert_eq!(repo_title("https://example.com/me/repo.git", &files), "Great Project");
        assert_eq!(
            repo_title("https://example.com/me/some-tool.git", &[]),
            "some tool"
        );
    }
}
