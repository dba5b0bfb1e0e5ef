//! URL ingestion: bounded fetch with a content-type allow-list, followed by
//! readability-style extraction for HTML pages.

use super::{check_size, derive_title, IngestedDocument};
use crate::config::Config;
use crate::database::SourceType;
use crate::error::AppError;
use crate::text::normalizer;
use futures_util::StreamExt;
use std::time::Duration;

const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "text/html",
    "application/xhtml+xml",
    "text/plain",
    "text/markdown",
    "text/x-markdown",
];

pub async fn fetch(url: &str, config: &Config) -> Result<IngestedDocument, AppError> {
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(AppError::UnsupportedType(
            "only http(s) URLs can be imported".to_string(),
        ));
    }
    if url.len() > 2048 {
        return Err(AppError::FetchFailed("URL too long".to_string()));
    }

    tracing::info!("Fetching URL: {}", url);

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(config.fetch_timeout_secs))
        .redirect(reqwest::redirect::Policy::limited(5))
        .user_agent("lectern/0.4")
        .build()
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let response = client.get(url).send().await.map_err(map_reqwest_error)?;

    if !response.status().is_success() {
        return Err(AppError::FetchFailed(format!(
            "request returned status {}",
            response.status()
        )));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    let path_is_textual = {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        path.ends_with(".md") || path.ends_with(".txt") || path.ends_with(".markdown")
    };
    if !content_type.is_empty()
        && !ALLOWED_CONTENT_TYPES.contains(&content_type.as_str())
        && !path_is_textual
    {
        return Err(AppError::UnsupportedType(format!(
            "content type {content_type} is not readable text"
        )));
    }

    // Stream the body so the size cap holds before the whole payload lands
    // in memory.
    let mut body: Vec<u8> = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(piece) = stream.next().await {
        let piece = piece.map_err(map_reqwest_error)?;
        if body.len() + piece.len() > config.max_text_bytes {
            return Err(AppError::TooLarge(format!(
                "response exceeds the {} byte limit",
                config.max_text_bytes
            )));
        }
        body.extend_from_slice(&piece);
    }

    let text = String::from_utf8_lossy(&body).into_owned();
    let is_html = content_type.contains("html") || normalizer::looks_like_html(&text);

    let (raw_text, title) = if is_html {
        let title = normalizer::html_title(&text);
        let extracted = normalizer::strip_html(&text);
        if extracted.trim().is_empty() {
            return Err(AppError::FetchFailed(
                "could not extract readable text from page".to_string(),
            ));
        }
        let title = title.unwrap_or_else(|| derive_title(&extracted, url));
        (extracted, title)
    } else {
        let title = derive_title(&text, &title_from_url(url));
        (text, title)
    };

    check_size(raw_text.len(), config)?;
    if raw_text.trim().is_empty() {
        return Err(AppError::EmptyContent);
    }

    Ok(IngestedDocument {
        title,
        raw_text,
        source_type: SourceType::Url,
        original_filename: None,
        original_url: Some(url.to_string()),
    })
}

fn map_reqwest_error(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(format!("fetch timed out: {e}"))
    } else {
        AppError::FetchFailed(e.to_string())
    }
}

/// Last path segment of the URL, de-slugged, as a title fallback.
fn title_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segment = path.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    let segment = segment
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(segment);
    let name = segment.replace(['-', '_'], " ");
    if name.trim().is_empty() {
        "Imported Page".to_string()
    } else {
        super::truncate(name.trim(), 80)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_schemes() {
        let config = Config::from_env();
        let err = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(fetch("ftp://example.com/file.txt", &config));
        assert!(matches!(err, Err(AppError::UnsupportedType(_))));
    }

    #[test]
    fn url_title_fallback_desluggifies() {
        assert_eq!(
            title_from_url("https://blog.example.com/posts/why-rust-wins.html"),
            "why rust wins"
        );
        assert_eq!(title_from_url("https://example.com/"), "Imported Page");
    }
}
