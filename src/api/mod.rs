//! Thin HTTP surface over the library service. Handlers stay small: parse,
//! delegate, serialize. Audio endpoints honor single-range `Range` requests
//! so players can seek.

use crate::error::AppError;
use crate::ingest::{git, IngestInput};
use crate::library::{CreateEpisodeRequest, Library, RegenerateSettings};
use crate::text::CleaningOptions;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

type Lib = State<Arc<Library>>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidState(_) => StatusCode::CONFLICT,
            AppError::EmptyContent => StatusCode::BAD_REQUEST,
            AppError::FetchFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::UnsupportedType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::UndoExpired => StatusCode::GONE,
            AppError::SynthesisFailed(_)
            | AppError::AudioContractMismatch(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            let correlation = uuid::Uuid::new_v4();
            tracing::error!("[{}] {}", correlation, self);
            return (
                status,
                Json(json!({
                    "error_kind": "internal",
                    "message": format!("internal error (correlation {correlation})"),
                })),
            )
                .into_response();
        }
        (status, Json(self)).into_response()
    }
}

pub fn router(library: Arc<Library>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/ingest", post(ingest))
        .route("/api/sources", get(list_sources))
        .route(
            "/api/sources/:id",
            get(get_source).put(update_source).delete(delete_source),
        )
        .route("/api/sources/:id/clean", post(re_clean_source))
        .route("/api/sources/:id/move", put(move_source))
        .route("/api/sources/:id/tags", post(set_source_tags))
        .route("/api/sources/:id/cover", post(set_cover_art))
        .route("/api/preview/clean", post(preview_clean))
        .route("/api/preview/chunks", post(preview_chunks))
        .route("/api/preview/git", post(preview_git))
        .route("/api/episodes", get(list_episodes).post(create_episode))
        .route(
            "/api/episodes/bulk-move",
            post(bulk_move),
        )
        .route("/api/episodes/bulk-delete", post(bulk_delete))
        .route(
            "/api/episodes/:id",
            get(get_episode).put(update_episode).delete(delete_episode),
        )
        .route("/api/episodes/:id/regenerate", post(regenerate_episode))
        .route(
            "/api/episodes/:id/regenerate-with-settings",
            post(regenerate_with_settings),
        )
        .route(
            "/api/episodes/:id/chunks/:index/regenerate",
            post(regenerate_chunk),
        )
        .route("/api/episodes/:id/cancel", post(cancel_episode))
        .route("/api/episodes/:id/retry-errors", post(retry_errors))
        .route("/api/episodes/:id/move", put(move_episode))
        .route("/api/episodes/:id/tags", post(set_episode_tags))
        .route("/api/episodes/:id/audio/full", get(full_episode_audio))
        .route("/api/episodes/:id/audio/:index", get(chunk_audio))
        .route("/api/undo/:id", post(undo))
        .route("/api/playback/:id", get(get_playback).post(save_playback))
        .route("/api/library/tree", get(library_tree))
        .route("/api/folders", post(create_folder))
        .route(
            "/api/folders/:id",
            put(update_folder).delete(delete_folder),
        )
        .route("/api/folders/:id/playlist", get(folder_playlist))
        .route("/api/tags", get(list_tags).post(create_tag))
        .route("/api/tags/:id", axum::routing::delete(delete_tag))
        .route("/api/settings", get(get_settings).put(update_settings))
        .route("/api/generation/status", get(generation_status))
        .route("/api/voices", get(list_voices))
        .with_state(library)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

// ── Sources ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct IngestBody {
    #[serde(flatten)]
    input: IngestInput,
    cleaning: Option<CleaningOptions>,
}

async fn ingest(State(library): Lib, Json(body): Json<IngestBody>) -> Result<Response, AppError> {
    let source = library.ingest(body.input, body.cleaning).await?;
    Ok((StatusCode::CREATED, Json(source)).into_response())
}

#[derive(Deserialize)]
struct SourceFilter {
    folder_id: Option<String>,
    tag: Option<String>,
}

async fn list_sources(
    State(library): Lib,
    Query(filter): Query<SourceFilter>,
) -> Result<Response, AppError> {
    let sources = library.list_sources(filter.folder_id.as_deref(), filter.tag.as_deref())?;
    Ok(Json(sources).into_response())
}

async fn get_source(State(library): Lib, Path(id): Path<String>) -> Result<Response, AppError> {
    Ok(Json(library.get_source(&id)?).into_response())
}

#[derive(Deserialize)]
struct UpdateSourceBody {
    title: String,
}

async fn update_source(
    State(library): Lib,
    Path(id): Path<String>,
    Json(body): Json<UpdateSourceBody>,
) -> Result<Response, AppError> {
    library.update_source_title(&id, &body.title)?;
    Ok(ok_body())
}

#[derive(Deserialize)]
struct CleanBody {
    cleaning: Option<CleaningOptions>,
}

async fn re_clean_source(
    State(library): Lib,
    Path(id): Path<String>,
    Json(body): Json<CleanBody>,
) -> Result<Response, AppError> {
    Ok(Json(library.re_clean_source(&id, body.cleaning)?).into_response())
}

#[derive(Deserialize)]
struct MoveBody {
    folder_id: Option<String>,
}

async fn move_source(
    State(library): Lib,
    Path(id): Path<String>,
    Json(body): Json<MoveBody>,
) -> Result<Response, AppError> {
    library.move_source(&id, body.folder_id.as_deref())?;
    Ok(ok_body())
}

async fn delete_source(State(library): Lib, Path(id): Path<String>) -> Result<Response, AppError> {
    library.delete_source(&id)?;
    Ok(ok_body())
}

#[derive(Deserialize)]
struct CoverQuery {
    #[serde(default = "default_cover_ext")]
    ext: String,
}

fn default_cover_ext() -> String {
    "png".to_string()
}

async fn set_cover_art(
    State(library): Lib,
    Path(id): Path<String>,
    Query(query): Query<CoverQuery>,
    body: axum::body::Bytes,
) -> Result<Response, AppError> {
    let path = library.set_cover_art(&id, &body, &query.ext)?;
    Ok(Json(json!({ "cover_art": path })).into_response())
}

// ── Previews ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PreviewCleanBody {
    text: String,
    cleaning: Option<CleaningOptions>,
}

async fn preview_clean(
    State(library): Lib,
    Json(body): Json<PreviewCleanBody>,
) -> Result<Response, AppError> {
    let cleaned = library.preview_clean(&body.text, body.cleaning)?;
    Ok(Json(json!({ "cleaned_text": cleaned })).into_response())
}

#[derive(Deserialize)]
struct PreviewChunksBody {
    text: String,
    strategy: Option<String>,
    max_chars: Option<i64>,
}

async fn preview_chunks(
    State(library): Lib,
    Json(body): Json<PreviewChunksBody>,
) -> Result<Response, AppError> {
    let chunks = library.preview_chunks(&body.text, body.strategy, body.max_chars)?;
    Ok(Json(json!({ "count": chunks.len(), "chunks": chunks })).into_response())
}

#[derive(Deserialize)]
struct PreviewGitBody {
    url: String,
    subpath: Option<String>,
}

async fn preview_git(
    State(library): Lib,
    Json(body): Json<PreviewGitBody>,
) -> Result<Response, AppError> {
    let preview = git::preview(&body.url, body.subpath.as_deref(), library.config()).await?;
    Ok(Json(preview).into_response())
}

// ── Episodes ───────────────────────────────────────────────────────────────

async fn create_episode(
    State(library): Lib,
    Json(body): Json<CreateEpisodeRequest>,
) -> Result<Response, AppError> {
    let created = library.create_episode(body)?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

#[derive(Deserialize)]
struct EpisodeFilter {
    source_id: Option<String>,
    folder_id: Option<String>,
}

async fn list_episodes(
    State(library): Lib,
    Query(filter): Query<EpisodeFilter>,
) -> Result<Response, AppError> {
    let episodes =
        library.list_episodes(filter.source_id.as_deref(), filter.folder_id.as_deref())?;
    Ok(Json(episodes).into_response())
}

async fn get_episode(State(library): Lib, Path(id): Path<String>) -> Result<Response, AppError> {
    let (episode, chunks) = library.get_episode(&id)?;
    let mut body = serde_json::to_value(&episode)?;
    body["chunks"] = serde_json::to_value(&chunks)?;
    Ok(Json(body).into_response())
}

#[derive(Deserialize)]
struct UpdateEpisodeBody {
    title: String,
}

async fn update_episode(
    State(library): Lib,
    Path(id): Path<String>,
    Json(body): Json<UpdateEpisodeBody>,
) -> Result<Response, AppError> {
    library.update_episode_title(&id, &body.title)?;
    Ok(ok_body())
}

async fn delete_episode(State(library): Lib, Path(id): Path<String>) -> Result<Response, AppError> {
    library.delete_episode(&id)?;
    Ok(ok_body())
}

async fn regenerate_episode(
    State(library): Lib,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    library.regenerate_episode(&id)?;
    Ok(Json(json!({ "ok": true, "status": "pending" })).into_response())
}

async fn regenerate_with_settings(
    State(library): Lib,
    Path(id): Path<String>,
    Json(body): Json<RegenerateSettings>,
) -> Result<Response, AppError> {
    let undo_id = library.regenerate_with_settings(&id, body)?;
    Ok(Json(json!({ "ok": true, "undo_id": undo_id })).into_response())
}

async fn regenerate_chunk(
    State(library): Lib,
    Path((id, index)): Path<(String, i64)>,
) -> Result<Response, AppError> {
    library.regenerate_chunk(&id, index)?;
    Ok(ok_body())
}

async fn cancel_episode(State(library): Lib, Path(id): Path<String>) -> Result<Response, AppError> {
    library.cancel_episode(&id)?;
    Ok(ok_body())
}

async fn retry_errors(State(library): Lib, Path(id): Path<String>) -> Result<Response, AppError> {
    let retried = library.retry_errors(&id)?;
    Ok(Json(json!({ "ok": true, "retried": retried })).into_response())
}

async fn move_episode(
    State(library): Lib,
    Path(id): Path<String>,
    Json(body): Json<MoveBody>,
) -> Result<Response, AppError> {
    library.move_episode(&id, body.folder_id.as_deref())?;
    Ok(ok_body())
}

#[derive(Deserialize)]
struct BulkMoveBody {
    episode_ids: Vec<String>,
    folder_id: Option<String>,
}

async fn bulk_move(
    State(library): Lib,
    Json(body): Json<BulkMoveBody>,
) -> Result<Response, AppError> {
    library.bulk_move(&body.episode_ids, body.folder_id.as_deref())?;
    Ok(Json(json!({ "ok": true, "moved": body.episode_ids.len() })).into_response())
}

#[derive(Deserialize)]
struct BulkDeleteBody {
    episode_ids: Vec<String>,
}

async fn bulk_delete(
    State(library): Lib,
    Json(body): Json<BulkDeleteBody>,
) -> Result<Response, AppError> {
    library.bulk_delete(&body.episode_ids)?;
    Ok(Json(json!({ "ok": true, "deleted": body.episode_ids.len() })).into_response())
}

async fn undo(State(library): Lib, Path(id): Path<String>) -> Result<Response, AppError> {
    library.undo(&id)?;
    Ok(ok_body())
}

// ── Tags ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TagIdsBody {
    tag_ids: Vec<String>,
}

async fn set_source_tags(
    State(library): Lib,
    Path(id): Path<String>,
    Json(body): Json<TagIdsBody>,
) -> Result<Response, AppError> {
    library.set_source_tags(&id, &body.tag_ids)?;
    Ok(ok_body())
}

async fn set_episode_tags(
    State(library): Lib,
    Path(id): Path<String>,
    Json(body): Json<TagIdsBody>,
) -> Result<Response, AppError> {
    library.set_episode_tags(&id, &body.tag_ids)?;
    Ok(ok_body())
}

async fn list_tags(State(library): Lib) -> Result<Response, AppError> {
    Ok(Json(library.list_tags()?).into_response())
}

#[derive(Deserialize)]
struct CreateTagBody {
    name: String,
}

async fn create_tag(
    State(library): Lib,
    Json(body): Json<CreateTagBody>,
) -> Result<Response, AppError> {
    let tag = library.create_tag(&body.name)?;
    Ok((StatusCode::CREATED, Json(tag)).into_response())
}

async fn delete_tag(State(library): Lib, Path(id): Path<String>) -> Result<Response, AppError> {
    library.delete_tag(&id)?;
    Ok(ok_body())
}

// ── Playback ───────────────────────────────────────────────────────────────

async fn get_playback(State(library): Lib, Path(id): Path<String>) -> Result<Response, AppError> {
    Ok(Json(library.get_playback(&id)?).into_response())
}

#[derive(Deserialize)]
struct PlaybackBody {
    #[serde(default)]
    current_chunk_index: i64,
    #[serde(default)]
    position_secs: f64,
    #[serde(default)]
    percent_listened: f64,
}

async fn save_playback(
    State(library): Lib,
    Path(id): Path<String>,
    Json(body): Json<PlaybackBody>,
) -> Result<Response, AppError> {
    library.save_playback(
        &id,
        body.current_chunk_index,
        body.position_secs,
        body.percent_listened,
    )?;
    Ok(ok_body())
}

// ── Folders and tree ───────────────────────────────────────────────────────

async fn library_tree(State(library): Lib) -> Result<Response, AppError> {
    Ok(Json(library.library_tree()?).into_response())
}

#[derive(Deserialize)]
struct CreateFolderBody {
    name: String,
    parent_id: Option<String>,
    sort_order: Option<i64>,
}

async fn create_folder(
    State(library): Lib,
    Json(body): Json<CreateFolderBody>,
) -> Result<Response, AppError> {
    let folder = library.create_folder(&body.name, body.parent_id.as_deref(), body.sort_order)?;
    Ok((StatusCode::CREATED, Json(folder)).into_response())
}

#[derive(Deserialize)]
struct UpdateFolderBody {
    name: Option<String>,
    /// Present-and-null moves the folder to the root.
    #[serde(default, with = "double_option")]
    parent_id: Option<Option<String>>,
    sort_order: Option<i64>,
}

/// Distinguishes an absent field from an explicit null.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(de).map(Some)
    }
}

async fn update_folder(
    State(library): Lib,
    Path(id): Path<String>,
    Json(body): Json<UpdateFolderBody>,
) -> Result<Response, AppError> {
    library.update_folder(
        &id,
        body.name.as_deref(),
        body.parent_id.as_ref().map(|p| p.as_deref()),
        body.sort_order,
    )?;
    Ok(ok_body())
}

async fn delete_folder(State(library): Lib, Path(id): Path<String>) -> Result<Response, AppError> {
    library.delete_folder(&id)?;
    Ok(ok_body())
}

async fn folder_playlist(
    State(library): Lib,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let playlist = library.folder_playlist(&id)?;
    Ok(Json(json!({
        "folder_id": id,
        "total_episodes": playlist.len(),
        "episodes": playlist,
    }))
    .into_response())
}

// ── Settings, status, voices ───────────────────────────────────────────────

async fn get_settings(State(library): Lib) -> Result<Response, AppError> {
    Ok(Json(library.get_settings()?).into_response())
}

async fn update_settings(
    State(library): Lib,
    Json(values): Json<HashMap<String, String>>,
) -> Result<Response, AppError> {
    library.update_settings(&values)?;
    Ok(ok_body())
}

async fn generation_status(State(library): Lib) -> Result<Response, AppError> {
    Ok(Json(library.generation_status()?).into_response())
}

async fn list_voices(State(library): Lib) -> Result<Response, AppError> {
    Ok(Json(library.voices()).into_response())
}

// ── Audio delivery ─────────────────────────────────────────────────────────

async fn chunk_audio(
    State(library): Lib,
    Path((id, index)): Path<(String, i64)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let (path, mime) = library.chunk_audio(&id, index)?;
    serve_file_with_ranges(path, mime, &headers).await
}

#[derive(Deserialize)]
struct FormatQuery {
    format: Option<String>,
}

async fn full_episode_audio(
    State(library): Lib,
    Path(id): Path<String>,
    Query(query): Query<FormatQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    // Assembly reads and encodes whole episodes; keep it off the async
    // executor.
    let lib = library.clone();
    let (path, mime) = tokio::task::spawn_blocking(move || {
        lib.full_episode_audio(&id, query.format)
    })
    .await
    .map_err(|e| AppError::Internal(e.to_string()))??;
    serve_file_with_ranges(path, mime, &headers).await
}

/// Serve a file, honoring a single `bytes=start-end` range.
async fn serve_file_with_ranges(
    path: PathBuf,
    mime: &'static str,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let mut file = tokio::fs::File::open(&path).await?;
    let total = file.metadata().await?.len();

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_byte_range(v, total));

    match range {
        None => {
            let mut body = Vec::with_capacity(total as usize);
            file.read_to_end(&mut body).await?;
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, mime)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_LENGTH, total)
                .body(Body::from(body))
                .map_err(|e| AppError::Internal(e.to_string()))?)
        }
        Some((start, end)) if start <= end && end < total => {
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start)).await?;
            let mut body = vec![0u8; length as usize];
            file.read_exact(&mut body).await?;
            Ok(Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, mime)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_LENGTH, length)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{total}"),
                )
                .body(Body::from(body))
                .map_err(|e| AppError::Internal(e.to_string()))?)
        }
        Some(_) => Ok(Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{total}"))
            .body(Body::empty())
            .map_err(|e| AppError::Internal(e.to_string()))?),
    }
}

/// Parse `bytes=start-end` (also `bytes=start-` and `bytes=-suffix`).
fn parse_byte_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?.trim();
    // Multi-range requests are answered with the full body.
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    match (start.trim(), end.trim()) {
        ("", suffix) => {
            let suffix: u64 = suffix.parse().ok()?;
            if suffix == 0 || total == 0 {
                return None;
            }
            Some((total.saturating_sub(suffix), total.saturating_sub(1)))
        }
        (start, "") => {
            let start: u64 = start.parse().ok()?;
            Some((start, total.saturating_sub(1)))
        }
        (start, end) => Some((start.parse().ok()?, end.parse().ok()?)),
    }
}

fn ok_body() -> Response {
    Json(json!({ "ok": true })).into_response()
}

#[cfg(test)]
mod tests {
    use super::parse_byte_range;

    #[test]
    fn parses_simple_ranges() {
        assert_eq!(parse_byte_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_byte_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_byte_range("bytes=-200", 1000), Some((800, 999)));
    }

    #[test]
    fn rejects_garbage_and_multi_ranges() {
        assert_eq!(parse_byte_range("bytes=a-b", 1000), None);
        assert_eq!(parse_byte_range("items=0-1", 1000), None);
        assert_eq!(parse_byte_range("bytes=0-1,5-9", 1000), None);
    }
}
