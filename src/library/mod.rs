//! Library service: the coordination layer the HTTP surface talks to.
//!
//! Multi-entity operations (episode creation, regeneration, undo, bulk
//! moves) are atomic to external observers: the database work happens in
//! one transaction, and on-disk cleanup runs best-effort after the commit
//! and is logged rather than surfaced.


use crate::audio::{Assembler, OutputFormat};
use crate::config::Config;
use crate::database::{
    Chunk, ChunkSnapshot, ChunkStatus, Database, Episode, EpisodeSettings, EpisodeSnapshot,
    EpisodeStatus, EpisodeStatusCounts, Folder, NewChunk, PlaybackState, Source, SourceSummary,
    Tag, UndoTicket,
};
use crate::error::AppError;
use crate::ingest::{self, IngestInput};
use crate::text::{breathing, chunker, normalizer, BreathingIntensity, ChunkStrategy,
    CleaningOptions, PlannedChunk};
use crate::tts::{Synthesizer, Voice};
use crate::worker::{WorkerHandle, WorkerSnapshot};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

pub struct Library {
    config: Arc<Config>,
    db: Arc<Database>,
    worker: WorkerHandle,
    assembler: Arc<Assembler>,
    synthesizer: Arc<dyn Synthesizer>,
}

// ── Request/response bodies ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateEpisodeRequest {
    pub source_id: String,
    pub title: Option<String>,
    pub voice_id: Option<String>,
    pub output_format: Option<String>,
    pub chunk_strategy: Option<String>,
    pub chunk_max_chars: Option<i64>,
    pub breathing_intensity: Option<String>,
    pub folder_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RegenerateSettings {
    pub voice_id: Option<String>,
    pub output_format: Option<String>,
    pub chunk_strategy: Option<String>,
    pub chunk_max_chars: Option<i64>,
    pub breathing_intensity: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatedEpisode {
    pub id: String,
    pub title: String,
    pub chunk_count: usize,
    pub status: EpisodeStatus,
}

#[derive(Debug, Serialize)]
pub struct LibraryTree {
    pub folders: Vec<Folder>,
    pub sources: Vec<SourceSummary>,
    pub episodes: Vec<Episode>,
}

#[derive(Debug, Serialize)]
pub struct GenerationStatus {
    #[serde(flatten)]
    pub worker: WorkerSnapshot,
    pub db_status: EpisodeStatusCounts,
}

#[derive(Debug, Serialize)]
pub struct PlaylistEntry {
    pub episode_id: String,
    pub title: String,
    pub voice_id: String,
    pub total_duration_secs: Option<f64>,
    pub folder_id: Option<String>,
}

impl Library {
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        worker: WorkerHandle,
        assembler: Arc<Assembler>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        Self {
            config,
            db,
            worker,
            assembler,
            synthesizer,
        }
    }

    // =====================================================================
    // Sources and ingestion
    // =====================================================================

    /// Ingest content, normalize it with the given (or default) cleaning
    /// options, and persist the source. Ingestion failures leave nothing
    /// behind.
    pub async fn ingest(
        &self,
        input: IngestInput,
        cleaning: Option<CleaningOptions>,
    ) -> Result<Source, AppError> {
        let document = ingest::run(input, &self.config).await?;
        let options = match cleaning {
            Some(options) => options,
            None => self.default_cleaning_options()?,
        };
        let cleaned_text = normalizer::normalize(&document.raw_text, &options);

        let source = Source {
            id: Uuid::new_v4().to_string(),
            title: document.title,
            source_type: document.source_type,
            original_filename: document.original_filename,
            original_url: document.original_url,
            raw_text: document.raw_text,
            cleaned_text,
            cleaning_settings: serde_json::to_string(&options)?,
            cover_art: None,
            folder_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        self.db.insert_source(&source)?;
        self.persist_raw_bytes(&source);

        tracing::info!("Imported source \"{}\" ({})", source.title, source.source_type);
        self.db.get_source(&source.id)?.ok_or_else(|| {
            AppError::Internal("source vanished right after insert".to_string())
        })
    }

    /// Re-run normalization over the stored raw text with new options.
    /// Replaces cleaned_text in place; the id never changes.
    pub fn re_clean_source(
        &self,
        source_id: &str,
        cleaning: Option<CleaningOptions>,
    ) -> Result<Source, AppError> {
        let source = self.require_source(source_id)?;
        let options = match cleaning {
            Some(options) => options,
            None => self.default_cleaning_options()?,
        };
        let cleaned = normalizer::normalize(&source.raw_text, &options);
        self.db
            .update_source_cleaned_text(source_id, &cleaned, &serde_json::to_string(&options)?)?;
        self.require_source(source_id)
    }

    pub fn preview_clean(
        &self,
        text: &str,
        cleaning: Option<CleaningOptions>,
    ) -> Result<String, AppError> {
        let options = match cleaning {
            Some(options) => options,
            None => self.default_cleaning_options()?,
        };
        Ok(normalizer::normalize(text, &options))
    }

    pub fn preview_chunks(
        &self,
        text: &str,
        strategy: Option<String>,
        max_chars: Option<i64>,
    ) -> Result<Vec<PlannedChunk>, AppError> {
        let strategy = ChunkStrategy::from(strategy.unwrap_or_default());
        let max_chars = max_chars.unwrap_or(chunker::DEFAULT_MAX_CHARS as i64).max(1) as usize;
        let chunks = chunker::chunk_text(text, strategy, max_chars);
        if chunks.is_empty() {
            return Err(AppError::EmptyContent);
        }
        Ok(chunks)
    }

    pub fn get_source(&self, source_id: &str) -> Result<Source, AppError> {
        self.require_source(source_id)
    }

    pub fn list_sources(
        &self,
        folder_id: Option<&str>,
        tag: Option<&str>,
    ) -> Result<Vec<SourceSummary>, AppError> {
        Ok(self.db.list_sources(folder_id, tag)?)
    }

    pub fn update_source_title(&self, source_id: &str, title: &str) -> Result<(), AppError> {
        if !self.db.update_source_title(source_id, title)? {
            return Err(AppError::NotFound(format!("source {source_id}")));
        }
        Ok(())
    }

    pub fn move_source(&self, source_id: &str, folder_id: Option<&str>) -> Result<(), AppError> {
        if let Some(folder_id) = folder_id {
            self.require_folder(folder_id)?;
        }
        if !self.db.set_source_folder(source_id, folder_id)? {
            return Err(AppError::NotFound(format!("source {source_id}")));
        }
        Ok(())
    }

    /// Store cover art bytes beside the source's raw upload.
    pub fn set_cover_art(
        &self,
        source_id: &str,
        bytes: &[u8],
        extension: &str,
    ) -> Result<String, AppError> {
        self.require_source(source_id)?;
        if !matches!(extension, "png" | "jpg" | "jpeg" | "webp") {
            return Err(AppError::UnsupportedType(format!(
                "cover art type .{extension} not supported"
            )));
        }
        let dir = self.config.sources_dir().join(source_id);
        std::fs::create_dir_all(&dir)?;
        let relative = format!("{source_id}/cover.{extension}");
        std::fs::write(self.config.sources_dir().join(&relative), bytes)?;
        self.db.set_source_cover(source_id, &relative)?;
        Ok(relative)
    }

    /// Delete a source; its episodes cascade, audio directories follow
    /// best-effort after the commit.
    pub fn delete_source(&self, source_id: &str) -> Result<(), AppError> {
        let Some(episode_ids) = self.db.delete_source(source_id)? else {
            return Err(AppError::NotFound(format!("source {source_id}")));
        };
        for episode_id in &episode_ids {
            self.remove_episode_audio(episode_id);
        }
        remove_dir_best_effort(&self.config.sources_dir().join(source_id));
        Ok(())
    }

    // =====================================================================
    // Episodes
    // =====================================================================

    /// Create an episode: snapshot the source's cleaned text, build the
    /// chunk plan, insert everything in one transaction, then enqueue.
    pub fn create_episode(&self, req: CreateEpisodeRequest) -> Result<CreatedEpisode, AppError> {
        let source = self.require_source(&req.source_id)?;
        if let Some(folder_id) = &req.folder_id {
            self.require_folder(folder_id)?;
        }
        let settings = self.resolve_settings(
            req.voice_id,
            req.output_format,
            req.chunk_strategy,
            req.chunk_max_chars,
            req.breathing_intensity,
        )?;

        let plan = build_plan(&source.cleaned_text, &settings)?;
        let episode = Episode {
            id: Uuid::new_v4().to_string(),
            source_id: source.id.clone(),
            title: req.title.unwrap_or_else(|| source.title.clone()),
            voice_id: settings.voice_id,
            output_format: settings.output_format,
            chunk_strategy: settings.chunk_strategy,
            chunk_max_chars: settings.chunk_max_chars,
            breathing_intensity: settings.breathing_intensity,
            status: EpisodeStatus::Pending,
            total_duration_secs: None,
            error_message: None,
            folder_id: req.folder_id,
            created_at: String::new(),
            updated_at: String::new(),
            last_played_at: None,
            percent_listened: None,
        };
        self.db.insert_episode(&episode, &plan)?;
        self.worker.enqueue(&episode.id);

        Ok(CreatedEpisode {
            id: episode.id,
            title: episode.title,
            chunk_count: plan.len(),
            status: EpisodeStatus::Pending,
        })
    }

    pub fn get_episode(&self, episode_id: &str) -> Result<(Episode, Vec<Chunk>), AppError> {
        let episode = self.require_episode(episode_id)?;
        let chunks = self.db.chunks_for_episode(episode_id)?;
        Ok((episode, chunks))
    }

    pub fn list_episodes(
        &self,
        source_id: Option<&str>,
        folder_id: Option<&str>,
    ) -> Result<Vec<Episode>, AppError> {
        Ok(self.db.list_episodes(source_id, folder_id)?)
    }

    pub fn update_episode_title(&self, episode_id: &str, title: &str) -> Result<(), AppError> {
        if !self.db.update_episode_title(episode_id, title)? {
            return Err(AppError::NotFound(format!("episode {episode_id}")));
        }
        Ok(())
    }

    pub fn delete_episode(&self, episode_id: &str) -> Result<(), AppError> {
        if !self.db.delete_episode(episode_id)? {
            return Err(AppError::NotFound(format!("episode {episode_id}")));
        }
        self.remove_episode_audio(episode_id);
        Ok(())
    }

    /// Reset every chunk and start over. Refused while the episode is
    /// actively generating; cancel first.
    pub fn regenerate_episode(&self, episode_id: &str) -> Result<(), AppError> {
        let status = self.require_episode_status(episode_id)?;
        if status == EpisodeStatus::Generating {
            return Err(AppError::InvalidState(
                "episode is generating; cancel it before regenerating".to_string(),
            ));
        }
        self.db.reset_all_chunks(episode_id)?;
        self.remove_episode_audio(episode_id);
        self.worker.enqueue(episode_id);
        Ok(())
    }

    /// Reset a single chunk, leaving its siblings and their audio alone.
    pub fn regenerate_chunk(&self, episode_id: &str, chunk_index: i64) -> Result<(), AppError> {
        let Some(prior) = self.db.reset_chunk(episode_id, chunk_index)? else {
            return Err(AppError::NotFound(format!(
                "chunk {chunk_index} of episode {episode_id}"
            )));
        };
        if let Some(audio_path) = &prior.audio_path {
            remove_file_best_effort(&self.audio_root().join(audio_path));
        }
        self.assembler.invalidate(episode_id);
        self.worker.enqueue(episode_id);
        Ok(())
    }

    /// Apply new generation settings (which may re-chunk) behind an undo
    /// ticket valid for the configured window.
    pub fn regenerate_with_settings(
        &self,
        episode_id: &str,
        req: RegenerateSettings,
    ) -> Result<String, AppError> {
        self.purge_expired_undo();

        let episode = self.require_episode(episode_id)?;
        let source = self.require_source(&episode.source_id)?;
        let chunks = self.db.chunks_for_episode(episode_id)?;

        let snapshot = EpisodeSnapshot {
            voice_id: episode.voice_id.clone(),
            output_format: episode.output_format.clone(),
            chunk_strategy: episode.chunk_strategy.clone(),
            chunk_max_chars: episode.chunk_max_chars,
            breathing_intensity: episode.breathing_intensity.clone(),
            status: episode.status,
            total_duration_secs: episode.total_duration_secs,
            chunks: chunks
                .iter()
                .map(|c| ChunkSnapshot {
                    chunk_index: c.chunk_index,
                    text: c.text.clone(),
                    label: c.label.clone(),
                    status: c.status,
                    duration_secs: c.duration_secs,
                    audio_path: c.audio_path.clone(),
                    error_message: c.error_message.clone(),
                })
                .collect(),
        };

        let settings = EpisodeSettings {
            voice_id: req.voice_id.unwrap_or(episode.voice_id),
            output_format: req.output_format.unwrap_or(episode.output_format),
            chunk_strategy: req.chunk_strategy.unwrap_or(episode.chunk_strategy),
            chunk_max_chars: req.chunk_max_chars.unwrap_or(episode.chunk_max_chars),
            breathing_intensity: req
                .breathing_intensity
                .unwrap_or(episode.breathing_intensity),
        };
        let plan = build_plan(&source.cleaned_text, &settings)?;

        let ticket_id = Uuid::new_v4().to_string();
        let audio_dir = self.audio_root().join(episode_id);
        let backup_dir = self.audio_root().join(format!(".backup_{ticket_id}"));
        let backup = if audio_dir.is_dir() {
            copy_dir_recursive(&audio_dir, &backup_dir)?;
            Some(backup_dir.to_string_lossy().into_owned())
        } else {
            None
        };

        self.db.insert_undo_ticket(
            &UndoTicket {
                id: ticket_id.clone(),
                episode_id: episode_id.to_string(),
                operation_kind: "regenerate_with_settings".to_string(),
                inverse_payload: serde_json::to_string(&snapshot)?,
                backup_audio_dir: backup,
                created_at: String::new(),
                expires_at: String::new(),
            },
            self.config.undo_window_secs,
        )?;

        self.db.replace_episode_plan(episode_id, &settings, &plan)?;
        self.remove_episode_audio(episode_id);
        self.worker.enqueue(episode_id);

        tracing::info!(
            "Episode {} regenerating with new settings (undo {} valid {}s)",
            episode_id,
            ticket_id,
            self.config.undo_window_secs
        );
        Ok(ticket_id)
    }

    /// Restore the state captured by `regenerate_with_settings` if the
    /// window has not closed.
    pub fn undo(&self, undo_id: &str) -> Result<(), AppError> {
        let Some((ticket, expired)) = self.db.get_undo_ticket(undo_id)? else {
            return Err(AppError::NotFound(format!("undo ticket {undo_id}")));
        };
        if expired {
            self.purge_expired_undo();
            return Err(AppError::UndoExpired);
        }

        let snapshot: EpisodeSnapshot = serde_json::from_str(&ticket.inverse_payload)?;
        if !self.db.restore_episode_snapshot(&ticket.episode_id, &snapshot)? {
            self.db.delete_undo_ticket(undo_id)?;
            return Err(AppError::NotFound(format!("episode {}", ticket.episode_id)));
        }

        let audio_dir = self.audio_root().join(&ticket.episode_id);
        remove_dir_best_effort(&audio_dir);
        if let Some(backup) = &ticket.backup_audio_dir {
            let backup = PathBuf::from(backup);
            if backup.is_dir() {
                if let Err(e) = std::fs::rename(&backup, &audio_dir) {
                    tracing::warn!("Could not restore audio backup {:?}: {}", backup, e);
                }
            }
        }
        self.db.delete_undo_ticket(undo_id)?;
        tracing::info!("Episode {} restored from undo {}", ticket.episode_id, undo_id);
        Ok(())
    }

    /// Cancel a pending or generating episode. Ready chunks keep their
    /// audio; the in-flight chunk is rolled back by the worker.
    pub fn cancel_episode(&self, episode_id: &str) -> Result<(), AppError> {
        let status = self.require_episode_status(episode_id)?;
        if !matches!(status, EpisodeStatus::Pending | EpisodeStatus::Generating) {
            return Err(AppError::InvalidState(format!(
                "cannot cancel a {status} episode"
            )));
        }
        self.db
            .set_episode_status(episode_id, EpisodeStatus::Cancelled)?;
        tracing::info!("Episode {} cancelled", episode_id);
        Ok(())
    }

    /// Put every failed chunk back in the queue.
    pub fn retry_errors(&self, episode_id: &str) -> Result<usize, AppError> {
        self.require_episode_status(episode_id)?;
        let prior = self.db.reset_error_chunks(episode_id)?;
        if prior.is_empty() {
            return Ok(0);
        }
        for chunk in &prior {
            if let Some(audio_path) = &chunk.audio_path {
                remove_file_best_effort(&self.audio_root().join(audio_path));
            }
        }
        self.assembler.invalidate(episode_id);
        self.worker.enqueue(episode_id);
        Ok(prior.len())
    }

    pub fn move_episode(&self, episode_id: &str, folder_id: Option<&str>) -> Result<(), AppError> {
        if let Some(folder_id) = folder_id {
            self.require_folder(folder_id)?;
        }
        if !self.db.set_episode_folder(episode_id, folder_id)? {
            return Err(AppError::NotFound(format!("episode {episode_id}")));
        }
        Ok(())
    }

    /// Move a batch of episodes in one transaction; all-or-nothing.
    pub fn bulk_move(&self, episode_ids: &[String], folder_id: Option<&str>) -> Result<(), AppError> {
        if let Some(folder_id) = folder_id {
            self.require_folder(folder_id)?;
        }
        if let Some(missing) = self.db.bulk_move_episodes(episode_ids, folder_id)? {
            return Err(AppError::NotFound(format!("episode {missing}")));
        }
        Ok(())
    }

    /// Delete a batch of episodes in one transaction; all-or-nothing. Audio
    /// cleanup runs after the commit.
    pub fn bulk_delete(&self, episode_ids: &[String]) -> Result<(), AppError> {
        if let Some(missing) = self.db.bulk_delete_episodes(episode_ids)? {
            return Err(AppError::NotFound(format!("episode {missing}")));
        }
        for episode_id in episode_ids {
            self.remove_episode_audio(episode_id);
        }
        Ok(())
    }

    // =====================================================================
    // Playback
    // =====================================================================

    pub fn get_playback(&self, episode_id: &str) -> Result<PlaybackState, AppError> {
        self.require_episode_status(episode_id)?;
        Ok(self
            .db
            .get_playback(episode_id)?
            .unwrap_or(PlaybackState {
                episode_id: episode_id.to_string(),
                current_chunk_index: 0,
                position_secs: 0.0,
                percent_listened: 0.0,
                updated_at: None,
            }))
    }

    pub fn save_playback(
        &self,
        episode_id: &str,
        current_chunk_index: i64,
        position_secs: f64,
        percent_listened: f64,
    ) -> Result<(), AppError> {
        let count = self.db.chunk_count(episode_id)?;
        if count == 0 {
            return Err(AppError::NotFound(format!("episode {episode_id}")));
        }
        if current_chunk_index < 0 || current_chunk_index >= count {
            return Err(AppError::InvalidState(format!(
                "chunk index {current_chunk_index} out of range 0..{count}"
            )));
        }
        self.db.save_playback(
            episode_id,
            current_chunk_index,
            position_secs.max(0.0),
            percent_listened.clamp(0.0, 100.0),
        )?;
        Ok(())
    }

    // =====================================================================
    // Folders, tags, tree
    // =====================================================================

    pub fn library_tree(&self) -> Result<LibraryTree, AppError> {
        Ok(LibraryTree {
            folders: self.db.list_folders()?,
            sources: self.db.list_sources(None, None)?,
            episodes: self.db.list_episodes(None, None)?,
        })
    }

    pub fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
        sort_order: Option<i64>,
    ) -> Result<Folder, AppError> {
        if let Some(parent_id) = parent_id {
            self.require_folder(parent_id)?;
        }
        let folder = Folder {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            parent_id: parent_id.map(str::to_string),
            sort_order: sort_order.unwrap_or(0),
            created_at: String::new(),
        };
        if folder.name.is_empty() {
            return Err(AppError::InvalidState("folder name required".to_string()));
        }
        self.db.insert_folder(&folder)?;
        Ok(folder)
    }

    pub fn update_folder(
        &self,
        folder_id: &str,
        name: Option<&str>,
        parent_id: Option<Option<&str>>,
        sort_order: Option<i64>,
    ) -> Result<(), AppError> {
        self.require_folder(folder_id)?;
        if let Some(Some(new_parent)) = parent_id {
            self.require_folder(new_parent)?;
            self.check_no_cycle(folder_id, new_parent)?;
        }
        self.db
            .update_folder(folder_id, name, parent_id, sort_order)?;
        Ok(())
    }

    pub fn delete_folder(&self, folder_id: &str) -> Result<(), AppError> {
        if !self.db.delete_folder(folder_id)? {
            return Err(AppError::NotFound(format!("folder {folder_id}")));
        }
        Ok(())
    }

    /// Ready episodes in a folder and its subfolders, depth-first with
    /// folders visited in name order.
    pub fn folder_playlist(&self, folder_id: &str) -> Result<Vec<PlaylistEntry>, AppError> {
        self.require_folder(folder_id)?;
        let folders = self.db.list_folders()?;

        let mut ordered_folders = Vec::new();
        collect_folders_depth_first(folder_id, &folders, &mut ordered_folders);

        let mut playlist = Vec::new();
        for folder in ordered_folders {
            let mut episodes = self.db.list_episodes(None, Some(&folder))?;
            episodes.retain(|e| e.status == EpisodeStatus::Ready);
            episodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            for episode in episodes {
                playlist.push(PlaylistEntry {
                    episode_id: episode.id,
                    title: episode.title,
                    voice_id: episode.voice_id,
                    total_duration_secs: episode.total_duration_secs,
                    folder_id: episode.folder_id,
                });
            }
        }
        Ok(playlist)
    }

    pub fn list_tags(&self) -> Result<Vec<Tag>, AppError> {
        Ok(self.db.list_tags()?)
    }

    pub fn create_tag(&self, name: &str) -> Result<Tag, AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidState("tag name required".to_string()));
        }
        let tag = Tag {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
        };
        self.db
            .insert_tag(&tag)
            .map_err(|e| AppError::InvalidState(e.to_string()))?;
        Ok(tag)
    }

    pub fn delete_tag(&self, tag_id: &str) -> Result<(), AppError> {
        if !self.db.delete_tag(tag_id)? {
            return Err(AppError::NotFound(format!("tag {tag_id}")));
        }
        Ok(())
    }

    pub fn set_source_tags(&self, source_id: &str, tag_ids: &[String]) -> Result<(), AppError> {
        self.require_source(source_id)?;
        Ok(self.db.set_source_tags(source_id, tag_ids)?)
    }

    pub fn set_episode_tags(&self, episode_id: &str, tag_ids: &[String]) -> Result<(), AppError> {
        self.require_episode_status(episode_id)?;
        Ok(self.db.set_episode_tags(episode_id, tag_ids)?)
    }

    // =====================================================================
    // Settings, status, voices
    // =====================================================================

    pub fn get_settings(&self) -> Result<std::collections::HashMap<String, String>, AppError> {
        Ok(self.db.get_all_settings()?)
    }

    pub fn update_settings(
        &self,
        values: &std::collections::HashMap<String, String>,
    ) -> Result<(), AppError> {
        for (key, value) in values {
            self.db.set_setting(key, value)?;
        }
        Ok(())
    }

    pub fn generation_status(&self) -> Result<GenerationStatus, AppError> {
        Ok(GenerationStatus {
            worker: self.worker.snapshot(),
            db_status: self.db.episode_status_counts()?,
        })
    }

    pub fn voices(&self) -> Vec<Voice> {
        self.synthesizer.voices()
    }

    // =====================================================================
    // Audio delivery
    // =====================================================================

    /// Path and MIME type of one ready chunk's audio file.
    pub fn chunk_audio(&self, episode_id: &str, chunk_index: i64) -> Result<(PathBuf, &'static str), AppError> {
        let Some(chunk) = self.db.get_chunk_by_index(episode_id, chunk_index)? else {
            return Err(AppError::NotFound(format!(
                "chunk {chunk_index} of episode {episode_id}"
            )));
        };
        let (ChunkStatus::Ready, Some(audio_path)) = (chunk.status, &chunk.audio_path) else {
            return Err(AppError::InvalidState(format!(
                "chunk {chunk_index} is not ready"
            )));
        };
        let path = self.audio_root().join(audio_path);
        if !path.is_file() {
            return Err(AppError::NotFound(format!("audio file for chunk {chunk_index}")));
        }
        Ok((path, OutputFormat::Wav.mime_type()))
    }

    /// Path and MIME type of the lazily assembled full-episode artifact.
    pub fn full_episode_audio(
        &self,
        episode_id: &str,
        format: Option<String>,
    ) -> Result<(PathBuf, &'static str), AppError> {
        let episode = self.require_episode(episode_id)?;
        let chunks = self.db.chunks_for_episode(episode_id)?;
        if chunks.is_empty() || chunks.iter().any(|c| c.status != ChunkStatus::Ready) {
            return Err(AppError::InvalidState(
                "episode audio is not ready".to_string(),
            ));
        }
        let format = OutputFormat::from(format.unwrap_or(episode.output_format));
        let chunk_paths: Vec<PathBuf> = chunks
            .iter()
            .filter_map(|c| c.audio_path.as_ref())
            .map(|p| self.audio_root().join(p))
            .collect();
        let path = self.assembler.assemble(episode_id, &chunk_paths, format)?;
        Ok((path, format.mime_type()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn worker_handle(&self) -> WorkerHandle {
        self.worker.clone()
    }

    #[cfg(test)]
    pub(crate) fn assembler_handle(&self) -> Arc<Assembler> {
        self.assembler.clone()
    }

    // ── internals ──────────────────────────────────────────────────────────

    fn audio_root(&self) -> PathBuf {
        self.config.audio_dir()
    }

    fn require_source(&self, source_id: &str) -> Result<Source, AppError> {
        self.db
            .get_source(source_id)?
            .ok_or_else(|| AppError::NotFound(format!("source {source_id}")))
    }

    fn require_episode(&self, episode_id: &str) -> Result<Episode, AppError> {
        self.db
            .get_episode(episode_id)?
            .ok_or_else(|| AppError::NotFound(format!("episode {episode_id}")))
    }

    fn require_episode_status(&self, episode_id: &str) -> Result<EpisodeStatus, AppError> {
        self.db
            .episode_status(episode_id)?
            .ok_or_else(|| AppError::NotFound(format!("episode {episode_id}")))
    }

    fn require_folder(&self, folder_id: &str) -> Result<(), AppError> {
        if !self.db.folder_exists(folder_id)? {
            return Err(AppError::NotFound(format!("folder {folder_id}")));
        }
        Ok(())
    }

    /// Folders form a tree: reject a parent change that would make the
    /// folder its own ancestor.
    fn check_no_cycle(&self, folder_id: &str, new_parent: &str) -> Result<(), AppError> {
        let folders = self.db.list_folders()?;
        let mut cursor = Some(new_parent.to_string());
        while let Some(current) = cursor {
            if current == folder_id {
                return Err(AppError::InvalidState(
                    "folder cannot be moved into its own subtree".to_string(),
                ));
            }
            cursor = folders
                .iter()
                .find(|f| f.id == current)
                .and_then(|f| f.parent_id.clone());
        }
        Ok(())
    }

    fn default_cleaning_options(&self) -> Result<CleaningOptions, AppError> {
        let settings = self.db.get_all_settings()?;
        Ok(CleaningOptions::from_settings(&settings))
    }

    fn resolve_settings(
        &self,
        voice_id: Option<String>,
        output_format: Option<String>,
        chunk_strategy: Option<String>,
        chunk_max_chars: Option<i64>,
        breathing_intensity: Option<String>,
    ) -> Result<EpisodeSettings, AppError> {
        let settings = self.db.get_all_settings()?;
        let default = |key: &str, fallback: &str| {
            settings
                .get(key)
                .cloned()
                .unwrap_or_else(|| fallback.to_string())
        };
        Ok(EpisodeSettings {
            voice_id: voice_id.unwrap_or_else(|| default("default_voice", "alba")),
            output_format: OutputFormat::from(
                output_format.unwrap_or_else(|| default("default_output_format", "wav")),
            )
            .to_string(),
            chunk_strategy: ChunkStrategy::from(
                chunk_strategy.unwrap_or_else(|| default("default_chunk_strategy", "paragraph")),
            )
            .to_string(),
            chunk_max_chars: chunk_max_chars.unwrap_or_else(|| {
                default("default_chunk_max_chars", "2000")
                    .parse()
                    .unwrap_or(chunker::DEFAULT_MAX_CHARS as i64)
            }),
            breathing_intensity: BreathingIntensity::from(
                breathing_intensity
                    .unwrap_or_else(|| default("default_breathing_intensity", "normal")),
            )
            .to_string(),
        })
    }

    fn persist_raw_bytes(&self, source: &Source) {
        let dir = self.config.sources_dir().join(&source.id);
        let filename = source
            .original_filename
            .clone()
            .unwrap_or_else(|| "raw.md".to_string());
        if let Err(e) = std::fs::create_dir_all(&dir)
            .and_then(|_| std::fs::write(dir.join(&filename), source.raw_text.as_bytes()))
        {
            tracing::warn!("Could not persist raw bytes for source {}: {}", source.id, e);
        }
    }

    fn remove_episode_audio(&self, episode_id: &str) {
        remove_dir_best_effort(&self.audio_root().join(episode_id));
    }

    fn purge_expired_undo(&self) {
        match self.db.purge_expired_undo_tickets() {
            Ok(backup_dirs) => {
                for dir in backup_dirs {
                    remove_dir_best_effort(Path::new(&dir));
                }
            }
            Err(e) => tracing::warn!("Could not purge expired undo tickets: {}", e),
        }
    }
}

/// Chunk the cleaned text and run the breathing pass over each chunk. The
/// stored chunk text is exactly what will be synthesized.
fn build_plan(cleaned_text: &str, settings: &EpisodeSettings) -> Result<Vec<NewChunk>, AppError> {
    let strategy = ChunkStrategy::from(settings.chunk_strategy.clone());
    let intensity = BreathingIntensity::from(settings.breathing_intensity.clone());
    let max_chars = settings.chunk_max_chars.max(1) as usize;

    let chunks = chunker::chunk_text(cleaned_text, strategy, max_chars);
    if chunks.is_empty() {
        return Err(AppError::EmptyContent);
    }
    Ok(chunks
        .into_iter()
        .map(|c| NewChunk {
            index: c.index as i64,
            text: breathing::apply(&c.text, intensity),
            label: c.label,
        })
        .collect())
}

/// Visit `folder_id` and its descendants depth-first, children in name
/// order.
fn collect_folders_depth_first(folder_id: &str, folders: &[Folder], out: &mut Vec<String>) {
    out.push(folder_id.to_string());
    let mut children: Vec<&Folder> = folders
        .iter()
        .filter(|f| f.parent_id.as_deref() == Some(folder_id))
        .collect();
    children.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
    for child in children {
        collect_folders_depth_first(&child.id, folders, out);
    }
}

fn copy_dir_recursive(from: &Path, to: &Path) -> Result<(), AppError> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn remove_dir_best_effort(dir: &Path) {
    if dir.is_dir() {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            tracing::warn!("Could not remove {:?}: {}", dir, e);
        }
    }
}

fn remove_file_best_effort(path: &Path) {
    if path.is_file() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("Could not remove {:?}: {}", path, e);
        }
    }
}
