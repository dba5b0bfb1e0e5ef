pub mod models;

#[cfg(test)]
mod tests;

use anyhow::{bail, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub use models::*;

const SCHEMA_VERSION: i64 = 2;

/// Sole custodian of persistent relational state.
///
/// A single connection behind a mutex gives writer exclusivity; WAL mode
/// keeps readers nonblocking. Every multi-row mutation runs inside one
/// rusqlite transaction.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS folders (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                parent_id TEXT REFERENCES folders(id) ON DELETE SET NULL,
                sort_order INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS sources (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                source_type TEXT NOT NULL,
                original_filename TEXT,
                original_url TEXT,
                raw_text TEXT NOT NULL,
                cleaned_text TEXT NOT NULL,
                cleaning_settings TEXT NOT NULL DEFAULT '{}',
                cover_art TEXT,
                folder_id TEXT REFERENCES folders(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS episodes (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                voice_id TEXT NOT NULL,
                output_format TEXT NOT NULL DEFAULT 'wav',
                chunk_strategy TEXT NOT NULL DEFAULT 'paragraph',
                chunk_max_chars INTEGER NOT NULL DEFAULT 2000,
                breathing_intensity TEXT NOT NULL DEFAULT 'normal',
                status TEXT NOT NULL DEFAULT 'pending',
                total_duration_secs REAL,
                error_message TEXT,
                folder_id TEXT REFERENCES folders(id) ON DELETE SET NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                last_played_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_episodes_source ON episodes(source_id);
            CREATE INDEX IF NOT EXISTS idx_episodes_status ON episodes(status);

            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                episode_id TEXT NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                label TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                duration_secs REAL,
                audio_path TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(episode_id, chunk_index)
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_episode ON chunks(episode_id, chunk_index);
            CREATE INDEX IF NOT EXISTS idx_chunks_status ON chunks(status);

            CREATE TABLE IF NOT EXISTS tags (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS source_tags (
                source_id TEXT NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
                tag_id TEXT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                PRIMARY KEY (source_id, tag_id)
            );

            CREATE TABLE IF NOT EXISTS episode_tags (
                episode_id TEXT NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
                tag_id TEXT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                PRIMARY KEY (episode_id, tag_id)
            );

            CREATE TABLE IF NOT EXISTS playback_state (
                episode_id TEXT PRIMARY KEY REFERENCES episodes(id) ON DELETE CASCADE,
                current_chunk_index INTEGER NOT NULL DEFAULT 0,
                position_secs REAL NOT NULL DEFAULT 0.0,
                percent_listened REAL NOT NULL DEFAULT 0.0,
                updated_at TEXT
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS undo_tickets (
                id TEXT PRIMARY KEY,
                episode_id TEXT NOT NULL,
                operation_kind TEXT NOT NULL,
                inverse_payload TEXT NOT NULL,
                backup_audio_dir TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_undo_expires ON undo_tickets(expires_at);

            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            -- Default preferences; deployment config stays in the environment.
            INSERT OR IGNORE INTO settings (key, value) VALUES
                ('default_voice', 'alba'),
                ('default_output_format', 'wav'),
                ('default_chunk_strategy', 'paragraph'),
                ('default_chunk_max_chars', '2000'),
                ('default_breathing_intensity', 'normal'),
                ('clean_code_block_rule', 'skip'),
                ('clean_remove_non_text', 'false'),
                ('clean_handle_tables', 'true'),
                ('clean_speak_urls', 'true'),
                ('clean_expand_abbreviations', 'true'),
                ('clean_preserve_parentheses', 'true'),
                ('auto_play_next', 'true');
        "#,
        )?;

        let existing: Option<i64> = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .optional()?;
        match existing {
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(v) if v < SCHEMA_VERSION => {
                Self::run_migrations(&conn, v)?;
                conn.execute("UPDATE schema_version SET version = ?1", params![SCHEMA_VERSION])?;
            }
            Some(_) => {}
        }

        Ok(())
    }

    /// Versioned migrations, applied at startup before the worker thread
    /// starts. Each step must be idempotent.
    fn run_migrations(conn: &Connection, from: i64) -> Result<()> {
        if from < 2 {
            // v2: episode-level error message (set when generation finalizes
            // with failed chunks).
            let _ = conn.execute("ALTER TABLE episodes ADD COLUMN error_message TEXT", []);
            tracing::info!("Applied schema migration 2");
        }
        Ok(())
    }

    // =========================================================================
    // Startup recovery
    // =========================================================================

    /// Reset any chunk left in `generating` by a crash back to `pending`,
    /// reconcile episode statuses with their chunks' aggregate state, and
    /// return the episodes that still have pending work, in admission order.
    pub fn recover_interrupted(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let stuck = tx.execute(
            "UPDATE chunks SET status = 'pending' WHERE status = 'generating'",
            [],
        )?;
        if stuck > 0 {
            tracing::info!("Reset {} chunk(s) stuck in generating", stuck);
        }

        let episode_ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM episodes WHERE status != 'cancelled' ORDER BY created_at, id",
            )?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            ids
        };

        let mut requeue = Vec::new();
        for id in episode_ids {
            let tally = chunk_tally(&tx, &id)?;
            let status: String = tx.query_row(
                "SELECT status FROM episodes WHERE id = ?1",
                params![&id],
                |row| row.get(0),
            )?;
            let status = EpisodeStatus::from(status);

            if tally.pending > 0 {
                // Unfinished work: keep a previously-generating episode
                // eligible, demote anything else to pending.
                if status != EpisodeStatus::Generating && status != EpisodeStatus::Pending {
                    set_episode_status(&tx, &id, EpisodeStatus::Pending)?;
                }
                requeue.push(id);
            } else {
                reconcile_terminal_status(&tx, &id, &tally, status)?;
            }
        }

        tx.commit()?;
        Ok(requeue)
    }

    // =========================================================================
    // Sources
    // =========================================================================

    pub fn insert_source(&self, src: &Source) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sources (id, title, source_type, original_filename, original_url,
                raw_text, cleaned_text, cleaning_settings, folder_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                src.id,
                src.title,
                src.source_type.to_string(),
                src.original_filename,
                src.original_url,
                src.raw_text,
                src.cleaned_text,
                src.cleaning_settings,
                src.folder_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_source(&self, source_id: &str) -> Result<Option<Source>> {
        let conn = self.conn.lock().unwrap();
        let source = conn
            .query_row(
                "SELECT id, title, source_type, original_filename, original_url, raw_text,
                        cleaned_text, cleaning_settings, cover_art, folder_id, created_at, updated_at
                 FROM sources WHERE id = ?1",
                params![source_id],
                source_from_row,
            )
            .optional()?;
        Ok(source)
    }

    pub fn list_sources(
        &self,
        folder_id: Option<&str>,
        tag: Option<&str>,
    ) -> Result<Vec<SourceSummary>> {
        let conn = self.conn.lock().unwrap();

        let mut query = String::from(
            "SELECT s.id, s.title, s.source_type, s.original_url, s.folder_id,
                    LENGTH(s.cleaned_text), s.created_at, s.updated_at
             FROM sources s",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(tag) = tag {
            query.push_str(
                " JOIN source_tags st ON s.id = st.source_id
                  JOIN tags t ON st.tag_id = t.id WHERE t.name = ?1",
            );
            args.push(Box::new(tag.to_string()));
        } else if let Some(folder_id) = folder_id {
            query.push_str(" WHERE s.folder_id = ?1");
            args.push(Box::new(folder_id.to_string()));
        }
        query.push_str(" ORDER BY s.created_at DESC, s.id");

        let mut stmt = conn.prepare(&query)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
                Ok(SourceSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    source_type: SourceType::from(row.get::<_, String>(2)?),
                    original_url: row.get(3)?,
                    folder_id: row.get(4)?,
                    text_length: row.get(5)?,
                    created_at: row.get(6)?,
                    updated_at: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Replace cleaned_text in place; the source id never changes.
    pub fn update_source_cleaned_text(
        &self,
        source_id: &str,
        cleaned_text: &str,
        cleaning_settings: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE sources SET cleaned_text = ?1, cleaning_settings = ?2,
                    updated_at = datetime('now') WHERE id = ?3",
            params![cleaned_text, cleaning_settings, source_id],
        )?;
        Ok(changed > 0)
    }

    pub fn update_source_title(&self, source_id: &str, title: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE sources SET title = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![title, source_id],
        )?;
        Ok(changed > 0)
    }

    pub fn set_source_folder(&self, source_id: &str, folder_id: Option<&str>) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE sources SET folder_id = ?1 WHERE id = ?2",
            params![folder_id, source_id],
        )?;
        Ok(changed > 0)
    }

    pub fn set_source_cover(&self, source_id: &str, cover_path: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE sources SET cover_art = ?1 WHERE id = ?2",
            params![cover_path, source_id],
        )?;
        Ok(changed > 0)
    }

    /// Delete a source; episodes, chunks and playback rows cascade. Returns
    /// the ids of the deleted episodes so the caller can remove their audio
    /// directories after the transaction commits.
    pub fn delete_source(&self, source_id: &str) -> Result<Option<Vec<String>>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let episode_ids: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM episodes WHERE source_id = ?1")?;
            let ids = stmt
                .query_map(params![source_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            ids
        };
        let deleted = tx.execute("DELETE FROM sources WHERE id = ?1", params![source_id])?;
        tx.commit()?;
        if deleted == 0 {
            return Ok(None);
        }
        Ok(Some(episode_ids))
    }

    // =========================================================================
    // Episodes and chunks
    // =========================================================================

    /// Insert an episode with its full chunk plan and an empty playback row
    /// in one transaction.
    pub fn insert_episode(&self, episode: &Episode, chunks: &[NewChunk]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO episodes (id, source_id, title, voice_id, output_format,
                chunk_strategy, chunk_max_chars, breathing_intensity, status, folder_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                episode.id,
                episode.source_id,
                episode.title,
                episode.voice_id,
                episode.output_format,
                episode.chunk_strategy,
                episode.chunk_max_chars,
                episode.breathing_intensity,
                episode.status.to_string(),
                episode.folder_id,
            ],
        )?;
        insert_chunk_plan(&tx, &episode.id, chunks)?;
        tx.execute(
            "INSERT INTO playback_state (episode_id) VALUES (?1)",
            params![episode.id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_episode(&self, episode_id: &str) -> Result<Option<Episode>> {
        let conn = self.conn.lock().unwrap();
        let episode = conn
            .query_row(
                &format!("{EPISODE_SELECT} WHERE e.id = ?1"),
                params![episode_id],
                episode_from_row,
            )
            .optional()?;
        Ok(episode)
    }

    pub fn episode_status(&self, episode_id: &str) -> Result<Option<EpisodeStatus>> {
        let conn = self.conn.lock().unwrap();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM episodes WHERE id = ?1",
                params![episode_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.map(EpisodeStatus::from))
    }

    pub fn list_episodes(
        &self,
        source_id: Option<&str>,
        folder_id: Option<&str>,
    ) -> Result<Vec<Episode>> {
        let conn = self.conn.lock().unwrap();
        let mut query = EPISODE_SELECT.to_string();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(source_id) = source_id {
            query.push_str(" WHERE e.source_id = ?1");
            args.push(Box::new(source_id.to_string()));
        } else if let Some(folder_id) = folder_id {
            query.push_str(" WHERE e.folder_id = ?1");
            args.push(Box::new(folder_id.to_string()));
        }
        query.push_str(" ORDER BY e.created_at DESC, e.id");

        let mut stmt = conn.prepare(&query)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), episode_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn chunks_for_episode(&self, episode_id: &str) -> Result<Vec<Chunk>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{CHUNK_SELECT} WHERE episode_id = ?1 ORDER BY chunk_index"
        ))?;
        let rows = stmt
            .query_map(params![episode_id], chunk_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_chunk_by_index(&self, episode_id: &str, chunk_index: i64) -> Result<Option<Chunk>> {
        let conn = self.conn.lock().unwrap();
        let chunk = conn
            .query_row(
                &format!("{CHUNK_SELECT} WHERE episode_id = ?1 AND chunk_index = ?2"),
                params![episode_id, chunk_index],
                chunk_from_row,
            )
            .optional()?;
        Ok(chunk)
    }

    pub fn chunk_count(&self, episode_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE episode_id = ?1",
            params![episode_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn update_episode_title(&self, episode_id: &str, title: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE episodes SET title = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![title, episode_id],
        )?;
        Ok(changed > 0)
    }

    pub fn set_episode_folder(&self, episode_id: &str, folder_id: Option<&str>) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE episodes SET folder_id = ?1 WHERE id = ?2",
            params![folder_id, episode_id],
        )?;
        Ok(changed > 0)
    }

    pub fn set_episode_status(&self, episode_id: &str, status: EpisodeStatus) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE episodes SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![status.to_string(), episode_id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_episode(&self, episode_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM episodes WHERE id = ?1", params![episode_id])?;
        Ok(deleted > 0)
    }

    /// Move a batch of episodes in one transaction. Returns the first
    /// missing id, rolling back the whole batch, or None on success.
    pub fn bulk_move_episodes(
        &self,
        episode_ids: &[String],
        folder_id: Option<&str>,
    ) -> Result<Option<String>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for id in episode_ids {
            let changed = tx.execute(
                "UPDATE episodes SET folder_id = ?1 WHERE id = ?2",
                params![folder_id, id],
            )?;
            if changed == 0 {
                return Ok(Some(id.clone()));
            }
        }
        tx.commit()?;
        Ok(None)
    }

    /// Delete a batch of episodes in one transaction; all-or-nothing.
    pub fn bulk_delete_episodes(&self, episode_ids: &[String]) -> Result<Option<String>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for id in episode_ids {
            let deleted = tx.execute("DELETE FROM episodes WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Ok(Some(id.clone()));
            }
        }
        tx.commit()?;
        Ok(None)
    }

    // =========================================================================
    // Regeneration
    // =========================================================================

    /// Reset every chunk of an episode to pending and the episode itself to
    /// pending, clearing recorded audio metadata.
    pub fn reset_all_chunks(&self, episode_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let exists = tx.execute(
            "UPDATE episodes SET status = 'pending', total_duration_secs = NULL,
                    error_message = NULL, updated_at = datetime('now') WHERE id = ?1",
            params![episode_id],
        )?;
        if exists == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE chunks SET status = 'pending', audio_path = NULL,
                    duration_secs = NULL, error_message = NULL WHERE episode_id = ?1",
            params![episode_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Reset one chunk to pending. Returns the chunk as it was before the
    /// reset so the caller can delete its audio file.
    pub fn reset_chunk(&self, episode_id: &str, chunk_index: i64) -> Result<Option<Chunk>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let prior = tx
            .query_row(
                &format!("{CHUNK_SELECT} WHERE episode_id = ?1 AND chunk_index = ?2"),
                params![episode_id, chunk_index],
                chunk_from_row,
            )
            .optional()?;
        let Some(prior) = prior else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE chunks SET status = 'pending', audio_path = NULL,
                    duration_secs = NULL, error_message = NULL WHERE id = ?1",
            params![prior.id],
        )?;
        // The worker performs pending -> generating on pickup; an episode
        // that is mid-generation keeps its status.
        tx.execute(
            "UPDATE episodes SET status = CASE WHEN status = 'generating'
                    THEN 'generating' ELSE 'pending' END,
                    total_duration_secs = NULL, updated_at = datetime('now')
             WHERE id = ?1",
            params![episode_id],
        )?;
        tx.commit()?;
        Ok(Some(prior))
    }

    /// Reset every `error` chunk of an episode to pending. Returns the prior
    /// rows for best-effort file cleanup.
    pub fn reset_error_chunks(&self, episode_id: &str) -> Result<Vec<Chunk>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let prior: Vec<Chunk> = {
            let mut stmt = tx.prepare(&format!(
                "{CHUNK_SELECT} WHERE episode_id = ?1 AND status = 'error' ORDER BY chunk_index"
            ))?;
            let rows = stmt
                .query_map(params![episode_id], chunk_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        if prior.is_empty() {
            return Ok(prior);
        }
        tx.execute(
            "UPDATE chunks SET status = 'pending', audio_path = NULL,
                    duration_secs = NULL, error_message = NULL
             WHERE episode_id = ?1 AND status = 'error'",
            params![episode_id],
        )?;
        tx.execute(
            "UPDATE episodes SET status = 'pending', error_message = NULL,
                    total_duration_secs = NULL, updated_at = datetime('now') WHERE id = ?1",
            params![episode_id],
        )?;
        tx.commit()?;
        Ok(prior)
    }

    /// Atomically apply new generation settings and replace the chunk plan.
    pub fn replace_episode_plan(
        &self,
        episode_id: &str,
        settings: &EpisodeSettings,
        chunks: &[NewChunk],
    ) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE episodes SET voice_id = ?1, output_format = ?2, chunk_strategy = ?3,
                    chunk_max_chars = ?4, breathing_intensity = ?5, status = 'pending',
                    total_duration_secs = NULL, error_message = NULL,
                    updated_at = datetime('now')
             WHERE id = ?6",
            params![
                settings.voice_id,
                settings.output_format,
                settings.chunk_strategy,
                settings.chunk_max_chars,
                settings.breathing_intensity,
                episode_id,
            ],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute("DELETE FROM chunks WHERE episode_id = ?1", params![episode_id])?;
        insert_chunk_plan(&tx, episode_id, chunks)?;
        // The old plan is gone; keep the resume point in range.
        tx.execute(
            "UPDATE playback_state SET current_chunk_index = 0, position_secs = 0.0
             WHERE episode_id = ?1",
            params![episode_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Restore an episode to a previously captured snapshot (settings,
    /// status, and full chunk plan) in one transaction.
    pub fn restore_episode_snapshot(
        &self,
        episode_id: &str,
        snapshot: &EpisodeSnapshot,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE episodes SET voice_id = ?1, output_format = ?2, chunk_strategy = ?3,
                    chunk_max_chars = ?4, breathing_intensity = ?5, status = ?6,
                    total_duration_secs = ?7, updated_at = datetime('now')
             WHERE id = ?8",
            params![
                snapshot.voice_id,
                snapshot.output_format,
                snapshot.chunk_strategy,
                snapshot.chunk_max_chars,
                snapshot.breathing_intensity,
                snapshot.status.to_string(),
                snapshot.total_duration_secs,
                episode_id,
            ],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute("DELETE FROM chunks WHERE episode_id = ?1", params![episode_id])?;
        for chunk in &snapshot.chunks {
            tx.execute(
                "INSERT INTO chunks (id, episode_id, chunk_index, text, label, status,
                        duration_secs, audio_path, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    episode_id,
                    chunk.chunk_index,
                    chunk.text,
                    chunk.label,
                    chunk.status.to_string(),
                    chunk.duration_secs,
                    chunk.audio_path,
                    chunk.error_message,
                ],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    // =========================================================================
    // Worker operations
    // =========================================================================

    /// Claim the next pending chunk of an episode: transition the episode to
    /// generating on first pickup and the chunk pending -> generating, all in
    /// one transaction. Honors cancellation before the claim.
    pub fn claim_next_chunk(&self, episode_id: &str) -> Result<ChunkClaim> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM episodes WHERE id = ?1",
                params![episode_id],
                |row| row.get(0),
            )
            .optional()?;
        let status = match status {
            None => return Ok(ChunkClaim::Gone),
            Some(s) => EpisodeStatus::from(s),
        };
        if status == EpisodeStatus::Cancelled {
            return Ok(ChunkClaim::Cancelled);
        }

        let chunk = tx
            .query_row(
                &format!(
                    "{CHUNK_SELECT} WHERE episode_id = ?1 AND status = 'pending'
                     ORDER BY chunk_index LIMIT 1"
                ),
                params![episode_id],
                chunk_from_row,
            )
            .optional()?;
        let Some(chunk) = chunk else {
            return Ok(ChunkClaim::NonePending);
        };

        if status != EpisodeStatus::Generating {
            set_episode_status(&tx, episode_id, EpisodeStatus::Generating)?;
        }
        tx.execute(
            "UPDATE chunks SET status = 'generating' WHERE id = ?1",
            params![chunk.id],
        )?;
        tx.commit()?;
        Ok(ChunkClaim::Claimed(chunk))
    }

    /// Record a synthesized chunk. Re-checks cancellation inside the
    /// transaction: audio for an episode cancelled mid-synthesis is never
    /// marked ready, the chunk rolls back to pending instead.
    pub fn complete_chunk(
        &self,
        chunk_id: &str,
        audio_path: &str,
        duration_secs: f64,
    ) -> Result<ChunkCommit> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let Some(episode_id) = chunk_episode(&tx, chunk_id)? else {
            // Plan was replaced while synthesizing; drop the result.
            return Ok(ChunkCommit::Discarded);
        };
        if episode_cancelled(&tx, &episode_id)? {
            tx.execute(
                "UPDATE chunks SET status = 'pending', audio_path = NULL,
                        duration_secs = NULL, error_message = NULL WHERE id = ?1",
                params![chunk_id],
            )?;
            tx.commit()?;
            return Ok(ChunkCommit::Discarded);
        }

        tx.execute(
            "UPDATE chunks SET status = 'ready', audio_path = ?1, duration_secs = ?2,
                    error_message = NULL WHERE id = ?3",
            params![audio_path, duration_secs, chunk_id],
        )?;
        tx.commit()?;
        Ok(ChunkCommit::Recorded)
    }

    /// Record a synthesis failure on the chunk; the episode keeps going.
    pub fn fail_chunk(&self, chunk_id: &str, message: &str) -> Result<ChunkCommit> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let Some(episode_id) = chunk_episode(&tx, chunk_id)? else {
            return Ok(ChunkCommit::Discarded);
        };
        if episode_cancelled(&tx, &episode_id)? {
            tx.execute(
                "UPDATE chunks SET status = 'pending', error_message = NULL WHERE id = ?1",
                params![chunk_id],
            )?;
            tx.commit()?;
            return Ok(ChunkCommit::Discarded);
        }

        let message: String = message.chars().take(500).collect();
        tx.execute(
            "UPDATE chunks SET status = 'error', error_message = ?1, audio_path = NULL,
                    duration_secs = NULL WHERE id = ?2",
            params![message, chunk_id],
        )?;
        tx.commit()?;
        Ok(ChunkCommit::Recorded)
    }

    /// Re-evaluate an episode's aggregate chunk state once the worker finds
    /// no more pending chunks, and record the terminal status.
    pub fn finalize_episode(&self, episode_id: &str) -> Result<Option<EpisodeStatus>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM episodes WHERE id = ?1",
                params![episode_id],
                |row| row.get(0),
            )
            .optional()?;
        let status = match status {
            None => return Ok(None),
            Some(s) => EpisodeStatus::from(s),
        };
        if status == EpisodeStatus::Cancelled {
            return Ok(Some(EpisodeStatus::Cancelled));
        }

        let tally = chunk_tally(&tx, episode_id)?;
        if tally.pending > 0 || tally.generating > 0 {
            tx.commit()?;
            return Ok(Some(status));
        }
        let resulting = reconcile_terminal_status(&tx, episode_id, &tally, status)?;
        tx.commit()?;
        Ok(Some(resulting))
    }

    // =========================================================================
    // Folders
    // =========================================================================

    pub fn insert_folder(&self, folder: &Folder) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO folders (id, name, parent_id, sort_order) VALUES (?1, ?2, ?3, ?4)",
            params![folder.id, folder.name, folder.parent_id, folder.sort_order],
        )?;
        Ok(())
    }

    pub fn get_folder(&self, folder_id: &str) -> Result<Option<Folder>> {
        let conn = self.conn.lock().unwrap();
        let folder = conn
            .query_row(
                "SELECT id, name, parent_id, sort_order, created_at FROM folders WHERE id = ?1",
                params![folder_id],
                folder_from_row,
            )
            .optional()?;
        Ok(folder)
    }

    pub fn folder_exists(&self, folder_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM folders WHERE id = ?1",
                params![folder_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn list_folders(&self) -> Result<Vec<Folder>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, name, parent_id, sort_order, created_at FROM folders ORDER BY sort_order, name")?;
        let rows = stmt
            .query_map([], folder_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_folder(
        &self,
        folder_id: &str,
        name: Option<&str>,
        parent_id: Option<Option<&str>>,
        sort_order: Option<i64>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let mut updates = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(name) = name {
            updates.push(format!("name = ?{}", args.len() + 1));
            args.push(Box::new(name.to_string()));
        }
        if let Some(parent_id) = parent_id {
            updates.push(format!("parent_id = ?{}", args.len() + 1));
            args.push(Box::new(parent_id.map(str::to_string)));
        }
        if let Some(sort_order) = sort_order {
            updates.push(format!("sort_order = ?{}", args.len() + 1));
            args.push(Box::new(sort_order));
        }
        if updates.is_empty() {
            return Ok(false);
        }
        let query = format!(
            "UPDATE folders SET {} WHERE id = ?{}",
            updates.join(", "),
            args.len() + 1
        );
        args.push(Box::new(folder_id.to_string()));
        let changed = conn.execute(&query, rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())))?;
        Ok(changed > 0)
    }

    /// Delete a folder, re-parenting child folders and contained
    /// sources/episodes to the deleted folder's parent.
    pub fn delete_folder(&self, folder_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let parent: Option<Option<String>> = tx
            .query_row(
                "SELECT parent_id FROM folders WHERE id = ?1",
                params![folder_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(parent) = parent else {
            return Ok(false);
        };
        tx.execute(
            "UPDATE folders SET parent_id = ?1 WHERE parent_id = ?2",
            params![parent, folder_id],
        )?;
        tx.execute(
            "UPDATE sources SET folder_id = ?1 WHERE folder_id = ?2",
            params![parent, folder_id],
        )?;
        tx.execute(
            "UPDATE episodes SET folder_id = ?1 WHERE folder_id = ?2",
            params![parent, folder_id],
        )?;
        tx.execute("DELETE FROM folders WHERE id = ?1", params![folder_id])?;
        tx.commit()?;
        Ok(true)
    }

    // =========================================================================
    // Tags
    // =========================================================================

    pub fn insert_tag(&self, tag: &Tag) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO tags (id, name) VALUES (?1, ?2)",
            params![tag.id, tag.name],
        )?;
        if inserted == 0 {
            bail!("tag \"{}\" already exists", tag.name);
        }
        Ok(())
    }

    pub fn list_tags(&self) -> Result<Vec<Tag>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, name FROM tags ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Tag {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_tag(&self, tag_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM tags WHERE id = ?1", params![tag_id])?;
        Ok(deleted > 0)
    }

    /// Replace the full tag set of a source.
    pub fn set_source_tags(&self, source_id: &str, tag_ids: &[String]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM source_tags WHERE source_id = ?1", params![source_id])?;
        for tag_id in tag_ids {
            tx.execute(
                "INSERT INTO source_tags (source_id, tag_id) VALUES (?1, ?2)",
                params![source_id, tag_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Replace the full tag set of an episode.
    pub fn set_episode_tags(&self, episode_id: &str, tag_ids: &[String]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM episode_tags WHERE episode_id = ?1",
            params![episode_id],
        )?;
        for tag_id in tag_ids {
            tx.execute(
                "INSERT INTO episode_tags (episode_id, tag_id) VALUES (?1, ?2)",
                params![episode_id, tag_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // Playback
    // =========================================================================

    pub fn get_playback(&self, episode_id: &str) -> Result<Option<PlaybackState>> {
        let conn = self.conn.lock().unwrap();
        let state = conn
            .query_row(
                "SELECT episode_id, current_chunk_index, position_secs, percent_listened,
                        updated_at
                 FROM playback_state WHERE episode_id = ?1",
                params![episode_id],
                |row| {
                    Ok(PlaybackState {
                        episode_id: row.get(0)?,
                        current_chunk_index: row.get(1)?,
                        position_secs: row.get(2)?,
                        percent_listened: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    pub fn save_playback(
        &self,
        episode_id: &str,
        current_chunk_index: i64,
        position_secs: f64,
        percent_listened: f64,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO playback_state (episode_id, current_chunk_index, position_secs,
                    percent_listened, updated_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))
             ON CONFLICT(episode_id) DO UPDATE SET
                current_chunk_index = excluded.current_chunk_index,
                position_secs = excluded.position_secs,
                percent_listened = excluded.percent_listened,
                updated_at = excluded.updated_at",
            params![episode_id, current_chunk_index, position_secs, percent_listened],
        )?;
        tx.execute(
            "UPDATE episodes SET last_played_at = datetime('now') WHERE id = ?1",
            params![episode_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_all_settings(&self) -> Result<std::collections::HashMap<String, String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Undo tickets
    // =========================================================================

    pub fn insert_undo_ticket(&self, ticket: &UndoTicket, window_secs: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO undo_tickets (id, episode_id, operation_kind, inverse_payload,
                    backup_audio_dir, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, datetime('now', '+' || ?6 || ' seconds'))",
            params![
                ticket.id,
                ticket.episode_id,
                ticket.operation_kind,
                ticket.inverse_payload,
                ticket.backup_audio_dir,
                window_secs as i64,
            ],
        )?;
        Ok(())
    }

    /// Fetch a ticket together with whether it is already past its window.
    pub fn get_undo_ticket(&self, undo_id: &str) -> Result<Option<(UndoTicket, bool)>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, episode_id, operation_kind, inverse_payload, backup_audio_dir,
                        created_at, expires_at, (expires_at <= datetime('now'))
                 FROM undo_tickets WHERE id = ?1",
                params![undo_id],
                |row| {
                    Ok((
                        UndoTicket {
                            id: row.get(0)?,
                            episode_id: row.get(1)?,
                            operation_kind: row.get(2)?,
                            inverse_payload: row.get(3)?,
                            backup_audio_dir: row.get(4)?,
                            created_at: row.get(5)?,
                            expires_at: row.get(6)?,
                        },
                        row.get::<_, bool>(7)?,
                    ))
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn delete_undo_ticket(&self, undo_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM undo_tickets WHERE id = ?1", params![undo_id])?;
        Ok(deleted > 0)
    }

    /// Remove all expired tickets, returning their backup directories for
    /// best-effort on-disk cleanup.
    pub fn purge_expired_undo_tickets(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let dirs: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT backup_audio_dir FROM undo_tickets
                 WHERE expires_at <= datetime('now') AND backup_audio_dir IS NOT NULL",
            )?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            rows
        };
        tx.execute(
            "DELETE FROM undo_tickets WHERE expires_at <= datetime('now')",
            [],
        )?;
        tx.commit()?;
        Ok(dirs)
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub fn episode_status_counts(&self) -> Result<EpisodeStatusCounts> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM episodes GROUP BY status")?;
        let mut counts = EpisodeStatusCounts::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match EpisodeStatus::from(status) {
                EpisodeStatus::Pending => counts.pending = count,
                EpisodeStatus::Generating => counts.generating = count,
                EpisodeStatus::Ready => counts.ready = count,
                EpisodeStatus::Error => counts.error = count,
                EpisodeStatus::Cancelled => counts.cancelled = count,
            }
        }
        Ok(counts)
    }

    pub fn chunk_tally(&self, episode_id: &str) -> Result<ChunkTally> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM chunks WHERE episode_id = ?1 GROUP BY status",
        )?;
        let mut tally = ChunkTally::default();
        let rows = stmt.query_map(params![episode_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match ChunkStatus::from(status) {
                ChunkStatus::Pending => tally.pending = count,
                ChunkStatus::Generating => tally.generating = count,
                ChunkStatus::Ready => tally.ready = count,
                ChunkStatus::Error => tally.error = count,
            }
        }
        Ok(tally)
    }
}

/// Outcome of a worker's attempt to claim the next chunk of an episode.
#[derive(Debug)]
pub enum ChunkClaim {
    Claimed(Chunk),
    NonePending,
    Cancelled,
    Gone,
}

/// Outcome of committing a synthesis result.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkCommit {
    Recorded,
    Discarded,
}

/// A chunk about to be inserted as part of a plan.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub index: i64,
    pub text: String,
    pub label: String,
}

/// Generation settings applied by regenerate-with-settings.
#[derive(Debug, Clone)]
pub struct EpisodeSettings {
    pub voice_id: String,
    pub output_format: String,
    pub chunk_strategy: String,
    pub chunk_max_chars: i64,
    pub breathing_intensity: String,
}

/// Serialized into an undo ticket's inverse payload.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EpisodeSnapshot {
    pub voice_id: String,
    pub output_format: String,
    pub chunk_strategy: String,
    pub chunk_max_chars: i64,
    pub breathing_intensity: String,
    pub status: EpisodeStatus,
    pub total_duration_secs: Option<f64>,
    pub chunks: Vec<ChunkSnapshot>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChunkSnapshot {
    pub chunk_index: i64,
    pub text: String,
    pub label: String,
    pub status: ChunkStatus,
    pub duration_secs: Option<f64>,
    pub audio_path: Option<String>,
    pub error_message: Option<String>,
}

// ── Row mapping and shared fragments ───────────────────────────────────────

const EPISODE_SELECT: &str = "SELECT e.id, e.source_id, e.title, e.voice_id, e.output_format,
        e.chunk_strategy, e.chunk_max_chars, e.breathing_intensity, e.status,
        e.total_duration_secs, e.error_message, e.folder_id, e.created_at, e.updated_at,
        e.last_played_at, p.percent_listened
 FROM episodes e LEFT JOIN playback_state p ON e.id = p.episode_id";

const CHUNK_SELECT: &str = "SELECT id, episode_id, chunk_index, text, label, status,
        duration_secs, audio_path, error_message, created_at FROM chunks";

fn source_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get(0)?,
        title: row.get(1)?,
        source_type: SourceType::from(row.get::<_, String>(2)?),
        original_filename: row.get(3)?,
        original_url: row.get(4)?,
        raw_text: row.get(5)?,
        cleaned_text: row.get(6)?,
        cleaning_settings: row.get(7)?,
        cover_art: row.get(8)?,
        folder_id: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn episode_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    Ok(Episode {
        id: row.get(0)?,
        source_id: row.get(1)?,
        title: row.get(2)?,
        voice_id: row.get(3)?,
        output_format: row.get(4)?,
        chunk_strategy: row.get(5)?,
        chunk_max_chars: row.get(6)?,
        breathing_intensity: row.get(7)?,
        status: EpisodeStatus::from(row.get::<_, String>(8)?),
        total_duration_secs: row.get(9)?,
        error_message: row.get(10)?,
        folder_id: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        last_played_at: row.get(14)?,
        percent_listened: row.get(15)?,
    })
}

fn chunk_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        chunk_index: row.get(2)?,
        text: row.get(3)?,
        label: row.get(4)?,
        status: ChunkStatus::from(row.get::<_, String>(5)?),
        duration_secs: row.get(6)?,
        audio_path: row.get(7)?,
        error_message: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn folder_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Folder> {
    Ok(Folder {
        id: row.get(0)?,
        name: row.get(1)?,
        parent_id: row.get(2)?,
        sort_order: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn insert_chunk_plan(tx: &Transaction<'_>, episode_id: &str, chunks: &[NewChunk]) -> Result<()> {
    for chunk in chunks {
        tx.execute(
            "INSERT INTO chunks (id, episode_id, chunk_index, text, label, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
            params![
                uuid::Uuid::new_v4().to_string(),
                episode_id,
                chunk.index,
                chunk.text,
                chunk.label,
            ],
        )?;
    }
    Ok(())
}

fn set_episode_status(tx: &Transaction<'_>, episode_id: &str, status: EpisodeStatus) -> Result<()> {
    tx.execute(
        "UPDATE episodes SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![status.to_string(), episode_id],
    )?;
    Ok(())
}

fn chunk_episode(tx: &Transaction<'_>, chunk_id: &str) -> Result<Option<String>> {
    let episode_id = tx
        .query_row(
            "SELECT episode_id FROM chunks WHERE id = ?1",
            params![chunk_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(episode_id)
}

fn episode_cancelled(tx: &Transaction<'_>, episode_id: &str) -> Result<bool> {
    let status: Option<String> = tx
        .query_row(
            "SELECT status FROM episodes WHERE id = ?1",
            params![episode_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(matches!(
        status.map(EpisodeStatus::from),
        Some(EpisodeStatus::Cancelled) | None
    ))
}

fn chunk_tally(tx: &Transaction<'_>, episode_id: &str) -> Result<ChunkTally> {
    let mut stmt =
        tx.prepare("SELECT status, COUNT(*) FROM chunks WHERE episode_id = ?1 GROUP BY status")?;
    let mut tally = ChunkTally::default();
    let rows = stmt.query_map(params![episode_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    for row in rows {
        let (status, count) = row?;
        match ChunkStatus::from(status) {
            ChunkStatus::Pending => tally.pending = count,
            ChunkStatus::Generating => tally.generating = count,
            ChunkStatus::Ready => tally.ready = count,
            ChunkStatus::Error => tally.error = count,
        }
    }
    Ok(tally)
}

/// Bring an episode with no in-flight chunks into the terminal status its
/// chunk aggregate dictates: all ready -> ready with summed duration, any
/// error -> error with a summary message.
fn reconcile_terminal_status(
    tx: &Transaction<'_>,
    episode_id: &str,
    tally: &ChunkTally,
    current: EpisodeStatus,
) -> Result<EpisodeStatus> {
    if tally.total() == 0 {
        return Ok(current);
    }
    if tally.error > 0 {
        if current != EpisodeStatus::Error {
            tx.execute(
                "UPDATE episodes SET status = 'error', error_message = ?1,
                        updated_at = datetime('now') WHERE id = ?2",
                params![
                    format!("{} of {} chunk(s) failed", tally.error, tally.total()),
                    episode_id
                ],
            )?;
        }
        return Ok(EpisodeStatus::Error);
    }
    // All ready.
    let total: Option<f64> = tx.query_row(
        "SELECT SUM(duration_secs) FROM chunks WHERE episode_id = ?1",
        params![episode_id],
        |row| row.get(0),
    )?;
    tx.execute(
        "UPDATE episodes SET status = 'ready', total_duration_secs = ?1,
                error_message = NULL, updated_at = datetime('now') WHERE id = ?2",
        params![total, episode_id],
    )?;
    Ok(EpisodeStatus::Ready)
}
