pub mod api;
pub mod audio;
pub mod config;
pub mod database;
pub mod error;
pub mod ingest;
pub mod library;
pub mod text;
pub mod tts;
pub mod worker;

pub use config::Config;
pub use error::AppError;

use crate::audio::{Assembler, Encoder};
use crate::database::Database;
use crate::library::Library;
use crate::tts::Synthesizer;
use crate::worker::SynthesisWorker;
use anyhow::{Context, Result};
use std::sync::Arc;

/// Wire the whole service together: data directory, store (with startup
/// recovery before the worker exists), worker thread, and library service.
pub fn build(config: Config, synthesizer: Arc<dyn Synthesizer>) -> Result<Arc<Library>> {
    let config = Arc::new(config);
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("could not create data dir {:?}", config.data_dir))?;
    std::fs::create_dir_all(config.sources_dir())?;
    std::fs::create_dir_all(config.audio_dir())?;

    let db = Arc::new(Database::new(&config.db_path()).context("failed to open library.db")?);

    // Crash recovery runs before the worker thread starts: no chunk may
    // stay in `generating`, and episodes must agree with their chunks.
    let resumable = db.recover_interrupted().context("startup recovery failed")?;

    let worker = SynthesisWorker::spawn(db.clone(), synthesizer.clone(), config.audio_dir());
    for episode_id in &resumable {
        worker.enqueue(episode_id);
    }
    if !resumable.is_empty() {
        tracing::info!("Re-enqueued {} interrupted episode(s)", resumable.len());
    }

    let assembler = Arc::new(Assembler::new(
        config.audio_dir(),
        Encoder::new(config.ffmpeg_command.clone()),
    ));

    Ok(Arc::new(Library::new(
        config,
        db,
        worker,
        assembler,
        synthesizer,
    )))
}
