//! Background generation queue: a single cooperative worker thread drains a
//! FIFO of episode ids and synthesizes their chunks in ascending index
//! order.
//!
//! Exactly one thread owns the TTS model, which makes the "at most one
//! chunk generating" invariant hold by construction. The queue is unbounded
//! (intake is human-paced) and the worker never holds more than one chunk's
//! PCM in memory. Synthesis failures are recorded on the chunk and the
//! episode keeps going; the worker never raises to a caller.

#[cfg(test)]
mod tests;

use crate::audio;
use crate::database::{ChunkClaim, ChunkCommit, Database};
use crate::tts::Synthesizer;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// The chunk currently on the synthesizer.
#[derive(Debug, Clone)]
struct ActiveChunk {
    episode_id: String,
    chunk_index: i64,
    started_at: DateTime<Utc>,
}

/// Point-in-time view of the worker for status polling.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub queue_size: usize,
    pub current_episode_id: Option<String>,
    pub current_chunk_index: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Cheap cloneable handle for enqueueing work and reading the snapshot.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<String>,
    queued: Arc<AtomicUsize>,
    current: Arc<Mutex<Option<ActiveChunk>>>,
}

impl WorkerHandle {
    /// Admit an episode to the tail of the queue. Re-admitting an episode
    /// is harmless: a pass that finds no pending chunks just re-evaluates
    /// the aggregate state.
    pub fn enqueue(&self, episode_id: &str) {
        if self.tx.send(episode_id.to_string()).is_ok() {
            self.queued.fetch_add(1, Ordering::SeqCst);
            tracing::info!("Episode {} enqueued for generation", episode_id);
        } else {
            tracing::error!("Worker is gone; cannot enqueue episode {}", episode_id);
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let current = self.current.lock().unwrap().clone();
        WorkerSnapshot {
            queue_size: self.queued.load(Ordering::SeqCst),
            current_episode_id: current.as_ref().map(|c| c.episode_id.clone()),
            current_chunk_index: current.as_ref().map(|c| c.chunk_index),
            started_at: current.as_ref().map(|c| c.started_at),
        }
    }
}

pub struct SynthesisWorker {
    db: Arc<Database>,
    synthesizer: Arc<dyn Synthesizer>,
    audio_root: PathBuf,
    queued: Arc<AtomicUsize>,
    current: Arc<Mutex<Option<ActiveChunk>>>,
}

impl SynthesisWorker {
    /// Start the worker thread and return the handle used to feed it.
    /// Callers run crash recovery first and enqueue whatever it returns.
    pub fn spawn(
        db: Arc<Database>,
        synthesizer: Arc<dyn Synthesizer>,
        audio_root: PathBuf,
    ) -> WorkerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(Mutex::new(None));

        let worker = SynthesisWorker {
            db,
            synthesizer,
            audio_root,
            queued: queued.clone(),
            current: current.clone(),
        };
        std::thread::Builder::new()
            .name("synthesis-worker".to_string())
            .spawn(move || worker.run(rx))
            .expect("failed to spawn synthesis worker thread");

        WorkerHandle {
            tx,
            queued,
            current,
        }
    }

    fn run(&self, mut rx: mpsc::UnboundedReceiver<String>) {
        tracing::info!("Synthesis worker started");
        while let Some(episode_id) = rx.blocking_recv() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.process_episode(&episode_id);
            *self.current.lock().unwrap() = None;
        }
        tracing::info!("Synthesis worker stopped");
    }

    /// One pass over an episode: claim pending chunks lowest-index first
    /// until none remain, then settle the aggregate status. Cancellation is
    /// honored at both the claim and the commit.
    fn process_episode(&self, episode_id: &str) {
        loop {
            let claim = match self.db.claim_next_chunk(episode_id) {
                Ok(claim) => claim,
                Err(e) => {
                    tracing::error!("Claim failed for episode {}: {}", episode_id, e);
                    return;
                }
            };
            let chunk = match claim {
                ChunkClaim::Gone => return,
                ChunkClaim::Cancelled => {
                    tracing::info!("Episode {} cancelled; leaving the queue", episode_id);
                    return;
                }
                ChunkClaim::NonePending => {
                    match self.db.finalize_episode(episode_id) {
                        Ok(Some(status)) => {
                            tracing::info!("Episode {} finalized as {}", episode_id, status)
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!("Could not finalize episode {}: {}", episode_id, e)
                        }
                    }
                    return;
                }
                ChunkClaim::Claimed(chunk) => chunk,
            };

            *self.current.lock().unwrap() = Some(ActiveChunk {
                episode_id: episode_id.to_string(),
                chunk_index: chunk.chunk_index,
                started_at: Utc::now(),
            });

            // Voice can change between passes (regenerate-with-settings), so
            // read it per chunk rather than per episode.
            let voice_id = match self.db.get_episode(episode_id) {
                Ok(Some(episode)) => episode.voice_id,
                _ => {
                    // Episode vanished after the claim; nothing to record.
                    return;
                }
            };

            tracing::info!(
                "Generating chunk {} of episode {} ({} chars)",
                chunk.chunk_index,
                episode_id,
                chunk.text.chars().count()
            );

            // The TTS call blocks and may take seconds; no database lock is
            // held across it.
            let started = std::time::Instant::now();
            match self.synthesizer.synthesize(&chunk.text, &voice_id) {
                Ok(pcm) => {
                    let relative = format!("{}/{}.wav", episode_id, chunk.chunk_index);
                    let path = self.audio_root.join(&relative);
                    if let Some(parent) = path.parent() {
                        if let Err(e) = std::fs::create_dir_all(parent) {
                            tracing::error!("Could not create {:?}: {}", parent, e);
                            self.record_failure(&chunk.id, &e.to_string());
                            continue;
                        }
                    }
                    if let Err(e) = audio::write_wav(&path, &pcm) {
                        tracing::error!("Could not persist chunk audio {:?}: {}", path, e);
                        self.record_failure(&chunk.id, &e.to_string());
                        continue;
                    }

                    let duration = pcm.duration_secs();
                    match self.db.complete_chunk(&chunk.id, &relative, duration) {
                        Ok(ChunkCommit::Recorded) => {
                            tracing::info!(
                                "Chunk {} ready: {:.1}s audio in {:.1}s",
                                chunk.chunk_index,
                                duration,
                                started.elapsed().as_secs_f64()
                            );
                        }
                        Ok(ChunkCommit::Discarded) => {
                            // Cancelled (or plan replaced) while synthesizing:
                            // the PCM must not survive as a ready chunk.
                            if let Err(e) = std::fs::remove_file(&path) {
                                tracing::warn!("Could not remove {:?}: {}", path, e);
                            }
                            tracing::info!(
                                "Discarded chunk {} of episode {} after cancellation",
                                chunk.chunk_index,
                                episode_id
                            );
                            return;
                        }
                        Err(e) => {
                            tracing::error!("Could not record chunk {}: {}", chunk.id, e);
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Synthesis failed for chunk {} of episode {}: {}",
                        chunk.chunk_index,
                        episode_id,
                        e
                    );
                    if !self.record_failure(&chunk.id, &e.to_string()) {
                        return;
                    }
                }
            }
        }
    }

    /// Record a chunk failure; returns false when the episode was cancelled
    /// underneath us and the pass should stop.
    fn record_failure(&self, chunk_id: &str, message: &str) -> bool {
        match self.db.fail_chunk(chunk_id, message) {
            Ok(ChunkCommit::Recorded) => true,
            Ok(ChunkCommit::Discarded) => false,
            Err(e) => {
                tracing::error!("Could not record failure for chunk {}: {}", chunk_id, e);
                false
            }
        }
    }
}
