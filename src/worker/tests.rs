use super::*;
use crate::database::{ChunkStatus, Database, Episode, EpisodeStatus, NewChunk};
use crate::error::AppError;
use crate::tts::{PcmAudio, Voice, VoiceKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Scripted synthesizer: 0.1 s of audio per call, with markers in the
/// chunk text driving failures and mid-synthesis cancellation.
struct FakeSynth {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    cancel_target: Mutex<Option<(Arc<Database>, String)>>,
}

impl FakeSynth {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            cancel_target: Mutex::new(None),
        }
    }

    /// Make chunks whose text contains "CANCEL" flip the episode to
    /// cancelled while their synthesis is in flight.
    fn cancel_during(&self, db: Arc<Database>, episode_id: &str) {
        *self.cancel_target.lock().unwrap() = Some((db, episode_id.to_string()));
    }
}

impl Synthesizer for FakeSynth {
    fn synthesize(&self, text: &str, _voice_id: &str) -> Result<PcmAudio, AppError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(concurrent, Ordering::SeqCst);

        let result = if text.contains("FAIL") {
            Err(AppError::SynthesisFailed("scripted failure".to_string()))
        } else {
            if text.contains("CANCEL") {
                if let Some((db, episode_id)) = self.cancel_target.lock().unwrap().as_ref() {
                    db.set_episode_status(episode_id, EpisodeStatus::Cancelled)
                        .unwrap();
                }
            }
            Ok(PcmAudio {
                // Samples carry the call number so tests can tell whether a
                // file was rewritten.
                samples: vec![call as i16; 2400],
                sample_rate: 24_000,
                channels: 1,
            })
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn voices(&self) -> Vec<Voice> {
        vec![Voice {
            id: "test".to_string(),
            name: "Test".to_string(),
            kind: VoiceKind::Builtin,
        }]
    }
}

struct Fixture {
    db: Arc<Database>,
    synth: Arc<FakeSynth>,
    handle: WorkerHandle,
    audio_root: std::path::PathBuf,
    _temp: TempDir,
}

fn setup() -> Fixture {
    let temp = TempDir::new().unwrap();
    let db = Arc::new(Database::new(&temp.path().join("test.db")).unwrap());
    let audio_root = temp.path().join("audio");
    std::fs::create_dir_all(&audio_root).unwrap();
    let synth = Arc::new(FakeSynth::new());
    let handle = SynthesisWorker::spawn(db.clone(), synth.clone(), audio_root.clone());
    Fixture {
        db,
        synth,
        handle,
        audio_root,
        _temp: temp,
    }
}

fn seed_episode(db: &Database, episode_id: &str, chunk_texts: &[&str]) {
    let source_id = format!("src-{episode_id}");
    db.insert_source(&crate::database::Source {
        id: source_id.clone(),
        title: "Test source".to_string(),
        source_type: crate::database::SourceType::Text,
        original_filename: None,
        original_url: None,
        raw_text: chunk_texts.join("\n\n"),
        cleaned_text: chunk_texts.join("\n\n"),
        cleaning_settings: "{}".to_string(),
        cover_art: None,
        folder_id: None,
        created_at: String::new(),
        updated_at: String::new(),
    })
    .unwrap();

    let chunks: Vec<NewChunk> = chunk_texts
        .iter()
        .enumerate()
        .map(|(i, text)| NewChunk {
            index: i as i64,
            text: text.to_string(),
            label: format!("Part {}", i + 1),
        })
        .collect();
    db.insert_episode(
        &Episode {
            id: episode_id.to_string(),
            source_id,
            title: "Test episode".to_string(),
            voice_id: "test".to_string(),
            output_format: "wav".to_string(),
            chunk_strategy: "paragraph".to_string(),
            chunk_max_chars: 2000,
            breathing_intensity: "none".to_string(),
            status: EpisodeStatus::Pending,
            total_duration_secs: None,
            error_message: None,
            folder_id: None,
            created_at: String::new(),
            updated_at: String::new(),
            last_played_at: None,
            percent_listened: None,
        },
        &chunks,
    )
    .unwrap();
}

fn wait_for_status(db: &Database, episode_id: &str, wanted: EpisodeStatus) -> EpisodeStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = db.episode_status(episode_id).unwrap().unwrap();
        if status == wanted {
            return status;
        }
        if Instant::now() > deadline {
            panic!("episode {episode_id} stuck in {status}, wanted {wanted}");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn chunk_statuses(db: &Database, episode_id: &str) -> Vec<ChunkStatus> {
    db.chunks_for_episode(episode_id)
        .unwrap()
        .iter()
        .map(|c| c.status)
        .collect()
}

#[test]
fn drains_an_episode_to_ready() {
    let fx = setup();
    seed_episode(&fx.db, "ep1", &["Alpha.", "Beta.", "Gamma."]);
    fx.handle.enqueue("ep1");

    wait_for_status(&fx.db, "ep1", EpisodeStatus::Ready);

    let chunks = fx.db.chunks_for_episode("ep1").unwrap();
    assert_eq!(chunks.len(), 3);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.status, ChunkStatus::Ready);
        assert_eq!(chunk.chunk_index, i as i64);
        assert_eq!(chunk.audio_path.as_deref(), Some(format!("ep1/{i}.wav").as_str()));
        assert!(fx.audio_root.join(format!("ep1/{i}.wav")).is_file());
        assert!((chunk.duration_secs.unwrap() - 0.1).abs() < 1e-9);
    }

    let episode = fx.db.get_episode("ep1").unwrap().unwrap();
    let expected: f64 = chunks.iter().filter_map(|c| c.duration_secs).sum();
    assert!((episode.total_duration_secs.unwrap() - expected).abs() < 1e-9);
}

#[test]
fn chunk_failure_does_not_abort_the_episode() {
    let fx = setup();
    seed_episode(&fx.db, "ep2", &["Good one.", "This will FAIL.", "Still good."]);
    fx.handle.enqueue("ep2");

    wait_for_status(&fx.db, "ep2", EpisodeStatus::Error);

    let chunks = fx.db.chunks_for_episode("ep2").unwrap();
    assert_eq!(chunks[0].status, ChunkStatus::Ready);
    assert_eq!(chunks[1].status, ChunkStatus::Error);
    assert!(chunks[1].error_message.as_deref().unwrap().contains("scripted"));
    assert_eq!(chunks[2].status, ChunkStatus::Ready);

    let episode = fx.db.get_episode("ep2").unwrap().unwrap();
    assert!(episode.error_message.unwrap().contains("1 of 3"));
}

#[test]
fn cancellation_mid_synthesis_discards_the_in_flight_chunk() {
    let fx = setup();
    seed_episode(
        &fx.db,
        "ep3",
        &["One.", "Two.", "Three.", "CANCEL here.", "Five."],
    );
    fx.synth.cancel_during(fx.db.clone(), "ep3");
    fx.handle.enqueue("ep3");

    wait_for_status(&fx.db, "ep3", EpisodeStatus::Cancelled);
    // Give the worker a beat to roll back the in-flight chunk.
    let deadline = Instant::now() + Duration::from_secs(5);
    while chunk_statuses(&fx.db, "ep3")
        .iter()
        .any(|s| *s == ChunkStatus::Generating)
    {
        assert!(Instant::now() < deadline, "chunk stuck in generating");
        std::thread::sleep(Duration::from_millis(10));
    }

    let statuses = chunk_statuses(&fx.db, "ep3");
    assert_eq!(
        statuses,
        vec![
            ChunkStatus::Ready,
            ChunkStatus::Ready,
            ChunkStatus::Ready,
            ChunkStatus::Pending,
            ChunkStatus::Pending,
        ]
    );
    // PCM synthesized for the cancelled chunk is not kept on disk. The
    // rollback commits before the file unlink, so poll briefly.
    let discarded = fx.audio_root.join("ep3/3.wav");
    let deadline = Instant::now() + Duration::from_secs(5);
    while discarded.exists() {
        assert!(Instant::now() < deadline, "discarded chunk audio still on disk");
        std::thread::sleep(Duration::from_millis(10));
    }
    // Audio already on disk from completed chunks is preserved.
    assert!(fx.audio_root.join("ep3/2.wav").is_file());
}

#[test]
fn crash_recovery_resets_generating_chunks_and_resumes() {
    let fx = setup();
    seed_episode(&fx.db, "ep4", &["A.", "B.", "C.", "D.", "E."]);

    // Simulate a crash mid-chunk-2: episode generating, chunks 0-1 ready,
    // chunk 2 stuck in generating.
    fx.db.set_episode_status("ep4", EpisodeStatus::Generating).unwrap();
    for index in 0..2 {
        let chunk = fx.db.get_chunk_by_index("ep4", index).unwrap().unwrap();
        fx.db
            .complete_chunk(&chunk.id, &format!("ep4/{index}.wav"), 0.1)
            .unwrap();
    }
    let claimed = fx.db.claim_next_chunk("ep4").unwrap();
    match claimed {
        crate::database::ChunkClaim::Claimed(chunk) => assert_eq!(chunk.chunk_index, 2),
        other => panic!("expected to claim chunk 2, got {other:?}"),
    }

    let requeue = fx.db.recover_interrupted().unwrap();
    assert!(requeue.contains(&"ep4".to_string()));

    let statuses = chunk_statuses(&fx.db, "ep4");
    assert_eq!(statuses[2], ChunkStatus::Pending);
    assert!(statuses.iter().all(|s| *s != ChunkStatus::Generating));
    assert_eq!(
        fx.db.episode_status("ep4").unwrap().unwrap(),
        EpisodeStatus::Generating
    );

    // The worker picks chunk 2 back up and finishes the episode.
    fx.handle.enqueue("ep4");
    wait_for_status(&fx.db, "ep4", EpisodeStatus::Ready);
}

#[test]
fn at_most_one_chunk_synthesizes_at_a_time() {
    let fx = setup();
    for i in 0..4 {
        seed_episode(&fx.db, &format!("par{i}"), &["One.", "Two.", "Three."]);
        fx.handle.enqueue(&format!("par{i}"));
    }
    for i in 0..4 {
        wait_for_status(&fx.db, &format!("par{i}"), EpisodeStatus::Ready);
    }
    assert_eq!(fx.synth.max_in_flight.load(Ordering::SeqCst), 1);
}

#[test]
fn completion_order_matches_admission_order() {
    let fx = setup();
    seed_episode(&fx.db, "first", &["A.", "B."]);
    seed_episode(&fx.db, "second", &["C.", "D."]);
    fx.handle.enqueue("first");
    fx.handle.enqueue("second");

    wait_for_status(&fx.db, "second", EpisodeStatus::Ready);
    // By the time the second episode is done, the first must be too.
    assert_eq!(
        fx.db.episode_status("first").unwrap().unwrap(),
        EpisodeStatus::Ready
    );
}

#[test]
fn selective_regeneration_preserves_sibling_audio() {
    let fx = setup();
    seed_episode(&fx.db, "ep5", &["A.", "B.", "C.", "D.", "E."]);
    fx.handle.enqueue("ep5");
    wait_for_status(&fx.db, "ep5", EpisodeStatus::Ready);

    let before: Vec<Vec<u8>> = (0..5)
        .map(|i| std::fs::read(fx.audio_root.join(format!("ep5/{i}.wav"))).unwrap())
        .collect();

    let prior = fx.db.reset_chunk("ep5", 3).unwrap().unwrap();
    assert_eq!(prior.status, ChunkStatus::Ready);
    fx.handle.enqueue("ep5");
    wait_for_status(&fx.db, "ep5", EpisodeStatus::Ready);

    let after: Vec<Vec<u8>> = (0..5)
        .map(|i| std::fs::read(fx.audio_root.join(format!("ep5/{i}.wav"))).unwrap())
        .collect();

    for i in [0usize, 1, 2, 4] {
        assert_eq!(before[i], after[i], "sibling chunk {i} was rewritten");
    }
    assert_ne!(before[3], after[3], "chunk 3 should have fresh audio");

    let statuses = chunk_statuses(&fx.db, "ep5");
    assert!(statuses.iter().all(|s| *s == ChunkStatus::Ready));
}

#[test]
fn snapshot_reports_queue_and_current_work() {
    let fx = setup();
    let empty = fx.handle.snapshot();
    assert_eq!(empty.queue_size, 0);
    assert!(empty.current_episode_id.is_none());

    seed_episode(&fx.db, "ep6", &["Only."]);
    fx.handle.enqueue("ep6");
    wait_for_status(&fx.db, "ep6", EpisodeStatus::Ready);

    let done = fx.handle.snapshot();
    assert_eq!(done.queue_size, 0);
}
