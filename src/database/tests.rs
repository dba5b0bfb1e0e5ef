use crate::database::*;
use tempfile::TempDir;

fn setup_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::new(&db_path).unwrap();
    (db, temp_dir)
}

fn sample_source(id: &str) -> Source {
    Source {
        id: id.to_string(),
        title: "Sample".to_string(),
        source_type: SourceType::Text,
        original_filename: None,
        original_url: None,
        raw_text: "raw".to_string(),
        cleaned_text: "cleaned".to_string(),
        cleaning_settings: "{}".to_string(),
        cover_art: None,
        folder_id: None,
        created_at: String::new(),
        updated_at: String::new(),
    }
}

fn sample_episode(id: &str, source_id: &str) -> Episode {
    Episode {
        id: id.to_string(),
        source_id: source_id.to_string(),
        title: "Episode".to_string(),
        voice_id: "alba".to_string(),
        output_format: "wav".to_string(),
        chunk_strategy: "paragraph".to_string(),
        chunk_max_chars: 2000,
        breathing_intensity: "normal".to_string(),
        status: EpisodeStatus::Pending,
        total_duration_secs: None,
        error_message: None,
        folder_id: None,
        created_at: String::new(),
        updated_at: String::new(),
        last_played_at: None,
        percent_listened: None,
    }
}

fn chunks_of(texts: &[&str]) -> Vec<NewChunk> {
    texts
        .iter()
        .enumerate()
        .map(|(i, text)| NewChunk {
            index: i as i64,
            text: text.to_string(),
            label: format!("Part {}", i + 1),
        })
        .collect()
}

fn seed(db: &Database, episode_id: &str, n: usize) {
    let source_id = format!("src-{episode_id}");
    db.insert_source(&sample_source(&source_id)).unwrap();
    let texts: Vec<String> = (0..n).map(|i| format!("Chunk {i}.")).collect();
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    db.insert_episode(&sample_episode(episode_id, &source_id), &chunks_of(&refs))
        .unwrap();
}

// =========================================================================
// Schema and settings
// =========================================================================

#[test]
fn schema_seeds_default_settings() {
    let (db, _temp) = setup_test_db();
    let settings = db.get_all_settings().unwrap();
    assert_eq!(settings.get("default_voice").map(String::as_str), Some("alba"));
    assert_eq!(
        settings.get("default_chunk_strategy").map(String::as_str),
        Some("paragraph")
    );
}

#[test]
fn settings_upsert_replaces_value() {
    let (db, _temp) = setup_test_db();
    db.set_setting("default_voice", "marius").unwrap();
    assert_eq!(db.get_setting("default_voice").unwrap().unwrap(), "marius");
    assert_eq!(db.get_setting("missing_key").unwrap(), None);
}

#[test]
fn reopening_the_database_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("test.db");
    {
        let db = Database::new(&path).unwrap();
        db.insert_source(&sample_source("s1")).unwrap();
    }
    let db = Database::new(&path).unwrap();
    assert!(db.get_source("s1").unwrap().is_some());
}

// =========================================================================
// Sources
// =========================================================================

#[test]
fn source_round_trip() {
    let (db, _temp) = setup_test_db();
    db.insert_source(&sample_source("s1")).unwrap();
    let source = db.get_source("s1").unwrap().unwrap();
    assert_eq!(source.title, "Sample");
    assert_eq!(source.cleaned_text, "cleaned");
    assert!(db.get_source("nope").unwrap().is_none());
}

#[test]
fn re_cleaning_replaces_text_in_place() {
    let (db, _temp) = setup_test_db();
    db.insert_source(&sample_source("s1")).unwrap();
    assert!(db
        .update_source_cleaned_text("s1", "better", "{\"speak_urls\":false}")
        .unwrap());
    let source = db.get_source("s1").unwrap().unwrap();
    assert_eq!(source.id, "s1");
    assert_eq!(source.cleaned_text, "better");
    assert_eq!(source.raw_text, "raw");
}

#[test]
fn deleting_a_source_cascades_to_episodes_and_chunks() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 3);
    let deleted = db.delete_source("src-e1").unwrap().unwrap();
    assert_eq!(deleted, vec!["e1".to_string()]);
    assert!(db.get_episode("e1").unwrap().is_none());
    assert!(db.chunks_for_episode("e1").unwrap().is_empty());
    assert!(db.get_playback("e1").unwrap().is_none());
}

// =========================================================================
// Episodes and chunk plans
// =========================================================================

#[test]
fn chunk_indices_are_dense_and_zero_based() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 5);
    let chunks = db.chunks_for_episode("e1").unwrap();
    let indices: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    assert!(chunks.iter().all(|c| c.status == ChunkStatus::Pending));
}

#[test]
fn episode_insert_creates_playback_row() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 1);
    let playback = db.get_playback("e1").unwrap().unwrap();
    assert_eq!(playback.current_chunk_index, 0);
    assert_eq!(playback.percent_listened, 0.0);
}

#[test]
fn bulk_move_rolls_back_on_missing_episode() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 1);
    seed(&db, "e2", 1);
    db.insert_folder(&Folder {
        id: "f1".to_string(),
        name: "Folder".to_string(),
        parent_id: None,
        sort_order: 0,
        created_at: String::new(),
    })
    .unwrap();

    let missing = db
        .bulk_move_episodes(
            &["e1".to_string(), "ghost".to_string(), "e2".to_string()],
            Some("f1"),
        )
        .unwrap();
    assert_eq!(missing.as_deref(), Some("ghost"));
    // Nothing moved.
    assert_eq!(db.get_episode("e1").unwrap().unwrap().folder_id, None);

    let ok = db
        .bulk_move_episodes(&["e1".to_string(), "e2".to_string()], Some("f1"))
        .unwrap();
    assert!(ok.is_none());
    assert_eq!(
        db.get_episode("e2").unwrap().unwrap().folder_id.as_deref(),
        Some("f1")
    );
}

#[test]
fn bulk_delete_is_all_or_nothing() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 1);
    let missing = db
        .bulk_delete_episodes(&["e1".to_string(), "ghost".to_string()])
        .unwrap();
    assert_eq!(missing.as_deref(), Some("ghost"));
    assert!(db.get_episode("e1").unwrap().is_some());
}

// =========================================================================
// Worker claim/commit cycle
// =========================================================================

#[test]
fn claim_takes_lowest_pending_and_marks_generating() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 3);

    let claim = db.claim_next_chunk("e1").unwrap();
    let chunk = match claim {
        ChunkClaim::Claimed(chunk) => chunk,
        other => panic!("expected a claim, got {other:?}"),
    };
    assert_eq!(chunk.chunk_index, 0);
    assert_eq!(
        db.episode_status("e1").unwrap().unwrap(),
        EpisodeStatus::Generating
    );
    let stored = db.get_chunk_by_index("e1", 0).unwrap().unwrap();
    assert_eq!(stored.status, ChunkStatus::Generating);

    let tally = db.chunk_tally("e1").unwrap();
    assert_eq!(tally.generating, 1);
    assert_eq!(tally.pending, 2);
    assert_eq!(tally.total(), 3);
}

#[test]
fn complete_and_finalize_reach_ready_with_summed_duration() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 2);
    for index in 0..2 {
        let claim = db.claim_next_chunk("e1").unwrap();
        let chunk = match claim {
            ChunkClaim::Claimed(chunk) => chunk,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(chunk.chunk_index, index);
        let committed = db
            .complete_chunk(&chunk.id, &format!("e1/{index}.wav"), 1.5)
            .unwrap();
        assert_eq!(committed, ChunkCommit::Recorded);
    }
    assert!(matches!(
        db.claim_next_chunk("e1").unwrap(),
        ChunkClaim::NonePending
    ));
    let status = db.finalize_episode("e1").unwrap().unwrap();
    assert_eq!(status, EpisodeStatus::Ready);
    let episode = db.get_episode("e1").unwrap().unwrap();
    assert!((episode.total_duration_secs.unwrap() - 3.0).abs() < 1e-9);
}

#[test]
fn commit_after_cancellation_rolls_the_chunk_back() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 1);
    let chunk = match db.claim_next_chunk("e1").unwrap() {
        ChunkClaim::Claimed(chunk) => chunk,
        other => panic!("unexpected {other:?}"),
    };
    db.set_episode_status("e1", EpisodeStatus::Cancelled).unwrap();

    let committed = db.complete_chunk(&chunk.id, "e1/0.wav", 1.0).unwrap();
    assert_eq!(committed, ChunkCommit::Discarded);
    let stored = db.get_chunk_by_index("e1", 0).unwrap().unwrap();
    assert_eq!(stored.status, ChunkStatus::Pending);
    assert!(stored.audio_path.is_none());
}

#[test]
fn claim_refuses_cancelled_episodes() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 2);
    db.set_episode_status("e1", EpisodeStatus::Cancelled).unwrap();
    assert!(matches!(
        db.claim_next_chunk("e1").unwrap(),
        ChunkClaim::Cancelled
    ));
    assert!(matches!(
        db.claim_next_chunk("ghost").unwrap(),
        ChunkClaim::Gone
    ));
}

#[test]
fn failed_chunks_keep_truncated_messages_and_finalize_as_error() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 2);

    let first = match db.claim_next_chunk("e1").unwrap() {
        ChunkClaim::Claimed(chunk) => chunk,
        other => panic!("unexpected {other:?}"),
    };
    db.complete_chunk(&first.id, "e1/0.wav", 1.0).unwrap();

    let second = match db.claim_next_chunk("e1").unwrap() {
        ChunkClaim::Claimed(chunk) => chunk,
        other => panic!("unexpected {other:?}"),
    };
    let long_message = "x".repeat(2000);
    db.fail_chunk(&second.id, &long_message).unwrap();

    let status = db.finalize_episode("e1").unwrap().unwrap();
    assert_eq!(status, EpisodeStatus::Error);
    let stored = db.get_chunk_by_index("e1", 1).unwrap().unwrap();
    assert_eq!(stored.status, ChunkStatus::Error);
    assert_eq!(stored.error_message.unwrap().chars().count(), 500);
}

// =========================================================================
// Startup recovery
// =========================================================================

#[test]
fn recovery_resets_generating_chunks() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 3);
    db.claim_next_chunk("e1").unwrap();

    let requeue = db.recover_interrupted().unwrap();
    assert_eq!(requeue, vec!["e1".to_string()]);
    let chunks = db.chunks_for_episode("e1").unwrap();
    assert!(chunks.iter().all(|c| c.status == ChunkStatus::Pending));
    assert_eq!(
        db.episode_status("e1").unwrap().unwrap(),
        EpisodeStatus::Generating
    );
}

#[test]
fn recovery_reconciles_episode_status_with_chunk_aggregate() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 1);

    // All chunks ready but episode still says generating.
    let chunk = match db.claim_next_chunk("e1").unwrap() {
        ChunkClaim::Claimed(chunk) => chunk,
        other => panic!("unexpected {other:?}"),
    };
    db.complete_chunk(&chunk.id, "e1/0.wav", 2.0).unwrap();
    assert_eq!(
        db.episode_status("e1").unwrap().unwrap(),
        EpisodeStatus::Generating
    );

    let requeue = db.recover_interrupted().unwrap();
    assert!(requeue.is_empty());
    assert_eq!(
        db.episode_status("e1").unwrap().unwrap(),
        EpisodeStatus::Ready
    );
    let episode = db.get_episode("e1").unwrap().unwrap();
    assert!((episode.total_duration_secs.unwrap() - 2.0).abs() < 1e-9);
}

#[test]
fn recovery_leaves_cancelled_episodes_alone() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 2);
    db.set_episode_status("e1", EpisodeStatus::Cancelled).unwrap();
    let requeue = db.recover_interrupted().unwrap();
    assert!(requeue.is_empty());
    assert_eq!(
        db.episode_status("e1").unwrap().unwrap(),
        EpisodeStatus::Cancelled
    );
}

// =========================================================================
// Regeneration plumbing
// =========================================================================

#[test]
fn reset_chunk_returns_prior_state() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 2);
    let chunk = match db.claim_next_chunk("e1").unwrap() {
        ChunkClaim::Claimed(chunk) => chunk,
        other => panic!("unexpected {other:?}"),
    };
    db.complete_chunk(&chunk.id, "e1/0.wav", 1.0).unwrap();

    let prior = db.reset_chunk("e1", 0).unwrap().unwrap();
    assert_eq!(prior.status, ChunkStatus::Ready);
    assert_eq!(prior.audio_path.as_deref(), Some("e1/0.wav"));

    let stored = db.get_chunk_by_index("e1", 0).unwrap().unwrap();
    assert_eq!(stored.status, ChunkStatus::Pending);
    assert!(db.reset_chunk("e1", 99).unwrap().is_none());
}

#[test]
fn replace_plan_swaps_chunks_atomically() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 2);
    let settings = EpisodeSettings {
        voice_id: "marius".to_string(),
        output_format: "mp3".to_string(),
        chunk_strategy: "sentence".to_string(),
        chunk_max_chars: 500,
        breathing_intensity: "heavy".to_string(),
    };
    assert!(db
        .replace_episode_plan("e1", &settings, &chunks_of(&["New A.", "New B.", "New C."]))
        .unwrap());

    let episode = db.get_episode("e1").unwrap().unwrap();
    assert_eq!(episode.voice_id, "marius");
    assert_eq!(episode.chunk_strategy, "sentence");
    assert_eq!(episode.status, EpisodeStatus::Pending);
    let chunks = db.chunks_for_episode("e1").unwrap();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].text, "New A.");
}

#[test]
fn snapshot_restore_brings_back_settings_and_chunks() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 1);
    let snapshot = EpisodeSnapshot {
        voice_id: "alba".to_string(),
        output_format: "wav".to_string(),
        chunk_strategy: "paragraph".to_string(),
        chunk_max_chars: 2000,
        breathing_intensity: "normal".to_string(),
        status: EpisodeStatus::Ready,
        total_duration_secs: Some(4.0),
        chunks: vec![
            ChunkSnapshot {
                chunk_index: 0,
                text: "Old text.".to_string(),
                label: "Part 1".to_string(),
                status: ChunkStatus::Ready,
                duration_secs: Some(4.0),
                audio_path: Some("e1/0.wav".to_string()),
                error_message: None,
            },
        ],
    };
    assert!(db.restore_episode_snapshot("e1", &snapshot).unwrap());

    let episode = db.get_episode("e1").unwrap().unwrap();
    assert_eq!(episode.status, EpisodeStatus::Ready);
    assert_eq!(episode.total_duration_secs, Some(4.0));
    let chunks = db.chunks_for_episode("e1").unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].text, "Old text.");
    assert_eq!(chunks[0].status, ChunkStatus::Ready);
}

// =========================================================================
// Undo tickets
// =========================================================================

fn ticket(id: &str) -> UndoTicket {
    UndoTicket {
        id: id.to_string(),
        episode_id: "e1".to_string(),
        operation_kind: "regenerate_with_settings".to_string(),
        inverse_payload: "{}".to_string(),
        backup_audio_dir: Some(format!("/tmp/.backup_{id}")),
        created_at: String::new(),
        expires_at: String::new(),
    }
}

#[test]
fn fresh_tickets_are_not_expired() {
    let (db, _temp) = setup_test_db();
    db.insert_undo_ticket(&ticket("u1"), 120).unwrap();
    let (_stored, expired) = db.get_undo_ticket("u1").unwrap().unwrap();
    assert!(!expired);
    assert!(db.get_undo_ticket("nope").unwrap().is_none());
}

#[test]
fn zero_window_tickets_expire_immediately_and_purge() {
    let (db, _temp) = setup_test_db();
    db.insert_undo_ticket(&ticket("u1"), 0).unwrap();
    let (_stored, expired) = db.get_undo_ticket("u1").unwrap().unwrap();
    assert!(expired);

    let dirs = db.purge_expired_undo_tickets().unwrap();
    assert_eq!(dirs, vec!["/tmp/.backup_u1".to_string()]);
    assert!(db.get_undo_ticket("u1").unwrap().is_none());
}

// =========================================================================
// Folders and tags
// =========================================================================

#[test]
fn deleting_a_folder_reparents_children_and_contents() {
    let (db, _temp) = setup_test_db();
    for (id, parent) in [("root", None), ("mid", Some("root")), ("leaf", Some("mid"))] {
        db.insert_folder(&Folder {
            id: id.to_string(),
            name: id.to_string(),
            parent_id: parent.map(str::to_string),
            sort_order: 0,
            created_at: String::new(),
        })
        .unwrap();
    }
    seed(&db, "e1", 1);
    db.set_episode_folder("e1", Some("mid")).unwrap();
    db.set_source_folder("src-e1", Some("mid")).unwrap();

    assert!(db.delete_folder("mid").unwrap());

    let leaf = db.get_folder("leaf").unwrap().unwrap();
    assert_eq!(leaf.parent_id.as_deref(), Some("root"));
    assert_eq!(
        db.get_episode("e1").unwrap().unwrap().folder_id.as_deref(),
        Some("root")
    );
    let sources = db.list_sources(Some("root"), None).unwrap();
    assert_eq!(sources.len(), 1);
}

#[test]
fn tag_names_are_unique() {
    let (db, _temp) = setup_test_db();
    db.insert_tag(&Tag {
        id: "t1".to_string(),
        name: "rust".to_string(),
    })
    .unwrap();
    let duplicate = db.insert_tag(&Tag {
        id: "t2".to_string(),
        name: "rust".to_string(),
    });
    assert!(duplicate.is_err());
}

#[test]
fn source_tags_replace_the_full_set() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 1);
    for (id, name) in [("t1", "a"), ("t2", "b")] {
        db.insert_tag(&Tag {
            id: id.to_string(),
            name: name.to_string(),
        })
        .unwrap();
    }
    db.set_source_tags("src-e1", &["t1".to_string(), "t2".to_string()])
        .unwrap();
    assert_eq!(db.list_sources(None, Some("a")).unwrap().len(), 1);

    db.set_source_tags("src-e1", &["t2".to_string()]).unwrap();
    assert!(db.list_sources(None, Some("a")).unwrap().is_empty());
    assert_eq!(db.list_sources(None, Some("b")).unwrap().len(), 1);
}

// =========================================================================
// Playback
// =========================================================================

#[test]
fn playback_upsert_updates_episode_last_played() {
    let (db, _temp) = setup_test_db();
    seed(&db, "e1", 3);
    db.save_playback("e1", 2, 12.5, 66.0).unwrap();

    let playback = db.get_playback("e1").unwrap().unwrap();
    assert_eq!(playback.current_chunk_index, 2);
    assert!((playback.position_secs - 12.5).abs() < 1e-9);
    assert!(playback.updated_at.is_some());

    let episode = db.get_episode("e1").unwrap().unwrap();
    assert!(episode.last_played_at.is_some());
    assert_eq!(episode.percent_listened, Some(66.0));
}
