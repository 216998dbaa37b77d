//! Integration tests for persistence manager behaviour
//!
//! Covers:
//! - Stop guard: user-data override, inactive latch, unchanged state
//! - Lifecycle phases: game reset and training stop flushes
//! - Load failures on corrupt files
//! - Model serializer failures
//! - Cancellation of queued saves
//! - Event stream contents
//! - Save batches admitted past a stop
//! - Phase quiescence waits and their bound

mod helpers;

use helpers::{fast_settings, FakeModel, TestHarness};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tdm_common::config::IoSettings;
use tdm_common::events::PersistenceEvent;
use tdm_io::{Error, LoadedPayload, Payload, PayloadKind, SaveOutcome, SkipReason};
use tokio::sync::broadcast;

/// Drain every event received so far
fn drain(rx: &mut broadcast::Receiver<PersistenceEvent>) -> Vec<PersistenceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ========================================
// Stop guard
// ========================================

#[tokio::test]
async fn test_user_data_override_admits_saves_while_inactive() {
    let h = TestHarness::new();
    h.status.set_training_active(Some(false));

    {
        let _user = h.context.begin_user_data_processing();
        assert!(!h.manager.should_stop_io());
        let outcome = h
            .manager
            .save("QLearning", Payload::text("user_game=1"), "user_qtable.dat")
            .wait()
            .await
            .unwrap();
        assert!(outcome.is_written());
    }

    let outcome = h
        .manager
        .save("QLearning", Payload::text("user_game=2"), "user_qtable.dat")
        .wait()
        .await
        .unwrap();
    assert_eq!(outcome, SaveOutcome::Skipped(SkipReason::Blocked));
    assert_eq!(h.read("user_qtable.dat"), b"user_game=1");
}

#[tokio::test]
async fn test_inactive_training_latches_stop() {
    let h = TestHarness::new();
    h.status.set_training_active(Some(false));
    assert!(h.manager.should_stop_io());
    assert!(h.context.is_stop_requested());

    // The latch holds even once the status source reports active again
    h.status.set_training_active(Some(true));
    assert!(h.manager.should_stop_io());

    h.manager.on_training_start();
    assert!(!h.manager.should_stop_io());
}

#[tokio::test]
async fn test_unknown_status_admits_saves() {
    let h = TestHarness::new();
    h.status.set_training_active(None);
    assert!(!h.manager.should_stop_io());
}

#[tokio::test]
async fn test_unchanged_state_is_not_marked_dirty() {
    let h = TestHarness::new();
    h.status.set_state_changed(Some(false));
    h.manager.mark_dirty("Negamax", "negamax.dat");
    assert!(!h.manager.is_dirty("negamax.dat"));

    h.status.set_state_changed(None);
    h.manager.mark_dirty("Negamax", "negamax.dat");
    assert!(h.manager.is_dirty("negamax.dat"));
}

#[tokio::test]
async fn test_mark_dirty_ignored_after_stop() {
    let h = TestHarness::new();
    h.context.request_stop();
    h.manager.mark_dirty("OpenAI", "openai.dat");
    assert!(!h.manager.is_dirty("openai.dat"));
}

// ========================================
// Lifecycle phases
// ========================================

#[tokio::test]
async fn test_game_reset_flushes_debounced_model() {
    let h = TestHarness::new();
    h.manager
        .save("CNN", Payload::model(FakeModel::new(64, 1)), "cnn_model.zip")
        .wait()
        .await
        .unwrap();
    let outcome = h
        .manager
        .save("CNN", Payload::model(FakeModel::new(64, 2)), "cnn_model.zip")
        .wait()
        .await
        .unwrap();
    assert_eq!(outcome, SaveOutcome::Skipped(SkipReason::ModelDebounce));

    let report = h.manager.on_game_reset().await.unwrap();
    assert_eq!(report.flushed, 1);
    assert_eq!(report.failed, 0);
    assert!(!h.manager.is_dirty("cnn_model.zip"));
    assert_eq!(h.read("cnn_model.zip").last(), Some(&2u8));
    assert_eq!(h.manager.write_count("cnn_model.zip"), 2);

    // Game reset does not block further saves
    assert!(!h.manager.should_stop_io());
}

#[tokio::test]
async fn test_training_stop_flushes_then_clears() {
    let h = TestHarness::new();
    h.manager
        .save("AlphaZero", Payload::model(FakeModel::new(64, 1)), "alphazero_value.zip")
        .wait()
        .await
        .unwrap();
    h.manager
        .save("AlphaZero", Payload::model(FakeModel::new(64, 3)), "alphazero_value.zip")
        .wait()
        .await
        .unwrap();
    h.manager.mark_dirty("OpenAI", "openai.dat");
    assert_eq!(h.manager.dirty_files().len(), 2);

    let report = h.manager.on_training_stop().await.unwrap();
    assert_eq!(report.flushed, 1);
    assert_eq!(report.missing, 1);
    assert!(h.manager.dirty_files().is_empty());
    assert!(!h.manager.has_cached("alphazero_value.zip"));
    assert_eq!(h.read("alphazero_value.zip").last(), Some(&3u8));
    assert!(h.manager.should_stop_io());
}

#[tokio::test]
async fn test_startup_creates_data_dir() {
    let dir = tempfile::TempDir::new().unwrap();
    let data_dir = dir.path().join("nested").join("training_data");
    let manager = tdm_io::PersistenceManager::builder(&data_dir)
        .io_settings(fast_settings())
        .build()
        .unwrap();

    manager.startup().await.unwrap();
    assert!(data_dir.is_dir());
}

#[tokio::test]
async fn test_read_ui_state_returns_in_request_order() {
    let h = TestHarness::new();
    h.manager
        .save("QLearning", Payload::text("a=1\n"), "qtable.dat")
        .wait()
        .await
        .unwrap();
    h.manager
        .save("GeneticAlgorithm", Payload::structured(&vec![3, 1, 2]).unwrap(), "ga.dat")
        .wait()
        .await
        .unwrap();

    let results = h
        .manager
        .read_ui_state(&[
            ("GeneticAlgorithm", "ga.dat"),
            ("DeepLearning", "missing.dat"),
            ("QLearning", "qtable.dat"),
        ])
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(
        results[0].as_ref().unwrap(),
        &Some(LoadedPayload::Structured(serde_json::json!([3, 1, 2])))
    );
    assert!(results[1].as_ref().unwrap().is_none());
    assert_eq!(
        results[2].as_ref().unwrap(),
        &Some(LoadedPayload::Raw(b"a=1\n".to_vec()))
    );
    assert_eq!(h.manager.current_phase(), None);
}

// ========================================
// Load failures
// ========================================

#[tokio::test]
async fn test_corrupt_model_archive_is_a_decode_error() {
    let h = TestHarness::new();
    std::fs::write(h.path("cnn_model.zip"), b"certainly not an archive").unwrap();

    let result = h.manager.load("CNN", "cnn_model.zip").await;
    assert!(matches!(result, Err(Error::Decode { .. })));
    assert_eq!(h.manager.metrics().error_count("CNN"), 1);
}

#[tokio::test]
async fn test_structured_hint_on_garbage_is_a_decode_error() {
    let h = TestHarness::new();
    std::fs::write(h.path("ga.dat"), b"{ population: [").unwrap();

    let result = h
        .manager
        .load_as("GeneticAlgorithm", "ga.dat", PayloadKind::Structured)
        .await;
    assert!(matches!(result, Err(Error::Decode { .. })));

    // Without a hint the same bytes come back raw
    let loaded = h.manager.load("GeneticAlgorithm", "ga.dat").await.unwrap();
    assert_eq!(loaded, Some(LoadedPayload::Raw(b"{ population: [".to_vec())));
}

#[tokio::test]
async fn test_empty_file_loads_as_none() {
    let h = TestHarness::new();
    std::fs::write(h.path("empty.dat"), b"").unwrap();
    assert!(h.manager.load("Negamax", "empty.dat").await.unwrap().is_none());
}

#[tokio::test]
async fn test_load_after_shutdown_fails() {
    let h = TestHarness::new();
    h.manager.shutdown().await.unwrap();
    assert!(matches!(
        h.manager.load("Negamax", "negamax.dat").await,
        Err(Error::ShutDown)
    ));
}

// ========================================
// Write failures and events
// ========================================

#[tokio::test]
async fn test_written_file_emits_event() {
    let h = TestHarness::new();
    let mut rx = h.manager.subscribe();

    h.manager
        .save("MonteCarloTreeSearch", Payload::text("visits=12"), "mcts.dat")
        .wait()
        .await
        .unwrap();

    let written: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            PersistenceEvent::FileWritten {
                subsystem, file, bytes, ..
            } => Some((subsystem, file, bytes)),
            _ => None,
        })
        .collect();
    assert_eq!(
        written,
        vec![("MonteCarloTreeSearch".to_string(), "mcts.dat".to_string(), 9)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_model_keeps_file_dirty() {
    let h = TestHarness::new();
    let mut rx = h.manager.subscribe();
    let model = FakeModel::new(128, 5);
    model.fail.store(true, Ordering::SeqCst);

    let result = h
        .manager
        .save("LeelaChessZero", Payload::model(Arc::clone(&model)), "leela.zip")
        .wait()
        .await;

    assert!(result.is_err());
    assert!(!h.path("leela.zip").exists());
    assert!(!h.path("leela.zip.tmp").exists());
    assert!(h.manager.is_dirty("leela.zip"));
    assert!(h.manager.has_cached("leela.zip"));
    assert_eq!(h.manager.metrics().error_count("LeelaChessZero"), 1);
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, PersistenceEvent::SaveFailed { file, .. } if file == "leela.zip")));

    // A later flush retries from the cache
    model.fail.store(false, Ordering::SeqCst);
    let report = h.manager.flush_dirty_data().await;
    assert_eq!(report.flushed, 1);
    assert_eq!(h.read("leela.zip").len() as u64, model.expected_len());
}

// ========================================
// Cancellation
// ========================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_training_stop_cancels_queued_saves() {
    let h = TestHarness::with_settings(IoSettings {
        worker_threads: 1,
        ..fast_settings()
    });
    let mut rx = h.manager.subscribe();

    // Occupies the only pool slot
    let slow = FakeModel::slow(256, 4, Duration::from_millis(200));
    let running = h
        .manager
        .save("DeepQNetwork", Payload::model(Arc::clone(&slow)), "dqn_main.zip");
    tokio::time::sleep(Duration::from_millis(30)).await;
    let queued = h
        .manager
        .save("QLearning", Payload::text("a=1\n"), "queued.dat");
    assert!(h.manager.is_save_in_progress("QLearning"));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = h.manager.on_training_stop().await.unwrap();

    // Started saves run to completion
    assert!(running.wait().await.unwrap().is_written());
    assert_eq!(
        queued.wait().await.unwrap(),
        SaveOutcome::Skipped(SkipReason::Cancelled)
    );
    assert_eq!(report.failed, 0);
    // The cancelled save's payload was flushed from the cache
    assert_eq!(h.read("queued.dat"), b"a=1\n");
    assert!(!h.manager.is_save_in_progress("QLearning"));
    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        PersistenceEvent::SaveCancelled { file, .. } if file == "queued.dat"
    )));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_save_in_progress_until_finished() {
    let h = TestHarness::new();
    let slow = FakeModel::slow(64, 1, Duration::from_millis(100));

    let handle = h
        .manager
        .save("AlphaFold3", Payload::model(slow), "alphafold3.zip");
    assert!(h.manager.is_save_in_progress("AlphaFold3"));
    assert!(!handle.is_finished());

    handle.wait().await.unwrap();
    assert!(!h.manager.is_save_in_progress("AlphaFold3"));
    assert!(!h.manager.is_io_in_progress());
}

// ========================================
// Save batches and quiescence
// ========================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_started_before_stop_completes() {
    let h = TestHarness::new();

    // First file of a three-file batch is still being written
    let main = h.manager.save(
        "DeepQNetwork",
        Payload::model(FakeModel::slow(256, 1, Duration::from_millis(150))),
        "dqn_main.zip",
    );
    assert!(h.manager.is_save_in_progress("DeepQNetwork"));
    h.context.request_stop();

    let target = h
        .manager
        .save("DeepQNetwork", Payload::model(FakeModel::new(256, 2)), "dqn_target.zip");
    let experiences = h
        .manager
        .save("DeepQNetwork", Payload::text("replay=64"), "dqn_experiences.dat");
    let other = h
        .manager
        .save("QLearning", Payload::text("a=1\n"), "qtable.dat");

    assert!(main.wait().await.unwrap().is_written());
    assert!(target.wait().await.unwrap().is_written());
    assert!(experiences.wait().await.unwrap().is_written());
    assert_eq!(
        other.wait().await.unwrap(),
        SaveOutcome::Skipped(SkipReason::Blocked)
    );
    assert!(h.path("dqn_target.zip").exists());
    assert_eq!(h.read("dqn_experiences.dat"), b"replay=64");

    // Once the batch drains, the subsystem is blocked like any other
    assert!(!h.manager.is_save_in_progress("DeepQNetwork"));
    let late = h
        .manager
        .save("DeepQNetwork", Payload::text("replay=65"), "dqn_experiences.dat");
    assert_eq!(
        late.wait().await.unwrap(),
        SaveOutcome::Skipped(SkipReason::Blocked)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_phase_waits_for_active_subsystem() {
    let h = TestHarness::with_settings(IoSettings {
        quiescence_poll_ms: 5,
        quiescence_max_attempts: 2000,
        ..fast_settings()
    });
    let mut rx = h.manager.subscribe();
    h.manager.tracker().mark_active("QLearning");

    let tracker = Arc::clone(h.manager.tracker());
    let learner = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        tracker.mark_complete("QLearning");
    });

    let started = std::time::Instant::now();
    h.manager.on_game_reset().await.unwrap();
    let elapsed = started.elapsed();
    learner.await.unwrap();

    assert!(elapsed >= Duration::from_millis(80), "reset ran after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "quiescence bound must not be hit");
    assert!(!h.manager.tracker().has_active());
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, PersistenceEvent::PhaseStarted { .. })));
}

#[tokio::test]
async fn test_phase_proceeds_after_quiescence_bound() {
    let h = TestHarness::with_settings(IoSettings {
        quiescence_poll_ms: 5,
        quiescence_max_attempts: 4,
        ..fast_settings()
    });
    h.manager.tracker().mark_active("Negamax");
    h.manager.mark_dirty("Negamax", "negamax.dat");

    let started = std::time::Instant::now();
    let report = h.manager.shutdown().await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(20));
    assert_eq!(report.missing, 1);
    assert!(h.manager.tracker().is_active("Negamax"));
    assert!(h.manager.is_shut_down());
}
