//! Eviction, retention, index persistence and playback preparation.

mod common;

use common::*;
use core_cache::{
    BufferingMode, CacheError, CacheIndex, CacheSettings, DownloadState, Retention,
};
use core_runtime::events::{CacheEvent, CoreEvent, EvictionReason};
use std::sync::Arc;
use std::time::Duration;

async fn download(h: &Harness, id: &str, transient: bool) {
    let mut completed = h.coordinator.subscribe_completed();
    let ctx = h.coordinator.start_or_join(track(id), transient);
    if ctx.state() != DownloadState::Complete {
        wait_completed(&mut completed, id).await;
    }
}

#[tokio::test]
async fn test_budget_evicts_oldest_entry() {
    let server = FakeServer::new()
        .with_body("a", payload(40_000, 1))
        .with_body("b", payload(40_000, 2))
        .with_body("c", payload(40_000, 3));
    let settings = CacheSettings {
        budget_bytes: 100 * 1024,
        ..Default::default()
    };
    let h = Harness::start(server, settings).await;
    let mut events = h.events.subscribe();

    download(&h, "a", false).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    download(&h, "b", false).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    download(&h, "c", false).await;

    let event = wait_for_event(&mut events, |e| {
        matches!(e, CoreEvent::Cache(CacheEvent::Evicted { .. }))
    })
    .await;
    assert_eq!(
        event,
        CoreEvent::Cache(CacheEvent::Evicted {
            track_id: "a".to_string(),
            reason: EvictionReason::OverBudget,
        })
    );
    wait_for_event(&mut events, |e| {
        matches!(e, CoreEvent::Cache(CacheEvent::Cleared { .. }))
    })
    .await;

    assert!(!h.coordinator.is_cached("a").await);
    assert!(h.coordinator.is_cached("b").await);
    assert!(h.coordinator.is_cached("c").await);
    let stats = h.coordinator.stats().await.unwrap();
    assert_eq!(stats.entry_count, 2);
    assert!(!stats.is_over_budget());
    h.cleanup().await;
}

#[tokio::test]
async fn test_touch_protects_recently_played_entry() {
    let server = FakeServer::new()
        .with_body("a", payload(40_000, 1))
        .with_body("b", payload(40_000, 2))
        .with_body("c", payload(40_000, 3));
    let settings = CacheSettings {
        budget_bytes: 100 * 1024,
        ..Default::default()
    };
    let h = Harness::start(server, settings).await;
    let mut events = h.events.subscribe();

    download(&h, "a", false).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    download(&h, "b", false).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.coordinator.touch_cached_file("a").await.unwrap());
    download(&h, "c", false).await;

    let event = wait_for_event(&mut events, |e| {
        matches!(e, CoreEvent::Cache(CacheEvent::Evicted { .. }))
    })
    .await;
    assert!(matches!(
        event,
        CoreEvent::Cache(CacheEvent::Evicted { ref track_id, .. }) if track_id == "b"
    ));
    wait_for_event(&mut events, |e| {
        matches!(e, CoreEvent::Cache(CacheEvent::Cleared { .. }))
    })
    .await;
    assert!(h.coordinator.is_cached("a").await);
    h.cleanup().await;
}

#[tokio::test]
async fn test_open_reader_protects_track_from_budget_eviction() {
    let playing = payload(40_000, 1);
    let server = FakeServer::new()
        .with_body("a", playing.clone())
        .with_body("b", payload(40_000, 2))
        .with_body("c", payload(40_000, 3));
    let settings = CacheSettings {
        budget_bytes: 100 * 1024,
        ..Default::default()
    };
    let h = Harness::start(server, settings).await;
    let mut events = h.events.subscribe();

    download(&h, "a", false).await;
    let reader = h
        .coordinator
        .open_reader(h.coordinator.get_raw_context("a").unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;
    download(&h, "b", false).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    download(&h, "c", false).await;

    let event = wait_for_event(&mut events, |e| {
        matches!(e, CoreEvent::Cache(CacheEvent::Evicted { .. }))
    })
    .await;
    assert!(matches!(
        event,
        CoreEvent::Cache(CacheEvent::Evicted { ref track_id, .. }) if track_id == "b"
    ));
    wait_for_event(&mut events, |e| {
        matches!(e, CoreEvent::Cache(CacheEvent::Cleared { .. }))
    })
    .await;

    assert!(h.coordinator.layout().media_path("a").exists());
    assert!(h.coordinator.is_cached("a").await);
    assert_eq!(read_all(reader).await, playing);
    assert_eq!(h.coordinator.get_raw_context("a").unwrap().reader_count(), 0);
    h.cleanup().await;
}

#[tokio::test]
async fn test_protected_ids_survive_cleanup() {
    let server = FakeServer::new()
        .with_body("prev", payload(40_000, 1))
        .with_body("next", payload(40_000, 2))
        .with_body("other", payload(40_000, 3));
    let h = Harness::start(server, CacheSettings::default()).await;

    download(&h, "prev", false).await;
    download(&h, "next", false).await;
    download(&h, "other", false).await;

    h.coordinator.set_protected(["prev", "next"]);
    let report = h.coordinator.clean_cache(&[]).await.unwrap();
    assert_eq!(report.removed, vec!["other".to_string()]);
    assert!(h.coordinator.is_cached("prev").await);
    assert!(h.coordinator.is_cached("next").await);

    h.coordinator.set_protected(Vec::<String>::new());
    let report = h.coordinator.clean_cache(&[]).await.unwrap();
    assert_eq!(report.removed.len(), 2);
    h.cleanup().await;
}

#[tokio::test]
async fn test_logs_carry_file_names_not_paths() {
    let capture = LogCapture::default();
    let _guard = capture.install();

    let h = Harness::start(
        FakeServer::new().with_body("t", payload(20_000, 1)),
        CacheSettings::default(),
    )
    .await;
    download(&h, "t", false).await;
    assert!(h.coordinator.touch_cached_file("t").await.unwrap());

    let root = h.dir.to_string_lossy().into_owned();
    let dir_name = h.dir.file_name().unwrap().to_string_lossy().into_owned();
    let values = capture.values();
    assert!(values.iter().any(|v| v == "track_t.media"));
    assert!(values.iter().any(|v| *v == dir_name));
    assert!(values.iter().all(|v| !v.contains(&root)));
    h.cleanup().await;
}

#[tokio::test]
async fn test_transient_entries_are_swept_in_manual_mode() {
    let server = FakeServer::new()
        .with_body("scratch", payload(20_000, 1))
        .with_body("saved", payload(20_000, 2));
    let h = Harness::start(server, CacheSettings::default().with_manual_mode(true)).await;

    download(&h, "scratch", true).await;
    download(&h, "saved", false).await;

    let layout = h.coordinator.layout();
    let scratch = layout.read_sidecar("scratch").await.unwrap().unwrap();
    assert_eq!(scratch.retention, Retention::Transient);
    let saved = layout.read_sidecar("saved").await.unwrap().unwrap();
    assert_eq!(saved.retention, Retention::Permanent);
    assert_eq!(h.coordinator.stats().await.unwrap().transient_count, 1);

    let report = h.coordinator.clean_cache(&[]).await.unwrap();
    assert_eq!(report.removed, vec!["scratch".to_string()]);
    assert!(!layout.media_path("scratch").exists());
    assert!(layout.media_path("saved").exists());
    assert!(h.coordinator.get_raw_context("scratch").is_none());
    h.cleanup().await;
}

#[tokio::test]
async fn test_promotion_keeps_entry_through_sweep() {
    let server = FakeServer::new().with_body("p", payload(20_000, 1));
    let h = Harness::start(server, CacheSettings::default().with_manual_mode(true)).await;

    download(&h, "p", true).await;
    assert!(h.coordinator.promote_transient("p").await.unwrap());

    let report = h.coordinator.clean_cache(&[]).await.unwrap();
    assert!(report.removed.is_empty());
    assert!(h.coordinator.layout().media_path("p").exists());

    assert!(h.coordinator.ensure_transient("p").await.unwrap());
    assert_eq!(h.coordinator.remove_all_transient_markers().await.unwrap(), 1);
    h.cleanup().await;
}

#[tokio::test]
async fn test_automatic_mode_sweep_keeps_only_kept_ids() {
    let server = FakeServer::new()
        .with_body("x", payload(20_000, 1))
        .with_body("y", payload(20_000, 2));
    let h = Harness::start(server, CacheSettings::default()).await;

    download(&h, "x", false).await;
    download(&h, "y", false).await;

    let report = h.coordinator.clean_cache(&["y".to_string()]).await.unwrap();
    assert_eq!(report.removed, vec!["x".to_string()]);
    assert!(!h.coordinator.is_cached("x").await);
    assert!(h.coordinator.is_cached("y").await);
    h.cleanup().await;
}

#[tokio::test]
async fn test_clear_all_flushes_index() {
    let server = FakeServer::new()
        .with_body("x", payload(20_000, 1))
        .with_body("y", payload(20_000, 2));
    let h = Harness::start(server, CacheSettings::default()).await;
    let mut events = h.events.subscribe();

    download(&h, "x", false).await;
    download(&h, "y", false).await;

    let report = h.coordinator.clear_all(&["y".to_string()]).await.unwrap();
    assert_eq!(report.removed, vec!["x".to_string()]);
    assert_eq!(report.kept, 1);

    let event = wait_for_event(&mut events, |e| {
        matches!(e, CoreEvent::Cache(CacheEvent::Cleared { .. }))
    })
    .await;
    assert_eq!(
        event,
        CoreEvent::Cache(CacheEvent::Cleared {
            removed: 1,
            kept: 1
        })
    );

    let on_disk = CacheIndex::new(h.coordinator.layout().index_path());
    let ids: Vec<String> = on_disk.entries().await.into_iter().map(|t| t.id).collect();
    assert_eq!(ids, vec!["y".to_string()]);
    h.cleanup().await;
}

#[tokio::test]
async fn test_index_survives_restart() {
    let server = FakeServer::new()
        .with_body("1", payload(20_000, 1))
        .with_body("2", payload(20_000, 2));
    let h = Harness::start(server, CacheSettings::default()).await;
    download(&h, "1", false).await;
    download(&h, "2", false).await;
    let dir = h.stop().await;

    let reopened = Harness::start_in(
        dir,
        Arc::new(FakeServer::new()),
        CacheSettings::default(),
        test_config(),
    )
    .await;
    let mut ids: Vec<String> = reopened
        .coordinator
        .list_cached()
        .await
        .into_iter()
        .map(|t| t.id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
    reopened.cleanup().await;
}

#[tokio::test]
async fn test_remove_from_cache_skips_active_download() {
    let h = Harness::start(
        FakeServer::gated(16 * 1024).with_body("busy", payload(100_000, 1)),
        CacheSettings::default(),
    )
    .await;

    let ctx = h.coordinator.start_or_join(track("busy"), false);
    assert!(!h.coordinator.remove_from_cache("busy").await.unwrap());

    h.server.open_gate();
    tokio::time::timeout(TIMEOUT, ctx.wait_terminal()).await.unwrap();
    let mut completed = h.coordinator.subscribe_completed();
    if !h.coordinator.index().contains("busy").await {
        wait_completed(&mut completed, "busy").await;
    }

    assert!(h.coordinator.remove_from_cache("busy").await.unwrap());
    assert!(!h.coordinator.layout().media_path("busy").exists());
    assert!(!h.coordinator.is_cached("busy").await);
    h.cleanup().await;
}

#[tokio::test]
async fn test_prepare_playback_times_out_then_succeeds() {
    let body = payload(1024 * 1024, 5);
    let h = Harness::start(
        FakeServer::gated(16 * 1024).with_body("pp", body.clone()),
        CacheSettings::default(),
    )
    .await;

    let err = h
        .coordinator
        .prepare_playback(track("pp"), BufferingMode::Standard, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // The download kept running in the background.
    h.server.release(16);
    let reader = h
        .coordinator
        .prepare_playback(track("pp"), BufferingMode::Standard, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(reader.size(), body.len() as u64);
    assert_eq!(h.server.stream_requests(), 1);

    h.server.open_gate();
    assert_eq!(read_all(reader).await, body);
    h.cleanup().await;
}

#[tokio::test]
async fn test_prepare_playback_reports_failure() {
    let h = Harness::start(
        FakeServer::new().with_status("err", 503),
        CacheSettings::default(),
    )
    .await;

    let err = h
        .coordinator
        .prepare_playback(track("err"), BufferingMode::Aggressive, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CacheError::DownloadFailed { ref track_id, attempts: 3 } if track_id == "err"
    ));
    assert_eq!(h.server.stream_requests(), 3);
    h.cleanup().await;
}

#[tokio::test]
async fn test_prepare_playback_preloads_cached_track_into_memory() {
    let body = payload(40_000, 6);
    let h = Harness::start(
        FakeServer::new().with_body("r", body.clone()),
        CacheSettings::default(),
    )
    .await;
    download(&h, "r", false).await;

    h.settings.update(|s| s.ram_double_buffering = true);
    let reader = h
        .coordinator
        .prepare_playback(track("r"), BufferingMode::Aggressive, TIMEOUT)
        .await
        .unwrap();
    assert!(reader.is_memory_backed());
    assert!(reader.context().ram_buffer().is_none());
    assert_eq!(read_all(reader).await, body);
    h.cleanup().await;
}
