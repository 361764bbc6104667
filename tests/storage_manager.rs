// tests/storage_manager.rs

#![cfg(unix)]

mod common;

use common::{bag_json, free_port, script, settings_in, stays_quiet, wait_for, FakeApi, BAG_A};
use peerlink::errors::StorageError;
use peerlink::events::StorageEvent;
use peerlink::settings::Category;
use peerlink::storage::{BagStatus, ReadinessPolicy, StorageManager, StoragePhase};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;

const FAST: ReadinessPolicy = ReadinessPolicy {
    attempts: 40,
    interval: Duration::from_millis(50),
};

fn manager(dir: &Path, daemon_body: &str, port: u16) -> StorageManager {
    let binary = script(dir, "storage-daemon", daemon_body);
    let settings = settings_in(
        dir,
        &[(
            Category::Storage,
            json!({
                "storageBinary": binary.display().to_string(),
                "apiPort": port,
                "pollInterval": 100,
                "downloadPath": dir.join("downloads").display().to_string(),
            }),
        )],
    );
    StorageManager::new(settings, dir).with_readiness(FAST)
}

#[tokio::test]
async fn start_polls_bags_and_stop_is_silent_afterwards() {
    let dir = tempdir().unwrap();
    let api = FakeApi::with_bags(format!("[{}]", bag_json(BAG_A, true, false)));
    let manager = manager(dir.path(), "exec sleep 30", api.port());
    let mut events = manager.subscribe();

    assert!(!manager.is_running());
    manager.start().await.unwrap();
    assert!(manager.is_running());
    assert_eq!(manager.status().port, Some(api.port()));
    assert!(manager.status().pid.is_some());

    wait_for(&mut events, |e| *e == StorageEvent::Started).await;
    // published on every tick, changed or not
    for _ in 0..2 {
        let StorageEvent::BagsUpdated(bags) =
            wait_for(&mut events, |e| matches!(e, StorageEvent::BagsUpdated(_))).await
        else {
            unreachable!()
        };
        assert_eq!(bags.len(), 1);
        assert_eq!(bags[0].status, BagStatus::Downloading);
    }

    manager.stop();
    assert!(!manager.is_running());
    assert_eq!(manager.status().phase, StoragePhase::Stopped);
    wait_for(&mut events, |e| *e == StorageEvent::Stopped).await;
    assert!(stays_quiet(&mut events, Duration::from_millis(500)).await);

    // a second stop is a no-op
    manager.stop();
    assert!(stays_quiet(&mut events, Duration::from_millis(200)).await);
}

#[tokio::test]
async fn second_start_is_rejected() {
    let dir = tempdir().unwrap();
    let api = FakeApi::with_bags("[]");
    let manager = manager(dir.path(), "exec sleep 30", api.port());

    manager.start().await.unwrap();
    assert!(matches!(manager.start().await, Err(StorageError::AlreadyRunning)));
    manager.stop();
}

#[tokio::test]
async fn daemon_receives_sanitized_arguments() {
    let dir = tempdir().unwrap();
    let api = FakeApi::with_bags("[]");
    let args_file = dir.path().join("args.txt");
    let body = format!("echo \"$@\" > '{}'\nexec sleep 30", args_file.display());
    let binary = script(dir.path(), "storage-daemon", &body);
    let settings = settings_in(
        dir.path(),
        &[(
            Category::Storage,
            json!({
                "storageBinary": binary.display().to_string(),
                "apiPort": api.port(),
                "verbosity": 42,
            }),
        )],
    );
    let manager = StorageManager::new(settings, dir.path()).with_readiness(FAST);
    manager.start().await.unwrap();
    // the API stand-in answers independently of the script, so wait for it
    let mut args = String::new();
    for _ in 0..100 {
        args = std::fs::read_to_string(&args_file).unwrap_or_default();
        if args.ends_with('\n') {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    manager.stop();

    assert!(args.starts_with(&format!("--daemon --api 127.0.0.1:{}", api.port())));
    assert!(args.contains(&format!("--db {}", dir.path().join("storage-db").display())));
    assert!(args.contains("--network-config "));
    assert!(args.trim_end().ends_with("--verbosity 1"));
}

#[tokio::test]
async fn unanswered_api_times_out_and_kills_daemon() {
    let dir = tempdir().unwrap();
    let manager = manager(dir.path(), "exec sleep 30", free_port()).with_readiness(ReadinessPolicy {
        attempts: 3,
        interval: Duration::from_millis(20),
    });

    assert!(matches!(manager.start().await, Err(StorageError::ReadinessTimeout(3))));
    assert_eq!(manager.status().phase, StoragePhase::Stopped);
    assert!(manager.status().pid.is_none());
}

#[tokio::test]
async fn exit_before_ready_is_reported() {
    let dir = tempdir().unwrap();
    let manager = manager(dir.path(), "exit 3", free_port());
    let mut events = manager.subscribe();

    assert!(matches!(manager.start().await, Err(StorageError::ExitedBeforeReady)));
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, StorageEvent::Exited(_))).await,
        StorageEvent::Exited(Some(3))
    );
    assert!(!manager.is_running());
}

#[tokio::test]
async fn crash_while_running_cleans_up() {
    let dir = tempdir().unwrap();
    let api = FakeApi::with_bags("[]");
    let manager = manager(dir.path(), "echo booting\nsleep 1\nexit 4", api.port());
    let mut events = manager.subscribe();

    manager.start().await.unwrap();
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, StorageEvent::Exited(_))).await,
        StorageEvent::Exited(Some(4))
    );
    wait_for(&mut events, |e| *e == StorageEvent::Stopped).await;
    assert!(!manager.is_running());
    assert!(manager.status().pid.is_none());

    // stopping after a crash emits nothing
    manager.stop();
    assert!(stays_quiet(&mut events, Duration::from_millis(300)).await);

    // and the manager can be started again
    manager.start().await.unwrap();
    assert!(manager.is_running());
    manager.stop();
}

#[tokio::test]
async fn shutdown_lets_daemon_close_cleanly() {
    let dir = tempdir().unwrap();
    let api = FakeApi::with_bags("[]");
    let marker = dir.path().join("got-term");
    let body = format!(
        "trap 'echo closed > \"{}\"; exit 0' TERM\necho trapped\nwhile :; do sleep 0.1; done",
        marker.display()
    );
    let manager = manager(dir.path(), &body, api.port());
    let mut events = manager.subscribe();

    manager.start().await.unwrap();
    wait_for(&mut events, |e| *e == StorageEvent::Log("trapped".to_string())).await;
    manager.shutdown().await;
    assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "closed");
    assert!(!manager.is_running());
}

#[tokio::test]
async fn bag_operations_need_a_running_daemon() {
    let dir = tempdir().unwrap();
    let manager = manager(dir.path(), "exec sleep 30", free_port());

    assert!(matches!(manager.list_bags().await, Err(StorageError::NotRunning)));
    assert!(matches!(manager.pause_bag(BAG_A).await, Err(StorageError::NotRunning)));
    assert!(matches!(
        manager.add_bag(BAG_A, None, &[]).await,
        Err(StorageError::NotRunning)
    ));
}

#[tokio::test]
async fn bag_operations_reach_the_api() {
    let dir = tempdir().unwrap();
    let api = FakeApi::start(|req| {
        if req.url.starts_with("/api/v1/list") {
            (200, r#"{"bags": []}"#.to_string())
        } else if req.url.starts_with("/api/v1/details") {
            let body = format!(r#"{{"bag_id": "{BAG_A}", "path": "/srv/bags/a", "active": false}}"#);
            (200, body)
        } else if req.url.ends_with("/verify") {
            (200, r#"{"ok": false, "error": "corrupt"}"#.to_string())
        } else {
            (200, r#"{"ok": true}"#.to_string())
        }
    });
    let manager = manager(dir.path(), "exec sleep 30", api.port());
    manager.start().await.unwrap();

    manager.add_bag(BAG_A, None, &[]).await.unwrap();
    manager.pause_bag(BAG_A).await.unwrap();
    manager.resume_bag(BAG_A).await.unwrap();
    let details = manager.bag_details(BAG_A).await.unwrap();
    assert_eq!(details.bag.status, BagStatus::Paused);
    assert!(matches!(
        manager.verify_bag(BAG_A, false).await,
        Err(StorageError::Rejected(id)) if id == BAG_A
    ));
    manager.stop();

    let sent = api.commands();
    let urls: Vec<&str> = sent.iter().map(|r| r.url.as_str()).collect();
    assert_eq!(urls[0], "/api/v1/add");
    assert_eq!(urls[1], "/api/v1/stop");
    assert!(urls[2].starts_with("/api/v1/details"));
    assert_eq!(urls[3], "/api/v1/add");

    // without a path the bag lands in the configured download directory
    let downloads = dir.path().join("downloads").display().to_string();
    assert_eq!(sent[0].json()["path"], downloads.as_str());
    // resume re-adds at the bag's existing path, downloading everything
    assert_eq!(sent[3].json()["path"], "/srv/bags/a");
    assert_eq!(sent[3].json()["download_all"], true);
}
