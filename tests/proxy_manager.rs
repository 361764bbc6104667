// tests/proxy_manager.rs

#![cfg(unix)]

mod common;

use common::{script, settings_in, stays_quiet, wait_for, FakeProxy};
use peerlink::errors::ProxyError;
use peerlink::events::ProxyEvent;
use peerlink::proxy::{Circuit, ProxyManager, ProxyMode, ProxyStatus};
use peerlink::settings::{Category, NetworkSettings};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const READY: &str = "echo 'HTTP proxy listening on 127.0.0.1'";

fn manager_with(dir: &Path, proxy_body: &str, port: u16, extra: Value) -> ProxyManager {
    let binary = script(dir, "overlay-proxy", proxy_body);
    let mut network = json!({
        "proxyBinary": binary.display().to_string(),
        "proxyPort": port,
        "syncCheckInterval": 100,
        "startupTimeout": 5,
    });
    if let (Some(network), Some(extra)) = (network.as_object_mut(), extra.as_object()) {
        network.extend(extra.clone());
    }
    ProxyManager::new(settings_in(dir, &[(Category::Network, network)]))
}

fn manager(dir: &Path, proxy_body: &str, port: u16) -> ProxyManager {
    manager_with(dir, proxy_body, port, json!({}))
}

fn status_event(status: ProxyStatus) -> ProxyEvent {
    ProxyEvent::Status(status)
}

#[tokio::test]
async fn start_syncs_then_connects() {
    let dir = tempdir().unwrap();
    let upstream = FakeProxy::start(502);
    let manager = manager(dir.path(), &format!("{READY}\nexec sleep 30"), upstream.port());
    let mut events = manager.subscribe();

    manager.start().await.unwrap();
    let snapshot = manager.status();
    assert_eq!(snapshot.status, ProxyStatus::Syncing);
    assert_eq!(snapshot.port, Some(upstream.port()));
    assert_eq!(snapshot.mode, Some(ProxyMode::Direct));
    assert_eq!(events.recv().await.unwrap(), status_event(ProxyStatus::Starting));
    assert_eq!(events.recv().await.unwrap(), status_event(ProxyStatus::Syncing));

    // 502 means not synced yet; keep probing
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(upstream.hits() >= 2);
    assert_eq!(manager.status().status, ProxyStatus::Syncing);

    upstream.set_status(404);
    wait_for(&mut events, |e| *e == status_event(ProxyStatus::Connected)).await;
    assert_eq!(manager.status().status, ProxyStatus::Connected);

    // reaching connected ends probing for good
    let hits = upstream.hits();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(upstream.hits(), hits);

    manager.stop();
    assert_eq!(manager.status().status, ProxyStatus::Stopped);
    assert_eq!(events.recv().await.unwrap(), status_event(ProxyStatus::Stopped));
    assert!(stays_quiet(&mut events, Duration::from_millis(300)).await);
}

#[tokio::test]
async fn stop_on_stopped_manager_is_silent() {
    let dir = tempdir().unwrap();
    let manager = manager(dir.path(), "exit 0", 18080);
    let mut events = manager.subscribe();

    manager.stop();
    manager.stop();
    assert!(stays_quiet(&mut events, Duration::from_millis(200)).await);
    assert_eq!(manager.status().status, ProxyStatus::Stopped);
}

#[tokio::test]
async fn second_start_is_rejected() {
    let dir = tempdir().unwrap();
    let upstream = FakeProxy::start(502);
    let manager = manager(dir.path(), &format!("{READY}\nexec sleep 30"), upstream.port());

    manager.start().await.unwrap();
    assert!(matches!(manager.start().await, Err(ProxyError::AlreadyRunning)));
    manager.stop();
}

#[tokio::test]
async fn missing_marker_times_out_and_kills_proxy() {
    let dir = tempdir().unwrap();
    let manager = manager_with(
        dir.path(),
        "echo starting up\nexec sleep 30",
        18081,
        json!({ "startupTimeout": 1 }),
    );
    let mut events = manager.subscribe();

    assert!(matches!(manager.start().await, Err(ProxyError::ReadinessTimeout(1))));
    let snapshot = manager.status();
    assert_eq!(snapshot.status, ProxyStatus::Stopped);
    assert!(snapshot.pid.is_none());

    assert_eq!(events.recv().await.unwrap(), status_event(ProxyStatus::Starting));
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, ProxyEvent::Status(_))).await,
        status_event(ProxyStatus::Stopped)
    );
}

#[tokio::test]
async fn exit_before_marker_is_reported() {
    let dir = tempdir().unwrap();
    let manager = manager(dir.path(), "echo 'bind failed' >&2\nsleep 0.3\nexit 2", 18082);
    let mut events = manager.subscribe();

    assert!(matches!(manager.start().await, Err(ProxyError::ExitedBeforeReady)));
    assert_eq!(manager.status().status, ProxyStatus::Stopped);
    wait_for(&mut events, |e| *e == ProxyEvent::Log("bind failed".to_string())).await;
    // the exit code still reaches subscribers
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, ProxyEvent::Exited(_))).await,
        ProxyEvent::Exited(Some(2))
    );
    assert_eq!(events.recv().await.unwrap(), status_event(ProxyStatus::Stopped));
}

#[tokio::test]
async fn shutdown_waits_for_graceful_exit() {
    let dir = tempdir().unwrap();
    let upstream = FakeProxy::start(502);
    let marker = dir.path().join("got-term");
    let body = format!(
        "trap 'echo term > \"{}\"; exit 0' TERM\n{READY}\nwhile :; do sleep 0.1; done",
        marker.display()
    );
    let manager = manager(dir.path(), &body, upstream.port());

    manager.start().await.unwrap();
    manager.shutdown().await;
    assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "term");
    assert_eq!(manager.status().status, ProxyStatus::Stopped);

    // nothing left to wait for
    tokio::time::timeout(Duration::from_millis(200), manager.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn stop_during_start_aborts_it() {
    let dir = tempdir().unwrap();
    let manager = Arc::new(manager(dir.path(), "exec sleep 30", 18083));

    let starting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.start().await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(manager.status().status, ProxyStatus::Starting);
    manager.stop();

    let result = tokio::time::timeout(Duration::from_secs(5), starting).await.unwrap().unwrap();
    assert!(matches!(result, Err(ProxyError::Aborted)));
    assert_eq!(manager.status().status, ProxyStatus::Stopped);
}

#[tokio::test]
async fn garlic_mode_tracks_circuit_and_passes_rotation() {
    let dir = tempdir().unwrap();
    let upstream = FakeProxy::start(502);
    let args_file = dir.path().join("args.txt");
    let body = format!(
        "echo \"$@\" > '{}'\n{READY}\necho 'circuit exit hop: relayC'\necho 'entry hop = relayA'\n\
         echo 'middle hop: relayB'\nexec sleep 30",
        args_file.display()
    );
    let manager = manager_with(
        dir.path(),
        &body,
        upstream.port(),
        json!({ "proxyMode": "garlic", "rotationInterval": 120 }),
    );
    let mut events = manager.subscribe();

    manager.start().await.unwrap();
    let complete = Circuit {
        entry: Some("relayA".to_string()),
        middle: Some("relayB".to_string()),
        exit: Some("relayC".to_string()),
    };
    wait_for(&mut events, |e| *e == ProxyEvent::Circuit(complete.clone())).await;
    assert_eq!(manager.status().circuit, complete);
    assert_eq!(manager.status().mode, Some(ProxyMode::Garlic));

    let args = std::fs::read_to_string(&args_file).unwrap();
    assert_eq!(
        args.trim_end(),
        format!("--listen 127.0.0.1:{} --mode garlic --rotate 120", upstream.port())
    );

    manager.stop();
    assert_eq!(manager.status().circuit, Circuit::default());
}

#[tokio::test]
async fn crash_after_ready_cleans_up() {
    let dir = tempdir().unwrap();
    let upstream = FakeProxy::start(502);
    let manager = manager(dir.path(), &format!("{READY}\nsleep 1\nexit 5"), upstream.port());
    let mut events = manager.subscribe();

    manager.start().await.unwrap();
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, ProxyEvent::Exited(_))).await,
        ProxyEvent::Exited(Some(5))
    );
    assert_eq!(events.recv().await.unwrap(), status_event(ProxyStatus::Stopped));
    assert_eq!(manager.status().status, ProxyStatus::Stopped);
    assert!(manager.status().pid.is_none());

    // probing stopped with the process
    let hits = upstream.hits();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(upstream.hits(), hits);
}

#[tokio::test]
async fn needs_restart_only_when_running_config_differs() {
    let dir = tempdir().unwrap();
    let upstream = FakeProxy::start(502);
    let manager = manager(dir.path(), &format!("{READY}\nexec sleep 30"), upstream.port());

    let mut live = NetworkSettings {
        proxy_port: upstream.port() as i64,
        sync_check_interval: 100,
        startup_timeout: 5,
        proxy_binary: dir.path().join("overlay-proxy").display().to_string(),
        ..Default::default()
    };
    assert!(!manager.needs_restart(&live));

    manager.start().await.unwrap();
    assert!(!manager.needs_restart(&live));
    live.proxy_mode = "garlic".to_string();
    assert!(manager.needs_restart(&live));

    manager.stop();
    assert!(!manager.needs_restart(&live));
}
