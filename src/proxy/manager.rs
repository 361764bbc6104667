// src/proxy/manager.rs

//! Lifecycle of the overlay proxy process.
//!
//! `start()` spawns the proxy and waits for [`READY_MARKER`] on stdout. The
//! proxy is then `Syncing` until a probe sent through it to the configured
//! sync domain gets any answer other than [`NOT_SYNCED_STATUS`], at which
//! point it is `Connected` and probing stops for good.

use super::{Circuit, ProxyStatus, NOT_SYNCED_STATUS, READY_MARKER};
use crate::errors::ProxyError;
use crate::events::{emit, ProxyEvent, EVENT_CAPACITY};
use crate::http::create_proxied_client;
use crate::paths::{resolve_binary, Daemon};
use crate::process::{spawn_supervised, ChildHandle, ExitReport, OutputLine, SpawnSpec, Termination};
use crate::settings::{NetworkSettings, SharedSettings};
use crate::validation::{sanitize_port, DEFAULT_PROXY_PORT};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const RESTART_SETTLE: Duration = Duration::from_secs(1);
/// How long to wait for the exit code once output ended before the marker.
const EXIT_REPORT_GRACE: Duration = Duration::from_secs(1);
const MIN_SYNC_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    Direct,
    Garlic,
}

impl ProxyMode {
    fn from_setting(value: &str) -> Self {
        match value {
            "garlic" => ProxyMode::Garlic,
            "direct" => ProxyMode::Direct,
            other => {
                warn!("Proxy: Unknown proxy mode `{}`, using direct", other);
                ProxyMode::Direct
            }
        }
    }
}

/// Settings captured when the proxy is started. Later edits need a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub port: u16,
    pub mode: ProxyMode,
    pub rotation_interval: Duration,
    pub sync_domain: String,
    pub sync_interval: Duration,
    pub startup_timeout: Duration,
    pub binary: String,
}

impl ProxyConfig {
    pub fn from_settings(network: &NetworkSettings) -> Self {
        ProxyConfig {
            port: sanitize_port(network.proxy_port, DEFAULT_PROXY_PORT),
            mode: ProxyMode::from_setting(&network.proxy_mode),
            rotation_interval: Duration::from_secs(network.rotation_interval.max(1) as u64),
            sync_domain: network.sync_domain.trim().to_string(),
            sync_interval: Duration::from_millis(network.sync_check_interval.max(0) as u64)
                .max(MIN_SYNC_INTERVAL),
            startup_timeout: Duration::from_secs(network.startup_timeout.max(1) as u64),
            binary: network.proxy_binary.clone(),
        }
    }

    /// Command line for the proxy binary.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--listen".to_string(),
            format!("127.0.0.1:{}", self.port),
            "--mode".to_string(),
        ];
        match self.mode {
            ProxyMode::Direct => args.push("direct".to_string()),
            ProxyMode::Garlic => {
                args.push("garlic".to_string());
                args.push("--rotate".to_string());
                args.push(self.rotation_interval.as_secs().to_string());
            }
        }
        args
    }

    fn probe_url(&self) -> String {
        format!("http://{}/", self.sync_domain)
    }
}

/// Point-in-time view of the manager. Reading it never does I/O.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxySnapshot {
    pub status: ProxyStatus,
    pub port: Option<u16>,
    pub mode: Option<ProxyMode>,
    pub pid: Option<u32>,
    pub circuit: Circuit,
}

struct Inner {
    status: ProxyStatus,
    /// Bumped on every start and teardown; tasks of an older child see a
    /// mismatch and stay quiet.
    generation: u64,
    child: Option<ChildHandle>,
    tasks: Vec<JoinHandle<()>>,
    circuit: Circuit,
    config: Option<ProxyConfig>,
    /// Generation whose child exited on its own.
    crashed: Option<u64>,
}

impl Inner {
    fn teardown(&mut self) -> Termination {
        self.generation += 1;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.status = ProxyStatus::Stopped;
        self.circuit.clear();
        self.config = None;
        self.child.take().map(ChildHandle::terminate).unwrap_or_default()
    }
}

struct Shared {
    inner: Mutex<Inner>,
    events: broadcast::Sender<ProxyEvent>,
}

pub struct ProxyManager {
    settings: SharedSettings,
    shared: Arc<Shared>,
}

impl ProxyManager {
    pub fn new(settings: SharedSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        ProxyManager {
            settings,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    status: ProxyStatus::Stopped,
                    generation: 0,
                    child: None,
                    tasks: Vec::new(),
                    circuit: Circuit::default(),
                    config: None,
                    crashed: None,
                }),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.shared.events.subscribe()
    }

    pub fn status(&self) -> ProxySnapshot {
        let inner = self.shared.inner.lock();
        ProxySnapshot {
            status: inner.status,
            port: inner.config.as_ref().map(|c| c.port),
            mode: inner.config.as_ref().map(|c| c.mode),
            pid: inner.child.as_ref().and_then(ChildHandle::pid),
            circuit: inner.circuit.clone(),
        }
    }

    /// True when a proxy is running with a config that differs from `network`.
    pub fn needs_restart(&self, network: &NetworkSettings) -> bool {
        let inner = self.shared.inner.lock();
        inner
            .config
            .as_ref()
            .is_some_and(|running| *running != ProxyConfig::from_settings(network))
    }

    /// Spawn the proxy and wait until it is listening.
    ///
    /// Resolves once the proxy is `Syncing`; reaching `Connected` is reported
    /// through events.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let config = ProxyConfig::from_settings(&self.settings.lock().load().network);
        // built up front so a failure leaves nothing running
        let probe = create_proxied_client(config.port, config.sync_interval.max(Duration::from_secs(5)))?;

        let (generation, ready, exit_reported) = {
            let mut inner = self.shared.inner.lock();
            if inner.child.is_some() || inner.status != ProxyStatus::Stopped {
                return Err(ProxyError::AlreadyRunning);
            }

            let spec = SpawnSpec {
                program: resolve_binary(Daemon::Proxy, &config.binary)?,
                args: config.args(),
            };
            info!("Proxy: Starting {} {:?}", spec.program.display(), spec.args);
            let supervised = match spawn_supervised(&spec) {
                Ok(supervised) => supervised,
                Err(e) => {
                    emit(&self.shared.events, ProxyEvent::Error(e.to_string()));
                    return Err(e.into());
                }
            };

            inner.generation += 1;
            let generation = inner.generation;
            let (ready_tx, ready_rx) = oneshot::channel();
            let (exit_tx, exit_rx) = oneshot::channel();
            inner.tasks = vec![
                tokio::spawn(watch_output(
                    self.shared.clone(),
                    generation,
                    config.mode,
                    supervised.lines,
                    ready_tx,
                )),
                tokio::spawn(watch_exit(self.shared.clone(), generation, supervised.exited, exit_tx)),
            ];
            inner.child = Some(supervised.handle);
            inner.circuit.clear();
            inner.config = Some(config.clone());
            inner.status = ProxyStatus::Starting;
            emit(&self.shared.events, ProxyEvent::Status(ProxyStatus::Starting));
            (generation, ready_rx, exit_rx)
        };

        match tokio::time::timeout(config.startup_timeout, ready).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                // output ended before the marker: the process died or we were stopped
                if self.shared.inner.lock().generation == generation {
                    let _ = tokio::time::timeout(EXIT_REPORT_GRACE, exit_reported).await;
                }
                let crashed = {
                    let inner = self.shared.inner.lock();
                    inner.generation == generation || inner.crashed == Some(generation)
                };
                self.stop_generation(generation);
                return Err(if crashed {
                    ProxyError::ExitedBeforeReady
                } else {
                    ProxyError::Aborted
                });
            }
            Err(_) => {
                warn!(
                    "Proxy: No readiness marker after {:?}, killing it",
                    config.startup_timeout
                );
                self.stop_generation(generation);
                return Err(ProxyError::ReadinessTimeout(config.startup_timeout.as_secs()));
            }
        }

        let mut inner = self.shared.inner.lock();
        if inner.generation != generation {
            return Err(ProxyError::Aborted);
        }
        info!("Proxy: Listening on port {}, waiting for network sync", config.port);
        inner.status = ProxyStatus::Syncing;
        emit(&self.shared.events, ProxyEvent::Status(ProxyStatus::Syncing));
        inner.tasks.push(tokio::spawn(sync_probe(
            self.shared.clone(),
            generation,
            probe,
            config.probe_url(),
            config.sync_interval,
        )));
        Ok(())
    }

    /// Stop the proxy. A no-op, without events, when nothing is running.
    ///
    /// The process is signalled right away; await the returned
    /// [`Termination`] to know it is gone.
    pub fn stop(&self) -> Termination {
        let mut inner = self.shared.inner.lock();
        if inner.child.is_none() {
            return Termination::default();
        }
        info!("Proxy: Stopping");
        let termination = inner.teardown();
        emit(&self.shared.events, ProxyEvent::Status(ProxyStatus::Stopped));
        termination
    }

    /// Stop the proxy and wait for the process to exit.
    pub async fn shutdown(&self) {
        self.stop().wait().await;
    }

    pub async fn restart(&self) -> Result<(), ProxyError> {
        self.shutdown().await;
        tokio::time::sleep(RESTART_SETTLE).await;
        self.start().await
    }

    fn stop_generation(&self, generation: u64) {
        let mut inner = self.shared.inner.lock();
        if inner.generation == generation && inner.child.is_some() {
            let _ = inner.teardown();
            emit(&self.shared.events, ProxyEvent::Status(ProxyStatus::Stopped));
        }
    }
}

impl Drop for ProxyManager {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

async fn watch_output(
    shared: Arc<Shared>,
    generation: u64,
    mode: ProxyMode,
    mut lines: mpsc::UnboundedReceiver<OutputLine>,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    while let Some(line) = lines.recv().await {
        let mut inner = shared.inner.lock();
        if inner.generation != generation {
            return;
        }

        if mode == ProxyMode::Garlic && inner.circuit.observe(line.text()) {
            debug!("Proxy: Circuit now {:?}", inner.circuit);
            emit(&shared.events, ProxyEvent::Circuit(inner.circuit.clone()));
        }

        match line {
            OutputLine::Stdout(text) if text.contains(READY_MARKER) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(());
                }
            }
            other => {
                debug!("Proxy: {}", other.text());
                emit(&shared.events, ProxyEvent::Log(other.text().to_string()));
            }
        }
    }
}

async fn watch_exit(
    shared: Arc<Shared>,
    generation: u64,
    exited: oneshot::Receiver<ExitReport>,
    reported: oneshot::Sender<()>,
) {
    let Ok(report) = exited.await else {
        return;
    };
    let mut inner = shared.inner.lock();
    if inner.generation != generation {
        return;
    }
    warn!("Proxy: Exited unexpectedly (code {:?})", report.code);
    inner.crashed = Some(generation);
    let _ = inner.teardown();
    emit(&shared.events, ProxyEvent::Exited(report.code));
    emit(&shared.events, ProxyEvent::Status(ProxyStatus::Stopped));
    let _ = reported.send(());
}

async fn sync_probe(
    shared: Arc<Shared>,
    generation: u64,
    client: reqwest::Client,
    url: String,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let synced = match client.get(&url).send().await {
            Ok(response) => response.status().as_u16() != NOT_SYNCED_STATUS,
            Err(e) => {
                debug!("Proxy: Sync probe failed: {}", e);
                false
            }
        };
        if !synced {
            continue;
        }

        let mut inner = shared.inner.lock();
        if inner.generation == generation && inner.status == ProxyStatus::Syncing {
            info!("Proxy: Network synced");
            inner.status = ProxyStatus::Connected;
            emit(&shared.events, ProxyEvent::Status(ProxyStatus::Connected));
        }
        return;
    }
}
