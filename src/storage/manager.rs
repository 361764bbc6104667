// src/storage/manager.rs

//! Lifecycle of the storage daemon plus the bag operations routed to it.
//!
//! The daemon counts as running only once its HTTP API answers a ping. From
//! then on a poll task lists every bag each `pollInterval` and publishes the
//! whole list, changed or not.

use super::bag::{Bag, BagDetails};
use super::client::{Credentials, OkResponse, StorageClient};
use crate::errors::StorageError;
use crate::events::{emit, StorageEvent, EVENT_CAPACITY};
use crate::paths::{default_download_dir, resolve_binary, resolve_network_config, Daemon};
use crate::process::{spawn_supervised, ChildHandle, ExitReport, OutputLine, SpawnSpec, Termination};
use crate::settings::{SharedSettings, StorageSettings};
use crate::validation::{sanitize_port, sanitize_verbosity, DEFAULT_STORAGE_PORT, DEFAULT_VERBOSITY};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const RESTART_SETTLE: Duration = Duration::from_secs(1);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DB_DIR: &str = "storage-db";

/// How long `start()` keeps pinging the API before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        ReadinessPolicy {
            attempts: 30,
            interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoragePhase {
    Stopped,
    /// Spawned, API not answering yet. Still "not running" to callers.
    Starting,
    Running,
}

/// Settings captured when the daemon is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub port: u16,
    pub verbosity: u8,
    pub db_dir: PathBuf,
    pub network_config: PathBuf,
    pub poll_interval: Duration,
    pub binary: String,
    pub auth: Option<Credentials>,
}

impl StorageConfig {
    pub fn from_settings(storage: &StorageSettings, data_dir: &Path) -> Self {
        let db_dir = match storage.db_path.trim() {
            "" => data_dir.join(DB_DIR),
            path => PathBuf::from(path),
        };
        let auth = (!storage.api_login.is_empty()).then(|| Credentials {
            login: storage.api_login.clone(),
            password: storage.api_password.clone(),
        });

        StorageConfig {
            port: sanitize_port(storage.api_port, DEFAULT_STORAGE_PORT),
            verbosity: sanitize_verbosity(storage.verbosity, DEFAULT_VERBOSITY),
            db_dir,
            network_config: resolve_network_config(data_dir),
            poll_interval: Duration::from_millis(storage.poll_interval.max(0) as u64)
                .max(MIN_POLL_INTERVAL),
            binary: storage.storage_binary.clone(),
            auth,
        }
    }

    /// Command line for the storage daemon.
    pub fn args(&self) -> Vec<String> {
        vec![
            "--daemon".to_string(),
            "--api".to_string(),
            format!("127.0.0.1:{}", self.port),
            "--db".to_string(),
            self.db_dir.display().to_string(),
            "--network-config".to_string(),
            self.network_config.display().to_string(),
            "--verbosity".to_string(),
            self.verbosity.to_string(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageSnapshot {
    pub phase: StoragePhase,
    pub running: bool,
    pub port: Option<u16>,
    pub pid: Option<u32>,
}

struct Inner {
    phase: StoragePhase,
    generation: u64,
    child: Option<ChildHandle>,
    tasks: Vec<JoinHandle<()>>,
    config: Option<StorageConfig>,
    client: Option<StorageClient>,
    crashed: Option<u64>,
}

impl Inner {
    fn teardown(&mut self) -> Termination {
        self.generation += 1;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.phase = StoragePhase::Stopped;
        self.config = None;
        self.client = None;
        self.child.take().map(ChildHandle::terminate).unwrap_or_default()
    }
}

struct Shared {
    inner: Mutex<Inner>,
    events: broadcast::Sender<StorageEvent>,
}

pub struct StorageManager {
    settings: SharedSettings,
    data_dir: PathBuf,
    readiness: ReadinessPolicy,
    shared: Arc<Shared>,
}

impl StorageManager {
    pub fn new(settings: SharedSettings, data_dir: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        StorageManager {
            settings,
            data_dir: data_dir.into(),
            readiness: ReadinessPolicy::default(),
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    phase: StoragePhase::Stopped,
                    generation: 0,
                    child: None,
                    tasks: Vec::new(),
                    config: None,
                    client: None,
                    crashed: None,
                }),
                events,
            }),
        }
    }

    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.shared.inner.lock().phase == StoragePhase::Running
    }

    pub fn status(&self) -> StorageSnapshot {
        let inner = self.shared.inner.lock();
        StorageSnapshot {
            phase: inner.phase,
            running: inner.phase == StoragePhase::Running,
            port: inner.config.as_ref().map(|c| c.port),
            pid: inner.child.as_ref().and_then(ChildHandle::pid),
        }
    }

    /// True when the daemon is up with a config that differs from `storage`.
    pub fn needs_restart(&self, storage: &StorageSettings) -> bool {
        let inner = self.shared.inner.lock();
        inner
            .config
            .as_ref()
            .is_some_and(|running| *running != StorageConfig::from_settings(storage, &self.data_dir))
    }

    /// Spawn the daemon and wait until its API answers.
    pub async fn start(&self) -> Result<(), StorageError> {
        let config = StorageConfig::from_settings(&self.settings.lock().load().storage, &self.data_dir);
        let client = StorageClient::new(config.port, config.auth.clone())?;

        let (generation, mut exited) = {
            let mut inner = self.shared.inner.lock();
            if inner.child.is_some() || inner.phase != StoragePhase::Stopped {
                return Err(StorageError::AlreadyRunning);
            }

            let spec = SpawnSpec {
                program: resolve_binary(Daemon::Storage, &config.binary)?,
                args: config.args(),
            };
            info!("Storage: Starting {} {:?}", spec.program.display(), spec.args);
            let supervised = match spawn_supervised(&spec) {
                Ok(supervised) => supervised,
                Err(e) => {
                    emit(&self.shared.events, StorageEvent::Error(e.to_string()));
                    return Err(e.into());
                }
            };

            inner.generation += 1;
            let generation = inner.generation;
            let (exit_tx, exit_rx) = oneshot::channel();
            inner.tasks = vec![
                tokio::spawn(watch_output(self.shared.clone(), generation, supervised.lines)),
                tokio::spawn(watch_exit(
                    self.shared.clone(),
                    generation,
                    supervised.exited,
                    exit_tx,
                )),
            ];
            inner.child = Some(supervised.handle);
            inner.config = Some(config.clone());
            inner.phase = StoragePhase::Starting;
            (generation, exit_rx)
        };

        let mut ready = false;
        for attempt in 1..=self.readiness.attempts {
            tokio::select! {
                _ = tokio::time::sleep(self.readiness.interval) => {}
                crashed = &mut exited => {
                    return Err(match crashed {
                        Ok(()) => StorageError::ExitedBeforeReady,
                        Err(_) => self.interrupted(generation),
                    });
                }
            }
            if self.shared.inner.lock().generation != generation {
                return Err(self.interrupted(generation));
            }
            if client.ping().await {
                debug!("Storage: API answered after {} attempt(s)", attempt);
                ready = true;
                break;
            }
        }

        if !ready {
            warn!(
                "Storage: API did not answer after {} attempts, killing daemon",
                self.readiness.attempts
            );
            self.stop_generation(generation);
            return Err(StorageError::ReadinessTimeout(self.readiness.attempts));
        }

        let mut inner = self.shared.inner.lock();
        if inner.generation != generation {
            drop(inner);
            return Err(self.interrupted(generation));
        }
        info!("Storage: Running, API on port {}", config.port);
        inner.phase = StoragePhase::Running;
        inner.client = Some(client.clone());
        inner.tasks.push(tokio::spawn(poll_bags(
            self.shared.clone(),
            generation,
            client,
            config.poll_interval,
        )));
        emit(&self.shared.events, StorageEvent::Started);
        Ok(())
    }

    /// Stop the daemon. A no-op, without events, when nothing is running.
    ///
    /// The daemon is signalled right away; await the returned [`Termination`]
    /// before exiting so its database is closed cleanly.
    pub fn stop(&self) -> Termination {
        let mut inner = self.shared.inner.lock();
        if inner.child.is_none() {
            return Termination::default();
        }
        info!("Storage: Stopping");
        let termination = inner.teardown();
        emit(&self.shared.events, StorageEvent::Stopped);
        termination
    }

    /// Stop the daemon and wait for it to exit.
    pub async fn shutdown(&self) {
        self.stop().wait().await;
    }

    pub async fn restart(&self) -> Result<(), StorageError> {
        self.shutdown().await;
        tokio::time::sleep(RESTART_SETTLE).await;
        self.start().await
    }

    pub async fn list_bags(&self) -> Result<Vec<Bag>, StorageError> {
        let client = self.client()?;
        Ok(client.list_bags().await?.into_iter().map(Bag::from).collect())
    }

    pub async fn bag_details(&self, bag_id: &str) -> Result<BagDetails, StorageError> {
        let client = self.client()?;
        let details = client.bag_details(bag_id).await?;
        if details.bag_id.is_empty() {
            return Err(StorageError::UnknownBag(bag_id.to_string()));
        }
        Ok(details.into())
    }

    /// Start downloading `bag_id`. Without `path` it lands in the current
    /// download directory; an empty `files` list means every file.
    pub async fn add_bag(&self, bag_id: &str, path: Option<&Path>, files: &[u32]) -> Result<(), StorageError> {
        let client = self.client()?;
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => self.download_dir(),
        };
        let path = path.display().to_string();
        info!("Storage: Adding bag {} into {}", bag_id, path);
        accepted(bag_id, client.add_bag(bag_id, Some(&path), files).await?)
    }

    pub async fn remove_bag(&self, bag_id: &str, with_files: bool) -> Result<(), StorageError> {
        let client = self.client()?;
        info!("Storage: Removing bag {} (with files: {})", bag_id, with_files);
        accepted(bag_id, client.remove_bag(bag_id, with_files).await?)
    }

    pub async fn pause_bag(&self, bag_id: &str) -> Result<(), StorageError> {
        let client = self.client()?;
        accepted(bag_id, client.stop_bag(bag_id).await?)
    }

    /// The daemon has no resume call; the bag is added again at its current path.
    pub async fn resume_bag(&self, bag_id: &str) -> Result<(), StorageError> {
        let client = self.client()?;
        let details = client.bag_details(bag_id).await?;
        if details.bag_id.is_empty() {
            return Err(StorageError::UnknownBag(bag_id.to_string()));
        }
        let path = (!details.path.is_empty()).then_some(details.path.as_str());
        accepted(bag_id, client.add_bag(bag_id, path, &[]).await?)
    }

    pub async fn verify_bag(&self, bag_id: &str, only_files_existence: bool) -> Result<(), StorageError> {
        let client = self.client()?;
        accepted(bag_id, client.verify_bag(bag_id, only_files_existence).await?)
    }

    /// Seed the files under `path` as a new bag and return its id.
    pub async fn create_bag(&self, path: &Path, description: &str) -> Result<String, StorageError> {
        let client = self.client()?;
        let path = path.display().to_string();
        let created = client.create_bag(&path, description).await?;
        if created.bag_id.is_empty() {
            return Err(StorageError::Rejected(path));
        }
        info!("Storage: Created bag {} from {}", created.bag_id, path);
        Ok(created.bag_id)
    }

    fn client(&self) -> Result<StorageClient, StorageError> {
        let inner = self.shared.inner.lock();
        match (&inner.phase, &inner.client) {
            (StoragePhase::Running, Some(client)) => Ok(client.clone()),
            _ => Err(StorageError::NotRunning),
        }
    }

    // read live: changing the download directory never needs a restart
    fn download_dir(&self) -> PathBuf {
        let storage = self.settings.lock().load().storage;
        match storage.download_path.trim() {
            "" => default_download_dir(),
            path => PathBuf::from(path),
        }
    }

    fn interrupted(&self, generation: u64) -> StorageError {
        if self.shared.inner.lock().crashed == Some(generation) {
            StorageError::ExitedBeforeReady
        } else {
            StorageError::Aborted
        }
    }

    fn stop_generation(&self, generation: u64) {
        let mut inner = self.shared.inner.lock();
        if inner.generation == generation && inner.child.is_some() {
            let _ = inner.teardown();
            emit(&self.shared.events, StorageEvent::Stopped);
        }
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn accepted(bag_id: &str, response: OkResponse) -> Result<(), StorageError> {
    if response.ok {
        Ok(())
    } else {
        if let Some(reason) = &response.error {
            warn!("Storage: Request for bag {} rejected: {}", bag_id, reason);
        }
        Err(StorageError::Rejected(bag_id.to_string()))
    }
}

async fn watch_output(shared: Arc<Shared>, generation: u64, mut lines: mpsc::UnboundedReceiver<OutputLine>) {
    while let Some(line) = lines.recv().await {
        if shared.inner.lock().generation != generation {
            return;
        }
        debug!("Storage: {}", line.text());
        emit(&shared.events, StorageEvent::Log(line.text().to_string()));
    }
}

async fn watch_exit(
    shared: Arc<Shared>,
    generation: u64,
    exited: oneshot::Receiver<ExitReport>,
    notify: oneshot::Sender<()>,
) {
    let Ok(report) = exited.await else {
        return;
    };
    let mut inner = shared.inner.lock();
    if inner.generation != generation {
        return;
    }
    warn!("Storage: Daemon exited unexpectedly (code {:?})", report.code);
    inner.crashed = Some(generation);
    let _ = inner.teardown();
    emit(&shared.events, StorageEvent::Exited(report.code));
    emit(&shared.events, StorageEvent::Stopped);
    let _ = notify.send(());
}

async fn poll_bags(shared: Arc<Shared>, generation: u64, client: StorageClient, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match client.list_bags().await {
            Ok(raw) => {
                let bags: Vec<Bag> = raw.into_iter().map(Bag::from).collect();
                let inner = shared.inner.lock();
                if inner.generation != generation {
                    return;
                }
                emit(&shared.events, StorageEvent::BagsUpdated(bags));
            }
            Err(e) => warn!("Storage: Failed to poll bags: {}", e),
        }
    }
}
