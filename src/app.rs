// src/app.rs

//! Control surface handed to the UI layer.
//!
//! `App` owns the settings store, both managers and the event bridge for the
//! lifetime of the process. Every request coming from the UI passes through
//! here, where it is rate limited and validated before reaching a manager.

use crate::errors::{ControlError, ValidationError};
use crate::events::{AppEvent, EventBridge};
use crate::proxy::{ProxyManager, ProxySnapshot, ProxyStatus};
use crate::settings::{Category, Settings, SharedSettings};
use crate::storage::{Bag, BagDetails, StorageManager, StorageSnapshot};
use crate::validation::{
    is_valid_bag_id, validate_download_path, validate_navigation_url, RateLimiter,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

const MINUTE: Duration = Duration::from_secs(60);
const NAVIGATE_PER_MINUTE: usize = 60;
const BAG_MUTATIONS_PER_MINUTE: usize = 30;
const DOWNLOAD_PATH_CHANGES_PER_MINUTE: usize = 10;

struct Limits {
    navigate: RateLimiter,
    bags: RateLimiter,
    download_path: RateLimiter,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            navigate: RateLimiter::new(NAVIGATE_PER_MINUTE, MINUTE),
            bags: RateLimiter::new(BAG_MUTATIONS_PER_MINUTE, MINUTE),
            download_path: RateLimiter::new(DOWNLOAD_PATH_CHANGES_PER_MINUTE, MINUTE),
        }
    }
}

pub struct App {
    settings: SharedSettings,
    proxy: Arc<ProxyManager>,
    storage: Arc<StorageManager>,
    limits: Mutex<Limits>,
    _bridge: EventBridge,
}

impl App {
    /// Build the app with managers for `data_dir`. Must be called inside a
    /// tokio runtime.
    pub fn new(settings: SharedSettings, data_dir: &Path, sink: mpsc::UnboundedSender<AppEvent>) -> Self {
        let proxy = ProxyManager::new(settings.clone());
        let storage = StorageManager::new(settings.clone(), data_dir);
        Self::with_managers(settings, proxy, storage, sink)
    }

    pub fn with_managers(
        settings: SharedSettings,
        proxy: ProxyManager,
        storage: StorageManager,
        sink: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let proxy = Arc::new(proxy);
        let storage = Arc::new(storage);
        let bridge = EventBridge::spawn(
            proxy.subscribe(),
            storage.subscribe(),
            sink,
            start_storage_when_connected(settings.clone(), Arc::downgrade(&proxy), Arc::downgrade(&storage)),
        );
        App {
            settings,
            proxy,
            storage,
            limits: Mutex::new(Limits::default()),
            _bridge: bridge,
        }
    }

    /// Start the proxy. Storage follows once the proxy reports connected.
    pub async fn connect(&self) -> Result<(), ControlError> {
        info!("App: Connecting");
        self.proxy.start().await?;
        Ok(())
    }

    /// Signal both daemons to stop without waiting for them.
    pub fn disconnect(&self) {
        info!("App: Disconnecting");
        let _ = self.storage.stop();
        let _ = self.proxy.stop();
    }

    /// Stop both daemons and wait until they have exited. Call this before
    /// the runtime goes away, otherwise the children are killed outright.
    pub async fn shutdown(&self) {
        info!("App: Shutting down");
        let storage = self.storage.stop();
        let proxy = self.proxy.stop();
        tokio::join!(storage.wait(), proxy.wait());
    }

    pub fn proxy_status(&self) -> ProxySnapshot {
        self.proxy.status()
    }

    pub fn storage_status(&self) -> StorageSnapshot {
        self.storage.status()
    }

    pub fn storage_running(&self) -> bool {
        self.storage.is_running()
    }

    pub fn settings_get(&self, category: &str) -> Result<Value, ControlError> {
        let category: Category = category.parse()?;
        Ok(self.settings.lock().get(category))
    }

    /// Merge `partial` into `category` and persist it.
    ///
    /// A running daemon whose settings changed is restarted before this
    /// returns. Returns the category as stored.
    pub async fn settings_set(&self, category: &str, partial: &Value) -> Result<Value, ControlError> {
        let category: Category = category.parse()?;
        let updated = self.settings.lock().set(category, partial)?;

        match category {
            Category::Network if self.proxy.needs_restart(&updated.network) => {
                info!("App: Network settings changed, restarting proxy");
                self.proxy.restart().await?;
            }
            Category::Storage if self.storage.needs_restart(&updated.storage) => {
                info!("App: Storage settings changed, restarting storage daemon");
                self.storage.restart().await?;
            }
            _ => {}
        }
        Ok(updated.category_value(category))
    }

    pub fn settings_reset(&self) -> Settings {
        info!("App: Resetting settings to defaults");
        self.settings.lock().reset()
    }

    /// Check a navigation request and return the URL to load.
    pub fn navigate(&self, url: &str) -> Result<String, ControlError> {
        if !self.limits.lock().navigate.check() {
            return Err(ControlError::RateLimited);
        }
        Ok(validate_navigation_url(url)?)
    }

    pub async fn list_bags(&self) -> Result<Vec<Bag>, ControlError> {
        Ok(self.storage.list_bags().await?)
    }

    pub async fn bag_details(&self, bag_id: &str) -> Result<BagDetails, ControlError> {
        check_bag_id(bag_id)?;
        Ok(self.storage.bag_details(bag_id).await?)
    }

    /// Add a bag. `path` overrides the download directory and is validated
    /// like one.
    pub async fn add_bag(&self, bag_id: &str, path: Option<&str>, files: &[u32]) -> Result<(), ControlError> {
        check_bag_id(bag_id)?;
        let path = path.map(validate_download_path).transpose()?;
        self.bag_mutation()?;
        Ok(self.storage.add_bag(bag_id, path.as_deref(), files).await?)
    }

    pub async fn remove_bag(&self, bag_id: &str, with_files: bool) -> Result<(), ControlError> {
        check_bag_id(bag_id)?;
        self.bag_mutation()?;
        Ok(self.storage.remove_bag(bag_id, with_files).await?)
    }

    pub async fn pause_bag(&self, bag_id: &str) -> Result<(), ControlError> {
        check_bag_id(bag_id)?;
        self.bag_mutation()?;
        Ok(self.storage.pause_bag(bag_id).await?)
    }

    pub async fn resume_bag(&self, bag_id: &str) -> Result<(), ControlError> {
        check_bag_id(bag_id)?;
        self.bag_mutation()?;
        Ok(self.storage.resume_bag(bag_id).await?)
    }

    pub async fn verify_bag(&self, bag_id: &str) -> Result<(), ControlError> {
        check_bag_id(bag_id)?;
        self.bag_mutation()?;
        Ok(self.storage.verify_bag(bag_id, false).await?)
    }

    /// Share the files under `path` as a new bag. Returns its id.
    pub async fn create_bag(&self, path: &str, description: &str) -> Result<String, ControlError> {
        let path = validate_download_path(path)?;
        self.bag_mutation()?;
        Ok(self.storage.create_bag(&path, description).await?)
    }

    /// Change where new bags are downloaded. Takes effect for the next add.
    pub fn set_download_path(&self, path: &str) -> Result<PathBuf, ControlError> {
        if !self.limits.lock().download_path.check() {
            return Err(ControlError::RateLimited);
        }
        let path = validate_download_path(path)?;
        let partial = json!({ "downloadPath": path.display().to_string() });
        self.settings.lock().set(Category::Storage, &partial)?;
        info!("App: Download path set to {}", path.display());
        Ok(path)
    }

    fn bag_mutation(&self) -> Result<(), ControlError> {
        if self.limits.lock().bags.check() {
            Ok(())
        } else {
            Err(ControlError::RateLimited)
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn check_bag_id(bag_id: &str) -> Result<(), ValidationError> {
    if is_valid_bag_id(bag_id) {
        Ok(())
    } else {
        Err(ValidationError::InvalidBagId)
    }
}

// Chains storage after the proxy during connect. The proxy must still be
// connected when the start begins and when it completes.
fn start_storage_when_connected(
    settings: SharedSettings,
    proxy: Weak<ProxyManager>,
    storage: Weak<StorageManager>,
) -> impl Fn() + Send + 'static {
    move || {
        if !settings.lock().load().storage.enabled {
            return;
        }
        let (Some(proxy), Some(storage)) = (proxy.upgrade(), storage.upgrade()) else {
            return;
        };
        if storage.status().pid.is_some() {
            return;
        }
        tokio::spawn(async move {
            let connected = || proxy.status().status == ProxyStatus::Connected;
            if !connected() {
                debug!("App: Proxy left connected state, not starting storage");
                return;
            }
            if let Err(e) = storage.start().await {
                warn!("App: Storage daemon failed to start: {}", e);
                return;
            }
            if !connected() {
                info!("App: Proxy went away while storage was starting, stopping it");
                storage.shutdown().await;
            }
        });
    }
}
