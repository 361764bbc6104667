// src/settings/store.rs

//! Cached, atomically persisted settings.

use super::{merge_over_defaults, migrate, validate_document, validate_fields, Category, Settings};
use crate::errors::SettingsError;
use log::{error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const SETTINGS_FILE: &str = "settings.json";

/// Settings store shared between the managers and the control surface.
pub type SharedSettings = Arc<Mutex<SettingsStore>>;

#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    cache: Option<Settings>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: None,
        }
    }

    pub fn into_shared(self) -> SharedSettings {
        Arc::new(Mutex::new(self))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Settings for this process lifetime. Only the first call touches disk.
    pub fn load(&mut self) -> Settings {
        if let Some(cached) = &self.cache {
            return cached.clone();
        }

        let settings = match self.read_from_disk() {
            Ok(None) => {
                info!(
                    "Settings: No settings file at {}, writing defaults",
                    self.path.display()
                );
                let defaults = Settings::default();
                self.persist_or_log(&defaults);
                defaults
            }
            Ok(Some(mut loaded)) => {
                if migrate(&mut loaded) {
                    info!("Settings: Migrated legacy values, saving once");
                    self.persist_or_log(&loaded);
                }
                loaded
            }
            Err(e) => {
                warn!("Settings: {}; falling back to defaults", e);
                self.quarantine();
                let defaults = Settings::default();
                self.persist_or_log(&defaults);
                defaults
            }
        };

        self.cache = Some(settings.clone());
        settings
    }

    /// Persist the whole document. Failures are logged and swallowed; the
    /// cache is only replaced once the file is on disk.
    pub fn save(&mut self, settings: Settings) -> bool {
        match self.commit(settings) {
            Ok(()) => true,
            Err(e) => {
                error!("Settings: Failed to save: {}", e);
                false
            }
        }
    }

    pub fn get(&mut self, category: Category) -> Value {
        self.load().category_value(category)
    }

    /// Merge `partial` into one category and save the result.
    ///
    /// Nothing changes, on disk or in the cache, unless the save succeeds.
    pub fn set(&mut self, category: Category, partial: &Value) -> Result<Settings, SettingsError> {
        let fields = partial.as_object().ok_or_else(|| {
            SettingsError::Invalid(format!("values for `{category}` must be an object"))
        })?;
        validate_fields(category, fields)?;

        let mut doc = serde_json::to_value(self.load())?;
        if let Some(Value::Object(target)) = doc.get_mut(category.key()) {
            for (name, value) in fields {
                target.insert(name.clone(), value.clone());
            }
        }
        let merged: Settings = serde_json::from_value(doc)?;
        self.commit(merged.clone())?;
        Ok(merged)
    }

    /// Replace everything with the compiled-in defaults.
    pub fn reset(&mut self) -> Settings {
        let defaults = Settings::default();
        if !self.save(defaults.clone()) {
            self.cache = Some(defaults.clone());
        }
        defaults
    }

    fn commit(&mut self, settings: Settings) -> Result<(), SettingsError> {
        write_atomic(&self.path, &settings)?;
        self.cache = Some(settings);
        Ok(())
    }

    fn read_from_disk(&self) -> Result<Option<Settings>, SettingsError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path).map_err(|source| SettingsError::Io {
            path: self.path.clone(),
            source,
        })?;
        let doc: Value = serde_json::from_str(&contents)?;
        validate_document(&doc)?;
        merge_over_defaults(&doc).map(Some)
    }

    fn persist_or_log(&self, settings: &Settings) {
        if let Err(e) = write_atomic(&self.path, settings) {
            error!("Settings: Failed to write {}: {}", self.path.display(), e);
        }
    }

    /// Move an unreadable settings file aside so defaults can take its place.
    fn quarantine(&self) {
        let target = sibling(&self.path, ".corrupt");
        match fs::rename(&self.path, &target) {
            Ok(()) => warn!("Settings: Kept invalid settings as {}", target.display()),
            Err(e) => warn!(
                "Settings: Could not move invalid settings {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from(SETTINGS_FILE));
    name.push(suffix);
    path.with_file_name(name)
}

/// Write to `<file>.tmp` and rename over the target.
fn write_atomic(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let io_err = |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = sibling(path, ".tmp");
    let contents = serde_json::to_string_pretty(settings)?;
    fs::write(&tmp, contents).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}
