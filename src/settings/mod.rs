// src/settings/mod.rs

//! Persisted application settings.
//!
//! Settings are grouped into categories, each a flat record of typed fields.
//! The on-disk form is a pretty-printed JSON object keyed by category name,
//! with camelCase field names. Documents are type-checked against [`schema`]
//! before they are merged over the compiled-in defaults.

mod store;

pub use store::{SettingsStore, SharedSettings, SETTINGS_FILE};

use crate::errors::SettingsError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Scheme used for built-in pages.
pub const INTERNAL_SCHEME: &str = "peerlink";

/// Old theme names and the names that replaced them.
const LEGACY_THEMES: &[(&str, &str)] = &[("midnight", "dark"), ("daylight", "light")];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneralSettings {
    pub homepage: String,
    pub auto_connect: bool,
    pub restore_session: bool,
    pub language: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            homepage: format!("{INTERNAL_SCHEME}://home"),
            auto_connect: true,
            restore_session: false,
            language: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkSettings {
    pub proxy_port: i64,
    /// `direct` or `garlic`.
    pub proxy_mode: String,
    /// Garlic circuit rotation, seconds.
    pub rotation_interval: i64,
    pub sync_domain: String,
    /// Milliseconds between sync probes.
    pub sync_check_interval: i64,
    /// Seconds to wait for the readiness marker.
    pub startup_timeout: i64,
    /// Explicit proxy binary; empty means auto-resolve.
    pub proxy_binary: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            proxy_port: 8080,
            proxy_mode: "direct".to_string(),
            rotation_interval: 600,
            sync_domain: "sync.overlay".to_string(),
            sync_check_interval: 3000,
            startup_timeout: 60,
            proxy_binary: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub enabled: bool,
    pub api_port: i64,
    pub verbosity: i64,
    /// Empty means the user's download directory.
    pub download_path: String,
    /// Milliseconds between bag list polls.
    pub poll_interval: i64,
    /// Empty means `<data dir>/storage-db`.
    pub db_path: String,
    pub storage_binary: String,
    pub api_login: String,
    pub api_password: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            api_port: 5555,
            verbosity: 1,
            download_path: String::new(),
            poll_interval: 2000,
            db_path: String::new(),
            storage_binary: String::new(),
            api_login: String::new(),
            api_password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppearanceSettings {
    pub theme: String,
    pub font_size: i64,
    pub show_bookmarks_bar: bool,
}

impl Default for AppearanceSettings {
    fn default() -> Self {
        Self {
            theme: "dark".to_string(),
            font_size: 14,
            show_bookmarks_bar: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PrivacySettings {
    pub clear_on_exit: bool,
    pub do_not_track: bool,
    pub block_third_party_cookies: bool,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            clear_on_exit: false,
            do_not_track: true,
            block_third_party_cookies: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvancedSettings {
    pub log_level: String,
    pub dev_tools: bool,
    pub max_log_lines: i64,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            dev_tools: false,
            max_log_lines: 1000,
        }
    }
}

/// The whole settings document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub network: NetworkSettings,
    pub storage: StorageSettings,
    pub appearance: AppearanceSettings,
    pub privacy: PrivacySettings,
    pub advanced: AdvancedSettings,
    /// Categories written by newer versions; kept so they survive a save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Settings {
    /// JSON form of a single category.
    pub fn category_value(&self, category: Category) -> Value {
        let value = match category {
            Category::General => serde_json::to_value(&self.general),
            Category::Network => serde_json::to_value(&self.network),
            Category::Storage => serde_json::to_value(&self.storage),
            Category::Appearance => serde_json::to_value(&self.appearance),
            Category::Privacy => serde_json::to_value(&self.privacy),
            Category::Advanced => serde_json::to_value(&self.advanced),
        };
        value.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    General,
    Network,
    Storage,
    Appearance,
    Privacy,
    Advanced,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::General,
        Category::Network,
        Category::Storage,
        Category::Appearance,
        Category::Privacy,
        Category::Advanced,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Category::General => "general",
            Category::Network => "network",
            Category::Storage => "storage",
            Category::Appearance => "appearance",
            Category::Privacy => "privacy",
            Category::Advanced => "advanced",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Category {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.key() == s)
            .ok_or_else(|| SettingsError::UnknownCategory(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Bool,
    String,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::Integer => value.is_i64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::String => value.is_string(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            FieldType::Integer => "an integer",
            FieldType::Bool => "a boolean",
            FieldType::String => "a string",
        }
    }
}

/// Declared field types per category.
pub fn schema(category: Category) -> &'static [(&'static str, FieldType)] {
    use FieldType::*;
    match category {
        Category::General => &[
            ("homepage", String),
            ("autoConnect", Bool),
            ("restoreSession", Bool),
            ("language", String),
        ],
        Category::Network => &[
            ("proxyPort", Integer),
            ("proxyMode", String),
            ("rotationInterval", Integer),
            ("syncDomain", String),
            ("syncCheckInterval", Integer),
            ("startupTimeout", Integer),
            ("proxyBinary", String),
        ],
        Category::Storage => &[
            ("enabled", Bool),
            ("apiPort", Integer),
            ("verbosity", Integer),
            ("downloadPath", String),
            ("pollInterval", Integer),
            ("dbPath", String),
            ("storageBinary", String),
            ("apiLogin", String),
            ("apiPassword", String),
        ],
        Category::Appearance => &[
            ("theme", String),
            ("fontSize", Integer),
            ("showBookmarksBar", Bool),
        ],
        Category::Privacy => &[
            ("clearOnExit", Bool),
            ("doNotTrack", Bool),
            ("blockThirdPartyCookies", Bool),
        ],
        Category::Advanced => &[
            ("logLevel", String),
            ("devTools", Bool),
            ("maxLogLines", Integer),
        ],
    }
}

/// Type-check the known fields of one category. Absent fields are fine.
pub fn validate_fields(category: Category, fields: &Map<String, Value>) -> Result<(), SettingsError> {
    for (name, ty) in schema(category) {
        if let Some(value) = fields.get(*name) {
            if !ty.matches(value) {
                return Err(SettingsError::Invalid(format!(
                    "{}.{} must be {}, found {}",
                    category,
                    name,
                    ty.name(),
                    value
                )));
            }
        }
    }
    Ok(())
}

/// Check the shape of a whole settings document.
///
/// A single wrong-typed field rejects the entire document.
pub fn validate_document(doc: &Value) -> Result<(), SettingsError> {
    let root = doc
        .as_object()
        .ok_or_else(|| SettingsError::Invalid("top-level value must be an object".to_string()))?;

    for category in Category::ALL {
        let Some(section) = root.get(category.key()) else {
            continue;
        };
        let fields = section.as_object().ok_or_else(|| {
            SettingsError::Invalid(format!("category `{category}` must be an object"))
        })?;
        validate_fields(category, fields)?;
    }
    Ok(())
}

/// Merge a validated document over the defaults, category by category.
pub fn merge_over_defaults(doc: &Value) -> Result<Settings, SettingsError> {
    let mut base = serde_json::to_value(Settings::default())?;
    if let (Some(target), Some(incoming)) = (base.as_object_mut(), doc.as_object()) {
        merge_categories(target, incoming);
    }
    Ok(serde_json::from_value(base)?)
}

fn merge_categories(target: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(fields)) => {
                for (field, v) in fields {
                    existing.insert(field.clone(), v.clone());
                }
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Rewrite retired values to their current names. Returns true if anything changed.
pub fn migrate(settings: &mut Settings) -> bool {
    for (legacy, current) in LEGACY_THEMES {
        if settings.appearance.theme == *legacy {
            settings.appearance.theme = current.to_string();
            return true;
        }
    }
    false
}
