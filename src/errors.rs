// src/errors.rs

//! Error types shared across the supervisor.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("I/O error on settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid settings: {0}")]
    Invalid(String),

    #[error("Unknown settings category: {0}")]
    UnknownCategory(String),
}

#[derive(Error, Debug)]
pub enum PathError {
    #[error("Binary `{name}` not found (searched: {searched:?})")]
    BinaryNotFound { name: String, searched: Vec<PathBuf> },

    #[error("Could not determine the per-user data directory")]
    NoDataDir,
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Request to storage API failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Storage API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode storage API response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid storage API URL: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Binary(#[from] PathError),

    #[error(transparent)]
    Spawn(#[from] ProcessError),

    #[error("Proxy did not become ready within {0} seconds")]
    ReadinessTimeout(u64),

    #[error("Proxy exited before becoming ready")]
    ExitedBeforeReady,

    #[error("Proxy start was aborted by a stop request")]
    Aborted,

    #[error("Failed to build sync probe client: {0}")]
    Probe(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage daemon is already running")]
    AlreadyRunning,

    #[error("Storage daemon is not running")]
    NotRunning,

    #[error(transparent)]
    Binary(#[from] PathError),

    #[error(transparent)]
    Spawn(#[from] ProcessError),

    #[error("Storage API did not answer after {0} attempts")]
    ReadinessTimeout(u32),

    #[error("Storage daemon exited before becoming ready")]
    ExitedBeforeReady,

    #[error("Storage start was aborted by a stop request")]
    Aborted,

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Storage daemon rejected the request for bag {0}")]
    Rejected(String),

    #[error("Bag {0} is not known to the storage daemon")]
    UnknownBag(String),
}

/// Why a control request was refused before reaching a manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("URL must not be empty")]
    EmptyUrl,

    #[error("Dangerous URL scheme blocked: {0}")]
    DangerousScheme(String),

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid URL format")]
    MalformedUrl,

    #[error("Invalid bag ID: expected 64 hexadecimal characters")]
    InvalidBagId,

    #[error("Download path must not be empty")]
    EmptyPath,

    #[error("Download path must be absolute: {0}")]
    RelativePath(String),

    #[error("Download path points into a protected system directory: {0}")]
    ProtectedPath(String),

    #[error("Download path must be inside the home, temp or user data directories: {0}")]
    OutsideAllowedRoots(String),
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Too many requests, please slow down")]
    RateLimited,

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
