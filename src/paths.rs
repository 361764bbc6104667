// src/paths.rs

//! Locating the daemon binaries, their static config and the per-user dirs.

use crate::errors::PathError;
use directories::{ProjectDirs, UserDirs};
use std::env;
use std::path::{Path, PathBuf};

pub const NETWORK_CONFIG_FILE: &str = "global.config.json";

/// The two external daemons this crate supervises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Daemon {
    Proxy,
    Storage,
}

impl Daemon {
    /// File name of the binary on this platform.
    pub fn binary_name(self) -> String {
        let stem = match self {
            Daemon::Proxy => "overlay-proxy",
            Daemon::Storage => "storage-daemon",
        };
        format!("{stem}{}", env::consts::EXE_SUFFIX)
    }

    /// Environment variable that may point at the binary.
    pub fn env_var(self) -> &'static str {
        match self {
            Daemon::Proxy => "PEERLINK_PROXY_BIN",
            Daemon::Storage => "PEERLINK_STORAGE_BIN",
        }
    }
}

/// Per-user application data directory.
pub fn data_dir() -> Result<PathBuf, PathError> {
    ProjectDirs::from("org", "PeerLink", "PeerLink")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(PathError::NoDataDir)
}

/// Where bags land when the user has not picked a directory.
pub fn default_download_dir() -> PathBuf {
    UserDirs::new()
        .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
        .or_else(|| UserDirs::new().map(|dirs| dirs.home_dir().join("Downloads")))
        .unwrap_or_else(|| env::temp_dir().join("peerlink-downloads"))
}

/// Directory name for bundled binaries, e.g. `linux-x86_64`.
pub fn platform_dir() -> String {
    format!("{}-{}", env::consts::OS, env::consts::ARCH)
}

fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

fn candidates(daemon: Daemon) -> Vec<PathBuf> {
    let name = daemon.binary_name();
    let mut out = Vec::new();
    if let Some(value) = env::var_os(daemon.env_var()) {
        if !value.is_empty() {
            out.push(PathBuf::from(value));
        }
    }
    if let Some(dir) = exe_dir() {
        out.push(dir.join("bin").join(platform_dir()).join(&name));
        out.push(dir.join(&name));
    }
    if let Ok(dir) = data_dir() {
        out.push(dir.join("bin").join(&name));
    }
    out
}

/// Find the binary for `daemon`.
///
/// A non-empty `explicit` path from settings wins and must exist; otherwise
/// the environment, the bundle next to the executable and the data directory
/// are searched in that order.
pub fn resolve_binary(daemon: Daemon, explicit: &str) -> Result<PathBuf, PathError> {
    let searched = if explicit.trim().is_empty() {
        candidates(daemon)
    } else {
        vec![PathBuf::from(explicit.trim())]
    };

    searched
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .ok_or_else(|| PathError::BinaryNotFound {
            name: daemon.binary_name(),
            searched,
        })
}

/// Network config handed to the storage daemon.
///
/// Falls back to `<data dir>/global.config.json` even if it does not exist yet;
/// the daemon reports a missing file itself.
pub fn resolve_network_config(data_dir: &Path) -> PathBuf {
    if let Some(dir) = exe_dir() {
        let bundled = dir.join("resources").join(NETWORK_CONFIG_FILE);
        if bundled.is_file() {
            return bundled;
        }
    }
    data_dir.join(NETWORK_CONFIG_FILE)
}
