// src/proxy/mod.rs

//! Supervision of the overlay network proxy.

mod circuit;
mod manager;

pub use circuit::Circuit;
pub use manager::{ProxyConfig, ProxyManager, ProxyMode, ProxySnapshot};

use serde::Serialize;

/// Printed on stdout once the proxy accepts connections.
pub const READY_MARKER: &str = "HTTP proxy listening";

/// Sync probe answer meaning the overlay is not reachable yet.
pub const NOT_SYNCED_STATUS: u16 = 502;

/// Moves forward one step at a time; any state may collapse to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    Stopped,
    Starting,
    Syncing,
    Connected,
}

impl ProxyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyStatus::Stopped => "stopped",
            ProxyStatus::Starting => "starting",
            ProxyStatus::Syncing => "syncing",
            ProxyStatus::Connected => "connected",
        }
    }
}
