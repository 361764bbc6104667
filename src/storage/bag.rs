// src/storage/bag.rs

//! Bag records as reported by the storage daemon and as shown to the UI.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BagStatus {
    Downloading,
    Seeding,
    Paused,
    Error,
}

impl BagStatus {
    /// Priority-ordered: an inactive bag is paused whatever else it reports.
    pub fn derive(active: bool, completed: bool) -> Self {
        if !active {
            BagStatus::Paused
        } else if completed {
            BagStatus::Seeding
        } else {
            BagStatus::Downloading
        }
    }
}

/// One entry of the daemon's `list` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawBag {
    pub bag_id: String,
    pub description: String,
    pub downloaded: u64,
    pub size: u64,
    pub peers: u64,
    pub download_speed: f64,
    pub upload_speed: f64,
    pub files_count: u64,
    pub dir_name: String,
    pub completed: bool,
    pub header_loaded: bool,
    pub info_loaded: bool,
    pub active: bool,
    pub seeding: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawFile {
    pub index: u32,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawPeer {
    pub addr: String,
    pub id: String,
    pub download_speed: f64,
    pub upload_speed: f64,
}

/// The daemon's `details` response. Unlike the list entry, `peers` is a list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawBagDetails {
    pub bag_id: String,
    pub description: String,
    pub downloaded: u64,
    pub size: u64,
    pub download_speed: f64,
    pub upload_speed: f64,
    pub files_count: u64,
    pub dir_name: String,
    pub path: String,
    pub completed: bool,
    pub active: bool,
    pub seeding: bool,
    pub files: Vec<RawFile>,
    pub peers: Vec<RawPeer>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bag {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub downloaded: u64,
    pub download_speed: f64,
    pub upload_speed: f64,
    pub peers: u64,
    pub files_count: u64,
    pub status: BagStatus,
}

impl Bag {
    /// Fraction downloaded in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.size == 0 {
            0.0
        } else {
            (self.downloaded as f64 / self.size as f64).min(1.0)
        }
    }
}

fn display_name(description: &str, dir_name: &str, id: &str) -> String {
    [description, dir_name]
        .into_iter()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or(id)
        .to_string()
}

impl From<RawBag> for Bag {
    fn from(raw: RawBag) -> Self {
        Bag {
            name: display_name(&raw.description, &raw.dir_name, &raw.bag_id),
            status: BagStatus::derive(raw.active, raw.completed),
            id: raw.bag_id,
            size: raw.size,
            downloaded: raw.downloaded,
            download_speed: raw.download_speed,
            upload_speed: raw.upload_speed,
            peers: raw.peers,
            files_count: raw.files_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BagFile {
    pub index: u32,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BagPeer {
    pub address: String,
    pub id: String,
    pub download_speed: f64,
    pub upload_speed: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BagDetails {
    pub bag: Bag,
    pub path: String,
    pub files: Vec<BagFile>,
    pub peer_list: Vec<BagPeer>,
}

impl From<RawBagDetails> for BagDetails {
    fn from(raw: RawBagDetails) -> Self {
        let bag = Bag {
            id: raw.bag_id.clone(),
            name: display_name(&raw.description, &raw.dir_name, &raw.bag_id),
            size: raw.size,
            downloaded: raw.downloaded,
            download_speed: raw.download_speed,
            upload_speed: raw.upload_speed,
            peers: raw.peers.len() as u64,
            files_count: raw.files_count,
            status: BagStatus::derive(raw.active, raw.completed),
        };
        BagDetails {
            bag,
            path: raw.path,
            files: raw
                .files
                .into_iter()
                .map(|f| BagFile {
                    index: f.index,
                    name: f.name,
                    size: f.size,
                })
                .collect(),
            peer_list: raw
                .peers
                .into_iter()
                .map(|p| BagPeer {
                    address: p.addr,
                    id: p.id,
                    download_speed: p.download_speed,
                    upload_speed: p.upload_speed,
                })
                .collect(),
        }
    }
}
