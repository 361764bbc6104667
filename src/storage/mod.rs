// src/storage/mod.rs

//! Supervision of the storage daemon and access to its bags.

mod bag;
mod client;
mod manager;

pub use bag::{Bag, BagDetails, BagFile, BagPeer, BagStatus, RawBag, RawBagDetails};
pub use client::{Credentials, OkResponse, StorageClient};
pub use manager::{ReadinessPolicy, StorageConfig, StorageManager, StoragePhase, StorageSnapshot};
