// src/events.rs

//! Defines the message types flowing from the managers to the UI boundary

use crate::proxy::{Circuit, ProxyStatus};
use crate::storage::Bag;
use log::{debug, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Capacity of each manager's broadcast channel.
pub const EVENT_CAPACITY: usize = 256;

/// Events published by the proxy manager
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyEvent {
    /// Lifecycle status changed
    Status(ProxyStatus),

    /// A line of proxy output that is not the readiness marker
    Log(String),

    /// One of the garlic circuit hops became known or changed
    Circuit(Circuit),

    /// Something went wrong that the caller did not wait for
    Error(String),

    /// The process exited on its own
    Exited(Option<i32>),
}

/// Events published by the storage manager
#[derive(Debug, Clone, PartialEq)]
pub enum StorageEvent {
    /// The daemon answered its API and is now running
    Started,

    /// The daemon was stopped or went away
    Stopped,

    /// A line of daemon output
    Log(String),

    /// Full bag list, sent on every poll tick
    BagsUpdated(Vec<Bag>),

    Error(String),

    /// The process exited on its own
    Exited(Option<i32>),
}

/// What the UI boundary receives
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Proxy(ProxyEvent),
    Storage(StorageEvent),
}

/// Publish to a manager's subscribers. Having none is not an error.
pub fn emit<E>(tx: &broadcast::Sender<E>, event: E) {
    if tx.send(event).is_err() {
        debug!("Events: no subscribers");
    }
}

/// Helper function to send any event to the UI
pub fn send_app_event(tx: &mpsc::UnboundedSender<AppEvent>, event: AppEvent) {
    if let Err(e) = tx.send(event) {
        debug!("Events: UI sink closed: {}", e);
    }
}

/// Forwards both managers' streams into the UI sink.
///
/// `on_connected` runs each time the proxy reports
/// [`ProxyStatus::Connected`]; it is how the storage daemon gets chained
/// after the proxy during connect.
pub struct EventBridge {
    task: JoinHandle<()>,
}

impl EventBridge {
    pub fn spawn<F>(
        mut proxy: broadcast::Receiver<ProxyEvent>,
        mut storage: broadcast::Receiver<StorageEvent>,
        sink: mpsc::UnboundedSender<AppEvent>,
        on_connected: F,
    ) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut proxy_open = true;
            let mut storage_open = true;
            while proxy_open || storage_open {
                tokio::select! {
                    received = proxy.recv(), if proxy_open => match received {
                        Ok(event) => {
                            let connected = event == ProxyEvent::Status(ProxyStatus::Connected);
                            send_app_event(&sink, AppEvent::Proxy(event));
                            if connected {
                                on_connected();
                            }
                        }
                        Err(RecvError::Lagged(n)) => warn!("Events: dropped {} proxy events", n),
                        Err(RecvError::Closed) => proxy_open = false,
                    },
                    received = storage.recv(), if storage_open => match received {
                        Ok(event) => send_app_event(&sink, AppEvent::Storage(event)),
                        Err(RecvError::Lagged(n)) => warn!("Events: dropped {} storage events", n),
                        Err(RecvError::Closed) => storage_open = false,
                    },
                }
            }
        });
        EventBridge { task }
    }
}

impl Drop for EventBridge {
    fn drop(&mut self) {
        self.task.abort();
    }
}
