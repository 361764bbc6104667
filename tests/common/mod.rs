// tests/common/mod.rs

// Shared helpers for integration tests: a fake storage HTTP API and
// shell-script stand-ins for the daemon binaries.

#![allow(dead_code)]

use parking_lot::Mutex;
use peerlink::settings::{Category, SettingsStore, SharedSettings, SETTINGS_FILE};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tiny_http::{Header, Response, Server};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

pub const BAG_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const BAG_B: &str = "0123456789ABCDEF0123456789abcdef0123456789ABCDEF0123456789abcdef";

/// A request as seen by the fake API.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub url: String,
    pub body: String,
    pub authorization: Option<String>,
}

impl Recorded {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

type Handler = Box<dyn Fn(&Recorded) -> (u16, String) + Send + 'static>;

/// Storage API stand-in answering on 127.0.0.1 with a random port.
pub struct FakeApi {
    server: Arc<Server>,
    port: u16,
    requests: Arc<Mutex<Vec<Recorded>>>,
    thread: Option<JoinHandle<()>>,
}

impl FakeApi {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&Recorded) -> (u16, String) + Send + 'static,
    {
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let port = server.server_addr().to_ip().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Box::new(handler);

        let thread = {
            let server = server.clone();
            let requests = requests.clone();
            std::thread::spawn(move || {
                while let Ok(mut request) = server.recv() {
                    let mut body = String::new();
                    let _ = request.as_reader().read_to_string(&mut body);
                    let authorization = request
                        .headers()
                        .iter()
                        .find(|h| h.field.equiv("Authorization"))
                        .map(|h| h.value.as_str().to_string());
                    let recorded = Recorded {
                        method: request.method().to_string(),
                        url: request.url().to_string(),
                        body,
                        authorization,
                    };
                    let (status, reply) = handler(&recorded);
                    requests.lock().push(recorded);

                    let content_type =
                        Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap();
                    let response = Response::from_string(reply)
                        .with_status_code(status)
                        .with_header(content_type);
                    let _ = request.respond(response);
                }
            })
        };

        FakeApi {
            server,
            port,
            requests,
            thread: Some(thread),
        }
    }

    /// Answers `list` with `bags_json` and acknowledges everything else.
    pub fn with_bags(bags_json: impl Into<String>) -> Self {
        let bags_json = bags_json.into();
        Self::start(move |req| {
            if req.url.starts_with("/api/v1/list") {
                (200, format!(r#"{{"bags": {}}}"#, bags_json))
            } else {
                (200, r#"{"ok": true}"#.to_string())
            }
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }

    /// Requests other than `list`, which the poll and ping loops send constantly.
    pub fn commands(&self) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| !r.url.starts_with("/api/v1/list"))
            .collect()
    }
}

impl Drop for FakeApi {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A port nothing listens on, at least right after this returns.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn bag_json(id: &str, active: bool, completed: bool) -> String {
    format!(
        r#"{{"bag_id": "{id}", "description": "bag {id}", "downloaded": 50, "size": 100,
            "peers": 3, "download_speed": 10.5, "upload_speed": 0.0, "files_count": 2,
            "dir_name": "dir", "completed": {completed}, "active": {active}}}"#
    )
}

/// Write an executable shell script to `dir/name`.
#[cfg(unix)]
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Settings store in `dir` with `overrides` applied per category.
pub fn settings_in(dir: &Path, overrides: &[(Category, serde_json::Value)]) -> SharedSettings {
    let settings = SettingsStore::new(dir.join(SETTINGS_FILE)).into_shared();
    for (category, partial) in overrides {
        settings.lock().set(*category, partial).unwrap();
    }
    settings
}

/// Next event matching `pred`, skipping the rest. Panics after ten seconds.
pub async fn wait_for<E, F>(rx: &mut broadcast::Receiver<E>, pred: F) -> E
where
    E: Clone,
    F: Fn(&E) -> bool,
{
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await;
    found.expect("timed out waiting for event")
}

/// True if nothing at all arrives within `quiet`.
pub async fn stays_quiet<E: Clone>(rx: &mut broadcast::Receiver<E>, quiet: Duration) -> bool {
    tokio::time::timeout(quiet, rx.recv()).await.is_err()
}

/// HTTP proxy stand-in that answers every request with one status code.
pub struct FakeProxy {
    port: u16,
    status: Arc<AtomicU16>,
    hits: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FakeProxy {
    pub fn start(status: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let status = Arc::new(AtomicU16::new(status));
        let hits = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let (status, hits, stop) = (status.clone(), hits.clone(), stop.clone());
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(mut stream) = stream else { continue };
                    let mut seen = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => seen.extend_from_slice(&buf[..n]),
                        }
                    }
                    hits.fetch_add(1, Ordering::SeqCst);
                    let code = status.load(Ordering::SeqCst);
                    let _ = write!(
                        stream,
                        "HTTP/1.1 {code} Fake\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    );
                }
            })
        };

        FakeProxy {
            port,
            status,
            hits,
            stop,
            thread: Some(thread),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for FakeProxy {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // wake the accept loop
        let _ = std::net::TcpStream::connect(("127.0.0.1", self.port));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
