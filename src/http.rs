// src/http.rs

// This module handles HTTP client creation for the storage API and the sync probe

use reqwest::{Client, Proxy};
use std::time::Duration;

const API_TIMEOUT: Duration = Duration::from_secs(10);

// Client for the storage daemon's local API. Never goes through a proxy.
pub fn create_http_client() -> reqwest::Result<Client> {
    Client::builder().no_proxy().timeout(API_TIMEOUT).build()
}

// Client that routes every request through the local overlay proxy.
pub fn create_proxied_client(proxy_port: u16, timeout: Duration) -> reqwest::Result<Client> {
    let proxy = Proxy::all(format!("http://127.0.0.1:{proxy_port}"))?;
    Client::builder().proxy(proxy).timeout(timeout).build()
}
