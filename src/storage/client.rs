// src/storage/client.rs

//! Typed wrapper over the storage daemon's local HTTP control API.
//!
//! Every call hits `http://127.0.0.1:<port>/api/v1/...`. Non-2xx answers are
//! turned into [`ClientError::Status`] with the body kept verbatim; the client
//! itself never retries.

use super::bag::{RawBag, RawBagDetails};
use crate::errors::ClientError;
use crate::http::create_http_client;
use log::debug;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListResponse {
    pub bags: Vec<RawBag>,
}

/// Acknowledgement for mutating calls.
#[derive(Debug, Clone, Deserialize)]
pub struct OkResponse {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

// A 2xx with an empty body counts as success.
impl Default for OkResponse {
    fn default() -> Self {
        OkResponse { ok: true, error: None }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreatedBag {
    pub bag_id: String,
}

#[derive(Debug, Serialize)]
struct AddRequest<'a> {
    bag_id: &'a str,
    path: &'a str,
    files: &'a [u32],
    download_all: bool,
}

#[derive(Debug, Serialize)]
struct RemoveRequest<'a> {
    bag_id: &'a str,
    with_files: bool,
}

#[derive(Debug, Serialize)]
struct BagRequest<'a> {
    bag_id: &'a str,
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    bag_id: &'a str,
    only_files_existence: bool,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    path: &'a str,
    description: &'a str,
}

#[derive(Debug, Clone)]
pub struct StorageClient {
    http: reqwest::Client,
    base: Url,
    auth: Option<Credentials>,
}

impl StorageClient {
    pub fn new(port: u16, auth: Option<Credentials>) -> Result<Self, ClientError> {
        Ok(StorageClient {
            http: create_http_client()?,
            base: Url::parse(&format!("http://127.0.0.1:{port}/api/v1/"))?,
            auth,
        })
    }

    pub async fn list_bags(&self) -> Result<Vec<RawBag>, ClientError> {
        let list: ListResponse = self.get("list").await?;
        Ok(list.bags)
    }

    pub async fn bag_details(&self, bag_id: &str) -> Result<RawBagDetails, ClientError> {
        self.get(&format!("details?bag_id={}", urlencoding::encode(bag_id)))
            .await
    }

    /// Start downloading a bag. An empty `files` list downloads everything.
    pub async fn add_bag(
        &self,
        bag_id: &str,
        path: Option<&str>,
        files: &[u32],
    ) -> Result<OkResponse, ClientError> {
        let body = AddRequest {
            bag_id,
            path: path.unwrap_or(""),
            files,
            download_all: files.is_empty(),
        };
        self.post("add", &body).await
    }

    pub async fn remove_bag(&self, bag_id: &str, with_files: bool) -> Result<OkResponse, ClientError> {
        self.post("remove", &RemoveRequest { bag_id, with_files }).await
    }

    pub async fn stop_bag(&self, bag_id: &str) -> Result<OkResponse, ClientError> {
        self.post("stop", &BagRequest { bag_id }).await
    }

    pub async fn verify_bag(
        &self,
        bag_id: &str,
        only_files_existence: bool,
    ) -> Result<OkResponse, ClientError> {
        let body = VerifyRequest {
            bag_id,
            only_files_existence,
        };
        self.post("verify", &body).await
    }

    pub async fn create_bag(&self, path: &str, description: &str) -> Result<CreatedBag, ClientError> {
        self.post("create", &CreateRequest { path, description }).await
    }

    /// True when the API answers a list call. Never errors.
    pub async fn ping(&self) -> bool {
        match self.list_bags().await {
            Ok(_) => true,
            Err(e) => {
                debug!("Storage: ping failed: {}", e);
                false
            }
        }
    }

    async fn get<T: DeserializeOwned + Default>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.base.join(path)?;
        self.send(self.http.get(url)).await
    }

    async fn post<B: Serialize, T: DeserializeOwned + Default>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = self.base.join(path)?;
        self.send(self.http.post(url).json(body)).await
    }

    async fn send<T: DeserializeOwned + Default>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let request = match &self.auth {
            Some(creds) => request.basic_auth(&creds.login, Some(&creds.password)),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(T::default());
        }
        Ok(serde_json::from_str(&body)?)
    }
}
