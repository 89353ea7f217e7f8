//! HTTP remote storage adapter
//!
//! Implements [`RemoteStorage`] against a JSON/REST drive API with
//! Graph-style item resources:
//!
//! | Operation       | Request                                                   |
//! |-----------------|-----------------------------------------------------------|
//! | `list`          | `GET  /items/{id}/children`                               |
//! | `download`      | `GET  /items/{id}/content`                                |
//! | `begin_upload`  | `POST /items/{parent}:/{name}:/createUploadSession`       |
//! | `upload_chunk`  | `PUT  {uploadUrl}` with `Content-Range`                   |
//! | `delete`        | `DELETE /items/{id}`                                      |
//! | `move_item`     | `PATCH /items/{id}`                                       |
//! | `create_folder` | `POST /items/{parent}/children`                           |
//!
//! The remote root is addressed as the item `root`.
//!
//! ## Error mapping
//!
//! - connect failures and timeouts become [`NetworkFailure`]
//! - 401 and 403 become [`DomainError::AccessDenied`]
//! - a body that is not JSON, or JSON of the wrong shape, becomes
//!   [`MalformedResponse`] carrying status, headers and a body preview
//! - any other non-success status becomes [`TransferError::Status`]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use nimbus_core::{
    classify::{truncate_chars, MalformedResponse, NetworkFailure, ResponseDiagnostics},
    domain::{ContentHash, DomainError, EntryKind, RemoteId, RemoteItem},
    ports::{ByteStream, ChunkOutcome, RemoteStorage, TokenProvider, UploadSession},
};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use tracing::debug;

use crate::TransferError;

/// Item id addressing the remote root
const ROOT_ITEM: &str = "root";

// ============================================================================
// API response types
// ============================================================================

/// Item resource as returned by the API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiItem {
    id: String,
    name: String,
    size: Option<u64>,
    last_modified_date_time: Option<DateTime<Utc>>,
    parent_reference: Option<ParentReference>,
    file: Option<FileFacet>,
    folder: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ParentReference {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileFacet {
    hashes: Option<FileHashes>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileHashes {
    sha256_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemPage {
    value: Vec<ApiItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSessionResponse {
    upload_url: String,
}

impl ApiItem {
    fn into_remote_item(self) -> Result<RemoteItem> {
        let id = RemoteId::new(self.id)?;
        let parent_id = self
            .parent_reference
            .and_then(|p| p.id)
            .filter(|p| p != ROOT_ITEM)
            .map(RemoteId::new)
            .transpose()?;
        let kind = if self.folder.is_some() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let content_hash = self
            .file
            .and_then(|f| f.hashes)
            .and_then(|h| h.sha256_hash)
            .map(ContentHash::new)
            .transpose()?;

        Ok(RemoteItem {
            id,
            parent_id,
            name: self.name,
            kind,
            size: if kind == EntryKind::Directory {
                0
            } else {
                self.size.unwrap_or(0)
            },
            content_hash,
            modified: self.last_modified_date_time.unwrap_or_else(Utc::now),
        })
    }
}

// ============================================================================
// HttpRemoteStorage
// ============================================================================

/// [`RemoteStorage`] over HTTP
pub struct HttpRemoteStorage {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpRemoteStorage {
    /// Creates an adapter for the API at `base_url`
    ///
    /// # Arguments
    /// * `base_url` - API root without trailing slash
    /// * `tokens` - Supplies the bearer token for each request
    /// * `timeout` - Deadline for connecting and for each read, so a stalled
    ///   server surfaces as a network failure
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            base_url,
            tokens,
        })
    }

    /// Replaces the underlying HTTP client (custom timeouts, proxies)
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// API root
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn item_ref(id: Option<&RemoteId>) -> &str {
        id.map(RemoteId::as_str).unwrap_or(ROOT_ITEM)
    }

    /// Authenticated request for a path relative to the API root
    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        self.request_url(method, &format!("{}{}", self.base_url, path))
            .await
    }

    /// Authenticated request for an absolute URL
    async fn request_url(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        let token = self
            .tokens
            .access_token()
            .await
            .context("Failed to obtain access token")?;
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    /// Sends a request, mapping transport failures and error statuses
    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(|e| transport_error(operation, e))?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(DomainError::AccessDenied(format!("{operation}: HTTP {}", status.as_u16())).into())
            }
            StatusCode::NOT_FOUND => Err(DomainError::NotFound(operation.to_string()).into()),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(TransferError::Status {
                    operation: operation.to_string(),
                    status: status.as_u16(),
                    message: truncate_chars(&body, 200),
                }
                .into())
            }
        }
    }

    async fn fetch_item(&self, operation: &str, request: RequestBuilder) -> Result<RemoteItem> {
        let response = self.send(operation, request).await?;
        let item: ApiItem = parse_json(response).await?;
        item.into_remote_item()
    }
}

impl std::fmt::Debug for HttpRemoteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteStorage")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Maps a reqwest transport error onto the classifier's vocabulary
fn transport_error(operation: &str, error: reqwest::Error) -> anyhow::Error {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        NetworkFailure::new(format!("{operation}: {error}")).into()
    } else {
        anyhow::Error::new(error).context(format!("{operation} failed"))
    }
}

/// Reads the body as JSON, capturing diagnostics if it is anything else
async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                v.to_str().unwrap_or("<binary>").to_string(),
            )
        })
        .collect();

    let body = response
        .text()
        .await
        .map_err(|e| NetworkFailure::new(format!("reading response body: {e}")))?;

    let is_json = content_type
        .as_deref()
        .is_some_and(|ct| ct.contains("json"));
    let parsed = if is_json {
        serde_json::from_str::<T>(&body).ok()
    } else {
        None
    };

    parsed.ok_or_else(|| {
        MalformedResponse(ResponseDiagnostics::new(
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            content_type.clone(),
            headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            &body,
        ))
        .into()
    })
}

#[async_trait::async_trait]
impl RemoteStorage for HttpRemoteStorage {
    async fn begin_upload(
        &self,
        parent_id: Option<&RemoteId>,
        name: &str,
        total_size: u64,
    ) -> Result<UploadSession> {
        let path = format!(
            "/items/{}:/{}:/createUploadSession",
            Self::item_ref(parent_id),
            name
        );
        let request = self
            .request(Method::POST, &path)
            .await?
            .json(&serde_json::json!({ "item": { "name": name } }));
        let response = self.send("begin_upload", request).await?;
        let session: UploadSessionResponse = parse_json(response).await?;

        debug!(name, total_size, "Upload session created");
        Ok(UploadSession {
            locator: session.upload_url,
            total_size,
        })
    }

    async fn upload_chunk(
        &self,
        session: &UploadSession,
        offset: u64,
        bytes: Vec<u8>,
    ) -> Result<ChunkOutcome> {
        let len = bytes.len() as u64;
        let content_range = if len == 0 {
            format!("bytes */{}", session.total_size)
        } else {
            format!("bytes {}-{}/{}", offset, offset + len - 1, session.total_size)
        };

        let request = self
            .request_url(Method::PUT, &session.locator)
            .await?
            .header(reqwest::header::CONTENT_LENGTH, len.to_string())
            .header(reqwest::header::CONTENT_RANGE, &content_range)
            .body(bytes);
        let response = self.send("upload_chunk", request).await?;

        if response.status() == StatusCode::ACCEPTED {
            debug!(range = %content_range, "Chunk accepted");
            return Ok(ChunkOutcome::Pending);
        }

        let item: ApiItem = parse_json(response).await?;
        Ok(ChunkOutcome::Complete(item.into_remote_item()?))
    }

    async fn download(&self, id: &RemoteId) -> Result<ByteStream> {
        let path = format!("/items/{}/content", id.as_str());
        let request = self.request(Method::GET, &path).await?;
        let response = self.send("download", request).await?;

        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|b| b.to_vec())
                .map_err(|e| anyhow::Error::from(NetworkFailure::new(format!("download stream: {e}"))))
        });
        Ok(Box::pin(stream))
    }

    async fn list(&self, folder_id: Option<&RemoteId>) -> Result<Vec<RemoteItem>> {
        let path = format!("/items/{}/children", Self::item_ref(folder_id));
        let request = self.request(Method::GET, &path).await?;
        let response = self.send("list", request).await?;
        let page: ItemPage = parse_json(response).await?;

        page.value
            .into_iter()
            .map(ApiItem::into_remote_item)
            .collect()
    }

    async fn delete(&self, id: &RemoteId) -> Result<()> {
        let path = format!("/items/{}", id.as_str());
        let request = self.request(Method::DELETE, &path).await?;
        match self.send("delete", request).await {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.downcast_ref::<DomainError>(), Some(DomainError::NotFound(_))) => {
                debug!(remote_id = %id, "Item already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn move_item(
        &self,
        id: &RemoteId,
        new_parent: Option<&RemoteId>,
        new_name: &str,
    ) -> Result<RemoteItem> {
        let path = format!("/items/{}", id.as_str());
        let request = self.request(Method::PATCH, &path).await?.json(&serde_json::json!({
            "name": new_name,
            "parentReference": { "id": Self::item_ref(new_parent) },
        }));
        self.fetch_item("move_item", request).await
    }

    async fn create_folder(&self, parent_id: Option<&RemoteId>, name: &str) -> Result<RemoteItem> {
        let path = format!("/items/{}/children", Self::item_ref(parent_id));
        let request = self.request(Method::POST, &path).await?.json(&serde_json::json!({
            "name": name,
            "folder": {},
            "conflictBehavior": "fail",
        }));

        match self.fetch_item("create_folder", request).await {
            Ok(item) => Ok(item),
            Err(e)
                if matches!(
                    e.downcast_ref::<TransferError>(),
                    Some(TransferError::Status { status: 409, .. })
                ) =>
            {
                let existing = self
                    .list(parent_id)
                    .await?
                    .into_iter()
                    .find(|item| item.name == name && item.is_directory());
                existing.ok_or(e)
            }
            Err(e) => Err(e),
        }
    }
}
