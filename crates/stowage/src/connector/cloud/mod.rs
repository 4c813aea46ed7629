//! Google Drive API v3 connector.
//!
//! Every remote call is admitted by the shared [`RateLimiter`] and wrapped in
//! the connector's [`RetryPolicy`]. Provider paths are `/`-separated names
//! below "My Drive"; they are resolved to file ids segment by segment and the
//! resolved ids are cached.
//!
//! Uploads (local source) use the resumable protocol: a session is opened
//! with the file metadata and declared size, then the content is sent in
//! fixed-size chunks with `Content-Range` headers. Downloads stream the media
//! body into a temp file that is committed with a no-clobber link.

pub mod types;

use crate::connector::hash::compute_md5_hash;
use crate::connector::local::{
    ensure_source, ensure_target_free, link_no_clobber, temp_path_for, LOCAL_PROVIDER_ID,
};
use crate::connector::{
    ApiRateLimit, AuthenticationResult, Connector, EnumerationFilters, ItemStream,
    OperateContext, OperationResult, ProviderLimits, StorageQuota, ITEM_CHANNEL_CAPACITY,
};
use crate::db::{Item, ItemType, Operation, OperationType};
use crate::error::{Result, StowageError};
use crate::progress::TransferTracker;
use crate::resilience::{RateLimiter, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::GlobSet;
use reqwest::header::{CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use types::{AboutResponse, ApiErrorEnvelope, DriveFile, FilesListResponse};

pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const SHORTCUT_MIME: &str = "application/vnd.google-apps.shortcut";
const ROOT_ID: &str = "root";

const FILE_FIELDS: &str =
    "id,name,mimeType,size,createdTime,modifiedTime,md5Checksum,parents,shared,trashed";
const MAX_PAGE_SIZE: &str = "1000";

/// Upload chunk size; the protocol requires a multiple of 256 KiB.
pub const UPLOAD_CHUNK_SIZE: usize = 32 * 256 * 1024;

const UPLOAD_CHUNK_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_STALLED_CHUNKS: u32 = 3;

/// 5 TiB
const MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024 * 1024;

#[derive(Clone)]
pub enum Credentials {
    OAuth2 { access_token: String },
    ApiKey(String),
    Basic { username: String, password: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::OAuth2 { .. } => f.write_str("OAuth2(<redacted>)"),
            Credentials::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Credentials::Basic { username, .. } => write!(f, "Basic({}, <redacted>)", username),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GoogleDriveConfig {
    pub provider_id: String,
    pub credentials: Credentials,
    pub api_base: String,
    pub upload_base: String,
    pub rate_limit: ApiRateLimit,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    /// Root that local paths of uploads and downloads resolve against.
    pub local_root: PathBuf,
}

impl GoogleDriveConfig {
    pub fn new(provider_id: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            provider_id: provider_id.into(),
            credentials,
            api_base: DRIVE_API_BASE.to_string(),
            upload_base: DRIVE_UPLOAD_BASE.to_string(),
            rate_limit: ApiRateLimit {
                max_calls: 1000,
                window: Duration::from_secs(100),
            },
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            local_root: PathBuf::new(),
        }
    }

    pub fn with_local_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.local_root = root.into();
        self
    }
}

enum ChunkOutcome {
    Incomplete(u64),
    Complete(DriveFile),
}

struct DriveClient {
    provider_id: String,
    client: reqwest::Client,
    api_base: String,
    upload_base: String,
    credentials: Credentials,
    limiter: RateLimiter,
    retry: RetryPolicy,
    rate_limit: ApiRateLimit,
    request_timeout: Duration,
    local_root: PathBuf,
    folder_ids: Mutex<HashMap<String, String>>,
    disposed: AtomicBool,
}

pub struct GoogleDriveConnector {
    inner: Arc<DriveClient>,
}

impl GoogleDriveConnector {
    pub fn new(config: GoogleDriveConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let limiter = RateLimiter::new(config.rate_limit.max_calls, config.rate_limit.window)?;

        Ok(Self {
            inner: Arc::new(DriveClient {
                provider_id: config.provider_id,
                client,
                api_base: config.api_base.trim_end_matches('/').to_string(),
                upload_base: config.upload_base.trim_end_matches('/').to_string(),
                credentials: config.credentials,
                limiter,
                retry: config.retry,
                rate_limit: config.rate_limit,
                request_timeout: config.request_timeout,
                local_root: config.local_root,
                folder_ids: Mutex::new(HashMap::new()),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Stream a Drive file into `local_target`, returning the byte count.
    pub async fn download_file(
        &self,
        source_path: &str,
        local_target: &Path,
        ctx: &OperateContext,
    ) -> Result<u64> {
        self.inner
            .download_file(source_path, local_target, ctx)
            .await
            .map(|(_, bytes)| bytes)
    }
}

/// Path segments, ignoring empty components.
fn split_path(path: &str) -> Vec<&str> {
    path.split(['/', '\\']).filter(|s| !s.is_empty()).collect()
}

fn normalize_path(path: &str) -> String {
    split_path(path)
        .iter()
        .fold(String::new(), |acc, segment| join_path(&acc, segment))
}

fn join_path(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}

/// Parent path and final name of a normalized path.
fn split_parent(path: &str) -> Result<(String, String)> {
    let normalized = normalize_path(path);
    match normalized.rsplit_once('/') {
        Some((parent, name)) if !name.is_empty() => Ok((parent.to_string(), name.to_string())),
        _ => Err(StowageError::Config(format!(
            "Path has no file name: '{}'",
            path
        ))),
    }
}

/// Escape a value embedded in a Drive `q` string literal.
fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn content_range(offset: u64, len: u64, total: u64) -> String {
    if len == 0 {
        format!("bytes */{}", total)
    } else {
        format!("bytes {}-{}/{}", offset, offset + len - 1, total)
    }
}

/// Next offset from a `Range: bytes=0-N` header.
fn parse_range_end(header: &str) -> Option<u64> {
    let (_, end) = header.trim().strip_prefix("bytes=")?.split_once('-')?;
    end.parse::<u64>().ok().map(|n| n + 1)
}

fn parse_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn drive_file_to_item(provider_id: &str, parent_path: &str, depth: u32, file: &DriveFile) -> Item {
    let item_type = match file.mime_type.as_str() {
        FOLDER_MIME => ItemType::Folder,
        SHORTCUT_MIME => ItemType::Shortcut,
        _ => ItemType::File,
    };

    let mut extended_properties = BTreeMap::new();
    extended_properties.insert("drive_file_id".to_string(), file.id.clone());

    Item {
        path: join_path(parent_path, &file.name),
        name: file.name.clone(),
        provider_id: provider_id.to_string(),
        size_bytes: file.size_bytes() as i64,
        mime_type: if file.mime_type.is_empty() || item_type == ItemType::Folder {
            None
        } else {
            Some(file.mime_type.clone())
        },
        created_at: parse_time(file.created_time.as_deref()),
        modified_at: parse_time(file.modified_time.as_deref()),
        content_hash: file.md5_checksum.clone(),
        item_type,
        depth,
        extended_properties,
        issues: Vec::new(),
        is_shared: file.shared,
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let code = status.as_u16();
    let body = response.text().await.unwrap_or_default();
    let envelope = serde_json::from_str::<ApiErrorEnvelope>(&body).ok();
    let message = envelope
        .as_ref()
        .map(|e| e.error.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());

    match code {
        401 => Err(StowageError::Authentication(message)),
        403 if envelope.as_ref().is_some_and(|e| e.is_rate_limited()) => {
            Err(StowageError::Provider {
                status: 429,
                message,
            })
        }
        _ => Err(StowageError::Provider {
            status: code,
            message,
        }),
    }
}

impl DriveClient {
    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(StowageError::InvalidState(format!(
                "Connector '{}' has been disposed",
                self.provider_id
            )));
        }
        Ok(())
    }

    /// Absolute paths are kept; relative ones resolve against the local root.
    fn local_path(&self, path: &str) -> PathBuf {
        self.local_root.join(path)
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/{}", self.api_base, suffix)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Credentials::OAuth2 { access_token } => request.bearer_auth(access_token),
            Credentials::ApiKey(key) => request.query(&[("key", key.as_str())]),
            Credentials::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
        }
    }

    /// One admitted, authorized request. Non-2xx responses become errors.
    async fn send(&self, cancel: &CancellationToken, request: RequestBuilder) -> Result<Response> {
        self.limiter.acquire(cancel).await?;
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StowageError::Cancelled),
            response = self.authorize(request).send() => response?,
        };
        check_status(response).await
    }

    async fn call<T, F>(&self, cancel: &CancellationToken, build: F) -> Result<T>
    where
        T: DeserializeOwned + Send,
        F: Fn(&reqwest::Client) -> RequestBuilder + Sync,
    {
        self.ensure_live()?;
        let build = &build;
        self.retry
            .execute(cancel, || async move {
                let request = build(&self.client).timeout(self.request_timeout);
                let response = self.send(cancel, request).await?;
                Ok(response.json::<T>().await?)
            })
            .await
    }

    async fn call_empty<F>(&self, cancel: &CancellationToken, build: F) -> Result<()>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder + Sync,
    {
        self.ensure_live()?;
        let build = &build;
        self.retry
            .execute(cancel, || async move {
                let request = build(&self.client).timeout(self.request_timeout);
                self.send(cancel, request).await?;
                Ok(())
            })
            .await
    }

    fn cached_id(&self, path: &str) -> Option<String> {
        self.folder_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(path)
            .cloned()
    }

    fn remember_id(&self, path: &str, id: &str) {
        self.folder_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.to_string(), id.to_string());
    }

    /// Drop cached ids for `path` and everything below it.
    fn forget(&self, path: &str) {
        let prefix = format!("{}/", path);
        self.folder_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|key, _| key != path && !key.starts_with(&prefix));
    }

    async fn find_child(
        &self,
        parent_id: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<DriveFile>> {
        let query = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            escape_query_value(name),
            escape_query_value(parent_id)
        );
        let url = self.url("files");
        let fields = format!("files({})", FILE_FIELDS);

        let list: FilesListResponse = self
            .call(cancel, |client| {
                client.get(&url).query(&[
                    ("q", query.as_str()),
                    ("fields", fields.as_str()),
                    ("pageSize", "10"),
                ])
            })
            .await?;
        Ok(list.files.into_iter().next())
    }

    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<FilesListResponse> {
        let query = format!(
            "'{}' in parents and trashed = false",
            escape_query_value(folder_id)
        );
        let url = self.url("files");
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);

        self.call(cancel, |client| {
            let request = client.get(&url).query(&[
                ("q", query.as_str()),
                ("fields", fields.as_str()),
                ("pageSize", MAX_PAGE_SIZE),
            ]);
            match page_token {
                Some(token) => request.query(&[("pageToken", token)]),
                None => request,
            }
        })
        .await
    }

    async fn get_file(&self, file_id: &str, cancel: &CancellationToken) -> Result<DriveFile> {
        let url = self.url(&format!("files/{}", file_id));
        self.call(cancel, |client| client.get(&url).query(&[("fields", FILE_FIELDS)]))
            .await
    }

    async fn resolve_id(&self, path: &str, cancel: &CancellationToken) -> Result<String> {
        let mut current_id = ROOT_ID.to_string();
        let mut current_path = String::new();

        for segment in split_path(path) {
            current_path = join_path(&current_path, segment);
            if let Some(id) = self.cached_id(&current_path) {
                current_id = id;
                continue;
            }
            match self.find_child(&current_id, segment, cancel).await? {
                Some(file) => {
                    self.remember_id(&current_path, &file.id);
                    current_id = file.id;
                }
                None => return Err(StowageError::FileNotFound(PathBuf::from(path))),
            }
        }
        Ok(current_id)
    }

    /// Resolve a folder path, creating missing segments.
    async fn ensure_folder(&self, path: &str, cancel: &CancellationToken) -> Result<String> {
        let mut current_id = ROOT_ID.to_string();
        let mut current_path = String::new();

        for segment in split_path(path) {
            current_path = join_path(&current_path, segment);
            if let Some(id) = self.cached_id(&current_path) {
                current_id = id;
                continue;
            }

            let id = match self.find_child(&current_id, segment, cancel).await? {
                Some(existing) => existing.id,
                None => {
                    let url = self.url("files");
                    let body = json!({
                        "name": segment,
                        "mimeType": FOLDER_MIME,
                        "parents": [current_id],
                    });
                    let created: DriveFile = self
                        .call(cancel, |client| {
                            client.post(&url).query(&[("fields", "id")]).json(&body)
                        })
                        .await?;
                    log::debug!("Created folder {} ({})", current_path, created.id);
                    created.id
                }
            };
            self.remember_id(&current_path, &id);
            current_id = id;
        }
        Ok(current_id)
    }

    /// Parent folder id and name for a new item at `target`, which must not
    /// exist yet.
    async fn prepare_target(
        &self,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<(String, String)> {
        let (parent_path, name) = split_parent(target)?;
        let parent_id = self.ensure_folder(&parent_path, cancel).await?;
        if self.find_child(&parent_id, &name, cancel).await?.is_some() {
            return Err(StowageError::DestinationExists(target.to_string()));
        }
        Ok((parent_id, name))
    }

    async fn delete_remote(&self, file_id: &str, cancel: &CancellationToken) -> Result<()> {
        let url = self.url(&format!("files/{}", file_id));
        self.call_empty(cancel, |client| client.delete(&url)).await
    }

    async fn apply(&self, op: &Operation, ctx: &OperateContext) -> Result<(bool, u64)> {
        self.ensure_live()?;
        let cancel = &ctx.cancel;
        if cancel.is_cancelled() {
            return Err(StowageError::Cancelled);
        }

        let uploading =
            op.source_provider == LOCAL_PROVIDER_ID && op.target_provider != LOCAL_PROVIDER_ID;
        let downloading =
            op.target_provider == LOCAL_PROVIDER_ID && op.source_provider != LOCAL_PROVIDER_ID;

        match op.operation_type {
            OperationType::Copy | OperationType::Move | OperationType::Archive if uploading => {
                let source = self.local_path(&op.source_path);
                let outcome = self.upload_file(&source, &op.target_path, ctx).await?;
                if op.operation_type != OperationType::Copy {
                    tokio::fs::remove_file(&source).await?;
                }
                Ok(outcome)
            }
            OperationType::Copy | OperationType::Move | OperationType::Archive if downloading => {
                let target = self.local_path(&op.target_path);
                let outcome = self.download_file(&op.source_path, &target, ctx).await?;
                if op.operation_type != OperationType::Copy {
                    let id = self.resolve_id(&op.source_path, cancel).await?;
                    self.delete_remote(&id, cancel).await?;
                    self.forget(&normalize_path(&op.source_path));
                }
                Ok(outcome)
            }
            OperationType::Copy => self.copy_remote(&op.source_path, &op.target_path, ctx).await,
            OperationType::Move | OperationType::Archive | OperationType::Rename => {
                self.relocate(&op.source_path, &op.target_path, cancel).await?;
                Ok((false, 0))
            }
            OperationType::Delete => {
                let id = self.resolve_id(&op.source_path, cancel).await?;
                self.delete_remote(&id, cancel).await?;
                self.forget(&normalize_path(&op.source_path));
                Ok((false, 0))
            }
            OperationType::CreateShortcut => {
                self.create_shortcut(&op.source_path, &op.target_path, cancel)
                    .await?;
                Ok((false, 0))
            }
        }
    }

    async fn copy_remote(
        &self,
        source: &str,
        target: &str,
        ctx: &OperateContext,
    ) -> Result<(bool, u64)> {
        let cancel = &ctx.cancel;
        let source_id = self.resolve_id(source, cancel).await?;
        let original = self.get_file(&source_id, cancel).await?;
        let (parent_id, name) = self.prepare_target(target, cancel).await?;

        let url = self.url(&format!("files/{}/copy", source_id));
        let body = json!({ "name": name, "parents": [parent_id] });
        let copied: DriveFile = self
            .call(cancel, |client| {
                client
                    .post(&url)
                    .query(&[("fields", FILE_FIELDS)])
                    .json(&body)
            })
            .await?;

        let mut verified = false;
        if ctx.verify_hashes {
            if let (Some(expected), Some(actual)) = (&original.md5_checksum, &copied.md5_checksum) {
                if !expected.eq_ignore_ascii_case(actual) {
                    self.delete_remote(&copied.id, cancel).await?;
                    return Err(StowageError::HashMismatch {
                        path: target.to_string(),
                        expected: expected.clone(),
                        actual: actual.clone(),
                    });
                }
                verified = true;
            }
        }

        self.remember_id(&normalize_path(target), &copied.id);
        Ok((verified, copied.size_bytes()))
    }

    async fn relocate(&self, source: &str, target: &str, cancel: &CancellationToken) -> Result<()> {
        let source_id = self.resolve_id(source, cancel).await?;
        let current = self.get_file(&source_id, cancel).await?;
        let (parent_id, name) = self.prepare_target(target, cancel).await?;

        let url = self.url(&format!("files/{}", source_id));
        let body = json!({ "name": name });
        let mut params: Vec<(&str, String)> = vec![("fields", "id".to_string())];
        if !current.parents.iter().any(|p| p == &parent_id) {
            params.push(("addParents", parent_id.clone()));
            if !current.parents.is_empty() {
                params.push(("removeParents", current.parents.join(",")));
            }
        }

        let _: DriveFile = self
            .call(cancel, |client| client.patch(&url).query(&params).json(&body))
            .await?;

        self.forget(&normalize_path(source));
        self.remember_id(&normalize_path(target), &source_id);
        Ok(())
    }

    async fn create_shortcut(
        &self,
        source: &str,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let source_id = self.resolve_id(source, cancel).await?;
        let (parent_id, name) = self.prepare_target(target, cancel).await?;

        let url = self.url("files");
        let body = json!({
            "name": name,
            "mimeType": SHORTCUT_MIME,
            "parents": [parent_id],
            "shortcutDetails": { "targetId": source_id },
        });
        let _: DriveFile = self
            .call(cancel, |client| client.post(&url).query(&[("fields", "id")]).json(&body))
            .await?;
        Ok(())
    }

    async fn start_upload_session(
        &self,
        parent_id: &str,
        name: &str,
        total: u64,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let url = format!("{}/files", self.upload_base);
        let body = json!({ "name": name, "parents": [parent_id] });
        let (url, body) = (&url, &body);

        self.retry
            .execute(cancel, || async move {
                let request = self
                    .client
                    .post(url)
                    .query(&[("uploadType", "resumable"), ("fields", FILE_FIELDS)])
                    .header("X-Upload-Content-Length", total)
                    .timeout(self.request_timeout)
                    .json(body);
                let response = self.send(cancel, request).await?;
                response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .ok_or_else(|| StowageError::Provider {
                        status: response.status().as_u16(),
                        message: "Upload session response has no Location header".to_string(),
                    })
            })
            .await
    }

    async fn put_chunk(
        &self,
        session_url: &str,
        chunk: &[u8],
        offset: u64,
        total: u64,
        cancel: &CancellationToken,
    ) -> Result<ChunkOutcome> {
        let range = content_range(offset, chunk.len() as u64, total);
        let range = &range;

        self.retry
            .execute(cancel, || async move {
                self.limiter.acquire(cancel).await?;
                let request = self.authorize(
                    self.client
                        .put(session_url)
                        .header(CONTENT_RANGE, range.as_str())
                        .timeout(UPLOAD_CHUNK_TIMEOUT)
                        .body(chunk.to_vec()),
                );
                let response = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(StowageError::Cancelled),
                    response = request.send() => response?,
                };

                if response.status().as_u16() == 308 {
                    let next = response
                        .headers()
                        .get(RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_range_end)
                        .unwrap_or(0);
                    return Ok(ChunkOutcome::Incomplete(next));
                }

                let response = check_status(response).await?;
                Ok(ChunkOutcome::Complete(response.json::<DriveFile>().await?))
            })
            .await
    }

    async fn upload_file(
        &self,
        local_path: &Path,
        target: &str,
        ctx: &OperateContext,
    ) -> Result<(bool, u64)> {
        let cancel = &ctx.cancel;
        let metadata = ensure_source(local_path).await?;
        let total = metadata.len();
        if total > MAX_FILE_SIZE {
            return Err(StowageError::Migration(format!(
                "{} exceeds the provider file size limit",
                local_path.display()
            )));
        }

        let (parent_id, name) = self.prepare_target(target, cancel).await?;
        let local_md5 = if ctx.verify_hashes {
            let path = local_path.to_path_buf();
            Some(
                tokio::task::spawn_blocking(move || compute_md5_hash(&path))
                    .await
                    .map_err(|e| StowageError::Migration(format!("Hash task failed: {}", e)))??,
            )
        } else {
            None
        };

        let session_url = self
            .start_upload_session(&parent_id, &name, total, cancel)
            .await?;
        log::debug!("Uploading {} ({} bytes) to {}", local_path.display(), total, target);

        let mut file = tokio::fs::File::open(local_path).await?;
        let mut tracker = TransferTracker::new(ctx.progress.as_ref(), total);
        let mut offset = 0u64;
        let mut stalled = 0u32;
        let mut buffer = vec![0u8; UPLOAD_CHUNK_SIZE];

        let uploaded = loop {
            if cancel.is_cancelled() {
                return Err(StowageError::Cancelled);
            }

            file.seek(std::io::SeekFrom::Start(offset)).await?;
            let mut filled = 0usize;
            while filled < buffer.len() {
                let read = file.read(&mut buffer[filled..]).await?;
                if read == 0 {
                    break;
                }
                filled += read;
            }

            match self
                .put_chunk(&session_url, &buffer[..filled], offset, total, cancel)
                .await?
            {
                ChunkOutcome::Complete(created) => {
                    tracker.advance(total.saturating_sub(offset));
                    break created;
                }
                ChunkOutcome::Incomplete(next) => {
                    if next == offset {
                        stalled += 1;
                        if stalled >= MAX_STALLED_CHUNKS {
                            return Err(StowageError::Network(format!(
                                "Upload of {} stalled at byte {}",
                                local_path.display(),
                                offset
                            )));
                        }
                    } else {
                        stalled = 0;
                    }
                    if next > offset {
                        tracker.advance(next - offset);
                    }
                    offset = next;
                }
            }
        };

        let mut verified = false;
        if let Some(expected) = local_md5 {
            match &uploaded.md5_checksum {
                Some(actual) if actual.eq_ignore_ascii_case(&expected) => verified = true,
                Some(actual) => {
                    let actual = actual.clone();
                    self.delete_remote(&uploaded.id, cancel).await?;
                    return Err(StowageError::HashMismatch {
                        path: target.to_string(),
                        expected,
                        actual,
                    });
                }
                None => log::warn!("Provider returned no checksum for {}", target),
            }
        }

        self.remember_id(&normalize_path(target), &uploaded.id);
        Ok((verified, total))
    }

    async fn download_file(
        &self,
        source: &str,
        local_target: &Path,
        ctx: &OperateContext,
    ) -> Result<(bool, u64)> {
        let cancel = &ctx.cancel;
        let file_id = self.resolve_id(source, cancel).await?;
        let remote = self.get_file(&file_id, cancel).await?;
        if remote.mime_type == FOLDER_MIME {
            return Err(StowageError::Migration(format!(
                "Cannot download folder {}",
                source
            )));
        }
        ensure_target_free(local_target).await?;

        let url = self.url(&format!("files/{}", file_id));
        let url = &url;
        let response = self
            .retry
            .execute(cancel, || async move {
                let request = self.client.get(url).query(&[("alt", "media")]);
                self.send(cancel, request).await
            })
            .await?;

        let temp = temp_path_for(local_target);
        let bytes = match stream_response(response, &temp, remote.size_bytes(), ctx).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
        };

        let committed = link_no_clobber(&temp, local_target).await;
        let _ = tokio::fs::remove_file(&temp).await;
        committed?;

        let mut verified = false;
        if let (true, Some(expected)) = (ctx.verify_hashes, remote.md5_checksum) {
            let path = local_target.to_path_buf();
            let actual = tokio::task::spawn_blocking(move || compute_md5_hash(&path))
                .await
                .map_err(|e| StowageError::Migration(format!("Hash task failed: {}", e)))??;
            if !actual.eq_ignore_ascii_case(&expected) {
                let _ = tokio::fs::remove_file(local_target).await;
                return Err(StowageError::HashMismatch {
                    path: local_target.display().to_string(),
                    expected,
                    actual,
                });
            }
            verified = true;
        }

        Ok((verified, bytes))
    }

    /// Breadth-first listing from `root`. A folder that fails to list is
    /// skipped with its subtree; failure on the root ends the stream.
    async fn walk(
        self: Arc<Self>,
        root: String,
        filters: EnumerationFilters,
        patterns: GlobSet,
        cancel: CancellationToken,
        tx: mpsc::Sender<Result<Item>>,
    ) {
        let root_path = normalize_path(&root);
        let root_id = match self.resolve_id(&root_path, &cancel).await {
            Ok(id) => id,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let mut queue = VecDeque::from([(root_id, root_path, 0u32)]);
        while let Some((folder_id, folder_path, depth)) = queue.pop_front() {
            let mut page_token: Option<String> = None;

            loop {
                let page = match self
                    .list_children(&folder_id, page_token.as_deref(), &cancel)
                    .await
                {
                    Ok(page) => page,
                    Err(e) if e.is_cancelled() || depth == 0 => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    Err(e) => {
                        log::warn!("Skipping folder {}: {}", folder_path, e);
                        break;
                    }
                };

                let child_depth = depth + 1;
                for file in &page.files {
                    if file.trashed || filters.max_depth.is_some_and(|max| child_depth > max) {
                        continue;
                    }

                    let is_folder = file.mime_type == FOLDER_MIME;
                    if is_folder && filters.is_excluded_directory(&file.name) {
                        continue;
                    }
                    if !is_folder && !patterns.is_empty() && patterns.is_match(&file.name) {
                        continue;
                    }

                    let item = drive_file_to_item(&self.provider_id, &folder_path, child_depth, file);
                    if is_folder {
                        self.remember_id(&item.path, &file.id);
                        if filters.max_depth.map_or(true, |max| child_depth < max) {
                            queue.push_back((file.id.clone(), item.path.clone(), child_depth));
                        }
                    }

                    if !filters.accepts(&item) {
                        continue;
                    }
                    if tx.send(Ok(item)).await.is_err() {
                        return;
                    }
                }

                match page.next_page_token {
                    Some(token) => page_token = Some(token),
                    None => break,
                }
            }
        }
    }
}

async fn stream_response(
    mut response: Response,
    temp: &Path,
    total: u64,
    ctx: &OperateContext,
) -> Result<u64> {
    let mut writer = tokio::fs::File::create(temp).await?;
    let mut tracker = TransferTracker::new(ctx.progress.as_ref(), total);

    loop {
        let chunk = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(StowageError::Cancelled),
            chunk = response.chunk() => chunk?,
        };
        let Some(chunk) = chunk else {
            break;
        };
        writer.write_all(&chunk).await?;
        tracker.advance(chunk.len() as u64);
    }

    writer.flush().await?;
    writer.sync_all().await?;
    Ok(tracker.transferred())
}

#[async_trait]
impl Connector for GoogleDriveConnector {
    fn provider_id(&self) -> &str {
        &self.inner.provider_id
    }

    async fn authenticate(&self, cancel: &CancellationToken) -> Result<AuthenticationResult> {
        let url = self.inner.url("about");
        let about: AboutResponse = self
            .inner
            .call(cancel, |client| {
                client.get(&url).query(&[(
                    "fields",
                    "user(permissionId,emailAddress,displayName),storageQuota(limit,usage)",
                )])
            })
            .await?;

        let quota = about.storage_quota.and_then(|q| {
            let total = q.limit.as_deref()?.parse::<u64>().ok()?;
            let used = q.usage.as_deref().and_then(|u| u.parse().ok()).unwrap_or(0);
            Some(StorageQuota::new(total, used))
        });

        log::info!(
            "Authenticated to {} as {}",
            self.inner.provider_id,
            about.user.email_address.as_deref().unwrap_or("unknown")
        );

        Ok(AuthenticationResult {
            user_id: about
                .user
                .permission_id
                .or_else(|| about.user.email_address.clone())
                .unwrap_or_default(),
            email: about.user.email_address,
            display_name: about.user.display_name,
            quota,
        })
    }

    async fn enumerate(
        &self,
        root: &str,
        filters: &EnumerationFilters,
        cancel: CancellationToken,
    ) -> Result<ItemStream> {
        self.inner.ensure_live()?;
        let patterns = filters.file_pattern_set()?;
        let (tx, rx) = mpsc::channel(ITEM_CHANNEL_CAPACITY);

        log::info!("Enumerating {}:{}", self.inner.provider_id, root);
        let task = tokio::spawn(self.inner.clone().walk(
            root.to_string(),
            filters.clone(),
            patterns,
            cancel,
            tx,
        ));
        Ok(ItemStream::new(rx, task))
    }

    async fn operate(&self, operation: &Operation, ctx: &OperateContext) -> OperationResult {
        match self.inner.apply(operation, ctx).await {
            Ok((hash_verified, bytes)) => {
                OperationResult::succeeded(&operation.id, hash_verified, bytes)
            }
            Err(e) => {
                log::warn!(
                    "{} {} -> {} failed on {}: {}",
                    operation.operation_type.as_str(),
                    operation.source_path,
                    operation.target_path,
                    self.inner.provider_id,
                    e
                );
                OperationResult::failed(&operation.id, &e)
            }
        }
    }

    fn validate_path(&self, path: &str) -> bool {
        self.limits().permits(path)
    }

    fn limits(&self) -> ProviderLimits {
        ProviderLimits {
            max_path_length: 4096,
            max_filename_length: 255,
            max_file_size: Some(MAX_FILE_SIZE),
            invalid_characters: Vec::new(),
            reserved_names: Vec::new(),
            api_rate_limit: Some(self.inner.rate_limit),
        }
    }

    async fn content_hash(&self, path: &str, cancel: &CancellationToken) -> Result<Option<String>> {
        let id = self.inner.resolve_id(path, cancel).await?;
        let file = self.inner.get_file(&id, cancel).await?;
        Ok(file.md5_checksum)
    }

    fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.inner.limiter.dispose();
    }
}
