//! Provider connectors.
//!
//! A connector enumerates the items of one storage provider and applies
//! migration operations to it. Enumeration is pull-based: a background task
//! produces items into a bounded channel and the caller drains an
//! [`ItemStream`].

pub mod cloud;
pub mod hash;
pub mod local;

use crate::db::{Item, Operation};
use crate::error::{Result, StowageError};
use crate::progress::ProgressReporter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use cloud::{Credentials, GoogleDriveConnector};
pub use local::{LocalConnector, LOCAL_PROVIDER_ID};

pub(crate) const ITEM_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EnumerationFilters {
    /// Lowercase extensions without the leading dot. Empty allows all.
    pub extensions: Vec<String>,
    pub modified_after: Option<DateTime<Utc>>,
    pub modified_before: Option<DateTime<Utc>>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub max_depth: Option<u32>,
    pub include_folders: bool,
    pub compute_hash: bool,
    pub excluded_directories: Vec<String>,
    pub excluded_file_patterns: Vec<String>,
}

impl Default for EnumerationFilters {
    fn default() -> Self {
        Self {
            extensions: Vec::new(),
            modified_after: None,
            modified_before: None,
            min_size: None,
            max_size: None,
            max_depth: None,
            include_folders: true,
            compute_hash: false,
            excluded_directories: Vec::new(),
            excluded_file_patterns: Vec::new(),
        }
    }
}

impl EnumerationFilters {
    /// Merge configured and ad-hoc directory exclusions, dropping
    /// case-insensitive repeats.
    pub fn with_excluded_directories(mut self, configured: &[String], extra: &[String]) -> Self {
        for name in configured.iter().chain(extra) {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            if !self
                .excluded_directories
                .iter()
                .any(|d| d.eq_ignore_ascii_case(name))
            {
                self.excluded_directories.push(name.to_string());
            }
        }
        self
    }

    pub fn is_excluded_directory(&self, name: &str) -> bool {
        self.excluded_directories
            .iter()
            .any(|d| d.eq_ignore_ascii_case(name))
    }

    pub(crate) fn file_pattern_set(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.excluded_file_patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                StowageError::Config(format!("Invalid exclude pattern '{}': {}", pattern, e))
            })?;
            builder.add(glob);
        }
        builder
            .build()
            .map_err(|e| StowageError::Config(format!("Invalid exclude patterns: {}", e)))
    }

    /// Extension, timestamp and size checks. Folders only need the
    /// `include_folders` flag.
    pub fn accepts(&self, item: &Item) -> bool {
        if !item.is_file() {
            return self.include_folders;
        }

        if !self.extensions.is_empty() {
            match item.extension() {
                Some(ext) if self.extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)) => {}
                _ => return false,
            }
        }

        if let Some(after) = self.modified_after {
            if item.modified_at.map_or(true, |m| m < after) {
                return false;
            }
        }
        if let Some(before) = self.modified_before {
            if item.modified_at.map_or(true, |m| m > before) {
                return false;
            }
        }

        if self.min_size.is_some_and(|min| item.size_bytes < min) {
            return false;
        }
        if self.max_size.is_some_and(|max| item.size_bytes > max) {
            return false;
        }

        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageQuota {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

impl StorageQuota {
    pub fn new(total_bytes: u64, used_bytes: u64) -> Self {
        Self {
            total_bytes,
            used_bytes,
            available_bytes: total_bytes.saturating_sub(used_bytes),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationResult {
    pub user_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub quota: Option<StorageQuota>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiRateLimit {
    pub max_calls: usize,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct ProviderLimits {
    pub max_path_length: usize,
    pub max_filename_length: usize,
    pub max_file_size: Option<u64>,
    pub invalid_characters: Vec<char>,
    pub reserved_names: Vec<String>,
    pub api_rate_limit: Option<ApiRateLimit>,
}

impl ProviderLimits {
    /// Length, character and reserved-name checks shared by all providers.
    pub fn permits(&self, path: &str) -> bool {
        if path.trim().is_empty() || path.chars().count() > self.max_path_length {
            return false;
        }

        path.split(['/', '\\'])
            .filter(|segment| !segment.is_empty())
            .all(|segment| self.permits_name(segment))
    }

    fn permits_name(&self, name: &str) -> bool {
        if name.chars().count() > self.max_filename_length {
            return false;
        }
        if name
            .chars()
            .any(|c| c.is_control() || self.invalid_characters.contains(&c))
        {
            return false;
        }
        let stem = name.split('.').next().unwrap_or(name);
        !self
            .reserved_names
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(stem))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationErrorKind {
    Transient,
    Fatal,
    Verification,
    Cancelled,
}

impl OperationErrorKind {
    pub fn classify(err: &StowageError) -> Self {
        match err {
            StowageError::Cancelled => OperationErrorKind::Cancelled,
            StowageError::HashMismatch { .. } => OperationErrorKind::Verification,
            e if e.is_transient() => OperationErrorKind::Transient,
            StowageError::RetriesExhausted { .. } => OperationErrorKind::Transient,
            _ => OperationErrorKind::Fatal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub error_kind: Option<OperationErrorKind>,
    pub hash_verified: bool,
    pub bytes_transferred: u64,
}

impl OperationResult {
    pub fn succeeded(operation_id: &str, hash_verified: bool, bytes_transferred: u64) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            success: true,
            error: None,
            error_kind: None,
            hash_verified,
            bytes_transferred,
        }
    }

    pub fn failed(operation_id: &str, err: &StowageError) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            success: false,
            error: Some(err.to_string()),
            error_kind: Some(OperationErrorKind::classify(err)),
            hash_verified: false,
            bytes_transferred: 0,
        }
    }

    /// Whether another attempt could change the outcome.
    pub fn is_retryable(&self) -> bool {
        !self.success
            && !matches!(
                self.error_kind,
                Some(OperationErrorKind::Verification) | Some(OperationErrorKind::Cancelled)
            )
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperateContext {
    pub cancel: CancellationToken,
    pub verify_hashes: bool,
    pub progress: Option<ProgressReporter>,
}

/// Items pulled from a background enumeration task.
///
/// Dropping the stream aborts the producer.
pub struct ItemStream {
    rx: mpsc::Receiver<Result<Item>>,
    task: Option<JoinHandle<()>>,
}

impl ItemStream {
    pub(crate) fn new(rx: mpsc::Receiver<Result<Item>>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            task: Some(task),
        }
    }

    pub async fn next(&mut self) -> Option<Result<Item>> {
        self.rx.recv().await
    }

    /// Drain the stream, stopping at the first error.
    pub async fn collect_all(mut self) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }
}

impl Drop for ItemStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn authenticate(&self, cancel: &CancellationToken) -> Result<AuthenticationResult>;

    /// Start enumerating below `root`. Calling again restarts from scratch.
    async fn enumerate(
        &self,
        root: &str,
        filters: &EnumerationFilters,
        cancel: CancellationToken,
    ) -> Result<ItemStream>;

    /// Apply one operation. Failures are reported in the result, never as
    /// an `Err`.
    async fn operate(&self, operation: &Operation, ctx: &OperateContext) -> OperationResult;

    fn validate_path(&self, path: &str) -> bool;

    fn limits(&self) -> ProviderLimits;

    async fn content_hash(&self, path: &str, cancel: &CancellationToken)
        -> Result<Option<String>>;

    fn dispose(&self);
}

/// Mime type guess for common extensions.
pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    let mime = match ext.to_ascii_lowercase().as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        _ => return None,
    };
    Some(mime)
}
