use crate::connector::hash::{blake3_with_timeout, compute_blake3_hash, HASH_TIMEOUT};
use crate::connector::{
    mime_for_extension, AuthenticationResult, Connector, EnumerationFilters, ItemStream,
    OperateContext, OperationResult, ProviderLimits, ITEM_CHANNEL_CAPACITY,
};
use crate::db::{Item, ItemType, Operation, OperationType};
use crate::error::{Result, StowageError};
use crate::progress::TransferTracker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::GlobSet;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use walkdir::{DirEntry, WalkDir};

/// Provider id that marks a path as living on the local filesystem.
pub const LOCAL_PROVIDER_ID: &str = "local";

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Connector for a directory tree on the local filesystem.
///
/// Enumerated item paths are relative to the root, the same space rule
/// targets live in, so the planner can compare the two directly.
pub struct LocalConnector {
    provider_id: String,
    root: PathBuf,
    disposed: AtomicBool,
}

impl LocalConnector {
    pub fn new(provider_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            provider_id: provider_id.into(),
            root: root.into(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative paths resolve against the connector root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(StowageError::InvalidState(format!(
                "Connector '{}' has been disposed",
                self.provider_id
            )));
        }
        Ok(())
    }

    async fn apply(&self, op: &Operation, ctx: &OperateContext) -> Result<(bool, u64)> {
        self.ensure_live()?;
        if ctx.cancel.is_cancelled() {
            return Err(StowageError::Cancelled);
        }

        let source = self.resolve(&op.source_path);
        let target = self.resolve(&op.target_path);

        match op.operation_type {
            OperationType::Copy => self.copy_verified(&source, &target, ctx).await,
            OperationType::Move | OperationType::Archive => {
                self.move_file(&source, &target, ctx).await
            }
            OperationType::Rename => {
                rename_no_overwrite(&source, &target).await?;
                Ok((false, 0))
            }
            OperationType::Delete => {
                delete_path(&source).await?;
                Ok((false, 0))
            }
            OperationType::CreateShortcut => {
                create_shortcut(&source, &target).await?;
                Ok((false, 0))
            }
        }
    }

    async fn copy_verified(
        &self,
        source: &Path,
        target: &Path,
        ctx: &OperateContext,
    ) -> Result<(bool, u64)> {
        let bytes = copy_file(source, target, ctx).await?;

        if !ctx.verify_hashes {
            return Ok((false, bytes));
        }

        if let Err(e) = verify_copy(source, target).await {
            if matches!(e, StowageError::HashMismatch { .. }) {
                log::error!(
                    "Removing unverified copy {}: {}",
                    target.display(),
                    e
                );
                let _ = tokio::fs::remove_file(target).await;
            }
            return Err(e);
        }
        Ok((true, bytes))
    }

    async fn move_file(
        &self,
        source: &Path,
        target: &Path,
        ctx: &OperateContext,
    ) -> Result<(bool, u64)> {
        if !ctx.verify_hashes {
            match rename_no_overwrite(source, target).await {
                Ok(()) => return Ok((false, 0)),
                Err(StowageError::Io(e)) if source.exists() => {
                    log::debug!(
                        "Rename {} -> {} failed ({}), falling back to copy",
                        source.display(),
                        target.display(),
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let (verified, bytes) = self.copy_verified(source, target, ctx).await?;
        tokio::fs::remove_file(source).await?;
        Ok((verified, bytes))
    }
}

fn system_time_to_utc(time: std::io::Result<std::time::SystemTime>) -> Option<DateTime<Utc>> {
    time.ok().map(DateTime::<Utc>::from)
}

fn item_type_for(entry: &DirEntry) -> ItemType {
    let file_type = entry.file_type();
    if file_type.is_symlink() {
        return ItemType::Link;
    }
    if file_type.is_dir() {
        return ItemType::Folder;
    }
    match entry
        .path()
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .as_deref()
    {
        Some("lnk") | Some("url") => ItemType::Shortcut,
        _ => ItemType::File,
    }
}

/// `path` relative to the connector root with `/` separators. Paths outside
/// the root stay absolute.
fn root_relative(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    Some(segments.join("/"))
}

fn item_from_entry(provider_id: &str, root: &Path, entry: &DirEntry) -> Option<Item> {
    let path = entry.path();
    let metadata = match entry.metadata() {
        Ok(m) => m,
        Err(e) => {
            log::warn!("Failed to get metadata for {}: {}", path.display(), e);
            return None;
        }
    };

    let item_type = item_type_for(entry);
    let name = entry.file_name().to_string_lossy().to_string();
    let mime_type = path
        .extension()
        .and_then(|e| mime_for_extension(&e.to_string_lossy()))
        .map(|m| m.to_string());

    let mut extended_properties = BTreeMap::new();
    if metadata.permissions().readonly() {
        extended_properties.insert("readonly".to_string(), "true".to_string());
    }
    if item_type == ItemType::Link {
        if let Ok(target) = std::fs::read_link(path) {
            extended_properties.insert(
                "symlink_target".to_string(),
                target.to_string_lossy().to_string(),
            );
        }
    }

    let size_bytes = match item_type {
        ItemType::File | ItemType::Shortcut => metadata.len() as i64,
        ItemType::Folder | ItemType::Link => 0,
    };

    let (item_path, depth) = match root_relative(root, path) {
        Some(relative) => {
            let depth = relative.split('/').filter(|s| !s.is_empty()).count() as u32;
            (relative, depth)
        }
        None => (path.to_string_lossy().to_string(), entry.depth() as u32),
    };

    Some(Item {
        path: item_path,
        name,
        provider_id: provider_id.to_string(),
        size_bytes,
        mime_type: if item_type == ItemType::Folder {
            None
        } else {
            mime_type
        },
        created_at: system_time_to_utc(metadata.created()),
        modified_at: system_time_to_utc(metadata.modified()),
        content_hash: None,
        item_type,
        depth,
        extended_properties,
        issues: Vec::new(),
        is_shared: false,
    })
}

fn excluded_by_pattern(patterns: &GlobSet, entry: &DirEntry, base: &Path) -> bool {
    if patterns.is_empty() || entry.file_type().is_dir() {
        return false;
    }
    let relative = entry.path().strip_prefix(base).unwrap_or(entry.path());
    patterns.is_match(entry.file_name()) || patterns.is_match(relative)
}

/// Iterative walk on the blocking pool. Excluded directories are pruned
/// before descent; unreadable entries skip only their own subtree.
fn walk_blocking(
    provider_id: String,
    root: PathBuf,
    base: PathBuf,
    filters: EnumerationFilters,
    patterns: GlobSet,
    cancel: CancellationToken,
    tx: mpsc::Sender<Item>,
) {
    let mut walker = WalkDir::new(&base).follow_links(false).min_depth(1);
    if let Some(max_depth) = filters.max_depth {
        walker = walker.max_depth(max_depth as usize);
    }

    let iter = walker.into_iter().filter_entry(|entry| {
        !(entry.file_type().is_dir()
            && filters.is_excluded_directory(&entry.file_name().to_string_lossy()))
    });

    let mut skipped = 0usize;
    for entry in iter {
        if cancel.is_cancelled() {
            break;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping unreadable entry: {}", e);
                skipped += 1;
                continue;
            }
        };

        if excluded_by_pattern(&patterns, &entry, &base) {
            continue;
        }

        let Some(item) = item_from_entry(&provider_id, &root, &entry) else {
            skipped += 1;
            continue;
        };

        if !filters.accepts(&item) {
            continue;
        }

        if tx.blocking_send(item).is_err() {
            break;
        }
    }

    if skipped > 0 {
        log::info!("Enumeration of {} skipped {} entries", base.display(), skipped);
    }
}

pub(crate) async fn ensure_target_free(target: &Path) -> Result<()> {
    if tokio::fs::symlink_metadata(target).await.is_ok() {
        return Err(StowageError::DestinationExists(
            target.display().to_string(),
        ));
    }
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

pub(crate) async fn ensure_source(source: &Path) -> Result<std::fs::Metadata> {
    match tokio::fs::symlink_metadata(source).await {
        Ok(metadata) => Ok(metadata),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(StowageError::FileNotFound(source.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp_name = format!(".{}.{}.partial", name, uuid::Uuid::new_v4().simple());
    match target.parent() {
        Some(parent) => parent.join(temp_name),
        None => PathBuf::from(temp_name),
    }
}

/// Copy into a temp file beside `target`, then commit it with a no-clobber
/// link. The temp file is removed on any failure, including cancellation.
pub(crate) async fn copy_file(source: &Path, target: &Path, ctx: &OperateContext) -> Result<u64> {
    let metadata = ensure_source(source).await?;
    if !metadata.is_file() {
        return Err(StowageError::Migration(format!(
            "Not a regular file: {}",
            source.display()
        )));
    }
    ensure_target_free(target).await?;

    let temp = temp_path_for(target);
    let result = stream_into(source, &temp, metadata.len(), ctx).await;

    let bytes = match result {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }
    };

    let committed = link_no_clobber(&temp, target).await;
    let _ = tokio::fs::remove_file(&temp).await;
    committed?;

    Ok(bytes)
}

/// Make `from` visible at `to`. Linking fails when `to` exists, so a file
/// created there concurrently is never replaced.
pub(crate) async fn link_no_clobber(from: &Path, to: &Path) -> Result<()> {
    match tokio::fs::hard_link(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(StowageError::DestinationExists(to.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn stream_into(
    source: &Path,
    temp: &Path,
    total_bytes: u64,
    ctx: &OperateContext,
) -> Result<u64> {
    let mut reader = tokio::fs::File::open(source).await?;
    let mut writer = tokio::fs::File::create(temp).await?;
    let mut tracker = TransferTracker::new(ctx.progress.as_ref(), total_bytes);
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(StowageError::Cancelled);
        }
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read]).await?;
        tracker.advance(read as u64);
    }

    writer.flush().await?;
    writer.sync_all().await?;
    Ok(tracker.transferred())
}

async fn verify_copy(source: &Path, target: &Path) -> Result<()> {
    let source = source.to_path_buf();
    let target = target.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let expected = compute_blake3_hash(&source)?;
        crate::connector::hash::verify_destination(&target, &expected)
    })
    .await
    .map_err(|e| StowageError::Migration(format!("Verification task failed: {}", e)))?
}

async fn rename_no_overwrite(source: &Path, target: &Path) -> Result<()> {
    let metadata = ensure_source(source).await?;
    ensure_target_free(target).await?;
    if metadata.is_dir() {
        tokio::fs::rename(source, target).await?;
        return Ok(());
    }
    link_no_clobber(source, target).await?;
    tokio::fs::remove_file(source).await?;
    Ok(())
}

async fn delete_path(path: &Path) -> Result<()> {
    let metadata = ensure_source(path).await?;
    if metadata.is_dir() {
        tokio::fs::remove_dir(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

#[cfg(unix)]
async fn create_shortcut(source: &Path, target: &Path) -> Result<()> {
    ensure_source(source).await?;
    ensure_target_free(target).await?;
    tokio::fs::symlink(source, target).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn create_shortcut(_source: &Path, target: &Path) -> Result<()> {
    Err(StowageError::Migration(format!(
        "Shortcuts are not supported on this platform: {}",
        target.display()
    )))
}

#[async_trait]
impl Connector for LocalConnector {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn authenticate(&self, _cancel: &CancellationToken) -> Result<AuthenticationResult> {
        self.ensure_live()?;
        if !self.root.is_dir() {
            return Err(StowageError::FileNotFound(self.root.clone()));
        }
        Ok(AuthenticationResult {
            user_id: self.provider_id.clone(),
            email: None,
            display_name: Some(self.root.display().to_string()),
            quota: None,
        })
    }

    async fn enumerate(
        &self,
        root: &str,
        filters: &EnumerationFilters,
        cancel: CancellationToken,
    ) -> Result<ItemStream> {
        self.ensure_live()?;

        let base = self.resolve(root);
        if !base.exists() {
            return Err(StowageError::FileNotFound(base));
        }
        let patterns = filters.file_pattern_set()?;

        log::info!("Enumerating {} ({})", base.display(), self.provider_id);

        let (raw_tx, mut raw_rx) = mpsc::channel::<Item>(ITEM_CHANNEL_CAPACITY);
        let (tx, rx) = mpsc::channel::<Result<Item>>(ITEM_CHANNEL_CAPACITY);

        let walker = {
            let provider_id = self.provider_id.clone();
            let root = self.root.clone();
            let filters = filters.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                walk_blocking(provider_id, root, base, filters, patterns, cancel, raw_tx)
            })
        };

        let compute_hash = filters.compute_hash;
        let root = self.root.clone();
        let task = tokio::spawn(async move {
            while let Some(mut item) = raw_rx.recv().await {
                if cancel.is_cancelled() {
                    break;
                }
                if compute_hash && item.is_file() {
                    item.content_hash =
                        blake3_with_timeout(root.join(&item.path), HASH_TIMEOUT, &cancel)
                            .await;
                }
                if tx.send(Ok(item)).await.is_err() {
                    return;
                }
            }

            if cancel.is_cancelled() {
                let _ = tx.send(Err(StowageError::Cancelled)).await;
            }
            drop(raw_rx);
            if let Err(e) = walker.await {
                log::error!("Enumeration walker failed: {}", e);
            }
        });

        Ok(ItemStream::new(rx, task))
    }

    async fn operate(&self, operation: &Operation, ctx: &OperateContext) -> OperationResult {
        match self.apply(operation, ctx).await {
            Ok((hash_verified, bytes)) => {
                log::debug!(
                    "{} {} -> {} done",
                    operation.operation_type.as_str(),
                    operation.source_path,
                    operation.target_path
                );
                OperationResult::succeeded(&operation.id, hash_verified, bytes)
            }
            Err(e) => {
                log::warn!(
                    "{} {} -> {} failed: {}",
                    operation.operation_type.as_str(),
                    operation.source_path,
                    operation.target_path,
                    e
                );
                OperationResult::failed(&operation.id, &e)
            }
        }
    }

    fn validate_path(&self, path: &str) -> bool {
        self.limits()
            .permits(&self.resolve(path).to_string_lossy())
    }

    fn limits(&self) -> ProviderLimits {
        ProviderLimits {
            max_path_length: 4096,
            max_filename_length: 255,
            max_file_size: None,
            invalid_characters: vec!['\0'],
            reserved_names: Vec::new(),
            api_rate_limit: None,
        }
    }

    async fn content_hash(&self, path: &str, cancel: &CancellationToken) -> Result<Option<String>> {
        self.ensure_live()?;
        let resolved = self.resolve(path);
        let metadata = ensure_source(&resolved).await?;
        if !metadata.is_file() {
            return Ok(None);
        }

        let task = tokio::task::spawn_blocking(move || compute_blake3_hash(&resolved));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StowageError::Cancelled),
            joined = tokio::time::timeout(HASH_TIMEOUT, task) => match joined {
                Ok(Ok(hash)) => hash.map(Some),
                Ok(Err(e)) => Err(StowageError::Migration(format!("Hash task failed: {}", e))),
                Err(_) => Err(StowageError::Timeout(format!("hashing {}", path))),
            },
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}
