#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use stowage_lib::connector::{ItemStream, ProviderLimits};
use stowage_lib::{
    AuthenticationResult, Connector, EnumerationFilters, InventoryStore, Item, ItemType,
    OperateContext, Operation, OperationResult, Result, SqliteDatabase, StowageError,
};
use tokio_util::sync::CancellationToken;

pub type Store = Arc<Mutex<SqliteDatabase>>;

pub fn memory_store() -> Store {
    let mut db = SqliteDatabase::open_in_memory().unwrap();
    db.initialize().unwrap();
    Arc::new(Mutex::new(db))
}

pub fn file_item(path: &str, size_bytes: i64, age_days: i64) -> Item {
    let name = path.rsplit('/').next().unwrap_or(path).to_string();
    let modified = Utc::now() - Duration::days(age_days);
    Item {
        path: path.to_string(),
        name,
        provider_id: "mock".to_string(),
        size_bytes,
        mime_type: None,
        created_at: Some(modified),
        modified_at: Some(modified),
        content_hash: None,
        item_type: ItemType::File,
        depth: path.split('/').filter(|s| !s.is_empty()).count() as u32,
        extended_properties: Default::default(),
        issues: Vec::new(),
        is_shared: false,
    }
}

/// Create a completed scan holding `items`.
pub fn seed_scan(store: &Store, items: &[Item]) -> String {
    let mut db = store.lock().unwrap();
    let scan_id = db.create_scan(&["mock".to_string()]).unwrap();
    db.add_items(&scan_id, items).unwrap();
    db.complete_scan(&scan_id).unwrap();
    scan_id
}

type Hook = Box<dyn Fn(usize) + Send + Sync>;

/// Connector that records operations instead of touching storage.
///
/// Calls are numbered from 1. Paths in `transient_failures` fail with a
/// network error that many times before succeeding; paths in
/// `corrupt` always fail verification.
pub struct MockConnector {
    provider_id: String,
    calls: AtomicUsize,
    applied: Mutex<Vec<String>>,
    transient_failures: Mutex<HashMap<String, usize>>,
    corrupt: Vec<String>,
    cancel_at: Option<usize>,
    hook: Option<Hook>,
}

impl MockConnector {
    pub fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            calls: AtomicUsize::new(0),
            applied: Mutex::new(Vec::new()),
            transient_failures: Mutex::new(HashMap::new()),
            corrupt: Vec::new(),
            cancel_at: None,
            hook: None,
        }
    }

    pub fn failing_transiently(self, path: &str, times: usize) -> Self {
        self.transient_failures
            .lock()
            .unwrap()
            .insert(path.to_string(), times);
        self
    }

    pub fn corrupting(mut self, path: &str) -> Self {
        self.corrupt.push(path.to_string());
        self
    }

    /// Cancel the execution token during call `n`.
    pub fn cancelling_at(mut self, n: usize) -> Self {
        self.cancel_at = Some(n);
        self
    }

    /// Run `hook` with the call number before each operation.
    pub fn with_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn authenticate(&self, _cancel: &CancellationToken) -> Result<AuthenticationResult> {
        Ok(AuthenticationResult {
            user_id: "tester".to_string(),
            email: None,
            display_name: None,
            quota: None,
        })
    }

    async fn enumerate(
        &self,
        _root: &str,
        _filters: &EnumerationFilters,
        _cancel: CancellationToken,
    ) -> Result<ItemStream> {
        Err(StowageError::InvalidState(
            "mock connector does not enumerate".to_string(),
        ))
    }

    async fn operate(&self, operation: &Operation, ctx: &OperateContext) -> OperationResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.hook {
            hook(call);
        }

        if self.cancel_at == Some(call) {
            ctx.cancel.cancel();
            return OperationResult::failed(&operation.id, &StowageError::Cancelled);
        }

        if self.corrupt.contains(&operation.source_path) {
            return OperationResult::failed(
                &operation.id,
                &StowageError::HashMismatch {
                    path: operation.target_path.clone(),
                    expected: "aaaa".to_string(),
                    actual: "bbbb".to_string(),
                },
            );
        }

        {
            let mut failures = self.transient_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&operation.source_path) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return OperationResult::failed(
                        &operation.id,
                        &StowageError::Network("connection reset".to_string()),
                    );
                }
            }
        }

        self.applied
            .lock()
            .unwrap()
            .push(format!("{} -> {}", operation.source_path, operation.target_path));
        OperationResult::succeeded(&operation.id, ctx.verify_hashes, operation.size_bytes as u64)
    }

    fn validate_path(&self, path: &str) -> bool {
        self.limits().permits(path)
    }

    fn limits(&self) -> ProviderLimits {
        ProviderLimits {
            max_path_length: 400,
            max_filename_length: 255,
            max_file_size: None,
            invalid_characters: vec!['*', '?'],
            reserved_names: Vec::new(),
            api_rate_limit: None,
        }
    }

    async fn content_hash(&self, _path: &str, _cancel: &CancellationToken) -> Result<Option<String>> {
        Ok(None)
    }

    fn dispose(&self) {}
}
