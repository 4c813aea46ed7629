pub mod audit;
pub mod duplicates;
pub mod items;
pub mod plans;
pub mod schema;
pub mod validation;

use crate::error::{Result, StowageError};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub use audit::AuditDatabase;
pub use plans::PlanStore;
pub use validation::ValidationPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub path: String,
    pub name: String,
    pub provider_id: String,
    pub size_bytes: i64,
    pub mime_type: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
    pub item_type: ItemType,
    pub depth: u32,
    #[serde(default)]
    pub extended_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub issues: Vec<String>,
    pub is_shared: bool,
}

impl Item {
    /// Lowercased extension of the item name, if any.
    pub fn extension(&self) -> Option<String> {
        let (stem, ext) = self.name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_lowercase())
    }

    /// Parent portion of the path, using `/` as separator.
    pub fn parent_path(&self) -> &str {
        parent_of(&self.path)
    }

    pub fn is_file(&self) -> bool {
        self.item_type == ItemType::File
    }
}

/// Parent of a provider path, treating both `/` and `\` as separators.
pub fn parent_of(path: &str) -> &str {
    match path.rfind(['/', '\\']) {
        Some(0) => &path[..1],
        Some(idx) => &path[..idx],
        None => "",
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ItemType {
    File,
    Folder,
    Shortcut,
    Link,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::File => "file",
            ItemType::Folder => "folder",
            ItemType::Shortcut => "shortcut",
            ItemType::Link => "link",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(ItemType::File),
            "folder" => Ok(ItemType::Folder),
            "shortcut" => Ok(ItemType::Shortcut),
            "link" => Ok(ItemType::Link),
            _ => Err(StowageError::Config(format!("Invalid item type: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScanStatus {
    Pending,
    Running,
    Complete,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Complete => "complete",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ScanStatus::Pending),
            "running" => Ok(ScanStatus::Running),
            "complete" => Ok(ScanStatus::Complete),
            _ => Err(StowageError::Config(format!("Invalid scan status: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScanStatistics {
    pub total_items: usize,
    pub total_files: usize,
    pub total_folders: usize,
    pub total_bytes: i64,
    pub max_depth: u32,
    pub average_depth: f64,
    pub hashed_files: usize,
    pub shared_items: usize,
    pub items_with_issues: usize,
    pub items_by_provider: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub scan_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ScanStatus,
    pub provider_ids: Vec<String>,
    pub items: Vec<Item>,
    pub statistics: ScanStatistics,
    pub duplicates: Vec<DuplicateSet>,
    pub issues: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DuplicateKind {
    /// Same content hash and size
    Exact,
    /// No content hash; same name and size
    Probable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateSet {
    pub hash: Option<String>,
    pub size_bytes: i64,
    pub kind: DuplicateKind,
    pub items: Vec<Item>,
}

impl DuplicateSet {
    /// Bytes that would be reclaimed by keeping a single copy.
    pub fn wasted_bytes(&self) -> i64 {
        self.size_bytes * (self.items.len().saturating_sub(1) as i64)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum IssueKind {
    NonCompliantName,
    TooDeep,
    OverDenseFolder,
    OutsidePrimaryStorage,
    InvalidCharacters,
    PathTooLong,
    MissingMetadata,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::NonCompliantName => "non_compliant_name",
            IssueKind::TooDeep => "too_deep",
            IssueKind::OverDenseFolder => "over_dense_folder",
            IssueKind::OutsidePrimaryStorage => "outside_primary_storage",
            IssueKind::InvalidCharacters => "invalid_characters",
            IssueKind::PathTooLong => "path_too_long",
            IssueKind::MissingMetadata => "missing_metadata",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationIssue {
    pub path: String,
    pub kind: IssueKind,
    pub description: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationType {
    Copy,
    Move,
    Rename,
    CreateShortcut,
    Delete,
    Archive,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Copy => "copy",
            OperationType::Move => "move",
            OperationType::Rename => "rename",
            OperationType::CreateShortcut => "create_shortcut",
            OperationType::Delete => "delete",
            OperationType::Archive => "archive",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "copy" => Ok(OperationType::Copy),
            "move" => Ok(OperationType::Move),
            "rename" => Ok(OperationType::Rename),
            "create_shortcut" => Ok(OperationType::CreateShortcut),
            "delete" => Ok(OperationType::Delete),
            "archive" => Ok(OperationType::Archive),
            _ => Err(StowageError::Config(format!("Invalid operation type: {}", s))),
        }
    }

    /// Whether the operation writes new content at the target.
    pub fn transfers_content(&self) -> bool {
        matches!(
            self,
            OperationType::Copy | OperationType::Move | OperationType::Archive
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    RolledBack,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Skipped => "skipped",
            OperationStatus::RolledBack => "rolled_back",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "in_progress" => Ok(OperationStatus::InProgress),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            "skipped" => Ok(OperationStatus::Skipped),
            "rolled_back" => Ok(OperationStatus::RolledBack),
            _ => Err(StowageError::Config(format!("Invalid operation status: {}", s))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed
                | OperationStatus::Failed
                | OperationStatus::Skipped
                | OperationStatus::RolledBack
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub operation_type: OperationType,
    pub source_path: String,
    pub source_provider: String,
    pub target_path: String,
    pub target_provider: String,
    pub item_path: String,
    pub rule_name: Option<String>,
    pub status: OperationStatus,
    pub executed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub correlation_id: String,
    pub retry_count: u32,
    pub hash_verified: bool,
    pub size_bytes: i64,
    pub is_file: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MigrationMetrics {
    pub total_files: usize,
    pub total_size_bytes: i64,
    pub duplicates_eliminated: usize,
    pub depth_reduction: f64,
    pub compliance_uplift: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub id: String,
    pub scan_id: String,
    pub operations: Vec<Operation>,
    pub metrics: MigrationMetrics,
    pub is_what_if: bool,
    pub created_at: DateTime<Utc>,
}

impl MigrationPlan {
    pub fn total_operations(&self) -> usize {
        self.operations.len()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MigrationState {
    Draft,
    Planning,
    Ready,
    Running,
    Paused,
    Completed,
    Failed,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::Draft => "draft",
            MigrationState::Planning => "planning",
            MigrationState::Ready => "ready",
            MigrationState::Running => "running",
            MigrationState::Paused => "paused",
            MigrationState::Completed => "completed",
            MigrationState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(MigrationState::Draft),
            "planning" => Ok(MigrationState::Planning),
            "ready" => Ok(MigrationState::Ready),
            "running" => Ok(MigrationState::Running),
            "paused" => Ok(MigrationState::Paused),
            "completed" => Ok(MigrationState::Completed),
            "failed" => Ok(MigrationState::Failed),
            _ => Err(StowageError::Config(format!("Invalid migration state: {}", s))),
        }
    }

    pub fn can_transition_to(&self, next: MigrationState) -> bool {
        use MigrationState::*;
        matches!(
            (self, next),
            (Draft, Planning)
                | (Planning, Ready)
                | (Planning, Failed)
                | (Ready, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Failed)
        )
    }
}

/// Last durable batch boundary of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub plan_id: String,
    pub batch_index: usize,
    pub operations_done: usize,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub plan_id: Option<String>,
    pub operation_id: Option<String>,
    pub details: Option<String>,
}

impl AuditLogEntry {
    pub fn new(action: &str, plan_id: Option<&str>, details: Option<String>) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            action: action.to_string(),
            plan_id: plan_id.map(|s| s.to_string()),
            operation_id: None,
            details,
        }
    }
}

/// Inventory of scanned items, one scan at a time per writer.
pub trait InventoryStore {
    fn create_scan(&mut self, provider_ids: &[String]) -> Result<String>;
    fn add_items(&mut self, scan_id: &str, items: &[Item]) -> Result<usize>;
    fn get_scan_result(&mut self, scan_id: &str) -> Result<ScanResult>;
    fn find_duplicates(&mut self, scan_id: &str) -> Result<Vec<DuplicateSet>>;
    fn validate(&self, scan_id: &str) -> Result<Vec<ValidationIssue>>;
    fn get_statistics(&self, scan_id: &str) -> Result<ScanStatistics>;
    fn query_items(&self, scan_id: &str, predicate: &dyn Fn(&Item) -> bool) -> Result<Vec<Item>>;
    fn complete_scan(&mut self, scan_id: &str) -> Result<ScanStatistics>;
}

pub struct SqliteDatabase {
    conn: Connection,
    validation_policy: ValidationPolicy,
    duplicate_cache: HashMap<String, Vec<DuplicateSet>>,
}

impl SqliteDatabase {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self::with_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::with_connection(conn))
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            conn,
            validation_policy: ValidationPolicy::default(),
            duplicate_cache: HashMap::new(),
        }
    }

    pub fn initialize(&mut self) -> Result<()> {
        schema::initialize_schema(&self.conn)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn validation_policy(&self) -> &ValidationPolicy {
        &self.validation_policy
    }

    pub fn set_validation_policy(&mut self, policy: ValidationPolicy) {
        self.validation_policy = policy;
    }

    pub fn list_scans(&self) -> Result<Vec<items::ScanSummary>> {
        items::list_scans(&self.conn)
    }
}

impl InventoryStore for SqliteDatabase {
    fn create_scan(&mut self, provider_ids: &[String]) -> Result<String> {
        items::create_scan(&self.conn, provider_ids)
    }

    fn add_items(&mut self, scan_id: &str, batch: &[Item]) -> Result<usize> {
        let inserted = items::insert_items(&mut self.conn, scan_id, batch)?;
        self.duplicate_cache.remove(scan_id);
        Ok(inserted)
    }

    fn get_scan_result(&mut self, scan_id: &str) -> Result<ScanResult> {
        let header = items::get_scan_header(&self.conn, scan_id)?;
        let scan_items = items::get_items(&self.conn, scan_id)?;
        let statistics = items::compute_statistics(&self.conn, scan_id)?;
        let duplicates = self.find_duplicates(scan_id)?;
        let issues = validation::validate_items(&scan_items, &self.validation_policy);

        Ok(ScanResult {
            scan_id: header.scan_id,
            started_at: header.started_at,
            completed_at: header.completed_at,
            status: header.status,
            provider_ids: header.provider_ids,
            items: scan_items,
            statistics,
            duplicates,
            issues,
        })
    }

    fn find_duplicates(&mut self, scan_id: &str) -> Result<Vec<DuplicateSet>> {
        if let Some(cached) = self.duplicate_cache.get(scan_id) {
            return Ok(cached.clone());
        }

        items::get_scan_header(&self.conn, scan_id)?;
        let sets = duplicates::find_duplicate_sets(&self.conn, scan_id)?;
        self.duplicate_cache.insert(scan_id.to_string(), sets.clone());
        Ok(sets)
    }

    fn validate(&self, scan_id: &str) -> Result<Vec<ValidationIssue>> {
        items::get_scan_header(&self.conn, scan_id)?;
        let scan_items = items::get_items(&self.conn, scan_id)?;
        Ok(validation::validate_items(&scan_items, &self.validation_policy))
    }

    fn get_statistics(&self, scan_id: &str) -> Result<ScanStatistics> {
        items::get_scan_header(&self.conn, scan_id)?;
        items::compute_statistics(&self.conn, scan_id)
    }

    fn query_items(&self, scan_id: &str, predicate: &dyn Fn(&Item) -> bool) -> Result<Vec<Item>> {
        items::get_scan_header(&self.conn, scan_id)?;
        Ok(items::get_items(&self.conn, scan_id)?
            .into_iter()
            .filter(|item| predicate(item))
            .collect())
    }

    fn complete_scan(&mut self, scan_id: &str) -> Result<ScanStatistics> {
        let statistics = items::compute_statistics(&self.conn, scan_id)?;
        items::finish_scan(&self.conn, scan_id, &statistics)?;
        Ok(statistics)
    }
}
