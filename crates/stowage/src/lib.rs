pub mod config;
pub mod connector;
pub mod db;
pub mod error;
pub mod migrate;
pub mod progress;
pub mod resilience;
pub mod rules;
pub mod scan;

pub use config::{Config, Settings};
pub use connector::cloud::GoogleDriveConfig;
pub use connector::{
    AuthenticationResult, Connector, Credentials, EnumerationFilters, GoogleDriveConnector,
    ItemStream, LocalConnector, OperateContext, OperationResult, ProviderLimits,
};
pub use db::{
    AuditDatabase, AuditLogEntry, InventoryStore, Item, ItemType, MigrationMetrics,
    MigrationPlan, MigrationState, Operation, OperationStatus, OperationType, PlanStore,
    SqliteDatabase,
};
pub use error::{Result, StowageError};
pub use migrate::{
    ExecutionPolicy, MigrationOptions, MigrationOrchestrator, MigrationResult, OffHoursWindow,
};
pub use progress::{progress_channel, ProgressReporter, TransferProgress};
pub use resilience::{RateLimiter, RetryPolicy};
pub use rules::{ConflictPolicy, MappingRule, Rule, RulesEngine, TargetSuggestion};
pub use scan::{scan_provider, ScanOutcome};
