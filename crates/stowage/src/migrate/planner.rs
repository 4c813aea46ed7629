//! Turns rule suggestions into plan operations.
//!
//! Target collisions are checked against existing item paths on the target
//! provider and against targets already claimed by earlier operations of the
//! same plan. The suggestion's conflict policy decides the outcome.

use crate::db::{
    parent_of, DuplicateSet, Item, MigrationMetrics, Operation, OperationStatus, OperationType,
    ValidationIssue,
};
use crate::rules::{ConflictPolicy, TargetSuggestion};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

pub const MANUAL_CONFLICT_ERROR: &str = "manual conflict resolution required";
pub const TARGET_EXISTS_ERROR: &str = "target exists";

/// Comparison key for a provider path: `/` separators, no leading `/` or
/// `./`, no trailing `/`.
fn path_key(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let trimmed = unified.trim_start_matches("./").trim_matches('/');
    trimmed.to_string()
}

fn split_name(path: &str) -> (&str, &str) {
    match path.rfind(['/', '\\']) {
        Some(idx) => (&path[..=idx], &path[idx + 1..]),
        None => ("", path),
    }
}

/// `dir/stem<suffix>.ext`, keeping the extension last.
fn with_suffix(path: &str, suffix: &str) -> String {
    let (dir, name) = split_name(path);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            format!("{}{}{}.{}", dir, stem, suffix, ext)
        }
        _ => format!("{}{}{}", dir, name, suffix),
    }
}

fn path_depth(path: &str) -> usize {
    path.split(['/', '\\']).filter(|s| !s.is_empty() && *s != ".").count()
}

pub struct Planner {
    plan_id: String,
    non_destructive: bool,
    now: DateTime<Utc>,
    taken: HashSet<(String, String)>,
    operations: Vec<Operation>,
}

impl Planner {
    /// Existing paths in `items` count as taken on their provider.
    pub fn new(plan_id: &str, items: &[Item], non_destructive: bool, now: DateTime<Utc>) -> Self {
        let taken = items
            .iter()
            .map(|item| (item.provider_id.clone(), path_key(&item.path)))
            .collect();

        Self {
            plan_id: plan_id.to_string(),
            non_destructive,
            now,
            taken,
            operations: Vec::new(),
        }
    }

    fn is_taken(&self, provider: &str, path: &str) -> bool {
        self.taken
            .contains(&(provider.to_string(), path_key(path)))
    }

    fn operation_type(&self, item: &Item, suggestion: &TargetSuggestion, target_provider: &str) -> OperationType {
        let planned = if suggestion.create_shortcut {
            OperationType::CreateShortcut
        } else if suggestion.archive {
            OperationType::Archive
        } else if target_provider == item.provider_id
            && path_key(parent_of(&item.path)) == path_key(parent_of(&suggestion.target_path))
        {
            OperationType::Rename
        } else {
            OperationType::Move
        };

        match planned {
            OperationType::Move | OperationType::Rename | OperationType::Archive
                if self.non_destructive =>
            {
                OperationType::Copy
            }
            other => other,
        }
    }

    fn first_free_version(&self, provider: &str, path: &str) -> String {
        (2u32..)
            .map(|n| with_suffix(path, &format!(" ({})", n)))
            .find(|candidate| !self.is_taken(provider, candidate))
            .unwrap_or_else(|| path.to_string())
    }

    /// Resolve a taken target. `Err` carries the reason the operation is
    /// skipped instead.
    fn resolve_conflict(
        &self,
        item: &Item,
        provider: &str,
        target: &str,
        policy: ConflictPolicy,
    ) -> std::result::Result<String, &'static str> {
        match policy {
            ConflictPolicy::VersionSuffix => Ok(self.first_free_version(provider, target)),
            ConflictPolicy::TimestampSuffix => {
                let stamp = item
                    .modified_at
                    .or(item.created_at)
                    .unwrap_or(self.now)
                    .format("_%Y%m%d-%H%M%S")
                    .to_string();
                let stamped = with_suffix(target, &stamp);
                if self.is_taken(provider, &stamped) {
                    Ok(self.first_free_version(provider, &stamped))
                } else {
                    Ok(stamped)
                }
            }
            ConflictPolicy::Manual => Err(MANUAL_CONFLICT_ERROR),
            ConflictPolicy::Skip => Err(TARGET_EXISTS_ERROR),
        }
    }

    /// Plan one item. Returns `None` when the item is already in place.
    pub fn add(&mut self, item: &Item, suggestion: &TargetSuggestion) -> Option<&Operation> {
        let target_provider = suggestion
            .target_provider
            .clone()
            .unwrap_or_else(|| item.provider_id.clone());

        if target_provider == item.provider_id
            && path_key(&item.path) == path_key(&suggestion.target_path)
        {
            return None;
        }

        let operation_type = self.operation_type(item, suggestion, &target_provider);
        let mut target_path = suggestion.target_path.clone();
        let mut status = OperationStatus::Pending;
        let mut error = None;

        if self.is_taken(&target_provider, &target_path) {
            match self.resolve_conflict(item, &target_provider, &target_path, suggestion.conflict_policy) {
                Ok(resolved) => {
                    log::debug!("Target {} taken, using {}", target_path, resolved);
                    target_path = resolved;
                }
                Err(reason) => {
                    status = OperationStatus::Skipped;
                    error = Some(reason.to_string());
                }
            }
        }

        if status == OperationStatus::Pending {
            self.taken
                .insert((target_provider.clone(), path_key(&target_path)));
        }

        self.operations.push(Operation {
            id: uuid::Uuid::new_v4().to_string(),
            operation_type,
            source_path: item.path.clone(),
            source_provider: item.provider_id.clone(),
            target_path,
            target_provider,
            item_path: item.path.clone(),
            rule_name: Some(suggestion.rule_name.clone()),
            status,
            executed_at: None,
            error,
            correlation_id: self.plan_id.clone(),
            retry_count: 0,
            hash_verified: false,
            size_bytes: item.size_bytes,
            is_file: item.is_file(),
        });
        self.operations.last()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }
}

/// Aggregate plan metrics.
///
/// `target_is_valid(provider, path)` decides whether an operation's target
/// clears the provider's path limits.
pub fn compute_metrics(
    operations: &[Operation],
    items: &[Item],
    duplicates: &[DuplicateSet],
    issues: &[ValidationIssue],
    target_is_valid: &dyn Fn(&str, &str) -> bool,
) -> MigrationMetrics {
    let file_ops: Vec<&Operation> = operations.iter().filter(|op| op.is_file).collect();

    let duplicates_eliminated = duplicates
        .iter()
        .map(|set| set.items.len().saturating_sub(1))
        .sum();

    let depth_reduction = if operations.is_empty() {
        0.0
    } else {
        let depths: std::collections::HashMap<&str, u32> =
            items.iter().map(|i| (i.path.as_str(), i.depth)).collect();
        let count = operations.len() as f64;
        let source: f64 = operations
            .iter()
            .map(|op| {
                depths
                    .get(op.item_path.as_str())
                    .map(|d| *d as usize)
                    .unwrap_or_else(|| path_depth(&op.source_path)) as f64
            })
            .sum();
        let target: f64 = operations
            .iter()
            .map(|op| path_depth(&op.target_path) as f64)
            .sum();
        (source - target) / count
    };

    let compliance_uplift = if issues.is_empty() {
        0.0
    } else {
        let fixed: HashSet<&str> = operations
            .iter()
            .filter(|op| op.status != OperationStatus::Skipped)
            .filter(|op| target_is_valid(&op.target_provider, &op.target_path))
            .map(|op| op.item_path.as_str())
            .collect();
        let resolved = issues
            .iter()
            .filter(|issue| fixed.contains(issue.path.as_str()))
            .count();
        resolved as f64 / issues.len() as f64 * 100.0
    };

    MigrationMetrics {
        total_files: file_ops.len(),
        total_size_bytes: file_ops.iter().map(|op| op.size_bytes).sum(),
        duplicates_eliminated,
        depth_reduction,
        compliance_uplift,
    }
}
