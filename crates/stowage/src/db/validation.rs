use crate::db::{IssueKind, Item, Severity, ValidationIssue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "LPT1", "LPT2", "LPT3",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationPolicy {
    pub max_depth: u32,
    pub max_items_per_folder: usize,
    pub max_path_length: usize,
    /// Providers considered primary storage. Empty disables the check.
    pub primary_providers: Vec<String>,
    pub invalid_characters: Vec<char>,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            max_depth: 8,
            max_items_per_folder: 500,
            max_path_length: 260,
            primary_providers: Vec::new(),
            invalid_characters: vec!['<', '>', ':', '"', '|', '?', '*'],
        }
    }
}

pub fn validate_items(items: &[Item], policy: &ValidationPolicy) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut folder_counts: BTreeMap<&str, usize> = BTreeMap::new();

    for item in items {
        *folder_counts.entry(item.parent_path()).or_default() += 1;
        validate_item(item, policy, &mut issues);
    }

    for (folder, count) in folder_counts {
        if count > policy.max_items_per_folder {
            issues.push(ValidationIssue {
                path: folder.to_string(),
                kind: IssueKind::OverDenseFolder,
                description: format!(
                    "Folder holds {} items (limit {})",
                    count, policy.max_items_per_folder
                ),
                severity: Severity::Warning,
            });
        }
    }

    issues
}

fn validate_item(item: &Item, policy: &ValidationPolicy, issues: &mut Vec<ValidationIssue>) {
    let mut push = |kind: IssueKind, severity: Severity, description: String| {
        issues.push(ValidationIssue {
            path: item.path.clone(),
            kind,
            description,
            severity,
        });
    };

    if item.path.chars().count() > policy.max_path_length {
        push(
            IssueKind::PathTooLong,
            Severity::Error,
            format!(
                "Path length {} exceeds {}",
                item.path.chars().count(),
                policy.max_path_length
            ),
        );
    }

    if let Some(bad) = item
        .name
        .chars()
        .find(|c| policy.invalid_characters.contains(c) || c.is_control())
    {
        push(
            IssueKind::InvalidCharacters,
            Severity::Error,
            format!("Name contains invalid character {:?}", bad),
        );
    }

    if item.depth > policy.max_depth {
        push(
            IssueKind::TooDeep,
            Severity::Warning,
            format!("Depth {} exceeds {}", item.depth, policy.max_depth),
        );
    }

    if let Some(reason) = name_problem(&item.name) {
        push(IssueKind::NonCompliantName, Severity::Warning, reason);
    }

    if !policy.primary_providers.is_empty() && !policy.primary_providers.contains(&item.provider_id)
    {
        push(
            IssueKind::OutsidePrimaryStorage,
            Severity::Info,
            format!("Stored on non-primary provider '{}'", item.provider_id),
        );
    }

    if item.is_file() && item.modified_at.is_none() && item.created_at.is_none() {
        push(
            IssueKind::MissingMetadata,
            Severity::Info,
            "No created or modified timestamp".to_string(),
        );
    }
}

fn name_problem(name: &str) -> Option<String> {
    if name.trim() != name {
        return Some("Name has leading or trailing whitespace".to_string());
    }
    if name.ends_with('.') {
        return Some("Name ends with a period".to_string());
    }
    let stem = name.split('.').next().unwrap_or(name);
    if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(stem)) {
        return Some(format!("'{}' is a reserved name", stem));
    }
    None
}
