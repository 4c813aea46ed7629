//! Placement rules.
//!
//! Rules are loaded from TOML, each one pairing a matcher with a target
//! location and naming template. For a given item the engine picks the
//! highest-priority matching rule and renders a [`TargetSuggestion`].

pub mod config;
pub mod engine;
pub mod rule;

use crate::error::{Result, StowageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use config::{load_rules, parse_rules, MatchCriterion, MatchSpec, RuleRecord, TargetSpec};
pub use engine::{render_template, MappingRule, RulesEngine};
pub use rule::{CompositeMode, Rule, RuleMatch};

/// How the planner resolves a target that is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// `name (2).ext`, `name (3).ext`, ...
    #[default]
    VersionSuffix,
    /// `name_YYYYMMDD-HHMMSS.ext` from the item's timestamps
    TimestampSuffix,
    Manual,
    Skip,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::VersionSuffix => "version_suffix",
            ConflictPolicy::TimestampSuffix => "timestamp_suffix",
            ConflictPolicy::Manual => "manual",
            ConflictPolicy::Skip => "skip",
        }
    }

    /// Accepts snake_case, kebab-case or PascalCase spellings.
    pub fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "versionsuffix" => Ok(ConflictPolicy::VersionSuffix),
            "timestampsuffix" => Ok(ConflictPolicy::TimestampSuffix),
            "manual" => Ok(ConflictPolicy::Manual),
            "skip" => Ok(ConflictPolicy::Skip),
            _ => Err(StowageError::Config(format!(
                "Unknown conflict policy: {}",
                s
            ))),
        }
    }
}

/// Where one rule would place one item.
#[derive(Debug, Clone, Serialize)]
pub struct TargetSuggestion {
    pub target_path: String,
    pub target_name: String,
    /// Provider the target lives on; `None` keeps the item's own provider.
    pub target_provider: Option<String>,
    pub rule_name: String,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub applied_tokens: BTreeMap<String, String>,
    pub conflict_policy: ConflictPolicy,
    pub create_shortcut: bool,
    pub archive: bool,
}
