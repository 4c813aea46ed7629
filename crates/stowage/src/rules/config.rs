//! Rule file loading.
//!
//! A rule file is TOML with one `[[rules]]` table per rule:
//!
//! ```toml
//! [[rules]]
//! name = "old-downloads"
//! priority = 100
//! conflict_policy = "version_suffix"
//! match = { path_regex = "/downloads/", min_age_days = 90 }
//! target = { location = "Archive/{year}", naming_template = "{name}" }
//! ```
//!
//! The `match` table is reduced to a list of [`MatchCriterion`] values at
//! parse time. One criterion builds the matching leaf rule; several build an
//! AND composite with one leaf per criterion.

use crate::error::{Result, StowageError};
use crate::rules::engine::MappingRule;
use crate::rules::rule::Rule;
use crate::rules::ConflictPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_NAMING_TEMPLATE: &str = "{name}";

fn default_priority() -> i32 {
    50
}

fn default_naming_template() -> String {
    DEFAULT_NAMING_TEMPLATE.to_string()
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<RuleRecord>,
}

/// One `[[rules]]` entry as written in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRecord {
    pub name: String,
    #[serde(rename = "match", default)]
    pub criteria: MatchSpec,
    pub target: TargetSpec,
    #[serde(default)]
    pub conflict_policy: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

/// Optional match keys. Absent keys are not criteria.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchSpec {
    pub provider: Option<String>,
    pub path_regex: Option<String>,
    pub extensions: Option<Vec<String>>,
    pub min_age_days: Option<i64>,
    pub max_age_days: Option<i64>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
    pub keywords: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    pub location: String,
    #[serde(default = "default_naming_template")]
    pub naming_template: String,
    #[serde(default)]
    pub create_shortcut: bool,
    #[serde(default)]
    pub archive: bool,
    /// Destination provider; defaults to the item's own provider.
    #[serde(default)]
    pub provider: Option<String>,
}

impl TargetSpec {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            naming_template: default_naming_template(),
            create_shortcut: false,
            archive: false,
            provider: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchCriterion {
    Provider(String),
    PathRegex(String),
    Extensions(Vec<String>),
    Age { min_days: Option<i64>, max_days: Option<i64> },
    Size { min_bytes: Option<i64>, max_bytes: Option<i64> },
    Keywords(Vec<String>),
}

impl MatchCriterion {
    pub fn into_rule(self) -> Result<Rule> {
        match self {
            MatchCriterion::Provider(provider) => Ok(Rule::provider(provider)),
            MatchCriterion::PathRegex(pattern) => Rule::regex_path(&pattern),
            MatchCriterion::Extensions(extensions) => Ok(Rule::extension(extensions)),
            MatchCriterion::Age { min_days, max_days } => Ok(Rule::age_based(min_days, max_days)),
            MatchCriterion::Size {
                min_bytes,
                max_bytes,
            } => Ok(Rule::size(min_bytes, max_bytes)),
            MatchCriterion::Keywords(keywords) => Ok(Rule::keyword(keywords)),
        }
    }
}

fn non_empty(values: &Option<Vec<String>>) -> Option<Vec<String>> {
    values
        .as_ref()
        .map(|v| {
            v.iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
}

impl MatchSpec {
    /// Recognized criteria, in a fixed order.
    pub fn criteria(&self) -> Vec<MatchCriterion> {
        let mut criteria = Vec::new();

        if let Some(provider) = self.provider.as_deref().map(str::trim) {
            if !provider.is_empty() {
                criteria.push(MatchCriterion::Provider(provider.to_string()));
            }
        }
        if let Some(pattern) = self.path_regex.as_deref() {
            if !pattern.trim().is_empty() {
                criteria.push(MatchCriterion::PathRegex(pattern.to_string()));
            }
        }
        if let Some(extensions) = non_empty(&self.extensions) {
            criteria.push(MatchCriterion::Extensions(extensions));
        }
        if self.min_age_days.is_some() || self.max_age_days.is_some() {
            criteria.push(MatchCriterion::Age {
                min_days: self.min_age_days,
                max_days: self.max_age_days,
            });
        }
        if self.min_size.is_some() || self.max_size.is_some() {
            criteria.push(MatchCriterion::Size {
                min_bytes: self.min_size,
                max_bytes: self.max_size,
            });
        }
        if let Some(keywords) = non_empty(&self.keywords) {
            criteria.push(MatchCriterion::Keywords(keywords));
        }

        criteria
    }
}

/// Build the rule for a set of criteria.
pub fn build_rule(rule_name: &str, criteria: Vec<MatchCriterion>) -> Result<Rule> {
    if criteria.is_empty() {
        return Err(StowageError::Config(format!(
            "Rule '{}' has no match criteria",
            rule_name
        )));
    }

    let mut rules = criteria
        .into_iter()
        .map(MatchCriterion::into_rule)
        .collect::<Result<Vec<_>>>()?;

    if rules.len() == 1 {
        Ok(rules.remove(0))
    } else {
        Ok(Rule::all(rules))
    }
}

impl RuleRecord {
    pub fn into_mapping_rule(self) -> Result<MappingRule> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(StowageError::Config("Rule name must not be empty".to_string()));
        }
        if self.target.location.trim().is_empty() && self.target.naming_template.trim().is_empty() {
            return Err(StowageError::Config(format!(
                "Rule '{}' has no target location",
                name
            )));
        }

        let rule = build_rule(&name, self.criteria.criteria())?;
        let conflict_policy = match self.conflict_policy.as_deref() {
            Some(raw) => ConflictPolicy::from_str(raw)
                .map_err(|e| StowageError::Config(format!("Rule '{}': {}", name, e)))?,
            None => ConflictPolicy::default(),
        };

        Ok(MappingRule {
            name,
            rule,
            target: self.target,
            conflict_policy,
            priority: self.priority,
        })
    }
}

/// Parse rule file content, preserving file order.
pub fn parse_rules(content: &str) -> Result<Vec<MappingRule>> {
    let file: RuleFile = toml::from_str(content)
        .map_err(|e| StowageError::Config(format!("Failed to parse rules: {}", e)))?;

    file.rules
        .into_iter()
        .map(RuleRecord::into_mapping_rule)
        .collect()
}

pub fn load_rules<P: AsRef<Path>>(path: P) -> Result<Vec<MappingRule>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StowageError::FileNotFound(path.to_path_buf())
        } else {
            StowageError::Io(e)
        }
    })?;

    let rules = parse_rules(&content)?;
    log::info!("Loaded {} rules from {}", rules.len(), path.display());
    Ok(rules)
}
