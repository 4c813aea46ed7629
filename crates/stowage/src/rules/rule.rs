//! Rule variants and their match semantics.

use crate::db::Item;
use crate::error::{Result, StowageError};
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

pub const EXTENSION_CONFIDENCE: f64 = 0.9;
pub const REGEX_PATH_CONFIDENCE: f64 = 0.85;
pub const KEYWORD_CONFIDENCE: f64 = 0.75;
pub const AGE_CONFIDENCE: f64 = 0.7;
pub const SIZE_CONFIDENCE: f64 = 0.6;
pub const PROVIDER_CONFIDENCE: f64 = 0.5;

/// Added to the mean confidence of an AND composite whose children all matched.
const COMPOSITE_AND_BONUS: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositeMode {
    And,
    Or,
}

/// A matcher over a single item.
///
/// Composite rules are opaque to callers: they match or not as a whole.
#[derive(Debug, Clone)]
pub enum Rule {
    Extension {
        extensions: Vec<String>,
    },
    RegexPath {
        regex: Regex,
    },
    AgeBased {
        min_days: Option<i64>,
        max_days: Option<i64>,
    },
    Size {
        min_bytes: Option<i64>,
        max_bytes: Option<i64>,
    },
    Keyword {
        keywords: Vec<String>,
    },
    Provider {
        provider_id: String,
    },
    Composite {
        mode: CompositeMode,
        children: Vec<Rule>,
    },
}

/// Outcome of a successful match.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub confidence: f64,
    pub reasons: Vec<String>,
}

impl RuleMatch {
    fn leaf(confidence: f64, reason: String) -> Self {
        Self {
            confidence,
            reasons: vec![reason],
        }
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

impl Rule {
    pub fn extension<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Rule::Extension {
            extensions: extensions
                .into_iter()
                .map(|e| normalize_extension(e.as_ref()))
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// Case-insensitive pattern over the full item path.
    pub fn regex_path(pattern: &str) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| StowageError::Config(format!("Invalid path regex '{}': {}", pattern, e)))?;
        Ok(Rule::RegexPath { regex })
    }

    pub fn age_based(min_days: Option<i64>, max_days: Option<i64>) -> Self {
        Rule::AgeBased { min_days, max_days }
    }

    pub fn size(min_bytes: Option<i64>, max_bytes: Option<i64>) -> Self {
        Rule::Size {
            min_bytes,
            max_bytes,
        }
    }

    pub fn keyword<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Rule::Keyword {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn provider(provider_id: impl Into<String>) -> Self {
        Rule::Provider {
            provider_id: provider_id.into(),
        }
    }

    pub fn all(children: Vec<Rule>) -> Self {
        Rule::Composite {
            mode: CompositeMode::And,
            children,
        }
    }

    pub fn any(children: Vec<Rule>) -> Self {
        Rule::Composite {
            mode: CompositeMode::Or,
            children,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Rule::Extension { .. } => "extension",
            Rule::RegexPath { .. } => "regex_path",
            Rule::AgeBased { .. } => "age",
            Rule::Size { .. } => "size",
            Rule::Keyword { .. } => "keyword",
            Rule::Provider { .. } => "provider",
            Rule::Composite { .. } => "composite",
        }
    }

    pub fn matches(&self, item: &Item, now: DateTime<Utc>) -> bool {
        self.evaluate(item, now).is_some()
    }

    /// Match `item` as of `now`, returning confidence and reasons.
    pub fn evaluate(&self, item: &Item, now: DateTime<Utc>) -> Option<RuleMatch> {
        match self {
            Rule::Extension { extensions } => {
                let ext = item.extension()?;
                extensions
                    .iter()
                    .any(|e| e == &ext)
                    .then(|| RuleMatch::leaf(EXTENSION_CONFIDENCE, format!("extension .{}", ext)))
            }
            Rule::RegexPath { regex } => regex.is_match(&item.path).then(|| {
                RuleMatch::leaf(
                    REGEX_PATH_CONFIDENCE,
                    format!("path matches /{}/", regex.as_str()),
                )
            }),
            Rule::AgeBased { min_days, max_days } => {
                let age = age_in_days(item, now)?;
                let min_ok = min_days.map_or(true, |min| age >= min);
                let max_ok = max_days.map_or(true, |max| age <= max);
                (min_ok && max_ok)
                    .then(|| RuleMatch::leaf(AGE_CONFIDENCE, format!("last modified {} days ago", age)))
            }
            Rule::Size {
                min_bytes,
                max_bytes,
            } => {
                let size = item.size_bytes;
                let min_ok = min_bytes.map_or(true, |min| size >= min);
                let max_ok = max_bytes.map_or(true, |max| size <= max);
                (min_ok && max_ok)
                    .then(|| RuleMatch::leaf(SIZE_CONFIDENCE, format!("size {} bytes", size)))
            }
            Rule::Keyword { keywords } => {
                let name = item.name.to_lowercase();
                keywords
                    .iter()
                    .find(|k| name.contains(k.as_str()))
                    .map(|k| RuleMatch::leaf(KEYWORD_CONFIDENCE, format!("name contains '{}'", k)))
            }
            Rule::Provider { provider_id } => {
                (item.provider_id == *provider_id).then(|| {
                    RuleMatch::leaf(PROVIDER_CONFIDENCE, format!("stored on {}", provider_id))
                })
            }
            Rule::Composite { mode, children } => evaluate_composite(*mode, children, item, now),
        }
    }
}

fn evaluate_composite(
    mode: CompositeMode,
    children: &[Rule],
    item: &Item,
    now: DateTime<Utc>,
) -> Option<RuleMatch> {
    if children.is_empty() {
        return None;
    }

    match mode {
        CompositeMode::And => {
            let mut reasons = Vec::new();
            let mut total = 0.0;
            for child in children {
                let matched = child.evaluate(item, now)?;
                total += matched.confidence;
                reasons.extend(matched.reasons);
            }
            let confidence = total / children.len() as f64 + COMPOSITE_AND_BONUS;
            Some(RuleMatch {
                confidence: confidence.clamp(0.0, 1.0),
                reasons,
            })
        }
        CompositeMode::Or => {
            let matched: Vec<RuleMatch> = children
                .iter()
                .filter_map(|child| child.evaluate(item, now))
                .collect();
            if matched.is_empty() {
                return None;
            }
            let confidence = matched
                .iter()
                .map(|m| m.confidence)
                .fold(0.0_f64, f64::max);
            Some(RuleMatch {
                confidence: confidence.clamp(0.0, 1.0),
                reasons: matched.into_iter().flat_map(|m| m.reasons).collect(),
            })
        }
    }
}

/// Whole days since last modification, truncated toward zero.
pub fn age_in_days(item: &Item, now: DateTime<Utc>) -> Option<i64> {
    item.modified_at.map(|modified| (now - modified).num_days())
}
