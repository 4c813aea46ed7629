use crate::db::Item;
use crate::error::Result;
use crate::rules::config::{load_rules, TargetSpec};
use crate::rules::rule::{Rule, RuleMatch};
use crate::rules::{ConflictPolicy, TargetSuggestion};
use chrono::{DateTime, Datelike, Utc};
use std::collections::BTreeMap;
use std::path::Path;

/// A named, prioritized rule with its target.
#[derive(Debug, Clone)]
pub struct MappingRule {
    pub name: String,
    pub rule: Rule,
    pub target: TargetSpec,
    pub conflict_policy: ConflictPolicy,
    pub priority: i32,
}

impl MappingRule {
    pub fn new(name: impl Into<String>, rule: Rule, target: TargetSpec, priority: i32) -> Self {
        Self {
            name: name.into(),
            rule,
            target,
            conflict_policy: ConflictPolicy::default(),
            priority,
        }
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Render the suggestion for an item this rule matched.
    pub fn map(&self, item: &Item, matched: RuleMatch, now: DateTime<Utc>) -> TargetSuggestion {
        let tokens = template_tokens(item, &self.name, now);
        let mut applied = BTreeMap::new();

        let location = render_template(&self.target.location, &tokens, &mut applied);
        let mut target_name = render_template(&self.target.naming_template, &tokens, &mut applied);
        if target_name.trim().is_empty() {
            target_name = item.name.clone();
        }

        let location = location.trim_end_matches(['/', '\\']);
        let target_path = if location.is_empty() {
            target_name.clone()
        } else {
            format!("{}/{}", location, target_name)
        };

        TargetSuggestion {
            target_path,
            target_name,
            target_provider: self.target.provider.clone(),
            rule_name: self.name.clone(),
            confidence: matched.confidence.clamp(0.0, 1.0),
            reasons: matched.reasons,
            applied_tokens: applied,
            conflict_policy: self.conflict_policy,
            create_shortcut: self.target.create_shortcut,
            archive: self.target.archive,
        }
    }
}

fn template_tokens(item: &Item, rule_name: &str, now: DateTime<Utc>) -> BTreeMap<&'static str, String> {
    let (stem, ext) = match item.name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            (stem.to_string(), ext.to_string())
        }
        _ => (item.name.clone(), String::new()),
    };

    let dated = item.modified_at.or(item.created_at).unwrap_or(now);
    let parent = item
        .parent_path()
        .rsplit(['/', '\\'])
        .find(|s| !s.is_empty())
        .unwrap_or("")
        .to_string();

    BTreeMap::from([
        ("name", item.name.clone()),
        ("stem", stem),
        ("ext", ext),
        ("year", format!("{:04}", dated.year())),
        ("month", format!("{:02}", dated.month())),
        ("day", format!("{:02}", dated.day())),
        ("provider", item.provider_id.clone()),
        ("parent", parent),
        ("rule", rule_name.to_string()),
    ])
}

/// Substitute `{token}` placeholders. Unknown placeholders are left as
/// written; used tokens are recorded in `applied`.
pub fn render_template(
    template: &str,
    tokens: &BTreeMap<&'static str, String>,
    applied: &mut BTreeMap<String, String>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                match tokens.get(key) {
                    Some(value) => {
                        out.push_str(value);
                        applied.insert(key.to_string(), value.clone());
                    }
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Ordered rule set. Load order breaks priority ties.
#[derive(Debug, Clone, Default)]
pub struct RulesEngine {
    rules: Vec<MappingRule>,
}

impl RulesEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<MappingRule>) -> Self {
        Self { rules }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::with_rules(load_rules(path)?))
    }

    /// Append the rules in `path` after those already loaded.
    pub fn load_rules<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let loaded = load_rules(path)?;
        let count = loaded.len();
        self.rules.extend(loaded);
        Ok(count)
    }

    pub fn add_rule(&mut self, rule: MappingRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn evaluate(&self, item: &Item) -> Option<TargetSuggestion> {
        self.evaluate_at(item, Utc::now())
    }

    /// Best suggestion for `item` as of `now`: highest priority wins, then
    /// the earliest loaded rule.
    pub fn evaluate_at(&self, item: &Item, now: DateTime<Utc>) -> Option<TargetSuggestion> {
        let mut best: Option<(&MappingRule, RuleMatch)> = None;

        for candidate in &self.rules {
            if best
                .as_ref()
                .is_some_and(|(current, _)| candidate.priority <= current.priority)
            {
                continue;
            }
            if let Some(matched) = candidate.rule.evaluate(item, now) {
                best = Some((candidate, matched));
            }
        }

        best.map(|(rule, matched)| {
            log::debug!("{} -> rule '{}'", item.path, rule.name);
            rule.map(item, matched, now)
        })
    }

    pub fn applicable_rules(&self, item: &Item) -> Vec<&MappingRule> {
        self.applicable_rules_at(item, Utc::now())
    }

    pub fn applicable_rules_at(&self, item: &Item, now: DateTime<Utc>) -> Vec<&MappingRule> {
        self.rules
            .iter()
            .filter(|r| r.rule.matches(item, now))
            .collect()
    }
}
