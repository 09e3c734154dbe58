// 🏷️ Name Rules - Normalize raw receipt item names
// Receipts abbreviate and misprint; rules map what was read to a pretty name

use crate::receipt::Category;
use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// ============================================================================
// RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameRule {
    pub id: String,

    /// Raw name to match; `*` matches any run of characters.
    /// Without a wildcard the whole name must match (case-insensitive).
    pub pattern: String,

    /// Pretty name to use instead
    pub normalized: String,

    /// Category to suggest when the item has none
    #[serde(default)]
    pub category: Option<Category>,

    /// Higher = applied first
    #[serde(default)]
    pub priority: i32,
}

impl NameRule {
    pub fn new(id: &str, pattern: &str, normalized: &str) -> Self {
        NameRule {
            id: id.to_string(),
            pattern: pattern.to_string(),
            normalized: normalized.to_string(),
            category: None,
            priority: 0,
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        let pattern = self.pattern.trim().to_lowercase();
        let name = name.trim().to_lowercase();

        if !pattern.contains('*') {
            return pattern == name;
        }

        let parts: Vec<&str> = pattern.split('*').collect();
        let (first, rest) = match parts.split_first() {
            Some(split) => split,
            None => return false,
        };
        let (last, middle) = match rest.split_last() {
            Some(split) => split,
            None => return false,
        };

        if !name.starts_with(first) {
            return false;
        }
        let mut remaining = &name[first.len()..];

        for part in middle.iter().filter(|p| !p.is_empty()) {
            match remaining.find(part) {
                Some(pos) => remaining = &remaining[pos + part.len()..],
                None => return false,
            }
        }

        remaining.ends_with(last)
    }
}

// ============================================================================
// RULE SET
// ============================================================================

#[derive(Debug, Clone)]
pub struct NameRules {
    rules: Vec<NameRule>,
}

impl NameRules {
    pub fn empty() -> Self {
        NameRules { rules: Vec::new() }
    }

    /// Known misreads of organic ("BIO") products
    pub fn defaults() -> Self {
        NameRules::from_rules(vec![
            NameRule::new("biod-bananen", "BIOD BANANEN", "BIO BANANEN"),
            NameRule::new("biod-paprika-mix", "BIOD Paprika Mix", "BIO Paprika Mix"),
        ])
    }

    /// Load rules from a JSON array file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read name rules file: {:?}", path.as_ref()))?;

        let rules: Vec<NameRule> =
            serde_json::from_str(&content).context("Failed to parse name rules JSON")?;

        Ok(NameRules::from_rules(rules))
    }

    pub fn from_rules(mut rules: Vec<NameRule>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        NameRules { rules }
    }

    pub fn add_rule(&mut self, rule: NameRule) {
        self.rules.push(rule);
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    fn find(&self, name: &str) -> Option<&NameRule> {
        self.rules.iter().find(|rule| rule.matches(name))
    }

    /// Pretty name for a raw item name; unmatched names come back unchanged
    pub fn normalize(&self, name: &str) -> String {
        self.find(name)
            .map(|rule| rule.normalized.clone())
            .unwrap_or_else(|| name.to_string())
    }

    pub fn suggest_category(&self, name: &str) -> Option<Category> {
        self.find(name).and_then(|rule| rule.category)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl Default for NameRules {
    fn default() -> Self {
        Self::defaults()
    }
}

// ============================================================================
// TESTS
// ============================================================================
