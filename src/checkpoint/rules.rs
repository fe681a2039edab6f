//! Parameter-name rewrite rules for legacy checkpoints
//!
//! A legacy checkpoint differs from the current model layout in two ways:
//! keys may carry the multi-device wrapper prefix (`module.`), and DenseNet
//! layers use the old nested names (`norm.1`, `conv.2`) instead of the flat
//! ones (`norm1`, `conv2`). [`KeyRemapper`] applies a table of regex rules
//! followed by prefix removal.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{Error, Result};

/// A single `{pattern, replacement}` rewrite entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameRule {
    /// Regex matched against the full key
    pub pattern: String,
    /// Replacement template (`$1`, `${name}`, ...)
    pub replacement: String,
}

impl RenameRule {
    /// Create a rule from a pattern and replacement template
    pub fn new(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }

    /// Collapse `denselayerN.<norm|relu|conv>.<1|2>.<param>` into `denselayerN.<kind><1|2>.<param>`
    pub fn densenet_legacy() -> Self {
        Self::new(
            r"^(.*denselayer\d+\.(?:norm|relu|conv))\.((?:[12])\.(?:weight|bias|running_mean|running_var))$",
            "${1}${2}",
        )
    }

    /// Compile the pattern
    pub fn compile(&self) -> Result<CompiledRule> {
        Ok(CompiledRule {
            regex: Regex::new(&self.pattern)?,
            replacement: self.replacement.clone(),
        })
    }
}

/// A rule with its regex compiled
#[derive(Debug, Clone)]
pub struct CompiledRule {
    regex: Regex,
    replacement: String,
}

impl CompiledRule {
    /// Rewrite `key` if the rule matches it
    pub fn apply(&self, key: &str) -> Option<String> {
        if self.regex.is_match(key) {
            Some(self.regex.replace(key, self.replacement.as_str()).into_owned())
        } else {
            None
        }
    }
}

/// How a remapping pass changed the key set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemapReport {
    /// Keys rewritten by a rule
    pub renamed: usize,
    /// Keys that lost the wrapper prefix
    pub stripped: usize,
    /// Keys passed through untouched
    pub unchanged: usize,
}

/// Applies rename rules and wrapper-prefix removal to parameter names
#[derive(Debug, Clone)]
pub struct KeyRemapper {
    rules: Vec<CompiledRule>,
    wrapper_prefix: String,
}

impl KeyRemapper {
    /// Build a remapper from a rule table and wrapper prefix
    pub fn new(rules: &[RenameRule], wrapper_prefix: impl Into<String>) -> Result<Self> {
        let rules = rules.iter().map(RenameRule::compile).collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules,
            wrapper_prefix: wrapper_prefix.into(),
        })
    }

    /// Remapper for legacy CheXNet checkpoints
    pub fn chexnet() -> Result<Self> {
        Self::new(&[RenameRule::densenet_legacy()], "module.")
    }

    /// Transform one key, returning `(new_key, renamed_by_rule, prefix_stripped)`
    pub fn remap_key(&self, key: &str) -> (String, bool, bool) {
        let (key, renamed) = match self.rules.iter().find_map(|rule| rule.apply(key)) {
            Some(new_key) => (new_key, true),
            None => (key.to_string(), false),
        };

        // Only strip when present: a bare key must not lose its first characters.
        if !self.wrapper_prefix.is_empty() {
            if let Some(rest) = key.strip_prefix(self.wrapper_prefix.as_str()) {
                return (rest.to_string(), renamed, true);
            }
        }
        (key, renamed, false)
    }

    /// Remap every key of `state`, consuming it so no entry is visited twice
    pub fn remap<T>(&self, state: BTreeMap<String, T>) -> Result<(BTreeMap<String, T>, RemapReport)> {
        let mut report = RemapReport::default();
        let mut origins: BTreeMap<String, String> = BTreeMap::new();
        let mut remapped = BTreeMap::new();

        for (key, value) in state {
            let (new_key, renamed, stripped) = self.remap_key(&key);

            if renamed {
                report.renamed += 1;
            }
            if stripped {
                report.stripped += 1;
            }
            if !renamed && !stripped {
                report.unchanged += 1;
            } else {
                debug!("{} -> {}", key, new_key);
            }

            if let Some(first) = origins.get(&new_key) {
                return Err(Error::DuplicateKey {
                    first: first.clone(),
                    second: key,
                    target: new_key,
                });
            }
            origins.insert(new_key.clone(), key);
            remapped.insert(new_key, value);
        }

        Ok((remapped, report))
    }
}
