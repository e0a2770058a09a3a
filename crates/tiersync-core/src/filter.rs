//! Asset filter rules applied when a sync task is planned.
//!
//! The textual form is a `;`-separated list such as `*.mov;*.prproj;min:1MB`.
//! Glob tokens without a `/` match the file name, tokens with a `/` match the
//! whole key. `min:` and `max:` tokens bound the asset size.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::asset::Asset;
use crate::error::{CoreError, CoreResult};

/// Predicate over asset key and size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Glob patterns; an empty list matches every key.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Inclusive lower size bound in bytes.
    #[serde(default)]
    pub min_size: Option<u64>,
    /// Inclusive upper size bound in bytes.
    #[serde(default)]
    pub max_size: Option<u64>,
}

impl FilterRule {
    /// Rule that accepts every asset.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Parses the `;`-separated textual form.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationError` for malformed size tokens or
    /// inverted bounds.
    pub fn parse(expr: &str) -> CoreResult<Self> {
        let mut rule = Self::default();

        for token in expr.split(';').map(str::trim).filter(|t| !t.is_empty()) {
            if let Some(size) = token.strip_prefix("min:") {
                rule.min_size = Some(parse_size(size)?);
            } else if let Some(size) = token.strip_prefix("max:") {
                rule.max_size = Some(parse_size(size)?);
            } else {
                rule.patterns.push(token.to_string());
            }
        }

        rule.validate()?;
        Ok(rule)
    }

    /// Validate filter bounds
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationError` if `min_size > max_size`.
    pub fn validate(&self) -> CoreResult<()> {
        if let (Some(min), Some(max)) = (self.min_size, self.max_size) {
            if min > max {
                return Err(CoreError::validation(format!(
                    "filter min size {min} exceeds max size {max}"
                )));
            }
        }
        Ok(())
    }

    /// Whether the asset passes the rule.
    #[must_use]
    pub fn matches(&self, asset: &Asset) -> bool {
        self.matches_parts(&asset.key, asset.size_bytes)
    }

    /// Whether a key of the given size passes the rule.
    #[must_use]
    pub fn matches_parts(&self, key: &str, size_bytes: u64) -> bool {
        if self.min_size.is_some_and(|min| size_bytes < min) {
            return false;
        }
        if self.max_size.is_some_and(|max| size_bytes > max) {
            return false;
        }
        if self.patterns.is_empty() {
            return true;
        }

        let file_name = key.rsplit('/').next().unwrap_or(key);
        self.patterns.iter().any(|pattern| {
            let subject = if pattern.contains('/') { key } else { file_name };
            glob_match(
                &pattern.to_ascii_lowercase(),
                &subject.to_ascii_lowercase(),
            )
        })
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tokens = self.patterns.clone();
        if let Some(min) = self.min_size {
            tokens.push(format!("min:{min}"));
        }
        if let Some(max) = self.max_size {
            tokens.push(format!("max:{max}"));
        }
        f.write_str(&tokens.join(";"))
    }
}

impl FromStr for FilterRule {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Matches `*` (any run, possibly empty) and `?` (one character).
fn glob_match(pattern: &str, subject: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let subject: Vec<char> = subject.chars().collect();

    let (mut p, mut s) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while s < subject.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == subject[s]) {
            p += 1;
            s += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, s));
            p += 1;
        } else if let Some((star_p, star_s)) = backtrack {
            p = star_p + 1;
            s = star_s + 1;
            backtrack = Some((star_p, star_s + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

fn parse_size(raw: &str) -> CoreResult<u64> {
    let raw = raw.trim().to_ascii_uppercase();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| CoreError::validation(format!("invalid size `{raw}`")))?;
    let multiplier = match unit.trim() {
        "" | "B" => 1,
        "KB" | "K" => 1 << 10,
        "MB" | "M" => 1 << 20,
        "GB" | "G" => 1 << 30,
        "TB" | "T" => 1 << 40,
        other => {
            return Err(CoreError::validation(format!(
                "unknown size unit `{other}`"
            )))
        }
    };
    Ok(value.saturating_mul(multiplier))
}
