//! Validated branch names.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

use crate::{Error, Result};

/// Longest branch name accepted at admission.
pub const MAX_BRANCH_NAME_LEN: usize = 100;

static BRANCH_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-_/.]+$").expect("valid regex"));

/// Zero-width and non-breaking characters that chat clients tend to paste
/// along with a branch name.
const INVISIBLE: &[char] = &['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}', '\u{00A0}'];

/// A branch identifier that passed the admission format rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchName(String);

impl BranchName {
    /// Parse a raw branch name, stripping invisible characters first.
    pub fn parse(raw: &str) -> Result<Self> {
        let cleaned: String = raw.chars().filter(|c| !INVISIBLE.contains(c)).collect();
        let cleaned = cleaned.trim();

        if cleaned.is_empty() {
            return Err(Error::InvalidInput("branch name is empty".to_string()));
        }
        if cleaned.chars().count() > MAX_BRANCH_NAME_LEN {
            return Err(Error::InvalidInput(format!(
                "branch name too long: {} (max {} characters)",
                cleaned, MAX_BRANCH_NAME_LEN
            )));
        }
        if cleaned.starts_with('-') {
            return Err(Error::InvalidInput(format!(
                "branch name must not start with '-': {}",
                cleaned
            )));
        }
        if !BRANCH_PATTERN.is_match(cleaned) {
            return Err(Error::InvalidInput(format!(
                "branch name contains illegal characters: {}",
                cleaned
            )));
        }

        Ok(Self(cleaned.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BranchName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for BranchName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for BranchName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl TryFrom<String> for BranchName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<BranchName> for String {
    fn from(name: BranchName) -> Self {
        name.0
    }
}

impl std::str::FromStr for BranchName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
