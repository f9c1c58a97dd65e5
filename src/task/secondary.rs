//! Secondary File Propagation
//!
//! Derives companion file paths (indexes, dictionaries) from a primary
//! file path. Two pattern kinds are supported:
//!
//! - **append**: `.bai` applied to `sample.bam` yields `sample.bam.bai`
//! - **strip-then-append**: `^.dict` applied to `ref.fasta` yields
//!   `ref.dict`; each leading `^` strips one more dot-extension

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Error raised when a secondary-file pattern string is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid secondary-file pattern '{0}': expected an extension like '.bai' or '^.dict'")]
pub struct InvalidPattern(pub String);

/// A suffix-transform rule deriving one secondary path from a primary path.
///
/// Parsed from strings of the form `[^...]<extension>`, where each leading
/// caret strips one dot-delimited extension before the extension is
/// appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryPattern {
    /// Number of extensions to strip before appending
    strip: usize,
    /// Extension to append, including its leading dot
    ext: String,
}

impl SecondaryPattern {
    /// Parses a pattern string such as `.bai`, `^.dict`, or `^^.ext`.
    pub fn parse(pattern: &str) -> Result<Self, InvalidPattern> {
        let strip = pattern.chars().take_while(|c| *c == '^').count();
        let ext = &pattern[strip..];

        if ext.is_empty() || !ext.starts_with('.') {
            return Err(InvalidPattern(pattern.to_string()));
        }

        Ok(Self {
            strip,
            ext: ext.to_string(),
        })
    }

    /// Applies this pattern to a primary path.
    ///
    /// Stripping only touches the final path component: `data/ref.fasta`
    /// with `^.dict` yields `data/ref.dict`. Stripping stops once the
    /// file name has no extension left.
    pub fn apply(&self, primary: &str) -> String {
        let (dir, name) = match primary.rfind('/') {
            Some(idx) => primary.split_at(idx + 1),
            None => ("", primary),
        };

        let mut name = name.to_string();
        for _ in 0..self.strip {
            match name.rfind('.') {
                Some(idx) => name.truncate(idx),
                None => break,
            }
        }

        format!("{}{}{}", dir, name, self.ext)
    }
}

impl std::fmt::Display for SecondaryPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", "^".repeat(self.strip), self.ext)
    }
}

/// Computes all secondary paths for a primary path, preserving pattern
/// order.
pub fn attach(primary: &str, patterns: &[SecondaryPattern]) -> Vec<String> {
    patterns.iter().map(|p| p.apply(primary)).collect()
}

impl Serialize for SecondaryPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SecondaryPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(de::Error::custom)
    }
}
