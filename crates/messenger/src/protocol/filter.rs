//! Broadcast recipient filters.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name pattern selecting the recipients of a broadcast.
///
/// Serialized as `{ source, flags }` so any peer can rebuild the pattern.
/// The flags `i`, `m` and `s` toggle case-insensitive, multi-line and
/// dot-matches-newline matching; `u`, `g` and `y` are accepted and have no
/// effect on a single name test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastFilter {
    /// Pattern source.
    pub source: String,
    /// Pattern flags.
    pub flags: String,
}

impl BroadcastFilter {
    /// Match peer names against `source` with no flags.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            flags: String::new(),
        }
    }

    /// Match every peer.
    #[must_use]
    pub fn all() -> Self {
        Self::new(".*")
    }

    /// Replace the flags.
    #[must_use]
    pub fn with_flags(mut self, flags: impl Into<String>) -> Self {
        self.flags = flags.into();
        self
    }

    /// Build the pattern.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFilter` for an unknown flag or a pattern the regex
    /// engine rejects.
    pub fn compile(&self) -> Result<Regex> {
        let mut builder = RegexBuilder::new(&self.source);

        for flag in self.flags.chars() {
            match flag {
                'i' => {
                    builder.case_insensitive(true);
                }
                'm' => {
                    builder.multi_line(true);
                }
                's' => {
                    builder.dot_matches_new_line(true);
                }
                'u' | 'g' | 'y' => {}
                other => {
                    return Err(Error::InvalidFilter(format!(
                        "unsupported flag '{other}' in /{}/{}",
                        self.source, self.flags
                    )));
                }
            }
        }

        builder
            .build()
            .map_err(|e| Error::InvalidFilter(e.to_string()))
    }
}

impl Default for BroadcastFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl From<&str> for BroadcastFilter {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_prefix_filter() {
        let pattern = BroadcastFilter::new("^content").compile().unwrap();

        assert!(pattern.is_match("content:6f1c"));
        assert!(!pattern.is_match("action:6f1c"));
        assert!(!pattern.is_match("Content:6f1c"));
    }

    #[test]
    fn test_case_insensitive_flag() {
        let pattern = BroadcastFilter::new("^content")
            .with_flags("gi")
            .compile()
            .unwrap();

        assert!(pattern.is_match("Content:6f1c"));
    }

    #[test]
    fn test_default_matches_everything() {
        let pattern = BroadcastFilter::default().compile().unwrap();

        assert!(pattern.is_match("bg"));
        assert!(pattern.is_match(""));
    }

    #[test]
    fn test_invalid_filters() {
        assert!(matches!(
            BroadcastFilter::new(".*").with_flags("x").compile(),
            Err(Error::InvalidFilter(_))
        ));
        assert!(matches!(
            BroadcastFilter::new("(").compile(),
            Err(Error::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_wire_shape() {
        let filter = BroadcastFilter::new("^content").with_flags("i");

        assert_eq!(
            serde_json::to_value(&filter).unwrap(),
            json!({"source": "^content", "flags": "i"})
        );
    }
}
