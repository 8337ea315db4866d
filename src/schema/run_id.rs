//! Run identifiers.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use rand::Rng;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Literal prefix of every run id.
pub const RUN_ID_PREFIX: &str = "run_";

/// Number of lowercase hex characters after the prefix.
pub const RUN_ID_HEX_LEN: usize = 12;

fn run_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^run_[0-9a-f]{12}$").expect("run_id pattern is a valid regex")
    })
}

/// A validated run identifier: `run_` + exactly 12 lowercase hex characters.
///
/// Run ids become filenames, so this is the only way a caller-supplied id
/// reaches the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Validate a caller-supplied id.
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        if run_id_pattern().is_match(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(ValidationError::InvalidRunId {
                value: value.to_string(),
            })
        }
    }

    /// Generate a fresh random id.
    pub fn generate() -> Self {
        let bytes: [u8; RUN_ID_HEX_LEN / 2] = rand::thread_rng().gen();
        Self(format!("{}{}", RUN_ID_PREFIX, hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for RunId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RunId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let id = RunId::parse("run_abc123def456").unwrap();
        assert_eq!(id.as_str(), "run_abc123def456");
    }

    #[test]
    fn test_parse_rejects_bad_ids() {
        for bad in [
            "",
            "run_",
            "run_abc123def45",
            "run_abc123def4567",
            "run_ABC123DEF456",
            "RUN_abc123def456",
            "run-abc123def456",
            "run_abc123def45g",
            "../run_abc123def456",
            "run_abc123def456/../x",
            "run_abc123def456\n",
        ] {
            assert!(
                matches!(RunId::parse(bad), Err(ValidationError::InvalidRunId { .. })),
                "should reject {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_generate_matches_pattern() {
        for _ in 0..100 {
            let id = RunId::generate();
            assert!(RunId::parse(id.as_str()).is_ok(), "generated {}", id);
        }
    }

    #[test]
    fn test_serde_validates() {
        let ok: RunId = serde_json::from_str("\"run_000000000000\"").unwrap();
        assert_eq!(ok.to_string(), "run_000000000000");
        assert!(serde_json::from_str::<RunId>("\"run_../../etc\"").is_err());
    }
}
