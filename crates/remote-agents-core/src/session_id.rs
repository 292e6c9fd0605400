//! Remote session identity.

use std::{fmt, str::FromStr};

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Length of the canonical hyphenated UUID form (8-4-4-4-12).
const CANONICAL_LEN: usize = 36;

/// Identifier of a remote agent session.
///
/// Only the canonical hyphenated UUID form is accepted. The original text is
/// kept as-is (including letter case) so it is echoed back to the remote
/// service exactly as it was issued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Validate a raw session id.
    ///
    /// Returns `None` for empty strings and anything that is not a canonical
    /// UUID, including the braced, URN and unhyphenated spellings.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        is_canonical_uuid(raw).then(|| Self(raw.to_owned()))
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_canonical_uuid(raw: &str) -> bool {
    raw.len() == CANONICAL_LEN && Uuid::try_parse(raw).is_ok()
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Rejected session id.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid session id: {0:?}")]
pub struct InvalidSessionId(pub String);

impl FromStr for SessionId {
    type Err = InvalidSessionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| InvalidSessionId(s.to_owned()))
    }
}
