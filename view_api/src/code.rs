use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

static CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z0-9]{3,8}$").unwrap());

/// A validated room code: 3 to 8 characters of `[A-Z0-9]`.
///
/// The only ways to obtain one are [`normalize`] and the equivalent
/// `FromStr`/`TryFrom`/`Deserialize` impls, which all run the same check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("room code must be 3-8 characters of A-Z or 0-9")]
pub struct CodeError;

/// Trim and upper-case untrusted input, accepting it only if it forms a valid code.
pub fn normalize(raw: &str) -> Result<RoomCode, CodeError> {
    let code = raw.trim().to_uppercase();
    if CODE_RE.is_match(&code) {
        Ok(RoomCode(code))
    } else {
        Err(CodeError)
    }
}

impl RoomCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoomCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for RoomCode {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        normalize(s)
    }
}

impl TryFrom<String> for RoomCode {
    type Error = CodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        normalize(&value)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}
