//! Limit classes: the policy buckets an identity is rate limited under.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::limiter::LimiterError;

/// The class of identity a request is rate limited as.
///
/// Classes never share counters or block state, even when two identity
/// strings are byte-for-byte equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitClass {
    /// Caller IP address
    Ip,
    /// API token
    Token,
}

impl LimitClass {
    /// Wire name used in store keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitClass::Ip => "ip",
            LimitClass::Token => "token",
        }
    }
}

impl fmt::Display for LimitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimitClass {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip" => Ok(LimitClass::Ip),
            "token" => Ok(LimitClass::Token),
            other => Err(LimiterError::InvalidClass(other.to_string())),
        }
    }
}
