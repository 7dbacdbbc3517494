//! Per-class rate limit policies.
//!
//! Each limit class carries a static threshold and block duration. Policies
//! are supplied once at construction and never change afterwards.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::class::LimitClass;
use crate::error::{RatewallError, Result};

/// Length of a counting window. Fixed, not configurable.
pub const WINDOW: Duration = Duration::from_secs(1);

/// Threshold and block duration for one limit class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassPolicy {
    /// Requests admitted per window before a block is imposed
    pub requests_per_second: u32,
    /// How long a block lasts once imposed
    pub block_duration_secs: u64,
}

impl ClassPolicy {
    /// Create a new policy.
    pub fn new(requests_per_second: u32, block_duration_secs: u64) -> Self {
        Self {
            requests_per_second,
            block_duration_secs,
        }
    }

    /// The block duration as a `Duration`.
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }

    fn validate(&self, class: LimitClass) -> Result<()> {
        if self.requests_per_second == 0 {
            return Err(RatewallError::Config(format!(
                "{class} requests_per_second must be at least 1"
            )));
        }
        if self.block_duration_secs == 0 {
            return Err(RatewallError::Config(format!(
                "{class} block_duration_secs must be at least 1"
            )));
        }
        Ok(())
    }
}

/// Policies for every limit class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitPolicies {
    /// Policy applied to IP identities
    #[serde(default = "default_ip_policy")]
    pub ip: ClassPolicy,

    /// Policy applied to token identities
    #[serde(default = "default_token_policy")]
    pub token: ClassPolicy,
}

impl Default for LimitPolicies {
    fn default() -> Self {
        Self {
            ip: default_ip_policy(),
            token: default_token_policy(),
        }
    }
}

fn default_ip_policy() -> ClassPolicy {
    ClassPolicy::new(10, 300)
}

fn default_token_policy() -> ClassPolicy {
    ClassPolicy::new(100, 600)
}

impl LimitPolicies {
    /// Look up the policy for a class.
    pub fn policy_for(&self, class: LimitClass) -> &ClassPolicy {
        match class {
            LimitClass::Ip => &self.ip,
            LimitClass::Token => &self.token,
        }
    }

    /// Check that every threshold and block duration is at least 1.
    pub fn validate(&self) -> Result<()> {
        self.ip.validate(LimitClass::Ip)?;
        self.token.validate(LimitClass::Token)
    }
}
