//! Throttling policies and the per-route-class catalog.
//!
//! Policies are plain values chosen once per route class. The catalog ships
//! compiled-in presets which configuration may override field by field.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::info;

use crate::error::{Result, TurnstileError};

/// Default ceiling on the penalty level: the longest block is `base * 2^7`.
pub const DEFAULT_MAX_PENALTY_LEVEL: u32 = 8;

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;

/// An immutable throttling configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Length of one counting window
    pub window_duration_ms: u64,
    /// Attempts allowed within one window
    pub max_attempts: u32,
    /// Whether repeated violations escalate into blocks
    pub progressive_penalty: bool,
    /// Block length at penalty level one
    pub base_block_duration_ms: u64,
    /// Level at which the penalty stops growing
    #[serde(default = "default_max_penalty_level")]
    pub max_penalty_level: u32,
}

fn default_max_penalty_level() -> u32 {
    DEFAULT_MAX_PENALTY_LEVEL
}

impl Policy {
    /// Form submissions: a handful per hour, escalating blocks.
    pub const CONTACT_SUBMISSION: Policy = Policy {
        window_duration_ms: HOUR_MS,
        max_attempts: 5,
        progressive_penalty: true,
        base_block_duration_ms: 5 * MINUTE_MS,
        max_penalty_level: DEFAULT_MAX_PENALTY_LEVEL,
    };

    /// Read endpoints: generous ceiling, no penalties.
    pub const READ_API: Policy = Policy {
        window_duration_ms: 15 * MINUTE_MS,
        max_attempts: 100,
        progressive_penalty: false,
        base_block_duration_ms: 0,
        max_penalty_level: DEFAULT_MAX_PENALTY_LEVEL,
    };

    /// Uploads: moderate ceiling, escalating blocks.
    pub const UPLOAD: Policy = Policy {
        window_duration_ms: 10 * MINUTE_MS,
        max_attempts: 10,
        progressive_penalty: true,
        base_block_duration_ms: 2 * MINUTE_MS,
        max_penalty_level: DEFAULT_MAX_PENALTY_LEVEL,
    };

    /// Telemetry ingestion: frequent small posts, no penalties.
    pub const TELEMETRY: Policy = Policy {
        window_duration_ms: MINUTE_MS,
        max_attempts: 60,
        progressive_penalty: false,
        base_block_duration_ms: 0,
        max_penalty_level: DEFAULT_MAX_PENALTY_LEVEL,
    };

    /// Block length for a penalty level: `base * 2^(level - 1)`, saturating.
    ///
    /// Level zero means no block.
    pub fn block_duration_ms(&self, penalty_level: u32) -> u64 {
        block_duration_ms(self.base_block_duration_ms, penalty_level)
    }

    /// Check that the policy can be enforced.
    pub fn validate(&self) -> Result<()> {
        if self.window_duration_ms == 0 {
            return Err(TurnstileError::InvalidPolicy(
                "window_duration_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(TurnstileError::InvalidPolicy(
                "max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.max_penalty_level == 0 {
            return Err(TurnstileError::InvalidPolicy(
                "max_penalty_level must be at least 1".to_string(),
            ));
        }
        if self.progressive_penalty && self.base_block_duration_ms == 0 {
            return Err(TurnstileError::InvalidPolicy(
                "base_block_duration_ms must be greater than zero when progressive_penalty is enabled"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Exponential backoff used both at violation time and by the sweep.
pub(crate) fn block_duration_ms(base_ms: u64, penalty_level: u32) -> u64 {
    if penalty_level == 0 {
        return 0;
    }
    let factor = 1u64.checked_shl(penalty_level - 1).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor)
}

/// Classes of routes that share a policy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum RouteClass {
    /// Contact form and similar public writes
    ContactSubmission,
    /// Content listing
    ReadApi,
    /// File or media uploads
    Upload,
    /// Client telemetry ingestion
    Telemetry,
}

impl RouteClass {
    /// Every route class.
    pub const ALL: [RouteClass; 4] = [
        RouteClass::ContactSubmission,
        RouteClass::ReadApi,
        RouteClass::Upload,
        RouteClass::Telemetry,
    ];

    /// The compiled-in policy for this class.
    pub fn preset(self) -> Policy {
        match self {
            RouteClass::ContactSubmission => Policy::CONTACT_SUBMISSION,
            RouteClass::ReadApi => Policy::READ_API,
            RouteClass::Upload => Policy::UPLOAD,
            RouteClass::Telemetry => Policy::TELEMETRY,
        }
    }

    /// Stable name used in keys and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            RouteClass::ContactSubmission => "contact-submission",
            RouteClass::ReadApi => "read-api",
            RouteClass::Upload => "upload",
            RouteClass::Telemetry => "telemetry",
        }
    }
}

impl std::fmt::Display for RouteClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field-by-field replacement for a preset policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    #[serde(default)]
    pub window_duration_ms: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub progressive_penalty: Option<bool>,
    #[serde(default)]
    pub base_block_duration_ms: Option<u64>,
    #[serde(default)]
    pub max_penalty_level: Option<u32>,
}

impl PolicyOverride {
    /// Apply the override on top of `base`.
    pub fn apply(&self, base: Policy) -> Policy {
        Policy {
            window_duration_ms: self.window_duration_ms.unwrap_or(base.window_duration_ms),
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            progressive_penalty: self.progressive_penalty.unwrap_or(base.progressive_penalty),
            base_block_duration_ms: self
                .base_block_duration_ms
                .unwrap_or(base.base_block_duration_ms),
            max_penalty_level: self.max_penalty_level.unwrap_or(base.max_penalty_level),
        }
    }
}

/// The policy in force for each route class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyCatalog {
    policies: BTreeMap<RouteClass, Policy>,
}

impl PolicyCatalog {
    /// Catalog of compiled-in presets.
    pub fn new() -> Self {
        Self {
            policies: RouteClass::ALL.iter().map(|r| (*r, r.preset())).collect(),
        }
    }

    /// Presets with configured overrides applied and validated.
    pub fn with_overrides(overrides: &HashMap<RouteClass, PolicyOverride>) -> Result<Self> {
        let mut catalog = Self::new();
        for (route, patch) in overrides {
            let policy = patch.apply(route.preset());
            policy.validate().map_err(|e| match e {
                TurnstileError::InvalidPolicy(msg) => {
                    TurnstileError::InvalidPolicy(format!("{}: {}", route, msg))
                }
                other => other,
            })?;
            info!(route = %route, policy = ?policy, "Applied policy override");
            catalog.policies.insert(*route, policy);
        }
        Ok(catalog)
    }

    /// The policy for a route class.
    pub fn get(&self, route: RouteClass) -> Policy {
        self.policies
            .get(&route)
            .copied()
            .unwrap_or_else(|| route.preset())
    }

    /// Iterate over every route class and its policy.
    pub fn iter(&self) -> impl Iterator<Item = (RouteClass, Policy)> + '_ {
        self.policies.iter().map(|(r, p)| (*r, *p))
    }
}

impl Default for PolicyCatalog {
    fn default() -> Self {
        Self::new()
    }
}
