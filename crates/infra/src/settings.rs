//! Job subsystem settings, read from the environment.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DISPATCH_ADDRESS_VAR: &str = "ENTITLE_JOBS_DISPATCH_ADDRESS";
pub const CONFLICT_POLICY_VAR: &str = "ENTITLE_JOBS_CONFLICT_POLICY";
pub const NODE_NAME_VAR: &str = "ENTITLE_NODE_NAME";
pub const WORKER_POLL_MS_VAR: &str = "ENTITLE_JOBS_WORKER_POLL_MS";

const DEFAULT_NODE_NAME: &str = "local";
const DEFAULT_WORKER_POLL_MS: u64 = 250;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required setting {0} is not set")]
    Missing(&'static str),

    #[error("setting {name} has invalid value \"{value}\": {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// What admission does with a job whose constraints report conflicts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Refuse the job: it ends `ABORTED`.
    #[default]
    Abort,
    /// Park the job in `WAITING` until the conflicting jobs finish.
    Defer,
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "defer" => Ok(Self::Defer),
            other => Err(format!("expected \"abort\" or \"defer\", got \"{other}\"")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    pub dispatch_address: String,
    pub conflict_policy: ConflictPolicy,
    pub node_name: String,
    pub worker_poll_interval: Duration,
}

impl JobSettings {
    pub fn new(dispatch_address: impl Into<String>) -> Self {
        Self {
            dispatch_address: dispatch_address.into(),
            conflict_policy: ConflictPolicy::default(),
            node_name: DEFAULT_NODE_NAME.to_string(),
            worker_poll_interval: Duration::from_millis(DEFAULT_WORKER_POLL_MS),
        }
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    pub fn with_worker_poll_interval(mut self, interval: Duration) -> Self {
        self.worker_poll_interval = interval;
        self
    }

    /// Load settings from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let address = lookup(DISPATCH_ADDRESS_VAR)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing(DISPATCH_ADDRESS_VAR))?;

        let mut settings = Self::new(address);

        if let Some(raw) = lookup(CONFLICT_POLICY_VAR) {
            settings.conflict_policy = raw.parse().map_err(|reason| ConfigError::Invalid {
                name: CONFLICT_POLICY_VAR,
                value: raw.clone(),
                reason,
            })?;
        }

        if let Some(name) = lookup(NODE_NAME_VAR).filter(|v| !v.trim().is_empty()) {
            settings.node_name = name;
        }

        if let Some(raw) = lookup(WORKER_POLL_MS_VAR) {
            let millis: u64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::Invalid {
                    name: WORKER_POLL_MS_VAR,
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?;
            if millis == 0 {
                return Err(ConfigError::Invalid {
                    name: WORKER_POLL_MS_VAR,
                    value: raw,
                    reason: "must be greater than zero".to_string(),
                });
            }
            settings.worker_poll_interval = Duration::from_millis(millis);
        }

        Ok(settings)
    }
}
