//! # Transaction Configuration
//!
//! Timeouts and addressing for one node taking part in RPC-propagated
//! transactions.

use crate::domain::{XaError, DEFAULT_TIMEOUT_GRACE_MS, DEFAULT_TRANSACTION_TIMEOUT_MS};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Node transaction configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XaConfig {
    /// Address peers use to reach this node.
    pub local_address: String,

    /// Global transaction timeout when the definition gives none.
    pub default_timeout_ms: u64,

    /// Grace added to the manager's timeout for the propagated deadline.
    pub timeout_grace_ms: u64,

    /// Deadline for any single enlistment RPC.
    pub call_deadline_ms: u64,

    /// Deadline for one branch's prepare.
    pub prepare_timeout_ms: u64,

    /// Deadline for one branch's commit or rollback.
    pub completion_timeout_ms: u64,

    /// Deliver buffered messages asynchronously unless the caller says otherwise.
    pub async_send_default: bool,

    /// Completed transactions and branches remembered for late or repeated
    /// phase-2 calls and status queries.
    pub completed_history: usize,
}

impl Default for XaConfig {
    fn default() -> Self {
        Self {
            local_address: "127.0.0.1:20880".to_string(),
            default_timeout_ms: DEFAULT_TRANSACTION_TIMEOUT_MS,
            timeout_grace_ms: DEFAULT_TIMEOUT_GRACE_MS,
            call_deadline_ms: 3_000,
            prepare_timeout_ms: 5_000,
            completion_timeout_ms: 5_000,
            async_send_default: false,
            completed_history: 1_024,
        }
    }
}

impl XaConfig {
    /// Create a config for testing (short deadlines).
    pub fn for_testing(local_address: impl Into<String>) -> Self {
        Self {
            local_address: local_address.into(),
            default_timeout_ms: 2_000,
            timeout_grace_ms: 500,
            call_deadline_ms: 200,
            prepare_timeout_ms: 200,
            completion_timeout_ms: 200,
            async_send_default: false,
            completed_history: 16,
        }
    }

    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            local_address: env::var("XA_LOCAL_ADDRESS").unwrap_or(defaults.local_address),
            default_timeout_ms: env_millis("XA_DEFAULT_TIMEOUT_MS", defaults.default_timeout_ms),
            timeout_grace_ms: env_millis("XA_TIMEOUT_GRACE_MS", defaults.timeout_grace_ms),
            call_deadline_ms: env_millis("XA_CALL_DEADLINE_MS", defaults.call_deadline_ms),
            prepare_timeout_ms: env_millis("XA_PREPARE_TIMEOUT_MS", defaults.prepare_timeout_ms),
            completion_timeout_ms: env_millis(
                "XA_COMPLETION_TIMEOUT_MS",
                defaults.completion_timeout_ms,
            ),
            async_send_default: env::var("XA_ASYNC_SEND")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(defaults.async_send_default),
            completed_history: env::var("XA_COMPLETED_HISTORY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.completed_history),
        }
    }

    /// Reject unusable values.
    pub fn validate(&self) -> Result<(), XaError> {
        if self.local_address.trim().is_empty() {
            return Err(XaError::Config("local_address must not be empty".into()));
        }
        let timeouts = [
            ("default_timeout_ms", self.default_timeout_ms),
            ("call_deadline_ms", self.call_deadline_ms),
            ("prepare_timeout_ms", self.prepare_timeout_ms),
            ("completion_timeout_ms", self.completion_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(XaError::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    /// Default transaction timeout.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Enlistment RPC deadline.
    pub fn call_deadline(&self) -> Duration {
        Duration::from_millis(self.call_deadline_ms)
    }

    /// Per-branch prepare deadline.
    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    /// Per-branch commit/rollback deadline.
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}

fn env_millis(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
