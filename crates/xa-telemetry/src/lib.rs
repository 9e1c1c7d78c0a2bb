//! # xa-link Telemetry
//!
//! Structured logging for xa-link nodes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use xa_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env();
//! let _guard = init_telemetry(&config)?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `XA_SERVICE_NAME` | `xa-link` | Service name attached to every event |
//! | `XA_LOG_LEVEL` / `RUST_LOG` | `info` | Log level filter |
//! | `XA_JSON_LOGS` | `false` | JSON formatted output |
//! | `XA_CONSOLE_OUTPUT` | `true` | Write events to stdout |

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use tracing_setup::{init_tracing, TracingGuard};

#[doc(hidden)]
pub use tracing as __tracing;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The filter directive could not be parsed.
    #[error("Invalid log filter: {0}")]
    Filter(String),

    /// A global subscriber is already installed.
    #[error("Failed to install subscriber: {0}")]
    SubscriberInit(String),

    /// Configuration is unusable.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Install the global subscriber described by `config`.
///
/// Returns a guard to hold for the lifetime of the process.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TracingGuard, TelemetryError> {
    if config.service_name.is_empty() {
        return Err(TelemetryError::Config("service name must not be empty".into()));
    }
    init_tracing(config)
}

/// Span carrying the transaction id, for wrapping work done on its behalf.
///
/// # Example
///
/// ```rust,ignore
/// use xa_telemetry::transaction_span;
///
/// let _span = transaction_span!("commit", tid = %tid).entered();
/// ```
#[macro_export]
macro_rules! transaction_span {
    ($name:expr, $($field:tt)*) => {
        $crate::__tracing::info_span!($name, $($field)*)
    };
}
