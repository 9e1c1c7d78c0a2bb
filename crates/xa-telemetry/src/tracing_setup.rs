//! Subscriber setup.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and either a
//! plain or a JSON `fmt` layer.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::{TelemetryConfig, TelemetryError};

/// Guard returned by `init_tracing`. Logs shutdown on drop.
#[derive(Debug)]
pub struct TracingGuard {
    service_name: String,
}

impl TracingGuard {
    /// Service the subscriber was installed for.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        tracing::info!(service = %self.service_name, "Shutting down telemetry");
    }
}

/// Install the global subscriber.
///
/// Fails instead of panicking when a subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<TracingGuard, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter_directive()))
        .map_err(|e| TelemetryError::Filter(e.to_string()))?;

    let output = if !config.console_output {
        None
    } else if config.json_logs {
        Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .boxed(),
        )
    } else {
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .boxed(),
        )
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(output)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        node = config.node_address.as_deref().unwrap_or("-"),
        json = config.json_logs,
        "Telemetry initialized"
    );
    Ok(TracingGuard {
        service_name: config.service_name.clone(),
    })
}
