//! Telemetry configuration from environment variables.

use std::env;

/// Configuration for log output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name attached to every event
    pub service_name: String,

    /// Node address, attached to every event when set
    pub node_address: Option<String>,

    /// Log level filter (trace, debug, info, warn, error, or a directive list)
    pub log_level: String,

    /// Whether to enable console output
    pub console_output: bool,

    /// Whether to enable JSON formatted logs
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "xa-link".to_string(),
            node_address: None,
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `XA_SERVICE_NAME`: Service name (default: xa-link)
    /// - `XA_LOCAL_ADDRESS`: Node address (default: unset)
    /// - `XA_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `XA_CONSOLE_OUTPUT`: Enable console output (default: true)
    /// - `XA_JSON_LOGS`: Enable JSON logs (default: false, true in containers)
    pub fn from_env() -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();

        Self {
            service_name: env::var("XA_SERVICE_NAME").unwrap_or_else(|_| "xa-link".to_string()),

            node_address: env::var("XA_LOCAL_ADDRESS").ok(),

            log_level: env::var("XA_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),

            console_output: env::var("XA_CONSOLE_OUTPUT")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(true),

            json_logs: env::var("XA_JSON_LOGS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(is_container),
        }
    }

    /// Configuration for one node, with its address in every event.
    pub fn for_node(address: &str) -> Self {
        Self {
            node_address: Some(address.to_string()),
            ..Self::from_env()
        }
    }

    /// Filter directive, quieting dependencies below the chosen level.
    pub fn filter_directive(&self) -> String {
        if self.log_level.contains('=') || self.log_level.contains(',') {
            self.log_level.clone()
        } else {
            format!("warn,xa_link={0},xa_telemetry={0}", self.log_level)
        }
    }
}
