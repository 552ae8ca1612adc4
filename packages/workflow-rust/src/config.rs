//! Service configuration.
//!
//! [`WorkflowArgs`] is the command-line / environment surface; it is turned
//! into an immutable [`WorkflowConfig`] once at startup and shared as `Arc`.

use std::fmt;
use std::time::Duration;

use clap::Parser;

use crate::logging::LogFormat;

/// Errors produced while validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("queue name must not be empty")]
    EmptyQueueName,
    #[error("queue endpoint must not be empty")]
    EmptyEndpoint,
    #[error("max concurrent calls must be at least 1")]
    ZeroConcurrency,
    #[error("partition key length must be at least 1")]
    ZeroPartitionKeyLength,
    #[error("processing timeout must be greater than zero")]
    ZeroProcessingTimeout,
}

/// Connection settings for the inbound queue.
#[derive(Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Broker endpoint, e.g. `sb://contoso.servicebus.windows.net/`.
    pub endpoint: String,
    pub access_policy_name: String,
    pub access_policy_key: String,
    pub queue_name: String,
}

impl QueueConfig {
    /// Renders the broker connection string.
    #[must_use]
    pub fn connection_string(&self) -> String {
        format!(
            "Endpoint={};SharedAccessKeyName={};SharedAccessKey={}",
            self.endpoint, self.access_policy_name, self.access_policy_key
        )
    }

    /// Host part of the endpoint, used as the fully-qualified namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        let rest = self
            .endpoint
            .split_once("://")
            .map_or(self.endpoint.as_str(), |(_, rest)| rest);
        rest.split('/').next().unwrap_or(rest)
    }
}

// The access key never appears in logs.
impl fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConfig")
            .field("endpoint", &self.endpoint)
            .field("access_policy_name", &self.access_policy_name)
            .field("access_policy_key", &"<redacted>")
            .field("queue_name", &self.queue_name)
            .finish()
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            endpoint: "sb://localhost/".to_string(),
            access_policy_name: String::new(),
            access_policy_key: String::new(),
            queue_name: "deliveryrequests".to_string(),
        }
    }
}

/// Immutable configuration of the workflow service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowConfig {
    pub queue: QueueConfig,
    /// Upper bound on concurrently dispatched messages, enforced by the broker client.
    pub max_concurrent_calls: usize,
    /// Deadline for a single processor invocation.
    pub processing_timeout: Duration,
    /// How long `stop` waits for in-flight dispatches before closing.
    pub drain_timeout: Duration,
    /// Number of leading delivery-id characters used as the partition key.
    pub partition_key_len: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            max_concurrent_calls: 16,
            processing_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
            partition_key_len: 5,
        }
    }
}

impl WorkflowConfig {
    /// Checks the invariants the consumer relies on.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.queue_name.trim().is_empty() {
            return Err(ConfigError::EmptyQueueName);
        }
        if self.queue.endpoint.trim().is_empty() {
            return Err(ConfigError::EmptyEndpoint);
        }
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.partition_key_len == 0 {
            return Err(ConfigError::ZeroPartitionKeyLength);
        }
        if self.processing_timeout.is_zero() {
            return Err(ConfigError::ZeroProcessingTimeout);
        }
        Ok(())
    }
}

/// Command-line arguments of the `workflow-service` binary.
#[derive(Parser, Debug)]
#[command(name = "workflow-service", about = "Drone delivery request workflow consumer")]
pub struct WorkflowArgs {
    /// Broker endpoint.
    #[arg(long, env = "QUEUE_ENDPOINT", default_value = "sb://localhost/")]
    pub queue_endpoint: String,

    /// Shared access policy name.
    #[arg(long, env = "QUEUE_ACCESS_POLICY_NAME", default_value = "")]
    pub queue_access_policy_name: String,

    /// Shared access policy key.
    #[arg(
        long,
        env = "QUEUE_ACCESS_POLICY_KEY",
        default_value = "",
        hide_env_values = true
    )]
    pub queue_access_policy_key: String,

    /// Name of the queue carrying delivery requests.
    #[arg(long, env = "QUEUE_NAME")]
    pub queue_name: String,

    #[arg(long, env = "MAX_CONCURRENT_CALLS", default_value_t = 16)]
    pub max_concurrent_calls: usize,

    #[arg(long, env = "PROCESSING_TIMEOUT_MS", default_value_t = 30_000)]
    pub processing_timeout_ms: u64,

    #[arg(long, env = "DRAIN_TIMEOUT_MS", default_value_t = 30_000)]
    pub drain_timeout_ms: u64,

    #[arg(long, env = "PARTITION_KEY_LENGTH", default_value_t = 5)]
    pub partition_key_length: usize,

    /// Drone identifiers of the local fleet, comma separated.
    #[arg(
        long,
        env = "DRONE_FLEET",
        value_delimiter = ',',
        default_value = "drone-1,drone-2,drone-3"
    )]
    pub drone_fleet: Vec<String>,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl WorkflowArgs {
    /// Builds and validates the service configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the resulting configuration is invalid.
    pub fn to_config(&self) -> Result<WorkflowConfig, ConfigError> {
        let config = WorkflowConfig {
            queue: QueueConfig {
                endpoint: self.queue_endpoint.clone(),
                access_policy_name: self.queue_access_policy_name.clone(),
                access_policy_key: self.queue_access_policy_key.clone(),
                queue_name: self.queue_name.clone(),
            },
            max_concurrent_calls: self.max_concurrent_calls,
            processing_timeout: Duration::from_millis(self.processing_timeout_ms),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            partition_key_len: self.partition_key_length,
        };
        config.validate()?;
        Ok(config)
    }
}
