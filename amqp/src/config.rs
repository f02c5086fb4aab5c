//! Connection configuration.
//!
//! [`ConnectionOptions`] is plain data: it can be built in code, parsed from a
//! connection string, or loaded from an optional TOML file with environment
//! overrides (`AMQP_OPERATION_TIMEOUT_SECS=30`,
//! `AMQP_CONNECTION_PROPERTIES__USER_AGENT=...`).

use crate::auth::{AuthorizationType, ConnectionStringProperties};
use crate::common::{AmqpError, AmqpResult};
use crate::transport::ConnectionParameters;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Default AMQP over TLS port
pub const AMQPS_PORT: u16 = 5671;

/// Default port for AMQP over WebSockets
pub const WEBSOCKETS_PORT: u16 = 443;

pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 60;

/// Maximum reasonable timeout for operations (10 minutes)
pub const MAX_OPERATION_TIMEOUT_SECS: u64 = 600;

pub const DEFAULT_MAX_FRAME_SIZE: u32 = 65_536;

/// Smallest frame size allowed by the AMQP 1.0 specification
pub const MIN_MAX_FRAME_SIZE: u32 = 512;

pub const DEFAULT_TOKEN_VALIDITY_SECS: u64 = 3_600;

/// Prefix used for environment overrides
pub const ENV_PREFIX: &str = "AMQP";

/// How bytes reach the broker.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    #[default]
    Amqp,
    AmqpWebSockets,
}

impl TransportType {
    pub fn default_port(&self) -> u16 {
        match self {
            TransportType::Amqp => AMQPS_PORT,
            TransportType::AmqpWebSockets => WEBSOCKETS_PORT,
        }
    }
}

/// Configuration validation failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigValidationError {
    #[error("fully_qualified_namespace must not be empty")]
    MissingNamespace,

    #[error("operation_timeout_secs ({configured}) must be between 1 and {limit}")]
    OperationTimeout { configured: u64, limit: u64 },

    #[error("max_frame_size ({configured}) must be at least {minimum}")]
    MaxFrameSize { configured: u32, minimum: u32 },

    #[error("token_validity_secs must be greater than zero")]
    TokenValidity,
}

/// Options consumed by [`AmqpConnection`](crate::connection_manager::AmqpConnection).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionOptions {
    fully_qualified_namespace: String,
    entity_path: Option<String>,
    port: Option<u16>,
    operation_timeout_secs: Option<u64>,
    max_frame_size: Option<u32>,
    token_validity_secs: Option<u64>,

    #[serde(default)]
    transport_type: TransportType,
    #[serde(default)]
    authorization_type: AuthorizationType,
    #[serde(default)]
    connection_properties: HashMap<String, String>,
}

impl ConnectionOptions {
    pub fn new(fully_qualified_namespace: impl Into<String>) -> Self {
        Self {
            fully_qualified_namespace: fully_qualified_namespace.into(),
            ..Default::default()
        }
    }

    /// Build options for the namespace and entity named by a connection string.
    pub fn from_connection_string(connection_string: &str) -> AmqpResult<Self> {
        let properties = ConnectionStringProperties::parse(connection_string)?;
        let mut options = Self::new(properties.fully_qualified_namespace());
        options.entity_path = properties.entity_path().map(str::to_string);
        Ok(options)
    }

    /// Load options from an optional TOML file and `AMQP_*` environment variables.
    ///
    /// Environment entries override file values. The result is validated
    /// before it is returned.
    pub fn load(path: &str) -> AmqpResult<Self> {
        let config = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let options = config.try_deserialize::<ConnectionOptions>()?;
        options.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
            AmqpError::Configuration(messages.join("; "))
        })?;

        log::debug!(
            "Loaded connection options for namespace '{}'",
            options.fully_qualified_namespace
        );
        Ok(options)
    }

    /// Validate the options against defined limits
    pub fn validate(&self) -> Result<(), Vec<ConfigValidationError>> {
        let mut errors = Vec::new();

        if self.fully_qualified_namespace.trim().is_empty() {
            errors.push(ConfigValidationError::MissingNamespace);
        }

        let timeout = self.operation_timeout_secs();
        if timeout == 0 || timeout > MAX_OPERATION_TIMEOUT_SECS {
            errors.push(ConfigValidationError::OperationTimeout {
                configured: timeout,
                limit: MAX_OPERATION_TIMEOUT_SECS,
            });
        }

        if self.max_frame_size() < MIN_MAX_FRAME_SIZE {
            errors.push(ConfigValidationError::MaxFrameSize {
                configured: self.max_frame_size(),
                minimum: MIN_MAX_FRAME_SIZE,
            });
        }

        if self.token_validity_secs() == 0 {
            errors.push(ConfigValidationError::TokenValidity);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn with_entity_path(mut self, entity_path: impl Into<String>) -> Self {
        self.entity_path = Some(entity_path.into());
        self
    }

    pub fn with_transport_type(mut self, transport_type: TransportType) -> Self {
        self.transport_type = transport_type;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = Some(max_frame_size);
        self
    }

    pub fn with_authorization_type(mut self, authorization_type: AuthorizationType) -> Self {
        self.authorization_type = authorization_type;
        self
    }

    pub fn with_connection_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.connection_properties.insert(key.into(), value.into());
        self
    }

    pub fn fully_qualified_namespace(&self) -> &str {
        &self.fully_qualified_namespace
    }

    pub fn entity_path(&self) -> Option<&str> {
        self.entity_path.as_deref()
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    pub fn port(&self) -> u16 {
        self.port
            .unwrap_or_else(|| self.transport_type.default_port())
    }

    pub fn operation_timeout_secs(&self) -> u64 {
        self.operation_timeout_secs
            .unwrap_or(DEFAULT_OPERATION_TIMEOUT_SECS)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs())
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn token_validity_secs(&self) -> u64 {
        self.token_validity_secs
            .unwrap_or(DEFAULT_TOKEN_VALIDITY_SECS)
    }

    pub fn authorization_type(&self) -> AuthorizationType {
        self.authorization_type
    }

    /// Build the parameters passed to the transport for a given connection id.
    ///
    /// Client identification properties are filled in unless configured
    /// explicitly.
    pub fn connection_parameters(&self, connection_id: &str) -> ConnectionParameters {
        let mut properties = self.connection_properties.clone();
        properties
            .entry("product".to_string())
            .or_insert_with(|| env!("CARGO_PKG_NAME").to_string());
        properties
            .entry("version".to_string())
            .or_insert_with(|| env!("CARGO_PKG_VERSION").to_string());
        properties
            .entry("platform".to_string())
            .or_insert_with(|| std::env::consts::OS.to_string());

        ConnectionParameters {
            connection_id: connection_id.to_string(),
            host: self.fully_qualified_namespace.clone(),
            port: self.port(),
            transport_type: self.transport_type,
            max_frame_size: self.max_frame_size(),
            properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_transport_type() {
        let options = ConnectionOptions::new("ns.servicebus.windows.net");
        assert_eq!(options.port(), AMQPS_PORT);
        assert_eq!(options.operation_timeout(), Duration::from_secs(60));
        assert_eq!(options.max_frame_size(), DEFAULT_MAX_FRAME_SIZE);

        let websockets = options.with_transport_type(TransportType::AmqpWebSockets);
        assert_eq!(websockets.port(), WEBSOCKETS_PORT);
        assert_eq!(websockets.clone().with_port(8443).port(), 8443);
    }

    #[test]
    fn validate_collects_every_violation() {
        let options = ConnectionOptions::new("  ")
            .with_max_frame_size(16)
            .with_operation_timeout(Duration::from_secs(3_600));

        let errors = options.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&ConfigValidationError::MissingNamespace));
        assert!(errors.contains(&ConfigValidationError::MaxFrameSize {
            configured: 16,
            minimum: MIN_MAX_FRAME_SIZE,
        }));
    }

    #[test]
    fn connection_parameters_keep_explicit_properties() {
        let options = ConnectionOptions::new("ns.servicebus.windows.net")
            .with_connection_property("product", "custom-agent");
        let parameters = options.connection_parameters("conn-1");

        assert_eq!(parameters.connection_id, "conn-1");
        assert_eq!(parameters.host, "ns.servicebus.windows.net");
        assert_eq!(parameters.port, AMQPS_PORT);
        assert_eq!(parameters.properties["product"], "custom-agent");
        assert!(parameters.properties.contains_key("platform"));
    }

    #[test]
    fn options_from_connection_string_carry_entity_path() {
        let options = ConnectionOptions::from_connection_string(
            "Endpoint=sb://my-ns.servicebus.windows.net/;SharedAccessKeyName=root;SharedAccessKey=a2V5;EntityPath=telemetry",
        )
        .unwrap();
        assert_eq!(
            options.fully_qualified_namespace(),
            "my-ns.servicebus.windows.net"
        );
        assert_eq!(options.entity_path(), Some("telemetry"));
    }

    #[test]
    fn load_without_file_uses_environment_and_defaults() {
        // SAFETY: test-only mutation of a variable no other test reads
        unsafe {
            std::env::set_var(
                "AMQP_FULLY_QUALIFIED_NAMESPACE",
                "env-ns.servicebus.windows.net",
            );
        }
        let options = ConnectionOptions::load("does-not-exist-amqp-options").unwrap();
        assert_eq!(
            options.fully_qualified_namespace(),
            "env-ns.servicebus.windows.net"
        );
        assert_eq!(options.operation_timeout_secs(), DEFAULT_OPERATION_TIMEOUT_SECS);
        unsafe {
            std::env::remove_var("AMQP_FULLY_QUALIFIED_NAMESPACE");
        }
    }
}
