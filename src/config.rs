//! Configuration system for the sensor relay
//!
//! Configuration is read from a TOML file, then environment overrides are
//! applied, then the whole thing is validated. Only `[broker]` is required;
//! topic filters default to the `{namespace}/...` convention.

use crate::handlers::HandlerKind;
use crate::protocol::{TopicBuilder, TopicError, TopicPattern};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Minimum keep-alive accepted by the MQTT client
pub const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Main relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub topics: TopicsSection,
    #[serde(default)]
    pub fanout: FanOutSection,
    #[serde(default)]
    pub tasks: TasksSection,
    #[serde(default)]
    pub server: ServerSection,
}

/// `[broker]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Prefix; a unique suffix is appended per connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_subscribe_qos")]
    pub subscribe_qos: u8,
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_client_id() -> String {
    "sensor-relay".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_subscribe_qos() -> u8 {
    1
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_port(),
            keep_alive_secs: default_keep_alive(),
            client_id: default_client_id(),
            username_env: None,
            password_env: None,
            connect_timeout_secs: default_connect_timeout(),
            subscribe_qos: default_subscribe_qos(),
        }
    }
}

/// `[topics]` section. Unset filters derive from `namespace`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicsSection {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub sensor_data: Option<String>,
    pub alerts: Option<String>,
    pub commands: Option<String>,
    pub status: Option<String>,
    /// Route device status reports
    #[serde(default = "default_true")]
    pub status_enabled: bool,
}

fn default_namespace() -> String {
    "waste-wise".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for TopicsSection {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            sensor_data: None,
            alerts: None,
            commands: None,
            status: None,
            status_enabled: true,
        }
    }
}

/// `[fanout]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FanOutSection {
    #[serde(default = "default_group")]
    pub group: String,
    /// Events buffered per subscriber before it starts lagging
    #[serde(default = "default_fanout_capacity")]
    pub capacity: usize,
}

fn default_group() -> String {
    crate::fanout::DEFAULT_GROUP.to_string()
}

fn default_fanout_capacity() -> usize {
    256
}

impl Default for FanOutSection {
    fn default() -> Self {
        Self {
            group: default_group(),
            capacity: default_fanout_capacity(),
        }
    }
}

/// Task queue backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskBackend {
    #[default]
    Tracing,
    Webhook,
}

/// `[tasks]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TasksSection {
    #[serde(default)]
    pub backend: TaskBackend,
    /// Required when `backend = "webhook"`
    pub webhook_url: Option<String>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            backend: TaskBackend::default(),
            webhook_url: None,
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_port() -> u16 {
    8080
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_server_port(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid topic filter for {name}: {source}")]
    InvalidTopic {
        name: &'static str,
        #[source]
        source: TopicError,
    },
    #[error("Topic filter for {name} ('{filter}') needs a '+' segment for the device id")]
    MissingDeviceSegment { name: &'static str, filter: String },
}

/// Broker login resolved from the environment
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// A topic pattern bound to the handler kind that processes it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBinding {
    pub pattern: TopicPattern,
    pub handler: HandlerKind,
    /// Topic segment holding the device id, for handlers that need one
    pub device_segment: Option<usize>,
}

impl TopicBinding {
    /// Bind `pattern` to `handler`. Handlers that read a device id require a
    /// `+` in the pattern; the first one marks the id segment.
    pub fn new(
        name: &'static str,
        pattern: TopicPattern,
        handler: HandlerKind,
    ) -> Result<Self, ConfigError> {
        let device_segment = pattern.device_segment();
        if handler.reads_device_id() && device_segment.is_none() {
            return Err(ConfigError::MissingDeviceSegment {
                name,
                filter: pattern.to_string(),
            });
        }
        Ok(Self {
            pattern,
            handler,
            device_segment,
        })
    }
}

/// Resolved broker settings, immutable once handed to the connection manager
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub connect_timeout: Duration,
    pub subscribe_qos: u8,
    pub bindings: Vec<TopicBinding>,
}

impl BrokerConfig {
    /// Pattern → handler bindings in routing order
    pub fn bindings(&self) -> &[TopicBinding] {
        &self.bindings
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let section = BrokerSection::default();
        Self {
            host: section.host,
            port: section.port,
            keep_alive: Duration::from_secs(section.keep_alive_secs),
            client_id: section.client_id,
            credentials: None,
            connect_timeout: Duration::from_secs(section.connect_timeout_secs),
            subscribe_qos: section.subscribe_qos,
            bindings: Vec::new(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broker: BrokerSection::default(),
            topics: TopicsSection::default(),
            fanout: FanOutSection::default(),
            tasks: TasksSection::default(),
            server: ServerSection::default(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file, apply environment overrides and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: RelayConfig = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = RelayConfig::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, keyed by environment variable name
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_BROKER_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("MQTT_BROKER_PORT") {
            self.broker.port = parse_override("MQTT_BROKER_PORT", &port)?;
        }
        if let Some(keep_alive) = lookup("MQTT_KEEPALIVE") {
            self.broker.keep_alive_secs = parse_override("MQTT_KEEPALIVE", &keep_alive)?;
        }
        if let Some(topic) = lookup("MQTT_TOPIC_SENSOR_DATA") {
            self.topics.sensor_data = Some(topic);
        }
        if let Some(topic) = lookup("MQTT_TOPIC_ALERTS") {
            self.topics.alerts = Some(topic);
        }
        if let Some(topic) = lookup("MQTT_TOPIC_COMMANDS") {
            self.topics.commands = Some(topic);
        }
        if let Some(topic) = lookup("MQTT_TOPIC_STATUS") {
            self.topics.status = Some(topic);
        }
        Ok(())
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        if broker.host.trim().is_empty() {
            return Err(invalid("broker.host must not be empty"));
        }
        if broker.port == 0 {
            return Err(invalid("broker.port must be non-zero"));
        }
        if broker.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(invalid(format!(
                "broker.keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}, got {}",
                broker.keep_alive_secs
            )));
        }
        if broker.connect_timeout_secs == 0 {
            return Err(invalid("broker.connect_timeout_secs must be non-zero"));
        }
        if broker.subscribe_qos > 2 {
            return Err(invalid(format!(
                "broker.subscribe_qos must be 0, 1 or 2, got {}",
                broker.subscribe_qos
            )));
        }

        if self.topics.namespace.trim_matches('/').is_empty() {
            return Err(invalid("topics.namespace must not be empty"));
        }
        self.topic_bindings()?;

        if self.fanout.group.is_empty() {
            return Err(invalid("fanout.group must not be empty"));
        }
        if self.fanout.capacity == 0 {
            return Err(invalid("fanout.capacity must be greater than zero"));
        }

        if self.tasks.queue_capacity == 0 {
            return Err(invalid("tasks.queue_capacity must be greater than zero"));
        }
        if self.tasks.backend == TaskBackend::Webhook {
            self.webhook_url()?;
        }

        Ok(())
    }

    pub fn topic_builder(&self) -> TopicBuilder {
        TopicBuilder::new(self.topics.namespace.clone())
    }

    /// Topic bindings in routing order: sensor data, alerts, commands, status
    pub fn topic_bindings(&self) -> Result<Vec<TopicBinding>, ConfigError> {
        let builder = self.topic_builder();
        let topics = &self.topics;

        let mut entries = vec![
            (
                "sensor_data",
                topics.sensor_data.clone().unwrap_or_else(|| builder.sensor_data_filter()),
                HandlerKind::SensorData,
            ),
            (
                "alerts",
                topics.alerts.clone().unwrap_or_else(|| builder.alerts_topic()),
                HandlerKind::Alerts,
            ),
            (
                "commands",
                topics.commands.clone().unwrap_or_else(|| builder.commands_filter()),
                HandlerKind::Commands,
            ),
        ];
        if topics.status_enabled {
            entries.push((
                "status",
                topics.status.clone().unwrap_or_else(|| builder.status_filter()),
                HandlerKind::Status,
            ));
        }

        entries
            .into_iter()
            .map(|(name, filter, handler)| {
                let pattern = TopicPattern::parse(&filter)
                    .map_err(|source| ConfigError::InvalidTopic { name, source })?;
                TopicBinding::new(name, pattern, handler)
            })
            .collect()
    }

    /// Resolve credentials; applied only when both variables are set
    pub fn credentials(&self) -> Option<Credentials> {
        let username = std::env::var(self.broker.username_env.as_ref()?).ok()?;
        let password = std::env::var(self.broker.password_env.as_ref()?).ok()?;
        Some(Credentials { username, password })
    }

    /// Resolved broker settings for the connection manager
    pub fn broker_config(&self) -> Result<BrokerConfig, ConfigError> {
        Ok(BrokerConfig {
            host: self.broker.host.clone(),
            port: self.broker.port,
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            client_id: self.broker.client_id.clone(),
            credentials: self.credentials(),
            connect_timeout: Duration::from_secs(self.broker.connect_timeout_secs),
            subscribe_qos: self.broker.subscribe_qos,
            bindings: self.topic_bindings()?,
        })
    }

    /// Parsed webhook endpoint; must be http or https
    pub fn webhook_url(&self) -> Result<Url, ConfigError> {
        let raw = self
            .tasks
            .webhook_url
            .as_deref()
            .ok_or_else(|| invalid("tasks.webhook_url is required for the webhook backend"))?;
        let url = Url::parse(raw)
            .map_err(|e| invalid(format!("tasks.webhook_url '{raw}' is not a valid URL: {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(invalid(format!(
                "tasks.webhook_url must use http or https, got '{other}'"
            ))),
        }
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidConfig(message.into())
}

fn parse_override<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| invalid(format!("{name}='{value}' is invalid: {e}")))
}
