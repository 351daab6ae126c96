use serde::Deserialize;
use chatrelay_core::error::{Result, RelayError};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    pub version: u32,

    #[serde(default)]
    pub gateway: GatewaySection,

    #[serde(default)]
    pub relay: RelaySection,

    #[serde(default)]
    pub broker: BrokerConfig,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(RelayError::UnsupportedVersion);
        }

        self.gateway.validate()?;
        self.relay.validate()?;
        self.broker.validate()?;

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySection {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ping_interval_ms: default_ping_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl GatewaySection {
    pub fn validate(&self) -> Result<()> {
        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(RelayError::Config(
                "gateway.listen must be a valid socket address".into(),
            ));
        }
        if !(5000..=120000).contains(&self.ping_interval_ms) {
            return Err(RelayError::Config(
                "gateway.ping_interval_ms must be between 5000 and 120000".into(),
            ));
        }
        if !(10000..=600000).contains(&self.idle_timeout_ms) {
            return Err(RelayError::Config(
                "gateway.idle_timeout_ms must be between 10000 and 600000".into(),
            ));
        }
        if self.idle_timeout_ms <= self.ping_interval_ms {
            return Err(RelayError::Config(
                "gateway.idle_timeout_ms must be greater than ping_interval_ms".into(),
            ));
        }
        if !(256..=1_048_576).contains(&self.max_frame_bytes) {
            return Err(RelayError::Config(
                "gateway.max_frame_bytes must be between 256 and 1048576".into(),
            ));
        }
        Ok(())
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".into()
}
fn default_ping_interval_ms() -> u64 {
    20000
}
fn default_idle_timeout_ms() -> u64 {
    60000
}
fn default_max_frame_bytes() -> usize {
    8192
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelaySection {
    #[serde(default = "default_broadcast_destination")]
    pub broadcast_destination: String,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            broadcast_destination: default_broadcast_destination(),
        }
    }
}

impl RelaySection {
    pub fn validate(&self) -> Result<()> {
        if self.broadcast_destination.trim().is_empty() {
            return Err(RelayError::Config(
                "relay.broadcast_destination must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_broadcast_destination() -> String {
    "/topic/public".into()
}

/// Which broker bridge backs the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    /// External STOMP broker over TCP.
    #[default]
    Stomp,
    /// In-process fanout (single instance, no external broker).
    Local,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    #[serde(default)]
    pub mode: BrokerMode,

    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,

    #[serde(default = "default_login")]
    pub system_login: String,

    #[serde(default = "default_login")]
    pub system_passcode: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: BrokerMode::default(),
            host: default_broker_host(),
            port: default_broker_port(),
            virtual_host: default_virtual_host(),
            system_login: default_login(),
            system_passcode: default_login(),
            connect_timeout_ms: default_connect_timeout_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mode == BrokerMode::Local {
            return Ok(());
        }
        if self.host.trim().is_empty() {
            return Err(RelayError::Config("broker.host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(RelayError::Config("broker.port must not be 0".into()));
        }
        if !(100..=60000).contains(&self.connect_timeout_ms) {
            return Err(RelayError::Config(
                "broker.connect_timeout_ms must be between 100 and 60000".into(),
            ));
        }
        if !(100..=60000).contains(&self.publish_timeout_ms) {
            return Err(RelayError::Config(
                "broker.publish_timeout_ms must be between 100 and 60000".into(),
            ));
        }
        if self.reconnect_initial_ms == 0 {
            return Err(RelayError::Config(
                "broker.reconnect_initial_ms must be greater than 0".into(),
            ));
        }
        if self.reconnect_max_ms < self.reconnect_initial_ms {
            return Err(RelayError::Config(
                "broker.reconnect_max_ms must be >= reconnect_initial_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_broker_host() -> String {
    "127.0.0.1".into()
}
fn default_broker_port() -> u16 {
    61613
}
fn default_virtual_host() -> String {
    "/".into()
}
fn default_login() -> String {
    "guest".into()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_publish_timeout_ms() -> u64 {
    3000
}
fn default_reconnect_initial_ms() -> u64 {
    1000
}
fn default_reconnect_max_ms() -> u64 {
    30000
}
