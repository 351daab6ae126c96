//! Relay config loader (strict parsing).

pub mod schema;

use std::fs;

use chatrelay_core::error::{Result, RelayError};

pub use schema::{BrokerConfig, BrokerMode, GatewaySection, RelayConfig, RelaySection};

/// Environment variables that override broker settings after the file is parsed.
pub const ENV_BROKER_HOST: &str = "CHATRELAY_BROKER_HOST";
pub const ENV_BROKER_PORT: &str = "CHATRELAY_BROKER_PORT";
pub const ENV_BROKER_LOGIN: &str = "CHATRELAY_BROKER_LOGIN";
pub const ENV_BROKER_PASSCODE: &str = "CHATRELAY_BROKER_PASSCODE";

pub fn load_from_file(path: &str) -> Result<RelayConfig> {
    let s = fs::read_to_string(path)
        .map_err(|e| RelayError::Config(format!("read config failed ({path}): {e}")))?;
    let mut cfg = parse(&s)?;
    apply_env_overrides(&mut cfg, |k| std::env::var(k).ok())?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_from_str(s: &str) -> Result<RelayConfig> {
    let cfg = parse(s)?;
    cfg.validate()?;
    Ok(cfg)
}

fn parse(s: &str) -> Result<RelayConfig> {
    serde_yaml::from_str(s).map_err(|e| RelayError::Config(format!("invalid yaml: {e}")))
}

/// Apply `CHATRELAY_BROKER_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides<F>(cfg: &mut RelayConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup(ENV_BROKER_HOST) {
        cfg.broker.host = host;
    }
    if let Some(port) = lookup(ENV_BROKER_PORT) {
        cfg.broker.port = port
            .parse()
            .map_err(|_| RelayError::Config(format!("{ENV_BROKER_PORT} is not a port: {port}")))?;
    }
    if let Some(login) = lookup(ENV_BROKER_LOGIN) {
        cfg.broker.system_login = login;
    }
    if let Some(passcode) = lookup(ENV_BROKER_PASSCODE) {
        cfg.broker.system_passcode = passcode;
    }
    Ok(())
}
