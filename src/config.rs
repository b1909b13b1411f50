//! Listener and routing configuration, normally loaded from a TOML file.
//!
//! ```toml
//! [[listeners]]
//! address = "127.0.0.1:2575"
//! mode = "receive-only"
//! auto_ack = true
//!
//! [[rules]]
//! pattern = 'MFN\^M05/.*'
//! handler = "accept"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::{Dispatcher, HandlerRef, HandlerRegistry, Rule};
use crate::error::ConfigError;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_FRAME_TIMEOUT_SECS: u64 = 30;
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;

/// Whether a listener group only receives, or also pushes queued messages out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    #[default]
    ReceiveOnly,
    Duplex,
}

/// One listener group.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ListenerConfig {
    /// `host:port`, or a bare port on localhost.
    pub address: String,
    #[serde(default)]
    pub mode: Mode,
    /// Answer every inbound frame with a bare MLLP ACK.
    #[serde(default)]
    pub auto_ack: bool,
    /// Where duplex peers connect to collect outbound messages.
    #[serde(default)]
    pub send_address: Option<String>,
    /// Seconds a partially received frame may stay incomplete before the connection is
    /// dropped. Zero waits forever.
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_secs: u64,
    /// Seconds a single write to a peer may take before the connection is dropped.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
}

fn default_frame_timeout() -> u64 {
    DEFAULT_FRAME_TIMEOUT_SECS
}

fn default_write_timeout() -> u64 {
    DEFAULT_WRITE_TIMEOUT_SECS
}

impl ListenerConfig {
    pub fn receive_only(address: impl Into<String>) -> Self {
        ListenerConfig {
            address: address.into(),
            mode: Mode::ReceiveOnly,
            auto_ack: false,
            send_address: None,
            frame_timeout_secs: DEFAULT_FRAME_TIMEOUT_SECS,
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT_SECS,
        }
    }

    pub fn duplex(address: impl Into<String>, send_address: impl Into<String>) -> Self {
        ListenerConfig {
            mode: Mode::Duplex,
            send_address: Some(send_address.into()),
            ..ListenerConfig::receive_only(address)
        }
    }

    #[must_use]
    pub fn auto_ack(mut self, enabled: bool) -> Self {
        self.auto_ack = enabled;
        self
    }

    #[must_use]
    pub fn frame_timeout_secs(mut self, secs: u64) -> Self {
        self.frame_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn write_timeout_secs(mut self, secs: u64) -> Self {
        self.write_timeout_secs = secs;
        self
    }

    pub fn frame_timeout(&self) -> Option<Duration> {
        (self.frame_timeout_secs > 0).then(|| Duration::from_secs(self.frame_timeout_secs))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_address(&self.address)?;
        if self.write_timeout_secs == 0 {
            return Err(ConfigError::Validation(format!(
                "listener {} needs a write_timeout_secs above zero",
                self.address
            )));
        }
        match (self.mode, &self.send_address) {
            (Mode::Duplex, Some(send)) => parse_address(send).map(|_| ()),
            (Mode::Duplex, None) => Err(ConfigError::Validation(format!(
                "duplex listener {} needs a send_address",
                self.address
            ))),
            (Mode::ReceiveOnly, Some(_)) => Err(ConfigError::Validation(format!(
                "receive-only listener {} must not set a send_address",
                self.address
            ))),
            (Mode::ReceiveOnly, None) => Ok(()),
        }
    }
}

/// Resolves `host:port`, treating a bare port as localhost.
pub fn parse_address(address: &str) -> Result<SocketAddr, ConfigError> {
    let candidate = if address.contains(':') {
        address.to_string()
    } else {
        format!("{}:{}", DEFAULT_HOST, address)
    };

    candidate
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::InvalidAddress(address.to_string()))
}

/// One row of the routing table.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RuleConfig {
    pub pattern: String,
    pub handler: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

/// Everything the bridge binary needs to start.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BridgeConfig {
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl BridgeConfig {
    /// Reads and validates a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file can't be read, isn't valid TOML or fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        BridgeConfig::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::Validation(
                "at least one listener is required".to_string(),
            ));
        }
        self.listeners.iter().try_for_each(ListenerConfig::validate)
    }

    /// Compiles the routing table against `registry`, resolving every handler name up front.
    pub fn dispatcher(&self, registry: HandlerRegistry) -> Result<Dispatcher, ConfigError> {
        let rules = self
            .rules
            .iter()
            .map(|rule| {
                Rule::new(
                    &rule.pattern,
                    HandlerRef::Named(rule.handler.clone()),
                    rule.args.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let dispatcher = Dispatcher::new(rules, registry);
        dispatcher.resolve_all()?;
        Ok(dispatcher)
    }
}
