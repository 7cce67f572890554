//! Bridge node configuration
//!
//! Loaded from a TOML file, with transport credentials overridable from the
//! environment. Every section has defaults for the stock board build,
//! so an empty file (or no file) yields a working configuration.

use crate::error::{NodeError, NodeResult};
use crate::memory::MemoryConf;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const ENV_SSID: &str = "BRIDGE_WIFI_SSID";
pub const ENV_PASSWORD: &str = "BRIDGE_WIFI_PASSWORD";
pub const ENV_AGENT_IP: &str = "BRIDGE_AGENT_IP";
pub const ENV_AGENT_PORT: &str = "BRIDGE_AGENT_PORT";

/// Complete node configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub transport: TransportConfig,
    pub node: NodeIdentity,
    pub executor: ExecutorConfig,
    pub service: ServiceConfig,
    pub publisher: PublisherConfig,
    pub runtime: RuntimeConfig,
    pub buffers: MemoryConf,
}

/// Network address and credentials handed unmodified to the transport
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub ssid: String,
    pub password: String,
    pub agent_ip: String,
    pub agent_port: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            agent_ip: "127.0.0.1".to_string(),
            agent_port: 8888,
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .field("agent_ip", &self.agent_ip)
            .field("agent_port", &self.agent_port)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeIdentity {
    pub name: String,
    pub namespace: String,
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self {
            name: "control_node".to_string(),
            namespace: "robot".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Endpoints the scheduler is sized for; must match what bring-up adds
    pub handles: usize,
    /// Default poll timeout
    pub timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            handles: 2,
            timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub topic: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            topic: "/control".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub topic: String,
    pub timer_period_ms: u64,
    pub retry: RetryConfig,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            topic: "chatter".to_string(),
            timer_period_ms: 5000,
            retry: RetryConfig::default(),
        }
    }
}

/// Publisher-creation retry settings; `max_attempts = 0` retries forever
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff_ms: 0,
            max_backoff_ms: 1000,
            multiplier: 2.0,
        }
    }
}

/// Outer-loop and indicator timing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub startup_delay_ms: u64,
    pub loop_frequency_hz: u32,
    pub spin_timeout_ms: u64,
    pub fault_blink_ms: u64,
    pub indicator_pin: u8,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: 3000,
            loop_frequency_hz: 10,
            spin_timeout_ms: 100,
            fault_blink_ms: 200,
            indicator_pin: 2,
        }
    }
}

impl RuntimeConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    /// Sleep between outer-loop iterations
    pub fn loop_period(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.loop_frequency_hz.max(1)))
    }

    pub fn spin_timeout(&self) -> Duration {
        Duration::from_millis(self.spin_timeout_ms)
    }

    pub fn fault_blink(&self) -> Duration {
        Duration::from_millis(self.fault_blink_ms)
    }
}

impl BridgeConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> NodeResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file (or defaults when `path` is `None`), then apply
    /// environment overrides for the transport credentials.
    pub fn load(path: Option<&Path>) -> NodeResult<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in `load`)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> NodeResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ssid) = lookup(ENV_SSID) {
            self.transport.ssid = ssid;
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.transport.password = password;
        }
        if let Some(ip) = lookup(ENV_AGENT_IP) {
            self.transport.agent_ip = ip;
        }
        if let Some(port) = lookup(ENV_AGENT_PORT) {
            self.transport.agent_port = port
                .trim()
                .parse()
                .map_err(|_| NodeError::config(format!("{ENV_AGENT_PORT} is not a port: {port}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> NodeResult<()> {
        if self.executor.handles == 0 {
            return Err(NodeError::config("executor.handles must be at least 1"));
        }
        if self.publisher.timer_period_ms == 0 {
            return Err(NodeError::config("publisher.timer_period_ms must be positive"));
        }
        if self.runtime.loop_frequency_hz == 0 {
            return Err(NodeError::config("runtime.loop_frequency_hz must be positive"));
        }
        if self.node.name.is_empty() {
            return Err(NodeError::config("node.name must not be empty"));
        }
        if self.service.topic.is_empty() || self.publisher.topic.is_empty() {
            return Err(NodeError::config("topic names must not be empty"));
        }
        Ok(())
    }

    pub fn timer_period(&self) -> Duration {
        Duration::from_millis(self.publisher.timer_period_ms)
    }

    pub fn executor_timeout(&self) -> Duration {
        Duration::from_millis(self.executor.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_match_stock_build() {
        let config = BridgeConfig::default();
        assert_eq!(config.node.name, "control_node");
        assert_eq!(config.node.namespace, "robot");
        assert_eq!(config.service.topic, "/control");
        assert_eq!(config.publisher.topic, "chatter");
        assert_eq!(config.timer_period(), Duration::from_millis(5000));
        assert_eq!(config.executor.handles, 2);
        assert_eq!(config.runtime.loop_period(), Duration::from_millis(100));
        assert_eq!(config.runtime.spin_timeout(), Duration::from_millis(100));
        assert_eq!(config.buffers.max_string_capacity, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = BridgeConfig::from_toml_str(
            r#"
            [publisher]
            timer_period_ms = 250

            [publisher.retry]
            max_attempts = 5

            [buffers]
            max_string_capacity = 32
            "#,
        )
        .unwrap();
        assert_eq!(config.publisher.timer_period_ms, 250);
        assert_eq!(config.publisher.topic, "chatter");
        assert_eq!(config.publisher.retry.max_attempts, 5);
        assert_eq!(config.buffers.max_string_capacity, 32);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(BridgeConfig::from_toml_str("[executor]\nhandles = 0").is_err());
        assert!(BridgeConfig::from_toml_str("[runtime]\nloop_frequency_hz = 0").is_err());
        assert!(BridgeConfig::from_toml_str("[publisher]\ntimer_period_ms = 0").is_err());
        assert!(matches!(
            BridgeConfig::from_toml_str("[executor]\nhandles = \"two\""),
            Err(NodeError::Toml(_))
        ));
    }

    #[test]
    fn test_credential_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_SSID, "lab"),
            (ENV_PASSWORD, "hunter2"),
            (ENV_AGENT_IP, "192.168.1.20"),
            (ENV_AGENT_PORT, "9999"),
        ]
        .into_iter()
        .collect();

        let mut config = BridgeConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|value| value.to_string()))
            .unwrap();
        assert_eq!(config.transport.ssid, "lab");
        assert_eq!(config.transport.agent_ip, "192.168.1.20");
        assert_eq!(config.transport.agent_port, 9999);
        assert!(!format!("{:?}", config.transport).contains("hunter2"));

        let bad_port = |key: &str| (key == ENV_AGENT_PORT).then(|| "port".to_string());
        assert!(config.apply_overrides(bad_port).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[node]\nname = \"arm_node\"\n\n[transport]\nagent_port = 7000").unwrap();

        let config = BridgeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.node.name, "arm_node");
        assert_eq!(config.node.namespace, "robot");
    }
}
