//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via ICEBRIDGE_CONFIG)
//! 3. Environment variables

use icebridge_core::{ConnectionOptions, ExceptionEnforcement, IdleCheckMode, IdlePolicy};
use icebridge_protocol::{ClassFormat, DEFAULT_CLASS_GRAPH_DEPTH_MAX, DEFAULT_PORT, MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Per-connection lifecycle and encoding settings.
    pub connection: ConnectionConfig,
    /// TLS configuration.
    pub tls: TlsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("ICEBRIDGE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    /// Parses configuration from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ConfigError::ParseError(PathBuf::from("<inline>"), e.to_string()))
    }

    /// Applies `ICEBRIDGE_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`, keyed by environment variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.network.apply_overrides(&lookup);
        self.connection.apply_overrides(&lookup);
        self.tls.apply_overrides(&lookup);
    }

    /// Rejects inconsistent settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be at least 1".to_string(),
            ));
        }
        self.connection.validate()?;
        self.tls.validate()
    }

    /// Options for every accepted connection.
    pub fn connection_options(&self) -> ConnectionOptions {
        self.connection.connection_options()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(parsed) = lookup("ICEBRIDGE_BIND").and_then(|addr| addr.parse().ok()) {
            self.bind_addr = parsed;
        }
        if let Some(n) = lookup("ICEBRIDGE_MAX_CONNECTIONS").and_then(|max| max.parse().ok()) {
            self.max_connections = n;
        }
    }
}

/// Connection lifecycle and encoding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Seconds without a received frame before the idle check fires (0 = disabled).
    pub idle_timeout_secs: u64,
    /// `heartbeat` or `validate-and-require`.
    #[serde(with = "named")]
    pub idle_check_mode: IdleCheckMode,
    /// `warn` or `close`; applies to heartbeat mode.
    #[serde(with = "named")]
    pub idle_policy: IdlePolicy,
    /// Seconds without application traffic before shutdown (0 = disabled).
    pub inactivity_timeout_secs: u64,
    /// Seconds a graceful shutdown may take before the transport is dropped.
    pub shutdown_grace_period_secs: u64,
    /// Seconds allowed for the TLS and Ice handshakes.
    pub handshake_timeout_secs: u64,
    /// Maximum incoming frame size in bytes.
    pub max_frame_size: usize,
    /// Encode classes in the sliced format instead of compact.
    pub sliced_format: bool,
    /// `dispatch` or `invoke`.
    #[serde(with = "named")]
    pub exception_enforcement: ExceptionEnforcement,
    /// Maximum class graph nesting when decoding.
    pub class_graph_depth_max: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            idle_check_mode: IdleCheckMode::default(),
            idle_policy: IdlePolicy::default(),
            inactivity_timeout_secs: 0,
            shutdown_grace_period_secs: 10,
            handshake_timeout_secs: 10,
            max_frame_size: MAX_FRAME_SIZE,
            sliced_format: false,
            exception_enforcement: ExceptionEnforcement::default(),
            class_graph_depth_max: DEFAULT_CLASS_GRAPH_DEPTH_MAX,
        }
    }
}

impl ConnectionConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        let secs = |key: &str| lookup(key).and_then(|value| value.parse::<u64>().ok());

        if let Some(secs) = secs("ICEBRIDGE_IDLE_TIMEOUT") {
            self.idle_timeout_secs = secs;
        }
        if let Some(mode) = lookup("ICEBRIDGE_IDLE_CHECK_MODE").and_then(|v| IdleCheckMode::parse(&v)) {
            self.idle_check_mode = mode;
        }
        if let Some(policy) = lookup("ICEBRIDGE_IDLE_POLICY").and_then(|v| IdlePolicy::parse(&v)) {
            self.idle_policy = policy;
        }
        if let Some(secs) = secs("ICEBRIDGE_INACTIVITY_TIMEOUT") {
            self.inactivity_timeout_secs = secs;
        }
        if let Some(secs) = secs("ICEBRIDGE_SHUTDOWN_GRACE_PERIOD") {
            self.shutdown_grace_period_secs = secs;
        }
        if let Some(secs) = secs("ICEBRIDGE_HANDSHAKE_TIMEOUT") {
            self.handshake_timeout_secs = secs;
        }
        if let Some(size) = lookup("ICEBRIDGE_MAX_FRAME_SIZE").and_then(|v| v.parse().ok()) {
            self.max_frame_size = size;
        }
        if let Some(sliced) = lookup("ICEBRIDGE_SLICED_FORMAT") {
            self.sliced_format = is_true(&sliced);
        }
        if let Some(enforcement) =
            lookup("ICEBRIDGE_EXCEPTION_ENFORCEMENT").and_then(|v| ExceptionEnforcement::parse(&v))
        {
            self.exception_enforcement = enforcement;
        }
        if let Some(depth) = lookup("ICEBRIDGE_CLASS_GRAPH_DEPTH_MAX").and_then(|v| v.parse().ok()) {
            self.class_graph_depth_max = depth;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_frame_size < icebridge_protocol::FRAME_HEADER_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "max_frame_size must be at least {} bytes",
                icebridge_protocol::FRAME_HEADER_SIZE
            )));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "handshake_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.class_graph_depth_max == 0 {
            return Err(ConfigError::ValidationError(
                "class_graph_depth_max must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the options every accepted connection runs with.
    pub fn connection_options(&self) -> ConnectionOptions {
        let class_format = if self.sliced_format {
            ClassFormat::Sliced
        } else {
            ClassFormat::Compact
        };
        ConnectionOptions::new()
            .with_idle_timeout(Duration::from_secs(self.idle_timeout_secs))
            .with_idle_check_mode(self.idle_check_mode)
            .with_idle_policy(self.idle_policy)
            .with_inactivity_timeout(Duration::from_secs(self.inactivity_timeout_secs))
            .with_shutdown_grace_period(Duration::from_secs(self.shutdown_grace_period_secs))
            .with_handshake_timeout(Duration::from_secs(self.handshake_timeout_secs))
            .with_max_frame_size(self.max_frame_size)
            .with_class_format(class_format)
            .with_class_graph_depth_max(self.class_graph_depth_max)
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Enable TLS.
    pub enabled: bool,
    /// Path to PEM-encoded server certificate file.
    pub cert_path: Option<PathBuf>,
    /// Path to PEM-encoded private key file.
    pub key_path: Option<PathBuf>,
    /// Require client certificate authentication (mTLS).
    pub require_client_cert: bool,
    /// PEM CA certificate(s) for verifying client certs. Client certificates
    /// are optional when this is set without `require_client_cert`.
    pub client_ca_path: Option<PathBuf>,
}

impl TlsConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = lookup("ICEBRIDGE_TLS_ENABLED") {
            self.enabled = is_true(&enabled);
        }
        if let Some(path) = lookup("ICEBRIDGE_TLS_CERT") {
            self.cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("ICEBRIDGE_TLS_KEY") {
            self.key_path = Some(PathBuf::from(path));
        }
        if let Some(require) = lookup("ICEBRIDGE_TLS_REQUIRE_CLIENT_CERT") {
            self.require_client_cert = is_true(&require);
        }
        if let Some(path) = lookup("ICEBRIDGE_TLS_CLIENT_CA") {
            self.client_ca_path = Some(PathBuf::from(path));
        }
    }

    /// Validates TLS configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }

        if self.cert_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but cert_path not set".to_string(),
            ));
        }
        if self.key_path.is_none() {
            return Err(ConfigError::ValidationError(
                "TLS enabled but key_path not set".to_string(),
            ));
        }
        if self.require_client_cert && self.client_ca_path.is_none() {
            return Err(ConfigError::ValidationError(
                "mTLS enabled but client_ca_path not set".to_string(),
            ));
        }

        Ok(())
    }
}

fn is_true(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Serde module for the option enums, written by name.
mod named {
    use icebridge_core::{ExceptionEnforcement, IdleCheckMode, IdlePolicy};
    use serde::{Deserialize, Deserializer, Serializer};

    pub trait Named: Sized {
        const EXPECTED: &'static str;
        fn name(&self) -> &'static str;
        fn from_name(name: &str) -> Option<Self>;
    }

    impl Named for IdleCheckMode {
        const EXPECTED: &'static str = "heartbeat or validate-and-require";
        fn name(&self) -> &'static str {
            self.as_str()
        }
        fn from_name(name: &str) -> Option<Self> {
            Self::parse(name)
        }
    }

    impl Named for IdlePolicy {
        const EXPECTED: &'static str = "warn or close";
        fn name(&self) -> &'static str {
            self.as_str()
        }
        fn from_name(name: &str) -> Option<Self> {
            Self::parse(name)
        }
    }

    impl Named for ExceptionEnforcement {
        const EXPECTED: &'static str = "dispatch or invoke";
        fn name(&self) -> &'static str {
            self.as_str()
        }
        fn from_name(name: &str) -> Option<Self> {
            Self::parse(name)
        }
    }

    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Named,
        S: Serializer,
    {
        serializer.serialize_str(value.name())
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: Named,
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        T::from_name(&s).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid value '{}', expected {}", s, T::EXPECTED))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 4061);
        assert_eq!(config.connection.idle_timeout_secs, 60);
        assert_eq!(config.connection.inactivity_timeout_secs, 0);
        assert_eq!(config.connection.idle_check_mode, IdleCheckMode::Heartbeat);
        assert!(!config.tls.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = Config::default();
        config.connection.idle_check_mode = IdleCheckMode::ValidateAndRequire;
        config.connection.exception_enforcement = ExceptionEnforcement::Invoke;

        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("validate-and-require"));
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(
            parsed.connection.idle_check_mode,
            IdleCheckMode::ValidateAndRequire
        );
        assert_eq!(
            parsed.connection.exception_enforcement,
            ExceptionEnforcement::Invoke
        );
    }

    #[test]
    fn test_partial_yaml() {
        let config = Config::from_yaml(
            "network:\n  bind_addr: \"0.0.0.0:10000\"\nconnection:\n  inactivity_timeout_secs: 3\n  idle_policy: close\n",
        )
        .unwrap();
        assert_eq!(config.network.bind_addr.port(), 10000);
        assert_eq!(config.network.max_connections, 1000);
        assert_eq!(config.connection.inactivity_timeout_secs, 3);
        assert_eq!(config.connection.idle_policy, IdlePolicy::Close);
    }

    #[test]
    fn test_invalid_enum_name() {
        let err = Config::from_yaml("connection:\n  idle_check_mode: sometimes\n").unwrap_err();
        assert!(err.to_string().contains("heartbeat or validate-and-require"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "connection:\n  sliced_format: true").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert!(config.connection.sliced_format);

        let err = Config::from_file("/nonexistent/icebridge.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_, _)));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("ICEBRIDGE_BIND", "0.0.0.0:5000"),
            ("ICEBRIDGE_IDLE_TIMEOUT", "3"),
            ("ICEBRIDGE_IDLE_CHECK_MODE", "validate"),
            ("ICEBRIDGE_INACTIVITY_TIMEOUT", "5"),
            ("ICEBRIDGE_EXCEPTION_ENFORCEMENT", "invoke"),
            ("ICEBRIDGE_TLS_ENABLED", "TRUE"),
            ("ICEBRIDGE_MAX_CONNECTIONS", "not a number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.network.bind_addr.port(), 5000);
        assert_eq!(config.network.max_connections, 1000);
        assert_eq!(config.connection.idle_timeout_secs, 3);
        assert_eq!(
            config.connection.idle_check_mode,
            IdleCheckMode::ValidateAndRequire
        );
        assert_eq!(config.connection.inactivity_timeout_secs, 5);
        assert_eq!(
            config.connection.exception_enforcement,
            ExceptionEnforcement::Invoke
        );
        assert!(config.tls.enabled);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.connection.max_frame_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tls.enabled = true;
        config.tls.cert_path = Some("/cert.pem".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("key_path not set"));

        config.tls.key_path = Some("/key.pem".into());
        config.tls.require_client_cert = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("client_ca_path"));
    }

    #[test]
    fn test_connection_options() {
        let mut config = ConnectionConfig::default();
        config.idle_timeout_secs = 3;
        config.inactivity_timeout_secs = 5;
        config.sliced_format = true;

        let options = config.connection_options();
        assert_eq!(options.idle_timeout, Duration::from_secs(3));
        assert_eq!(options.inactivity_timeout, Duration::from_secs(5));
        assert_eq!(options.class_format, ClassFormat::Sliced);
        assert_eq!(options.max_frame_size, MAX_FRAME_SIZE);
    }
}
