//! Per-connection settings.

use icebridge_protocol::{ClassFormat, DEFAULT_CLASS_GRAPH_DEPTH_MAX, MAX_FRAME_SIZE};
use std::time::Duration;

/// How a connection checks that its peer is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdleCheckMode {
    /// Send a heartbeat when the connection goes quiet. A quiet peer is
    /// handled by the [`IdlePolicy`].
    #[default]
    Heartbeat,
    /// Send heartbeats and require the peer to send something within the
    /// idle timeout. A quiet peer is treated as dead.
    ValidateAndRequire,
}

impl IdleCheckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdleCheckMode::Heartbeat => "heartbeat",
            IdleCheckMode::ValidateAndRequire => "validate-and-require",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "heartbeat" => Some(IdleCheckMode::Heartbeat),
            "validate-and-require" | "validate" => Some(IdleCheckMode::ValidateAndRequire),
            _ => None,
        }
    }
}

/// What a heartbeat-mode connection does when nothing arrives for the idle
/// timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdlePolicy {
    #[default]
    Warn,
    Close,
}

impl IdlePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdlePolicy::Warn => "warn",
            IdlePolicy::Close => "close",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "warn" => Some(IdlePolicy::Warn),
            "close" => Some(IdlePolicy::Close),
            _ => None,
        }
    }
}

/// Connection settings. A zero duration disables the matching timer.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub idle_timeout: Duration,
    pub idle_check_mode: IdleCheckMode,
    pub idle_policy: IdlePolicy,
    pub inactivity_timeout: Duration,
    pub shutdown_grace_period: Duration,
    pub handshake_timeout: Duration,
    pub max_frame_size: usize,
    /// Class format used when encoding replies and arguments.
    pub class_format: ClassFormat,
    pub class_graph_depth_max: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            idle_check_mode: IdleCheckMode::default(),
            idle_policy: IdlePolicy::default(),
            inactivity_timeout: Duration::ZERO,
            shutdown_grace_period: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            max_frame_size: MAX_FRAME_SIZE,
            class_format: ClassFormat::Compact,
            class_graph_depth_max: DEFAULT_CLASS_GRAPH_DEPTH_MAX,
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_idle_check_mode(mut self, mode: IdleCheckMode) -> Self {
        self.idle_check_mode = mode;
        self
    }

    pub fn with_idle_policy(mut self, policy: IdlePolicy) -> Self {
        self.idle_policy = policy;
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace_period(mut self, period: Duration) -> Self {
        self.shutdown_grace_period = period;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_class_format(mut self, format: ClassFormat) -> Self {
        self.class_format = format;
        self
    }

    pub fn with_class_graph_depth_max(mut self, depth: usize) -> Self {
        self.class_graph_depth_max = depth;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ConnectionOptions::default();
        assert_eq!(options.idle_timeout, Duration::from_secs(60));
        assert_eq!(options.inactivity_timeout, Duration::ZERO);
        assert_eq!(options.idle_check_mode, IdleCheckMode::Heartbeat);
        assert_eq!(options.idle_policy, IdlePolicy::Warn);
        assert_eq!(options.max_frame_size, MAX_FRAME_SIZE);
        assert_eq!(options.class_graph_depth_max, 100);
    }

    #[test]
    fn test_mode_names() {
        for mode in [IdleCheckMode::Heartbeat, IdleCheckMode::ValidateAndRequire] {
            assert_eq!(IdleCheckMode::parse(mode.as_str()), Some(mode));
        }
        for policy in [IdlePolicy::Warn, IdlePolicy::Close] {
            assert_eq!(IdlePolicy::parse(policy.as_str()), Some(policy));
        }
        assert_eq!(IdleCheckMode::parse("ping"), None);
    }
}
