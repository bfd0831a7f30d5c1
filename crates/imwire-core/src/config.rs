//! Engine configuration
//!
//! All knobs of the connection engine in one serde-serializable tree. Every
//! section has production defaults and a `testing()` preset with short
//! timings for deterministic tests.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{ImwireError, ImwireResult};
use crate::types::Endpoint;

// ----------------------------------------------------------------------------
// Heartbeat Configuration
// ----------------------------------------------------------------------------

/// Configuration for connection liveness probing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Time between probes while connected
    pub interval: Duration,
    /// Deadline for each probe reply
    pub timeout: Duration,
    /// Consecutive misses that declare the connection dead
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            max_missed: 2,
        }
    }
}

impl HeartbeatConfig {
    pub fn testing() -> Self {
        Self {
            interval: Duration::from_millis(200),
            timeout: Duration::from_millis(100),
            max_missed: 2,
        }
    }
}

// ----------------------------------------------------------------------------
// Reconnect Configuration
// ----------------------------------------------------------------------------

/// Backoff curve and attempt bound of automatic reconnection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Consecutive failures tolerated before giving up
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// How long a failed endpoint is skipped by server selection
    pub failure_cooldown: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            failure_cooldown: Duration::from_secs(60),
        }
    }
}

impl ReconnectConfig {
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            failure_cooldown: Duration::from_secs(5),
        }
    }

    /// Delay before reconnect attempt number `attempt` (1-based)
    ///
    /// `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_multiplier.powi(exponent);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_millis(capped as u64)
        } else {
            self.max_delay
        }
    }
}

// ----------------------------------------------------------------------------
// Codec Configuration
// ----------------------------------------------------------------------------

/// Size limits and compression policy of the codec pipelines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Packet bodies at or above this size are zlib-compressed
    pub compression_threshold: usize,
    /// Largest encoded message body accepted for sending
    pub max_message_size: usize,
    /// Largest frame accepted from or written to the stream
    pub max_frame_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression_threshold: 256,
            max_message_size: 4096,
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

// ----------------------------------------------------------------------------
// Protocol Configuration
// ----------------------------------------------------------------------------

/// Command names of the session-layer protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub heartbeat_command: String,
    pub login_command: String,
    pub message_send_command: String,
    /// Unsolicited commands carrying incoming messages
    pub message_commands: Vec<String>,
    /// Unsolicited command carrying a replacement server list
    pub redirect_command: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            heartbeat_command: "Heartbeat.Alive".to_string(),
            login_command: "wtlogin.login".to_string(),
            message_send_command: "MessageSvc.PbSendMsg".to_string(),
            message_commands: vec!["MessageSvc.PushMsg".to_string()],
            redirect_command: "ConfigPushSvc.PushReq".to_string(),
        }
    }
}

impl ProtocolConfig {
    pub fn is_message_command(&self, command: &str) -> bool {
        self.message_commands.iter().any(|c| c == command)
    }
}

// ----------------------------------------------------------------------------
// Engine Configuration
// ----------------------------------------------------------------------------

/// Top-level configuration of one network handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seed servers in preference order
    pub servers: Vec<Endpoint>,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
    pub codec: CodecConfig,
    pub protocol: ProtocolConfig,
    pub connect_timeout: Duration,
    pub login_timeout: Duration,
    /// Default deadline for request/response exchanges
    pub request_timeout: Duration,
    /// Process-wide pipeline trace switch
    pub trace: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            codec: CodecConfig::default(),
            protocol: ProtocolConfig::default(),
            connect_timeout: Duration::from_secs(10),
            login_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
            trace: false,
        }
    }
}

impl EngineConfig {
    pub fn new(servers: Vec<Endpoint>) -> Self {
        Self {
            servers,
            ..Self::default()
        }
    }

    /// Short timings for tests
    pub fn testing(servers: Vec<Endpoint>) -> Self {
        Self {
            servers,
            heartbeat: HeartbeatConfig::testing(),
            reconnect: ReconnectConfig::testing(),
            codec: CodecConfig::default(),
            protocol: ProtocolConfig::default(),
            connect_timeout: Duration::from_millis(500),
            login_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_millis(500),
            trace: false,
        }
    }

    /// Parse a JSON document; missing sections are an error
    pub fn from_json_str(json: &str) -> ImwireResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ImwireError::config_error(format!("invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> ImwireResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ImwireError::config_error(format!("serialization failed: {}", e)))
    }

    pub fn with_servers(mut self, servers: Vec<Endpoint>) -> Self {
        self.servers = servers;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, login: Duration) -> Self {
        self.connect_timeout = connect;
        self.login_timeout = login;
        self
    }

    pub fn with_trace(mut self, enabled: bool) -> Self {
        self.trace = enabled;
        self
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> ImwireResult<()> {
        if self.servers.is_empty() {
            return Err(ImwireError::config_error("server list is empty"));
        }
        if self.heartbeat.interval.is_zero() || self.heartbeat.timeout.is_zero() {
            return Err(ImwireError::config_error(
                "heartbeat interval and timeout must be non-zero",
            ));
        }
        if self.heartbeat.max_missed == 0 {
            return Err(ImwireError::config_error("heartbeat max_missed must be at least 1"));
        }
        if self.connect_timeout.is_zero()
            || self.login_timeout.is_zero()
            || self.request_timeout.is_zero()
        {
            return Err(ImwireError::config_error("connect, login and request timeouts must be non-zero"));
        }

        let reconnect = &self.reconnect;
        if !(reconnect.backoff_multiplier > 1.0) {
            return Err(ImwireError::config_error(format!(
                "backoff multiplier must be greater than 1.0, got {}",
                reconnect.backoff_multiplier
            )));
        }
        if reconnect.initial_delay.is_zero() {
            return Err(ImwireError::config_error("initial reconnect delay must be non-zero"));
        }
        if reconnect.initial_delay > reconnect.max_delay {
            return Err(ImwireError::config_error(format!(
                "initial delay {:?} exceeds max delay {:?}",
                reconnect.initial_delay, reconnect.max_delay
            )));
        }

        if self.codec.max_frame_size == 0 || self.codec.max_message_size == 0 {
            return Err(ImwireError::config_error("frame and message size limits must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers() -> Vec<Endpoint> {
        vec![Endpoint::new("10.0.0.1", 8080)]
    }

    #[test]
    fn test_defaults_validate() {
        assert!(EngineConfig::new(servers()).validate().is_ok());
        assert!(EngineConfig::testing(servers()).validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(EngineConfig::default().validate().is_err());

        let mut config = EngineConfig::new(servers());
        config.reconnect.backoff_multiplier = 1.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::new(servers());
        config.reconnect.initial_delay = Duration::from_secs(60);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::new(servers());
        config.heartbeat.interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::new(servers());
        config.codec.max_frame_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_curve() {
        let reconnect = ReconnectConfig::default();
        assert_eq!(reconnect.delay_for(1), Duration::from_secs(1));
        assert_eq!(reconnect.delay_for(2), Duration::from_secs(2));
        assert_eq!(reconnect.delay_for(3), Duration::from_secs(4));
        assert_eq!(reconnect.delay_for(6), Duration::from_secs(30));
        assert_eq!(reconnect.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = EngineConfig::testing(servers()).with_trace(true);
        let json = config.to_json_string().unwrap();
        assert_eq!(EngineConfig::from_json_str(&json).unwrap(), config);

        assert!(EngineConfig::from_json_str("{").is_err());
    }

    #[test]
    fn test_message_commands() {
        let protocol = ProtocolConfig::default();
        assert!(protocol.is_message_command("MessageSvc.PushMsg"));
        assert!(!protocol.is_message_command("Heartbeat.Alive"));
    }
}
