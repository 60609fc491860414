//! Client Configuration
//!
//! Plain structs with sensible defaults and a builder. Nothing here is loaded
//! from files or the environment; the launcher decides where values come from.

use std::time::Duration;

/// Initial read buffer capacity
pub const DEFAULT_READ_BUFFER: usize = 4096;

/// Connection-wide settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -------------------------------------------------------------------------
    // Session prelude (replayed on every reconnect)
    // -------------------------------------------------------------------------
    /// Password sent with AUTH before anything else.
    pub password: Option<String>,

    /// Database index sent with SELECT when non-zero.
    pub database: u32,

    // -------------------------------------------------------------------------
    // Supervision
    // -------------------------------------------------------------------------
    pub reconnect: ReconnectPolicy,

    /// What dispatch does while the connection is being re-established.
    pub disconnected_behavior: DisconnectedBehavior,

    // -------------------------------------------------------------------------
    // I/O
    // -------------------------------------------------------------------------
    pub read_buffer_capacity: usize,

    /// Bound applied by [`Handle::wait`](crate::connection::Handle::wait)
    /// style helpers when the caller gives none.
    pub default_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            password: None,
            database: 0,
            reconnect: ReconnectPolicy::default(),
            disconnected_behavior: DisconnectedBehavior::Buffer,
            read_buffer_capacity: DEFAULT_READ_BUFFER,
            default_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl ClientConfig {
    /// Create a new config builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Dispatch policy while reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectedBehavior {
    /// Hold new commands and send them after the replay.
    #[default]
    Buffer,
    /// Fail new commands immediately with `NotConnected`.
    Reject,
}

/// Exponential backoff for reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// When false, a lost connection is closed instead of re-established.
    pub enabled: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
    /// `None` retries until closed.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt` (1-based).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Returns true if attempt `attempt` (1-based) may still be made.
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: u32) -> Self {
        self.config.database = database;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    pub fn disconnected_behavior(mut self, behavior: DisconnectedBehavior) -> Self {
        self.config.disconnected_behavior = behavior;
        self
    }

    pub fn read_buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.read_buffer_capacity = capacity.max(64);
        self
    }

    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
