//! Session runtime configuration.

use std::time::Duration;

use shroud_core::PendingPolicy;
use shroud_core::config::{ReconnectSettings, TunnelSettings};

/// Runtime knobs for a [`crate::SessionManager`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on waiting for `init_ack` after sending `init`.
    pub handshake_timeout: Duration,
    /// Bound on waiting for a Ready session before a submission fails.
    pub ready_wait: Duration,
    pub reconnect: ReconnectPolicy,
    /// What happens to requests pending when a session ends.
    pub pending_policy: PendingPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            ready_wait: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            pending_policy: PendingPolicy::Fail,
        }
    }
}

impl From<&TunnelSettings> for SessionConfig {
    fn from(settings: &TunnelSettings) -> Self {
        Self {
            handshake_timeout: settings.handshake_timeout(),
            ready_wait: settings.ready_wait(),
            reconnect: ReconnectPolicy::from(&settings.reconnect),
            pending_policy: settings.pending_on_reconnect,
        }
    }
}

/// Exponential backoff reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Initial delay before first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Maximum number of reconnect attempts (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier,
            max_attempts: settings.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Fixed delay between attempts, unlimited retries.
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            max_attempts: None,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = base_ms * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether another attempt should be made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}
