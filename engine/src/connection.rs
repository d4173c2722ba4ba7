//! Realtime connection state and reconnection rules.
//!
//! [`ConnectionState`] is a plain record; the async connection manager owns
//! one and calls its transition methods as transport events arrive. Each
//! close is classified by [`DisconnectReason`], and each reason has its own
//! retry budget in [`RetryBudgets`].

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Initializing,
    Connecting,
    Connected,
    Disconnected,
    /// Terminal until a new connect request
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Initializing => "initializing",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Why a connection closed (or failed to open).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The server closed the session on purpose
    ServerDisconnect,
    /// We closed the session on purpose
    ClientDisconnect,
    /// The host app went to the background
    Background,
    /// The host reports no network path
    NetworkUnavailable,
    /// The socket closed without an explanation
    TransportClose,
    /// The socket failed (IO error, refused connection, bad handshake)
    TransportError,
    /// No pong arrived within the health-check window
    PingTimeout,
    /// The connect attempt did not complete in time
    ConnectTimeout,
}

impl DisconnectReason {
    /// Intentional closes leave the connection down without retrying.
    pub fn is_intentional(self) -> bool {
        matches!(
            self,
            DisconnectReason::ClientDisconnect
                | DisconnectReason::Background
                | DisconnectReason::NetworkUnavailable
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::ServerDisconnect => "server disconnect",
            DisconnectReason::ClientDisconnect => "client disconnect",
            DisconnectReason::Background => "background",
            DisconnectReason::NetworkUnavailable => "network unavailable",
            DisconnectReason::TransportClose => "transport close",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::ConnectTimeout => "connect timeout",
        };
        f.write_str(name)
    }
}

/// Maximum reconnect attempts per disconnect reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryBudgets {
    pub server_disconnect: u32,
    pub transport_close: u32,
    pub transport_error: u32,
    pub ping_timeout: u32,
    pub connect_timeout: u32,
}

impl Default for RetryBudgets {
    fn default() -> Self {
        Self {
            server_disconnect: 0,
            transport_close: 5,
            transport_error: 10,
            ping_timeout: 5,
            connect_timeout: 5,
        }
    }
}

impl RetryBudgets {
    /// Budget for a reason. Intentional reasons never retry.
    pub fn budget(&self, reason: DisconnectReason) -> u32 {
        match reason {
            DisconnectReason::ServerDisconnect => self.server_disconnect,
            DisconnectReason::TransportClose => self.transport_close,
            DisconnectReason::TransportError => self.transport_error,
            DisconnectReason::PingTimeout => self.ping_timeout,
            DisconnectReason::ConnectTimeout => self.connect_timeout,
            DisconnectReason::ClientDisconnect
            | DisconnectReason::Background
            | DisconnectReason::NetworkUnavailable => 0,
        }
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped, plus caller-supplied jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32, jitter: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let scaled = self.base.saturating_mul(1u32 << exponent);
        scaled.min(self.max) + jitter
    }
}

/// What to do after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Intentional close: stay disconnected
    Stay,
    /// Try again after `delay`
    Reconnect { attempt: u32, delay: Duration },
    /// Budget spent; the state is now `Error`
    GiveUp,
}

/// The connection record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub is_reconnecting: bool,
    pub last_connected: Option<Timestamp>,
    pub last_error: Option<String>,
    pub app_foreground: bool,
    /// Reconnect attempts made in the current outage, all reasons together
    pub attempt: u32,
    /// Reconnect attempts made in the current outage, per reason
    #[serde(default)]
    pub reason_attempts: HashMap<DisconnectReason, u32>,
    pub last_reason: Option<DisconnectReason>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Initializing,
            is_reconnecting: false,
            last_connected: None,
            last_error: None,
            app_foreground: true,
            attempt: 0,
            reason_attempts: HashMap::new(),
            last_reason: None,
        }
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// A connect attempt started (first connect or a scheduled reconnect).
    pub fn begin_connect(&mut self) {
        self.status = ConnectionStatus::Connecting;
    }

    /// A fresh connect request: clears any terminal error and the outage counter.
    pub fn reset_for_connect(&mut self) {
        self.attempt = 0;
        self.reason_attempts.clear();
        self.last_error = None;
        self.last_reason = None;
        self.is_reconnecting = false;
        self.begin_connect();
    }

    /// The transport acknowledged the session.
    pub fn opened(&mut self, now: Timestamp) {
        self.status = ConnectionStatus::Connected;
        self.is_reconnecting = false;
        self.last_connected = Some(now);
        self.last_error = None;
        self.attempt = 0;
        self.reason_attempts.clear();
        self.last_reason = None;
    }

    /// The session closed, or a connect attempt failed, for `reason`.
    pub fn closed(
        &mut self,
        reason: DisconnectReason,
        budgets: &RetryBudgets,
        backoff: &BackoffPolicy,
        jitter: Duration,
    ) -> CloseDecision {
        self.last_reason = Some(reason);

        if reason.is_intentional() {
            self.status = ConnectionStatus::Disconnected;
            self.is_reconnecting = false;
            return CloseDecision::Stay;
        }

        let used = self.reason_attempts.entry(reason).or_insert(0);
        if *used >= budgets.budget(reason) {
            let used = *used;
            self.fail(format!(
                "retry budget exhausted after {used} attempts ({reason})"
            ));
            return CloseDecision::GiveUp;
        }

        *used += 1;
        // the backoff keeps growing across reasons within one outage
        self.attempt += 1;
        self.status = ConnectionStatus::Disconnected;
        self.is_reconnecting = true;
        self.last_error = Some(reason.to_string());
        CloseDecision::Reconnect {
            attempt: self.attempt,
            delay: backoff.delay(self.attempt, jitter),
        }
    }

    /// Enter the terminal error state.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = ConnectionStatus::Error;
        self.is_reconnecting = false;
        self.last_error = Some(error.into());
    }

    /// Stop waiting for a scheduled reconnect and stay down.
    pub fn park(&mut self, reason: DisconnectReason) {
        self.status = ConnectionStatus::Disconnected;
        self.is_reconnecting = false;
        self.last_reason = Some(reason);
    }
}
