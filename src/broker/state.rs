//! Broker connection state machine.

use std::fmt;

use serde::Serialize;

/// Lifecycle state of the single broker connection.
///
/// ```text
/// Disconnected ──initialize──▶ Connecting ──ok──▶ Connected
///                                   │                 │ closed / error
///                                   ▼                 ▼
///                                 Failed ◀──budget── Reconnecting ──ok──▶ Connected
///                                   └──────reconnect──────▲
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Whether moving from `self` to `target` is a legal transition.
    pub fn can_transition_to(self, target: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, target),
            (Disconnected | Failed, Connecting)
                | (Connecting, Connected | Failed)
                | (Connected | Failed, Reconnecting)
                | (Reconnecting, Connected | Failed)
                // close() is allowed from anywhere
                | (_, Disconnected)
        )
    }

    /// Publishing is only possible on a live channel.
    pub fn accepts_publish(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}
