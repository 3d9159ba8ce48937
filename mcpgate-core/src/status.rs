// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Connection lifecycle state machine.
//!
//! ```text
//! connecting ──client id──► connected ──stale client id──► connecting
//!     │  ▲                      │
//!  attempt failed / probe    probe failed
//!     ▼  │ retry                ▼
//!   error ◄─────────────────────┘
//! ```
//!
//! Any non-terminal state moves to `disconnected` on an explicit disconnect.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Error,
    Disconnected,
}

impl ConnectionStatus {
    /// Whether a tool call may be forwarded in this state.
    pub fn is_ready(self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionStatus::Disconnected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstablishEvent {
    /// Liveness probe against `GET /info` failed or timed out.
    ProbeFailed,
    /// The SSE stream delivered a `connected` event carrying a client ID.
    ClientIdReceived,
    /// Acquisition timed out or the stream died before a client ID arrived.
    AttemptFailed,
    /// Backoff elapsed and another acquisition attempt starts.
    Retry,
    /// The stream of an established session errored or ended.
    StreamLost,
    /// The remote rejected the current client ID during execution.
    StaleClientId,
    Disconnect,
}

#[derive(Debug, Error)]
#[error("Invalid transition: {current} -> {event:?}")]
pub struct InvalidTransition {
    pub current: ConnectionStatus,
    pub event: EstablishEvent,
}

impl ConnectionStatus {
    pub fn transition(self, event: EstablishEvent) -> Result<ConnectionStatus, InvalidTransition> {
        use ConnectionStatus::*;
        use EstablishEvent::*;

        let next = match (self, event) {
            (Connecting, ClientIdReceived) => Connected,
            (Connected, ClientIdReceived) => Connected,
            (Connecting, AttemptFailed) => Error,
            (Error, Retry) => Connecting,
            (Connecting | Connected | Error, ProbeFailed) => Error,
            (Connected, StreamLost) => Connected,
            (Connected, StaleClientId) => Connecting,
            (s, Disconnect) if !s.is_terminal() => Disconnected,
            _ => {
                return Err(InvalidTransition {
                    current: self,
                    event,
                })
            }
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let status = ConnectionStatus::Connecting
            .transition(EstablishEvent::ClientIdReceived)
            .unwrap();
        assert_eq!(status, ConnectionStatus::Connected);
        assert!(status.is_ready());
    }

    #[test]
    fn test_failed_attempt_loops_back_through_error() {
        let status = ConnectionStatus::Connecting
            .transition(EstablishEvent::AttemptFailed)
            .unwrap();
        assert_eq!(status, ConnectionStatus::Error);
        assert!(!status.is_ready());

        let status = status.transition(EstablishEvent::Retry).unwrap();
        assert_eq!(status, ConnectionStatus::Connecting);
    }

    #[test]
    fn test_stream_loss_keeps_session_usable() {
        let status = ConnectionStatus::Connected
            .transition(EstablishEvent::StreamLost)
            .unwrap();
        assert_eq!(status, ConnectionStatus::Connected);
    }

    #[test]
    fn test_stale_client_id_reestablishes() {
        let status = ConnectionStatus::Connected
            .transition(EstablishEvent::StaleClientId)
            .unwrap();
        assert_eq!(status, ConnectionStatus::Connecting);
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(ConnectionStatus::Connected
            .transition(EstablishEvent::Retry)
            .is_err());
        assert!(ConnectionStatus::Connecting
            .transition(EstablishEvent::StaleClientId)
            .is_err());
        assert!(ConnectionStatus::Disconnected
            .transition(EstablishEvent::Disconnect)
            .is_err());

        let err = ConnectionStatus::Error
            .transition(EstablishEvent::ClientIdReceived)
            .unwrap_err();
        assert_eq!(err.current, ConnectionStatus::Error);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Connecting).unwrap(),
            "\"connecting\""
        );
        assert_eq!(ConnectionStatus::Disconnected.to_string(), "disconnected");
    }
}
