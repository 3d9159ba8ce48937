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

//! Mcpgate Core
//!
//! Protocol and domain types shared by the MCP connection gateway: the
//! control-plane message set, the connection status state machine, the
//! remote endpoint wire types and the retry policy used while acquiring
//! client IDs.

pub mod error;
pub mod protocol;
pub mod remote;
pub mod resilience;
pub mod status;

pub use error::GatewayError;
pub use protocol::{
    decode_control_message, new_connection_id, new_execution_id, ControlKind, ControlMessage,
    ProtocolViolation, ServerMessage,
};
pub use remote::{
    classify_invocation, is_stale_client_error, InvocationOutcome, RemoteEndpoint, RemoteError,
    SseKind, SseMessage, ToolInvocation, DEFAULT_STALE_CLIENT_MARKERS,
};
pub use resilience::RetryPolicy;
pub use status::{ConnectionStatus, EstablishEvent, InvalidTransition};
