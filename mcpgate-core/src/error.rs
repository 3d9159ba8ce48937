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

use crate::status::ConnectionStatus;
use thiserror::Error;

/// Errors raised by the gateway before any remote call is made.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Connection {0} not found")]
    UnknownConnection(String),

    #[error("Connection {0} belongs to another user")]
    NotOwner(String),

    #[error("Connection {connection_id} is not ready (status: {status})")]
    NotReady {
        connection_id: String,
        status: ConnectionStatus,
    },

    #[error("Connection {0} has no client ID")]
    MissingClientId(String),

    #[error("Gateway is not running")]
    Unavailable,
}
