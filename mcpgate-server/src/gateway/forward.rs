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

//! Tool execution forwarding.
//!
//! Executions are never retried. A rejected client ID triggers a fresh
//! establishment for the same connection and fails the current call; the
//! caller resubmits once `connected` arrives again.

use mcpgate_core::{
    classify_invocation, new_execution_id, ConnectionStatus, EstablishEvent, GatewayError,
    InvocationOutcome, RemoteEndpoint, RemoteError, ServerMessage, ToolInvocation,
};
use serde_json::Value;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

use super::{advance, cancel_timers, GatewayEvent, GatewayState, SocketId};

impl GatewayState {
    /// Endpoint and client ID of a connection the owner may use right now.
    fn ready_client_id(
        &self,
        owner: &str,
        connection_id: &str,
    ) -> Result<(RemoteEndpoint, String), GatewayError> {
        let record = self
            .store
            .get(connection_id)
            .ok_or_else(|| GatewayError::UnknownConnection(connection_id.to_string()))?;

        if record.owner_id != owner {
            return Err(GatewayError::NotOwner(connection_id.to_string()));
        }
        if record.status != ConnectionStatus::Connected {
            return Err(GatewayError::NotReady {
                connection_id: connection_id.to_string(),
                status: record.status,
            });
        }

        let client_id = record
            .usable_client_id()
            .ok_or_else(|| GatewayError::MissingClientId(connection_id.to_string()))?;

        Ok((record.endpoint.clone(), client_id.to_string()))
    }

    pub(super) fn execute_tool(
        &mut self,
        socket: SocketId,
        owner: &str,
        connection_id: String,
        tool: String,
        parameters: Value,
    ) {
        let (endpoint, client_id) = match self.ready_client_id(owner, &connection_id) {
            Ok(ready) => ready,
            Err(err) => {
                debug!(connection_id = %connection_id, tool = %tool, "Execution rejected: {}", err);
                self.stats
                    .executions_rejected
                    .fetch_add(1, Ordering::Relaxed);
                self.sockets.send(
                    socket,
                    ServerMessage::ExecuteError {
                        execution_id: None,
                        connection_id: Some(connection_id),
                        error: err.to_string(),
                        details: None,
                    },
                );
                return;
            }
        };

        let execution_id = new_execution_id();
        self.sockets.send(
            socket,
            ServerMessage::ExecuteStart {
                execution_id: execution_id.clone(),
                connection_id: connection_id.clone(),
                tool: tool.clone(),
                parameters: parameters.clone(),
            },
        );
        self.stats
            .executions_started
            .fetch_add(1, Ordering::Relaxed);
        info!(
            connection_id = %connection_id,
            execution_id = %execution_id,
            tool = %tool,
            "Forwarding tool call"
        );

        let invocation = ToolInvocation {
            id: execution_id.clone(),
            client_id: client_id.clone(),
            tool,
            parameters,
        };
        let transport = self.transport.clone();
        let events = self.events.clone();
        let timeout = self.config.execution_timeout();

        tokio::spawn(async move {
            let call = transport.invoke(&endpoint, &invocation);
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout {
                    url: endpoint.url("/messages"),
                    timeout,
                }),
            };

            let _ = events.send(GatewayEvent::ExecutionFinished {
                connection_id,
                execution_id,
                socket,
                client_id,
                result,
            });
        });
    }

    pub(super) fn on_execution_finished(
        &mut self,
        connection_id: String,
        execution_id: String,
        socket: SocketId,
        client_id: String,
        result: Result<Value, RemoteError>,
    ) {
        let Some(record) = self.store.get(&connection_id) else {
            debug!(
                connection_id = %connection_id,
                execution_id = %execution_id,
                "Discarding result for a closed connection"
            );
            return;
        };
        let still_current = record.status == ConnectionStatus::Connected
            && record.client_id.as_deref() == Some(client_id.as_str());
        let audience = record.audience(socket);

        match classify_invocation(result, &self.config.stale_client_markers) {
            InvocationOutcome::Success(result) => {
                debug!(execution_id = %execution_id, "Tool call completed");
                self.sockets.send(
                    socket,
                    ServerMessage::ExecuteResult {
                        execution_id,
                        connection_id,
                        result,
                    },
                );
            }
            InvocationOutcome::StaleClient { error, details } => {
                self.stats.executions_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    connection_id = %connection_id,
                    execution_id = %execution_id,
                    "Remote rejected client ID: {}",
                    error
                );

                // Only the first rejection of a given client ID reconnects.
                if still_current {
                    self.sockets.broadcast(
                        &audience,
                        ServerMessage::Reconnecting {
                            connection_id: connection_id.clone(),
                            message: "Client ID expired, reconnecting to MCP server".to_string(),
                        },
                    );
                }
                self.sockets.send(
                    socket,
                    ServerMessage::ExecuteError {
                        execution_id: Some(execution_id),
                        connection_id: Some(connection_id.clone()),
                        error: format!(
                            "Client ID expired ({}), reconnecting. Resubmit the tool call once connected.",
                            error
                        ),
                        details,
                    },
                );
                if still_current {
                    self.reestablish(&connection_id, socket);
                }
            }
            InvocationOutcome::Failed { error, details } => {
                self.stats.executions_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    connection_id = %connection_id,
                    execution_id = %execution_id,
                    "Tool call failed: {}",
                    error
                );
                self.sockets.send(
                    socket,
                    ServerMessage::ExecuteError {
                        execution_id: Some(execution_id),
                        connection_id: Some(connection_id),
                        error,
                        details,
                    },
                );
            }
        }
    }

    /// Drops the current session and client ID and runs establishment again
    /// under the same connection ID.
    fn reestablish(&mut self, connection_id: &str, socket: SocketId) {
        let Some(record) = self.store.get_mut(connection_id) else {
            return;
        };
        advance(record, EstablishEvent::StaleClientId);
        cancel_timers(&mut self.timers, record);
        record.client_id = None;
        record.attempt_count = 0;
        record.session = None;
        record.subscribe(socket);
        self.stats.reconnections.fetch_add(1, Ordering::Relaxed);

        info!(connection_id = %connection_id, endpoint = %record.endpoint, "Re-establishing session");
        self.start_establishment(connection_id);
    }

    pub(super) fn list_tools(&mut self, socket: SocketId, owner: &str, connection_id: String) {
        let (endpoint, _) = match self.ready_client_id(owner, &connection_id) {
            Ok(ready) => ready,
            Err(err) => {
                self.sockets.send(
                    socket,
                    ServerMessage::ToolsError {
                        connection_id: Some(connection_id),
                        error: err.to_string(),
                    },
                );
                return;
            }
        };

        let transport = self.transport.clone();
        let events = self.events.clone();
        let timeout = self.config.execution_timeout();

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.list_tools(&endpoint)).await
            {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout {
                    url: endpoint.url("/tools"),
                    timeout,
                }),
            };

            let _ = events.send(GatewayEvent::ToolsListed {
                connection_id,
                socket,
                result,
            });
        });
    }

    pub(super) fn on_tools_listed(
        &mut self,
        connection_id: String,
        socket: SocketId,
        result: Result<Value, RemoteError>,
    ) {
        if self.store.get(&connection_id).is_none() {
            return;
        }

        let reply = match result {
            Ok(tools) => ServerMessage::Tools {
                connection_id,
                tools,
            },
            Err(err) => {
                warn!(connection_id = %connection_id, "Listing tools failed: {}", err);
                ServerMessage::ToolsError {
                    connection_id: Some(connection_id),
                    error: err.to_string(),
                }
            }
        };
        self.sockets.send(socket, reply);
    }
}
