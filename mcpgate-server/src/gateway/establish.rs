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

//! Session establishment: liveness probe, SSE stream, client ID acquisition
//! with bounded retries, and the periodic re-probe of live sessions.

use chrono::Utc;
use mcpgate_core::{
    ConnectionStatus, EstablishEvent, RemoteEndpoint, RemoteError, ServerMessage, SseKind,
};
use std::sync::atomic::Ordering;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, warn};

use super::session::SessionHandle;
use super::store::{ConnectionRecord, Entry};
use super::{
    advance, GatewayEvent, GatewayState, ProbePurpose, SocketId, StreamUpdate, TimerKind,
};
use crate::config::GatewayConfig;

impl GatewayState {
    pub(super) fn connect(&mut self, socket: SocketId, owner: String, endpoint: RemoteEndpoint) {
        match self.store.create(&owner, &endpoint, socket) {
            Entry::Created(connection_id) => {
                info!(
                    connection_id = %connection_id,
                    endpoint = %endpoint,
                    owner = %owner,
                    "Establishing MCP connection"
                );
                self.start_establishment(&connection_id);
            }
            Entry::Existing(connection_id) => {
                debug!(
                    connection_id = %connection_id,
                    endpoint = %endpoint,
                    "Connection exists, re-checking liveness before reuse"
                );
                self.spawn_probe(
                    connection_id,
                    0,
                    endpoint.clone(),
                    ProbePurpose::Reuse { socket, endpoint },
                );
            }
        }
    }

    /// Probe, then open a fresh session. Used for new records and after the
    /// remote rejected a client ID.
    pub(super) fn start_establishment(&mut self, connection_id: &str) {
        let Some(record) = self.store.get_mut(connection_id) else {
            return;
        };
        record.generation += 1;
        record.probing = true;
        let generation = record.generation;
        let endpoint = record.endpoint.clone();

        self.spawn_probe(
            connection_id.to_string(),
            generation,
            endpoint,
            ProbePurpose::Establish,
        );
    }

    pub(super) fn spawn_probe(
        &self,
        connection_id: String,
        generation: u64,
        endpoint: RemoteEndpoint,
        purpose: ProbePurpose,
    ) {
        let transport = self.transport.clone();
        let events = self.events.clone();
        let timeout = self.config.probe_timeout();

        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.probe(&endpoint)).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout {
                    url: endpoint.url("/info"),
                    timeout,
                }),
            };

            let _ = events.send(GatewayEvent::ProbeFinished {
                connection_id,
                generation,
                purpose,
                result,
            });
        });
    }

    pub(super) fn on_probe_finished(
        &mut self,
        connection_id: String,
        generation: u64,
        purpose: ProbePurpose,
        result: Result<(), RemoteError>,
    ) {
        match purpose {
            ProbePurpose::Establish => self.on_establish_probe(connection_id, generation, result),
            ProbePurpose::Reuse { socket, endpoint } => {
                self.on_reuse_probe(connection_id, socket, endpoint, result)
            }
            ProbePurpose::HealthCheck => self.on_health_probe(connection_id, generation, result),
        }
    }

    fn on_establish_probe(
        &mut self,
        connection_id: String,
        generation: u64,
        result: Result<(), RemoteError>,
    ) {
        let Some(record) = self.store.get_mut(&connection_id) else {
            debug!(connection_id = %connection_id, "Probe finished for removed connection");
            return;
        };
        if record.generation != generation {
            return;
        }
        record.probing = false;
        let subscribers = record.subscribers.clone();
        let endpoint = record.endpoint.clone();

        match result {
            Ok(()) => {
                self.sockets.broadcast(
                    &subscribers,
                    ServerMessage::Connecting {
                        connection_id: connection_id.clone(),
                        host: endpoint.host,
                        port: endpoint.port,
                    },
                );
                self.open_session(&connection_id);
            }
            Err(err) => {
                advance(record, EstablishEvent::ProbeFailed);
                warn!(
                    connection_id = %connection_id,
                    endpoint = %endpoint,
                    "Liveness probe failed: {}",
                    err
                );
                self.remove_record(&connection_id);
                self.sockets.broadcast(
                    &subscribers,
                    ServerMessage::ConnectError {
                        connection_id: Some(connection_id),
                        error: format!("MCP server at {} is unreachable: {}", endpoint, err),
                        host: Some(endpoint.host),
                        port: Some(endpoint.port),
                    },
                );
            }
        }
    }

    fn on_reuse_probe(
        &mut self,
        connection_id: String,
        socket: SocketId,
        endpoint: RemoteEndpoint,
        result: Result<(), RemoteError>,
    ) {
        let Some(owner) = self.sockets.owner(socket) else {
            return;
        };
        let Some(record) = self.store.get_mut(&connection_id) else {
            // Torn down while we were probing; start over for this requester.
            self.connect(socket, owner, endpoint);
            return;
        };

        match result {
            Ok(()) => {
                // A still-pending establishment answers this requester too.
                record.subscribe(socket);
                let reply = match (record.status, record.client_id.clone()) {
                    (ConnectionStatus::Connected, Some(client_id)) => ServerMessage::Connected {
                        connection_id: connection_id.clone(),
                        client_id,
                        host: endpoint.host.clone(),
                        port: endpoint.port,
                    },
                    _ => ServerMessage::Connecting {
                        connection_id: connection_id.clone(),
                        host: endpoint.host.clone(),
                        port: endpoint.port,
                    },
                };
                info!(
                    connection_id = %connection_id,
                    endpoint = %endpoint,
                    status = %record.status,
                    "Reusing existing connection"
                );
                self.sockets.send(socket, reply);
            }
            Err(err) => {
                let was_connected = record.status == ConnectionStatus::Connected;
                advance(record, EstablishEvent::ProbeFailed);
                let others: Vec<SocketId> = record
                    .subscribers
                    .iter()
                    .copied()
                    .filter(|s| *s != socket)
                    .collect();
                warn!(
                    connection_id = %connection_id,
                    endpoint = %endpoint,
                    "Existing connection failed liveness re-check: {}",
                    err
                );
                self.remove_record(&connection_id);

                let connect_error = ServerMessage::ConnectError {
                    connection_id: Some(connection_id.clone()),
                    error: format!("MCP server at {} is unreachable: {}", endpoint, err),
                    host: Some(endpoint.host),
                    port: Some(endpoint.port),
                };
                // Subscribers still waiting on establishment get the same
                // terminal error as the requester.
                if was_connected {
                    self.sockets
                        .broadcast(&others, ServerMessage::Disconnected { connection_id });
                } else {
                    self.sockets.broadcast(&others, connect_error.clone());
                }
                self.sockets.send(socket, connect_error);
            }
        }
    }

    /// Opens a new SSE stream for the record, replacing any previous one, and
    /// arms the acquisition timer.
    fn open_session(&mut self, connection_id: &str) {
        let Some(record) = self.store.get_mut(connection_id) else {
            return;
        };
        record.generation += 1;
        record.session = None;

        let stream = self.transport.open_stream(&record.endpoint);
        record.session = Some(SessionHandle::spawn(
            connection_id.to_string(),
            record.generation,
            stream,
            self.events.clone(),
            self.stats.clone(),
        ));

        if let Some(key) = record.acquisition_timer.take() {
            let _ = self.timers.try_remove(&key);
        }
        record.acquisition_timer = Some(self.timers.insert(
            TimerKind::Acquisition(connection_id.to_string()),
            self.config.acquisition_timeout(),
        ));

        debug!(
            connection_id = %connection_id,
            attempt = record.attempt_count + 1,
            max_attempts = self.policy.max_attempts,
            "SSE stream opened, waiting for client ID"
        );
    }

    pub(super) fn on_stream_update(
        &mut self,
        connection_id: String,
        generation: u64,
        update: StreamUpdate,
    ) {
        let Some(record) = self.store.get(&connection_id) else {
            return;
        };
        if record.generation != generation {
            debug!(connection_id = %connection_id, "Dropping event from a replaced stream");
            return;
        }
        let subscribers = record.subscribers.clone();

        match update {
            StreamUpdate::Message(message) => {
                self.sockets.broadcast(
                    &subscribers,
                    ServerMessage::SseEvent {
                        connection_id: connection_id.clone(),
                        event: message.to_json(),
                    },
                );

                match message.kind() {
                    SseKind::Connected(Some(client_id)) => {
                        self.on_client_id(&connection_id, client_id)
                    }
                    SseKind::Connected(None) => warn!(
                        connection_id = %connection_id,
                        "Received connected event without a client ID"
                    ),
                    SseKind::ToolResult(result) => self.sockets.broadcast(
                        &subscribers,
                        ServerMessage::ToolResult {
                            connection_id,
                            result,
                        },
                    ),
                    SseKind::Other => {}
                }
            }
            StreamUpdate::Failed(err) => self.on_stream_lost(&connection_id, err.to_string()),
            StreamUpdate::Ended => {
                self.on_stream_lost(&connection_id, "Event stream closed by remote".to_string())
            }
        }
    }

    fn on_client_id(&mut self, connection_id: &str, client_id: String) {
        let Some(record) = self.store.get_mut(connection_id) else {
            return;
        };
        if let Some(key) = record.acquisition_timer.take() {
            let _ = self.timers.try_remove(&key);
        }

        let newly_established = record.status == ConnectionStatus::Connecting;
        advance(record, EstablishEvent::ClientIdReceived);
        if record.status != ConnectionStatus::Connected {
            return;
        }

        record.client_id = Some(client_id.clone());
        record.established_at.get_or_insert_with(Utc::now);

        if newly_established {
            self.stats
                .connections_established
                .fetch_add(1, Ordering::Relaxed);
            arm_health_check(&mut self.timers, &self.config, record);
            info!(
                connection_id = %connection_id,
                endpoint = %record.endpoint,
                attempt = record.attempt_count + 1,
                "Client ID acquired"
            );
        } else {
            info!(connection_id = %connection_id, "Remote issued a new client ID");
        }

        self.sockets.broadcast(
            &record.subscribers,
            ServerMessage::Connected {
                connection_id: connection_id.to_string(),
                client_id,
                host: record.endpoint.host.clone(),
                port: record.endpoint.port,
            },
        );
    }

    fn on_stream_lost(&mut self, connection_id: &str, reason: String) {
        let Some(record) = self.store.get_mut(connection_id) else {
            return;
        };
        record.session = None;

        if record.status == ConnectionStatus::Connected && record.client_id.is_some() {
            // The execution path detects and repairs a dead client ID.
            advance(record, EstablishEvent::StreamLost);
            warn!(
                connection_id = %connection_id,
                "Event stream lost after establishment: {}",
                reason
            );
            self.sockets.broadcast(
                &record.subscribers,
                ServerMessage::ConnectionError {
                    connection_id: connection_id.to_string(),
                    error: reason,
                },
            );
        } else {
            self.fail_attempt(connection_id, reason);
        }
    }

    pub(super) fn on_acquisition_timeout(&mut self, connection_id: &str, key: delay_queue::Key) {
        let Some(record) = self.store.get_mut(connection_id) else {
            return;
        };
        if record.acquisition_timer.as_ref() != Some(&key) {
            return;
        }
        record.acquisition_timer = None;

        let reason = format!(
            "No client ID received within {}s",
            self.config.acquisition_timeout_secs
        );
        self.fail_attempt(connection_id, reason);
    }

    /// Closes the stream and either schedules a retry or gives up.
    fn fail_attempt(&mut self, connection_id: &str, reason: String) {
        let Some(record) = self.store.get_mut(connection_id) else {
            return;
        };
        if let Some(key) = record.acquisition_timer.take() {
            let _ = self.timers.try_remove(&key);
        }
        record.session = None;
        record.generation += 1;
        record.attempt_count += 1;
        self.stats
            .acquisition_failures
            .fetch_add(1, Ordering::Relaxed);
        advance(record, EstablishEvent::AttemptFailed);

        let attempts = record.attempt_count;
        match self.policy.next_delay(attempts) {
            Some(delay) => {
                info!(
                    connection_id = %connection_id,
                    attempt = attempts,
                    max_attempts = self.policy.max_attempts,
                    "Client ID acquisition failed ({}), retrying in {:?}",
                    reason,
                    delay
                );
                record.backoff_timer = Some(
                    self.timers
                        .insert(TimerKind::Backoff(connection_id.to_string()), delay),
                );
            }
            None => {
                let subscribers = record.subscribers.clone();
                let endpoint = record.endpoint.clone();
                warn!(
                    connection_id = %connection_id,
                    endpoint = %endpoint,
                    attempts,
                    "Giving up on client ID acquisition: {}",
                    reason
                );
                self.remove_record(connection_id);
                self.sockets.broadcast(
                    &subscribers,
                    ServerMessage::ConnectError {
                        connection_id: Some(connection_id.to_string()),
                        error: format!(
                            "Failed to obtain a client ID from {} after {} attempts: {}",
                            endpoint, attempts, reason
                        ),
                        host: Some(endpoint.host),
                        port: Some(endpoint.port),
                    },
                );
            }
        }
    }

    pub(super) fn on_backoff_elapsed(&mut self, connection_id: &str, key: delay_queue::Key) {
        let Some(record) = self.store.get_mut(connection_id) else {
            return;
        };
        if record.backoff_timer.as_ref() != Some(&key) {
            return;
        }
        record.backoff_timer = None;
        advance(record, EstablishEvent::Retry);

        // Liveness was already established for this cycle; go straight to SSE.
        self.open_session(connection_id);
    }

    pub(super) fn on_health_timer(&mut self, connection_id: &str, key: delay_queue::Key) {
        let Some(record) = self.store.get_mut(connection_id) else {
            return;
        };
        if record.health_timer.as_ref() != Some(&key) {
            return;
        }
        record.health_timer = None;
        if record.status != ConnectionStatus::Connected || record.probing {
            return;
        }

        let generation = record.generation;
        let endpoint = record.endpoint.clone();
        self.spawn_probe(
            connection_id.to_string(),
            generation,
            endpoint,
            ProbePurpose::HealthCheck,
        );
    }

    fn on_health_probe(
        &mut self,
        connection_id: String,
        generation: u64,
        result: Result<(), RemoteError>,
    ) {
        let Some(record) = self.store.get_mut(&connection_id) else {
            return;
        };
        if record.generation != generation || record.status != ConnectionStatus::Connected {
            return;
        }

        match result {
            Ok(()) => arm_health_check(&mut self.timers, &self.config, record),
            Err(err) => {
                advance(record, EstablishEvent::ProbeFailed);
                let subscribers = record.subscribers.clone();
                let endpoint = record.endpoint.clone();
                warn!(
                    connection_id = %connection_id,
                    endpoint = %endpoint,
                    "Connected MCP server stopped responding: {}",
                    err
                );
                self.remove_record(&connection_id);
                self.sockets.broadcast(
                    &subscribers,
                    ServerMessage::ConnectionError {
                        connection_id: connection_id.clone(),
                        error: format!("MCP server at {} stopped responding: {}", endpoint, err),
                    },
                );
                self.sockets
                    .broadcast(&subscribers, ServerMessage::Disconnected { connection_id });
            }
        }
    }
}

fn arm_health_check(
    timers: &mut DelayQueue<TimerKind>,
    config: &GatewayConfig,
    record: &mut ConnectionRecord,
) {
    let Some(interval) = config.health_check_interval() else {
        return;
    };
    if let Some(key) = record.health_timer.take() {
        let _ = timers.try_remove(&key);
    }
    record.health_timer = Some(timers.insert(
        TimerKind::HealthCheck(record.connection_id.clone()),
        interval,
    ));
}
