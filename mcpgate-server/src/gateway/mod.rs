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

//! Gateway Actor - multiplexes control-plane sockets onto remote MCP sessions
//!
//! A single task owns the connection store. Sockets talk to it through a
//! [`GatewayHandle`]; every remote call runs in its own task and reports back
//! as a [`GatewayEvent`], so the store is only ever touched from one place.
//!
//! ## Architecture
//!
//! ```text
//! WebSocket ─► GatewayHandle ─► commands ─┐
//!                                         ▼
//!     probe / SSE / POST tasks ─► events ─► Gateway loop ◄─ DelayQueue timers
//!                                         │
//!         per-socket outbound channel ◄───┘
//! ```
//!
//! ## Timeouts
//!
//! - liveness probe: 3s, no retry
//! - client ID acquisition: 8s per attempt, 3 attempts with backoff
//! - tool execution: 10s, never retried

mod establish;
mod forward;
mod session;
mod store;


use chrono::Utc;
use futures::StreamExt;
use mcpgate_core::{
    ControlMessage, EstablishEvent, GatewayError, RemoteEndpoint, RemoteError, RetryPolicy,
    ServerMessage, SseMessage,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::transport::RemoteTransport;
use store::{ConnectionRecord, ConnectionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub u64);

/// One registered control-plane socket.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    id: SocketId,
    owner: String,
}

impl SocketHandle {
    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

enum Command {
    Register {
        socket: SocketId,
        owner: String,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    },
    Control {
        socket: SocketId,
        message: ControlMessage,
    },
    Close {
        socket: SocketId,
    },
}

/// Completion of a remote operation, delivered back to the gateway loop.
#[derive(Debug)]
pub(crate) enum GatewayEvent {
    ProbeFinished {
        connection_id: String,
        generation: u64,
        purpose: ProbePurpose,
        result: Result<(), RemoteError>,
    },
    Stream {
        connection_id: String,
        generation: u64,
        update: StreamUpdate,
    },
    ExecutionFinished {
        connection_id: String,
        execution_id: String,
        socket: SocketId,
        client_id: String,
        result: Result<Value, RemoteError>,
    },
    ToolsListed {
        connection_id: String,
        socket: SocketId,
        result: Result<Value, RemoteError>,
    },
}

#[derive(Debug)]
pub(crate) enum ProbePurpose {
    /// First step of (re-)establishment.
    Establish,
    /// A second connect for a triple that already has a record.
    Reuse {
        socket: SocketId,
        endpoint: RemoteEndpoint,
    },
    HealthCheck,
}

#[derive(Debug)]
pub(crate) enum StreamUpdate {
    Message(SseMessage),
    Failed(RemoteError),
    Ended,
}

#[derive(Debug, Clone)]
enum TimerKind {
    Acquisition(String),
    Backoff(String),
    HealthCheck(String),
}

/// Statistics for the gateway.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GatewayStats {
    pub open_sockets: u64,
    pub active_connections: u64,
    pub open_sessions: u64,
    pub sessions_opened: u64,
    pub connections_established: u64,
    pub acquisition_failures: u64,
    pub reconnections: u64,
    pub executions_started: u64,
    pub executions_failed: u64,
    pub executions_rejected: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug)]
pub(crate) struct GatewayStatsInternal {
    open_sockets: AtomicU64,
    active_connections: AtomicU64,
    open_sessions: AtomicU64,
    sessions_opened: AtomicU64,
    connections_established: AtomicU64,
    acquisition_failures: AtomicU64,
    reconnections: AtomicU64,
    executions_started: AtomicU64,
    executions_failed: AtomicU64,
    executions_rejected: AtomicU64,
    start_time: Instant,
}

impl GatewayStatsInternal {
    fn new() -> Self {
        Self {
            open_sockets: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            open_sessions: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            acquisition_failures: AtomicU64::new(0),
            reconnections: AtomicU64::new(0),
            executions_started: AtomicU64::new(0),
            executions_failed: AtomicU64::new(0),
            executions_rejected: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn snapshot(&self) -> GatewayStats {
        GatewayStats {
            open_sockets: self.open_sockets.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            open_sessions: self.open_sessions.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            acquisition_failures: self.acquisition_failures.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            executions_started: self.executions_started.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            executions_rejected: self.executions_rejected.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

/// Handle to interact with the gateway.
#[derive(Clone)]
pub struct GatewayHandle {
    commands: mpsc::Sender<Command>,
    next_socket: Arc<AtomicU64>,
    stats: Arc<GatewayStatsInternal>,
}

impl GatewayHandle {
    /// Register a control-plane socket for `owner`. The receiver yields every
    /// notification addressed to it.
    pub async fn open_socket(
        &self,
        owner: impl Into<String>,
    ) -> Result<(SocketHandle, mpsc::UnboundedReceiver<ServerMessage>), GatewayError> {
        let id = SocketId(self.next_socket.fetch_add(1, Ordering::Relaxed));
        let owner = owner.into();
        let (outbound, receiver) = mpsc::unbounded_channel();

        self.commands
            .send(Command::Register {
                socket: id,
                owner: owner.clone(),
                outbound,
            })
            .await
            .map_err(|_| GatewayError::Unavailable)?;

        Ok((SocketHandle { id, owner }, receiver))
    }

    /// Submit a decoded control message. Messages from one socket are handled
    /// in the order they are dispatched.
    pub async fn dispatch(
        &self,
        socket: &SocketHandle,
        message: ControlMessage,
    ) -> Result<(), GatewayError> {
        self.commands
            .send(Command::Control {
                socket: socket.id,
                message,
            })
            .await
            .map_err(|_| GatewayError::Unavailable)
    }

    /// Unregister the socket and tear down every connection its owner holds.
    pub async fn close_socket(&self, socket: SocketHandle) -> Result<(), GatewayError> {
        self.commands
            .send(Command::Close { socket: socket.id })
            .await
            .map_err(|_| GatewayError::Unavailable)
    }

    pub fn stats(&self) -> GatewayStats {
        self.stats.snapshot()
    }
}

/// The gateway - runs as a background task.
pub struct Gateway {
    config: GatewayConfig,
    transport: Arc<dyn RemoteTransport>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, transport: Arc<dyn RemoteTransport>) -> Self {
        Self { config, transport }
    }

    /// Spawn the gateway loop and return a handle for communication.
    pub fn spawn(self) -> GatewayHandle {
        let (commands, command_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (events, event_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(GatewayStatsInternal::new());

        let state = GatewayState {
            policy: self.config.retry_policy(),
            config: self.config,
            transport: self.transport,
            store: ConnectionStore::new(),
            sockets: Sockets::default(),
            timers: DelayQueue::new(),
            events,
            stats: stats.clone(),
        };

        tokio::spawn(state.run(command_rx, event_rx));

        GatewayHandle {
            commands,
            next_socket: Arc::new(AtomicU64::new(1)),
            stats,
        }
    }
}

struct SocketEntry {
    owner: String,
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

#[derive(Default)]
struct Sockets(HashMap<SocketId, SocketEntry>);

impl Sockets {
    fn send(&self, socket: SocketId, message: ServerMessage) {
        match self.0.get(&socket) {
            Some(entry) => {
                if entry.outbound.send(message).is_err() {
                    debug!("Outbound channel closed for socket {:?}", socket);
                }
            }
            None => debug!("Dropping notification for closed socket {:?}", socket),
        }
    }

    fn broadcast(&self, sockets: &[SocketId], message: ServerMessage) {
        for socket in sockets {
            self.send(*socket, message.clone());
        }
    }

    fn owner(&self, socket: SocketId) -> Option<String> {
        self.0.get(&socket).map(|entry| entry.owner.clone())
    }
}

/// State owned by the gateway task.
pub(crate) struct GatewayState {
    config: GatewayConfig,
    policy: RetryPolicy,
    transport: Arc<dyn RemoteTransport>,
    store: ConnectionStore,
    sockets: Sockets,
    timers: DelayQueue<TimerKind>,
    events: mpsc::UnboundedSender<GatewayEvent>,
    stats: Arc<GatewayStatsInternal>,
}

impl GatewayState {
    /// Main loop.
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<GatewayEvent>,
    ) {
        info!(
            "Gateway started (probe={}s, acquisition={}s x{}, execution={}s)",
            self.config.probe_timeout_secs,
            self.config.acquisition_timeout_secs,
            self.config.max_attempts,
            self.config.execution_timeout_secs
        );

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
                Some(expired) = self.timers.next(), if !self.timers.is_empty() => {
                    let key = expired.key();
                    self.handle_timer(key, expired.into_inner());
                }
            }

            self.stats
                .active_connections
                .store(self.store.len() as u64, Ordering::Relaxed);
        }

        let remaining = self.store.drain();
        info!(
            "Gateway shutting down, closing {} connection(s)",
            remaining.len()
        );
        drop(remaining);
        self.stats.active_connections.store(0, Ordering::Relaxed);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register {
                socket,
                owner,
                outbound,
            } => {
                debug!("Socket {:?} registered for owner {}", socket, owner);
                self.sockets.0.insert(socket, SocketEntry { owner, outbound });
                self.stats.open_sockets.fetch_add(1, Ordering::Relaxed);
            }
            Command::Control { socket, message } => {
                let Some(owner) = self.sockets.owner(socket) else {
                    warn!("Control message from unregistered socket {:?}", socket);
                    return;
                };

                match message {
                    ControlMessage::Connect { host, port } => {
                        self.connect(socket, owner, RemoteEndpoint::new(host, port))
                    }
                    ControlMessage::Disconnect { connection_id } => {
                        self.disconnect(socket, &owner, connection_id)
                    }
                    ControlMessage::ExecuteTool {
                        connection_id,
                        tool,
                        parameters,
                    } => self.execute_tool(socket, &owner, connection_id, tool, parameters),
                    ControlMessage::ListTools { connection_id } => {
                        self.list_tools(socket, &owner, connection_id)
                    }
                }
            }
            Command::Close { socket } => self.close_socket(socket),
        }
    }

    fn handle_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::ProbeFinished {
                connection_id,
                generation,
                purpose,
                result,
            } => self.on_probe_finished(connection_id, generation, purpose, result),
            GatewayEvent::Stream {
                connection_id,
                generation,
                update,
            } => self.on_stream_update(connection_id, generation, update),
            GatewayEvent::ExecutionFinished {
                connection_id,
                execution_id,
                socket,
                client_id,
                result,
            } => self.on_execution_finished(connection_id, execution_id, socket, client_id, result),
            GatewayEvent::ToolsListed {
                connection_id,
                socket,
                result,
            } => self.on_tools_listed(connection_id, socket, result),
        }
    }

    fn handle_timer(&mut self, key: delay_queue::Key, timer: TimerKind) {
        match timer {
            TimerKind::Acquisition(connection_id) => self.on_acquisition_timeout(&connection_id, key),
            TimerKind::Backoff(connection_id) => self.on_backoff_elapsed(&connection_id, key),
            TimerKind::HealthCheck(connection_id) => self.on_health_timer(&connection_id, key),
        }
    }

    fn disconnect(&mut self, socket: SocketId, owner: &str, connection_id: String) {
        let error = match self.store.get(&connection_id) {
            None => Some(GatewayError::UnknownConnection(connection_id.clone())),
            Some(record) if record.owner_id != owner => {
                Some(GatewayError::NotOwner(connection_id.clone()))
            }
            Some(_) => None,
        };

        if let Some(error) = error {
            self.sockets.send(
                socket,
                ServerMessage::DisconnectError {
                    connection_id: Some(connection_id),
                    error: error.to_string(),
                },
            );
            return;
        }

        let audience = match self.remove_record(&connection_id) {
            Some(record) => {
                let connected_secs = record
                    .established_at
                    .map(|at| (Utc::now() - at).num_seconds());
                info!(
                    connection_id = %connection_id,
                    endpoint = %record.endpoint,
                    connected_secs = ?connected_secs,
                    "Connection closed by client"
                );
                record.audience(socket)
            }
            None => vec![socket],
        };
        self.sockets
            .broadcast(&audience, ServerMessage::Disconnected { connection_id });
    }

    fn close_socket(&mut self, socket: SocketId) {
        let Some(entry) = self.sockets.0.remove(&socket) else {
            return;
        };
        self.stats.open_sockets.fetch_sub(1, Ordering::Relaxed);

        let owned = self.store.list_by_owner(&entry.owner);
        for connection_id in &owned {
            if let Some(record) = self.remove_record(connection_id) {
                let others: Vec<SocketId> = record
                    .subscribers
                    .iter()
                    .copied()
                    .filter(|s| *s != socket)
                    .collect();
                self.sockets.broadcast(
                    &others,
                    ServerMessage::Disconnected {
                        connection_id: connection_id.clone(),
                    },
                );
            }
        }

        info!(
            "Socket {:?} closed, removed {} connection(s) for owner {}",
            socket,
            owned.len(),
            entry.owner
        );
    }

    /// Removes the record, cancels its timers and closes its stream.
    fn remove_record(&mut self, connection_id: &str) -> Option<ConnectionRecord> {
        let mut record = self.store.remove(connection_id)?;
        cancel_timers(&mut self.timers, &mut record);
        record.session = None;
        advance(&mut record, EstablishEvent::Disconnect);
        Some(record)
    }
}

/// Applies a state machine event, leaving the status unchanged if the
/// transition is not allowed.
fn advance(record: &mut ConnectionRecord, event: EstablishEvent) {
    match record.status.transition(event) {
        Ok(next) => record.status = next,
        Err(err) => warn!(connection_id = %record.connection_id, "{}", err),
    }
}

fn cancel_timers(timers: &mut DelayQueue<TimerKind>, record: &mut ConnectionRecord) {
    for key in [
        record.acquisition_timer.take(),
        record.backoff_timer.take(),
        record.health_timer.take(),
    ]
    .into_iter()
    .flatten()
    {
        let _ = timers.try_remove(&key);
    }
}
