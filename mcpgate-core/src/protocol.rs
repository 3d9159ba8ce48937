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

//! Control-plane protocol spoken over the browser-facing socket.
//!
//! Every frame is a JSON object discriminated by its `type` field. Inbound
//! frames are decoded into [`ControlMessage`] at the socket boundary; anything
//! that does not fit is answered with a typed error built from
//! [`ProtocolViolation::into_reply`] and never reaches the gateway.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub fn new_connection_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn new_execution_id() -> String {
    format!("msg-{}", Uuid::new_v4())
}

/// Inbound control message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Connect {
        host: String,
        #[serde(deserialize_with = "port_number_or_string")]
        port: u16,
    },
    Disconnect {
        #[serde(alias = "connectionId")]
        connection_id: String,
    },
    ExecuteTool {
        #[serde(alias = "connectionId")]
        connection_id: String,
        tool: String,
        #[serde(default)]
        parameters: Value,
    },
    ListTools {
        #[serde(alias = "connectionId")]
        connection_id: String,
    },
}

impl ControlMessage {
    pub fn kind(&self) -> ControlKind {
        match self {
            ControlMessage::Connect { .. } => ControlKind::Connect,
            ControlMessage::Disconnect { .. } => ControlKind::Disconnect,
            ControlMessage::ExecuteTool { .. } => ControlKind::ExecuteTool,
            ControlMessage::ListTools { .. } => ControlKind::ListTools,
        }
    }

    fn normalize(self) -> Result<Self, String> {
        match self {
            ControlMessage::Connect { host, port } => {
                let host = host.trim().to_string();
                if host.is_empty() {
                    return Err("Host is required".to_string());
                }
                if port == 0 {
                    return Err("Port must be between 1 and 65535".to_string());
                }
                Ok(ControlMessage::Connect { host, port })
            }
            ControlMessage::Disconnect { connection_id } => {
                require_connection_id(&connection_id)?;
                Ok(ControlMessage::Disconnect { connection_id })
            }
            ControlMessage::ExecuteTool {
                connection_id,
                tool,
                parameters,
            } => {
                require_connection_id(&connection_id)?;
                if tool.trim().is_empty() {
                    return Err("Tool name is required".to_string());
                }
                let parameters = match parameters {
                    Value::Null => Value::Object(Map::new()),
                    Value::Object(map) => Value::Object(map),
                    _ => return Err("Parameters must be a JSON object".to_string()),
                };
                Ok(ControlMessage::ExecuteTool {
                    connection_id,
                    tool,
                    parameters,
                })
            }
            ControlMessage::ListTools { connection_id } => {
                require_connection_id(&connection_id)?;
                Ok(ControlMessage::ListTools { connection_id })
            }
        }
    }
}

fn require_connection_id(connection_id: &str) -> Result<(), String> {
    if connection_id.trim().is_empty() {
        return Err("Connection ID is required".to_string());
    }
    Ok(())
}

fn port_number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u64),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(n) => {
            u16::try_from(n).map_err(|_| D::Error::custom(format!("port {} out of range", n)))
        }
        Port::Text(s) => s
            .trim()
            .parse::<u16>()
            .map_err(|_| D::Error::custom(format!("invalid port '{}'", s))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Connect,
    Disconnect,
    ExecuteTool,
    ListTools,
}

impl ControlKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "connect" => Some(ControlKind::Connect),
            "disconnect" => Some(ControlKind::Disconnect),
            "execute_tool" => Some(ControlKind::ExecuteTool),
            "list_tools" => Some(ControlKind::ListTools),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ControlKind::Connect => "connect",
            ControlKind::Disconnect => "disconnect",
            ControlKind::ExecuteTool => "execute_tool",
            ControlKind::ListTools => "list_tools",
        }
    }
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound frame that could not be turned into a [`ControlMessage`].
///
/// Carries whatever context could be salvaged from the raw frame so the reply
/// can still name the host, port or connection it was about.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{reason}")]
pub struct ProtocolViolation {
    pub kind: Option<ControlKind>,
    pub reason: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub connection_id: Option<String>,
}

impl ProtocolViolation {
    fn new(kind: Option<ControlKind>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            host: None,
            port: None,
            connection_id: None,
        }
    }

    fn with_context(mut self, raw: &Value) -> Self {
        self.host = raw.get("host").and_then(Value::as_str).map(String::from);
        self.port = raw.get("port").and_then(|p| match p {
            Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });
        self.connection_id = raw
            .get("connection_id")
            .or_else(|| raw.get("connectionId"))
            .and_then(Value::as_str)
            .map(String::from);
        self
    }

    /// The error message sent back on the socket that sent the bad frame.
    pub fn into_reply(self) -> ServerMessage {
        match self.kind {
            Some(ControlKind::Connect) => ServerMessage::ConnectError {
                connection_id: None,
                error: self.reason,
                host: self.host,
                port: self.port,
            },
            Some(ControlKind::Disconnect) => ServerMessage::DisconnectError {
                connection_id: self.connection_id,
                error: self.reason,
            },
            Some(ControlKind::ExecuteTool) => ServerMessage::ExecuteError {
                execution_id: None,
                connection_id: self.connection_id,
                error: self.reason,
                details: None,
            },
            Some(ControlKind::ListTools) => ServerMessage::ToolsError {
                connection_id: self.connection_id,
                error: self.reason,
            },
            None => ServerMessage::Error { error: self.reason },
        }
    }
}

/// Decode and validate one inbound text frame.
pub fn decode_control_message(text: &str) -> Result<ControlMessage, ProtocolViolation> {
    let raw: Value = serde_json::from_str(text)
        .map_err(|e| ProtocolViolation::new(None, format!("Invalid JSON: {}", e)))?;

    let kind = match raw.get("type") {
        Some(Value::String(name)) => ControlKind::parse(name).ok_or_else(|| {
            ProtocolViolation::new(None, format!("Unknown message type '{}'", name))
        })?,
        Some(_) => return Err(ProtocolViolation::new(None, "Message type must be a string")),
        None => return Err(ProtocolViolation::new(None, "Missing message type")),
    };

    let message = ControlMessage::deserialize(&raw).map_err(|e| {
        ProtocolViolation::new(Some(kind), format!("Invalid {} message: {}", kind, e))
            .with_context(&raw)
    })?;

    message
        .normalize()
        .map_err(|reason| ProtocolViolation::new(Some(kind), reason).with_context(&raw))
}

/// Outbound notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connecting {
        connection_id: String,
        host: String,
        port: u16,
    },
    Connected {
        connection_id: String,
        client_id: String,
        host: String,
        port: u16,
    },
    ConnectError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    Reconnecting {
        connection_id: String,
        message: String,
    },
    Disconnected {
        connection_id: String,
    },
    DisconnectError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        error: String,
    },
    ExecuteStart {
        execution_id: String,
        connection_id: String,
        tool: String,
        parameters: Value,
    },
    ExecuteResult {
        execution_id: String,
        connection_id: String,
        result: Value,
    },
    ExecuteError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    SseEvent {
        connection_id: String,
        event: Value,
    },
    ToolResult {
        connection_id: String,
        result: Value,
    },
    ConnectionError {
        connection_id: String,
        error: String,
    },
    Tools {
        connection_id: String,
        tools: Value,
    },
    ToolsError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        error: String,
    },
    Error {
        error: String,
    },
}

impl ServerMessage {
    /// Connection this notification refers to, if any.
    pub fn connection_id(&self) -> Option<&str> {
        match self {
            ServerMessage::Connecting { connection_id, .. }
            | ServerMessage::Connected { connection_id, .. }
            | ServerMessage::Reconnecting { connection_id, .. }
            | ServerMessage::Disconnected { connection_id }
            | ServerMessage::ExecuteStart { connection_id, .. }
            | ServerMessage::ExecuteResult { connection_id, .. }
            | ServerMessage::SseEvent { connection_id, .. }
            | ServerMessage::ToolResult { connection_id, .. }
            | ServerMessage::ConnectionError { connection_id, .. }
            | ServerMessage::Tools { connection_id, .. } => Some(connection_id),
            ServerMessage::ConnectError { connection_id, .. }
            | ServerMessage::DisconnectError { connection_id, .. }
            | ServerMessage::ExecuteError { connection_id, .. }
            | ServerMessage::ToolsError { connection_id, .. } => connection_id.as_deref(),
            ServerMessage::Error { .. } => None,
        }
    }
}
