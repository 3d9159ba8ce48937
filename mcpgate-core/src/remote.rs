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

//! Wire types for the remote MCP endpoint (`/info`, `/sse`, `/messages`).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error markers the remote uses when a client ID is missing or expired.
pub const DEFAULT_STALE_CLIENT_MARKERS: &[&str] = &["Missing clientId", "Invalid clientId"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
}

impl RemoteEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url(), path.trim_start_matches('/'))
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One event read off the remote `/sse` stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SseMessage {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SseKind {
    /// Session established; carries the client ID when the remote sent one.
    Connected(Option<String>),
    ToolResult(Value),
    Other,
}

impl SseMessage {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            id: None,
        }
    }

    /// The event data as JSON, falling back to a string for non-JSON data.
    pub fn payload(&self) -> Value {
        serde_json::from_str(&self.data).unwrap_or_else(|_| Value::String(self.data.clone()))
    }

    /// Classifies the event by its SSE event name or, for servers that only
    /// send unnamed events, by the `type` field of its JSON data.
    pub fn kind(&self) -> SseKind {
        let payload = self.payload();
        let name = match self.event.as_str() {
            "" | "message" => payload
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            other => other.to_string(),
        };

        match name.as_str() {
            "connected" => {
                let client_id = match &payload {
                    Value::String(s) => Some(s.trim().to_string()),
                    other => other
                        .get("client_id")
                        .or_else(|| other.get("clientId"))
                        .and_then(Value::as_str)
                        .map(String::from),
                };
                SseKind::Connected(client_id.filter(|id| !id.is_empty()))
            }
            "tool_result" => SseKind::ToolResult(payload),
            _ => SseKind::Other,
        }
    }

    /// Raw passthrough form relayed to the control plane.
    pub fn to_json(&self) -> Value {
        json!({
            "event": self.event,
            "data": self.payload(),
            "id": self.id,
        })
    }
}

/// Body of `POST /messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Execution ID assigned by the gateway.
    pub id: String,
    pub client_id: String,
    pub tool: String,
    pub parameters: Value,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("Request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("Remote returned HTTP {status}")]
    Status { status: u16, body: Value },

    #[error("Invalid response body: {0}")]
    InvalidBody(String),

    #[error("Event stream error: {0}")]
    Stream(String),
}

impl RemoteError {
    /// Structured context attached to `execute_error` notifications.
    pub fn details(&self) -> Option<Value> {
        match self {
            RemoteError::Status { status, body } => Some(json!({
                "status": status,
                "body": body,
            })),
            RemoteError::Timeout { timeout, .. } => Some(json!({
                "timeout_secs": timeout.as_secs(),
            })),
            _ => None,
        }
    }
}

/// True when a remote response body reports a missing or expired client ID.
pub fn is_stale_client_error<S: AsRef<str>>(body: &Value, markers: &[S]) -> bool {
    let message = match body.get("error") {
        Some(Value::String(s)) => s.as_str(),
        Some(Value::Object(obj)) => match obj.get("message").and_then(Value::as_str) {
            Some(s) => s,
            None => return false,
        },
        _ => return false,
    };

    let message = message.to_ascii_lowercase();
    markers
        .iter()
        .any(|marker| message.contains(&marker.as_ref().to_ascii_lowercase()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    Success(Value),
    StaleClient { error: String, details: Option<Value> },
    Failed { error: String, details: Option<Value> },
}

/// Interprets the result of `POST /messages`.
///
/// Some servers answer a stale client ID with a 2xx status and an `error`
/// body, so the body is inspected on both paths.
pub fn classify_invocation<S: AsRef<str>>(
    result: Result<Value, RemoteError>,
    markers: &[S],
) -> InvocationOutcome {
    match result {
        Ok(body) if is_stale_client_error(&body, markers) => InvocationOutcome::StaleClient {
            error: stale_reason(&body),
            details: Some(body),
        },
        Ok(body) => InvocationOutcome::Success(body),
        Err(err) => {
            let details = err.details();
            match err {
                RemoteError::Status { ref body, .. } if is_stale_client_error(body, markers) => {
                    InvocationOutcome::StaleClient {
                        error: stale_reason(body),
                        details,
                    }
                }
                other => InvocationOutcome::Failed {
                    error: other.to_string(),
                    details,
                },
            }
        }
    }
}

fn stale_reason(body: &Value) -> String {
    match body.get("error") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Client ID rejected")
            .to_string(),
        None => "Client ID rejected".to_string(),
    }
}
