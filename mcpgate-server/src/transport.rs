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

//! HTTP side of the gateway: talks to remote MCP endpoints.
//!
//! The gateway owns every timeout; implementations only need to perform the
//! request. Long-lived SSE streams must therefore not carry a total request
//! timeout.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use mcpgate_core::{RemoteEndpoint, RemoteError, SseMessage, ToolInvocation};
use reqwest::header::ACCEPT;
use reqwest_eventsource::{retry, Event, EventSource};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Events of one SSE session. Ends after the first error.
pub type EventStream = BoxStream<'static, Result<SseMessage, RemoteError>>;

#[async_trait]
pub trait RemoteTransport: Send + Sync + 'static {
    /// `GET /info`; any 2xx means alive.
    async fn probe(&self, endpoint: &RemoteEndpoint) -> Result<(), RemoteError>;

    /// `GET /sse`. Connection errors surface as the first stream item.
    fn open_stream(&self, endpoint: &RemoteEndpoint) -> EventStream;

    /// `POST /messages`
    async fn invoke(
        &self,
        endpoint: &RemoteEndpoint,
        invocation: &ToolInvocation,
    ) -> Result<Value, RemoteError>;

    /// `GET /tools`
    async fn list_tools(&self, endpoint: &RemoteEndpoint) -> Result<Value, RemoteError>;
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| RemoteError::Request {
                url: String::new(),
                message: e.to_string(),
            })?;

        Ok(Self { client })
    }

    async fn read_json(url: &str, response: reqwest::Response) -> Result<Value, RemoteError> {
        let status = response.status();
        let text = response.text().await.map_err(|e| request_error(url, e))?;

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(body)
    }
}

fn request_error(url: &str, err: reqwest::Error) -> RemoteError {
    RemoteError::Request {
        url: url.to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn probe(&self, endpoint: &RemoteEndpoint) -> Result<(), RemoteError> {
        let url = endpoint.url("/info");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body: Value::Null,
            });
        }

        Ok(())
    }

    fn open_stream(&self, endpoint: &RemoteEndpoint) -> EventStream {
        let url = endpoint.url("/sse");
        let request = self
            .client
            .get(&url)
            .header(ACCEPT, "text/event-stream");

        let mut source = match EventSource::new(request) {
            Ok(source) => source,
            Err(e) => {
                let err = RemoteError::Stream(e.to_string());
                return stream::once(async move { Err(err) }).boxed();
            }
        };
        // Reconnection is driven by the gateway, never by the client.
        source.set_retry_policy(Box::new(retry::Never));

        async_stream::stream! {
            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => debug!("SSE stream opened: {}", url),
                    Ok(Event::Message(msg)) => {
                        yield Ok(SseMessage {
                            event: msg.event,
                            data: msg.data,
                            id: (!msg.id.is_empty()).then_some(msg.id),
                        });
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(e) => {
                        yield Err(RemoteError::Stream(e.to_string()));
                        break;
                    }
                }
            }
            source.close();
        }
        .boxed()
    }

    async fn invoke(
        &self,
        endpoint: &RemoteEndpoint,
        invocation: &ToolInvocation,
    ) -> Result<Value, RemoteError> {
        let url = endpoint.url("/messages");
        let response = self
            .client
            .post(&url)
            .json(invocation)
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;

        Self::read_json(&url, response).await
    }

    async fn list_tools(&self, endpoint: &RemoteEndpoint) -> Result<Value, RemoteError> {
        let url = endpoint.url("/tools");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;

        let body = Self::read_json(&url, response).await?;
        match body {
            Value::Object(mut map) => Ok(map.remove("tools").unwrap_or(Value::Object(map))),
            Value::Array(_) => Ok(body),
            other => Err(RemoteError::InvalidBody(format!(
                "expected a tool list, got {}",
                other
            ))),
        }
    }
}
