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

// Integration tests: the gateway and its HTTP transport against an in-process
// MCP endpoint, plus the public router surface.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use mcpgate_core::{
    classify_invocation, ControlMessage, InvocationOutcome, RemoteEndpoint, RemoteError,
    ServerMessage, SseKind, ToolInvocation, DEFAULT_STALE_CLIENT_MARKERS,
};
use mcpgate_server::{
    api::AppState,
    auth::{ApiKeyAuth, NoAuth},
    build_router,
    config::{GatewayConfig, ServerConfig},
    gateway::Gateway,
    transport::{HttpTransport, RemoteTransport},
};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tower::ServiceExt;

/// Issues `client-1`, `client-2`, ... on each SSE connect; only the latest
/// one is accepted by `/messages`.
#[derive(Clone, Default)]
struct FakeMcp {
    sessions: Arc<AtomicUsize>,
    current: Arc<Mutex<Option<String>>>,
}

async fn info() -> Json<Value> {
    Json(json!({ "name": "fake-mcp", "version": "1.0.0" }))
}

async fn sse(State(mcp): State<FakeMcp>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let n = mcp.sessions.fetch_add(1, Ordering::SeqCst) + 1;
    let client_id = format!("client-{}", n);
    *mcp.current.lock().unwrap() = Some(client_id.clone());

    let stream = async_stream::stream! {
        yield Ok(Event::default()
            .event("connected")
            .data(json!({ "client_id": client_id }).to_string()));
        std::future::pending::<()>().await;
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn messages(
    State(mcp): State<FakeMcp>,
    Json(invocation): Json<ToolInvocation>,
) -> (StatusCode, Json<Value>) {
    let current = mcp.current.lock().unwrap().clone();
    if current.as_deref() != Some(invocation.client_id.as_str()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid clientId" })),
        );
    }

    match invocation.tool.as_str() {
        // Server forgot the session but still answers 200
        "expire" => {
            *mcp.current.lock().unwrap() = None;
            (StatusCode::OK, Json(json!({ "error": "Missing clientId" })))
        }
        "fail" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "tool crashed" })),
        ),
        _ => (
            StatusCode::OK,
            Json(json!({ "id": invocation.id, "echo": invocation.parameters })),
        ),
    }
}

async fn tools() -> Json<Value> {
    Json(json!({ "tools": [{ "name": "echo" }, { "name": "fail" }] }))
}

async fn spawn_fake_mcp() -> (SocketAddr, FakeMcp) {
    let mcp = FakeMcp::default();
    let app = Router::new()
        .route("/info", get(info))
        .route("/sse", get(sse))
        .route("/messages", post(messages))
        .route("/tools", get(tools))
        .with_state(mcp.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, mcp)
}

fn transport() -> HttpTransport {
    HttpTransport::new(Duration::from_secs(2)).unwrap()
}

/// An address nothing listens on.
async fn closed_endpoint() -> RemoteEndpoint {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    RemoteEndpoint::new("127.0.0.1", port)
}

async fn next(rx: &mut UnboundedReceiver<ServerMessage>) -> ServerMessage {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for a notification")
            .expect("socket channel closed");
        if !matches!(message, ServerMessage::SseEvent { .. }) {
            return message;
        }
    }
}

#[tokio::test]
async fn test_probe() {
    let (addr, _mcp) = spawn_fake_mcp().await;
    let transport = transport();

    let live = RemoteEndpoint::new("127.0.0.1", addr.port());
    assert!(transport.probe(&live).await.is_ok());

    let dead = closed_endpoint().await;
    assert!(matches!(
        transport.probe(&dead).await,
        Err(RemoteError::Request { .. })
    ));
}

#[tokio::test]
async fn test_stream_delivers_connected_event() {
    let (addr, _mcp) = spawn_fake_mcp().await;
    let endpoint = RemoteEndpoint::new("127.0.0.1", addr.port());

    let mut stream = transport().open_stream(&endpoint);
    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .expect("stream ended early")
        .expect("stream error");

    assert_eq!(first.event, "connected");
    assert_eq!(first.kind(), SseKind::Connected(Some("client-1".to_string())));
}

#[tokio::test]
async fn test_stream_to_dead_endpoint_yields_error() {
    let endpoint = closed_endpoint().await;
    let mut stream = transport().open_stream(&endpoint);

    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap();
    assert!(matches!(first, Some(Err(RemoteError::Stream(_)))));
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_invoke_and_stale_detection() {
    let (addr, _mcp) = spawn_fake_mcp().await;
    let endpoint = RemoteEndpoint::new("127.0.0.1", addr.port());
    let transport = transport();

    // Registers client-1
    let mut stream = transport.open_stream(&endpoint);
    stream.next().await.unwrap().unwrap();

    let invocation = |client_id: &str, tool: &str| ToolInvocation {
        id: "msg-1".to_string(),
        client_id: client_id.to_string(),
        tool: tool.to_string(),
        parameters: json!({ "text": "hi" }),
    };

    let ok = transport
        .invoke(&endpoint, &invocation("client-1", "echo"))
        .await
        .unwrap();
    assert_eq!(ok["echo"]["text"], "hi");

    let stale = transport
        .invoke(&endpoint, &invocation("client-0", "echo"))
        .await;
    assert!(matches!(
        classify_invocation(stale, DEFAULT_STALE_CLIENT_MARKERS),
        InvocationOutcome::StaleClient { .. }
    ));

    let failed = transport
        .invoke(&endpoint, &invocation("client-1", "fail"))
        .await;
    match classify_invocation(failed, DEFAULT_STALE_CLIENT_MARKERS) {
        InvocationOutcome::Failed { details, .. } => {
            assert_eq!(details.unwrap()["status"], 500)
        }
        other => panic!("expected failure, got {:?}", other),
    }

    let tools = transport.list_tools(&endpoint).await.unwrap();
    assert_eq!(tools.as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn test_gateway_end_to_end() {
    let (addr, mcp) = spawn_fake_mcp().await;
    let handle = Gateway::new(GatewayConfig::default(), Arc::new(transport())).spawn();
    let (socket, mut rx) = handle.open_socket("alice").await.unwrap();

    handle
        .dispatch(
            &socket,
            ControlMessage::Connect {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
            },
        )
        .await
        .unwrap();

    let ServerMessage::Connecting { connection_id, .. } = next(&mut rx).await else {
        panic!("expected connecting");
    };
    match next(&mut rx).await {
        ServerMessage::Connected { client_id, .. } => assert_eq!(client_id, "client-1"),
        other => panic!("expected connected, got {:?}", other),
    }

    let execute = |tool: &str| ControlMessage::ExecuteTool {
        connection_id: connection_id.clone(),
        tool: tool.to_string(),
        parameters: json!({ "text": "hi" }),
    };

    handle.dispatch(&socket, execute("echo")).await.unwrap();
    let ServerMessage::ExecuteStart { execution_id, .. } = next(&mut rx).await else {
        panic!("expected execute_start");
    };
    match next(&mut rx).await {
        ServerMessage::ExecuteResult {
            execution_id: id,
            result,
            ..
        } => {
            assert_eq!(id, execution_id);
            assert_eq!(result["echo"]["text"], "hi");
        }
        other => panic!("expected execute_result, got {:?}", other),
    }

    // The remote drops the session: reconnect under the same connection ID
    handle.dispatch(&socket, execute("expire")).await.unwrap();
    assert!(matches!(next(&mut rx).await, ServerMessage::ExecuteStart { .. }));
    assert!(matches!(next(&mut rx).await, ServerMessage::Reconnecting { .. }));
    assert!(matches!(next(&mut rx).await, ServerMessage::ExecuteError { .. }));
    assert!(matches!(next(&mut rx).await, ServerMessage::Connecting { .. }));
    match next(&mut rx).await {
        ServerMessage::Connected {
            connection_id: id,
            client_id,
            ..
        } => {
            assert_eq!(id, connection_id);
            assert_eq!(client_id, "client-2");
        }
        other => panic!("expected connected, got {:?}", other),
    }
    assert_eq!(mcp.sessions.load(Ordering::SeqCst), 2);

    handle.dispatch(&socket, execute("echo")).await.unwrap();
    assert!(matches!(next(&mut rx).await, ServerMessage::ExecuteStart { .. }));
    assert!(matches!(next(&mut rx).await, ServerMessage::ExecuteResult { .. }));
}

#[tokio::test]
async fn test_gateway_reports_unreachable_endpoint() {
    let endpoint = closed_endpoint().await;
    let handle = Gateway::new(GatewayConfig::default(), Arc::new(transport())).spawn();
    let (socket, mut rx) = handle.open_socket("alice").await.unwrap();

    handle
        .dispatch(
            &socket,
            ControlMessage::Connect {
                host: endpoint.host.clone(),
                port: endpoint.port,
            },
        )
        .await
        .unwrap();

    match next(&mut rx).await {
        ServerMessage::ConnectError { error, port, .. } => {
            assert!(error.contains("unreachable"), "{}", error);
            assert_eq!(port, Some(endpoint.port));
        }
        other => panic!("expected connect_error, got {:?}", other),
    }
}

fn app_state(config: ServerConfig) -> AppState {
    let handle = Gateway::new(config.gateway.clone(), Arc::new(transport())).spawn();
    AppState {
        gateway: handle,
        config: Arc::new(config),
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = build_router(app_state(ServerConfig::default()), Arc::new(NoAuth::new("local")));

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["gateway"]["active_connections"], 0);
}

#[tokio::test]
async fn test_control_socket_requires_credentials() {
    let auth = ApiKeyAuth::new(vec!["secret:alice".to_string()]);
    let app = build_router(app_state(ServerConfig::default()), Arc::new(auth));

    let response = app
        .oneshot(Request::get("/ws").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_cors_honours_configured_origins() {
    let mut config = ServerConfig::default();
    config.server.cors_origins = vec!["http://allowed.example".to_string()];
    let app = build_router(app_state(config), Arc::new(NoAuth::new("local")));

    let health_from = |origin: &str| {
        Request::get("/health")
            .header("origin", origin)
            .body(Body::empty())
            .unwrap()
    };

    let response = app
        .clone()
        .oneshot(health_from("http://allowed.example"))
        .await
        .unwrap();
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .map(|v| v.to_str().unwrap()),
        Some("http://allowed.example")
    );

    let response = app.oneshot(health_from("http://evil.example")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("access-control-allow-origin")
        .is_none());
}
