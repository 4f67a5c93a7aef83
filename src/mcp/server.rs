//! HTTP server for the MCP surface.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::messaging::MessageService;

use super::tools;

/// MCP protocol revision this server speaks.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// SSE keepalive tick.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct AppState {
    service: Arc<MessageService>,
    cancel: CancellationToken,
}

fn router(service: Arc<MessageService>, cancel: CancellationToken) -> Router {
    Router::new()
        .route("/sse", get(sse_handler))
        .route("/message", post(message_handler))
        .route("/health", get(health_handler))
        .with_state(AppState { service, cancel })
}

/// Run the MCP server until the token fires.
pub async fn serve(
    addr: &str,
    service: Arc<MessageService>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("mcp listening on {}", listener.local_addr()?);

    let shutdown = cancel.clone();
    axum::serve(listener, router(service, cancel))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Long-lived event stream: every bus event becomes an MCP notification.
async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    debug!("mcp sse client attached");
    let sub = state.service.subscribe(&[]);

    let stream = futures_util::stream::unfold(sub, |mut sub| async move {
        let event = sub.recv().await?;
        let notification = json!({
            "jsonrpc": "2.0",
            "method": "notifications/message",
            "params": {
                "event": event.kind().as_str(),
                "timestamp": event.emitted_at.to_rfc3339(),
                "data": event.data_json(),
            }
        });
        let sse = SseEvent::default().event("message").json_data(&notification);
        match sse {
            Ok(sse) => Some((Ok(sse), sub)),
            Err(_) => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL))
}

/// JSON-RPC endpoint for tool calls.
async fn message_handler(
    State(state): State<AppState>,
    Json(request): Json<Value>,
) -> (axum::http::StatusCode, Json<Value>) {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    // Notifications carry no id and expect no payload back.
    if id.is_null() && method.starts_with("notifications/") {
        return (axum::http::StatusCode::ACCEPTED, Json(Value::Null));
    }

    let result = match method.as_str() {
        "initialize" => json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": {
                "name": "wabridge",
                "version": env!("CARGO_PKG_VERSION"),
            }
        }),
        "tools/list" => json!({ "tools": tools::catalog() }),
        "tools/call" => {
            let params = request.get("params").cloned().unwrap_or(Value::Null);
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let args = params.get("arguments").cloned().unwrap_or(json!({}));

            // Tool failures are tool-error results, never transport errors.
            match tools::call(&state.service, &state.cancel, &name, &args).await {
                Ok(text) => json!({
                    "content": [{ "type": "text", "text": text }],
                    "isError": false
                }),
                Err(message) => json!({
                    "content": [{ "type": "text", "text": message }],
                    "isError": true
                }),
            }
        }
        "ping" => json!({}),
        other => {
            let error = json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("method '{other}' not found") }
            });
            return (axum::http::StatusCode::OK, Json(error));
        }
    };

    let response = json!({ "jsonrpc": "2.0", "id": id, "result": result });
    (axum::http::StatusCode::OK, Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wabridge_core::bus::EventBus;
    use wabridge_session::SessionService;
    use wabridge_store::Store;

    fn temp_device_db() -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir()
            .join(format!("wabridge-mcp-{}-{n}.db_wa", std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    async fn test_state() -> AppState {
        let store = Store::open_in_memory().await.unwrap();
        let bus = Arc::new(EventBus::new());
        let session = Arc::new(
            SessionService::new(&temp_device_db(), None, store.clone(), Arc::clone(&bus))
                .await
                .unwrap(),
        );
        AppState {
            service: Arc::new(crate::messaging::MessageService::new(store, session, bus)),
            cancel: CancellationToken::new(),
        }
    }

    async fn post_message(state: AppState, body: Value) -> Value {
        let (status, Json(response)) = message_handler(State(state), Json(body)).await;
        assert_eq!(status, axum::http::StatusCode::OK);
        response
    }

    #[tokio::test]
    async fn initialize_advertises_tools() {
        let state = test_state().await;
        let response = post_message(
            state,
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
        )
        .await;
        assert_eq!(response["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(response["result"]["serverInfo"]["name"], "wabridge");
    }

    #[tokio::test]
    async fn tools_list_returns_catalog() {
        let state = test_state().await;
        let response = post_message(
            state,
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
        )
        .await;
        let tools = response["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 10);
    }

    #[tokio::test]
    async fn tool_errors_are_tool_results_not_rpc_errors() {
        let state = test_state().await;
        // Sending while unpaired fails inside the tool.
        let response = post_message(
            state,
            json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": {
                    "name": "whatsapp_send_message",
                    "arguments": { "chat_id": "1555@s.whatsapp.net", "text": "hi" }
                }
            }),
        )
        .await;
        assert!(response.get("error").is_none());
        assert_eq!(response["result"]["isError"], true);
    }

    #[tokio::test]
    async fn missing_required_param_is_a_tool_error() {
        let state = test_state().await;
        let response = post_message(
            state,
            json!({
                "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                "params": { "name": "whatsapp_get_messages", "arguments": {} }
            }),
        )
        .await;
        assert_eq!(response["result"]["isError"], true);
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("chat_id"));
    }

    #[tokio::test]
    async fn unknown_method_is_a_jsonrpc_error() {
        let state = test_state().await;
        let response = post_message(
            state,
            json!({"jsonrpc": "2.0", "id": 5, "method": "bogus/method"}),
        )
        .await;
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn list_chats_tool_renders_empty_store() {
        let state = test_state().await;
        let response = post_message(
            state,
            json!({
                "jsonrpc": "2.0", "id": 6, "method": "tools/call",
                "params": { "name": "whatsapp_list_chats", "arguments": {} }
            }),
        )
        .await;
        assert_eq!(response["result"]["isError"], false);
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("No chats"));
    }
}
