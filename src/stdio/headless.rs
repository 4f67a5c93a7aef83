//! Headless stdio protocol: one JSON object per line.
//!
//! Requests are `{ id?, command, params? }`; responses are
//! `{ id?, success, data | error }`; unsolicited events are
//! `{ type: "event", event, timestamp, data }`. The first emitted line is the
//! ready response. All stdout writes funnel through one task so lines never
//! interleave. Streaming commands (`pair-qr`) emit several response lines
//! sharing the request id.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use wabridge_core::error::BridgeError;
use wabridge_session::PairingUpdate;

use crate::messaging::MessageService;

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<Value>,
    pub command: String,
    #[serde(default)]
    pub params: Value,
}

/// One serialized stdout line.
type OutLine = String;

pub async fn run(service: Arc<MessageService>, cancel: CancellationToken) -> anyhow::Result<()> {
    let (out_tx, mut out_rx) = mpsc::channel::<OutLine>(256);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    // The host's startup barrier: ready is the first line out.
    emit(
        &out_tx,
        json!({ "success": true, "data": { "status": "ready", "mode": "headless" } }),
    )
    .await;

    // Unsolicited events, interleaved between responses.
    {
        let out_tx = out_tx.clone();
        let mut sub = service.subscribe(&[]);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = sub.recv() => {
                        let Some(event) = event else { break };
                        emit(&out_tx, json!({
                            "type": "event",
                            "event": event.kind().as_str(),
                            "timestamp": event.emitted_at.to_rfc3339(),
                            "data": event.data_json(),
                        })).await;
                    }
                }
            }
        });
    }

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Request>(&line) {
                            Ok(request) => {
                                let service = Arc::clone(&service);
                                let out_tx = out_tx.clone();
                                let req_cancel = cancel.child_token();
                                tokio::spawn(async move {
                                    handle(service, request, out_tx, req_cancel).await;
                                });
                            }
                            Err(e) => {
                                debug!("malformed headless request: {e}");
                                emit(&out_tx, json!({
                                    "success": false,
                                    "error": format!("malformed request: {e}"),
                                })).await;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stdin read failed: {e}");
                        break;
                    }
                }
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

async fn emit(out_tx: &mpsc::Sender<OutLine>, value: Value) {
    let _ = out_tx.send(value.to_string()).await;
}

async fn respond_ok(out_tx: &mpsc::Sender<OutLine>, id: &Option<Value>, data: Value) {
    let mut line = json!({ "success": true, "data": data });
    if let Some(id) = id {
        line["id"] = id.clone();
    }
    emit(out_tx, line).await;
}

async fn respond_err(out_tx: &mpsc::Sender<OutLine>, id: &Option<Value>, error: &BridgeError) {
    let mut line = json!({ "success": false, "error": error.to_string() });
    if let Some(id) = id {
        line["id"] = id.clone();
    }
    emit(out_tx, line).await;
}

async fn handle(
    service: Arc<MessageService>,
    request: Request,
    out_tx: mpsc::Sender<OutLine>,
    cancel: CancellationToken,
) {
    let id = request.id.clone();
    match execute(&service, &request, &out_tx, &cancel).await {
        Ok(Some(data)) => respond_ok(&out_tx, &id, data).await,
        // Streaming commands have already written their lines.
        Ok(None) => {}
        Err(e) => respond_err(&out_tx, &id, &e).await,
    }
}

fn param_str(params: &Value, key: &str) -> Result<String, BridgeError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BridgeError::InvalidArgument(format!("missing required param '{key}'")))
}

fn param_i64(params: &Value, key: &str, default: i64) -> i64 {
    params.get(key).and_then(Value::as_i64).unwrap_or(default)
}

/// Run one command. `Ok(Some(data))` answers with a single response line;
/// `Ok(None)` means the command streamed its own lines.
async fn execute(
    service: &Arc<MessageService>,
    request: &Request,
    out_tx: &mpsc::Sender<OutLine>,
    cancel: &CancellationToken,
) -> Result<Option<Value>, BridgeError> {
    let params = &request.params;
    match request.command.as_str() {
        "status" => {
            let status = service.status(cancel).await?;
            Ok(Some(serde_json::to_value(status)?))
        }
        "connect" => {
            service.connect(cancel).await?;
            Ok(Some(json!({ "status": "connecting" })))
        }
        "disconnect" => {
            service.disconnect(cancel).await?;
            Ok(Some(json!({ "status": "disconnected" })))
        }
        "logout" => {
            service.logout(cancel).await?;
            Ok(Some(json!({ "status": "logged_out" })))
        }
        "pair-qr" => {
            let mut updates = service.pairing_qr(cancel).await?;
            let id = request.id.clone();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BridgeError::Canceled),
                    update = updates.recv() => {
                        let Some(update) = update else { break };
                        let terminal = update.is_terminal();
                        let data = match &update {
                            PairingUpdate::Qr { code } => json!({ "event": "qr_code", "code": code }),
                            PairingUpdate::Success => json!({ "event": "pairing_success" }),
                            PairingUpdate::Timeout => {
                                respond_err(
                                    out_tx,
                                    &id,
                                    &BridgeError::DeadlineExceeded("pairing timed out".into()),
                                )
                                .await;
                                return Ok(None);
                            }
                            PairingUpdate::Error { message } => {
                                respond_err(out_tx, &id, &BridgeError::Unavailable(message.clone()))
                                    .await;
                                return Ok(None);
                            }
                        };
                        respond_ok(out_tx, &id, data).await;
                        if terminal {
                            break;
                        }
                    }
                }
            }
            Ok(None)
        }
        "pair-code" => {
            let phone = param_str(params, "phone")?;
            let code = service.pair_with_code(cancel, &phone).await?;
            Ok(Some(json!({ "code": code })))
        }
        "list-chats" => {
            let chats = service
                .get_chats(cancel, param_i64(params, "limit", 50), param_i64(params, "offset", 0))
                .await?;
            Ok(Some(serde_json::to_value(chats)?))
        }
        "get-messages" => {
            let chat_id = param_str(params, "chat_id")?;
            let messages = service
                .get_messages(
                    cancel,
                    &chat_id,
                    param_i64(params, "limit", 50),
                    param_i64(params, "offset", 0),
                )
                .await?;
            Ok(Some(serde_json::to_value(messages)?))
        }
        "get-messages-since" => {
            let chat_id = param_str(params, "chat_id")?;
            let since_raw = param_str(params, "since")?;
            let since = since_raw
                .parse::<chrono::DateTime<chrono::Utc>>()
                .map_err(|e| {
                    BridgeError::InvalidArgument(format!("invalid since '{since_raw}': {e}"))
                })?;
            let messages = service
                .get_messages_since(cancel, &chat_id, since, param_i64(params, "limit", 100))
                .await?;
            Ok(Some(serde_json::to_value(messages)?))
        }
        "send-message" => {
            let chat_id = param_str(params, "chat_id")?;
            let text = param_str(params, "text")?;
            let message = service.send_text(cancel, &chat_id, &text).await?;
            Ok(Some(json!({
                "id": message.id,
                "timestamp": message.timestamp.to_rfc3339(),
            })))
        }
        "send-reaction" => {
            let chat_id = param_str(params, "chat_id")?;
            let message_id = param_str(params, "message_id")?;
            let emoji = params
                .get("emoji")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let message = service
                .send_reaction(cancel, &chat_id, &message_id, &emoji)
                .await?;
            Ok(Some(json!({ "id": message.id })))
        }
        "mark-read" => {
            let chat_id = param_str(params, "chat_id")?;
            let ids: Vec<String> = params
                .get("message_ids")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let unread = service.mark_read(cancel, &chat_id, &ids).await?;
            Ok(Some(json!({ "marked": ids.len(), "unread": unread })))
        }
        "search" => {
            let query = param_str(params, "query")?;
            let messages = service
                .search_messages(cancel, &query, param_i64(params, "limit", 20))
                .await?;
            Ok(Some(serde_json::to_value(messages)?))
        }
        other => Err(BridgeError::InvalidArgument(format!(
            "unknown command '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_parse_with_and_without_id() {
        let request: Request =
            serde_json::from_str(r#"{"id": 7, "command": "status"}"#).unwrap();
        assert_eq!(request.command, "status");
        assert_eq!(request.id, Some(json!(7)));
        assert!(request.params.is_null());

        let request: Request = serde_json::from_str(
            r#"{"command": "send-message", "params": {"chat_id": "x@s.whatsapp.net", "text": "hi"}}"#,
        )
        .unwrap();
        assert!(request.id.is_none());
        assert_eq!(request.params["text"], "hi");
    }

    #[test]
    fn string_ids_are_preserved() {
        let request: Request =
            serde_json::from_str(r#"{"id": "req-42", "command": "status"}"#).unwrap();
        assert_eq!(request.id, Some(json!("req-42")));
    }

    #[test]
    fn malformed_lines_fail_to_parse() {
        assert!(serde_json::from_str::<Request>("not json").is_err());
        assert!(serde_json::from_str::<Request>(r#"{"params": {}}"#).is_err());
    }

    #[test]
    fn param_helpers_enforce_presence() {
        let params = json!({ "chat_id": "x", "limit": 5 });
        assert_eq!(param_str(&params, "chat_id").unwrap(), "x");
        assert!(param_str(&params, "text").is_err());
        assert_eq!(param_i64(&params, "limit", 50), 5);
        assert_eq!(param_i64(&params, "offset", 0), 0);
    }
}
