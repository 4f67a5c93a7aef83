//! The static MCP tool catalog and its dispatch.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use wabridge_core::model::{Chat, Message};

use crate::messaging::MessageService;

/// JSON-Schema-shaped tool definitions, in catalog order.
pub fn catalog() -> Vec<Value> {
    vec![
        tool(
            "whatsapp_list_chats",
            "List WhatsApp chats, most recently active first",
            json!({
                "type": "object",
                "properties": {
                    "limit": { "type": "integer", "description": "Max chats to return (default 20, max 100)" }
                }
            }),
        ),
        tool(
            "whatsapp_get_messages",
            "Get recent messages from a chat",
            json!({
                "type": "object",
                "properties": {
                    "chat_id": { "type": "string", "description": "Chat JID, e.g. 15551234567@s.whatsapp.net" },
                    "limit": { "type": "integer", "description": "Max messages to return (default 50, max 200)" }
                },
                "required": ["chat_id"]
            }),
        ),
        tool(
            "whatsapp_send_message",
            "Send a text message to a chat",
            json!({
                "type": "object",
                "properties": {
                    "chat_id": { "type": "string", "description": "Chat JID" },
                    "text": { "type": "string", "description": "Message text" }
                },
                "required": ["chat_id", "text"]
            }),
        ),
        tool(
            "whatsapp_send_reaction",
            "React to a message with an emoji (empty emoji clears)",
            json!({
                "type": "object",
                "properties": {
                    "chat_id": { "type": "string", "description": "Chat JID" },
                    "message_id": { "type": "string", "description": "Target message id" },
                    "emoji": { "type": "string", "description": "Reaction emoji" }
                },
                "required": ["chat_id", "message_id", "emoji"]
            }),
        ),
        tool(
            "whatsapp_mark_read",
            "Mark messages in a chat as read",
            json!({
                "type": "object",
                "properties": {
                    "chat_id": { "type": "string", "description": "Chat JID" },
                    "message_ids": { "type": "string", "description": "Comma-separated message ids" }
                },
                "required": ["chat_id", "message_ids"]
            }),
        ),
        tool(
            "whatsapp_search_messages",
            "Search message history, ranked by recency",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Substring to search for" },
                    "limit": { "type": "integer", "description": "Max results (default 20, max 100)" }
                },
                "required": ["query"]
            }),
        ),
        tool(
            "whatsapp_connection_status",
            "Current WhatsApp session status",
            json!({ "type": "object", "properties": {} }),
        ),
        tool(
            "whatsapp_connect",
            "Connect the paired WhatsApp session",
            json!({ "type": "object", "properties": {} }),
        ),
        tool(
            "whatsapp_disconnect",
            "Disconnect the WhatsApp session",
            json!({ "type": "object", "properties": {} }),
        ),
        tool(
            "whatsapp_logout",
            "Log out and unpair the WhatsApp session",
            json!({ "type": "object", "properties": {} }),
        ),
    ]
}

fn tool(name: &str, description: &str, schema: Value) -> Value {
    json!({ "name": name, "description": description, "inputSchema": schema })
}

/// Run one tool call. `Err` becomes an MCP tool-error result upstream.
pub async fn call(
    service: &Arc<MessageService>,
    cancel: &CancellationToken,
    name: &str,
    args: &Value,
) -> Result<String, String> {
    match name {
        "whatsapp_list_chats" => {
            let limit = clamp_limit(args, "limit", 20, 100);
            let chats = service
                .get_chats(cancel, limit, 0)
                .await
                .map_err(|e| e.to_string())?;
            Ok(render_chats(&chats))
        }
        "whatsapp_get_messages" => {
            let chat_id = required_str(args, "chat_id")?;
            let limit = clamp_limit(args, "limit", 50, 200);
            let messages = service
                .get_messages(cancel, chat_id, limit, 0)
                .await
                .map_err(|e| e.to_string())?;
            Ok(render_messages(&messages))
        }
        "whatsapp_send_message" => {
            let chat_id = required_str(args, "chat_id")?;
            let text = required_str(args, "text")?;
            let message = service
                .send_text(cancel, chat_id, text)
                .await
                .map_err(|e| e.to_string())?;
            Ok(format!(
                "Message sent: id {} at {}",
                message.id,
                message.timestamp.to_rfc3339()
            ))
        }
        "whatsapp_send_reaction" => {
            let chat_id = required_str(args, "chat_id")?;
            let message_id = required_str(args, "message_id")?;
            let emoji = args.get("emoji").and_then(Value::as_str).unwrap_or("");
            let message = service
                .send_reaction(cancel, chat_id, message_id, emoji)
                .await
                .map_err(|e| e.to_string())?;
            if emoji.is_empty() {
                Ok(format!("Reaction cleared from {message_id}"))
            } else {
                Ok(format!("Reacted {emoji} to {message_id} (id {})", message.id))
            }
        }
        "whatsapp_mark_read" => {
            let chat_id = required_str(args, "chat_id")?;
            let raw_ids = required_str(args, "message_ids")?;
            let ids: Vec<String> = raw_ids
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            let unread = service
                .mark_read(cancel, chat_id, &ids)
                .await
                .map_err(|e| e.to_string())?;
            Ok(format!(
                "Marked {} message(s) read; {unread} unread remain in {chat_id}",
                ids.len()
            ))
        }
        "whatsapp_search_messages" => {
            let query = required_str(args, "query")?;
            let limit = clamp_limit(args, "limit", 20, 100);
            let messages = service
                .search_messages(cancel, query, limit)
                .await
                .map_err(|e| e.to_string())?;
            if messages.is_empty() {
                Ok(format!("No messages matching '{query}'"))
            } else {
                Ok(render_messages(&messages))
            }
        }
        "whatsapp_connection_status" => {
            let status = service.status(cancel).await.map_err(|e| e.to_string())?;
            let mut line = format!("State: {:?}", status.state);
            if let Some(jid) = status.jid {
                line.push_str(&format!("\nAccount: {jid}"));
            }
            if let Some(name) = status.push_name {
                line.push_str(&format!("\nName: {name}"));
            }
            Ok(line)
        }
        "whatsapp_connect" => {
            service.connect(cancel).await.map_err(|e| e.to_string())?;
            Ok("Connecting".to_string())
        }
        "whatsapp_disconnect" => {
            service.disconnect(cancel).await.map_err(|e| e.to_string())?;
            Ok("Disconnected".to_string())
        }
        "whatsapp_logout" => {
            service.logout(cancel).await.map_err(|e| e.to_string())?;
            Ok("Logged out; pairing required to reconnect".to_string())
        }
        other => Err(format!("unknown tool '{other}'")),
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("missing required parameter '{key}'"))
}

/// Numeric limit with a default and a hard ceiling.
fn clamp_limit(args: &Value, key: &str, default: i64, max: i64) -> i64 {
    args.get(key)
        .and_then(Value::as_i64)
        .unwrap_or(default)
        .clamp(1, max)
}

fn render_chats(chats: &[Chat]) -> String {
    if chats.is_empty() {
        return "No chats yet".to_string();
    }
    let mut out = String::new();
    for chat in chats {
        let name = if chat.name.is_empty() {
            chat.jid.to_string()
        } else {
            chat.name.clone()
        };
        let mut flags = String::new();
        if chat.is_pinned {
            flags.push_str(" [pinned]");
        }
        if chat.is_muted {
            flags.push_str(" [muted]");
        }
        out.push_str(&format!(
            "{name} ({}){flags} — unread: {}",
            chat.jid, chat.unread_count
        ));
        if !chat.last_message_text.is_empty() {
            out.push_str(&format!("\n  last: {}", chat.last_message_text));
        }
        out.push('\n');
    }
    out
}

fn render_messages(messages: &[Message]) -> String {
    if messages.is_empty() {
        return "No messages".to_string();
    }
    let mut out = String::new();
    for message in messages {
        let direction = if message.is_from_me { "me" } else { "them" };
        let body = if !message.text.is_empty() {
            message.text.clone()
        } else if !message.caption.is_empty() {
            format!("[{}] {}", message.kind.as_str(), message.caption)
        } else {
            format!("[{}]", message.kind.as_str())
        };
        out.push_str(&format!(
            "[{}] {} ({direction}): {body}\n",
            message.timestamp.format("%Y-%m-%d %H:%M"),
            message.id
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wabridge_core::jid::Jid;

    #[test]
    fn catalog_has_the_full_surface() {
        let names: Vec<String> = catalog()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        for expected in [
            "whatsapp_list_chats",
            "whatsapp_get_messages",
            "whatsapp_send_message",
            "whatsapp_send_reaction",
            "whatsapp_mark_read",
            "whatsapp_search_messages",
            "whatsapp_connection_status",
            "whatsapp_connect",
            "whatsapp_disconnect",
            "whatsapp_logout",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn every_tool_has_a_schema() {
        for tool in catalog() {
            assert_eq!(tool["inputSchema"]["type"], "object", "{}", tool["name"]);
            assert!(!tool["description"].as_str().unwrap().is_empty());
        }
    }

    #[test]
    fn limits_are_clamped() {
        assert_eq!(clamp_limit(&json!({}), "limit", 20, 100), 20);
        assert_eq!(clamp_limit(&json!({"limit": 5}), "limit", 20, 100), 5);
        assert_eq!(clamp_limit(&json!({"limit": 5000}), "limit", 20, 100), 100);
        assert_eq!(clamp_limit(&json!({"limit": -3}), "limit", 20, 100), 1);
    }

    #[test]
    fn required_params_are_enforced() {
        assert!(required_str(&json!({}), "chat_id").is_err());
        assert!(required_str(&json!({"chat_id": ""}), "chat_id").is_err());
        assert_eq!(required_str(&json!({"chat_id": "x"}), "chat_id").unwrap(), "x");
    }

    #[test]
    fn chat_rendering_includes_unread_and_preview() {
        let mut chat = wabridge_core::model::Chat::new(Jid::user("1555"));
        chat.name = "Ada".to_string();
        chat.unread_count = 2;
        chat.last_message_text = "see you then".to_string();
        let text = render_chats(&[chat]);
        assert!(text.contains("Ada"));
        assert!(text.contains("unread: 2"));
        assert!(text.contains("see you then"));
    }

    #[test]
    fn message_rendering_marks_direction() {
        let mut msg =
            wabridge_core::model::Message::text("M1", Jid::user("1555"), Jid::user("1555"), "hey");
        msg.is_from_me = true;
        msg.timestamp = Utc::now();
        let text = render_messages(&[msg]);
        assert!(text.contains("(me): hey"));
    }
}
