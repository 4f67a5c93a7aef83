//! Outbound path: text sends, reactions, read marks.

use chrono::Utc;
use tracing::{error, warn};
use wacore_binary::jid::Jid as WaJid;
use whatsapp_rust::client::Client;

use wabridge_core::error::BridgeError;
use wabridge_core::event::EventPayload;
use wabridge_core::jid::Jid;
use wabridge_core::model::{Message, MessageKind, Reaction};

use crate::ingest;
use crate::service::SessionService;

/// WhatsApp rejects text bodies longer than this.
pub(crate) const MAX_TEXT_LEN: usize = 4096;

/// Retry delays for exponential backoff: 500ms, 1s, 2s.
pub(crate) const RETRY_DELAYS_MS: [u64; 3] = [500, 1000, 2000];

/// Send a message with retry and exponential backoff, returning the
/// library-assigned message id.
pub(crate) async fn retry_send(
    client: &Client,
    jid: &WaJid,
    msg: waproto::whatsapp::Message,
) -> Result<String, BridgeError> {
    let mut last_err = None;

    for (attempt, delay_ms) in RETRY_DELAYS_MS.iter().enumerate() {
        match client.send_message(jid.clone(), msg.clone()).await {
            Ok(msg_id) => return Ok(msg_id),
            Err(e) => {
                let attempt_num = attempt + 1;
                if attempt_num < RETRY_DELAYS_MS.len() {
                    warn!(
                        "send attempt {attempt_num}/{} failed: {e}, retrying in {delay_ms}ms",
                        RETRY_DELAYS_MS.len()
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(*delay_ms)).await;
                } else {
                    error!(
                        "send attempt {attempt_num}/{} failed: {e}, giving up",
                        RETRY_DELAYS_MS.len()
                    );
                }
                last_err = Some(e);
            }
        }
    }

    Err(BridgeError::Unavailable(format!(
        "send failed after {} attempts: {}",
        RETRY_DELAYS_MS.len(),
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn to_wa_jid(jid: &Jid) -> Result<WaJid, BridgeError> {
    jid.to_string()
        .parse()
        .map_err(|e| BridgeError::InvalidArgument(format!("invalid jid '{jid}': {e:?}")))
}

impl SessionService {
    /// Send a text message, persist the echo, and publish `MessageSent`.
    pub async fn send_text(&self, chat_jid: &Jid, text: &str) -> Result<Message, BridgeError> {
        if text.trim().is_empty() {
            return Err(BridgeError::InvalidArgument(
                "message text is empty".into(),
            ));
        }
        if text.len() > MAX_TEXT_LEN {
            return Err(BridgeError::InvalidArgument(format!(
                "message text exceeds {MAX_TEXT_LEN} bytes"
            )));
        }

        let client = self.shared.client_or_err().await?;
        let wa_jid = to_wa_jid(chat_jid)?;
        let body = text.replace("\r\n", "\n");

        let proto = waproto::whatsapp::Message {
            conversation: Some(body.clone()),
            ..Default::default()
        };
        let id = retry_send(&client, &wa_jid, proto).await?;

        let sender = self.own_jid().await.unwrap_or_else(|| chat_jid.clone());
        let mut message = Message::text(id, chat_jid.clone(), sender, body);
        message.is_from_me = true;
        message.timestamp = Utc::now();
        let message = message.normalize();

        ingest::record(&self.shared, &message).await?;
        Ok(message)
    }

    /// Send a reaction to a stored message. Idempotent per
    /// (chat, target, sender): a new emoji replaces the prior reaction, an
    /// empty emoji clears it.
    pub async fn send_reaction(
        &self,
        chat_jid: &Jid,
        target_message_id: &str,
        emoji: &str,
    ) -> Result<Message, BridgeError> {
        let target = self
            .shared
            .store
            .messages()
            .get(target_message_id)
            .await?
            .ok_or_else(|| {
                BridgeError::NotFound(format!("message '{target_message_id}'"))
            })?;
        if &target.chat_jid != chat_jid {
            return Err(BridgeError::NotFound(format!(
                "message '{target_message_id}' in chat '{chat_jid}'"
            )));
        }

        let client = self.shared.client_or_err().await?;
        let wa_jid = to_wa_jid(chat_jid)?;

        let proto = waproto::whatsapp::Message {
            reaction_message: Some(waproto::whatsapp::message::ReactionMessage {
                key: Some(waproto::whatsapp::MessageKey {
                    remote_jid: Some(chat_jid.to_string()),
                    from_me: Some(target.is_from_me),
                    id: Some(target_message_id.to_string()),
                    ..Default::default()
                }),
                text: Some(emoji.to_string()),
                sender_timestamp_ms: Some(Utc::now().timestamp_millis()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let id = retry_send(&client, &wa_jid, proto).await?;

        let sender = self.own_jid().await.unwrap_or_else(|| chat_jid.clone());
        let mut message = Message::text(id, chat_jid.clone(), sender.clone(), "");
        message.kind = MessageKind::Reaction;
        message.is_from_me = true;
        message.reaction = Some(Reaction {
            target_message_id: target_message_id.to_string(),
            emoji: emoji.to_string(),
            sender_jid: sender,
        });
        let message = message.normalize();

        ingest::record(&self.shared, &message).await?;
        Ok(message)
    }

    /// Issue read receipts for the given messages, reconcile the chat's
    /// unread count, and publish `MessageRead`. Returns the new count.
    pub async fn mark_as_read(
        &self,
        chat_jid: &Jid,
        message_ids: &[String],
    ) -> Result<i64, BridgeError> {
        if message_ids.is_empty() {
            return Err(BridgeError::InvalidArgument("no message ids given".into()));
        }

        let client = self.shared.client_or_err().await?;
        let wa_jid = to_wa_jid(chat_jid)?;
        client
            .mark_as_read(&wa_jid, None, message_ids.to_vec())
            .await
            .map_err(|e| BridgeError::Unavailable(format!("mark-as-read failed: {e}")))?;

        let unread = self.shared.store.mark_read(chat_jid, message_ids).await?;
        self.shared.bus.publish(EventPayload::MessageRead {
            chat_jid: chat_jid.clone(),
            message_ids: message_ids.to_vec(),
        });
        Ok(unread)
    }
}
