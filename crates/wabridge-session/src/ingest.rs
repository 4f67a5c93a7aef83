//! Inbound message path: translate, persist exactly once, publish.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use wacore::types::message::MessageInfo;
use waproto::whatsapp as wa;
use whatsapp_rust::client::Client;

use wabridge_core::error::BridgeError;
use wabridge_core::event::EventPayload;
use wabridge_core::jid::Jid;
use wabridge_core::model::{ContactCard, Location, Message, MessageKind, Reaction};

use crate::media;
use crate::service::Shared;

/// Persist a domain message and, on genuine insert, publish the matching
/// event. Redeliveries insert nothing and stay silent, so duplicate library
/// deliveries never double-count unread or re-notify observers.
pub(crate) async fn record(shared: &Shared, message: &Message) -> Result<bool, BridgeError> {
    let inserted = shared.store.ingest(message).await?;
    if inserted {
        let payload = if message.is_from_me {
            EventPayload::MessageSent {
                message: message.clone(),
            }
        } else {
            EventPayload::MessageReceived {
                message: message.clone(),
            }
        };
        shared.bus.publish(payload);
    }
    Ok(inserted)
}

/// Process one incoming library message event end to end.
pub(crate) async fn handle_library_message(
    shared: &Arc<Shared>,
    client: &Arc<Client>,
    msg: wa::Message,
    info: MessageInfo,
) {
    let chat_jid: Jid = match info.source.chat.to_string().parse() {
        Ok(jid) => jid,
        Err(e) => {
            warn!("dropping message with unparseable chat jid: {e}");
            return;
        }
    };
    let sender_jid: Jid = match info.source.sender.to_string().parse() {
        Ok(jid) => jid,
        Err(e) => {
            warn!("dropping message with unparseable sender jid: {e}");
            return;
        }
    };

    let Some(mut message) = translate(
        &msg,
        &info.id,
        chat_jid,
        sender_jid,
        info.source.is_from_me,
        info.timestamp,
    ) else {
        debug!("ignoring library message with no supported payload");
        return;
    };

    // Media is fetched before the row lands so the path can be stored with
    // it; a failed download is non-fatal and leaves media_url empty.
    if media::wants_download(&message) {
        media::download_into(shared, client, &msg, &mut message).await;
    }

    if let Err(e) = record(shared, &message).await {
        warn!("failed to ingest message {}: {e}", message.id);
    }
}

/// Handle a read receipt: flip the referenced rows, reconcile the chat's
/// unread count, and notify observers.
pub(crate) async fn handle_receipt(shared: &Arc<Shared>, receipt: wacore::types::events::Receipt) {
    let chat_jid: Jid = match receipt.source.chat.to_string().parse() {
        Ok(jid) => jid,
        Err(e) => {
            warn!("dropping receipt with unparseable chat jid: {e}");
            return;
        }
    };
    let message_ids: Vec<String> = receipt.message_ids.clone();
    if message_ids.is_empty() {
        return;
    }

    match shared.store.mark_read(&chat_jid, &message_ids).await {
        Ok(_) => {
            shared.bus.publish(EventPayload::MessageRead {
                chat_jid,
                message_ids,
            });
        }
        Err(BridgeError::NotFound(_)) => {
            debug!("receipt for unknown chat {chat_jid}, ignoring");
        }
        Err(e) => warn!("failed to apply receipt for {chat_jid}: {e}"),
    }
}

/// Translate a library message into the domain model. Returns `None` for
/// payloads the bridge does not record (protocol messages, polls, ...).
pub(crate) fn translate(
    msg: &wa::Message,
    id: &str,
    chat_jid: Jid,
    sender_jid: Jid,
    is_from_me: bool,
    timestamp: DateTime<Utc>,
) -> Option<Message> {
    // Unwrap nested wrappers (device_sent, ephemeral, view_once).
    let inner = msg
        .device_sent_message
        .as_ref()
        .and_then(|d| d.message.as_deref())
        .or_else(|| {
            msg.ephemeral_message
                .as_ref()
                .and_then(|e| e.message.as_deref())
        })
        .or_else(|| {
            msg.view_once_message
                .as_ref()
                .and_then(|v| v.message.as_deref())
        })
        .unwrap_or(msg);

    let mut message = Message::text(id, chat_jid, sender_jid.clone(), "");
    message.is_from_me = is_from_me;
    message.timestamp = timestamp;

    if let Some(text) = inner.conversation.as_deref() {
        if text.is_empty() {
            return None;
        }
        message.text = text.to_string();
    } else if let Some(ext) = inner.extended_text_message.as_ref() {
        let text = ext.text.as_deref().unwrap_or("");
        if text.is_empty() {
            return None;
        }
        message.text = text.to_string();
        message.quoted_message_id = ext
            .context_info
            .as_ref()
            .and_then(|c| c.stanza_id.clone());
    } else if let Some(img) = inner.image_message.as_ref() {
        message.kind = MessageKind::Image;
        message.caption = img.caption.clone().unwrap_or_default();
        message.media_mime_type = img.mimetype.clone().unwrap_or_default();
        message.media_file_size = img.file_length.unwrap_or(0) as i64;
    } else if let Some(video) = inner.video_message.as_ref() {
        message.kind = MessageKind::Video;
        message.caption = video.caption.clone().unwrap_or_default();
        message.media_mime_type = video.mimetype.clone().unwrap_or_default();
        message.media_file_size = video.file_length.unwrap_or(0) as i64;
    } else if let Some(audio) = inner.audio_message.as_ref() {
        message.kind = MessageKind::Audio;
        message.media_mime_type = audio.mimetype.clone().unwrap_or_default();
        message.media_file_size = audio.file_length.unwrap_or(0) as i64;
    } else if let Some(doc) = inner.document_message.as_ref() {
        message.kind = MessageKind::Document;
        message.caption = doc.caption.clone().unwrap_or_default();
        message.media_mime_type = doc.mimetype.clone().unwrap_or_default();
        message.media_file_name = doc.file_name.clone().unwrap_or_default();
        message.media_file_size = doc.file_length.unwrap_or(0) as i64;
    } else if let Some(sticker) = inner.sticker_message.as_ref() {
        message.kind = MessageKind::Sticker;
        message.media_mime_type = sticker.mimetype.clone().unwrap_or_default();
        message.media_file_size = sticker.file_length.unwrap_or(0) as i64;
    } else if let Some(reaction) = inner.reaction_message.as_ref() {
        let target = reaction.key.as_ref().and_then(|k| k.id.clone())?;
        message.kind = MessageKind::Reaction;
        message.reaction = Some(Reaction {
            target_message_id: target,
            emoji: reaction.text.clone().unwrap_or_default(),
            sender_jid,
        });
    } else if let Some(location) = inner.location_message.as_ref() {
        message.kind = MessageKind::Location;
        message.location = Some(Location {
            latitude: location.degrees_latitude.unwrap_or(0.0),
            longitude: location.degrees_longitude.unwrap_or(0.0),
            name: location.name.clone(),
            address: location.address.clone(),
        });
    } else if let Some(contact) = inner.contact_message.as_ref() {
        message.kind = MessageKind::Contact;
        message.contact_card = Some(ContactCard {
            name: contact.display_name.clone().unwrap_or_default(),
            phone: None,
            vcard: contact.vcard.clone(),
        });
    } else {
        return None;
    }

    Some(message)
}
