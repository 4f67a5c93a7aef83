//! The message service: the one surface every transport consumes.
//!
//! Thin orchestration over the repositories and the session service. Errors
//! pass through unchanged; every method honors the caller's cancellation
//! token; no retries happen at this layer.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use wabridge_core::bus::{EventBus, Subscription};
use wabridge_core::error::BridgeError;
use wabridge_core::event::EventKind;
use wabridge_core::jid::Jid;
use wabridge_core::model::{Chat, Message};
use wabridge_session::{PairingUpdate, SessionService, SessionStatus};
use wabridge_store::Store;

/// Resolve the future unless the token fires first.
async fn with_cancel<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, BridgeError>>,
) -> Result<T, BridgeError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(BridgeError::Canceled),
        res = fut => res,
    }
}

fn parse_jid(raw: &str) -> Result<Jid, BridgeError> {
    raw.parse()
}

pub struct MessageService {
    store: Store,
    session: Arc<SessionService>,
    bus: Arc<EventBus>,
}

impl MessageService {
    pub fn new(store: Store, session: Arc<SessionService>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            session,
            bus,
        }
    }

    /// Attach a bus subscription; an empty filter receives every event.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.bus.subscribe(kinds)
    }

    pub async fn get_chats(
        &self,
        cancel: &CancellationToken,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Chat>, BridgeError> {
        with_cancel(cancel, self.store.chats().list(limit.max(0), offset.max(0))).await
    }

    pub async fn get_messages(
        &self,
        cancel: &CancellationToken,
        chat_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, BridgeError> {
        let jid = parse_jid(chat_id)?;
        with_cancel(
            cancel,
            self.store
                .messages()
                .get_by_chat(&jid, limit.max(0), offset.max(0)),
        )
        .await
    }

    pub async fn get_messages_since(
        &self,
        cancel: &CancellationToken,
        chat_id: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Message>, BridgeError> {
        let jid = parse_jid(chat_id)?;
        with_cancel(
            cancel,
            self.store
                .messages()
                .get_by_chat_since(&jid, since, limit.max(0)),
        )
        .await
    }

    pub async fn search_messages(
        &self,
        cancel: &CancellationToken,
        query: &str,
        limit: i64,
    ) -> Result<Vec<Message>, BridgeError> {
        if query.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("search query is empty".into()));
        }
        with_cancel(cancel, self.store.messages().search(query, limit.max(0))).await
    }

    pub async fn send_text(
        &self,
        cancel: &CancellationToken,
        chat_id: &str,
        text: &str,
    ) -> Result<Message, BridgeError> {
        let jid = parse_jid(chat_id)?;
        with_cancel(cancel, self.session.send_text(&jid, text)).await
    }

    pub async fn send_reaction(
        &self,
        cancel: &CancellationToken,
        chat_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<Message, BridgeError> {
        let jid = parse_jid(chat_id)?;
        with_cancel(cancel, self.session.send_reaction(&jid, message_id, emoji)).await
    }

    /// Returns the chat's recomputed unread count.
    pub async fn mark_read(
        &self,
        cancel: &CancellationToken,
        chat_id: &str,
        message_ids: &[String],
    ) -> Result<i64, BridgeError> {
        let jid = parse_jid(chat_id)?;
        with_cancel(cancel, self.session.mark_as_read(&jid, message_ids)).await
    }

    pub async fn status(&self, cancel: &CancellationToken) -> Result<SessionStatus, BridgeError> {
        with_cancel(cancel, async { Ok(self.session.status().await) }).await
    }

    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), BridgeError> {
        with_cancel(cancel, self.session.connect()).await
    }

    pub async fn disconnect(&self, cancel: &CancellationToken) -> Result<(), BridgeError> {
        with_cancel(cancel, self.session.disconnect()).await
    }

    pub async fn logout(&self, cancel: &CancellationToken) -> Result<(), BridgeError> {
        with_cancel(cancel, self.session.logout()).await
    }

    pub async fn pairing_qr(
        &self,
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<PairingUpdate>, BridgeError> {
        with_cancel(cancel, self.session.pairing_qr()).await
    }

    pub async fn pair_with_code(
        &self,
        cancel: &CancellationToken,
        phone: &str,
    ) -> Result<String, BridgeError> {
        with_cancel(cancel, self.session.pair_with_code(phone)).await
    }
}
