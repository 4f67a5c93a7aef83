//! Bot lifecycle: building the library client and dispatching its events.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wacore::types::events::Event;
use whatsapp_rust::bot::Bot;
use whatsapp_rust_tokio_transport::TokioWebSocketTransportFactory;
use whatsapp_rust_ureq_http_client::UreqHttpClient;

use wabridge_core::error::BridgeError;
use wabridge_core::event::EventPayload;

use crate::device_store::WaStore;
use crate::ingest;
use crate::pairing::PairingUpdate;
use crate::service::{SessionState, Shared};

/// Build a bot over the device store and run it in the background.
///
/// The event handler updates the same shared handles regardless of which bot
/// generation is running; a fresh `CancellationToken` replaces any prior one.
pub(crate) async fn start(shared: Arc<Shared>, device_db_path: &str) -> Result<(), BridgeError> {
    let backend = Arc::new(WaStore::open(device_db_path).await?);

    let handler_shared = Arc::clone(&shared);
    let mut bot = Bot::builder()
        .with_backend(backend)
        .with_transport_factory(TokioWebSocketTransportFactory::new())
        .with_http_client(UreqHttpClient::new())
        .with_device_props(
            Some("wabridge".to_string()),
            None,
            Some(waproto::whatsapp::device_props::PlatformType::Desktop),
        )
        .on_event(move |event, client| {
            let shared = Arc::clone(&handler_shared);
            async move {
                dispatch(event, client, shared).await;
            }
        })
        .build()
        .await
        .map_err(|e| BridgeError::Unavailable(format!("whatsapp bot build failed: {e}")))?;

    // The client handle is usable for sends as soon as the bot exists.
    *shared.client.lock().await = Some(bot.client());

    let cancel = CancellationToken::new();
    {
        let mut slot = shared
            .run_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(cancel.clone()) {
            old.cancel();
        }
    }

    let handle = bot
        .run()
        .await
        .map_err(|e| BridgeError::Unavailable(format!("whatsapp bot run failed: {e}")))?;

    let loop_shared = Arc::clone(&shared);
    tokio::spawn(async move {
        tokio::select! {
            _ = handle => {
                info!("whatsapp event loop ended");
                *loop_shared.client.lock().await = None;
                if loop_shared.current_state() == SessionState::Connected {
                    loop_shared.set_state(SessionState::Disconnected, "event loop ended");
                }
            }
            _ = cancel.cancelled() => {
                debug!("whatsapp event loop cancelled");
            }
        }
    });

    info!("whatsapp bot started");
    Ok(())
}

/// Translate one library event into bridge state and bus traffic.
async fn dispatch(event: Event, client: Arc<whatsapp_rust::client::Client>, shared: Arc<Shared>) {
    match event {
        Event::PairingQrCode { code, .. } => {
            info!("pairing QR code generated");
            *shared.last_qr.lock().await = Some(code.clone());
            *shared
                .last_pair_activity
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = std::time::Instant::now();
            shared
                .bus
                .publish(EventPayload::PairingQr { code: code.clone() });
            if let Some(tx) = shared.qr_tx.lock().await.as_ref() {
                let _ = tx.send(PairingUpdate::Qr { code }).await;
            }
        }
        Event::PairingCode { code, .. } => {
            info!("phone pairing code received");
            *shared
                .last_pair_activity
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = std::time::Instant::now();
            shared
                .bus
                .publish(EventPayload::PairingCode { code: code.clone() });
            if let Some(tx) = shared.code_tx.lock().await.take() {
                let _ = tx.send(code).await;
            }
        }
        Event::PairSuccess(_) => {
            info!("pairing successful");
            *shared.last_qr.lock().await = None;
            if let Some(tx) = shared.qr_tx.lock().await.take() {
                let _ = tx.send(PairingUpdate::Success).await;
            }
        }
        Event::PairError(err) => {
            warn!("pairing failed: {err:?}");
            *shared.last_qr.lock().await = None;
            if let Some(tx) = shared.qr_tx.lock().await.take() {
                let _ = tx
                    .send(PairingUpdate::Error {
                        message: format!("{err:?}"),
                    })
                    .await;
            }
            shared.set_state(SessionState::NotRegistered, "pairing failed");
        }
        Event::Connected(_) => {
            *shared.client.lock().await = Some(client);
            *shared.last_qr.lock().await = None;
            // Connected can arrive without a preceding PairSuccess when the
            // session was already valid; close any waiting QR stream.
            if let Some(tx) = shared.qr_tx.lock().await.take() {
                let _ = tx.send(PairingUpdate::Success).await;
            }
            shared.set_state(SessionState::Connected, "connected");
        }
        Event::Disconnected(_) => {
            *shared.client.lock().await = None;
            if shared.current_state() != SessionState::NotRegistered {
                shared.set_state(SessionState::Disconnected, "library disconnected");
            }
        }
        Event::LoggedOut(_) => {
            warn!("logged out by phone");
            *shared.client.lock().await = None;
            shared.set_state(SessionState::NotRegistered, "logged out by phone");
        }
        Event::Message(msg, info) => {
            ingest::handle_library_message(&shared, &client, *msg, info).await;
        }
        Event::Receipt(receipt) => {
            ingest::handle_receipt(&shared, receipt).await;
        }
        other => {
            debug!(event = ?std::mem::discriminant(&other), "unhandled whatsapp event");
        }
    }
}
