use std::sync::Arc;

use chrono::Utc;
use waproto::whatsapp as wa;

use wabridge_core::bus::EventBus;
use wabridge_core::error::BridgeError;
use wabridge_core::jid::Jid;
use wabridge_core::model::MessageKind;
use wabridge_store::Store;

use crate::ingest::translate;
use crate::media::ext_for_mime;
use crate::pairing::{validate_phone_number, PairingUpdate};
use crate::qr::render_terminal;
use crate::service::{SessionService, SessionState};

/// Unique throwaway path for a device store; sqlite pools cannot share a
/// `:memory:` database across connections.
fn temp_device_db() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir()
        .join(format!("wabridge-test-{}-{n}.db_wa", std::process::id()))
        .to_string_lossy()
        .into_owned()
}

async fn test_service() -> SessionService {
    let store = Store::open_in_memory().await.unwrap();
    let bus = Arc::new(EventBus::new());
    SessionService::new(&temp_device_db(), None, store, bus)
        .await
        .unwrap()
}

fn chat() -> Jid {
    "15551234567@s.whatsapp.net".parse().unwrap()
}

fn sender() -> Jid {
    "15550001111@s.whatsapp.net".parse().unwrap()
}

#[tokio::test]
async fn fresh_service_is_not_registered() {
    let service = test_service().await;
    assert_eq!(service.state(), SessionState::NotRegistered);

    let status = service.status().await;
    assert!(!status.connected);
    assert!(status.jid.is_none());
}

#[tokio::test]
async fn connect_requires_pairing() {
    let service = test_service().await;
    let err = service.connect().await.unwrap_err();
    assert!(matches!(err, BridgeError::FailedPrecondition(_)));
}

#[tokio::test]
async fn send_rejects_empty_text() {
    let service = test_service().await;
    for text in ["", "   ", "\n\t"] {
        let err = service.send_text(&chat(), text).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)), "text {text:?}");
    }
}

#[tokio::test]
async fn send_rejects_oversized_text() {
    let service = test_service().await;
    let huge = "x".repeat(5000);
    let err = service.send_text(&chat(), &huge).await.unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArgument(_)));
}

#[tokio::test]
async fn send_without_client_reports_precondition() {
    let service = test_service().await;
    let err = service.send_text(&chat(), "hello").await.unwrap_err();
    // Not registered: the caller must pair first.
    assert!(matches!(err, BridgeError::FailedPrecondition(_)));
}

#[tokio::test]
async fn mark_read_requires_ids() {
    let service = test_service().await;
    let err = service.mark_as_read(&chat(), &[]).await.unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArgument(_)));
}

#[tokio::test]
async fn reaction_to_unknown_message_is_not_found() {
    let service = test_service().await;
    let err = service
        .send_reaction(&chat(), "missing-id", "👍")
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::NotFound(_)));
}

#[test]
fn phone_validation_accepts_e164() {
    assert_eq!(validate_phone_number("+15551234567").unwrap(), "15551234567");
    assert_eq!(validate_phone_number("15551234567").unwrap(), "15551234567");
}

#[test]
fn phone_validation_rejects_garbage() {
    for phone in ["", "+", "12345", "not-a-number", "+1555123456789012", "555 123"] {
        assert!(
            validate_phone_number(phone).is_err(),
            "expected failure for {phone:?}"
        );
    }
}

#[test]
fn pairing_updates_know_their_terminality() {
    assert!(!PairingUpdate::Qr { code: "x".into() }.is_terminal());
    assert!(PairingUpdate::Success.is_terminal());
    assert!(PairingUpdate::Timeout.is_terminal());
    assert!(PairingUpdate::Error { message: "x".into() }.is_terminal());
}

#[test]
fn qr_renders_half_blocks() {
    let rendered = render_terminal("2@abcdefg,hijklmnop,qrstuvw").unwrap();
    assert!(!rendered.is_empty());
    assert!(rendered.contains('█'));
    assert!(rendered.lines().count() > 10);
}

#[test]
fn mime_extensions_cover_the_common_cases() {
    assert_eq!(ext_for_mime("image/jpeg"), "jpg");
    assert_eq!(ext_for_mime("image/png"), "png");
    assert_eq!(ext_for_mime("audio/ogg; codecs=opus"), "ogg");
    assert_eq!(ext_for_mime("application/pdf"), "pdf");
    assert_eq!(ext_for_mime("video/quicktime"), "quicktime");
    assert_eq!(ext_for_mime(""), "bin");
}

#[test]
fn translate_plain_text() {
    let proto = wa::Message {
        conversation: Some("hello there".to_string()),
        ..Default::default()
    };
    let msg = translate(&proto, "M1", chat(), sender(), false, Utc::now()).unwrap();
    assert_eq!(msg.kind, MessageKind::Text);
    assert_eq!(msg.text, "hello there");
    assert!(!msg.is_from_me);
}

#[test]
fn translate_extended_text_carries_quote() {
    let proto = wa::Message {
        extended_text_message: Some(Box::new(wa::message::ExtendedTextMessage {
            text: Some("a reply".to_string()),
            context_info: Some(Box::new(wa::ContextInfo {
                stanza_id: Some("QUOTED".to_string()),
                ..Default::default()
            })),
            ..Default::default()
        })),
        ..Default::default()
    };
    let msg = translate(&proto, "M2", chat(), sender(), false, Utc::now()).unwrap();
    assert_eq!(msg.text, "a reply");
    assert_eq!(msg.quoted_message_id.as_deref(), Some("QUOTED"));
}

#[test]
fn translate_image_keeps_caption_and_mime() {
    let proto = wa::Message {
        image_message: Some(Box::new(wa::message::ImageMessage {
            caption: Some("the beach".to_string()),
            mimetype: Some("image/jpeg".to_string()),
            file_length: Some(1024),
            ..Default::default()
        })),
        ..Default::default()
    };
    let msg = translate(&proto, "M3", chat(), sender(), false, Utc::now()).unwrap();
    assert_eq!(msg.kind, MessageKind::Image);
    assert_eq!(msg.caption, "the beach");
    assert_eq!(msg.media_mime_type, "image/jpeg");
    assert_eq!(msg.media_file_size, 1024);
    assert!(msg.media_url.is_empty());
}

#[test]
fn translate_reaction_targets_key_id() {
    let proto = wa::Message {
        reaction_message: Some(Box::new(wa::message::ReactionMessage {
            key: Some(wa::MessageKey {
                id: Some("TARGET".to_string()),
                ..Default::default()
            }),
            text: Some("👍".to_string()),
            ..Default::default()
        })),
        ..Default::default()
    };
    let msg = translate(&proto, "R1", chat(), sender(), false, Utc::now()).unwrap();
    assert_eq!(msg.kind, MessageKind::Reaction);
    let reaction = msg.reaction.unwrap();
    assert_eq!(reaction.target_message_id, "TARGET");
    assert_eq!(reaction.emoji, "👍");
    assert_eq!(reaction.sender_jid, sender());
}

#[test]
fn translate_unwraps_ephemeral_wrapper() {
    let inner = wa::Message {
        conversation: Some("wrapped".to_string()),
        ..Default::default()
    };
    let proto = wa::Message {
        ephemeral_message: Some(Box::new(wa::message::FutureProofMessage {
            message: Some(Box::new(inner)),
            ..Default::default()
        })),
        ..Default::default()
    };
    let msg = translate(&proto, "M4", chat(), sender(), false, Utc::now()).unwrap();
    assert_eq!(msg.text, "wrapped");
}

#[test]
fn translate_ignores_unsupported_payloads() {
    let proto = wa::Message::default();
    assert!(translate(&proto, "M5", chat(), sender(), false, Utc::now()).is_none());
}

#[test]
fn translate_location() {
    let proto = wa::Message {
        location_message: Some(Box::new(wa::message::LocationMessage {
            degrees_latitude: Some(52.52),
            degrees_longitude: Some(13.405),
            name: Some("Berlin".to_string()),
            ..Default::default()
        })),
        ..Default::default()
    };
    let msg = translate(&proto, "M6", chat(), sender(), false, Utc::now()).unwrap();
    assert_eq!(msg.kind, MessageKind::Location);
    let location = msg.location.unwrap();
    assert_eq!(location.latitude, 52.52);
    assert_eq!(location.name.as_deref(), Some("Berlin"));
}
