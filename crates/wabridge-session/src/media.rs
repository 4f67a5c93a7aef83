//! Opt-in media downloads.
//!
//! When a media directory is configured, payloads are fetched per message and
//! written flat as `{message_id}.{ext}`. Failures never block ingest: the
//! message row keeps an empty `media_url` and the event still fires.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use waproto::whatsapp as wa;
use whatsapp_rust::client::Client;

use wabridge_core::model::{Message, MessageKind};

use crate::service::Shared;

/// Whether this message carries a payload worth downloading.
pub(crate) fn wants_download(message: &Message) -> bool {
    matches!(
        message.kind,
        MessageKind::Image
            | MessageKind::Video
            | MessageKind::Audio
            | MessageKind::Document
            | MessageKind::Sticker
    )
}

/// File extension for a mime type, defaulting to the raw subtype.
pub(crate) fn ext_for_mime(mime: &str) -> String {
    let essence = mime.split(';').next().unwrap_or("").trim();
    match essence {
        "image/jpeg" => "jpg".to_string(),
        "image/png" => "png".to_string(),
        "image/webp" => "webp".to_string(),
        "image/gif" => "gif".to_string(),
        "video/mp4" => "mp4".to_string(),
        "audio/ogg" => "ogg".to_string(),
        "audio/mpeg" => "mp3".to_string(),
        "audio/mp4" => "m4a".to_string(),
        "application/pdf" => "pdf".to_string(),
        other => other
            .split('/')
            .nth(1)
            .filter(|s| !s.is_empty())
            .unwrap_or("bin")
            .to_string(),
    }
}

/// Fetch the payload behind `message` and record the resulting file path.
/// Best-effort: logs and returns on any failure.
pub(crate) async fn download_into(
    shared: &Arc<Shared>,
    client: &Arc<Client>,
    raw: &wa::Message,
    message: &mut Message,
) {
    let Some(dir) = shared.media_dir.clone() else {
        return;
    };

    // Look through the same wrappers the translator unwraps.
    let inner = raw
        .device_sent_message
        .as_ref()
        .and_then(|d| d.message.as_deref())
        .or_else(|| {
            raw.ephemeral_message
                .as_ref()
                .and_then(|e| e.message.as_deref())
        })
        .or_else(|| {
            raw.view_once_message
                .as_ref()
                .and_then(|v| v.message.as_deref())
        })
        .unwrap_or(raw);

    let bytes = match message.kind {
        MessageKind::Image => match inner.image_message.as_ref() {
            Some(img) => client.download(img.as_ref()).await,
            None => return,
        },
        MessageKind::Video => match inner.video_message.as_ref() {
            Some(video) => client.download(video.as_ref()).await,
            None => return,
        },
        MessageKind::Audio => match inner.audio_message.as_ref() {
            Some(audio) => client.download(audio.as_ref()).await,
            None => return,
        },
        MessageKind::Document => match inner.document_message.as_ref() {
            Some(doc) => client.download(doc.as_ref()).await,
            None => return,
        },
        MessageKind::Sticker => match inner.sticker_message.as_ref() {
            Some(sticker) => client.download(sticker.as_ref()).await,
            None => return,
        },
        _ => return,
    };

    let bytes = match bytes {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("media download failed for {}: {e}", message.id);
            return;
        }
    };

    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        warn!("failed to create media dir {}: {e}", dir.display());
        return;
    }

    let ext = ext_for_mime(&message.media_mime_type);
    let path: PathBuf = dir.join(format!("{}.{ext}", message.id));
    match tokio::fs::write(&path, &bytes).await {
        Ok(()) => {
            info!("downloaded media for {} ({} bytes)", message.id, bytes.len());
            message.media_url = path.to_string_lossy().into_owned();
            if message.media_file_size == 0 {
                message.media_file_size = bytes.len() as i64;
            }
        }
        Err(e) => {
            warn!("failed to write media file {}: {e}", path.display());
        }
    }
}
