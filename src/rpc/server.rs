//! RPC server: accept loop, per-connection framing, interceptors.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use wabridge_core::error::{BridgeError, StatusCode};

use crate::messaging::MessageService;

use super::codec::{
    decode_request, encode_response, frame_codec, RequestFrame, ResponseBody, ResponseFrame,
    RpcReply, RpcRequest,
};

/// How long in-flight requests get to finish after shutdown begins.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// Run the RPC server.
///
/// The listener is bound before `ready` fires, so a caller that has seen the
/// ready signal can connect immediately.
pub async fn serve(
    addr: &str,
    service: Arc<MessageService>,
    cancel: CancellationToken,
    ready: oneshot::Sender<SocketAddr>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let _ = ready.send(local);
    info!("rpc listening on {local}");

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("rpc connection from {peer}");
                        let service = Arc::clone(&service);
                        let conn_cancel = cancel.child_token();
                        connections.spawn(handle_connection(stream, service, conn_cancel));
                    }
                    Err(e) => {
                        warn!("rpc accept failed: {e}");
                    }
                }
            }
        }
    }

    // Graceful stop: no new connections, drain in-flight work, then abort.
    info!("rpc draining connections");
    let drained = tokio::time::timeout(DRAIN_DEADLINE, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("rpc drain deadline exceeded, forcing stop");
        connections.shutdown().await;
    }
    Ok(())
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    service: Arc<MessageService>,
    cancel: CancellationToken,
) {
    let framed = Framed::new(stream, frame_codec());
    let (mut sink, mut source) = framed.split();

    // All responses funnel through one writer so frames never interleave.
    let (tx, mut rx) = mpsc::channel::<ResponseFrame>(256);
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let bytes = match encode_response(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("rpc response encode failed: {e}");
                    continue;
                }
            };
            if sink.send(bytes.into()).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut requests = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = source.next() => {
                match frame {
                    Some(Ok(bytes)) => {
                        match decode_request(&bytes) {
                            Ok(request) => {
                                let service = Arc::clone(&service);
                                let tx = tx.clone();
                                let req_cancel = cancel.child_token();
                                requests.spawn(handle_request(service, request, tx, req_cancel));
                            }
                            Err(e) => {
                                warn!("dropping malformed rpc frame: {e}");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        debug!("rpc read error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    drop(tx);
    while requests.join_next().await.is_some() {}
    let _ = writer.await;
}

/// Interceptor wrapper: panic recovery plus structured request logging.
async fn handle_request(
    service: Arc<MessageService>,
    request: RequestFrame,
    tx: mpsc::Sender<ResponseFrame>,
    cancel: CancellationToken,
) {
    let method = request.request.method();
    let id = request.id;
    let started = Instant::now();

    let outcome = AssertUnwindSafe(dispatch(service, request.request, id, tx.clone(), &cancel))
        .catch_unwind()
        .await;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(Ok(())) => {
            info!(method, status = "OK", elapsed_ms, "rpc");
            send(&tx, id, ResponseBody::End).await;
        }
        Ok(Err(e)) => {
            let code = e.code();
            info!(method, status = ?code, elapsed_ms, "rpc");
            send(
                &tx,
                id,
                ResponseBody::Error {
                    code,
                    message: e.to_string(),
                },
            )
            .await;
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(method, elapsed_ms, panic = %message, "rpc handler panicked");
            send(
                &tx,
                id,
                ResponseBody::Error {
                    code: StatusCode::Internal,
                    message: "internal error".to_string(),
                },
            )
            .await;
        }
    }
}

async fn send(tx: &mpsc::Sender<ResponseFrame>, id: u64, body: ResponseBody) {
    let _ = tx.send(ResponseFrame { id, body }).await;
}

async fn reply(tx: &mpsc::Sender<ResponseFrame>, id: u64, reply: RpcReply) -> bool {
    tx.send(ResponseFrame {
        id,
        body: ResponseBody::Reply(reply),
    })
    .await
    .is_ok()
}

async fn dispatch(
    service: Arc<MessageService>,
    request: RpcRequest,
    id: u64,
    tx: mpsc::Sender<ResponseFrame>,
    cancel: &CancellationToken,
) -> Result<(), BridgeError> {
    match request {
        RpcRequest::Status => {
            let status = service.status(cancel).await?;
            reply(&tx, id, RpcReply::Status(status)).await;
        }
        RpcRequest::Connect => {
            service.connect(cancel).await?;
            reply(&tx, id, RpcReply::Ack).await;
        }
        RpcRequest::Disconnect => {
            service.disconnect(cancel).await?;
            reply(&tx, id, RpcReply::Ack).await;
        }
        RpcRequest::Logout => {
            service.logout(cancel).await?;
            reply(&tx, id, RpcReply::Ack).await;
        }
        RpcRequest::GetPairingQr => {
            let mut updates = service.pairing_qr(cancel).await?;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BridgeError::Canceled),
                    update = updates.recv() => {
                        let Some(update) = update else { break };
                        let terminal = update.is_terminal();
                        if !reply(&tx, id, RpcReply::Pairing(update)).await || terminal {
                            break;
                        }
                    }
                }
            }
        }
        RpcRequest::PairWithCode { phone } => {
            let code = service.pair_with_code(cancel, &phone).await?;
            reply(&tx, id, RpcReply::PairingCode { code }).await;
        }
        RpcRequest::ListChats { limit, offset } => {
            let chats = service.get_chats(cancel, limit, offset).await?;
            reply(&tx, id, RpcReply::Chats(chats)).await;
        }
        RpcRequest::GetMessages {
            chat_id,
            limit,
            offset,
        } => {
            let messages = service.get_messages(cancel, &chat_id, limit, offset).await?;
            reply(&tx, id, RpcReply::Messages(messages)).await;
        }
        RpcRequest::GetMessagesSince {
            chat_id,
            since_unix_ms,
            limit,
        } => {
            let since = chrono::DateTime::from_timestamp_millis(since_unix_ms).ok_or_else(|| {
                BridgeError::InvalidArgument(format!("invalid since timestamp {since_unix_ms}"))
            })?;
            let messages = service
                .get_messages_since(cancel, &chat_id, since, limit)
                .await?;
            reply(&tx, id, RpcReply::Messages(messages)).await;
        }
        RpcRequest::SearchMessages { query, limit } => {
            let messages = service.search_messages(cancel, &query, limit).await?;
            reply(&tx, id, RpcReply::Messages(messages)).await;
        }
        RpcRequest::SendMessage { chat_id, text } => {
            let message = service.send_text(cancel, &chat_id, &text).await?;
            reply(&tx, id, RpcReply::Sent(Box::new(message))).await;
        }
        RpcRequest::SendReaction {
            chat_id,
            message_id,
            emoji,
        } => {
            let message = service
                .send_reaction(cancel, &chat_id, &message_id, &emoji)
                .await?;
            reply(&tx, id, RpcReply::Sent(Box::new(message))).await;
        }
        RpcRequest::MarkRead {
            chat_id,
            message_ids,
        } => {
            let count = service.mark_read(cancel, &chat_id, &message_ids).await?;
            reply(&tx, id, RpcReply::Unread { count }).await;
        }
        RpcRequest::SubscribeEvents { kinds } => {
            let mut sub = service.subscribe(&kinds);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = sub.recv() => {
                        let Some(event) = event else { break };
                        if !reply(&tx, id, RpcReply::Event(Box::new(event))).await {
                            break;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use wabridge_core::bus::EventBus;
    use wabridge_core::event::EventPayload;
    use wabridge_session::{SessionService, SessionState};
    use wabridge_store::Store;

    use crate::rpc::codec::encode_request;

    fn temp_device_db() -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir()
            .join(format!("wabridge-rpc-{}-{n}.db_wa", std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    async fn start_server() -> (SocketAddr, Arc<EventBus>, CancellationToken) {
        let store = Store::open_in_memory().await.unwrap();
        let bus = Arc::new(EventBus::new());
        let session = Arc::new(
            SessionService::new(&temp_device_db(), None, store.clone(), Arc::clone(&bus))
                .await
                .unwrap(),
        );
        let service = Arc::new(MessageService::new(store, session, Arc::clone(&bus)));
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(serve(
            "127.0.0.1:0",
            Arc::clone(&service),
            cancel.clone(),
            ready_tx,
        ));
        let addr = ready_rx.await.unwrap();
        (addr, bus, cancel)
    }

    async fn call(
        conn: &mut Framed<tokio::net::TcpStream, tokio_util::codec::LengthDelimitedCodec>,
        id: u64,
        request: RpcRequest,
    ) -> Vec<ResponseFrame> {
        let bytes = encode_request(&RequestFrame { id, request }).unwrap();
        conn.send(bytes.into()).await.unwrap();
        let mut frames = Vec::new();
        loop {
            let frame = conn.next().await.unwrap().unwrap();
            let frame = super::super::codec::decode_response(&frame).unwrap();
            assert_eq!(frame.id, id);
            let done = !matches!(frame.body, ResponseBody::Reply(_));
            frames.push(frame);
            if done {
                break;
            }
        }
        frames
    }

    /// The ready signal only fires once the listener accepts connections.
    #[tokio::test]
    async fn ready_signal_means_accepting() {
        let (addr, _bus, _cancel) = start_server().await;
        let stream = tokio::net::TcpStream::connect(addr).await;
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn status_round_trip() {
        let (addr, _bus, _cancel) = start_server().await;
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut conn = Framed::new(stream, frame_codec());

        let frames = call(&mut conn, 1, RpcRequest::Status).await;
        assert_eq!(frames.len(), 2);
        match &frames[0].body {
            ResponseBody::Reply(RpcReply::Status(status)) => {
                assert_eq!(status.state, SessionState::NotRegistered);
            }
            other => panic!("unexpected body: {other:?}"),
        }
        assert!(matches!(frames[1].body, ResponseBody::End));
    }

    #[tokio::test]
    async fn connect_while_unpaired_is_failed_precondition() {
        let (addr, _bus, _cancel) = start_server().await;
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut conn = Framed::new(stream, frame_codec());

        let frames = call(&mut conn, 2, RpcRequest::Connect).await;
        match &frames[0].body {
            ResponseBody::Error { code, .. } => {
                assert_eq!(*code, StatusCode::FailedPrecondition);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_send_is_invalid_argument() {
        let (addr, _bus, _cancel) = start_server().await;
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut conn = Framed::new(stream, frame_codec());

        let frames = call(
            &mut conn,
            3,
            RpcRequest::SendMessage {
                chat_id: "15551234567@s.whatsapp.net".to_string(),
                text: "   ".to_string(),
            },
        )
        .await;
        match &frames[0].body {
            ResponseBody::Error { code, .. } => assert_eq!(*code, StatusCode::InvalidArgument),
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_events_streams_filtered_bus_traffic() {
        let (addr, bus, _cancel) = start_server().await;
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut conn = Framed::new(stream, frame_codec());

        let bytes = encode_request(&RequestFrame {
            id: 4,
            request: RpcRequest::SubscribeEvents {
                kinds: vec![wabridge_core::event::EventKind::ConnectionStatus],
            },
        })
        .unwrap();
        conn.send(bytes.into()).await.unwrap();

        // Give the subscription a moment to attach before publishing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.publish(EventPayload::PairingQr {
            code: "filtered out".to_string(),
        });
        bus.publish(EventPayload::ConnectionStatus {
            connected: false,
            reason: "test".to_string(),
        });

        // The filtered subscription only ever sees the status event.
        let frame = tokio::time::timeout(Duration::from_secs(2), conn.next())
            .await
            .expect("expected an event frame")
            .unwrap()
            .unwrap();
        let frame = super::super::codec::decode_response(&frame).unwrap();
        match frame.body {
            ResponseBody::Reply(RpcReply::Event(event)) => {
                assert_eq!(
                    event.kind(),
                    wabridge_core::event::EventKind::ConnectionStatus
                );
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
