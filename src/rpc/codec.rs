//! Wire envelopes for the binary RPC surface.

use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use wabridge_core::error::{BridgeError, StatusCode};
use wabridge_core::event::{Event, EventKind};
use wabridge_core::model::{Chat, Message};
use wabridge_session::{PairingUpdate, SessionStatus};

/// Upper bound for a single frame. Pages of messages stay far below this.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Length-prefix codec shared by server and clients.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// A client request with its correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub request: RpcRequest,
}

/// The full command surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcRequest {
    // Session
    Status,
    Connect,
    Disconnect,
    Logout,
    GetPairingQr,
    PairWithCode { phone: String },
    // Query
    ListChats { limit: i64, offset: i64 },
    GetMessages { chat_id: String, limit: i64, offset: i64 },
    GetMessagesSince { chat_id: String, since_unix_ms: i64, limit: i64 },
    SearchMessages { query: String, limit: i64 },
    // Mutate
    SendMessage { chat_id: String, text: String },
    SendReaction { chat_id: String, message_id: String, emoji: String },
    MarkRead { chat_id: String, message_ids: Vec<String> },
    // Observe
    SubscribeEvents { kinds: Vec<EventKind> },
}

impl RpcRequest {
    /// Method name for request logging.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Status => "Status",
            Self::Connect => "Connect",
            Self::Disconnect => "Disconnect",
            Self::Logout => "Logout",
            Self::GetPairingQr => "GetPairingQr",
            Self::PairWithCode { .. } => "PairWithCode",
            Self::ListChats { .. } => "ListChats",
            Self::GetMessages { .. } => "GetMessages",
            Self::GetMessagesSince { .. } => "GetMessagesSince",
            Self::SearchMessages { .. } => "SearchMessages",
            Self::SendMessage { .. } => "SendMessage",
            Self::SendReaction { .. } => "SendReaction",
            Self::MarkRead { .. } => "MarkRead",
            Self::SubscribeEvents { .. } => "SubscribeEvents",
        }
    }
}

/// One response frame, correlated by request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseBody {
    /// A payload frame; streams emit several.
    Reply(RpcReply),
    /// Successful end of the response stream.
    End,
    /// Terminal failure for this request.
    Error { code: StatusCode, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcReply {
    Status(SessionStatus),
    Chats(Vec<Chat>),
    Messages(Vec<Message>),
    Sent(Box<Message>),
    Unread { count: i64 },
    PairingCode { code: String },
    Pairing(PairingUpdate),
    Event(Box<Event>),
    Ack,
}

pub fn encode_request(frame: &RequestFrame) -> Result<Vec<u8>, BridgeError> {
    bincode::serialize(frame).map_err(|e| BridgeError::Internal(format!("encode failed: {e}")))
}

pub fn decode_request(bytes: &[u8]) -> Result<RequestFrame, BridgeError> {
    bincode::deserialize(bytes)
        .map_err(|e| BridgeError::InvalidArgument(format!("malformed request frame: {e}")))
}

pub fn encode_response(frame: &ResponseFrame) -> Result<Vec<u8>, BridgeError> {
    bincode::serialize(frame).map_err(|e| BridgeError::Internal(format!("encode failed: {e}")))
}

pub fn decode_response(bytes: &[u8]) -> Result<ResponseFrame, BridgeError> {
    bincode::deserialize(bytes)
        .map_err(|e| BridgeError::InvalidArgument(format!("malformed response frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frames_round_trip() {
        let frames = vec![
            RequestFrame {
                id: 1,
                request: RpcRequest::Status,
            },
            RequestFrame {
                id: 2,
                request: RpcRequest::SendMessage {
                    chat_id: "15551234567@s.whatsapp.net".to_string(),
                    text: "hi".to_string(),
                },
            },
            RequestFrame {
                id: 3,
                request: RpcRequest::SubscribeEvents {
                    kinds: vec![EventKind::MessageSent, EventKind::MessageRead],
                },
            },
        ];
        for frame in frames {
            let bytes = encode_request(&frame).unwrap();
            let back = decode_request(&bytes).unwrap();
            assert_eq!(back.id, frame.id);
            assert_eq!(back.request.method(), frame.request.method());
        }
    }

    #[test]
    fn response_frames_round_trip() {
        let frame = ResponseFrame {
            id: 7,
            body: ResponseBody::Error {
                code: StatusCode::FailedPrecondition,
                message: "not paired".to_string(),
            },
        };
        let bytes = encode_response(&frame).unwrap();
        let back = decode_response(&bytes).unwrap();
        assert_eq!(back.id, 7);
        match back.body {
            ResponseBody::Error { code, message } => {
                assert_eq!(code, StatusCode::FailedPrecondition);
                assert_eq!(message, "not paired");
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn event_frames_survive_bincode() {
        use wabridge_core::event::EventPayload;
        let event = Event::now(EventPayload::ConnectionStatus {
            connected: true,
            reason: "connected".to_string(),
        });
        let frame = ResponseFrame {
            id: 9,
            body: ResponseBody::Reply(RpcReply::Event(Box::new(event))),
        };
        let bytes = encode_response(&frame).unwrap();
        let back = decode_response(&bytes).unwrap();
        match back.body {
            ResponseBody::Reply(RpcReply::Event(event)) => {
                assert_eq!(event.kind(), EventKind::ConnectionStatus);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(decode_request(&[0xff; 16]).is_err());
    }
}
