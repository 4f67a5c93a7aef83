//! The session service: owner of the single library client and its state
//! machine.
//!
//! All state-changing calls serialize through one lifecycle mutex, so
//! concurrent `connect` calls observe the same in-flight outcome. Queries
//! read atomically-updated snapshots and never take the lifecycle lock.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use whatsapp_rust::client::Client;

use wabridge_core::bus::EventBus;
use wabridge_core::error::BridgeError;
use wabridge_core::event::EventPayload;
use wabridge_core::jid::Jid;
use wabridge_store::Store;

use crate::device_store::WaStore;
use crate::pairing::PairingUpdate;

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No device in the store; pairing required.
    NotRegistered,
    /// Paired but not connected.
    Disconnected,
    /// Connect requested, waiting for the library.
    Connecting,
    /// Live socket, events flowing.
    Connected,
    /// QR or phone-code pairing in progress.
    Pairing,
}

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub connected: bool,
    pub jid: Option<String>,
    pub push_name: Option<String>,
}

/// State shared with the library event handler.
pub(crate) struct Shared {
    pub(crate) store: Store,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) media_dir: Option<PathBuf>,
    /// Client handle, set while a bot is running.
    pub(crate) client: Mutex<Option<Arc<Client>>>,
    pub(crate) state: std::sync::Mutex<SessionState>,
    /// Sender for the live pairing-QR stream, when one is attached.
    pub(crate) qr_tx: Mutex<Option<mpsc::Sender<PairingUpdate>>>,
    /// Sender for the 8-character phone pairing code.
    pub(crate) code_tx: Mutex<Option<mpsc::Sender<String>>>,
    /// Last QR code data, buffered so a late stream attach still sees it.
    pub(crate) last_qr: Mutex<Option<String>>,
    /// Instant of the last pairing activity, for the 90 s timeout window.
    pub(crate) last_pair_activity: std::sync::Mutex<std::time::Instant>,
    /// Cancels the running bot task.
    pub(crate) run_cancel: std::sync::Mutex<Option<CancellationToken>>,
}

impl Shared {
    pub(crate) fn current_state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Transition the state machine, publishing `ConnectionStatus` on change.
    pub(crate) fn set_state(&self, next: SessionState, reason: &str) {
        let changed = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            info!("session state -> {next:?} ({reason})");
            self.bus.publish(EventPayload::ConnectionStatus {
                connected: next == SessionState::Connected,
                reason: reason.to_string(),
            });
        }
    }

    /// The live client, or the state-appropriate error when there is none.
    pub(crate) async fn client_or_err(&self) -> Result<Arc<Client>, BridgeError> {
        if let Some(client) = self.client.lock().await.as_ref() {
            return Ok(Arc::clone(client));
        }
        match self.current_state() {
            SessionState::NotRegistered => Err(BridgeError::FailedPrecondition(
                "not paired with a phone yet".into(),
            )),
            _ => Err(BridgeError::Unavailable("whatsapp is not connected".into())),
        }
    }

    pub(crate) fn cancel_run(&self) {
        let token = self
            .run_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }
}

/// Owns the WhatsApp session on behalf of the whole daemon.
pub struct SessionService {
    pub(crate) device_db_path: String,
    pub(crate) shared: Arc<Shared>,
    /// Serializes connect/disconnect/logout/pairing starts.
    pub(crate) lifecycle: Mutex<()>,
}

impl SessionService {
    /// Open the device store and size up the initial state.
    pub async fn new(
        device_db_path: &str,
        media_dir: Option<PathBuf>,
        store: Store,
        bus: Arc<EventBus>,
    ) -> Result<Self, BridgeError> {
        let backend = WaStore::open(device_db_path).await?;
        let registered = backend.device_exists().await?;
        backend.close().await;

        let initial = if registered {
            SessionState::Disconnected
        } else {
            SessionState::NotRegistered
        };
        info!(
            "session service ready (registered: {registered}, device store: {device_db_path})"
        );

        Ok(Self {
            device_db_path: device_db_path.to_string(),
            shared: Arc::new(Shared {
                store,
                bus,
                media_dir,
                client: Mutex::new(None),
                state: std::sync::Mutex::new(initial),
                qr_tx: Mutex::new(None),
                code_tx: Mutex::new(None),
                last_qr: Mutex::new(None),
                last_pair_activity: std::sync::Mutex::new(std::time::Instant::now()),
                run_cancel: std::sync::Mutex::new(None),
            }),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn state(&self) -> SessionState {
        self.shared.current_state()
    }

    /// Current status snapshot, including identity when connected.
    pub async fn status(&self) -> SessionStatus {
        let state = self.shared.current_state();
        let client = self.shared.client.lock().await.clone();
        let (jid, push_name) = match (&client, state) {
            (Some(client), SessionState::Connected) => (
                client.get_pn().await.map(|j| j.to_string()),
                Some(client.get_push_name().await),
            ),
            _ => (None, None),
        };
        SessionStatus {
            state,
            connected: state == SessionState::Connected,
            jid,
            push_name,
        }
    }

    /// Domain JID of the paired account, when known.
    pub async fn own_jid(&self) -> Option<Jid> {
        let client = self.shared.client.lock().await.clone()?;
        let pn = client.get_pn().await?;
        pn.to_string().parse().ok()
    }

    /// Bring the session up. A no-op while connecting or connected;
    /// refuses when no device is paired.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        let _guard = self.lifecycle.lock().await;
        match self.shared.current_state() {
            SessionState::NotRegistered => Err(BridgeError::FailedPrecondition(
                "not paired with a phone yet".into(),
            )),
            SessionState::Pairing => Err(BridgeError::FailedPrecondition(
                "pairing in progress".into(),
            )),
            SessionState::Connecting | SessionState::Connected => Ok(()),
            SessionState::Disconnected => {
                self.shared
                    .set_state(SessionState::Connecting, "connect requested");
                if let Err(e) =
                    crate::runtime::start(Arc::clone(&self.shared), &self.device_db_path).await
                {
                    self.shared
                        .set_state(SessionState::Disconnected, "connect failed");
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Drop the connection but keep the pairing.
    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        let _guard = self.lifecycle.lock().await;
        if let Some(client) = self.shared.client.lock().await.take() {
            client.disconnect().await;
        }
        self.shared.cancel_run();
        if self.shared.current_state() != SessionState::NotRegistered {
            self.shared
                .set_state(SessionState::Disconnected, "disconnect requested");
        }
        Ok(())
    }

    /// Tear down the pairing entirely: disconnect and wipe the device store.
    pub async fn logout(&self) -> Result<(), BridgeError> {
        let _guard = self.lifecycle.lock().await;
        if let Some(client) = self.shared.client.lock().await.take() {
            client.disconnect().await;
        }
        self.shared.cancel_run();
        *self.shared.last_qr.lock().await = None;

        // The library will not pair again over stale keys; remove the device
        // database and its WAL sidecars.
        for suffix in ["", "-wal", "-shm"] {
            let path = format!("{}{}", self.device_db_path, suffix);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove {path}: {e}");
                }
            }
        }

        self.shared.set_state(SessionState::NotRegistered, "logged out");
        Ok(())
    }
}
