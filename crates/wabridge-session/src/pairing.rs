//! Pairing flows: QR stream and phone-number code.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;
use wacore::pair_code::{PairCodeOptions, PlatformId};

use wabridge_core::error::BridgeError;

use crate::service::{SessionService, SessionState};

/// How long pairing may sit idle after the last code before it times out.
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(90);

/// Items on the QR pairing stream: any number of codes, then exactly one
/// terminal item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingUpdate {
    Qr { code: String },
    Success,
    Timeout,
    Error { message: String },
}

impl PairingUpdate {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Qr { .. })
    }
}

/// Validate an E.164-shaped phone number (leading `+` optional) and return
/// its digits.
pub fn validate_phone_number(phone: &str) -> Result<String, BridgeError> {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(BridgeError::InvalidArgument(format!(
            "invalid phone number '{phone}': digits only, optional leading '+'"
        )));
    }
    if !(7..=15).contains(&digits.len()) {
        return Err(BridgeError::InvalidArgument(format!(
            "invalid phone number '{phone}': expected 7-15 digits"
        )));
    }
    Ok(digits.to_string())
}

impl SessionService {
    /// Start QR pairing and return the update stream.
    ///
    /// The stream channel is installed before the library connection starts,
    /// so the first rotated code is never lost. If a code was already
    /// generated by a still-running pairing attempt it is replayed
    /// immediately.
    pub async fn pairing_qr(&self) -> Result<mpsc::Receiver<PairingUpdate>, BridgeError> {
        let _guard = self.lifecycle.lock().await;
        match self.shared.current_state() {
            SessionState::NotRegistered | SessionState::Pairing => {}
            _ => {
                return Err(BridgeError::FailedPrecondition(
                    "already paired; logout first".into(),
                ))
            }
        }

        let (tx, rx) = mpsc::channel(8);

        if let Some(code) = self.shared.last_qr.lock().await.clone() {
            let _ = tx.send(PairingUpdate::Qr { code }).await;
        }
        // Replaces any previous sender; a stale stream just ends.
        *self.shared.qr_tx.lock().await = Some(tx);
        *self
            .shared
            .last_pair_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = std::time::Instant::now();
        self.shared.set_state(SessionState::Pairing, "qr pairing started");

        // Subscribe-then-connect: only now does the library come up.
        if self.shared.client.lock().await.is_none() {
            if let Err(e) =
                crate::runtime::start(Arc::clone(&self.shared), &self.device_db_path).await
            {
                self.shared
                    .set_state(SessionState::NotRegistered, "pairing start failed");
                return Err(e);
            }
        }

        self.spawn_pairing_watchdog();
        Ok(rx)
    }

    /// Pair by phone number: returns the 8-character code to type on the
    /// phone.
    pub async fn pair_with_code(&self, phone: &str) -> Result<String, BridgeError> {
        let digits = validate_phone_number(phone)?;

        let mut rx = {
            let _guard = self.lifecycle.lock().await;
            match self.shared.current_state() {
                SessionState::NotRegistered | SessionState::Pairing => {}
                _ => {
                    return Err(BridgeError::FailedPrecondition(
                        "already paired; logout first".into(),
                    ))
                }
            }

            let (tx, rx) = mpsc::channel(1);
            *self.shared.code_tx.lock().await = Some(tx);
            *self
                .shared
                .last_pair_activity
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = std::time::Instant::now();
            self.shared
                .set_state(SessionState::Pairing, "phone pairing started");

            if self.shared.client.lock().await.is_none() {
                if let Err(e) =
                    crate::runtime::start(Arc::clone(&self.shared), &self.device_db_path).await
                {
                    self.shared
                        .set_state(SessionState::NotRegistered, "pairing start failed");
                    return Err(e);
                }
            }

            let client = self.shared.client_or_err().await?;
            client
                .pair_with_code(PairCodeOptions {
                    phone_number: digits,
                    platform_id: PlatformId::OtherWebClient,
                    show_push_notification: true,
                    ..Default::default()
                })
                .await
                .map_err(|e| {
                    BridgeError::Unavailable(format!("pair-with-code request failed: {e}"))
                })?;

            info!("phone pairing requested, waiting for code");
            rx
            // Lifecycle guard drops here; the wait below must not block other
            // session calls.
        };

        match tokio::time::timeout(PAIRING_TIMEOUT, rx.recv()).await {
            Ok(Some(code)) => Ok(code),
            Ok(None) => Err(BridgeError::Unavailable("pairing channel closed".into())),
            Err(_) => {
                self.shared.cancel_run();
                *self.shared.client.lock().await = None;
                self.shared
                    .set_state(SessionState::NotRegistered, "pairing timed out");
                Err(BridgeError::DeadlineExceeded("phone pairing code".into()))
            }
        }
    }

    /// Watch a QR pairing attempt and time it out after 90 s of silence.
    fn spawn_pairing_watchdog(&self) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if shared.current_state() != SessionState::Pairing {
                    return;
                }
                let idle = shared
                    .last_pair_activity
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .elapsed();
                if idle < PAIRING_TIMEOUT {
                    continue;
                }

                info!("pairing timed out after {}s of silence", idle.as_secs());
                if let Some(tx) = shared.qr_tx.lock().await.take() {
                    let _ = tx.send(PairingUpdate::Timeout).await;
                }
                shared.cancel_run();
                *shared.client.lock().await = None;
                shared.set_state(SessionState::NotRegistered, "pairing timed out");
                return;
            }
        });
    }
}
