//! # wabridge-session
//!
//! Wraps the `whatsapp-rust` client behind the bridge's session service:
//! connection lifecycle, pairing, inbound ingest, outbound send, and the
//! sqlx-backed device store the library persists its keys into.

mod device_store;
mod ingest;
mod media;
mod outbound;
mod pairing;
pub mod qr;
mod runtime;
mod service;

#[cfg(test)]
mod tests;

pub use device_store::WaStore;
pub use pairing::{validate_phone_number, PairingUpdate, PAIRING_TIMEOUT};
pub use service::{SessionService, SessionState, SessionStatus};
