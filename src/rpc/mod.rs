//! Binary RPC transport for the host GUI.
//!
//! Length-delimited frames over TCP, bincode-encoded envelopes. Unary calls
//! answer with one `Reply` frame followed by `End`; streaming calls
//! (`GetPairingQr`, `SubscribeEvents`) emit any number of `Reply` frames
//! sharing the request id before the terminal `End` or `Error`.

pub mod codec;
mod server;

pub use server::serve;
