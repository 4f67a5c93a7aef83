//! # wabridge-core
//!
//! Domain types, error taxonomy, configuration, and the in-process event bus
//! for the wabridge daemon.

pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod jid;
pub mod model;

pub use config::shellexpand;
