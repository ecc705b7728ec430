//! PEERQUIZ Core - Wire Protocol and Domain Types
//!
//! Shared types for the peerquiz relay: the JSON wire protocol spoken
//! with browser clients, the change-feed notification shapes received
//! from the backend store, and the core error enum.
//!
//! This crate is deliberately I/O-free: everything here is plain data
//! plus serde, so both the relay and any future consumer (CLI tooling,
//! load generators) can depend on it without pulling in a runtime.

pub mod change;
pub mod error;
pub mod protocol;

pub use change::{ChangeEvent, ChangeNotification, ChangeOp};
pub use error::CoreError;
pub use protocol::{ClientMessage, ServerMessage};
