//! Realtime connection manager: live connection registry, wire protocol and
//! per-connection session state machine.

pub mod protocol;
pub mod registry;
pub mod session;
