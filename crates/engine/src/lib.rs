//! Durable state of the notification core: notifications and read-state,
//! preferences, device tokens, the delivery queue and the dispatch
//! orchestrator that feeds it.

pub mod cursor;
pub mod devices;
pub mod dispatch;
pub mod notifications;
pub mod preferences;
pub mod queue;
pub mod recipients;
