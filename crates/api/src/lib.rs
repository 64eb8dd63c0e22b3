//! HTTP surface of the notification core: producer ingestion, the client
//! REST API and the realtime WebSocket endpoint.

pub mod middleware;
pub mod routes;
pub mod state;
