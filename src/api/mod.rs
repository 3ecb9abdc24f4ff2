//! HTTP surface: signal submission, audit queries, inbound webhooks.

pub mod routes;

pub use routes::{AppState, api_routes};
