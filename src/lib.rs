//! Ops Center: signal scoring and multi-destination dispatch.

pub mod api;
pub mod channels;
pub mod config;
pub mod destinations;
pub mod error;
pub mod pipeline;
pub mod store;
