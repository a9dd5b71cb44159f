//! Real-time synchronization client for AI build-pipeline dashboards.
//!
//! One [`sync::JobSync`] per running job keeps a push-channel connection
//! alive (reconnecting with backoff), reconciles push events against REST
//! snapshots, and publishes immutable [`sync::JobView`] snapshots for any
//! renderer to consume.

pub mod config;
pub mod connection;
pub mod errors;
pub mod merge;
pub mod model;
pub mod progress;
pub mod protocol;
pub mod rest;
pub mod sync;
pub mod tickets;
