//! Lab Sync Server Library
//!
//! Offline synchronization engine for laboratory field devices: idempotent
//! mutation push, last-writer-wins conflict resolution and a capped pull
//! changefeed over participants and samples.
//!
//! # Modules
//!
//! - `sync`: push processor, conflict resolver, pull cursor, status reporter
//! - `store`: entity store and mutation log backends (SQLite, in-memory)
//! - `routes`: axum HTTP surface

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod store;
pub mod sync;
