//! Real-time collaborative document synchronization.
//!
//! A [`ws::registry::SessionRegistry`] multiplexes WebSocket clients per
//! document, merges concurrent edits through a loro CRDT and relays presence.

pub mod bootstrap;
pub mod config;
pub mod docs;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod websocket;
pub mod ws;

use std::sync::Arc;

use config::Config;
use ws::registry::SessionRegistry;

/// Shared state handed to every HTTP and WebSocket handler
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<Config>,
}
