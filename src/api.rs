//! HTTP API for the avatar consoles

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::config::ConsoleSettings;
use crate::db::Database;
use crate::runtime::{RuntimeManager, TokenProvider};
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeManager>,
}

impl AppState {
    pub fn new(db: Database, settings: ConsoleSettings, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            runtime: Arc::new(RuntimeManager::new(db, settings, tokens)),
        }
    }
}
