//! HTTP session API
//!
//! Transports the session surface to the presentation layer: start a
//! session, read its snapshot, submit events and stream updates.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::catalog::FlowCatalog;
use crate::controller::ConversationController;
use crate::options::OptionLoader;
use crate::registry::Registry;
use crate::runtime::{SessionHandle, SessionManager};
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub catalog: Arc<FlowCatalog>,
    pub registry: Arc<Registry>,
    pub loader: Arc<OptionLoader>,
}

impl AppState {
    pub fn new(
        sessions: Arc<SessionManager>,
        catalog: Arc<FlowCatalog>,
        registry: Arc<Registry>,
        loader: Arc<OptionLoader>,
    ) -> Self {
        Self {
            sessions,
            catalog,
            registry,
            loader,
        }
    }

    fn controller(&self, session: SessionHandle) -> ConversationController {
        ConversationController::new(session, self.registry.clone(), self.loader.clone())
    }
}
