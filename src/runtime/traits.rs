//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the session loop with mock implementations.

use crate::action::{ActionContext, ActionDefinition, ActionExecutor, ActionResult};
use async_trait::async_trait;
use std::sync::Arc;

/// Runs entry actions on behalf of a session
#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Run one action to completion, retries included
    async fn run(&self, action: &ActionDefinition, ctx: &ActionContext) -> ActionResult;
}

#[async_trait]
impl ActionRunner for ActionExecutor {
    async fn run(&self, action: &ActionDefinition, ctx: &ActionContext) -> ActionResult {
        self.execute(action, ctx).await
    }
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: ActionRunner + ?Sized> ActionRunner for Arc<T> {
    async fn run(&self, action: &ActionDefinition, ctx: &ActionContext) -> ActionResult {
        (**self).run(action, ctx).await
    }
}
