//! `navigation` action - hands a location change to the presentation layer

use super::{ActionContext, ActionHandler, ActionResult};
use crate::expression::interpolate_paths;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationRequest {
    pub url: String,
    /// Open a new viewing context instead of replacing the current one
    pub new_context: bool,
}

/// Receives navigation requests on behalf of whoever renders the session
pub trait Navigator: Send + Sync {
    fn navigate(&self, request: NavigationRequest) -> Result<(), String>;
}

#[derive(Debug, Deserialize)]
struct NavigationInput {
    url: String,
    #[serde(default)]
    target: Option<String>,
}

pub struct NavigationAction;

#[async_trait]
impl ActionHandler for NavigationAction {
    fn kind(&self) -> &str {
        "navigation"
    }

    async fn run(&self, config: &Value, ctx: &ActionContext) -> ActionResult {
        let input: NavigationInput = match serde_json::from_value(config.clone()) {
            Ok(i) => i,
            Err(e) => return ActionResult::failure(format!("Invalid navigation config: {e}")),
        };
        let request = NavigationRequest {
            url: interpolate_paths(&input.url, &ctx.scope),
            new_context: input.target.as_deref() == Some("_blank"),
        };

        tracing::info!(session_id = %ctx.session_id, url = %request.url, new_context = request.new_context, "Navigation requested");
        match ctx.navigator.navigate(request) {
            Ok(()) => ActionResult::success(None),
            Err(e) => ActionResult::failure(e),
        }
    }
}
