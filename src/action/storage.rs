//! `storage` action - get/set/remove/clear against a session or durable store

use super::{ActionContext, ActionHandler, ActionResult};
use crate::expression::{interpolate_deep, interpolate_paths};
use crate::storage::StorageScope;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Operation {
    Get,
    Set,
    Remove,
    Clear,
}

#[derive(Debug, Deserialize)]
struct StorageInput {
    #[serde(alias = "operation")]
    action: Operation,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Value,
    #[serde(default, alias = "scope")]
    storage: StorageScope,
}

impl StorageInput {
    fn key(&self, scope: &Value) -> Result<String, String> {
        match &self.key {
            Some(k) if !k.is_empty() => Ok(interpolate_paths(k, scope)),
            _ => Err("Storage action requires a key".to_string()),
        }
    }
}

pub struct StorageAction;

#[async_trait]
impl ActionHandler for StorageAction {
    fn kind(&self) -> &str {
        "storage"
    }

    async fn run(&self, config: &Value, ctx: &ActionContext) -> ActionResult {
        let input: StorageInput = match serde_json::from_value(config.clone()) {
            Ok(i) => i,
            Err(e) => return ActionResult::failure(format!("Invalid storage config: {e}")),
        };
        let store = ctx.storage.scope(input.storage);

        let outcome = match input.action {
            Operation::Get => match input.key(&ctx.scope) {
                Ok(key) => store.get(&key).await.map(|v| Some(v.unwrap_or(Value::Null))),
                Err(e) => return ActionResult::failure(e),
            },
            Operation::Set => match input.key(&ctx.scope) {
                Ok(key) => {
                    let value = interpolate_deep(&input.value, &ctx.scope);
                    store.set(&key, &value).await.map(|()| None)
                }
                Err(e) => return ActionResult::failure(e),
            },
            Operation::Remove => match input.key(&ctx.scope) {
                Ok(key) => store.remove(&key).await.map(|()| None),
                Err(e) => return ActionResult::failure(e),
            },
            Operation::Clear => store.clear().await.map(|()| None),
        };

        match outcome {
            Ok(data) => ActionResult::success(data),
            Err(e) => {
                tracing::error!(session_id = %ctx.session_id, error = %e, "Storage action failed");
                ActionResult::failure(e.to_string())
            }
        }
    }
}
