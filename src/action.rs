//! Side-effecting actions attached to steps
//!
//! Actions are dispatched by kind through the [`Registry`]. Each handler
//! reports an [`ActionResult`] instead of failing, and the executor retries
//! results marked retryable with exponential backoff.

mod api_call;
mod navigation;
mod storage;

pub use api_call::ApiCallAction;
pub use navigation::{NavigationAction, NavigationRequest, Navigator};
pub use storage::StorageAction;

use crate::flow::StepId;
use crate::registry::Registry;
use crate::storage::StorageScopes;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Definitions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    #[serde(rename = "type", alias = "kind")]
    pub kind: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default, alias = "retryConfig", skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Where to go once the action succeeds; falls back to the step's `nextStep`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<StepId>,
}

impl ActionDefinition {
    pub fn new(kind: impl Into<String>, config: Value) -> Self {
        Self {
            kind: kind.into(),
            config,
            retry: None,
            next_step: None,
        }
    }

    /// Registry key: the kind, or the named executor for `custom`.
    pub fn handler_name(&self) -> &str {
        if self.kind == "custom" {
            if let Some(name) = self
                .config
                .get("name")
                .or_else(|| self.config.get("handler"))
                .and_then(Value::as_str)
            {
                return name;
            }
        }
        &self.kind
    }

    /// Interpret a bare string action.
    ///
    /// JSON text is parsed as a definition, a URL becomes an `api_call`, and
    /// anything else names a registered custom executor.
    pub fn from_shorthand(text: &str) -> Result<Self, String> {
        let trimmed = text.trim();
        if trimmed.starts_with('{') {
            return serde_json::from_str(trimmed).map_err(|e| format!("invalid action JSON: {e}"));
        }
        if trimmed.contains("://") || trimmed.starts_with('/') {
            return Ok(Self::new("api_call", json!({ "url": trimmed })));
        }
        if trimmed.is_empty() {
            return Err("empty action".to_string());
        }
        Ok(Self::new("custom", json!({ "name": trimmed })))
    }
}

/// `deserialize_with` helper accepting an action object or its string shorthand.
pub fn deserialize_action<'de, D>(deserializer: D) -> Result<Option<ActionDefinition>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => ActionDefinition::from_shorthand(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
        Some(other) => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default, alias = "delay")]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub backoff_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: Option<&RetryConfig>) -> Self {
        let defaults = Self::default();
        let Some(config) = config else {
            return defaults;
        };
        Self {
            max_attempts: config.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            delay: config.delay_ms.map_or(defaults.delay, Duration::from_millis),
            backoff_multiplier: config
                .backoff_multiplier
                .filter(|m| m.is_finite() && *m >= 0.0)
                .unwrap_or(defaults.backoff_multiplier),
        }
    }

    /// Wait before attempt `attempt` (1-based): `delay * multiplier^(attempt - 2)`.
    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(i32::MAX as u32) as i32;
        let factor = self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(self.delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }
}

// ============================================================================
// Results and handlers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}

impl ActionResult {
    pub fn success(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            retryable: false,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            retryable: false,
        }
    }

    pub fn retryable_failure(error: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::failure(error)
        }
    }

    pub fn cancelled() -> Self {
        Self::failure("Action cancelled")
    }

    /// Output recorded into `toolResults`.
    pub fn output(&self) -> Value {
        self.data.clone().unwrap_or(Value::Null)
    }

    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "Action failed".to_string())
    }
}

/// Everything an action invocation may touch
///
/// Created fresh for each invocation; handlers stay stateless.
#[derive(Clone)]
pub struct ActionContext {
    /// Cancelled when the session leaves the step
    pub cancel: CancellationToken,
    pub session_id: String,
    /// Read-only conversation view used for templating
    pub scope: Value,
    pub storage: StorageScopes,
    pub navigator: Arc<dyn Navigator>,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Registry key
    fn kind(&self) -> &str;

    async fn run(&self, config: &Value, ctx: &ActionContext) -> ActionResult;
}

// ============================================================================
// Executor
// ============================================================================

/// Dispatches actions through the registry and applies the retry policy
#[derive(Clone)]
pub struct ActionExecutor {
    registry: Arc<Registry>,
}

impl ActionExecutor {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub async fn execute(&self, action: &ActionDefinition, ctx: &ActionContext) -> ActionResult {
        let name = action.handler_name();
        let Some(handler) = self.registry.action_handler(name) else {
            tracing::warn!(session_id = %ctx.session_id, kind = %action.kind, "Unknown action type");
            return ActionResult::failure(format!("Unknown action type: {}", action.kind));
        };

        let policy = RetryPolicy::from_config(action.retry.as_ref());
        let config = match &action.config {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other.clone(),
        };

        let mut attempt = 1;
        loop {
            if ctx.cancel.is_cancelled() {
                return ActionResult::cancelled();
            }

            let result = run_guarded(handler.as_ref(), &config, ctx).await;
            if result.success {
                tracing::debug!(session_id = %ctx.session_id, kind = %name, attempt, "Action succeeded");
                return result;
            }
            if !result.retryable || attempt >= policy.max_attempts {
                tracing::warn!(
                    session_id = %ctx.session_id,
                    kind = %name,
                    attempt,
                    error = %result.error_message(),
                    "Action failed"
                );
                return result;
            }

            attempt += 1;
            let delay = policy.delay_before(attempt);
            tracing::debug!(
                session_id = %ctx.session_id,
                kind = %name,
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Retrying action"
            );

            tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => return ActionResult::cancelled(),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Run a handler, turning a panic into a non-retryable failure.
async fn run_guarded(handler: &dyn ActionHandler, config: &Value, ctx: &ActionContext) -> ActionResult {
    match AssertUnwindSafe(handler.run(config, ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(session_id = %ctx.session_id, kind = %handler.kind(), "Action handler panicked");
            ActionResult::failure(format!("Action handler '{}' panicked", handler.kind()))
        }
    }
}
