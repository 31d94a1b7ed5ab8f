//! `api_call` action - templated outbound request bounded by a timeout

use super::{ActionContext, ActionHandler, ActionResult};
use crate::expression::{interpolate_deep, interpolate_paths};
use crate::http::{send_with_timeout, HttpRequest, HttpTransport};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Deserialize)]
struct ApiCallInput {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: IndexMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    /// Milliseconds
    #[serde(default)]
    timeout: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

pub struct ApiCallAction {
    transport: Arc<dyn HttpTransport>,
}

impl ApiCallAction {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    fn build_request(input: ApiCallInput, scope: &Value) -> HttpRequest {
        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        for (name, value) in input.headers {
            let value = interpolate_paths(&value, scope);
            if let Some(existing) = headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
                *existing = (name, value);
            } else {
                headers.push((name, value));
            }
        }

        HttpRequest {
            method: input.method.to_uppercase(),
            url: interpolate_paths(&input.url, scope),
            headers,
            body: input
                .body
                .filter(|b| !b.is_null())
                .map(|b| interpolate_deep(&b, scope)),
        }
    }
}

#[async_trait]
impl ActionHandler for ApiCallAction {
    fn kind(&self) -> &str {
        "api_call"
    }

    async fn run(&self, config: &Value, ctx: &ActionContext) -> ActionResult {
        let input: ApiCallInput = match serde_json::from_value(config.clone()) {
            Ok(i) => i,
            Err(e) => return ActionResult::failure(format!("Invalid api_call config: {e}")),
        };
        let timeout = Duration::from_millis(input.timeout.unwrap_or(DEFAULT_TIMEOUT_MS));
        let request = Self::build_request(input, &ctx.scope);

        tracing::debug!(
            session_id = %ctx.session_id,
            method = %request.method,
            url = %request.url,
            "Calling API"
        );

        let outcome = tokio::select! {
            () = ctx.cancel.cancelled() => return ActionResult::cancelled(),
            r = send_with_timeout(self.transport.as_ref(), request, timeout) => r,
        };

        match outcome {
            Ok(response) if response.is_success() => ActionResult::success(Some(response.body)),
            Ok(response) => ActionResult::retryable_failure(format!("HTTP {}", response.status)),
            Err(e) if e.kind.is_retryable() => ActionResult::retryable_failure(e.message),
            Err(e) => ActionResult::failure(e.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{action_context, MockTransport};
    use serde_json::json;

    fn handler(transport: &Arc<MockTransport>) -> ApiCallAction {
        let transport: Arc<dyn HttpTransport> = transport.clone();
        ApiCallAction::new(transport)
    }

    #[tokio::test]
    async fn test_templates_url_headers_and_body() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_json(200, json!({"donationId": "d-1"}));

        let ctx = action_context(json!({
            "responses": {"amount": 5000, "name": "Sato"},
            "metadata": {"campaign": "spring", "token": "abc"}
        }));
        let config = json!({
            "url": "https://api.test/campaigns/{{metadata.campaign}}/donations",
            "method": "post",
            "headers": {"Authorization": "Bearer {{metadata.token}}"},
            "body": {"amount": "{{responses.amount}}", "note": "from {{responses.name}}", "tags": ["{{metadata.campaign}}"]}
        });

        let result = handler(&transport).run(&config, &ctx).await;
        assert!(result.success);
        assert_eq!(result.data, Some(json!({"donationId": "d-1"})));

        let requests = transport.recorded_requests();
        let sent = &requests[0];
        assert_eq!(sent.method, "POST");
        assert_eq!(sent.url, "https://api.test/campaigns/spring/donations");
        assert!(sent
            .headers
            .contains(&("Content-Type".to_string(), "application/json".to_string())));
        assert!(sent
            .headers
            .contains(&("Authorization".to_string(), "Bearer abc".to_string())));
        assert_eq!(
            sent.body,
            Some(json!({"amount": 5000, "note": "from Sato", "tags": ["spring"]}))
        );
    }

    #[tokio::test]
    async fn test_non_success_status_is_retryable() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_json(404, json!({"error": "nope"}));
        let result = handler(&transport)
            .run(&json!({"url": "https://api.test/x"}), &action_context(json!({})))
            .await;
        assert!(!result.success);
        assert!(result.retryable);
        assert_eq!(result.error.as_deref(), Some("HTTP 404"));
    }

    #[tokio::test]
    async fn test_missing_url_is_terminal() {
        let transport = Arc::new(MockTransport::new());
        let result = handler(&transport)
            .run(&json!({"method": "GET"}), &action_context(json!({})))
            .await;
        assert!(!result.success);
        assert!(!result.retryable);
        assert!(transport.recorded_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_hang();
        let result = handler(&transport)
            .run(
                &json!({"url": "https://api.test/slow", "timeout": 50}),
                &action_context(json!({})),
            )
            .await;
        assert!(result.retryable);
        assert_eq!(result.error.as_deref(), Some("Request timed out after 50ms"));
    }
}
