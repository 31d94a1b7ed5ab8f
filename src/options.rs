//! Dynamic option resolution
//!
//! Choice lists come from inline data, registered functions or an HTTP
//! endpoint. Every failure degrades to an empty list: a broken option source
//! must never stop a conversation from rendering.

use crate::expression::{interpolate_paths, stringify, Expression};
use crate::flow::{ConditionalTransition, FlowOption};
use crate::http::{send_with_timeout, HttpRequest, HttpTransport};
use crate::registry::Registry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawDynamicOptions")]
pub struct DynamicOptionsConfig {
    pub source: OptionSource,
    pub filter: Option<String>,
    pub transform: Option<TransformConfig>,
    pub cache: Option<CacheConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OptionSource {
    Static {
        options: Vec<FlowOption>,
    },
    Function {
        name: String,
        params: Value,
    },
    Api {
        url: String,
        method: String,
        headers: Vec<(String, String)>,
        body: Option<Value>,
        timeout: Option<Duration>,
    },
}

impl OptionSource {
    pub fn name(&self) -> &'static str {
        match self {
            OptionSource::Static { .. } => "static",
            OptionSource::Function { .. } => "function",
            OptionSource::Api { .. } => "api",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformConfig {
    #[serde(default)]
    pub value_field: Option<String>,
    #[serde(default)]
    pub label_field: Option<String>,
    #[serde(default)]
    pub metadata_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// Milliseconds; an entry without a ttl lives until invalidated.
    #[serde(default)]
    pub ttl: Option<u64>,
    /// Cache key template; `{{path}}` tokens are filled from the context.
    #[serde(default)]
    pub key: Option<String>,
}

fn default_cache_enabled() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDynamicOptions {
    source: String,
    #[serde(default)]
    source_params: Map<String, Value>,
    api_url: Option<String>,
    api_method: Option<String>,
    api_headers: Option<Map<String, Value>>,
    function_name: Option<String>,
    static_options: Option<Vec<FlowOption>>,
    filter: Option<String>,
    transform: Option<TransformConfig>,
    cache: Option<CacheConfig>,
    timeout: Option<u64>,
}

impl TryFrom<RawDynamicOptions> for DynamicOptionsConfig {
    type Error = String;

    fn try_from(raw: RawDynamicOptions) -> Result<Self, Self::Error> {
        let params = raw.source_params;
        let param_str = |key: &str| params.get(key).and_then(Value::as_str).map(str::to_string);

        let source = match raw.source.as_str() {
            "static" => {
                let options = match (raw.static_options, params.get("options")) {
                    (Some(options), _) => options,
                    (None, Some(list)) => serde_json::from_value(list.clone())
                        .map_err(|e| format!("invalid static options: {e}"))?,
                    (None, None) => Vec::new(),
                };
                OptionSource::Static { options }
            }
            "function" => {
                let name = raw
                    .function_name
                    .or_else(|| param_str("name"))
                    .or_else(|| param_str("functionName"))
                    .ok_or("function source needs a function name")?;
                let params = params.get("params").cloned().unwrap_or_else(|| {
                    let mut rest = params.clone();
                    rest.remove("name");
                    rest.remove("functionName");
                    Value::Object(rest)
                });
                OptionSource::Function { name, params }
            }
            "api" => {
                let url = raw
                    .api_url
                    .or_else(|| param_str("url"))
                    .ok_or("api source needs a url")?;
                let method = raw
                    .api_method
                    .or_else(|| param_str("method"))
                    .unwrap_or_else(|| "GET".to_string());
                let header_map = raw
                    .api_headers
                    .or_else(|| params.get("headers").and_then(Value::as_object).cloned())
                    .unwrap_or_default();
                let headers = header_map
                    .into_iter()
                    .map(|(k, v)| (k, stringify(&v)))
                    .collect();
                let timeout = raw
                    .timeout
                    .or_else(|| params.get("timeout").and_then(Value::as_u64))
                    .map(Duration::from_millis);
                OptionSource::Api {
                    url,
                    method,
                    headers,
                    body: params.get("body").cloned(),
                    timeout,
                }
            }
            other => return Err(format!("unknown option source: {other}")),
        };

        Ok(Self {
            source,
            filter: raw.filter,
            transform: raw.transform,
            cache: raw.cache,
        })
    }
}

impl DynamicOptionsConfig {
    pub fn from_source(source: OptionSource) -> Self {
        Self {
            source,
            filter: None,
            transform: None,
            cache: None,
        }
    }

    fn active_cache(&self) -> Option<&CacheConfig> {
        self.cache.as_ref().filter(|c| c.enabled)
    }

    /// Explicit key template, or `source:locator`.
    pub fn cache_key(&self, scope: &Value) -> String {
        if let Some(key) = self.cache.as_ref().and_then(|c| c.key.as_deref()) {
            return interpolate_paths(key, scope);
        }
        match &self.source {
            OptionSource::Static { .. } => "static".to_string(),
            OptionSource::Function { name, .. } => format!("function:{name}"),
            OptionSource::Api { url, .. } => format!("api:{}", interpolate_paths(url, scope)),
        }
    }
}

// ============================================================================
// Functions and cache
// ============================================================================

/// Named producer of raw option items, registered before sessions start
#[async_trait]
pub trait OptionFunction: Send + Sync {
    async fn call(&self, params: &Value, scope: &Value) -> Result<Vec<Value>, String>;
}

#[async_trait]
impl<F> OptionFunction for F
where
    F: Fn(&Value, &Value) -> Result<Vec<Value>, String> + Send + Sync,
{
    async fn call(&self, params: &Value, scope: &Value) -> Result<Vec<Value>, String> {
        self(params, scope)
    }
}

struct CacheEntry {
    options: Vec<FlowOption>,
    stored_at: Instant,
}

/// Process-wide option cache keyed by string
///
/// Two sessions racing on the same key may both fetch; the later write wins.
#[derive(Default)]
pub struct OptionCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl OptionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh entry for `key`, if one exists.
    pub fn get(&self, key: &str, ttl: Option<Duration>) -> Option<Vec<FlowOption>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(key)?;
        match ttl {
            Some(ttl) if entry.stored_at.elapsed() >= ttl => None,
            _ => Some(entry.options.clone()),
        }
    }

    pub fn put(&self, key: String, options: Vec<FlowOption>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            key,
            CacheEntry {
                options,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop entries whose key contains `pattern`, or everything when `None`.
    /// Returns how many entries were removed.
    pub fn invalidate(&self, pattern: Option<&str>) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        match pattern {
            Some(pattern) => entries.retain(|key, _| !key.contains(pattern)),
            None => entries.clear(),
        }
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Loader
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionLoadResult {
    pub success: bool,
    pub options: Vec<FlowOption>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub from_cache: bool,
}

pub struct OptionLoader {
    registry: Arc<Registry>,
    transport: Arc<dyn HttpTransport>,
    cache: Arc<OptionCache>,
}

impl OptionLoader {
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<dyn HttpTransport>,
        cache: Arc<OptionCache>,
    ) -> Self {
        Self {
            registry,
            transport,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<OptionCache> {
        &self.cache
    }

    pub async fn load_options(&self, config: &DynamicOptionsConfig, scope: &Value) -> Vec<FlowOption> {
        self.load(config, scope).await.options
    }

    pub async fn load(&self, config: &DynamicOptionsConfig, scope: &Value) -> OptionLoadResult {
        let cache = config.active_cache();
        let key = cache.map(|_| config.cache_key(scope));
        let ttl = cache.and_then(|c| c.ttl).map(Duration::from_millis);

        if let Some(cached) = key.as_deref().and_then(|k| self.cache.get(k, ttl)) {
            tracing::debug!(key = ?key, count = cached.len(), "Serving options from cache");
            return OptionLoadResult {
                success: true,
                options: apply_filter(cached, config.filter.as_deref(), scope),
                error: None,
                from_cache: true,
            };
        }

        match self.fetch(config, scope).await {
            Ok(options) => {
                if let Some(key) = key {
                    self.cache.put(key, options.clone());
                }
                OptionLoadResult {
                    success: true,
                    options: apply_filter(options, config.filter.as_deref(), scope),
                    error: None,
                    from_cache: false,
                }
            }
            Err(e) => {
                tracing::warn!(source = config.source.name(), error = %e, "Option load failed");
                OptionLoadResult {
                    success: false,
                    options: Vec::new(),
                    error: Some(e),
                    from_cache: false,
                }
            }
        }
    }

    async fn fetch(&self, config: &DynamicOptionsConfig, scope: &Value) -> Result<Vec<FlowOption>, String> {
        let transform = config.transform.as_ref();
        match &config.source {
            OptionSource::Static { options } => Ok(options.clone()),
            OptionSource::Function { name, params } => {
                let function = self
                    .registry
                    .option_function(name)
                    .ok_or_else(|| format!("Unknown option function: {name}"))?;
                let items = function.call(params, scope).await?;
                Ok(items.iter().map(|item| map_item(item, transform)).collect())
            }
            OptionSource::Api {
                url,
                method,
                headers,
                body,
                timeout,
            } => {
                let request = HttpRequest {
                    method: method.clone(),
                    url: interpolate_paths(url, scope),
                    headers: headers
                        .iter()
                        .map(|(k, v)| (k.clone(), interpolate_paths(v, scope)))
                        .collect(),
                    body: body.as_ref().map(|b| crate::expression::interpolate_deep(b, scope)),
                };
                let response = send_with_timeout(
                    self.transport.as_ref(),
                    request,
                    timeout.unwrap_or(DEFAULT_API_TIMEOUT),
                )
                .await
                .map_err(|e| e.to_string())?;

                if !response.is_success() {
                    return Err(format!("HTTP error! status: {}", response.status));
                }
                match response.body {
                    Value::Array(items) => Ok(items.iter().map(|item| map_item(item, transform)).collect()),
                    other => Err(format!(
                        "Expected an array of options, got {}",
                        crate::expression::type_name(&other)
                    )),
                }
            }
        }
    }
}

/// Map one raw item onto an option using the transform field names.
pub fn map_item(item: &Value, transform: Option<&TransformConfig>) -> FlowOption {
    let field = |configured: Option<&String>, default: &str| {
        let name = configured.map_or(default, String::as_str);
        item.get(name).filter(|v| !v.is_null())
    };

    let value = field(transform.and_then(|t| t.value_field.as_ref()), "value")
        .cloned()
        .unwrap_or_else(|| item.clone());
    let label = field(transform.and_then(|t| t.label_field.as_ref()), "label")
        .map_or_else(|| stringify(&value), stringify);

    let metadata = match transform.map(|t| &t.metadata_fields) {
        Some(fields) if !fields.is_empty() => {
            let picked: Map<String, Value> = fields
                .iter()
                .filter_map(|f| item.get(f).map(|v| (f.clone(), v.clone())))
                .collect();
            Some(Value::Object(picked))
        }
        _ => item.get("metadata").cloned(),
    };

    let conditions = item
        .get("conditions")
        .and_then(|c| serde_json::from_value::<Vec<ConditionalTransition>>(c.clone()).ok())
        .unwrap_or_default();

    FlowOption {
        value,
        label: Some(label),
        next_step: item.get("nextStep").and_then(Value::as_str).map(str::to_string),
        conditions,
        metadata,
    }
}

/// Keep options whose filter holds against `scope ∪ {option, value, label, metadata}`.
pub fn apply_filter(options: Vec<FlowOption>, filter: Option<&str>, scope: &Value) -> Vec<FlowOption> {
    let Some(filter) = filter else {
        return options;
    };
    let expr = match Expression::parse(filter) {
        Ok(expr) => expr,
        Err(e) => {
            tracing::warn!(filter = %filter, error = %e, "Option filter does not parse, dropping all options");
            return Vec::new();
        }
    };

    let base = match scope {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    options
        .into_iter()
        .filter(|option| {
            let mut scope = base.clone();
            scope.insert(
                "option".to_string(),
                serde_json::to_value(option).unwrap_or(Value::Null),
            );
            scope.insert("value".to_string(), option.value.clone());
            scope.insert("label".to_string(), Value::String(option.display_label()));
            scope.insert(
                "metadata".to_string(),
                option.metadata.clone().unwrap_or(Value::Object(Map::new())),
            );
            expr.is_satisfied(&Value::Object(scope))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use crate::runtime::testing::{CountingFunction, MockTransport};
    use serde_json::json;

    fn loader_with(transport: Arc<MockTransport>, registry: Registry) -> OptionLoader {
        OptionLoader::new(Arc::new(registry), transport, Arc::new(OptionCache::new()))
    }

    fn config(value: Value) -> DynamicOptionsConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_config_shapes() {
        let nested = config(json!({
            "source": "api",
            "sourceParams": {"url": "/api/projects?org={{metadata.org}}", "headers": {"X-Org": 1}}
        }));
        let flat = config(json!({"source": "api", "apiUrl": "/api/projects?org={{metadata.org}}", "apiHeaders": {"X-Org": 1}}));
        assert_eq!(nested, flat);
        assert!(matches!(nested.source, OptionSource::Api { ref method, .. } if method == "GET"));

        let function = config(json!({"source": "function", "functionName": "ageRanges"}));
        assert!(matches!(function.source, OptionSource::Function { ref name, .. } if name == "ageRanges"));

        assert!(serde_json::from_value::<DynamicOptionsConfig>(json!({"source": "ftp"})).is_err());
        assert!(serde_json::from_value::<DynamicOptionsConfig>(json!({"source": "api"})).is_err());
    }

    #[test]
    fn test_default_cache_keys() {
        let scope = json!({"metadata": {"org": 7}});
        let api = config(json!({"source": "api", "apiUrl": "/p?org={{metadata.org}}", "cache": {"ttl": 10}}));
        assert_eq!(api.cache_key(&scope), "api:/p?org=7");
        let keyed = config(json!({"source": "static", "cache": {"key": "projects-{{metadata.org}}"}}));
        assert_eq!(keyed.cache_key(&scope), "projects-7");
    }

    #[tokio::test]
    async fn test_static_source_with_filter() {
        let loader = loader_with(Arc::new(MockTransport::new()), Registry::empty());
        let cfg = config(json!({
            "source": "static",
            "staticOptions": [
                {"value": 1000, "label": "千円"},
                {"value": 5000, "label": "五千円", "metadata": {"popular": true}},
                {"value": 10000, "label": "一万円"}
            ],
            "filter": "value <= responses.limit"
        }));
        let scope = json!({"responses": {"limit": 5000}});
        let options = loader.load_options(&cfg, &scope).await;
        assert_eq!(options.len(), 2);

        let cfg = config(json!({
            "source": "static",
            "staticOptions": [{"value": 1, "label": "a"}, {"value": 2, "label": "b", "metadata": {"popular": true}}],
            "filter": "metadata.popular == true"
        }));
        // `metadata` is always an object, so options without it just fail the comparison
        let options = loader.load_options(&cfg, &scope).await;
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].value, json!(2));
    }

    #[tokio::test]
    async fn test_api_source_maps_with_transform() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_json(200, json!([
            {"id": "p1", "title": "Clean water", "region": "Asia", "extra": 1},
            {"id": "p2", "title": "Schools", "region": "Africa", "nextStep": "confirm"}
        ]));
        let loader = loader_with(transport.clone(), Registry::empty());
        let cfg = config(json!({
            "source": "api",
            "apiUrl": "https://example.test/projects?org={{metadata.org}}",
            "transform": {"valueField": "id", "labelField": "title", "metadataFields": ["region"]}
        }));
        let options = loader
            .load_options(&cfg, &json!({"metadata": {"org": "42"}}))
            .await;

        assert_eq!(options.len(), 2);
        assert_eq!(options[0].value, json!("p1"));
        assert_eq!(options[0].label.as_deref(), Some("Clean water"));
        assert_eq!(options[0].metadata, Some(json!({"region": "Asia"})));
        assert_eq!(options[1].next_step.as_deref(), Some("confirm"));
        assert_eq!(
            transport.recorded_requests()[0].url,
            "https://example.test/projects?org=42"
        );
    }

    #[tokio::test]
    async fn test_api_failures_degrade_to_empty() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_json(500, json!({"error": "boom"}));
        transport.queue_json(200, json!({"not": "an array"}));
        transport.queue_network_error("connection refused");
        let loader = loader_with(transport, Registry::empty());
        let cfg = config(json!({"source": "api", "apiUrl": "https://example.test/x"}));

        for _ in 0..3 {
            let result = loader.load(&cfg, &json!({})).await;
            assert!(!result.success);
            assert!(result.options.is_empty());
            assert!(result.error.is_some());
        }
    }

    #[tokio::test]
    async fn test_unknown_function_degrades_to_empty() {
        let loader = loader_with(Arc::new(MockTransport::new()), Registry::empty());
        let cfg = config(json!({"source": "function", "functionName": "nope"}));
        let result = loader.load(&cfg, &json!({})).await;
        assert!(result.options.is_empty());
        assert_eq!(result.error.as_deref(), Some("Unknown option function: nope"));
    }

    #[tokio::test]
    async fn test_registered_function_items_are_mapped() {
        let mut registry = Registry::empty();
        registry.register_option_function(
            "ageRanges",
            Arc::new(
                |_params: &Value, _scope: &Value| -> Result<Vec<Value>, String> {
                    Ok(vec![json!({"value": "20s", "label": "20代"}), json!("30s")])
                },
            ),
        );
        let loader = loader_with(Arc::new(MockTransport::new()), registry);
        let cfg = config(json!({"source": "function", "functionName": "ageRanges"}));
        let options = loader.load_options(&cfg, &json!({})).await;
        assert_eq!(options.len(), 2);
        assert_eq!(options[0].label.as_deref(), Some("20代"));
        assert_eq!(options[1].value, json!("30s"));
        assert_eq!(options[1].label.as_deref(), Some("30s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_fetches_once_per_ttl_window() {
        let counter = Arc::new(CountingFunction::new(vec![json!({"value": 1, "label": "one"})]));
        let mut registry = Registry::empty();
        registry.register_option_function("projects", counter.clone());
        let loader = loader_with(Arc::new(MockTransport::new()), registry);
        let cfg = config(json!({"source": "function", "functionName": "projects", "cache": {"enabled": true, "ttl": 5000}}));

        let first = loader.load(&cfg, &json!({})).await;
        assert!(!first.from_cache);
        tokio::time::advance(Duration::from_millis(4999)).await;
        let second = loader.load(&cfg, &json!({})).await;
        assert!(second.from_cache);
        assert_eq!(counter.calls(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        let third = loader.load(&cfg, &json!({})).await;
        assert!(!third.from_cache);
        assert_eq!(counter.calls(), 2);

        let _ = loader.load(&cfg, &json!({})).await;
        assert_eq!(counter.calls(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let transport = Arc::new(MockTransport::new());
        transport.queue_json(503, Value::Null);
        transport.queue_json(200, json!([{"value": "a", "label": "A"}]));
        let loader = loader_with(transport, Registry::empty());
        let cfg = config(json!({"source": "api", "apiUrl": "https://example.test/a", "cache": {"ttl": 60000}}));

        assert!(loader.load_options(&cfg, &json!({})).await.is_empty());
        assert_eq!(loader.load_options(&cfg, &json!({})).await.len(), 1);
        assert!(loader.load(&cfg, &json!({})).await.from_cache);
    }

    #[test]
    fn test_cache_invalidation() {
        let cache = OptionCache::new();
        cache.put("api:/projects?org=1".into(), vec![]);
        cache.put("api:/projects?org=2".into(), vec![]);
        cache.put("function:ageRanges".into(), vec![]);
        assert_eq!(cache.invalidate(Some("projects")), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate(None), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_without_ttl_never_expires() {
        let cache = OptionCache::new();
        cache.put("k".into(), vec![FlowOption::new("v", "V")]);
        assert!(cache.get("k", None).is_some());
        assert!(cache.get("k", Some(Duration::ZERO)).is_none());
    }

    #[test]
    fn test_map_item_fallbacks() {
        let option = map_item(&json!(42), None);
        assert_eq!(option.value, json!(42));
        assert_eq!(option.label.as_deref(), Some("42"));

        let option = map_item(&json!({"value": null, "label": "x"}), None);
        assert_eq!(option.value, json!({"value": null, "label": "x"}));
    }

    #[test]
    fn test_unparsable_filter_drops_everything() {
        let options = vec![FlowOption::new(1, "one")];
        assert!(apply_filter(options, Some("value >"), &json!({})).is_empty());
    }

    #[tokio::test]
    async fn test_http_response_type_used() {
        // MockTransport answers with a queued HttpResponse verbatim
        let transport = Arc::new(MockTransport::new());
        transport.queue_response(HttpResponse {
            status: 200,
            body: json!([{"value": "x"}]),
        });
        let loader = loader_with(transport, Registry::empty());
        let cfg = config(json!({"source": "api", "apiUrl": "https://example.test/x"}));
        assert_eq!(loader.load_options(&cfg, &json!({})).await[0].label.as_deref(), Some("x"));
    }
}
