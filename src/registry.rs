//! Registry of pluggable behavior: action handlers, option functions,
//! input handlers and custom validators
//!
//! Populated before any session starts and shared read-only afterwards.

use crate::action::{ActionHandler, ApiCallAction, NavigationAction, StorageAction};
use crate::controller::{builtin_input_handlers, InputHandler};
use crate::http::HttpTransport;
use crate::options::OptionFunction;
use crate::validation::{CustomValidator, CustomValidators};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct Registry {
    actions: HashMap<String, Arc<dyn ActionHandler>>,
    option_functions: HashMap<String, Arc<dyn OptionFunction>>,
    input_handlers: HashMap<String, Arc<dyn InputHandler>>,
    validators: CustomValidators,
}

impl Registry {
    /// Nothing registered; built-in step kinds still compile.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in actions and input handlers over the given transport.
    pub fn standard(transport: Arc<dyn HttpTransport>) -> Self {
        let mut registry = Self::empty();
        registry.register_action(Arc::new(ApiCallAction::new(transport)));
        registry.register_action(Arc::new(StorageAction));
        registry.register_action(Arc::new(NavigationAction));
        for handler in builtin_input_handlers() {
            registry.register_input_handler(handler);
        }
        registry
    }

    // ========================================================================
    // Actions
    // ========================================================================

    /// Later registrations replace earlier ones of the same kind.
    pub fn register_action(&mut self, handler: Arc<dyn ActionHandler>) {
        let kind = handler.kind().to_string();
        if self.actions.insert(kind.clone(), handler).is_some() {
            tracing::debug!(kind = %kind, "Replaced action handler");
        }
    }

    pub fn action_handler(&self, kind: &str) -> Option<Arc<dyn ActionHandler>> {
        self.actions.get(kind).cloned()
    }

    pub fn action_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    // ========================================================================
    // Option functions
    // ========================================================================

    pub fn register_option_function(&mut self, name: impl Into<String>, function: Arc<dyn OptionFunction>) {
        self.option_functions.insert(name.into(), function);
    }

    pub fn option_function(&self, name: &str) -> Option<Arc<dyn OptionFunction>> {
        self.option_functions.get(name).cloned()
    }

    // ========================================================================
    // Input handlers
    // ========================================================================

    pub fn register_input_handler(&mut self, handler: Arc<dyn InputHandler>) {
        self.input_handlers.insert(handler.kind().to_string(), handler);
    }

    pub fn input_handler(&self, kind: &str) -> Option<Arc<dyn InputHandler>> {
        self.input_handlers.get(kind).cloned()
    }

    // ========================================================================
    // Validators
    // ========================================================================

    pub fn register_validator(&mut self, name: impl Into<String>, validator: Arc<dyn CustomValidator>) {
        self.validators.insert(name.into(), validator);
    }

    pub fn validators(&self) -> &CustomValidators {
        &self.validators
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::MockTransport;
    use serde_json::Value;

    struct Even;

    impl CustomValidator for Even {
        fn validate(&self, value: &Value, _params: &Value, _scope: &Value) -> Result<(), String> {
            match value.as_i64() {
                Some(n) if n % 2 == 0 => Ok(()),
                _ => Err("偶数を入力してください".to_string()),
            }
        }
    }

    #[test]
    fn test_standard_registry() {
        let registry = Registry::standard(Arc::new(MockTransport::new()));
        assert_eq!(registry.action_kinds(), vec!["api_call", "navigation", "storage"]);
        assert!(registry.input_handler("amount_input").is_some());
        assert!(registry.input_handler("button_select").is_some());
        assert!(registry.input_handler("signature_pad").is_none());
        assert!(registry.option_function("projects").is_none());
    }

    #[test]
    fn test_register_validator() {
        let mut registry = Registry::empty();
        registry.register_validator("even", Arc::new(Even));
        let even = &registry.validators()["even"];
        assert!(even.validate(&Value::from(4), &Value::Null, &Value::Null).is_ok());
        assert!(even.validate(&Value::from(3), &Value::Null, &Value::Null).is_err());
    }
}
