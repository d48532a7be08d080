//! RPC method registry.
//!
//! Maps method names to handlers. Unknown methods resolve to a structured
//! `MethodNotFound` error, never a transport failure.

use crate::error::GatewayError;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Trait for RPC method handlers.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Handle the method call.
    async fn call(&self, params: Option<serde_json::Value>) -> Result<serde_json::Value>;
}

/// Registry for RPC methods.
pub struct MethodRegistry {
    methods: RwLock<HashMap<String, Arc<dyn MethodHandler>>>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
        }
    }

    /// Register a method handler. Idempotent; the last registration wins.
    pub async fn register(&self, name: impl Into<String>, handler: Arc<dyn MethodHandler>) {
        let name = name.into();
        let mut methods = self.methods.write().await;
        if methods.insert(name.clone(), handler).is_some() {
            debug!("method re-registered: {}", name);
        }
    }

    /// Call a method by name.
    pub async fn call(
        &self,
        name: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let handler = {
            let methods = self.methods.read().await;
            methods
                .get(name)
                .cloned()
                .ok_or_else(|| GatewayError::MethodNotFound(name.to_string()))?
        };

        debug!("calling method: {}", name);
        handler.call(params).await
    }

    /// List registered method names.
    pub async fn list(&self) -> Vec<String> {
        let methods = self.methods.read().await;
        let mut names: Vec<String> = methods.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Deserialize method params, mapping failures to `InvalidParams`.
pub fn parse_params<T: serde::de::DeserializeOwned>(
    params: Option<serde_json::Value>,
) -> Result<T> {
    let value = params.unwrap_or(serde_json::Value::Null);
    serde_json::from_value(value).map_err(|e| GatewayError::InvalidParams(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl MethodHandler for Echo {
        async fn call(&self, params: Option<serde_json::Value>) -> Result<serde_json::Value> {
            Ok(params.unwrap_or(serde_json::Value::Null))
        }
    }

    #[tokio::test]
    async fn test_register_and_call() {
        let registry = MethodRegistry::new();
        registry.register("echo", Arc::new(Echo)).await;

        let result = registry
            .call("echo", Some(serde_json::json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(result["x"], 1);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let registry = MethodRegistry::new();
        let result = registry.call("nonexistent", None).await;
        assert!(matches!(result, Err(GatewayError::MethodNotFound(_))));
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        struct Fixed(i64);

        #[async_trait]
        impl MethodHandler for Fixed {
            async fn call(&self, _params: Option<serde_json::Value>) -> Result<serde_json::Value> {
                Ok(serde_json::json!(self.0))
            }
        }

        let registry = MethodRegistry::new();
        registry.register("n", Arc::new(Fixed(1))).await;
        registry.register("n", Arc::new(Fixed(2))).await;
        assert_eq!(registry.call("n", None).await.unwrap(), 2);
    }

    #[test]
    fn test_parse_params_invalid() {
        #[derive(serde::Deserialize)]
        struct P {
            #[allow(dead_code)]
            text: String,
        }

        let result: Result<P> = parse_params(Some(serde_json::json!({"wrong": 1})));
        assert!(matches!(result, Err(GatewayError::InvalidParams(_))));
    }
}
