//! Config method handlers.

use crate::methods::MethodHandler;
use crate::Result;
use async_trait::async_trait;
use chatmux_core::Config;

/// `config.get`: the effective configuration, secrets redacted.
pub struct ConfigGetHandler {
    config: Config,
}

impl ConfigGetHandler {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MethodHandler for ConfigGetHandler {
    async fn call(&self, _params: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let mut config = self.config.clone();
        if config.gateway.auth_token.is_some() {
            config.gateway.auth_token = Some("[redacted]".to_string());
        }
        Ok(serde_json::to_value(&config)
            .map_err(|e| crate::error::GatewayError::Internal(e.to_string()))?)
    }
}
