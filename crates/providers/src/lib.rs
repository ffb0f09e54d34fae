mod framing;
mod http;
mod ollama;
mod openai;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use core_types::{ChatAdapter, GatewayError, ModelRoute, ProviderKind};

pub use http::Timeouts;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

/// Builds the adapter serving a resolved route.
pub trait AdapterFactory: Send + Sync {
    fn build(
        &self,
        route: &ModelRoute,
        endpoint: &str,
        secret: &str,
    ) -> Result<Arc<dyn ChatAdapter>, GatewayError>;
}

/// Factory producing the HTTP adapters, each with its own timeouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HttpAdapterFactory {
    pub openai: Timeouts,
    pub ollama: Timeouts,
}

impl AdapterFactory for HttpAdapterFactory {
    fn build(
        &self,
        route: &ModelRoute,
        endpoint: &str,
        secret: &str,
    ) -> Result<Arc<dyn ChatAdapter>, GatewayError> {
        match route.provider {
            ProviderKind::OpenAiCompatible => Ok(Arc::new(OpenAiAdapter::new(
                endpoint,
                secret,
                &route.model,
                self.openai,
            )?)),
            ProviderKind::Ollama => Ok(Arc::new(OllamaAdapter::new(
                endpoint,
                &route.model,
                self.ollama,
            )?)),
        }
    }
}
