use core_types::OLLAMA_MODEL_PREFIX;
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct CatalogState {
    endpoint: Option<String>,
    models: Vec<String>,
}

/// Cached Ollama model names. Only an explicit enable or an endpoint change
/// refreshes it.
#[derive(Debug, Default)]
pub struct ModelCatalog {
    state: RwLock<CatalogState>,
}

impl ModelCatalog {
    pub fn is_enabled(&self) -> bool {
        self.state.read().endpoint.is_some()
    }

    pub(crate) fn is_fresh_for(&self, endpoint: &str) -> bool {
        self.state.read().endpoint.as_deref() == Some(endpoint)
    }

    pub(crate) fn store(&self, endpoint: &str, names: Vec<String>) -> Vec<String> {
        let models: Vec<String> = names
            .into_iter()
            .map(|name| format!("{OLLAMA_MODEL_PREFIX}{name}"))
            .collect();
        let mut state = self.state.write();
        state.endpoint = Some(endpoint.to_string());
        state.models = models.clone();
        models
    }

    pub(crate) fn clear(&self) {
        *self.state.write() = CatalogState::default();
    }

    /// Model names ready to store on a profile, e.g. `ollama:llama2`.
    pub fn models(&self) -> Vec<String> {
        self.state.read().models.clone()
    }
}
