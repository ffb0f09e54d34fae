mod catalog;
mod session;

use std::sync::Arc;

use core_types::{
    ChatAdapter, GatewayError, Message, ModelParameters, ModelRoute, ProbeReport, Profile,
    ProfileId, ProviderKind,
};
use parking_lot::RwLock;
use providers::AdapterFactory;
use tracing::{debug, info, warn};

pub use catalog::ModelCatalog;
pub use session::{StreamCancel, StreamSession};

const NO_ACTIVE_PROFILE: &str = "no active profile";

#[derive(Clone, PartialEq)]
struct AdapterKey {
    route: ModelRoute,
    endpoint: String,
    secret: String,
}

struct ActiveAdapter {
    profile_id: ProfileId,
    key: AdapterKey,
    parameters: ModelParameters,
    // A profile with an unusable endpoint stays active and reports the error
    // on use.
    adapter: Result<Arc<dyn ChatAdapter>, GatewayError>,
}

/// Routes chat traffic to the adapter of the active profile.
pub struct Gateway {
    factory: Arc<dyn AdapterFactory>,
    active: RwLock<Option<ActiveAdapter>>,
    catalog: ModelCatalog,
}

impl Gateway {
    pub fn new(factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            factory,
            active: RwLock::new(None),
            catalog: ModelCatalog::default(),
        }
    }

    /// Points the gateway at `profile`. Returns whether a new adapter was
    /// built; identical connection settings keep the current one.
    pub fn configure(&self, profile: &Profile, secret: &str) -> bool {
        let key = AdapterKey {
            route: profile.route(),
            endpoint: profile.api_endpoint.clone(),
            secret: secret.to_string(),
        };

        let mut active = self.active.write();
        if let Some(current) = active.as_mut() {
            if current.key == key {
                current.profile_id = profile.id;
                current.parameters = profile.parameters;
                return false;
            }
        }

        let adapter = self.factory.build(&key.route, &key.endpoint, &key.secret);
        match &adapter {
            Ok(_) => info!(
                profile_id = %profile.id,
                provider = ?key.route.provider,
                model = %key.route.model,
                "gateway configured"
            ),
            Err(err) => warn!(profile_id = %profile.id, error = %err, "active profile has no usable adapter"),
        }
        *active = Some(ActiveAdapter {
            profile_id: profile.id,
            key,
            parameters: profile.parameters,
            adapter,
        });
        true
    }

    pub fn clear(&self) {
        *self.active.write() = None;
    }

    pub fn active_profile_id(&self) -> Option<ProfileId> {
        self.active.read().as_ref().map(|active| active.profile_id)
    }

    pub fn active_provider(&self) -> Option<ProviderKind> {
        self.active
            .read()
            .as_ref()
            .map(|active| active.key.route.provider)
    }

    fn current(&self) -> Result<(Arc<dyn ChatAdapter>, ModelParameters), GatewayError> {
        let active = self.active.read();
        let active = active
            .as_ref()
            .ok_or_else(|| GatewayError::Unknown(NO_ACTIVE_PROFILE.to_string()))?;
        let adapter = active.adapter.clone()?;
        Ok((adapter, active.parameters))
    }

    pub async fn send_message(&self, messages: &[Message]) -> Result<Message, GatewayError> {
        let (adapter, parameters) = self.current()?;
        debug!(count = messages.len(), "sending messages");
        adapter.send(messages, &parameters).await
    }

    /// Opens a streaming reply. Connection and status errors surface here;
    /// errors mid-transfer arrive through the session.
    pub async fn stream_message(&self, messages: &[Message]) -> Result<StreamSession, GatewayError> {
        let (adapter, parameters) = self.current()?;
        debug!(count = messages.len(), "streaming messages");
        let stream = adapter.stream(messages, &parameters).await?;
        Ok(StreamSession::spawn(stream))
    }

    pub async fn test_connection(&self) -> Result<ProbeReport, GatewayError> {
        let (adapter, _) = self.current()?;
        adapter.probe().await
    }

    /// Probes arbitrary settings without touching the active adapter.
    pub async fn probe_with(
        &self,
        endpoint: &str,
        secret: &str,
        model_name: &str,
    ) -> Result<ProbeReport, GatewayError> {
        let route = ModelRoute::parse(model_name);
        let adapter = self.factory.build(&route, endpoint, secret)?;
        let report = adapter.probe().await;
        debug!(provider = ?route.provider, ok = report.is_ok(), "probed candidate settings");
        report
    }

    /// Turns on the Ollama model list, fetching it when disabled or when the
    /// endpoint differs from the cached one.
    pub async fn enable_ollama_models(&self, endpoint: &str) -> Result<Vec<String>, GatewayError> {
        if self.catalog.is_fresh_for(endpoint) {
            return Ok(self.catalog.models());
        }
        let route = ModelRoute {
            provider: ProviderKind::Ollama,
            model: String::new(),
        };
        let names = self.factory.build(&route, endpoint, "")?.list_models().await?;
        info!(count = names.len(), "ollama models refreshed");
        Ok(self.catalog.store(endpoint, names))
    }

    pub fn disable_ollama_models(&self) {
        self.catalog.clear();
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }
}
