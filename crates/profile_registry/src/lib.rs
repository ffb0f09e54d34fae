mod error;
mod transfer;

use std::collections::HashSet;
use std::sync::Arc;

use core_types::{GatewayError, ModelParameters, ProbeReport, Profile, ProfileId};
use gateway::Gateway;
use parking_lot::RwLock;
use secrets::{ProfileSecrets, SecretError};
use storage_sqlite::SqliteStorage;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

pub use error::{RegistryError, Result};
pub use transfer::{ImportReport, SecretExport};

use transfer::{ExportedProfile, unique_import_name};

pub const DEFAULT_PROFILE_NAME: &str = "Default";
pub const DEFAULT_API_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL_NAME: &str = "gpt-3.5-turbo";

const COPY_SUFFIX: &str = " (Copy)";
const EVENT_CAPACITY: usize = 64;

/// Fields a caller supplies when creating or updating a profile.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileDraft {
    pub name: String,
    pub api_endpoint: String,
    pub model_name: String,
    /// `None` or empty keeps the stored secret on update.
    pub secret: Option<String>,
    pub parameters: ModelParameters,
    pub is_default: bool,
}

impl ProfileDraft {
    pub fn new(
        name: impl Into<String>,
        api_endpoint: impl Into<String>,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            api_endpoint: api_endpoint.into(),
            model_name: model_name.into(),
            secret: None,
            parameters: ModelParameters::default(),
            is_default: false,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_parameters(mut self, parameters: ModelParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }
}

/// Published registry state. Profiles are ordered by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    pub profiles: Vec<Profile>,
    pub selected: Option<ProfileId>,
}

impl RegistrySnapshot {
    pub fn selected_profile(&self) -> Option<&Profile> {
        let id = self.selected?;
        self.profile(id)
    }

    pub fn default_profile(&self) -> Option<&Profile> {
        self.profiles.iter().find(|profile| profile.is_default)
    }

    pub fn profile(&self, id: ProfileId) -> Option<&Profile> {
        self.profiles.iter().find(|profile| profile.id == id)
    }

    fn insert(&mut self, profile: Profile) {
        if profile.is_default {
            self.clear_default();
        }
        self.profiles.push(profile);
        self.profiles.sort_by(|a, b| a.name.cmp(&b.name));
    }

    /// Overwrites in place so profiles sharing a name keep their storage
    /// order.
    fn replace(&mut self, profile: Profile) {
        if profile.is_default {
            self.clear_default();
        }
        match self.profiles.iter().position(|existing| existing.id == profile.id) {
            Some(index) => {
                self.profiles[index] = profile;
                self.profiles.sort_by(|a, b| a.name.cmp(&b.name));
            }
            None => self.insert(profile),
        }
    }

    fn mark_default(&mut self, id: ProfileId) {
        for profile in &mut self.profiles {
            profile.is_default = profile.id == id;
        }
    }

    fn clear_default(&mut self) {
        for profile in &mut self.profiles {
            profile.is_default = false;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryChange {
    Loaded,
    Created(ProfileId),
    Updated(ProfileId),
    Deleted(ProfileId),
    DefaultChanged(ProfileId),
    Selected(ProfileId),
    Imported(usize),
}

/// Sent after every completed operation, carrying the state it produced.
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub change: RegistryChange,
    pub snapshot: Arc<RegistrySnapshot>,
}

/// Source of truth for profiles and the active selection.
pub struct ProfileRegistry {
    storage: SqliteStorage,
    secrets: ProfileSecrets,
    gateway: Arc<Gateway>,
    state: RwLock<Arc<RegistrySnapshot>>,
    op_lock: Mutex<()>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ProfileRegistry {
    pub fn new(storage: SqliteStorage, secrets: ProfileSecrets, gateway: Arc<Gateway>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            storage,
            secrets,
            gateway,
            state: RwLock::new(Arc::new(RegistrySnapshot::default())),
            op_lock: Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.state.read())
    }

    pub fn profiles(&self) -> Vec<Profile> {
        self.snapshot().profiles.clone()
    }

    pub fn selected(&self) -> Option<Profile> {
        self.snapshot().selected_profile().cloned()
    }

    pub fn secret(&self, id: ProfileId) -> Result<Option<String>> {
        Ok(self.secrets.get(id)?)
    }

    /// Reads every profile, creating the default one on first run, and
    /// selects the default.
    pub async fn load(&self) -> Result<Arc<RegistrySnapshot>> {
        let _op = self.op_lock.lock().await;

        let mut profiles = self.storage.list_profiles().await?;
        if profiles.is_empty() {
            let profile = Profile {
                id: ProfileId::new_v4(),
                name: DEFAULT_PROFILE_NAME.to_string(),
                model_name: DEFAULT_MODEL_NAME.to_string(),
                api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
                is_default: true,
                parameters: ModelParameters::default(),
            };
            self.persist_new(&profile, "").await?;
            info!(profile_id = %profile.id, "created default profile");
            profiles.push(profile);
        }

        let mut snapshot = RegistrySnapshot {
            profiles,
            selected: None,
        };
        let stored_default = snapshot.default_profile().map(|profile| profile.id);
        let default_id = stored_default.unwrap_or(snapshot.profiles[0].id);
        let secret = self.read_secret(default_id).await?;
        if stored_default.is_none() {
            self.storage.set_default_profile(default_id).await?;
            snapshot.mark_default(default_id);
            warn!(profile_id = %default_id, "no default profile stored, promoted first profile");
        }
        snapshot.selected = Some(default_id);

        info!(count = snapshot.profiles.len(), selected = %default_id, "profiles loaded");
        Ok(self.publish(snapshot, RegistryChange::Loaded, &secret))
    }

    /// Creates a profile. The secret is stored before the row is committed.
    pub async fn create(&self, draft: ProfileDraft) -> Result<Profile> {
        let _op = self.op_lock.lock().await;

        let first_ever = self.storage.count_profiles().await? == 0;
        let profile = Profile {
            id: ProfileId::new_v4(),
            name: draft.name,
            model_name: draft.model_name,
            api_endpoint: draft.api_endpoint,
            is_default: draft.is_default || first_ever,
            parameters: draft.parameters,
        };
        let secret = draft.secret.unwrap_or_default();

        let mut snapshot = (*self.snapshot()).clone();
        let takes_selection = profile.is_default || snapshot.selected.is_none();
        let selected_secret = if takes_selection {
            secret.clone()
        } else {
            self.selected_secret(&snapshot).await?
        };
        self.persist_new(&profile, &secret).await?;

        if takes_selection {
            snapshot.selected = Some(profile.id);
        }
        snapshot.insert(profile.clone());
        info!(profile_id = %profile.id, is_default = profile.is_default, "profile created");
        self.publish(snapshot, RegistryChange::Created(profile.id), &selected_secret);
        Ok(profile)
    }

    /// Rewrites a profile. Requesting the default flag promotes it; clearing
    /// the flag on the current default is ignored. A new secret is rolled
    /// back when the row update fails.
    pub async fn update(&self, id: ProfileId, draft: ProfileDraft) -> Result<Profile> {
        let _op = self.op_lock.lock().await;

        let current = self
            .storage
            .get_profile(id)
            .await?
            .ok_or(RegistryError::NotFound(id))?;
        let profile = Profile {
            id,
            name: draft.name,
            model_name: draft.model_name,
            api_endpoint: draft.api_endpoint,
            is_default: current.is_default || draft.is_default,
            parameters: draft.parameters,
        };
        let new_secret = draft.secret.filter(|secret| !secret.is_empty());

        let mut snapshot = (*self.snapshot()).clone();
        let promotes = profile.is_default && !current.is_default;
        let selected_after = if promotes { Some(id) } else { snapshot.selected };
        let selected_secret = match (selected_after, &new_secret) {
            (Some(selected), Some(secret)) if selected == id => secret.clone(),
            (Some(selected), _) => self.read_secret(selected).await?,
            (None, _) => String::new(),
        };

        let previous = match new_secret {
            Some(secret) => {
                let previous = self.with_secrets(move |s| s.get(id)).await?;
                self.with_secrets(move |s| s.set(id, &secret)).await?;
                Some(previous)
            }
            None => None,
        };
        if let Err(err) = self.storage.update_profile(&profile).await {
            if let Some(previous) = previous {
                self.restore_secret(id, previous).await;
            }
            return Err(err.into());
        }

        snapshot.selected = selected_after;
        snapshot.replace(profile.clone());
        info!(profile_id = %id, "profile updated");
        self.publish(snapshot, RegistryChange::Updated(id), &selected_secret);
        Ok(profile)
    }

    /// Deletes a profile that is neither the last one, the selected one, nor
    /// the default. Once the row is gone the cache follows, even when the
    /// secret could not be removed.
    pub async fn delete(&self, id: ProfileId) -> Result<()> {
        let _op = self.op_lock.lock().await;

        let target = self
            .storage
            .get_profile(id)
            .await?
            .ok_or(RegistryError::NotFound(id))?;
        if self.storage.count_profiles().await? <= 1 {
            return Err(RegistryError::LastProfile);
        }
        let mut snapshot = (*self.snapshot()).clone();
        if snapshot.selected == Some(id) {
            return Err(RegistryError::SelectedProfile);
        }
        if target.is_default {
            return Err(RegistryError::DefaultProfile);
        }
        let selected_secret = self.selected_secret(&snapshot).await?;

        self.storage.delete_profile(id).await?;
        let removed = self.with_secrets(move |s| s.delete(id)).await;

        snapshot.profiles.retain(|profile| profile.id != id);
        info!(profile_id = %id, "profile deleted");
        self.publish(snapshot, RegistryChange::Deleted(id), &selected_secret);
        if let Err(err) = &removed {
            warn!(profile_id = %id, error = %err, "profile deleted but its secret remains");
        }
        removed
    }

    /// Makes `id` the default and selected profile in one step.
    pub async fn set_default(&self, id: ProfileId) -> Result<()> {
        let _op = self.op_lock.lock().await;

        if self.storage.get_profile(id).await?.is_none() {
            return Err(RegistryError::NotFound(id));
        }
        let secret = self.read_secret(id).await?;
        self.storage.set_default_profile(id).await?;

        let mut snapshot = (*self.snapshot()).clone();
        snapshot.mark_default(id);
        snapshot.selected = Some(id);
        info!(profile_id = %id, "default profile set");
        self.publish(snapshot, RegistryChange::DefaultChanged(id), &secret);
        Ok(())
    }

    /// Switches the active profile without touching the default flag.
    pub async fn select(&self, id: ProfileId) -> Result<()> {
        let _op = self.op_lock.lock().await;

        let mut snapshot = (*self.snapshot()).clone();
        if snapshot.profile(id).is_none() {
            return Err(RegistryError::NotFound(id));
        }
        let secret = self.read_secret(id).await?;
        snapshot.selected = Some(id);
        debug!(profile_id = %id, "profile selected");
        self.publish(snapshot, RegistryChange::Selected(id), &secret);
        Ok(())
    }

    /// Copies a profile and its secret under a new id. The copy is never
    /// the default.
    pub async fn duplicate(&self, id: ProfileId) -> Result<Profile> {
        let _op = self.op_lock.lock().await;

        let source = self
            .storage
            .get_profile(id)
            .await?
            .ok_or(RegistryError::NotFound(id))?;
        let secret = self.read_secret(id).await?;
        let mut snapshot = (*self.snapshot()).clone();
        let selected_secret = self.selected_secret(&snapshot).await?;
        let copy = Profile {
            id: ProfileId::new_v4(),
            name: format!("{}{COPY_SUFFIX}", source.name),
            is_default: false,
            ..source
        };
        self.persist_new(&copy, &secret).await?;

        snapshot.insert(copy.clone());
        info!(source = %id, profile_id = %copy.id, "profile duplicated");
        self.publish(snapshot, RegistryChange::Created(copy.id), &selected_secret);
        Ok(copy)
    }

    /// Serialises every profile as a JSON array. API keys are only written
    /// with [`SecretExport::IncludePlaintext`].
    pub async fn export_all(&self, mode: SecretExport) -> Result<String> {
        let snapshot = self.snapshot();
        let mut entries = Vec::with_capacity(snapshot.profiles.len());
        for profile in &snapshot.profiles {
            let api_key = match mode {
                SecretExport::IncludePlaintext => self.read_secret(profile.id).await?,
                SecretExport::Redact => String::new(),
            };
            entries.push(ExportedProfile::from_profile(profile, api_key));
        }
        if mode == SecretExport::IncludePlaintext {
            warn!(count = entries.len(), "exporting profiles with plaintext api keys");
        }
        serde_json::to_string_pretty(&entries)
            .map_err(|err| RegistryError::MalformedExport(err.to_string()))
    }

    /// Adds every well-formed entry of an export as a new profile. Clashing
    /// names gain an `" (Imported)"` suffix and malformed entries are
    /// skipped. Imported profiles only become default when none exists.
    pub async fn import_all(&self, blob: &str) -> Result<ImportReport> {
        let _op = self.op_lock.lock().await;

        let entries: Vec<serde_json::Value> = serde_json::from_str(blob)
            .map_err(|err| RegistryError::MalformedExport(err.to_string()))?;

        let existing = self.storage.list_profiles().await?;
        let mut taken: HashSet<String> = existing.iter().map(|p| p.name.clone()).collect();
        let mut needs_default = !existing.iter().any(|p| p.is_default);

        let mut snapshot = (*self.snapshot()).clone();
        let mut selected_secret = self.selected_secret(&snapshot).await?;

        let mut report = ImportReport::default();
        let mut outcome = Ok(());
        for (index, entry) in entries.into_iter().enumerate() {
            let entry: ExportedProfile = match serde_json::from_value(entry) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(index, error = %err, "skipping malformed profile entry");
                    report.skipped += 1;
                    continue;
                }
            };

            let name = unique_import_name(&entry.name, |candidate| taken.contains(candidate));
            let profile = Profile {
                id: ProfileId::new_v4(),
                name,
                model_name: entry.model_name,
                api_endpoint: entry.api_endpoint,
                is_default: needs_default,
                parameters: entry.parameters,
            };
            if let Err(err) = self.persist_new(&profile, &entry.api_key).await {
                outcome = Err(err);
                break;
            }
            if profile.is_default {
                snapshot.selected = Some(profile.id);
                selected_secret = entry.api_key;
            }
            needs_default = false;
            taken.insert(profile.name.clone());
            snapshot.insert(profile);
            report.imported += 1;
        }

        if report.imported > 0 {
            self.publish(
                snapshot,
                RegistryChange::Imported(report.imported),
                &selected_secret,
            );
        }
        outcome?;

        info!(imported = report.imported, skipped = report.skipped, "profiles imported");
        Ok(report)
    }

    /// Probes candidate settings without changing any profile.
    pub async fn test_connection(
        &self,
        endpoint: &str,
        secret: &str,
        model_name: &str,
    ) -> std::result::Result<ProbeReport, GatewayError> {
        self.gateway.probe_with(endpoint, secret, model_name).await
    }

    async fn persist_new(&self, profile: &Profile, secret: &str) -> Result<()> {
        let id = profile.id;
        let secret = secret.to_string();
        self.with_secrets(move |s| s.set(id, &secret)).await?;
        if let Err(err) = self.storage.save_profile(profile).await {
            if let Err(cleanup) = self.with_secrets(move |s| s.delete(id)).await {
                warn!(profile_id = %id, error = %cleanup, "failed to remove orphaned secret");
            }
            return Err(err.into());
        }
        Ok(())
    }

    async fn restore_secret(&self, id: ProfileId, previous: Option<String>) {
        let restored = self
            .with_secrets(move |s| match previous {
                Some(secret) => s.set(id, &secret),
                None => s.delete(id),
            })
            .await;
        if let Err(err) = restored {
            warn!(profile_id = %id, error = %err, "failed to restore previous secret");
        }
    }

    async fn read_secret(&self, id: ProfileId) -> Result<String> {
        Ok(self
            .with_secrets(move |s| s.get(id))
            .await?
            .unwrap_or_default())
    }

    async fn selected_secret(&self, snapshot: &RegistrySnapshot) -> Result<String> {
        match snapshot.selected {
            Some(id) => self.read_secret(id).await,
            None => Ok(String::new()),
        }
    }

    /// Runs a secret store call on the blocking pool; file stores do disk
    /// I/O and key derivation.
    async fn with_secrets<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ProfileSecrets) -> secrets::Result<T> + Send + 'static,
    {
        let store = self.secrets.clone();
        let outcome = tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|err| SecretError::Io(err.into()))?;
        Ok(outcome?)
    }

    /// Swaps in the snapshot, points the gateway at the selected profile and
    /// then announces the change. `secret` belongs to the selected profile
    /// and is read before the store commits.
    fn publish(
        &self,
        snapshot: RegistrySnapshot,
        change: RegistryChange,
        secret: &str,
    ) -> Arc<RegistrySnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.state.write() = Arc::clone(&snapshot);
        match snapshot.selected_profile() {
            Some(profile) => {
                self.gateway.configure(profile, secret);
            }
            None => self.gateway.clear(),
        }
        let _ = self.events.send(RegistryEvent {
            change,
            snapshot: Arc::clone(&snapshot),
        });
        snapshot
    }
}
