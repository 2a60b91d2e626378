use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use orbroker_contracts::{Credentials, SETTINGS_CALLER_ID, SettingsBlob};
use orbroker_core::{BrokerError, SettingsBackend};
use tracing::{debug, info};

#[derive(Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<Option<SettingsBlob>>>,
}

impl InMemoryBackend {
    pub fn with_blob(blob: SettingsBlob) -> Self {
        Self { inner: Arc::new(Mutex::new(Some(blob))) }
    }

    pub fn stored(&self) -> Option<SettingsBlob> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl SettingsBackend for InMemoryBackend {
    fn load(&self) -> Result<Option<SettingsBlob>, BrokerError> {
        Ok(self.stored())
    }

    fn save(&self, blob: &SettingsBlob) -> Result<(), BrokerError> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(blob.clone());
        Ok(())
    }
}

pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsBackend for JsonFileBackend {
    fn load(&self) -> Result<Option<SettingsBlob>, BrokerError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(BrokerError::Store(format!(
                    "failed to read {}: {err}",
                    self.path.display()
                )));
            }
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|err| {
            BrokerError::Store(format!("failed to parse {}: {err}", self.path.display()))
        })
    }

    fn save(&self, blob: &SettingsBlob) -> Result<(), BrokerError> {
        let encoded = serde_json::to_vec_pretty(blob)
            .map_err(|err| BrokerError::Store(format!("failed to encode settings: {err}")))?;
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                BrokerError::Store(format!("failed to create {}: {err}", parent.display()))
            })?;
        }
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, encoded).map_err(|err| {
            BrokerError::Store(format!("failed to write {}: {err}", staging.display()))
        })?;
        fs::rename(&staging, &self.path).map_err(|err| {
            BrokerError::Store(format!("failed to replace {}: {err}", self.path.display()))
        })
    }
}

pub struct PreferenceStore {
    backend: Arc<dyn SettingsBackend>,
    blob: RwLock<SettingsBlob>,
}

impl PreferenceStore {
    pub fn load(backend: Arc<dyn SettingsBackend>) -> Result<Self, BrokerError> {
        let blob = backend.load()?.unwrap_or_default();
        info!(
            event = "settings.loaded",
            has_api_key = !blob.api_key.is_empty(),
            favorites = blob.favorites.len(),
            callers = blob.models.len()
        );
        Ok(Self { backend, blob: RwLock::new(blob) })
    }

    pub fn snapshot(&self) -> SettingsBlob {
        self.read().clone()
    }

    pub fn credentials(&self) -> Credentials {
        let blob = self.read();
        Credentials { api_key: blob.api_key.clone(), endpoint_url: blob.endpoint_url.clone() }
    }

    pub fn api_key(&self) -> String {
        self.read().api_key.clone()
    }

    pub fn set_api_key(&self, api_key: &str) -> Result<(), BrokerError> {
        let api_key = api_key.trim().to_string();
        self.update("api_key", |blob| replace(&mut blob.api_key, api_key))
    }

    pub fn set_endpoint_url(&self, endpoint_url: &str) -> Result<(), BrokerError> {
        let endpoint_url = endpoint_url.trim().to_string();
        self.update("endpoint_url", |blob| replace(&mut blob.endpoint_url, endpoint_url))
    }

    pub fn model(&self, caller_id: &str) -> Option<String> {
        self.read().models.get(caller_id).cloned()
    }

    pub fn set_model(&self, caller_id: &str, model_id: &str) -> Result<(), BrokerError> {
        self.update("model", |blob| {
            let previous = blob.models.insert(caller_id.to_string(), model_id.to_string());
            previous.as_deref() != Some(model_id)
        })
    }

    pub fn callers(&self) -> Vec<String> {
        self.read()
            .models
            .keys()
            .filter(|caller| caller.as_str() != SETTINGS_CALLER_ID)
            .cloned()
            .collect()
    }

    pub fn favorites(&self) -> Vec<String> {
        self.read().favorites.clone()
    }

    pub fn context_length(&self, model_id: &str) -> Option<u32> {
        self.read().context_lengths.get(model_id).copied()
    }

    pub fn add_favorite(
        &self,
        model_id: &str,
        context_length: Option<u32>,
    ) -> Result<(), BrokerError> {
        self.update("favorites", |blob| {
            let mut changed = false;
            if !blob.favorites.iter().any(|favorite| favorite == model_id) {
                blob.favorites.push(model_id.to_string());
                changed = true;
            }
            if let Some(tokens) = context_length {
                changed |= blob.context_lengths.insert(model_id.to_string(), tokens) != Some(tokens);
            }
            changed
        })
    }

    pub fn remove_favorite(&self, model_id: &str) -> Result<(), BrokerError> {
        self.update("favorites", |blob| {
            let before = blob.favorites.len();
            blob.favorites.retain(|favorite| favorite != model_id);
            blob.favorites.len() != before
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SettingsBlob> {
        self.blob.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `change` to a copy, persists it, then publishes it. Nothing is
    /// written when `change` reports no difference.
    fn update(
        &self,
        field: &'static str,
        change: impl FnOnce(&mut SettingsBlob) -> bool,
    ) -> Result<(), BrokerError> {
        let mut guard = self.blob.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        if !change(&mut next) {
            debug!(event = "settings.unchanged", field);
            return Ok(());
        }
        self.backend.save(&next)?;
        *guard = next;
        debug!(event = "settings.saved", field);
        Ok(())
    }
}

fn replace(slot: &mut String, value: String) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}
