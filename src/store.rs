use crate::error::StoreError;
use std::collections::BTreeMap;
use std::path::PathBuf;

const LINKS_FILE: &str = "links.json";

/// Read/write/clear access to the remote subscription id tracked for each
/// trigger instance. At most one id is held per instance.
pub trait WebhookLinks: Send + Sync {
    fn webhook_id(&self, instance_id: &str) -> Option<String>;
    fn set_webhook_id(&mut self, instance_id: &str, webhook_id: String);
    /// Returns the id that was removed, if any.
    fn clear_webhook_id(&mut self, instance_id: &str) -> Option<String>;
}

/// Link table kept in memory and persisted as `links.json` under `data_dir`.
pub struct LinkStore {
    links: BTreeMap<String, String>,
    data_dir: PathBuf,
}

impl LinkStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            links: BTreeMap::new(),
            data_dir,
        }
    }

    fn path(&self) -> PathBuf {
        self.data_dir.join(LINKS_FILE)
    }

    pub fn load(&mut self) -> Result<(), StoreError> {
        let path = self.path();
        if !path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| StoreError::Read {
            path: path.display().to_string(),
            source,
        })?;
        self.links = serde_json::from_str(&content).map_err(|source| StoreError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let path = self.path();
        let content = serde_json::to_string_pretty(&self.links)?;
        std::fs::create_dir_all(&self.data_dir).map_err(|source| StoreError::Write {
            path: self.data_dir.display().to_string(),
            source,
        })?;
        std::fs::write(&path, content).map_err(|source| StoreError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Instances that currently hold a subscription.
    pub fn instance_ids(&self) -> impl Iterator<Item = &str> {
        self.links.keys().map(String::as_str)
    }
}

impl WebhookLinks for LinkStore {
    fn webhook_id(&self, instance_id: &str) -> Option<String> {
        self.links.get(instance_id).cloned()
    }

    fn set_webhook_id(&mut self, instance_id: &str, webhook_id: String) {
        self.links.insert(instance_id.to_string(), webhook_id);
    }

    fn clear_webhook_id(&mut self, instance_id: &str) -> Option<String> {
        self.links.remove(instance_id)
    }
}
