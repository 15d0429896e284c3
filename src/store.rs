//! Persisted credentials and cloud configuration.
//!
//! Both files are plain JSON compatible with the TinyTuya wizard output
//! (`devices.json`, `tinytuya.json`). Missing or corrupt files load as empty;
//! saves go through a temp file and rename so readers never see a partial file.

use log::{debug, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Code name and metadata for one data point index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DpsMapping {
    #[serde(default)]
    pub code: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Known device credentials, one per device id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Data point index -> code mapping
    #[serde(default, rename = "mapping", skip_serializing_if = "Option::is_none")]
    pub dps_mapping: Option<BTreeMap<String, DpsMapping>>,
    /// Remaining wizard/cloud fields, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CredentialRecord {
    /// Data point index whose mapping code equals `code`.
    pub fn dp_for_code(&self, code: &str) -> Option<&str> {
        self.dps_mapping
            .as_ref()?
            .iter()
            .find(|(_, m)| m.code == code)
            .map(|(dp, _)| dp.as_str())
    }
}

/// Tuya cloud account settings. Empty fields mean cloud sync is unavailable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(rename = "apiKey", default)]
    pub api_key: String,
    #[serde(rename = "apiSecret", default)]
    pub api_secret: String,
    #[serde(rename = "apiRegion", default)]
    pub api_region: String,
    #[serde(rename = "apiDeviceID", default)]
    pub api_device_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CloudConfig {
    pub fn new(key: &str, secret: &str, region: &str, device_id: &str) -> Self {
        Self {
            api_key: key.to_string(),
            api_secret: secret.to_string(),
            api_region: region.to_string(),
            api_device_id: device_id.to_string(),
            extra: Map::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.api_key.is_empty()
            && !self.api_secret.is_empty()
            && !self.api_region.is_empty()
            && !self.api_device_id.is_empty()
    }
}

/// In-memory credential list backed by a JSON file.
///
/// The list is swapped as a whole, so readers get either the old or the new
/// snapshot.
pub struct CredentialStore {
    path: PathBuf,
    persist: bool,
    records: RwLock<Arc<Vec<CredentialRecord>>>,
}

impl CredentialStore {
    /// Load `path` (empty when absent or unreadable).
    pub fn open(path: impl Into<PathBuf>, persist: bool) -> Self {
        let path = path.into();
        let records = load_records(&path);
        Self {
            path,
            persist,
            records: RwLock::new(Arc::new(records)),
        }
    }

    /// Store that never touches the filesystem.
    pub fn in_memory(records: Vec<CredentialRecord>) -> Self {
        Self {
            path: PathBuf::new(),
            persist: false,
            records: RwLock::new(Arc::new(records)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current snapshot.
    pub fn records(&self) -> Arc<Vec<CredentialRecord>> {
        self.records.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup(&self, id: &str) -> Option<CredentialRecord> {
        self.records.read().iter().find(|r| r.id == id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<CredentialRecord> {
        self.records.read().iter().find(|r| r.name == name).cloned()
    }

    /// Replace the whole list. Does not persist; call [`save`](Self::save).
    pub fn replace(&self, records: Vec<CredentialRecord>) {
        *self.records.write() = Arc::new(records);
    }

    /// Write the current list. Returns false when persistence is disabled or
    /// the write failed.
    pub fn save(&self) -> bool {
        if !self.persist {
            return false;
        }
        let records = self.records();
        match write_json_atomic(&self.path, records.as_slice()) {
            Ok(()) => {
                debug!("saved={} [{} devices]", self.path.display(), records.len());
                true
            }
            Err(e) => {
                warn!("Failed to save {}: {}", self.path.display(), e);
                false
            }
        }
    }
}

/// Read a credential file. Entries that are not valid records are skipped.
pub fn load_records(path: &Path) -> Vec<CredentialRecord> {
    let raw: Vec<Value> = match std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
    {
        Ok(v) => v,
        Err(e) => {
            debug!("Device file {} could not be loaded: {}", path.display(), e);
            return Vec::new();
        }
    };

    let records: Vec<CredentialRecord> = raw
        .into_iter()
        .filter_map(|v| match serde_json::from_value(v) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("Skipping malformed entry in {}: {}", path.display(), e);
                None
            }
        })
        .collect();
    debug!("loaded={} [{} devices]", path.display(), records.len());
    records
}

/// Cloud account settings read from a JSON file at startup. Runtime updates
/// stay in memory; the file is never written.
pub struct CloudConfigStore {
    config: RwLock<CloudConfig>,
}

impl CloudConfigStore {
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let config = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_else(|| {
                debug!("No cloud config file found {}", path.display());
                CloudConfig::default()
            });
        Self::in_memory(config)
    }

    pub fn in_memory(config: CloudConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn get(&self) -> CloudConfig {
        self.config.read().clone()
    }

    pub fn set(&self, config: CloudConfig) {
        *self.config.write() = config;
    }
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut tmp, formatter);
    value.serialize(&mut ser).map_err(std::io::Error::other)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
