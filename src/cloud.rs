//! Cloud Sync Bridge.
//!
//! Pulls the device list (with local keys) from a [`CloudClient`] and replaces
//! the credential store with it.

use crate::store::{CloudConfig, CloudConfigStore, CredentialRecord, CredentialStore};
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;

/// Vendor cloud capability: the full device list or the provider's own error
/// object.
pub trait CloudClient: Send + Sync {
    fn fetch_devices<'a>(
        &'a self,
        config: &'a CloudConfig,
    ) -> BoxFuture<'a, std::result::Result<Vec<CredentialRecord>, Value>>;
}

#[derive(Error, Debug, Clone)]
pub enum CloudError {
    /// One of the four account fields is empty; nothing was sent.
    #[error("Cloud API config missing")]
    ConfigMissing,

    /// No cloud client is wired into this process.
    #[error("Cloud client unavailable")]
    Unavailable,

    /// The provider's error object, passed through untouched.
    #[error("Cloud provider error: {0}")]
    Provider(Value),
}

impl CloudError {
    pub fn to_json(&self) -> Value {
        match self {
            CloudError::Provider(v) => v.clone(),
            other => json!({ "Error": other.to_string() }),
        }
    }
}

pub struct CloudSync {
    client: Option<Arc<dyn CloudClient>>,
    config: Arc<CloudConfigStore>,
    store: Arc<CredentialStore>,
}

impl CloudSync {
    pub fn new(
        client: Option<Arc<dyn CloudClient>>,
        config: Arc<CloudConfigStore>,
        store: Arc<CredentialStore>,
    ) -> Self {
        Self {
            client,
            config,
            store,
        }
    }

    pub fn config(&self) -> CloudConfig {
        self.config.get()
    }

    pub fn set_config(&self, config: CloudConfig) {
        self.config.set(config);
    }

    /// Fetch and install the cloud device list, then persist it. The store is
    /// left untouched on any failure.
    pub async fn refresh(&self) -> std::result::Result<Arc<Vec<CredentialRecord>>, CloudError> {
        debug!("Calling Cloud Refresh");
        let config = self.config.get();
        if !config.is_complete() {
            debug!("Cloud API config missing, not loading");
            return Err(CloudError::ConfigMissing);
        }
        let client = self.client.as_ref().ok_or(CloudError::Unavailable)?;

        let devices = match client.fetch_devices(&config).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Cloud refresh failed: {}", e);
                return Err(CloudError::Provider(e));
            }
        };

        info!("Cloud refresh returned {} devices", devices.len());
        self.store.replace(devices);
        self.store.save();
        Ok(self.store.records())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Cloud client returning a canned answer and counting calls.
    pub(crate) struct FakeCloud {
        pub answer: std::result::Result<Vec<CredentialRecord>, Value>,
        pub calls: AtomicUsize,
    }

    impl FakeCloud {
        pub(crate) fn ok(devices: Vec<CredentialRecord>) -> Arc<Self> {
            Arc::new(Self {
                answer: Ok(devices),
                calls: AtomicUsize::new(0),
            })
        }

        pub(crate) fn err(error: Value) -> Arc<Self> {
            Arc::new(Self {
                answer: Err(error),
                calls: AtomicUsize::new(0),
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl CloudClient for FakeCloud {
        fn fetch_devices<'a>(
            &'a self,
            _config: &'a CloudConfig,
        ) -> BoxFuture<'a, std::result::Result<Vec<CredentialRecord>, Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let answer = self.answer.clone();
            Box::pin(async move { answer })
        }
    }

    pub(crate) fn record(id: &str, name: &str, key: &str) -> CredentialRecord {
        CredentialRecord {
            id: id.into(),
            name: name.into(),
            key: key.into(),
            ..Default::default()
        }
    }

    fn bridge(
        client: Option<Arc<dyn CloudClient>>,
        config: CloudConfig,
    ) -> (CloudSync, Arc<CredentialStore>) {
        let store = Arc::new(CredentialStore::in_memory(vec![record("old", "Old", "k")]));
        let sync = CloudSync::new(
            client,
            Arc::new(CloudConfigStore::in_memory(config)),
            store.clone(),
        );
        (sync, store)
    }

    #[tokio::test]
    async fn missing_config_never_calls_client() {
        let cloud = FakeCloud::ok(vec![record("new", "New", "k")]);
        let mut config = CloudConfig::new("key", "secret", "us", "dev");
        config.api_key.clear();
        let (sync, store) = bridge(Some(cloud.clone()), config);

        let err = sync.refresh().await.unwrap_err();
        assert_eq!(err.to_json(), json!({"Error": "Cloud API config missing"}));
        assert_eq!(cloud.calls(), 0);
        assert_eq!(store.records()[0].id, "old");
    }

    #[tokio::test]
    async fn success_replaces_store() {
        let cloud = FakeCloud::ok(vec![record("a", "A", "ka"), record("b", "B", "kb")]);
        let (sync, store) = bridge(Some(cloud.clone()), CloudConfig::new("k", "s", "eu", "d"));

        let devices = sync.refresh().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(store.len(), 2);
        assert!(store.lookup("old").is_none());
        assert_eq!(cloud.calls(), 1);
    }

    #[tokio::test]
    async fn provider_error_passes_through_verbatim() {
        let provider = json!({"Error": "Unable to Get Cloud Token", "Err": "911", "Payload": "sign invalid"});
        let cloud = FakeCloud::err(provider.clone());
        let (sync, store) = bridge(Some(cloud), CloudConfig::new("k", "s", "eu", "d"));

        let err = sync.refresh().await.unwrap_err();
        assert_eq!(err.to_json(), provider);
        assert_eq!(store.records()[0].id, "old");
    }

    #[tokio::test]
    async fn no_client_is_reported() {
        let (sync, _) = bridge(None, CloudConfig::new("k", "s", "eu", "d"));
        assert!(matches!(
            sync.refresh().await,
            Err(CloudError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn success_persists_devices_but_not_cloud_config() {
        let tmp = tempfile::tempdir().unwrap();
        let devices_path = tmp.path().join("devices.json");
        let config_path = tmp.path().join("tinytuya.json");

        let store = Arc::new(CredentialStore::open(&devices_path, true));
        let config = Arc::new(CloudConfigStore::open(&config_path));
        config.set(CloudConfig::new("k", "s", "eu", "d"));
        let cloud = FakeCloud::ok(vec![record("a", "A", "ka")]);
        let sync = CloudSync::new(Some(cloud), config, store);

        sync.refresh().await.unwrap();
        let reloaded = CredentialStore::open(&devices_path, false);
        assert_eq!(reloaded.lookup("a").unwrap().key, "ka");
        assert!(!config_path.exists());
    }
}
