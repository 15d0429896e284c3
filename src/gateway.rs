//! Command gateway operations.
//!
//! Every operation returns either a JSON body or an [`ApiError`]; the HTTP
//! layer turns both into `200 application/json` replies.

use crate::cloud::{CloudError, CloudSync};
use crate::error::TuyaError;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::session::{DeviceConnector, DeviceOp, DeviceTarget, perform};
use crate::stats::Stats;
use crate::store::{CloudConfig, CredentialStore};
use log::{debug, info, warn};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SWITCH: &str = "1";
pub const DEFAULT_DELAY_SECS: &str = "10";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Device ID not found.")]
    DeviceNotFound { id: String },

    #[error("Syntax error in {command} command URL.")]
    Syntax { command: String, url: String },

    #[error("Error sending command to device.")]
    Command { id: String, source: TuyaError },

    #[error("Error polling device.")]
    Poll { id: String, source: TuyaError },

    #[error("Invalid command.")]
    InvalidCommand { url: String },

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("Unable to encode response.")]
    Encode(#[from] serde_json::Error),
}

impl ApiError {
    pub fn to_json(&self) -> Value {
        let message = self.to_string();
        match self {
            ApiError::DeviceNotFound { id } => json!({"Error": message, "id": id}),
            ApiError::Syntax { url, .. } | ApiError::InvalidCommand { url } => {
                json!({"Error": message, "url": url})
            }
            ApiError::Command { id, source } | ApiError::Poll { id, source } => {
                let mut body = json!({"Error": message, "id": id});
                if let (Some(body), Value::Object(detail)) = (body.as_object_mut(), source.detail())
                {
                    body.extend(detail);
                }
                body
            }
            ApiError::Cloud(e) => e.to_json(),
            ApiError::Encode(e) => json!({"Error": message, "Payload": e.to_string()}),
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            ApiError::Command { source, .. } | ApiError::Poll { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

pub type ApiResult = std::result::Result<Value, ApiError>;

/// Shape a device call result for the API: nothing becomes `{"status":"OK"}`,
/// objects pass through and anything else is wrapped as `{"status": v}`.
pub fn format_return(value: Option<Value>) -> Value {
    match value {
        None | Some(Value::Null) => json!({"status": "OK"}),
        Some(v @ Value::Object(_)) => v,
        Some(v) => json!({"status": v}),
    }
}

/// Coerce a URL value for `/set`: `true`/`false` become booleans, a leading
/// quote yields the text up to the next quote, all-digit tokens become
/// integers and anything else stays a string.
pub fn coerce_value(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Some(rest) = raw.strip_prefix('"') {
        let inner = rest.split('"').next().unwrap_or_default();
        return Value::String(inner.to_string());
    }
    if !raw.is_empty()
        && raw.chars().all(|c| c.is_ascii_digit())
        && let Ok(n) = raw.parse::<i64>()
    {
        return Value::from(n);
    }
    Value::String(raw.to_string())
}

pub struct Gateway {
    registry: Arc<Registry>,
    store: Arc<CredentialStore>,
    cloud: Arc<CloudSync>,
    connector: Arc<dyn DeviceConnector>,
    scheduler: Scheduler,
    stats: Stats,
    web_root: PathBuf,
}

impl Gateway {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<CredentialStore>,
        cloud: Arc<CloudSync>,
        connector: Arc<dyn DeviceConnector>,
        scheduler: Scheduler,
        web_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            store,
            cloud,
            connector,
            scheduler,
            stats: Stats::new(),
            web_root: web_root.into(),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn web_root(&self) -> &Path {
        &self.web_root
    }

    /// Count a finished request and produce its body.
    pub fn finish(&self, result: ApiResult) -> Value {
        match result {
            Ok(body) => {
                self.stats.record(false, false);
                body
            }
            Err(e) => {
                debug!("Request failed: {}", e);
                self.stats.record(true, e.is_timeout());
                e.to_json()
            }
        }
    }

    /// Resolve an id or device name to a live registry target.
    fn live_target(&self, token: &str) -> std::result::Result<DeviceTarget, ApiError> {
        self.registry
            .resolve_token(token)
            .and_then(|id| self.registry.get(&id))
            .map(|entry| DeviceTarget::from_entry(&entry))
            .ok_or_else(|| {
                debug!("Device ID not found: {}", token);
                ApiError::DeviceNotFound {
                    id: token.to_string(),
                }
            })
    }

    pub fn devices(&self) -> ApiResult {
        Ok(serde_json::to_value(self.registry.snapshot())?)
    }

    pub fn device(&self, token: &str) -> ApiResult {
        if let Some(entry) = self
            .registry
            .resolve_token(token)
            .and_then(|id| self.registry.get(&id))
        {
            return Ok(serde_json::to_value(entry)?);
        }
        let record = self
            .store
            .lookup(token)
            .or_else(|| self.store.find_by_name(token));
        match record {
            Some(record) if !record.name.is_empty() => Ok(json!({
                "name": record.name,
                "mac": record.mac.unwrap_or_default(),
                "key": record.key,
                "id": record.id,
            })),
            _ => Err(ApiError::DeviceNotFound {
                id: token.to_string(),
            }),
        }
    }

    pub fn num_devices(&self) -> ApiResult {
        Ok(json!({
            "found": self.registry.size(),
            "registered": self.store.len(),
        }))
    }

    pub async fn status(&self, token: &str) -> ApiResult {
        let target = self.live_target(token)?;
        let mut response = perform(self.connector.as_ref(), &target, DeviceOp::Status)
            .await
            .map_err(|source| {
                debug!("Error polling device {}: {}", target.id, source);
                ApiError::Poll {
                    id: target.id.clone(),
                    source,
                }
            })?
            .unwrap_or_default();

        if let (Some(record), Some(body)) = (self.store.lookup(&target.id), response.as_object_mut())
        {
            let mapping = match record.dps_mapping {
                Some(m) => serde_json::to_value(m)?,
                None => Value::Array(Vec::new()),
            };
            body.insert("dps_mapping".into(), mapping);
        }
        Ok(format_return(Some(response)))
    }

    pub async fn set_value(&self, token: &str, dp: &str, raw_value: &str) -> ApiResult {
        let target = self.live_target(token)?;
        let value = coerce_value(raw_value);
        let dp = if dp.chars().all(|c| c.is_ascii_digit()) {
            dp.to_string()
        } else {
            self.store
                .lookup(&target.id)
                .and_then(|r| r.dp_for_code(dp).map(str::to_string))
                .unwrap_or_else(|| dp.to_string())
        };
        debug!("Set dps {}={} on {}", dp, value, target.id);
        self.control(&target, DeviceOp::SetValue { dp, value }).await
    }

    pub async fn switch(&self, token: &str, switch: &str, on: bool) -> ApiResult {
        let target = self.live_target(token)?;
        let switch = switch.to_string();
        let op = if on {
            DeviceOp::TurnOn { switch }
        } else {
            DeviceOp::TurnOff { switch }
        };
        self.control(&target, op).await
    }

    async fn control(&self, target: &DeviceTarget, op: DeviceOp) -> ApiResult {
        perform(self.connector.as_ref(), target, op)
            .await
            .map(format_return)
            .map_err(|source| {
                debug!("Error sending command to device {}: {}", target.id, source);
                ApiError::Command {
                    id: target.id.clone(),
                    source,
                }
            })
    }

    /// Schedule a turn-off and acknowledge at once. The device is only
    /// contacted when the delay expires.
    pub fn delay_off(&self, token: &str, switch: &str, seconds: &str, url: &str) -> ApiResult {
        let delay: u64 = seconds.parse().map_err(|_| ApiError::Syntax {
            command: "delayoff".into(),
            url: url.to_string(),
        })?;
        let target = self.live_target(token)?;

        let connector = self.connector.clone();
        let op = DeviceOp::TurnOff {
            switch: switch.to_string(),
        };
        let label = format!("turn off {} switch {}", target.id, switch);
        self.scheduler
            .schedule(Duration::from_secs(delay), label, async move {
                if let Err(e) = perform(connector.as_ref(), &target, op).await {
                    warn!("Delayed turn off of {} failed: {}", target.id, e);
                }
            });

        Ok(json!({
            "OK": format!("Turning off in {} seconds.", delay),
            "url": url,
        }))
    }

    /// Refresh from the cloud and arm an immediate resolver pass.
    pub async fn sync(&self) -> ApiResult {
        let result = self.cloud.refresh().await;
        self.registry.force_resolve();
        let devices = result?;
        info!("Cloud sync loaded {} devices", devices.len());
        Ok(json!({ "devices": devices.as_slice() }))
    }

    pub async fn cloud_config(
        &self,
        api_key: &str,
        api_secret: &str,
        api_region: &str,
        api_device_id: &str,
    ) -> ApiResult {
        let mut config = self.cloud.config();
        let updated = CloudConfig::new(api_key, api_secret, api_region, api_device_id);
        config.api_key = updated.api_key;
        config.api_secret = updated.api_secret;
        config.api_region = updated.api_region;
        config.api_device_id = updated.api_device_id;
        self.cloud.set_config(config);
        self.sync().await
    }

    /// Known credentials whose device has not been seen on the network.
    pub fn offline(&self) -> ApiResult {
        let mut offline = Map::new();
        for record in self.store.records().iter() {
            if self.registry.contains(&record.id) {
                continue;
            }
            let mut entry = Map::new();
            entry.insert("name".into(), Value::String(record.name.clone()));
            if let Some(mac) = &record.mac {
                entry.insert("mac".into(), Value::String(mac.clone()));
            }
            offline.insert(record.id.clone(), Value::Object(entry));
        }
        Ok(Value::Object(offline))
    }

    pub fn stats_report(&self) -> ApiResult {
        Ok(serde_json::to_value(self.stats.snapshot())?)
    }
}

/// `[path, description]` pairs for `/help`.
pub const HELP: &[(&str, &str)] = &[
    ("/devices", "List all devices discovered with metadata"),
    ("/device/{DeviceID}|{DeviceName}", "List specific device metadata"),
    ("/numdevices", "List current number of devices discovered"),
    ("/status/{DeviceID}|{DeviceName}", "List current device status"),
    (
        "/set/{DeviceID}|{DeviceName}/{Key}|{Code}/{Value}",
        "Set DPS {Key} or {Code} with {Value}",
    ),
    ("/turnon/{DeviceID}|{DeviceName}/{SwitchNo}", "Turn on device, optional {SwitchNo}"),
    ("/turnoff/{DeviceID}|{DeviceName}/{SwitchNo}", "Turn off device, optional {SwitchNo}"),
    (
        "/delayoff/{DeviceID}|{DeviceName}/{SwitchNo}/{Seconds}",
        "Turn off device with a delay, optional {SwitchNo}/{Delay}",
    ),
    ("/sync", "Fetches the device list and local keys from the Tuya Cloud API"),
    (
        "/cloudconfig/{apiKey}/{apiSecret}/{apiRegion}/{apiDeviceID}",
        "Sets the Tuya Cloud API login info",
    ),
    ("/offline", "List of registered devices that are offline"),
    ("/stats", "Request counters and memory usage"),
    ("/help", "List of all commands"),
];

pub fn help() -> Value {
    Value::Array(HELP.iter().map(|(path, desc)| json!([path, desc])).collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cloud::tests::{FakeCloud, record};
    use crate::protocol::Version;
    use crate::registry::Announcement;
    use crate::session::tests::FakeConnector;
    use crate::store::{CloudConfigStore, CredentialRecord, DpsMapping};
    use std::collections::BTreeMap;
    use tokio_util::sync::CancellationToken;

    pub(crate) struct Fixture {
        pub gateway: Arc<Gateway>,
        pub registry: Arc<Registry>,
        pub store: Arc<CredentialStore>,
        pub connector: Arc<FakeConnector>,
        pub cloud: Arc<FakeCloud>,
        pub token: CancellationToken,
    }

    pub(crate) fn plug_record() -> CredentialRecord {
        let mut mapping = BTreeMap::new();
        mapping.insert(
            "1".to_string(),
            DpsMapping {
                code: "switch_1".into(),
                ..Default::default()
            },
        );
        mapping.insert(
            "9".to_string(),
            DpsMapping {
                code: "countdown_1".into(),
                ..Default::default()
            },
        );
        CredentialRecord {
            id: "abc123".into(),
            name: "Plug1".into(),
            key: "0123456789abcdef".into(),
            mac: Some("aa:bb:cc:dd:ee:ff".into()),
            dps_mapping: Some(mapping),
            ..Default::default()
        }
    }

    pub(crate) fn fixture_with(connector: FakeConnector, cloud: Arc<FakeCloud>) -> Fixture {
        build(connector, cloud, PathBuf::from("web"))
    }

    pub(crate) fn fixture_serving(web_root: &Path) -> Fixture {
        build(
            FakeConnector {
                status: json!({"devId": "abc123", "dps": {"1": true}}),
                ..Default::default()
            },
            FakeCloud::ok(vec![]),
            web_root.to_path_buf(),
        )
    }

    fn build(connector: FakeConnector, cloud: Arc<FakeCloud>, web_root: PathBuf) -> Fixture {
        let registry = Arc::new(Registry::new());
        let store = Arc::new(CredentialStore::in_memory(vec![
            plug_record(),
            record("off1", "Porch", "k2"),
        ]));
        let sync = Arc::new(CloudSync::new(
            Some(cloud.clone()),
            Arc::new(CloudConfigStore::in_memory(CloudConfig::default())),
            store.clone(),
        ));
        let connector = Arc::new(connector);
        let token = CancellationToken::new();
        let gateway = Arc::new(Gateway::new(
            registry.clone(),
            store.clone(),
            sync,
            connector.clone(),
            Scheduler::new(token.clone()),
            web_root,
        ));

        let ann = Announcement {
            id: "abc123".into(),
            ip: "192.168.1.20".into(),
            version: Some(Version::V3_3),
            ..Default::default()
        };
        registry.observe(&ann, store.lookup("abc123").as_ref(), 5);

        Fixture {
            gateway,
            registry,
            store,
            connector,
            cloud,
            token,
        }
    }

    pub(crate) fn fixture() -> Fixture {
        fixture_with(
            FakeConnector {
                status: json!({"devId": "abc123", "dps": {"1": true}}),
                ..Default::default()
            },
            FakeCloud::ok(vec![]),
        )
    }

    #[test]
    fn coerces_set_values() {
        assert_eq!(coerce_value("true"), json!(true));
        assert_eq!(coerce_value("FALSE"), json!(false));
        assert_eq!(coerce_value("42"), json!(42));
        assert_eq!(coerce_value("\"hello\""), json!("hello"));
        assert_eq!(coerce_value("\"open"), json!("open"));
        assert_eq!(coerce_value("-5"), json!("-5"));
        assert_eq!(coerce_value("1.5"), json!("1.5"));
        assert_eq!(coerce_value("white"), json!("white"));
    }

    #[test]
    fn formats_device_returns() {
        assert_eq!(format_return(None), json!({"status": "OK"}));
        assert_eq!(format_return(Some(json!({"dps": {}}))), json!({"dps": {}}));
        assert_eq!(format_return(Some(json!(3))), json!({"status": 3}));
    }

    #[tokio::test]
    async fn unknown_device_is_not_found_and_never_contacted() {
        let f = fixture();
        let err = f.gateway.switch("unknownid", "1", false).await.unwrap_err();
        assert_eq!(
            err.to_json(),
            json!({"Error": "Device ID not found.", "id": "unknownid"})
        );
        assert!(f.connector.entries().is_empty());
    }

    #[tokio::test]
    async fn set_by_name_and_code() {
        let f = fixture();
        let reply = f.gateway.set_value("Plug1", "switch_1", "false").await.unwrap();
        assert_eq!(reply, json!({"status": "OK"}));
        assert_eq!(
            f.connector.entries(),
            vec!["open abc123", "set abc123 1=false", "close abc123"]
        );
    }

    #[tokio::test]
    async fn status_adds_mapping() {
        let f = fixture();
        let reply = f.gateway.status("abc123").await.unwrap();
        assert_eq!(reply["dps"]["1"], true);
        assert_eq!(reply["dps_mapping"]["9"]["code"], "countdown_1");
    }

    #[tokio::test]
    async fn device_failure_reports_id_and_detail() {
        let f = fixture_with(
            FakeConnector {
                fail_ops: Some(TuyaError::Timeout),
                ..Default::default()
            },
            FakeCloud::ok(vec![]),
        );
        let err = f.gateway.status("abc123").await.unwrap_err();
        assert!(err.is_timeout());
        let body = err.to_json();
        assert_eq!(body["Error"], "Error polling device.");
        assert_eq!(body["id"], "abc123");
        assert_eq!(body["Err"], "902");
        assert_eq!(f.connector.entries().last().map(String::as_str), Some("close abc123"));
    }

    #[test]
    fn device_falls_back_to_credentials() {
        let f = fixture();
        assert_eq!(f.gateway.device("Plug1").unwrap()["ip"], "192.168.1.20");
        assert_eq!(
            f.gateway.device("off1").unwrap(),
            json!({"name": "Porch", "mac": "", "key": "k2", "id": "off1"})
        );
        assert!(f.gateway.device("ghost").is_err());
    }

    #[test]
    fn counts_and_offline() {
        let f = fixture();
        assert_eq!(
            f.gateway.num_devices().unwrap(),
            json!({"found": 1, "registered": 2})
        );
        assert_eq!(
            f.gateway.offline().unwrap(),
            json!({"off1": {"name": "Porch"}})
        );
    }

    #[tokio::test]
    async fn sync_without_config_arms_force_resolve() {
        let f = fixture();
        let err = f.gateway.sync().await.unwrap_err();
        assert_eq!(err.to_json(), json!({"Error": "Cloud API config missing"}));
        assert_eq!(f.cloud.calls(), 0);
        assert_eq!(
            f.registry.pending(),
            vec![crate::registry::PendingResolution::ForceResolveSignal]
        );
    }

    #[tokio::test]
    async fn cloud_config_updates_and_syncs() {
        let f = fixture_with(
            FakeConnector::default(),
            FakeCloud::ok(vec![record("new1", "Desk", "k3")]),
        );
        let reply = f.gateway.cloud_config("k", "s", "eu", "dev").await.unwrap();
        assert_eq!(reply["devices"][0]["id"], "new1");
        assert_eq!(f.store.len(), 1);
        assert_eq!(f.cloud.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_off_fires_later() {
        let f = fixture();
        let reply = f
            .gateway
            .delay_off("Plug1", "2", "5", "/delayoff/Plug1/2/5")
            .unwrap();
        assert_eq!(reply["OK"], "Turning off in 5 seconds.");
        assert!(f.connector.entries().is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(
            f.connector.entries(),
            vec!["open abc123", "set abc123 2=false", "close abc123"]
        );

        let err = f
            .gateway
            .delay_off("Plug1", "1", "soon", "/delayoff/Plug1/1/soon")
            .unwrap_err();
        assert_eq!(err.to_json()["Error"], "Syntax error in delayoff command URL.");
        f.token.cancel();
    }

    #[test]
    fn encode_failure_is_an_error_reply() {
        let err = ApiError::from(serde_json::from_str::<Value>("{").unwrap_err());
        let body = err.to_json();
        assert_eq!(body["Error"], "Unable to encode response.");
        assert!(body["Payload"].is_string());
        assert!(!err.is_timeout());
    }

    #[test]
    fn help_lists_every_route_including_itself() {
        let paths: Vec<_> = HELP.iter().map(|(path, _)| *path).collect();
        for route in ["/devices", "/sync", "/offline", "/stats", "/help"] {
            assert!(paths.contains(&route), "missing {}", route);
        }
        assert_eq!(help().as_array().unwrap().len(), HELP.len());
    }

    #[test]
    fn finish_counts_errors() {
        let f = fixture();
        f.gateway.finish(Ok(json!({})));
        f.gateway.finish(Err(ApiError::InvalidCommand { url: "/x".into() }));
        let snap = f.gateway.stats().snapshot();
        assert_eq!((snap.gets, snap.errors), (2, 1));
    }
}
