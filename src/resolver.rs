//! Background credential resolution for devices discovered before their keys
//! were known.

use crate::cloud::CloudSync;
use crate::registry::{PassOutcome, Registry};
use crate::store::CredentialStore;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const TICK: Duration = Duration::from_secs(2);

pub struct RetryResolver {
    registry: Arc<Registry>,
    store: Arc<CredentialStore>,
    cloud: Arc<CloudSync>,
    interval: Duration,
}

impl RetryResolver {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<CredentialStore>,
        cloud: Arc<CloudSync>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            cloud,
            interval,
        }
    }

    /// Run one pass if there is work. Every pass refreshes from the cloud once
    /// before matching candidates against the credential store.
    pub async fn run_pass(&self, schedule_due: bool) -> Option<PassOutcome> {
        let pass = self.registry.begin_pass(schedule_due)?;
        debug!(
            "Resolver pass ({:?}) over {} device(s)",
            pass.kind,
            pass.candidates.len()
        );

        if let Err(e) = self.cloud.refresh().await {
            debug!("Cloud refresh skipped: {}", e);
        }

        let resolved = pass
            .candidates
            .iter()
            .filter_map(|id| {
                self.store
                    .lookup(id)
                    .filter(|r| !r.name.is_empty() || !r.key.is_empty())
                    .map(|r| (id.clone(), r))
            })
            .collect();

        let outcome = self.registry.complete_pass(&pass, resolved);
        for id in &outcome.resolved {
            info!("Resolved credentials for {}", id);
        }
        for id in &outcome.expired {
            warn!("Giving up on resolving {}", id);
        }
        Some(outcome)
    }

    /// Tick until cancelled. The retry timer starts expired, and every pass
    /// that runs pushes it one interval ahead.
    pub async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_due = Instant::now();

        while !token.is_cancelled() {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.registry.force_requested() => {}
            }

            if self.run_pass(Instant::now() >= next_due).await.is_some() {
                next_due = Instant::now() + self.interval;
            }
        }
        debug!("Retry resolver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::tests::{FakeCloud, record};
    use crate::registry::{Announcement, PendingResolution};
    use crate::store::{CloudConfig, CloudConfigStore};

    struct Fixture {
        registry: Arc<Registry>,
        store: Arc<CredentialStore>,
        cloud: Arc<FakeCloud>,
        resolver: RetryResolver,
    }

    fn fixture(cloud: Arc<FakeCloud>) -> Fixture {
        let registry = Arc::new(Registry::new());
        let store = Arc::new(CredentialStore::in_memory(vec![]));
        let sync = Arc::new(CloudSync::new(
            Some(cloud.clone()),
            Arc::new(CloudConfigStore::in_memory(CloudConfig::new(
                "k", "s", "us", "d",
            ))),
            store.clone(),
        ));
        let resolver = RetryResolver::new(
            registry.clone(),
            store.clone(),
            sync,
            Duration::from_secs(30),
        );
        Fixture {
            registry,
            store,
            cloud,
            resolver,
        }
    }

    fn unknown(id: &str) -> Announcement {
        Announcement {
            id: id.into(),
            ip: "10.0.0.8".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scheduled_pass_resolves_from_cloud() {
        let f = fixture(FakeCloud::ok(vec![record("xyz", "Lamp", "L")]));
        f.registry.observe(&unknown("xyz"), None, 5);

        let outcome = f.resolver.run_pass(true).await.unwrap();
        assert_eq!(outcome.resolved, vec!["xyz".to_string()]);
        assert_eq!(f.cloud.calls(), 1);
        assert_eq!(f.registry.get("xyz").unwrap().key, "L");
        assert!(f.registry.pending().is_empty());
    }

    #[tokio::test]
    async fn idle_or_not_due_does_nothing() {
        let f = fixture(FakeCloud::ok(vec![]));
        assert!(f.resolver.run_pass(true).await.is_none());

        f.registry.observe(&unknown("xyz"), None, 5);
        assert!(f.resolver.run_pass(false).await.is_none());
        assert_eq!(f.cloud.calls(), 0);
    }

    #[tokio::test]
    async fn expires_after_budget() {
        let f = fixture(FakeCloud::ok(vec![]));
        f.registry.observe(&unknown("xyz"), None, 3);

        for _ in 0..3 {
            f.resolver.run_pass(true).await.unwrap();
        }
        assert!(f.registry.pending().is_empty());
        assert_eq!(f.cloud.calls(), 3);
        assert!(f.resolver.run_pass(true).await.is_none());

        let entry = f.registry.get("xyz").unwrap();
        assert!(entry.name.is_empty());
        assert!(entry.key.is_empty());
    }

    #[tokio::test]
    async fn forced_pass_retries_expired_devices() {
        let f = fixture(FakeCloud::ok(vec![record("xyz", "Lamp", "L")]));
        f.registry.observe(&unknown("xyz"), None, 1);
        // budget spent before the cloud knew the device
        let pass = f.registry.begin_pass(true).unwrap();
        f.registry.complete_pass(&pass, vec![]);
        assert!(f.registry.pending().is_empty());

        f.registry.force_resolve();
        f.registry.force_resolve();
        let outcome = f.resolver.run_pass(false).await.unwrap();
        assert_eq!(outcome.resolved, vec!["xyz".to_string()]);
        assert_eq!(f.cloud.calls(), 1);
        assert_eq!(f.registry.get("xyz").unwrap().name, "Lamp");
        assert!(
            !f.registry
                .pending()
                .contains(&PendingResolution::ForceResolveSignal)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn loop_wakes_on_force_and_stops_on_cancel() {
        let f = fixture(FakeCloud::err(serde_json::json!({"Error": "offline"})));
        let registry = f.registry.clone();
        let store = f.store.clone();
        let token = CancellationToken::new();
        let task = tokio::spawn(f.resolver.run(token.clone()));

        registry.observe(&unknown("xyz"), None, 1);
        tokio::time::sleep(TICK * 2).await;
        assert!(registry.pending().is_empty());

        store.replace(vec![record("xyz", "Lamp", "L")]);
        registry.force_resolve();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.get("xyz").unwrap().name, "Lamp");

        token.cancel();
        task.await.unwrap();
    }
}
