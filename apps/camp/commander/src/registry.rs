//! Instance registry and liveness.
//!
//! A soldier is alive while its session keeps refreshing `update_time`. There
//! is no tombstone: once the heartbeat stops the row simply ages out of the
//! alive window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camp_core::{AgentIdentity, Instance};
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::store::StoreError;

#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert or refresh the row for `identity`. An existing row keeps its
    /// uuid; its client address and timestamps are replaced.
    async fn upsert(
        &self,
        identity: &AgentIdentity,
        client_ip: &str,
        now: OffsetDateTime,
    ) -> Result<Instance, StoreError>;

    async fn touch(&self, uuid: &str, now: OffsetDateTime) -> Result<(), StoreError>;

    async fn find(&self, identity: &AgentIdentity) -> Result<Option<Instance>, StoreError>;

    /// All rows, optionally narrowed by org and group.
    async fn list(
        &self,
        org_id: Option<&str>,
        group_id: Option<&str>,
    ) -> Result<Vec<Instance>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryInstanceStore {
    inner: Mutex<InstanceTable>,
}

#[derive(Default)]
struct InstanceTable {
    rows: HashMap<AgentIdentity, Instance>,
    by_uuid: HashMap<String, AgentIdentity>,
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn upsert(
        &self,
        identity: &AgentIdentity,
        client_ip: &str,
        now: OffsetDateTime,
    ) -> Result<Instance, StoreError> {
        let mut table = self.inner.lock();
        let table = &mut *table;
        let row = table
            .rows
            .entry(identity.clone())
            .and_modify(|row| {
                row.client_ip = client_ip.to_string();
                row.create_time = now;
                row.update_time = now;
            })
            .or_insert_with(|| Instance {
                uuid: uuid::Uuid::new_v4().to_string(),
                identity: identity.clone(),
                client_ip: client_ip.to_string(),
                create_time: now,
                update_time: now,
            });
        table
            .by_uuid
            .insert(row.uuid.clone(), identity.clone());
        Ok(row.clone())
    }

    async fn touch(&self, uuid: &str, now: OffsetDateTime) -> Result<(), StoreError> {
        let mut table = self.inner.lock();
        let identity = table
            .by_uuid
            .get(uuid)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(uuid.to_string()))?;
        match table.rows.get_mut(&identity) {
            Some(row) => {
                row.update_time = now;
                Ok(())
            }
            None => Err(StoreError::NotFound(uuid.to_string())),
        }
    }

    async fn find(&self, identity: &AgentIdentity) -> Result<Option<Instance>, StoreError> {
        Ok(self.inner.lock().rows.get(identity).cloned())
    }

    async fn list(
        &self,
        org_id: Option<&str>,
        group_id: Option<&str>,
    ) -> Result<Vec<Instance>, StoreError> {
        let table = self.inner.lock();
        Ok(table
            .rows
            .values()
            .filter(|row| org_id.map_or(true, |org| row.identity.org_id == org))
            .filter(|row| group_id.map_or(true, |group| row.identity.group_id == group))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub alive_window: Duration,
    pub heartbeat_interval: Duration,
    pub register_retry: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            alive_window: Duration::from_secs(20),
            heartbeat_interval: Duration::from_secs(10),
            register_retry: Duration::from_secs(3),
        }
    }
}

#[derive(Clone)]
pub struct InstanceRegistry {
    store: Arc<dyn InstanceStore>,
    clock: SharedClock,
    config: RegistryConfig,
}

impl InstanceRegistry {
    pub fn new(store: Arc<dyn InstanceStore>, clock: SharedClock, config: RegistryConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Upserts the instance row, retrying on storage failure until it lands.
    ///
    /// Returns `None` only when `cancel` fires first.
    pub async fn register(
        &self,
        identity: &AgentIdentity,
        client_ip: &str,
        cancel: &CancellationToken,
    ) -> Option<Instance> {
        loop {
            match self.store.upsert(identity, client_ip, self.clock.now()).await {
                Ok(instance) => {
                    info!(
                        instance = %identity,
                        uuid = %instance.uuid,
                        client_ip,
                        "instance registered"
                    );
                    return Some(instance);
                }
                Err(err) => {
                    warn!(
                        instance = %identity,
                        error = %err,
                        retry_in = ?self.config.register_retry,
                        "instance registration failed"
                    );
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.config.register_retry) => {}
            }
        }
    }

    pub async fn touch(&self, instance_uuid: &str) -> Result<(), StoreError> {
        self.store.touch(instance_uuid, self.clock.now()).await
    }

    /// `false` for unknown instances as well as stale ones.
    pub async fn is_alive(&self, identity: &AgentIdentity) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self
            .store
            .find(identity)
            .await?
            .map_or(false, |row| self.fresh(&row, now)))
    }

    /// Alive instances, newest registration first.
    pub async fn list_alive(
        &self,
        org_id: Option<&str>,
        group_id: Option<&str>,
    ) -> Result<Vec<Instance>, StoreError> {
        let now = self.clock.now();
        let mut rows: Vec<Instance> = self
            .store
            .list(org_id, group_id)
            .await?
            .into_iter()
            .filter(|row| self.fresh(row, now))
            .collect();
        rows.sort_by(|a, b| b.create_time.cmp(&a.create_time));
        Ok(rows)
    }

    /// Registers `identity` then refreshes it every heartbeat interval until
    /// `cancel` fires.
    pub async fn run_heartbeat(
        &self,
        identity: AgentIdentity,
        client_ip: String,
        cancel: CancellationToken,
    ) {
        let Some(instance) = self.register(&identity, &client_ip, &cancel).await else {
            return;
        };
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.touch(&instance.uuid).await {
                        Ok(()) => debug!(instance = %identity, "heartbeat"),
                        Err(err) => warn!(instance = %identity, error = %err, "heartbeat failed"),
                    }
                }
            }
        }
    }

    fn fresh(&self, row: &Instance, now: OffsetDateTime) -> bool {
        now - row.update_time < self.config.alive_window
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::clock::ManualClock;

    fn identity(name: &str) -> AgentIdentity {
        AgentIdentity::new("org", "grp", name).unwrap()
    }

    fn registry_with(
        store: Arc<dyn InstanceStore>,
    ) -> (InstanceRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH + Duration::from_secs(1_000)));
        let config = RegistryConfig {
            register_retry: Duration::from_millis(10),
            ..Default::default()
        };
        (InstanceRegistry::new(store, clock.clone(), config), clock)
    }

    #[test_timeout::tokio_timeout_test]
    async fn liveness_window_boundary() {
        let (registry, clock) = registry_with(Arc::new(InMemoryInstanceStore::default()));
        let id = identity("node-1");
        registry
            .register(&id, "10.0.0.1", &CancellationToken::new())
            .await
            .unwrap();

        clock.advance(Duration::from_secs(19));
        assert!(registry.is_alive(&id).await.unwrap());

        clock.advance(Duration::from_secs(2));
        assert!(!registry.is_alive(&id).await.unwrap());
    }

    #[test_timeout::tokio_timeout_test]
    async fn exactly_twenty_seconds_is_dead() {
        let (registry, clock) = registry_with(Arc::new(InMemoryInstanceStore::default()));
        let id = identity("node-1");
        registry
            .register(&id, "10.0.0.1", &CancellationToken::new())
            .await
            .unwrap();
        clock.advance(Duration::from_secs(20));
        assert!(!registry.is_alive(&id).await.unwrap());
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_instance_is_not_alive() {
        let (registry, _clock) = registry_with(Arc::new(InMemoryInstanceStore::default()));
        assert!(!registry.is_alive(&identity("ghost")).await.unwrap());
    }

    #[test_timeout::tokio_timeout_test]
    async fn touch_extends_liveness() {
        let (registry, clock) = registry_with(Arc::new(InMemoryInstanceStore::default()));
        let id = identity("node-1");
        let instance = registry
            .register(&id, "10.0.0.1", &CancellationToken::new())
            .await
            .unwrap();
        clock.advance(Duration::from_secs(15));
        registry.touch(&instance.uuid).await.unwrap();
        clock.advance(Duration::from_secs(15));
        assert!(registry.is_alive(&id).await.unwrap());
    }

    #[test_timeout::tokio_timeout_test]
    async fn reregistration_keeps_one_row_per_triple() {
        let store = Arc::new(InMemoryInstanceStore::default());
        let (registry, clock) = registry_with(store.clone());
        let id = identity("node-1");
        let cancel = CancellationToken::new();

        let first = registry.register(&id, "10.0.0.1", &cancel).await.unwrap();
        clock.advance(Duration::from_secs(5));
        let second = registry.register(&id, "10.0.0.2", &cancel).await.unwrap();

        assert_eq!(first.uuid, second.uuid);
        assert_eq!(second.client_ip, "10.0.0.2");
        assert!(second.create_time > first.create_time);
        assert_eq!(store.list(None, None).await.unwrap().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn list_alive_filters_and_orders_newest_first() {
        let (registry, clock) = registry_with(Arc::new(InMemoryInstanceStore::default()));
        let cancel = CancellationToken::new();
        let stale = identity("stale");
        registry.register(&stale, "10.0.0.9", &cancel).await.unwrap();
        clock.advance(Duration::from_secs(30));

        registry.register(&identity("a"), "10.0.0.1", &cancel).await.unwrap();
        clock.advance(Duration::from_secs(1));
        registry.register(&identity("b"), "10.0.0.2", &cancel).await.unwrap();
        let other_org = AgentIdentity::new("other", "grp", "c").unwrap();
        registry.register(&other_org, "10.0.0.3", &cancel).await.unwrap();

        let names: Vec<String> = registry
            .list_alive(Some("org"), None)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.identity.instance_name)
            .collect();
        assert_eq!(names, vec!["b".to_string(), "a".to_string()]);

        assert_eq!(registry.list_alive(None, None).await.unwrap().len(), 3);
    }

    struct FlakyStore {
        inner: InMemoryInstanceStore,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl InstanceStore for FlakyStore {
        async fn upsert(
            &self,
            identity: &AgentIdentity,
            client_ip: &str,
            now: OffsetDateTime,
        ) -> Result<Instance, StoreError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Backend("connection refused".into()));
            }
            self.inner.upsert(identity, client_ip, now).await
        }

        async fn touch(&self, uuid: &str, now: OffsetDateTime) -> Result<(), StoreError> {
            self.inner.touch(uuid, now).await
        }

        async fn find(&self, identity: &AgentIdentity) -> Result<Option<Instance>, StoreError> {
            self.inner.find(identity).await
        }

        async fn list(
            &self,
            org_id: Option<&str>,
            group_id: Option<&str>,
        ) -> Result<Vec<Instance>, StoreError> {
            self.inner.list(org_id, group_id).await
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn register_retries_through_storage_failures() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryInstanceStore::default(),
            failures_left: AtomicUsize::new(3),
        });
        let (registry, _clock) = registry_with(store.clone());
        let id = identity("node-1");
        let instance = registry
            .register(&id, "10.0.0.1", &CancellationToken::new())
            .await;
        assert!(instance.is_some());
        assert_eq!(store.failures_left.load(Ordering::SeqCst), 0);
        assert!(registry.is_alive(&id).await.unwrap());
    }

    #[test_timeout::tokio_timeout_test]
    async fn register_gives_up_only_on_cancel() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryInstanceStore::default(),
            failures_left: AtomicUsize::new(usize::MAX),
        });
        let (registry, _clock) = registry_with(store);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        assert!(registry
            .register(&identity("node-1"), "10.0.0.1", &cancel)
            .await
            .is_none());
    }
}
