use async_trait::async_trait;
use camp_core::{AgentIdentity, Instance};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use time::OffsetDateTime;

use crate::registry::InstanceStore;
use crate::store::StoreError;

const MEMBERS_KEY: &str = "camp:instances";
const MAX_UPSERT_ATTEMPTS: usize = 5;

/// Instance rows keyed by identity triple, with a uuid side index.
#[derive(Clone)]
pub struct RedisInstanceStore {
    manager: ConnectionManager,
}

impl RedisInstanceStore {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    async fn read(&self, key: &str) -> Result<Option<Instance>, StoreError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(key).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn write(&self, key: &str, instance: &Instance) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(instance)?;
        let _: () = conn.set(key, json).await?;
        Ok(())
    }
}

fn instance_key(identity: &AgentIdentity) -> String {
    format!("camp:instance:{}", identity.key())
}

fn uuid_key(uuid: &str) -> String {
    format!("camp:instance-uuid:{uuid}")
}

#[async_trait]
impl InstanceStore for RedisInstanceStore {
    async fn upsert(
        &self,
        identity: &AgentIdentity,
        client_ip: &str,
        now: OffsetDateTime,
    ) -> Result<Instance, StoreError> {
        let key = instance_key(identity);
        let mut conn = self.manager.clone();
        for _ in 0..MAX_UPSERT_ATTEMPTS {
            if let Some(mut existing) = self.read(&key).await? {
                existing.client_ip = client_ip.to_string();
                existing.create_time = now;
                existing.update_time = now;
                self.write(&key, &existing).await?;
                return Ok(existing);
            }

            let fresh = Instance {
                uuid: uuid::Uuid::new_v4().to_string(),
                identity: identity.clone(),
                client_ip: client_ip.to_string(),
                create_time: now,
                update_time: now,
            };
            let json = serde_json::to_string(&fresh)?;
            // SET NX keeps the triple unique when two sessions race.
            let created: bool = conn.set_nx(&key, json).await?;
            if created {
                let _: () = conn.set(uuid_key(&fresh.uuid), &key).await?;
                let _: () = conn.sadd(MEMBERS_KEY, &key).await?;
                return Ok(fresh);
            }
        }
        Err(StoreError::Backend(format!(
            "instance {identity} kept changing during upsert"
        )))
    }

    async fn touch(&self, uuid: &str, now: OffsetDateTime) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let key: Option<String> = conn.get(uuid_key(uuid)).await?;
        let key = key.ok_or_else(|| StoreError::NotFound(uuid.to_string()))?;
        let mut instance = self
            .read(&key)
            .await?
            .ok_or_else(|| StoreError::NotFound(uuid.to_string()))?;
        instance.update_time = now;
        self.write(&key, &instance).await
    }

    async fn find(&self, identity: &AgentIdentity) -> Result<Option<Instance>, StoreError> {
        self.read(&instance_key(identity)).await
    }

    async fn list(
        &self,
        org_id: Option<&str>,
        group_id: Option<&str>,
    ) -> Result<Vec<Instance>, StoreError> {
        let mut conn = self.manager.clone();
        let keys: Vec<String> = conn.smembers(MEMBERS_KEY).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;
        let mut rows = Vec::with_capacity(raw.len());
        for json in raw.into_iter().flatten() {
            let row: Instance = serde_json::from_str(&json)?;
            if org_id.map_or(true, |org| row.identity.org_id == org)
                && group_id.map_or(true, |group| row.identity.group_id == group)
            {
                rows.push(row);
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    #[ignore = "requires REDIS_URL"]
    async fn upsert_and_touch_against_redis() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let client = redis::Client::open(url).unwrap();
        let manager = ConnectionManager::new(client).await.unwrap();
        let store = RedisInstanceStore::new(manager);
        let identity =
            AgentIdentity::new("org", "grp", uuid::Uuid::new_v4().to_string()).unwrap();
        let now = OffsetDateTime::now_utc();

        let first = store.upsert(&identity, "10.0.0.1", now).await.unwrap();
        let second = store.upsert(&identity, "10.0.0.2", now).await.unwrap();
        assert_eq!(first.uuid, second.uuid);

        store.touch(&first.uuid, now).await.unwrap();
        let found = store.find(&identity).await.unwrap().unwrap();
        assert_eq!(found.client_ip, "10.0.0.2");
    }
}
