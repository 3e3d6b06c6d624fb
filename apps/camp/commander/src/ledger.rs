//! Durable record of every issued instruction and its outcome.

use std::collections::HashMap;

use async_trait::async_trait;
use camp_core::{AgentIdentity, InstructionRecord, InstructionState};
use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::store::StoreError;

/// Page size for instruction listings.
pub const LIST_LIMIT: usize = 50;

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn record(&self, record: InstructionRecord) -> Result<(), StoreError>;

    /// Writes the outcome of `uuid`. Returns the updated record, or `None`
    /// when no such instruction exists.
    async fn complete(
        &self,
        uuid: &str,
        state: InstructionState,
        reply: String,
        now: OffsetDateTime,
    ) -> Result<Option<InstructionRecord>, StoreError>;

    async fn get(&self, uuid: &str) -> Result<Option<InstructionRecord>, StoreError>;

    /// Most recent first, at most `limit` rows.
    async fn list(
        &self,
        target: &AgentIdentity,
        limit: usize,
    ) -> Result<Vec<InstructionRecord>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryLedger {
    inner: Mutex<LedgerTable>,
}

#[derive(Default)]
struct LedgerTable {
    next_seq: u64,
    rows: HashMap<String, (u64, InstructionRecord)>,
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn record(&self, record: InstructionRecord) -> Result<(), StoreError> {
        let mut table = self.inner.lock();
        let seq = table.next_seq;
        table.next_seq += 1;
        table.rows.insert(record.uuid.clone(), (seq, record));
        Ok(())
    }

    async fn complete(
        &self,
        uuid: &str,
        state: InstructionState,
        reply: String,
        now: OffsetDateTime,
    ) -> Result<Option<InstructionRecord>, StoreError> {
        let mut table = self.inner.lock();
        Ok(table.rows.get_mut(uuid).map(|(_, row)| {
            row.result = state;
            row.reply = reply;
            row.update_time = now;
            row.clone()
        }))
    }

    async fn get(&self, uuid: &str) -> Result<Option<InstructionRecord>, StoreError> {
        Ok(self.inner.lock().rows.get(uuid).map(|(_, row)| row.clone()))
    }

    async fn list(
        &self,
        target: &AgentIdentity,
        limit: usize,
    ) -> Result<Vec<InstructionRecord>, StoreError> {
        let table = self.inner.lock();
        let mut rows: Vec<&(u64, InstructionRecord)> = table
            .rows
            .values()
            .filter(|(_, row)| &row.target == target)
            .collect();
        rows.sort_by(|(seq_a, a), (seq_b, b)| {
            b.create_time
                .cmp(&a.create_time)
                .then_with(|| seq_b.cmp(seq_a))
        });
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use camp_core::InstructionType;

    use super::*;

    fn target() -> AgentIdentity {
        AgentIdentity::new("org", "grp", "node-1").unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn complete_transitions_and_reports_missing() {
        let ledger = InMemoryLedger::default();
        let now = OffsetDateTime::UNIX_EPOCH;
        ledger
            .record(InstructionRecord::pending(
                "u1",
                target(),
                InstructionType::Dns,
                "example.com",
                now,
            ))
            .await
            .unwrap();

        let later = now + Duration::from_secs(3);
        let updated = ledger
            .complete("u1", InstructionState::Completed, "1.2.3.4".into(), later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.result, InstructionState::Completed);
        assert_eq!(updated.reply, "1.2.3.4");
        assert_eq!(updated.update_time, later);
        assert_eq!(updated.create_time, now);

        assert!(ledger
            .complete("nope", InstructionState::Failed, String::new(), later)
            .await
            .unwrap()
            .is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn list_is_scoped_newest_first_and_bounded() {
        let ledger = InMemoryLedger::default();
        let start = OffsetDateTime::UNIX_EPOCH;
        for i in 0..(LIST_LIMIT + 5) {
            ledger
                .record(InstructionRecord::pending(
                    format!("u{i}"),
                    target(),
                    InstructionType::Command,
                    "true",
                    start + Duration::from_secs(i as u64),
                ))
                .await
                .unwrap();
        }
        let other = AgentIdentity::new("org", "grp", "node-2").unwrap();
        ledger
            .record(InstructionRecord::pending(
                "elsewhere",
                other,
                InstructionType::Command,
                "true",
                start,
            ))
            .await
            .unwrap();

        let rows = ledger.list(&target(), LIST_LIMIT).await.unwrap();
        assert_eq!(rows.len(), LIST_LIMIT);
        assert_eq!(rows[0].uuid, format!("u{}", LIST_LIMIT + 4));
        assert!(rows.iter().all(|row| row.target == target()));
    }
}
