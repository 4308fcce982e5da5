//! StateStore — the local replica of the global state store.
//!
//! Typed get/put/update/query over every [`Record`] type. Values are JSON
//! [`Stored`] envelopes carrying the write timestamp, expiry and origin
//! region; expired records are invisible to reads until
//! [`purge_expired`](StateStore::purge_expired) removes them. Secondary
//! index rows are maintained in the same write transaction as the primary
//! row, so an index never points at a stale version of a record.
//!
//! Writes inside one replica are serialized by redb's single writer, which
//! is what makes [`update`](StateStore::update) a compare-and-swap.
//! Cross-region conflicts are resolved by [`merge_replicated`](StateStore::merge_replicated)
//! with last-writer-wins.

use std::path::Path;
use std::sync::Arc;

use mrgc_core::{SharedClock, SystemClock};
use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::record::{Record, RecordMeta, Stored, TtlPolicy};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// A scan over one partition of a secondary index.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub index: &'static str,
    pub partition: String,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub descending: bool,
    pub limit: Option<usize>,
}

impl Query {
    pub fn on(index: &'static str, partition: impl Into<String>) -> Self {
        Self {
            index,
            partition: partition.into(),
            since: None,
            until: None,
            descending: false,
            limit: None,
        }
    }

    /// Only entries whose sort component is `>= since`.
    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Only entries whose sort component is `<= until`.
    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    clock: SharedClock,
    origin: String,
    ttl: Arc<TtlPolicy>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            clock: SystemClock::shared(),
            origin: "local".to_string(),
            ttl: Arc::new(TtlPolicy::default()),
        }
    }

    /// Use `clock` for write timestamps and expiry checks.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Stamp local writes with this region.
    pub fn with_origin(mut self, region: impl Into<String>) -> Self {
        self.origin = region.into();
        self
    }

    pub fn with_ttl_policy(mut self, policy: TtlPolicy) -> Self {
        self.ttl = Arc::new(policy);
        self
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for def in [NODES, ROUTING_FACTS, SCALING, CLEANUP, METRICS, REGIONS, SCALE_INTENTS] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        for def in [
            NODES_IDX,
            ROUTING_FACTS_IDX,
            SCALING_IDX,
            CLEANUP_IDX,
            METRICS_IDX,
            REGIONS_IDX,
            SCALE_INTENTS_IDX,
        ] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn envelope<R: Record>(&self, record: R) -> Stored<R> {
        let now = self.clock.now_ms();
        let expires_at_ms = record
            .ttl(&self.ttl)
            .map(|ttl| now.saturating_add(ttl.as_millis() as u64));
        Stored {
            record,
            meta: RecordMeta {
                written_at_ms: now,
                expires_at_ms,
                origin_region: self.origin.clone(),
            },
        }
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get a live record by primary key.
    pub fn get<R: Record>(&self, key: &str) -> StateResult<Option<R>> {
        Ok(self.get_stored::<R>(key)?.map(|s| s.record))
    }

    /// Get a live record together with its store metadata.
    pub fn get_stored<R: Record>(&self, key: &str) -> StateResult<Option<Stored<R>>> {
        let now = self.clock.now_ms();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let stored: Stored<R> = decode(guard.value())?;
                Ok((!stored.meta.is_expired(now)).then_some(stored))
            }
            None => Ok(None),
        }
    }

    /// List every live record of a type, in primary-key order.
    pub fn list_all<R: Record>(&self) -> StateResult<Vec<R>> {
        let now = self.clock.now_ms();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let stored: Stored<R> = decode(value.value())?;
            if !stored.meta.is_expired(now) {
                results.push(stored.record);
            }
        }
        Ok(results)
    }

    /// Scan one index partition. Expired records are skipped and do not
    /// count toward the limit.
    pub fn query<R: Record>(&self, query: &Query) -> StateResult<Vec<R>> {
        let now = self.clock.now_ms();
        let (start, end) =
            partition_bounds(query.index, &query.partition, query.since, query.until);

        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let idx = txn.open_table(R::INDEX_TABLE).map_err(map_err!(Table))?;
        let table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
        let mut range = idx
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?;

        let mut results = Vec::new();
        loop {
            let next = if query.descending {
                range.next_back()
            } else {
                range.next()
            };
            let Some(entry) = next else { break };
            let (_, primary) = entry.map_err(map_err!(Read))?;
            let Some(guard) = table.get(primary.value()).map_err(map_err!(Read))? else {
                continue;
            };
            let stored: Stored<R> = decode(guard.value())?;
            if stored.meta.is_expired(now) {
                continue;
            }
            results.push(stored.record);
            if query.limit.is_some_and(|limit| results.len() >= limit) {
                break;
            }
        }
        Ok(results)
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Insert or overwrite a record.
    pub fn put<R: Record>(&self, record: R) -> StateResult<()> {
        let stored = self.envelope(record);
        let key = stored.record.key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        write_in(&txn, &stored)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = R::KIND, %key, "record stored");
        Ok(())
    }

    /// Insert a record only if no live record holds its key.
    pub fn insert_new<R: Record>(&self, record: R) -> StateResult<()> {
        let now = self.clock.now_ms();
        let stored = self.envelope(record);
        let key = stored.record.key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existing = read_in::<R>(&txn, &key)?;
        if existing.is_some_and(|e| !e.meta.is_expired(now)) {
            txn.abort().map_err(map_err!(Transaction))?;
            return Err(StateError::AlreadyExists(format!("{} {key}", R::KIND)));
        }
        write_in(&txn, &stored)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = R::KIND, %key, "record inserted");
        Ok(())
    }

    /// Read-modify-write a live record atomically.
    ///
    /// The mutator doubles as the condition: returning `Err` leaves the
    /// record untouched and hands the error back as the inner result.
    /// A missing or expired record is `StateError::NotFound`.
    pub fn update<R, E, F>(&self, key: &str, mutate: F) -> StateResult<Result<R, E>>
    where
        R: Record,
        F: FnOnce(&mut R) -> Result<(), E>,
    {
        let now = self.clock.now_ms();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let current = read_in::<R>(&txn, key)?.filter(|s| !s.meta.is_expired(now));
        let Some(current) = current else {
            txn.abort().map_err(map_err!(Transaction))?;
            return Err(StateError::NotFound(format!("{} {key}", R::KIND)));
        };

        let mut record = current.record;
        if let Err(e) = mutate(&mut record) {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(Err(e));
        }
        if record.key() != key {
            txn.abort().map_err(map_err!(Transaction))?;
            return Err(StateError::Write(format!(
                "mutator changed {} key {key} to {}",
                R::KIND,
                record.key()
            )));
        }

        let stored = self.envelope(record);
        write_in(&txn, &stored)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(Ok(stored.record))
    }

    /// Delete a record by key. Returns true if it existed.
    pub fn delete<R: Record>(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed = remove_in::<R>(&txn, key)?.is_some();
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = R::KIND, %key, existed, "record deleted");
        Ok(existed)
    }

    /// Apply a write replicated from another region.
    ///
    /// Last writer wins on `written_at_ms`, ties broken by origin region,
    /// unless one side [dominates](Record::dominates) the other.
    /// Returns whether the incoming write was applied.
    pub fn merge_replicated<R: Record>(&self, incoming: Stored<R>) -> StateResult<bool> {
        let key = incoming.record.key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        if let Some(existing) = read_in::<R>(&txn, &key)?
            && !incoming.record.dominates(&existing.record)
            && (existing.record.dominates(&incoming.record)
                || !incoming.meta.supersedes(&existing.meta))
        {
            txn.abort().map_err(map_err!(Transaction))?;
            debug!(kind = R::KIND, %key, "replicated write superseded");
            return Ok(false);
        }
        write_in(&txn, &incoming)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(kind = R::KIND, %key, origin = %incoming.meta.origin_region, "replicated write applied");
        Ok(true)
    }

    /// Physically remove expired records of one type. Returns the count.
    pub fn purge_expired<R: Record>(&self) -> StateResult<usize> {
        let now = self.clock.now_ms();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let expired: Vec<String> = {
            let table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let stored: Stored<R> = decode(value.value())?;
                if stored.meta.is_expired(now) {
                    keys.push(key.value().to_string());
                }
            }
            keys
        };
        for key in &expired {
            remove_in::<R>(&txn, key)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if !expired.is_empty() {
            debug!(kind = R::KIND, count = expired.len(), "expired records purged");
        }
        Ok(expired.len())
    }

    /// Purge every record type.
    pub fn purge_all_expired(&self) -> StateResult<usize> {
        Ok(self.purge_expired::<NodeRecord>()?
            + self.purge_expired::<RoutingFact>()?
            + self.purge_expired::<ScalingRecord>()?
            + self.purge_expired::<CleanupRecord>()?
            + self.purge_expired::<MetricSample>()?
            + self.purge_expired::<RegionSnapshot>()?
            + self.purge_expired::<ScaleIntent>()?)
    }
}

fn decode<R: Record>(bytes: &[u8]) -> StateResult<Stored<R>> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Read a record (expired or not) inside a write transaction.
fn read_in<R: Record>(txn: &WriteTransaction, key: &str) -> StateResult<Option<Stored<R>>> {
    let table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
    let bytes = table
        .get(key)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value().to_vec());
    bytes.map(|b| decode(&b)).transpose()
}

/// Write the primary row and swap its index rows.
fn write_in<R: Record>(txn: &WriteTransaction, stored: &Stored<R>) -> StateResult<()> {
    let key = stored.record.key();
    let value = serde_json::to_vec(stored).map_err(map_err!(Serialize))?;

    let mut table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
    let mut idx = txn.open_table(R::INDEX_TABLE).map_err(map_err!(Table))?;

    let previous = table
        .get(key.as_str())
        .map_err(map_err!(Read))?
        .map(|guard| guard.value().to_vec());
    if let Some(bytes) = previous {
        let old: Stored<R> = decode(&bytes)?;
        for entry in old.record.index_entries() {
            let ik = index_key(entry.index, &entry.partition, entry.sort, &key);
            idx.remove(ik.as_str()).map_err(map_err!(Write))?;
        }
    }

    table
        .insert(key.as_str(), value.as_slice())
        .map_err(map_err!(Write))?;
    for entry in stored.record.index_entries() {
        let ik = index_key(entry.index, &entry.partition, entry.sort, &key);
        idx.insert(ik.as_str(), key.as_str())
            .map_err(map_err!(Write))?;
    }
    Ok(())
}

/// Remove the primary row and its index rows.
fn remove_in<R: Record>(txn: &WriteTransaction, key: &str) -> StateResult<Option<Stored<R>>> {
    let mut table = txn.open_table(R::TABLE).map_err(map_err!(Table))?;
    let mut idx = txn.open_table(R::INDEX_TABLE).map_err(map_err!(Table))?;
    let removed = table
        .remove(key)
        .map_err(map_err!(Write))?
        .map(|guard| guard.value().to_vec());
    let Some(bytes) = removed else {
        return Ok(None);
    };
    let old: Stored<R> = decode(&bytes)?;
    for entry in old.record.index_entries() {
        let ik = index_key(entry.index, &entry.partition, entry.sort, key);
        idx.remove(ik.as_str()).map_err(map_err!(Write))?;
    }
    Ok(Some(old))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::index;
    use mrgc_core::{Clock, ManualClock};
    use std::time::Duration;

    const T0: u64 = 1_700_000_000_000;

    fn store() -> (Arc<ManualClock>, StateStore) {
        let (clock, shared) = ManualClock::shared(T0);
        let store = StateStore::open_in_memory()
            .unwrap()
            .with_clock(shared)
            .with_origin("us-east-1");
        (clock, store)
    }

    fn node(id: &str, region: &str, state: NodeState) -> NodeRecord {
        let mut n = NodeRecord::launching(id, region, "model-a", "10.0.0.1:8080");
        n.state = state;
        n.launch_time_ms = T0;
        n
    }

    fn fact(id: &str, region: &str, score: f64) -> RoutingFact {
        RoutingFact {
            node_id: id.into(),
            region: region.into(),
            pool: "model-a".into(),
            routing_score: score,
            queue_depth: 1,
            avg_latency_ms: 100.0,
            health_status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_updated_ms: T0,
        }
    }

    #[test]
    fn put_get_round_trip_with_meta() {
        let (_, store) = store();
        let n = node("n1", "us-east-1", NodeState::Available);
        store.put(n.clone()).unwrap();

        let stored = store.get_stored::<NodeRecord>("n1").unwrap().unwrap();
        assert_eq!(stored.record, n);
        assert_eq!(stored.meta.written_at_ms, T0);
        assert_eq!(stored.meta.origin_region, "us-east-1");
        assert_eq!(
            stored.meta.expires_at_ms,
            Some(T0 + Duration::from_secs(7 * 24 * 3600).as_millis() as u64)
        );
    }

    #[test]
    fn every_record_type_round_trips() {
        let (_, store) = store();
        let scaling = ScalingRecord {
            pool: "model-a".into(),
            region: "us-east-1".into(),
            timestamp_ms: T0,
            current_capacity: 2,
            desired_capacity: 3,
            min_capacity: 1,
            max_capacity: 10,
            current_rps: 4.0,
            target_rps_per_node: 1.25,
            action: ScaleAction::ScaleUp,
            reason: "rps above target".into(),
            failover_triggered: false,
        };
        let cleanup = CleanupRecord {
            node_id: "n1".into(),
            timestamp_ms: T0,
            status: CleanupStatus::Passed,
            compute_memory_wiped: true,
            system_memory_wiped: true,
            secure_compute_restarted: true,
            failure_reason: None,
            integrity: "abc".into(),
        };
        let metric = MetricSample {
            name: "rps".into(),
            timestamp_ms: T0,
            region: "us-east-1".into(),
            value: 3.5,
            unit: "count/s".into(),
            dimensions: [("pool".to_string(), "model-a".to_string())].into(),
        };
        let snapshot = RegionSnapshot {
            region: "us-east-1".into(),
            state: FailoverState::Degraded,
            healthy_nodes: 4,
            total_nodes: 10,
            healthy_ratio: 0.4,
            traffic: TrafficPreference::all_local(),
            state_since_ms: T0,
            updated_at_ms: T0,
        };
        let intent = ScaleIntent {
            target_region: "us-east-2".into(),
            source_region: "us-east-1".into(),
            timestamp_ms: T0,
            factor: 1.5,
            reason: "failover".into(),
        };

        store.put(scaling.clone()).unwrap();
        store.put(cleanup.clone()).unwrap();
        store.put(metric.clone()).unwrap();
        store.put(snapshot.clone()).unwrap();
        store.put(intent.clone()).unwrap();
        store.put(fact("n1", "us-east-1", 80.0)).unwrap();

        assert_eq!(store.get::<ScalingRecord>(&scaling.key()).unwrap(), Some(scaling));
        assert_eq!(store.get::<CleanupRecord>(&cleanup.key()).unwrap(), Some(cleanup));
        assert_eq!(store.get::<MetricSample>(&metric.key()).unwrap(), Some(metric));
        assert_eq!(store.get::<RegionSnapshot>("us-east-1").unwrap(), Some(snapshot));
        assert_eq!(store.get::<ScaleIntent>(&intent.key()).unwrap(), Some(intent));
        assert_eq!(store.list_all::<RoutingFact>().unwrap().len(), 1);
    }

    #[test]
    fn insert_new_rejects_live_duplicate() {
        let (_, store) = store();
        store.insert_new(node("n1", "us-east-1", NodeState::Launching)).unwrap();
        let err = store
            .insert_new(node("n1", "us-east-1", NodeState::Launching))
            .unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn insert_new_allows_reuse_of_expired_key() {
        let (clock, store) = store();
        store.insert_new(node("n1", "r", NodeState::Terminated)).unwrap();
        clock.advance(Duration::from_secs(3601));
        store.insert_new(node("n1", "r", NodeState::Launching)).unwrap();
        assert_eq!(
            store.get::<NodeRecord>("n1").unwrap().unwrap().state,
            NodeState::Launching
        );
    }

    #[test]
    fn update_is_conditional() {
        let (_, store) = store();
        store.put(node("n1", "r", NodeState::Available)).unwrap();

        let applied = store
            .update::<NodeRecord, String, _>("n1", |n| {
                n.queue_depth = 4;
                Ok(())
            })
            .unwrap()
            .unwrap();
        assert_eq!(applied.queue_depth, 4);

        let rejected = store
            .update::<NodeRecord, String, _>("n1", |n| {
                n.queue_depth = 9;
                Err("condition failed".to_string())
            })
            .unwrap();
        assert_eq!(rejected.unwrap_err(), "condition failed");
        assert_eq!(store.get::<NodeRecord>("n1").unwrap().unwrap().queue_depth, 4);
    }

    #[test]
    fn update_missing_is_not_found() {
        let (_, store) = store();
        let err = store
            .update::<NodeRecord, (), _>("ghost", |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn index_follows_updates() {
        let (_, store) = store();
        store.put(node("n1", "r", NodeState::Launching)).unwrap();
        store
            .update::<NodeRecord, (), _>("n1", |n| {
                n.state = NodeState::Available;
                Ok(())
            })
            .unwrap()
            .unwrap();

        let launching: Vec<NodeRecord> = store
            .query(&Query::on(index::STATE, "LAUNCHING"))
            .unwrap();
        let available: Vec<NodeRecord> = store
            .query(&Query::on(index::STATE, "AVAILABLE"))
            .unwrap();
        assert!(launching.is_empty());
        assert_eq!(available.len(), 1);
    }

    #[test]
    fn query_order_and_limit() {
        let (_, store) = store();
        for (id, score) in [("a", 10.0), ("b", 90.0), ("c", 50.0)] {
            store.put(fact(id, "r", score)).unwrap();
        }
        store.put(fact("x", "other", 99.0)).unwrap();

        let top: Vec<RoutingFact> = store
            .query(&Query::on(index::REGION_SCORE, "r").descending().limit(2))
            .unwrap();
        let ids: Vec<&str> = top.iter().map(|f| f.node_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        let asc: Vec<RoutingFact> = store
            .query(&Query::on(index::REGION_SCORE, "r"))
            .unwrap();
        assert_eq!(asc.first().map(|f| f.node_id.as_str()), Some("a"));
    }

    #[test]
    fn query_time_range() {
        let (_, store) = store();
        for i in 0..5u64 {
            store
                .put(ScaleIntent {
                    target_region: "r".into(),
                    source_region: "s".into(),
                    timestamp_ms: T0 + i * 1000,
                    factor: 1.5,
                    reason: String::new(),
                })
                .unwrap();
        }
        let hits: Vec<ScaleIntent> = store
            .query(
                &Query::on(index::TARGET_TIME, "r")
                    .since(T0 + 1000)
                    .until(T0 + 3000),
            )
            .unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn expired_records_are_invisible_then_purged() {
        let (clock, store) = store();
        store.put(fact("n1", "r", 80.0)).unwrap();
        clock.advance(Duration::from_secs(3600));

        assert!(store.get::<RoutingFact>("n1").unwrap().is_none());
        let live: Vec<RoutingFact> = store
            .query(&Query::on(index::REGION_SCORE, "r"))
            .unwrap();
        assert!(live.is_empty());

        assert_eq!(store.purge_all_expired().unwrap(), 1);
        assert_eq!(store.purge_all_expired().unwrap(), 0);
    }

    #[test]
    fn quarantined_nodes_never_expire() {
        let (clock, store) = store();
        store.put(node("n1", "r", NodeState::Quarantined)).unwrap();
        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert_eq!(store.purge_expired::<NodeRecord>().unwrap(), 0);
        assert!(store.get::<NodeRecord>("n1").unwrap().is_some());
    }

    #[test]
    fn merge_replicated_last_writer_wins() {
        let (clock, store) = store();
        store.put(node("n1", "r", NodeState::Available)).unwrap();

        let mut older = store.get_stored::<NodeRecord>("n1").unwrap().unwrap();
        older.record.queue_depth = 7;
        older.meta.written_at_ms -= 1;
        older.meta.origin_region = "us-west-2".into();
        assert!(!store.merge_replicated(older).unwrap());

        clock.advance(Duration::from_millis(5));
        let mut newer = store.get_stored::<NodeRecord>("n1").unwrap().unwrap();
        newer.record.state = NodeState::Draining;
        newer.meta.written_at_ms = clock.now_ms();
        newer.meta.origin_region = "us-west-2".into();
        assert!(store.merge_replicated(newer).unwrap());

        let current = store.get::<NodeRecord>("n1").unwrap().unwrap();
        assert_eq!(current.state, NodeState::Draining);
        assert_eq!(current.queue_depth, 0);
        let draining: Vec<NodeRecord> = store
            .query(&Query::on(index::STATE, "DRAINING"))
            .unwrap();
        assert_eq!(draining.len(), 1);
    }

    #[test]
    fn merge_never_lifts_quarantine() {
        let (clock, store) = store();
        store.put(node("n1", "r", NodeState::Available)).unwrap();
        let stale = store.get_stored::<NodeRecord>("n1").unwrap().unwrap();
        store.put(node("n1", "r", NodeState::Quarantined)).unwrap();

        clock.advance(Duration::from_millis(5));
        let mut replayed = stale;
        replayed.meta.written_at_ms = clock.now_ms();
        replayed.meta.origin_region = "us-west-2".into();
        assert!(!store.merge_replicated(replayed).unwrap());
        assert_eq!(
            store.get::<NodeRecord>("n1").unwrap().unwrap().state,
            NodeState::Quarantined
        );
    }

    #[test]
    fn replicated_quarantine_applies_over_newer_local_write() {
        let (clock, store) = store();
        store.put(node("n1", "r", NodeState::Available)).unwrap();
        let mut remote = store.get_stored::<NodeRecord>("n1").unwrap().unwrap();
        remote.record.state = NodeState::Quarantined;
        remote.meta.expires_at_ms = None;
        remote.meta.origin_region = "us-west-2".into();

        clock.advance(Duration::from_millis(5));
        store.put(node("n1", "r", NodeState::Draining)).unwrap();
        assert!(store.merge_replicated(remote).unwrap());

        let current = store.get::<NodeRecord>("n1").unwrap().unwrap();
        assert_eq!(current.state, NodeState::Quarantined);
        let quarantined: Vec<NodeRecord> = store
            .query(&Query::on(index::STATE, "QUARANTINED"))
            .unwrap();
        assert_eq!(quarantined.len(), 1);
    }

    #[test]
    fn delete_removes_index_rows() {
        let (_, store) = store();
        store.put(node("n1", "r", NodeState::Available)).unwrap();
        assert!(store.delete::<NodeRecord>("n1").unwrap());
        assert!(!store.delete::<NodeRecord>("n1").unwrap());
        let by_region: Vec<NodeRecord> = store.query(&Query::on(index::REGION, "r")).unwrap();
        assert!(by_region.is_empty());
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.put(node("n1", "r", NodeState::Available)).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert!(store.get::<NodeRecord>("n1").unwrap().is_some());
    }
}
