//! In-memory [`EventLog`] with fault injection, used by the demo and the tests.

use super::{EventLog, PersistedEvent, PersistenceId, Snapshot, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Default)]
struct Streams {
    events: HashMap<PersistenceId, BTreeMap<u64, PersistedEvent>>,
    snapshots: HashMap<PersistenceId, Snapshot>,
    in_flight: HashMap<PersistenceId, usize>,
}

#[derive(Default)]
struct Faults {
    append_delay: Option<Duration>,
    read_delay: Option<Duration>,
}

/// Reference event log keeping every stream in memory.
///
/// Besides the optimistic sequence check, it counts appends that start while
/// another append for the same stream is still in flight. A correct runtime
/// never produces one.
#[derive(Default)]
pub struct InMemoryEventLog {
    streams: Mutex<Streams>,
    faults: Mutex<Faults>,
    failing_appends: AtomicUsize,
    failing_reads: AtomicUsize,
    append_count: AtomicU64,
    overlapping_appends: AtomicU64,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_append_delay(self, delay: Duration) -> Self {
        self.set_append_delay(Some(delay));
        self
    }

    pub fn with_read_delay(self, delay: Duration) -> Self {
        self.set_read_delay(Some(delay));
        self
    }

    pub fn set_append_delay(&self, delay: Option<Duration>) {
        self.faults.lock().append_delay = delay;
    }

    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.faults.lock().read_delay = delay;
    }

    /// The next `n` appends fail with [`StoreError::Unavailable`].
    pub fn fail_next_appends(&self, n: usize) {
        self.failing_appends.store(n, Ordering::SeqCst);
    }

    /// The next `n` event reads fail with [`StoreError::Unavailable`].
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Removes a stored event, leaving a gap in the stream.
    pub fn drop_event(&self, persistence_id: &PersistenceId, sequence_nr: u64) -> bool {
        self.streams
            .lock()
            .events
            .get_mut(persistence_id)
            .and_then(|stream| stream.remove(&sequence_nr))
            .is_some()
    }

    pub fn events(&self, persistence_id: &PersistenceId) -> Vec<PersistedEvent> {
        self.streams
            .lock()
            .events
            .get(persistence_id)
            .map(|stream| stream.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self, persistence_id: &PersistenceId) -> Option<Snapshot> {
        self.streams.lock().snapshots.get(persistence_id).cloned()
    }

    /// Number of successful appends.
    pub fn append_count(&self) -> u64 {
        self.append_count.load(Ordering::SeqCst)
    }

    pub fn overlapping_appends(&self) -> u64 {
        self.overlapping_appends.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn append_delay(&self) -> Option<Duration> {
        self.faults.lock().append_delay
    }

    fn read_delay(&self) -> Option<Duration> {
        self.faults.lock().read_delay
    }

    fn enter_append(&self, persistence_id: &PersistenceId) -> InFlight<'_> {
        let mut streams = self.streams.lock();
        let count = streams.in_flight.entry(persistence_id.clone()).or_insert(0);
        if *count > 0 {
            warn!(%persistence_id, "Overlapping append detected");
            self.overlapping_appends.fetch_add(1, Ordering::SeqCst);
        }
        *count += 1;
        InFlight {
            log: self,
            persistence_id: persistence_id.clone(),
        }
    }
}

struct InFlight<'a> {
    log: &'a InMemoryEventLog,
    persistence_id: PersistenceId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut streams = self.log.streams.lock();
        if let Some(count) = streams.in_flight.get_mut(&self.persistence_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                streams.in_flight.remove(&self.persistence_id);
            }
        }
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(
        &self,
        persistence_id: &PersistenceId,
        from_sequence_nr: u64,
        events: Vec<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let _in_flight = self.enter_append(persistence_id);

        if let Some(delay) = self.append_delay() {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.failing_appends) {
            return Err(StoreError::Unavailable("injected append failure".into()));
        }
        if events.is_empty() {
            return Ok(());
        }

        let mut streams = self.streams.lock();
        let stream = streams.events.entry(persistence_id.clone()).or_default();
        let expected = stream.keys().next_back().copied().unwrap_or(0) + 1;
        if from_sequence_nr != expected {
            return Err(StoreError::SequenceConflict {
                persistence_id: persistence_id.clone(),
                expected,
                actual: from_sequence_nr,
            });
        }

        let timestamp = Utc::now();
        let count = events.len();
        for (offset, payload) in events.into_iter().enumerate() {
            let sequence_nr = from_sequence_nr + offset as u64;
            stream.insert(
                sequence_nr,
                PersistedEvent {
                    persistence_id: persistence_id.clone(),
                    sequence_nr,
                    payload,
                    timestamp,
                },
            );
        }
        self.append_count.fetch_add(1, Ordering::SeqCst);
        debug!(%persistence_id, from_sequence_nr, count, "Appended");
        Ok(())
    }

    async fn read_events(
        &self,
        persistence_id: &PersistenceId,
        from_sequence_nr: u64,
    ) -> Result<Vec<PersistedEvent>, StoreError> {
        if let Some(delay) = self.read_delay() {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.failing_reads) {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }
        Ok(self
            .streams
            .lock()
            .events
            .get(persistence_id)
            .map(|stream| {
                stream
                    .range(from_sequence_nr..)
                    .map(|(_, event)| event.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn highest_sequence_nr(&self, persistence_id: &PersistenceId) -> Result<u64, StoreError> {
        Ok(self
            .streams
            .lock()
            .events
            .get(persistence_id)
            .and_then(|stream| stream.keys().next_back().copied())
            .unwrap_or(0))
    }

    async fn read_snapshot(
        &self,
        persistence_id: &PersistenceId,
    ) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.snapshot(persistence_id))
    }

    async fn write_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let mut streams = self.streams.lock();
        let keep_existing = streams
            .snapshots
            .get(&snapshot.persistence_id)
            .is_some_and(|existing| existing.sequence_nr > snapshot.sequence_nr);
        if !keep_existing {
            streams
                .snapshots
                .insert(snapshot.persistence_id.clone(), snapshot);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::EntityId;
    use serde_json::json;
    use std::sync::Arc;

    fn pid(id: &str) -> PersistenceId {
        PersistenceId::of("Counter", EntityId::new(id))
    }

    #[tokio::test]
    async fn append_assigns_consecutive_sequence_numbers() {
        let log = InMemoryEventLog::new();
        log.append(&pid("a"), 1, vec![json!(1), json!(2)]).await.unwrap();
        log.append(&pid("a"), 3, vec![json!(3)]).await.unwrap();

        let seqs: Vec<u64> = log.events(&pid("a")).iter().map(|e| e.sequence_nr).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(log.highest_sequence_nr(&pid("a")).await.unwrap(), 3);
        assert_eq!(log.append_count(), 2);
    }

    #[tokio::test]
    async fn append_rejects_wrong_sequence() {
        let log = InMemoryEventLog::new();
        log.append(&pid("a"), 1, vec![json!("x")]).await.unwrap();

        let err = log.append(&pid("a"), 1, vec![json!("y")]).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::SequenceConflict { expected: 2, actual: 1, .. }
        ));
        assert_eq!(log.events(&pid("a")).len(), 1);
    }

    #[tokio::test]
    async fn read_from_sequence() {
        let log = InMemoryEventLog::new();
        log.append(&pid("a"), 1, vec![json!(1), json!(2), json!(3)])
            .await
            .unwrap();
        let tail = log.read_events(&pid("a"), 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].payload, json!(2));
        assert!(log.read_events(&pid("b"), 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let log = InMemoryEventLog::new();
        log.fail_next_appends(1);
        assert!(log.append(&pid("a"), 1, vec![json!(1)]).await.is_err());
        assert!(log.append(&pid("a"), 1, vec![json!(1)]).await.is_ok());

        log.fail_next_reads(2);
        assert!(log.read_events(&pid("a"), 1).await.is_err());
        assert!(log.read_events(&pid("a"), 1).await.is_err());
        assert!(log.read_events(&pid("a"), 1).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_appends_are_counted_as_overlapping() {
        let log = Arc::new(InMemoryEventLog::new().with_append_delay(Duration::from_millis(50)));
        let first = {
            let log = log.clone();
            tokio::spawn(async move { log.append(&pid("a"), 1, vec![json!(1)]).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = log.append(&pid("a"), 2, vec![json!(2)]).await;

        assert!(first.await.unwrap().is_ok());
        assert!(second.is_ok());
        assert_eq!(log.overlapping_appends(), 1);

        log.append(&pid("b"), 1, vec![json!(1)]).await.unwrap();
        assert_eq!(log.overlapping_appends(), 1);
    }

    #[tokio::test]
    async fn newer_snapshot_wins() {
        let log = InMemoryEventLog::new();
        let snapshot = |seq| Snapshot {
            persistence_id: pid("a"),
            sequence_nr: seq,
            state: json!(seq),
            timestamp: Utc::now(),
        };
        log.write_snapshot(snapshot(5)).await.unwrap();
        log.write_snapshot(snapshot(3)).await.unwrap();
        assert_eq!(log.read_snapshot(&pid("a")).await.unwrap().unwrap().sequence_nr, 5);
    }
}
