//! Storage ports: two append-only, time-ordered collections — `RawSamples`
//! and `ProcessedSamples` — keyed by `(deviceId, timestamp)`, with a
//! secondary per-device index giving `find_latest_processed` an O(log N)
//! bound. `SampleStore` is the capability port the processor depends on; the
//! in-memory implementation below is the reference one this crate ships,
//! matching the spec's treatment of durable storage as an external
//! collaborator the core anticipates but does not require.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{DeviceId, ProcessedSample, RawSample, TripId};

/// A timestamp/id pair used both as the per-device ordering key and as an
/// opaque pagination cursor.
pub type OrderKey = (DateTime<Utc>, Uuid);

/// Filter + cursor for a paginated read.
#[derive(Debug, Clone, Default)]
pub struct PageQuery {
    pub device_id: Option<DeviceId>,
    pub trip_id: Option<TripId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Resume strictly after this key (exclusive), oldest-first order.
    pub after: Option<OrderKey>,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<OrderKey>,
}

/// The storage capability port.
#[async_trait]
pub trait SampleStore: Send + Sync {
    async fn insert_raw(&self, sample: RawSample) -> Result<Uuid, StoreError>;
    async fn get_raw(&self, id: Uuid) -> Result<Option<RawSample>, StoreError>;
    async fn insert_processed(&self, sample: ProcessedSample) -> Result<Uuid, StoreError>;
    async fn find_latest_processed(&self, device_id: &str) -> Result<Option<ProcessedSample>, StoreError>;
    async fn find_recent_processed(
        &self,
        device_id: &str,
        n: usize,
    ) -> Result<Vec<ProcessedSample>, StoreError>;
    /// The only mutation a processed sample ever undergoes: stop-coalescing
    /// advances `last_seen` and increments `stop_count` on the predecessor.
    async fn update_processed_metadata(
        &self,
        id: Uuid,
        last_seen: DateTime<Utc>,
        stop_count_inc: u64,
    ) -> Result<(), StoreError>;
    async fn page_raw(&self, query: PageQuery) -> Result<Page<RawSample>, StoreError>;
    async fn page_processed(&self, query: PageQuery) -> Result<Page<ProcessedSample>, StoreError>;
}

/// Per-device ordered index plus the backing record maps.
#[derive(Default)]
pub struct InMemoryStore {
    raw: DashMap<Uuid, RawSample>,
    raw_index: DashMap<DeviceId, RwLock<BTreeMap<OrderKey, ()>>>,
    processed: DashMap<Uuid, RwLock<ProcessedSample>>,
    processed_index: DashMap<DeviceId, RwLock<BTreeMap<OrderKey, ()>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_entry<'a>(
        index: &'a DashMap<DeviceId, RwLock<BTreeMap<OrderKey, ()>>>,
        device_id: &str,
    ) -> dashmap::mapref::one::Ref<'a, DeviceId, RwLock<BTreeMap<OrderKey, ()>>> {
        index
            .entry(device_id.to_string())
            .or_insert_with(|| RwLock::new(BTreeMap::new()));
        index.get(device_id).expect("just inserted")
    }

    fn page_from_index(
        index: &DashMap<DeviceId, RwLock<BTreeMap<OrderKey, ()>>>,
        query: &PageQuery,
    ) -> (Vec<OrderKey>, Option<OrderKey>) {
        let keys: Vec<OrderKey> = match &query.device_id {
            Some(device_id) => {
                let Some(bucket) = index.get(device_id) else {
                    return (Vec::new(), None);
                };
                bucket.read().unwrap().keys().copied().collect()
            }
            None => {
                let mut all = Vec::new();
                for bucket in index.iter() {
                    all.extend(bucket.read().unwrap().keys().copied());
                }
                all.sort();
                all
            }
        };

        let filtered: Vec<OrderKey> = keys
            .into_iter()
            .filter(|(ts, _)| query.from.map(|from| *ts >= from).unwrap_or(true))
            .filter(|(ts, _)| query.to.map(|to| *ts <= to).unwrap_or(true))
            .filter(|key| query.after.map(|after| *key > after).unwrap_or(true))
            .collect();

        let limit = if query.limit == 0 { filtered.len() } else { query.limit };
        let page: Vec<OrderKey> = filtered.iter().take(limit).copied().collect();
        let next_cursor = if filtered.len() > page.len() {
            page.last().copied()
        } else {
            None
        };
        (page, next_cursor)
    }
}

#[async_trait]
impl SampleStore for InMemoryStore {
    async fn insert_raw(&self, sample: RawSample) -> Result<Uuid, StoreError> {
        let id = sample.id;
        let key = (sample.timestamp, id);
        let device_id = sample.device_id.clone();
        self.raw.insert(id, sample);
        Self::index_entry(&self.raw_index, &device_id)
            .write()
            .unwrap()
            .insert(key, ());
        Ok(id)
    }

    async fn get_raw(&self, id: Uuid) -> Result<Option<RawSample>, StoreError> {
        Ok(self.raw.get(&id).map(|r| r.clone()))
    }

    async fn insert_processed(&self, sample: ProcessedSample) -> Result<Uuid, StoreError> {
        let id = sample.id;
        let key = (sample.timestamp, id);
        let device_id = sample.device_id.clone();
        self.processed.insert(id, RwLock::new(sample));
        Self::index_entry(&self.processed_index, &device_id)
            .write()
            .unwrap()
            .insert(key, ());
        Ok(id)
    }

    async fn find_latest_processed(&self, device_id: &str) -> Result<Option<ProcessedSample>, StoreError> {
        let Some(bucket) = self.processed_index.get(device_id) else {
            return Ok(None);
        };
        let last_key = bucket.read().unwrap().keys().next_back().copied();
        let Some((_, id)) = last_key else {
            return Ok(None);
        };
        Ok(self.processed.get(&id).map(|r| r.read().unwrap().clone()))
    }

    async fn find_recent_processed(
        &self,
        device_id: &str,
        n: usize,
    ) -> Result<Vec<ProcessedSample>, StoreError> {
        let Some(bucket) = self.processed_index.get(device_id) else {
            return Ok(Vec::new());
        };
        let ids: Vec<Uuid> = bucket
            .read()
            .unwrap()
            .keys()
            .rev()
            .take(n)
            .map(|(_, id)| *id)
            .collect();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.processed.get(&id).map(|r| r.read().unwrap().clone()))
            .collect())
    }

    async fn update_processed_metadata(
        &self,
        id: Uuid,
        last_seen: DateTime<Utc>,
        stop_count_inc: u64,
    ) -> Result<(), StoreError> {
        let entry = self
            .processed
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut sample = entry.write().unwrap();
        sample.metadata.last_seen = Some(last_seen);
        sample.metadata.stop_count = Some(sample.metadata.stop_count.unwrap_or(0) + stop_count_inc);
        Ok(())
    }

    async fn page_raw(&self, query: PageQuery) -> Result<Page<RawSample>, StoreError> {
        let (keys, next_cursor) = Self::page_from_index(&self.raw_index, &query);
        let items = keys
            .into_iter()
            .filter_map(|(_, id)| self.raw.get(&id).map(|r| r.clone()))
            .filter(|r| query.trip_id.as_ref().map(|t| r.trip_id.as_ref() == Some(t)).unwrap_or(true))
            .collect();
        Ok(Page { items, next_cursor })
    }

    async fn page_processed(&self, query: PageQuery) -> Result<Page<ProcessedSample>, StoreError> {
        let (keys, next_cursor) = Self::page_from_index(&self.processed_index, &query);
        let items = keys
            .into_iter()
            .filter_map(|(_, id)| self.processed.get(&id).map(|r| r.read().unwrap().clone()))
            .filter(|p| query.trip_id.as_ref().map(|t| p.trip_id.as_ref() == Some(t)).unwrap_or(true))
            .collect();
        Ok(Page { items, next_cursor })
    }
}
