//! Region router
//!
//! Regions are kept in a map keyed by start key. The empty key is always a
//! start key, so every key belongs to exactly one region and lookups cannot
//! miss. Splits and delay injection are administrative operations and take
//! the write side of the map; lookups only read it.

use crate::error::{Error, Result};
use crate::region::{Region, RegionBatch, RegionId};
use parking_lot::{Mutex, RwLock};
use pessimist_common::{Key, TxnId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Routing state of one region
#[derive(Debug, Clone)]
struct RegionMeta {
    id: RegionId,
    end: Key,
    /// Artificial latency applied to every request (test hook)
    delay: Option<Duration>,
}

/// Maps keys to regions
pub struct RegionRouter {
    /// Regions by start key
    regions: RwLock<BTreeMap<Key, RegionMeta>>,

    /// One-shot delays for a given transaction's next request to a region
    scheduled: Mutex<HashMap<(TxnId, RegionId), Duration>>,

    next_id: AtomicU64,
}

fn lookup<'a>(regions: &'a BTreeMap<Key, RegionMeta>, key: &Key) -> (&'a Key, &'a RegionMeta) {
    regions
        .range::<Key, _>(..=key)
        .next_back()
        .expect("region map always holds the empty start key")
}

fn to_region(start: &Key, meta: &RegionMeta) -> Region {
    Region {
        id: meta.id,
        start: start.clone(),
        end: meta.end.clone(),
    }
}

impl RegionRouter {
    /// Create a router with a single region covering the whole key space
    pub fn new() -> Self {
        let mut regions = BTreeMap::new();
        regions.insert(
            Key::default(),
            RegionMeta {
                id: RegionId::new(1),
                end: Key::default(),
                delay: None,
            },
        );

        Self {
            regions: RwLock::new(regions),
            scheduled: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(2),
        }
    }

    /// Region that owns `key`
    pub fn locate(&self, key: &Key) -> RegionId {
        lookup(&self.regions.read(), key).1.id
    }

    /// Full descriptor of the region that owns `key`
    pub fn region_by_key(&self, key: &Key) -> Region {
        let regions = self.regions.read();
        let (start, meta) = lookup(&regions, key);
        to_region(start, meta)
    }

    /// Descriptor of a region by id
    pub fn region(&self, id: RegionId) -> Result<Region> {
        self.regions
            .read()
            .iter()
            .find(|(_, meta)| meta.id == id)
            .map(|(start, meta)| to_region(start, meta))
            .ok_or(Error::RegionNotFound(id))
    }

    /// All regions in key order
    pub fn regions(&self) -> Vec<Region> {
        self.regions
            .read()
            .iter()
            .map(|(start, meta)| to_region(start, meta))
            .collect()
    }

    /// Split the region containing `key` so that a region starts at `key`.
    ///
    /// Returns the id of the region starting at `key`. Splitting at an
    /// existing boundary is a no-op. The new region inherits any injected
    /// delay of the region it was split from.
    pub fn split(&self, key: Key) -> Result<RegionId> {
        if key.is_empty() {
            return Err(Error::InvalidSplitKey(key));
        }

        let mut regions = self.regions.write();
        if let Some(existing) = regions.get(&key) {
            return Ok(existing.id);
        }

        let start = lookup(&regions, &key).0.clone();
        let left = regions
            .get_mut(&start)
            .expect("start key was just looked up");
        let right = RegionMeta {
            id: RegionId::new(self.next_id.fetch_add(1, Ordering::Relaxed)),
            end: std::mem::replace(&mut left.end, key.clone()),
            delay: left.delay,
        };
        let (left_id, right_id) = (left.id, right.id);

        info!(split_key = ?key, %left_id, %right_id, "region split");
        regions.insert(key, right);

        Ok(right_id)
    }

    /// Split a table's rows into `count` regions.
    ///
    /// Handles are assumed to be `1..=approx_row_count`; split points are
    /// `1 + approx_row_count * i / count` for `i in 1..count`, so the result
    /// only depends on the arguments. The table's record range is also split
    /// off from its neighbours. Returns the regions covering the table, in
    /// key order. Split points that do not fit a handle are rejected before
    /// anything is split.
    pub fn split_table(
        &self,
        table_id: i64,
        approx_row_count: u64,
        count: usize,
    ) -> Result<Vec<RegionId>> {
        if count == 0 {
            return Err(Error::InvalidSplitCount(count));
        }

        let mut handles = Vec::with_capacity(count - 1);
        for i in 1..count {
            let offset = u128::from(approx_row_count) * i as u128 / count as u128;
            let handle = i64::try_from(offset)
                .ok()
                .and_then(|offset| offset.checked_add(1))
                .ok_or(Error::SplitOutOfRange {
                    approx_row_count,
                    count,
                })?;
            handles.push(handle);
        }

        let (start, end) = Key::table_record_range(table_id);
        self.split(start.clone())?;
        for handle in handles {
            self.split(Key::record(table_id, handle))?;
        }
        if !end.is_empty() {
            self.split(end.clone())?;
        }

        Ok(self
            .regions
            .read()
            .range(start..)
            .take_while(|(region_start, _)| end.is_empty() || **region_start < end)
            .map(|(_, meta)| meta.id)
            .collect())
    }

    /// Delay every subsequent request to `region` by at least `delay`.
    ///
    /// Test hook only: delays change latency, never results.
    pub fn inject_delay(&self, region: RegionId, delay: Duration) -> Result<()> {
        let mut regions = self.regions.write();
        let meta = regions
            .values_mut()
            .find(|meta| meta.id == region)
            .ok_or(Error::RegionNotFound(region))?;
        meta.delay = Some(delay);
        debug!(%region, ?delay, "region delay injected");
        Ok(())
    }

    /// Remove an injected delay
    pub fn clear_delay(&self, region: RegionId) -> Result<()> {
        let mut regions = self.regions.write();
        let meta = regions
            .values_mut()
            .find(|meta| meta.id == region)
            .ok_or(Error::RegionNotFound(region))?;
        meta.delay = None;
        Ok(())
    }

    /// Delay only the next request that transaction `start_ts` sends to
    /// `region`.
    pub fn schedule_delay(&self, start_ts: TxnId, region: RegionId, delay: Duration) {
        self.scheduled.lock().insert((start_ts, region), delay);
    }

    /// Sleep for whatever delay applies to this request.
    pub async fn wait_before_request(&self, region: RegionId, start_ts: TxnId) {
        let delay = {
            let injected = self
                .regions
                .read()
                .values()
                .find(|meta| meta.id == region)
                .and_then(|meta| meta.delay)
                .unwrap_or_default();
            let scheduled = self
                .scheduled
                .lock()
                .remove(&(start_ts, region))
                .unwrap_or_default();
            injected + scheduled
        };

        if !delay.is_zero() {
            debug!(%region, %start_ts, ?delay, "delaying region request");
            tokio::time::sleep(delay).await;
        }
    }

    /// Group keys into per-region batches.
    ///
    /// Keys are sorted and deduplicated; batches come out in key order and
    /// each region appears at most once.
    pub fn group_keys_by_region(&self, keys: impl IntoIterator<Item = Key>) -> Vec<RegionBatch> {
        let mut keys: Vec<Key> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let regions = self.regions.read();
        let mut batches: Vec<RegionBatch> = Vec::new();
        for key in keys {
            let region = lookup(&regions, &key).1.id;
            match batches.last_mut() {
                Some(batch) if batch.region == region => batch.keys.push(key),
                _ => batches.push(RegionBatch {
                    region,
                    keys: vec![key],
                }),
            }
        }
        batches
    }
}

impl Default for RegionRouter {
    fn default() -> Self {
        Self::new()
    }
}
