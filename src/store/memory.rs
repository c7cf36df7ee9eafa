//! In-process store.
//!
//! Each operation runs under the owning `DashMap` shard lock, which gives the
//! same per-key atomicity as the upsert and conditional update statements in
//! the Postgres store. Useful for tests and single-instance deployments.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    AdmissionEvent, AdmissionLog, CounterKey, QuotaRecord, QuotaStore, StoreError, UsageStore,
};

/// Admission events kept by default before the oldest are dropped.
pub const DEFAULT_ADMISSION_CAPACITY: usize = 10_000;

/// How long admission events survive a counter sweep, in seconds.
const ADMISSION_RETENTION_SECS: i64 = 24 * 60 * 60;

type QuotaKey = (String, String);

/// Dashmap-backed implementation of every store trait.
#[derive(Debug)]
pub struct MemoryStore {
    counters: DashMap<CounterKey, u64>,
    quotas: DashMap<QuotaKey, QuotaRecord>,
    quota_keys: DashMap<Uuid, QuotaKey>,
    admissions: Mutex<VecDeque<AdmissionEvent>>,
    admission_capacity: usize,
    failures: AtomicUsize,
    fail_admissions: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_admission_capacity(DEFAULT_ADMISSION_CAPACITY)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` admission events, dropping the oldest first.
    pub fn with_admission_capacity(capacity: usize) -> Self {
        Self {
            counters: DashMap::new(),
            quotas: DashMap::new(),
            quota_keys: DashMap::new(),
            admissions: Mutex::new(VecDeque::new()),
            admission_capacity: capacity,
            failures: AtomicUsize::new(0),
            fail_admissions: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` counter or quota operations fail as if the
    /// store were unreachable.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` admission log writes fail.
    pub fn fail_next_admissions(&self, count: usize) {
        self.fail_admissions.store(count, Ordering::SeqCst);
    }

    /// Seed or overwrite a quota row.
    pub fn put_quota(&self, record: QuotaRecord) {
        let key = (record.subject_id.clone(), record.quota_type.clone());
        self.quota_keys.insert(record.id, key.clone());
        let id = record.id;
        if let Some(previous) = self.quotas.insert(key, record) {
            if previous.id != id {
                self.quota_keys.remove(&previous.id);
            }
        }
    }

    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    pub fn admissions(&self) -> Vec<AdmissionEvent> {
        self.admissions.lock().iter().cloned().collect()
    }

    /// Clear all state.
    pub fn clear(&self) {
        self.counters.clear();
        self.quotas.clear();
        self.quota_keys.clear();
        self.admissions.lock().clear();
    }

    /// Drop admission events recorded before `cutoff`.
    fn trim_admissions(&self, cutoff: DateTime<Utc>) -> usize {
        let mut admissions = self.admissions.lock();
        let before = admissions.len();
        while admissions.front().is_some_and(|e| e.admitted_at < cutoff) {
            admissions.pop_front();
        }
        before - admissions.len()
    }

    fn check_fault(counter: &AtomicUsize) -> Result<(), StoreError> {
        let injected = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    /// Apply `update` to the quota row with `id` under its shard lock. The
    /// closure returns whether its guard held.
    fn update_quota<F>(&self, id: Uuid, update: F) -> Option<QuotaRecord>
    where
        F: FnOnce(&mut QuotaRecord) -> bool,
    {
        let key = self.quota_keys.get(&id)?.value().clone();
        let mut record = self.quotas.get_mut(&key)?;
        // The row may have been replaced under the same key.
        if record.id != id || !update(record.value_mut()) {
            return None;
        }
        Some(record.value().clone())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn get_count(&self, key: &CounterKey) -> Result<u64, StoreError> {
        Self::check_fault(&self.failures)?;
        Ok(self.counters.get(key).map(|c| *c).unwrap_or(0))
    }

    async fn increment_and_get(&self, key: &CounterKey) -> Result<u64, StoreError> {
        Self::check_fault(&self.failures)?;
        let mut count = self.counters.entry(key.clone()).or_insert(0);
        *count += 1;
        trace!(key = %key, count = *count, "Incremented counter");
        Ok(*count)
    }

    async fn purge_expired(&self, now: DateTime<Utc>, grace: Duration) -> Result<u64, StoreError> {
        Self::check_fault(&self.failures)?;
        let before = self.counters.len();
        self.counters.retain(|key, _| !key.is_expired(now, grace));
        let purged = before.saturating_sub(self.counters.len()) as u64;

        let retention = TimeDelta::seconds(ADMISSION_RETENTION_SECS)
            + TimeDelta::from_std(grace).unwrap_or_default();
        let trimmed = self.trim_admissions(now - retention);
        debug!(purged, trimmed, "Purged expired counters");
        Ok(purged)
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn get_quota(
        &self,
        subject_id: &str,
        quota_type: &str,
    ) -> Result<Option<QuotaRecord>, StoreError> {
        Self::check_fault(&self.failures)?;
        Ok(self
            .quotas
            .get(&(subject_id.to_string(), quota_type.to_string()))
            .map(|r| r.clone()))
    }

    async fn insert_quota(&self, record: &QuotaRecord) -> Result<bool, StoreError> {
        Self::check_fault(&self.failures)?;
        let key = (record.subject_id.clone(), record.quota_type.clone());
        match self.quotas.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                self.quota_keys.insert(record.id, slot.key().clone());
                slot.insert(record.clone());
                Ok(true)
            }
        }
    }

    async fn rollover_quota(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> Result<Option<QuotaRecord>, StoreError> {
        Self::check_fault(&self.failures)?;
        Ok(self.update_quota(id, |record| {
            if record.reset_time > now {
                return false;
            }
            record.current_usage = 1;
            record.reset_time = next_reset;
            true
        }))
    }

    async fn increment_quota(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaRecord>, StoreError> {
        Self::check_fault(&self.failures)?;
        Ok(self.update_quota(id, |record| {
            if record.reset_time <= now || record.current_usage >= record.limit_value {
                return false;
            }
            record.current_usage += 1;
            true
        }))
    }
}

#[async_trait]
impl AdmissionLog for MemoryStore {
    async fn record(&self, event: &AdmissionEvent) -> Result<(), StoreError> {
        Self::check_fault(&self.fail_admissions)?;
        let mut admissions = self.admissions.lock();
        while admissions.len() >= self.admission_capacity && admissions.pop_front().is_some() {}
        if self.admission_capacity > 0 {
            admissions.push_back(event.clone());
        }
        Ok(())
    }
}
