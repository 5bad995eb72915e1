//! Job storage implementations.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use forgejobs_core::JobId;

use super::types::{ClaimToken, JobRecord, JobStatus, NewJobRecord, QueueStats};

/// Durable, queryable storage for job records.
///
/// The store is a passive persistence boundary: the scheduler decides every
/// state transition. Each operation is atomic with respect to a single record;
/// no cross-record transactions are provided.
///
/// Time-dependent queries take `now` explicitly so callers control the clock.
pub trait JobStore: Send + Sync {
    /// Persist a new record in `pending` and return its assigned id.
    fn insert(&self, record: NewJobRecord) -> Result<JobId, JobStoreError>;

    /// Persist the full current state of an existing record.
    fn update(&self, record: &JobRecord) -> Result<(), JobStoreError>;

    /// Persist `record` only while the stored copy still holds `claim`.
    ///
    /// Returns `false` without writing when the claim was lost: the record was
    /// recovered by `reset_stuck`, claimed again, or removed.
    fn update_claimed(&self, record: &JobRecord, claim: ClaimToken) -> Result<bool, JobStoreError>;

    /// Up to `limit` pending records with `scheduled_at <= now`, oldest first.
    fn find_ready(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError>;

    fn find_by_id(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Atomically move a record from `pending` to `running`.
    ///
    /// Sets `started_at = now` and counts the attempt. Returns `None` when the
    /// record is no longer pending (another worker claimed it first).
    fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<JobRecord>, JobStoreError>;

    /// Record counts grouped by status.
    fn stats(&self) -> Result<QueueStats, JobStoreError>;

    /// Delete `completed`/`failed` records whose `completed_at` is more than
    /// `days` days before `now`. Returns the number removed.
    fn delete_terminal_older_than(&self, days: u32, now: DateTime<Utc>) -> Result<u64, JobStoreError>;

    /// Recover `running` records whose `started_at + timeout` is before `now`.
    ///
    /// Each recovered record has an attempt counted and goes back to
    /// `pending`, or to `failed` if that was its last attempt.
    fn reset_stuck(&self, now: DateTime<Utc>) -> Result<u64, JobStoreError>;

    /// Records in a given status, oldest first.
    fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Records of a given job type, oldest first.
    fn list_by_type(&self, job_type: &str, limit: usize) -> Result<Vec<JobRecord>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

/// Oldest `completed_at` kept by a retention cleanup.
pub fn retention_cutoff(days: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    now.checked_sub_signed(Duration::days(i64::from(days)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert(&self, record: NewJobRecord) -> Result<JobId, JobStoreError> {
        (**self).insert(record)
    }

    fn update(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        (**self).update(record)
    }

    fn update_claimed(&self, record: &JobRecord, claim: ClaimToken) -> Result<bool, JobStoreError> {
        (**self).update_claimed(record, claim)
    }

    fn find_ready(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).find_ready(limit, now)
    }

    fn find_by_id(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).find_by_id(id)
    }

    fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).claim(id, now)
    }

    fn stats(&self) -> Result<QueueStats, JobStoreError> {
        (**self).stats()
    }

    fn delete_terminal_older_than(&self, days: u32, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        (**self).delete_terminal_older_than(days, now)
    }

    fn reset_stuck(&self, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        (**self).reset_stuck(now)
    }

    fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list_by_status(status, limit)
    }

    fn list_by_type(&self, job_type: &str, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list_by_type(job_type, limit)
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    jobs: BTreeMap<JobId, JobRecord>,
}

/// In-memory job store for tests/dev.
///
/// A single lock guards id allocation and all records, so every operation
/// (including `claim`) is atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sorted_matching<F>(&self, limit: usize, predicate: F) -> Vec<JobRecord>
    where
        F: Fn(&JobRecord) -> bool,
    {
        let inner = self.inner.read().unwrap();
        let mut result: Vec<_> = inner.jobs.values().filter(|j| predicate(j)).cloned().collect();
        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        result
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, record: NewJobRecord) -> Result<JobId, JobStoreError> {
        let mut inner = self.inner.write().unwrap();
        inner.next_id += 1;
        let id = JobId::new(inner.next_id);
        inner.jobs.insert(id, record.into_record(id));
        Ok(id)
    }

    fn update(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        let mut inner = self.inner.write().unwrap();
        match inner.jobs.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(record.id)),
        }
    }

    fn update_claimed(&self, record: &JobRecord, claim: ClaimToken) -> Result<bool, JobStoreError> {
        let mut inner = self.inner.write().unwrap();
        match inner.jobs.get_mut(&record.id) {
            Some(existing) if existing.holds_claim(claim) => {
                *existing = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn find_ready(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<JobRecord>, JobStoreError> {
        let inner = self.inner.read().unwrap();
        let mut ready: Vec<_> = inner.jobs.values().filter(|j| j.is_ready(now)).collect();

        // Oldest-ready first so nothing starves; id breaks ties deterministically
        ready.sort_by_key(|j| (j.scheduled_at, j.id));

        Ok(ready.into_iter().take(limit).cloned().collect())
    }

    fn find_by_id(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.inner.read().unwrap().jobs.get(&id).cloned())
    }

    fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<JobRecord>, JobStoreError> {
        let mut inner = self.inner.write().unwrap();
        match inner.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.mark_running(now);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    fn stats(&self) -> Result<QueueStats, JobStoreError> {
        let inner = self.inner.read().unwrap();
        let mut stats = QueueStats::default();
        for job in inner.jobs.values() {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }

    fn delete_terminal_older_than(&self, days: u32, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let cutoff = retention_cutoff(days, now);
        let mut inner = self.inner.write().unwrap();
        let before = inner.jobs.len();

        inner.jobs.retain(|_, job| {
            let expired = job.status.is_terminal()
                && job.completed_at.is_some_and(|completed_at| completed_at < cutoff);
            !expired
        });

        Ok((before - inner.jobs.len()) as u64)
    }

    fn reset_stuck(&self, now: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut inner = self.inner.write().unwrap();
        let mut recovered = 0;
        for job in inner.jobs.values_mut().filter(|j| j.is_stuck(now)) {
            job.recover_stuck(now);
            recovered += 1;
        }
        Ok(recovered)
    }

    fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        Ok(self.sorted_matching(limit, |j| j.status == status))
    }

    fn list_by_type(&self, job_type: &str, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        Ok(self.sorted_matching(limit, |j| j.job_type == job_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::Payload;
    use crate::jobs::types::RetryPolicy;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn new_job(job_type: &str, scheduled_at: DateTime<Utc>) -> NewJobRecord {
        NewJobRecord {
            job_type: job_type.to_string(),
            payload: Payload::new(),
            policy: RetryPolicy::new(3, 0, 60),
            scheduled_at,
            created_at: t0(),
        }
    }

    #[test]
    fn insert_assigns_increasing_ids() {
        let store = InMemoryJobStore::new();
        let a = store.insert(new_job("test", t0())).unwrap();
        let b = store.insert(new_job("test", t0())).unwrap();

        assert!(b > a);
        let stored = store.find_by_id(a).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 0);
    }

    #[test]
    fn update_unknown_id_fails() {
        let store = InMemoryJobStore::new();
        let record = new_job("test", t0()).into_record(JobId::new(99));

        assert!(matches!(
            store.update(&record),
            Err(JobStoreError::NotFound(id)) if id == JobId::new(99)
        ));
    }

    #[test]
    fn find_ready_orders_by_scheduled_at_and_respects_limit() {
        let store = InMemoryJobStore::new();
        let late = store.insert(new_job("test", t0() + Duration::seconds(20))).unwrap();
        let early = store.insert(new_job("test", t0())).unwrap();
        let middle = store.insert(new_job("test", t0() + Duration::seconds(10))).unwrap();
        store.insert(new_job("test", t0() + Duration::hours(1))).unwrap();

        let now = t0() + Duration::seconds(30);
        let ready: Vec<_> = store.find_ready(10, now).unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ready, vec![early, middle, late]);

        let ready = store.find_ready(2, now).unwrap();
        assert_eq!(ready.len(), 2);

        // Idempotent without state change
        assert_eq!(store.find_ready(10, now).unwrap().len(), 3);
    }

    #[test]
    fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let id = store.insert(new_job("test", t0())).unwrap();

        let claimed = store.claim(id, t0()).unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.started_at, Some(t0()));

        // Second claim loses the race
        assert!(store.claim(id, t0()).unwrap().is_none());
        assert!(store.find_ready(10, t0()).unwrap().is_empty());
    }

    #[test]
    fn update_claimed_rejects_writer_whose_claim_was_lost() {
        let store = InMemoryJobStore::new();
        let id = store.insert(new_job("test", t0())).unwrap();

        let mut stale = store.claim(id, t0()).unwrap().unwrap();
        let stale_claim = stale.claim_token().unwrap();

        let later = t0() + Duration::seconds(61);
        assert_eq!(store.reset_stuck(later).unwrap(), 1);
        let current = store.claim(id, later).unwrap().unwrap();
        assert_eq!(current.attempts, 3);

        stale.mark_attempt_failed("late".to_string(), later);
        assert!(!store.update_claimed(&stale, stale_claim).unwrap());

        let stored = store.find_by_id(id).unwrap().unwrap();
        assert_eq!(stored, current);

        let mut done = current.clone();
        done.mark_completed(later);
        assert!(store.update_claimed(&done, current.claim_token().unwrap()).unwrap());
        assert_eq!(store.find_by_id(id).unwrap().unwrap().status, JobStatus::Completed);

        // Unknown ids have no claim to hold
        let mut ghost = done.clone();
        ghost.id = JobId::new(404);
        assert!(!store.update_claimed(&ghost, stale_claim).unwrap());
    }

    #[test]
    fn claim_unknown_id_is_none() {
        let store = InMemoryJobStore::new();
        assert!(store.claim(JobId::new(7), t0()).unwrap().is_none());
    }

    #[test]
    fn stats_tracking() {
        let store = InMemoryJobStore::new();
        let ids: Vec<_> = (0..5).map(|_| store.insert(new_job("test", t0())).unwrap()).collect();

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 5);

        store.claim(ids[0], t0()).unwrap();
        let mut done = store.claim(ids[1], t0()).unwrap().unwrap();
        done.mark_completed(t0());
        store.update(&done).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.total(), 5);
    }

    #[test]
    fn cleanup_removes_only_old_terminal_records() {
        let store = InMemoryJobStore::new();
        let now = t0() + Duration::days(30);

        let old_completed = store.insert(new_job("test", t0())).unwrap();
        let old_failed = store.insert(new_job("test", t0())).unwrap();
        let recent_completed = store.insert(new_job("test", t0())).unwrap();
        let old_pending = store.insert(new_job("test", t0())).unwrap();
        let old_running = store.insert(new_job("test", t0())).unwrap();

        let mut r = store.claim(old_completed, t0()).unwrap().unwrap();
        r.mark_completed(t0());
        store.update(&r).unwrap();

        let mut r = store.claim(old_failed, t0()).unwrap().unwrap();
        r.mark_failed("boom".to_string(), t0());
        store.update(&r).unwrap();

        let mut r = store.claim(recent_completed, t0()).unwrap().unwrap();
        r.mark_completed(now - Duration::days(1));
        store.update(&r).unwrap();

        store.claim(old_running, t0()).unwrap();

        let removed = store.delete_terminal_older_than(7, now).unwrap();
        assert_eq!(removed, 2);
        assert!(store.find_by_id(old_completed).unwrap().is_none());
        assert!(store.find_by_id(old_failed).unwrap().is_none());
        assert!(store.find_by_id(recent_completed).unwrap().is_some());
        assert!(store.find_by_id(old_pending).unwrap().is_some());
        assert!(store.find_by_id(old_running).unwrap().is_some());
    }

    #[test]
    fn reset_stuck_recovers_only_timed_out_records() {
        let store = InMemoryJobStore::new();
        let stuck = store.insert(new_job("test", t0())).unwrap();
        let fresh = store.insert(new_job("test", t0())).unwrap();

        store.claim(stuck, t0()).unwrap();
        store.claim(fresh, t0() + Duration::seconds(50)).unwrap();

        let now = t0() + Duration::seconds(90);
        assert_eq!(store.reset_stuck(now).unwrap(), 1);

        let recovered = store.find_by_id(stuck).unwrap().unwrap();
        assert_eq!(recovered.status, JobStatus::Pending);
        assert_eq!(recovered.attempts, 2);
        assert!(recovered.started_at.is_none());

        let untouched = store.find_by_id(fresh).unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Running);
        assert_eq!(untouched.attempts, 1);

        // Idempotent without state change
        assert_eq!(store.reset_stuck(now).unwrap(), 0);
    }

    #[test]
    fn diagnostics_listing() {
        let store = InMemoryJobStore::new();
        let a = store.insert(new_job("email", t0())).unwrap();
        store.insert(new_job("report", t0())).unwrap();
        let c = store.insert(new_job("email", t0())).unwrap();
        store.claim(c, t0()).unwrap();

        let emails: Vec<_> = store.list_by_type("email", 10).unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(emails, vec![a, c]);

        let running = store.list_by_status(JobStatus::Running, 10).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, c);

        assert_eq!(store.list_by_status(JobStatus::Pending, 1).unwrap().len(), 1);
    }

    #[test]
    fn works_through_arc() {
        let store = InMemoryJobStore::arc();
        let shared: Arc<dyn JobStore> = store.clone();
        let id = shared.insert(new_job("test", t0())).unwrap();
        assert!(store.find_by_id(id).unwrap().is_some());
        assert_eq!(store.len(), 1);
    }
}
