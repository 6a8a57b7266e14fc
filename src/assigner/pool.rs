//! Worker pool bookkeeping. Everything here is synchronous; callers hold
//! the assigner lock for the duration of one decision.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::types::{WorkerAccount, WorkerStatus};

/// Load-balancing order: lowest outstanding load, then least recently
/// used (never used first), then id.
pub fn compare_workers(a: &WorkerAccount, b: &WorkerAccount) -> Ordering {
    a.outstanding_load
        .cmp(&b.outstanding_load)
        .then_with(|| a.last_used_at.cmp(&b.last_used_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Best active worker. `exclude` is honoured only when another active
/// worker exists.
pub fn select_worker<'a, I>(workers: I, exclude: Option<&str>) -> Option<&'a WorkerAccount>
where
    I: IntoIterator<Item = &'a WorkerAccount>,
{
    let active: Vec<&WorkerAccount> = workers.into_iter().filter(|w| w.is_active()).collect();
    let preferred = active
        .iter()
        .copied()
        .filter(|w| Some(w.id.as_str()) != exclude)
        .min_by(|a, b| compare_workers(a, b));
    preferred.or_else(|| active.into_iter().min_by(|a, b| compare_workers(a, b)))
}

/// Result of recording one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorOutcome {
    pub error_count: u32,
    /// The worker just crossed the threshold.
    pub demoted: bool,
}

#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: BTreeMap<String, WorkerAccount>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, account: WorkerAccount) {
        self.workers.insert(account.id.clone(), account);
    }

    pub fn get(&self, id: &str) -> Option<&WorkerAccount> {
        self.workers.get(id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.workers.values().filter(|w| w.is_active()).count()
    }

    pub fn select(&self, exclude: Option<&str>) -> Option<String> {
        select_worker(self.workers.values(), exclude).map(|w| w.id.clone())
    }

    /// Book a new task on `id`.
    pub fn assign_to(&mut self, id: &str, now: DateTime<Utc>) {
        if let Some(w) = self.workers.get_mut(id) {
            w.outstanding_load += 1;
            w.tasks_assigned += 1;
            w.last_used_at = Some(now);
        }
    }

    /// Task on `id` terminated without penalty (skip).
    pub fn release(&mut self, id: &str) {
        if let Some(w) = self.workers.get_mut(id) {
            w.outstanding_load = w.outstanding_load.saturating_sub(1);
        }
    }

    pub fn record_success(&mut self, id: &str) {
        if let Some(w) = self.workers.get_mut(id) {
            w.outstanding_load = w.outstanding_load.saturating_sub(1);
            w.replies_sent += 1;
        }
    }

    /// Count a failed attempt and release its load; demote at `threshold`.
    pub fn record_error(&mut self, id: &str, threshold: u32) -> ErrorOutcome {
        let Some(w) = self.workers.get_mut(id) else {
            return ErrorOutcome {
                error_count: 0,
                demoted: false,
            };
        };
        w.outstanding_load = w.outstanding_load.saturating_sub(1);
        w.error_count += 1;
        let demoted = w.is_active() && w.error_count >= threshold;
        if demoted {
            w.status = WorkerStatus::Error;
        }
        ErrorOutcome {
            error_count: w.error_count,
            demoted,
        }
    }

    /// Force a worker out of rotation. Returns true when it was active.
    pub fn demote(&mut self, id: &str) -> bool {
        match self.workers.get_mut(id) {
            Some(w) if w.is_active() => {
                w.status = WorkerStatus::Error;
                true
            }
            _ => false,
        }
    }

    /// Back to `active` with a clean error count.
    pub fn reactivate(&mut self, id: &str) -> bool {
        match self.workers.get_mut(id) {
            Some(w) => {
                w.status = WorkerStatus::Active;
                w.error_count = 0;
                true
            }
            None => false,
        }
    }

    /// Zero the counters; status and outstanding load are untouched.
    pub fn reset_stats(&mut self) {
        for w in self.workers.values_mut() {
            w.tasks_assigned = 0;
            w.replies_sent = 0;
            w.error_count = 0;
        }
    }

    pub fn snapshot(&self) -> Vec<WorkerAccount> {
        self.workers.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.workers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn worker(id: &str, load: u32, used_secs_ago: Option<i64>) -> WorkerAccount {
        let mut w = WorkerAccount::new(id);
        w.outstanding_load = load;
        w.last_used_at = used_secs_ago.map(|s| Utc::now() - Duration::seconds(s));
        w
    }

    #[test]
    fn minimum_load_wins() {
        let ws = [worker("a", 0, Some(1)), worker("b", 2, None), worker("c", 1, None)];
        assert_eq!(select_worker(&ws, None).unwrap().id, "a");
    }

    #[test]
    fn equal_load_prefers_least_recently_used() {
        let ws = [worker("a", 1, Some(5)), worker("b", 1, Some(50))];
        assert_eq!(select_worker(&ws, None).unwrap().id, "b");

        let ws = [worker("a", 1, Some(5)), worker("b", 1, None)];
        assert_eq!(select_worker(&ws, None).unwrap().id, "b");
    }

    #[test]
    fn exclusion_falls_back_to_only_worker() {
        let ws = [worker("a", 0, None), worker("b", 3, None)];
        assert_eq!(select_worker(&ws, Some("a")).unwrap().id, "b");

        let ws = [worker("a", 0, None)];
        assert_eq!(select_worker(&ws, Some("a")).unwrap().id, "a");
    }

    #[test]
    fn demoted_worker_is_never_selected() {
        let mut pool = WorkerPool::new();
        pool.insert(worker("a", 0, None));
        pool.insert(worker("b", 4, None));
        for _ in 0..4 {
            assert!(!pool.record_error("a", 5).demoted);
            pool.assign_to("a", Utc::now());
        }
        let out = pool.record_error("a", 5);
        assert_eq!(out, ErrorOutcome { error_count: 5, demoted: true });
        assert_eq!(pool.get("a").unwrap().outstanding_load, 0);
        assert_eq!(pool.select(None).as_deref(), Some("b"));

        assert!(pool.demote("b"));
        assert_eq!(pool.select(None), None);
    }

    #[test]
    fn reset_keeps_status_and_load() {
        let mut pool = WorkerPool::new();
        pool.insert(worker("a", 2, None));
        pool.demote("a");
        pool.record_success("a");
        pool.reset_stats();
        let a = pool.get("a").unwrap();
        assert_eq!(a.status, WorkerStatus::Error);
        assert_eq!(a.outstanding_load, 1);
        assert_eq!(a.replies_sent, 0);

        assert!(pool.reactivate("a"));
        assert!(pool.get("a").unwrap().is_active());
        assert!(!pool.reactivate("missing"));
    }
}
