//! Sticky decider cache.
//!
//! Keeps the deciders of recently processed runs so that a decision task
//! carrying only new events can continue where the previous one stopped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use super::decider::{DeciderError, ReplayDecider};
use crate::service::DecisionTask;

pub type SharedDecider = Arc<Mutex<ReplayDecider>>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Partial history for a run that has no decider at the history's position.
    #[error("no cached decider for run {run_id} continuing at event {first_event_id}")]
    CacheMiss { run_id: String, first_event_id: i64 },
    #[error("decision task for run {0} carries no history")]
    EmptyHistory(String),
    #[error(transparent)]
    Decider(#[from] DeciderError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub forced_evictions: u64,
}

struct CachedDecider {
    decider: SharedDecider,
    next_event_id: i64,
    /// Tasks currently working on this decider; pinned entries are never evicted
    in_processing: usize,
}

#[derive(Default)]
struct CacheInner {
    map: HashMap<String, CachedDecider>,
    access_order: VecDeque<String>,
    stats: CacheStats,
}

impl CacheInner {
    fn touch(&mut self, run_id: &str) {
        if let Some(pos) = self.access_order.iter().position(|k| k == run_id) {
            self.access_order.remove(pos);
        }
        self.access_order.push_back(run_id.to_string());
    }

    fn remove(&mut self, run_id: &str) -> Option<CachedDecider> {
        let removed = self.map.remove(run_id)?;
        if let Some(pos) = self.access_order.iter().position(|k| k == run_id) {
            self.access_order.remove(pos);
        }
        Some(removed)
    }

    /// Least recently used run that is not pinned and not `exclude`.
    fn evictable(&self, exclude: &str) -> Option<String> {
        self.access_order
            .iter()
            .find(|k| {
                k.as_str() != exclude
                    && self
                        .map
                        .get(k.as_str())
                        .map(|e| e.in_processing == 0)
                        .unwrap_or(false)
            })
            .cloned()
    }
}

/// LRU of warm deciders keyed by run id.
pub struct DeciderCache {
    inner: Mutex<CacheInner>,
    max_size: usize,
}

impl DeciderCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Returns the decider for the task's run and pins it.
    ///
    /// A full history always gets a decider freshly built by `factory`. A
    /// partial history needs a cached decider positioned exactly at its first
    /// event; anything else is a [`CacheError::CacheMiss`] and drops the stale
    /// entry.
    pub fn get_or_create<F>(&self, task: &DecisionTask, factory: F) -> Result<SharedDecider, CacheError>
    where
        F: FnOnce() -> Result<ReplayDecider, DeciderError>,
    {
        let run_id = task.run_id().to_string();
        let first_event_id = task
            .history
            .first_event_id()
            .ok_or_else(|| CacheError::EmptyHistory(run_id.clone()))?;

        if !task.history.is_full() {
            let stale = {
                let mut inner = self.inner.lock();
                let hit = match inner.map.get_mut(&run_id) {
                    Some(entry) if entry.next_event_id == first_event_id => {
                        entry.in_processing += 1;
                        Some(entry.decider.clone())
                    }
                    _ => None,
                };
                if let Some(decider) = hit {
                    inner.touch(&run_id);
                    inner.stats.hits += 1;
                    debug!(run_id = %run_id, first_event_id, "decider cache hit");
                    return Ok(decider);
                }
                inner.stats.misses += 1;
                inner.remove(&run_id)
            };
            debug!(run_id = %run_id, first_event_id, stale = stale.is_some(), "decider cache miss");
            if let Some(stale) = stale {
                close(stale.decider);
            }
            return Err(CacheError::CacheMiss {
                run_id,
                first_event_id,
            });
        }

        let decider = Arc::new(Mutex::new(factory()?));
        if self.max_size == 0 {
            return Ok(decider);
        }
        let mut closing = Vec::new();
        {
            let mut inner = self.inner.lock();
            if let Some(stale) = inner.remove(&run_id) {
                closing.push(stale.decider);
            }
            while inner.map.len() >= self.max_size {
                let Some(victim) = inner.evictable(&run_id) else {
                    warn!(
                        size = inner.map.len(),
                        max_size = self.max_size,
                        "decider cache full of pinned entries"
                    );
                    break;
                };
                if let Some(evicted) = inner.remove(&victim) {
                    debug!(run_id = %victim, "evicting least recently used decider");
                    closing.push(evicted.decider);
                }
            }
            inner.map.insert(
                run_id.clone(),
                CachedDecider {
                    decider: decider.clone(),
                    next_event_id: 1,
                    in_processing: 1,
                },
            );
            inner.touch(&run_id);
        }
        closing.into_iter().for_each(close);
        Ok(decider)
    }

    /// Records where `decider` stopped so the next partial history can hit.
    ///
    /// Must be called while the run is still pinned. A decider that was
    /// closed in the meantime is dropped together with its entry.
    pub fn add_to_cache(&self, task: &DecisionTask, decider: SharedDecider) {
        if self.max_size == 0 {
            return;
        }
        let (closed, next_event_id) = {
            let decider = decider.lock();
            (decider.is_closed(), decider.next_event_id())
        };
        let run_id = task.run_id().to_string();
        let mut inner = self.inner.lock();
        if closed {
            debug!(run_id = %run_id, "not caching closed decider");
            inner.remove(&run_id);
            return;
        }
        match inner.map.get_mut(&run_id) {
            Some(entry) => {
                entry.decider = decider;
                entry.next_event_id = next_event_id;
            }
            None => {
                inner.map.insert(
                    run_id.clone(),
                    CachedDecider {
                        decider,
                        next_event_id,
                        in_processing: 0,
                    },
                );
            }
        }
        inner.touch(&run_id);
    }

    /// Unpins the run's decider.
    pub fn mark_processing_done(&self, run_id: &str) {
        if let Some(entry) = self.inner.lock().map.get_mut(run_id) {
            entry.in_processing = entry.in_processing.saturating_sub(1);
        }
    }

    /// Drops the run's decider and destroys its workflow threads.
    pub fn invalidate(&self, run_id: &str) {
        let removed = self.inner.lock().remove(run_id);
        if let Some(removed) = removed {
            debug!(run_id = %run_id, "invalidated cached decider");
            close(removed.decider);
        }
    }

    /// Evicts the least recently used unpinned decider other than `exclude_run_id`.
    ///
    /// Returns false when every cached decider is pinned or excluded.
    pub fn evict_any_not_in_processing(&self, exclude_run_id: &str) -> bool {
        let evicted = {
            let mut inner = self.inner.lock();
            let Some(victim) = inner.evictable(exclude_run_id) else {
                return false;
            };
            inner.stats.forced_evictions += 1;
            inner.remove(&victim).map(|e| (victim, e))
        };
        match evicted {
            Some((run_id, entry)) => {
                warn!(run_id = %run_id, "forced eviction of cached decider");
                close(entry.decider);
                true
            }
            None => false,
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.inner.lock().map.contains_key(run_id)
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}

impl std::fmt::Debug for DeciderCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DeciderCache")
            .field("size", &inner.map.len())
            .field("max_size", &self.max_size)
            .field("stats", &inner.stats)
            .finish()
    }
}

fn close(decider: SharedDecider) {
    decider.lock().close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::decider::tests::{decider, first_round, sleeper, task};
    use crate::executor::history::tests::event;
    use cadence_core::{EventType, WorkflowExecution};

    fn task_for(run_id: &str, events: Vec<cadence_core::HistoryEvent>) -> DecisionTask {
        let mut task = task(events, 0, 3);
        task.workflow_execution = WorkflowExecution::new("wf", run_id);
        task
    }

    fn processed(cache: &DeciderCache, run_id: &str) -> SharedDecider {
        let task = task_for(run_id, first_round());
        let shared = cache
            .get_or_create(&task, || Ok(decider(Box::new(sleeper))))
            .unwrap();
        shared.lock().process_decision_task(&task).unwrap();
        cache.add_to_cache(&task, shared.clone());
        cache.mark_processing_done(run_id);
        shared
    }

    fn sticky_task(run_id: &str) -> DecisionTask {
        let mut task = task_for(
            run_id,
            vec![
                event(4, EventType::DecisionTaskCompleted),
                event(5, EventType::DecisionTaskScheduled),
                event(6, EventType::DecisionTaskStarted),
            ],
        );
        task.previous_started_event_id = 3;
        task.started_event_id = 6;
        task
    }

    #[test]
    fn test_continuation_hits() {
        let cache = DeciderCache::new(10);
        let shared = processed(&cache, "r1");

        let hit = cache
            .get_or_create(&sticky_task("r1"), || panic!("factory must not run"))
            .unwrap();
        assert!(Arc::ptr_eq(&shared, &hit));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn test_unknown_run_misses() {
        let cache = DeciderCache::new(10);
        let err = cache
            .get_or_create(&sticky_task("unknown"), || panic!("factory must not run"))
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::CacheMiss {
                first_event_id: 4,
                ..
            }
        ));
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_wrong_position_drops_stale_entry() {
        let cache = DeciderCache::new(10);
        let shared = processed(&cache, "r1");

        let mut task = sticky_task("r1");
        for e in task.history.events.iter_mut() {
            e.event_id += 2;
        }
        assert!(matches!(
            cache.get_or_create(&task, || panic!("factory must not run")),
            Err(CacheError::CacheMiss { .. })
        ));
        assert!(!cache.contains("r1"));
        assert!(shared.lock().is_closed());
    }

    #[test]
    fn test_full_history_replaces_entry() {
        let cache = DeciderCache::new(10);
        let old = processed(&cache, "r1");
        let new = processed(&cache, "r1");
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(old.lock().is_closed());
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_lru_eviction_skips_pinned() {
        let cache = DeciderCache::new(2);
        let r1 = processed(&cache, "r1");
        let pinned = cache
            .get_or_create(&task_for("r2", first_round()), || Ok(decider(Box::new(sleeper))))
            .unwrap();
        processed(&cache, "r3");

        assert_eq!(cache.size(), 2);
        assert!(!cache.contains("r1"));
        assert!(r1.lock().is_closed());
        assert!(cache.contains("r2"));
        assert!(!pinned.lock().is_closed());
    }

    #[test]
    fn test_evict_any_not_in_processing() {
        let cache = DeciderCache::new(10);
        processed(&cache, "r1");
        cache
            .get_or_create(&task_for("r2", first_round()), || Ok(decider(Box::new(sleeper))))
            .unwrap();

        assert!(!cache.evict_any_not_in_processing("r1"));
        assert!(cache.evict_any_not_in_processing("r2"));
        assert!(!cache.contains("r1"));
        assert_eq!(cache.stats().forced_evictions, 1);

        cache.mark_processing_done("r2");
        assert!(cache.evict_any_not_in_processing("other"));
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_invalidate_closes_decider() {
        let cache = DeciderCache::new(10);
        let shared = processed(&cache, "r1");
        cache.invalidate("r1");
        assert_eq!(cache.size(), 0);
        assert!(shared.lock().is_closed());
    }

    #[test]
    fn test_pinned_until_cached() {
        let cache = DeciderCache::new(10);
        processed(&cache, "r1");
        let task = sticky_task("r1");
        let shared = cache
            .get_or_create(&task, || panic!("factory must not run"))
            .unwrap();

        // another poller needing room while this task still holds the decider
        assert!(!cache.evict_any_not_in_processing("other"));
        cache.add_to_cache(&task, shared.clone());
        cache.mark_processing_done("r1");

        let hit = cache
            .get_or_create(&sticky_task("r1"), || panic!("factory must not run"))
            .unwrap();
        assert!(Arc::ptr_eq(&shared, &hit));
        assert!(!hit.lock().is_closed());
    }

    #[test]
    fn test_closed_decider_is_not_cached() {
        let cache = DeciderCache::new(10);
        let task = task_for("r1", first_round());
        let shared = cache
            .get_or_create(&task, || Ok(decider(Box::new(sleeper))))
            .unwrap();
        shared.lock().process_decision_task(&task).unwrap();
        shared.lock().close();

        cache.add_to_cache(&task, shared);
        cache.mark_processing_done("r1");
        assert!(!cache.contains("r1"));
        assert!(matches!(
            cache.get_or_create(&sticky_task("r1"), || panic!("factory must not run")),
            Err(CacheError::CacheMiss { .. })
        ));
    }

    #[test]
    fn test_zero_size_cache_keeps_nothing() {
        let cache = DeciderCache::new(0);
        let shared = processed(&cache, "r1");
        assert_eq!(cache.size(), 0);
        assert!(!shared.lock().is_closed());
        assert!(matches!(
            cache.get_or_create(&sticky_task("r1"), || panic!("factory must not run")),
            Err(CacheError::CacheMiss { .. })
        ));
    }

    #[test]
    fn test_empty_history_is_rejected() {
        let cache = DeciderCache::new(10);
        assert!(matches!(
            cache.get_or_create(&task_for("r1", Vec::new()), || panic!("factory must not run")),
            Err(CacheError::EmptyHistory(_))
        ));
    }
}
