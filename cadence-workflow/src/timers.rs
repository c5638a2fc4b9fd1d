//! Blocking-condition timer set.
//!
//! Entries are kept in a map ordered by fire time and fired in that order,
//! registration order breaking ties. A callback receives the timer set itself
//! and may register new timers; while a firing pass is in progress those go
//! to a side buffer that is merged once the pass is over, so nothing is lost
//! or fired twice.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

pub type TimerCallback = Box<dyn FnOnce(&mut WorkflowTimers) + Send>;

/// Identifies one registration in a [`WorkflowTimers`] set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle {
    pub fire_time: i64,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    #[error("unknown timer {id} scheduled at {fire_time}")]
    UnknownTimer { fire_time: i64, id: u64 },
}

#[derive(Default)]
pub struct WorkflowTimers {
    timers: BTreeMap<i64, Vec<(u64, TimerCallback)>>,
    next_id: u64,
    firing: bool,
    concurrently_added: Vec<(TimerHandle, TimerCallback)>,
}

impl WorkflowTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_timer(&mut self, fire_time: i64, callback: TimerCallback) -> TimerHandle {
        let handle = TimerHandle {
            fire_time,
            id: self.next_id,
        };
        self.next_id += 1;
        if self.firing {
            self.concurrently_added.push((handle, callback));
        } else {
            self.insert(handle, callback);
        }
        handle
    }

    pub fn remove_timer(&mut self, handle: TimerHandle) -> Result<(), TimerError> {
        if let Some(pos) = self
            .concurrently_added
            .iter()
            .position(|(h, _)| *h == handle)
        {
            drop(self.concurrently_added.remove(pos));
            return Ok(());
        }
        let unknown = TimerError::UnknownTimer {
            fire_time: handle.fire_time,
            id: handle.id,
        };
        let entries = self.timers.get_mut(&handle.fire_time).ok_or(unknown.clone())?;
        let pos = entries
            .iter()
            .position(|(id, _)| *id == handle.id)
            .ok_or(unknown)?;
        drop(entries.remove(pos));
        if entries.is_empty() {
            self.timers.remove(&handle.fire_time);
        }
        Ok(())
    }

    /// Fires every timer due at `now`. Returns whether anything fired.
    pub fn fire_timers(&mut self, now: i64) -> bool {
        self.firing = true;
        let mut fired = false;
        loop {
            let later = self.timers.split_off(&now.saturating_add(1));
            let due = std::mem::replace(&mut self.timers, later);
            for (_, entries) in due {
                for (_, callback) in entries {
                    fired = true;
                    callback(self);
                }
            }
            if self.concurrently_added.is_empty() {
                break;
            }
            for (handle, callback) in std::mem::take(&mut self.concurrently_added) {
                self.insert(handle, callback);
            }
        }
        self.firing = false;
        fired
    }

    /// Earliest registered fire time, `None` when nothing is registered.
    pub fn next_fire_time(&self) -> Option<i64> {
        let buffered = self.concurrently_added.iter().map(|(h, _)| h.fire_time).min();
        match (self.timers.keys().next().copied(), buffered) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn len(&self) -> usize {
        self.timers.values().map(Vec::len).sum::<usize>() + self.concurrently_added.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&mut self, handle: TimerHandle, callback: TimerCallback) {
        self.timers
            .entry(handle.fire_time)
            .or_default()
            .push((handle.id, callback));
    }
}

impl fmt::Debug for WorkflowTimers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowTimers")
            .field("fire_times", &self.timers.keys().collect::<Vec<_>>())
            .field("firing", &self.firing)
            .field("concurrently_added", &self.concurrently_added.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &str) -> TimerCallback {
        let log = log.clone();
        let label = label.to_string();
        Box::new(move |_| log.lock().push(label))
    }

    #[test]
    fn test_fires_in_time_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut timers = WorkflowTimers::new();
        timers.add_timer(300, recorder(&log, "c"));
        timers.add_timer(100, recorder(&log, "a"));
        timers.add_timer(200, recorder(&log, "b1"));
        timers.add_timer(200, recorder(&log, "b2"));

        assert_eq!(timers.next_fire_time(), Some(100));
        assert!(timers.fire_timers(250));
        assert_eq!(*log.lock(), vec!["a", "b1", "b2"]);
        assert_eq!(timers.next_fire_time(), Some(300));
        assert!(!timers.fire_timers(299));
        assert!(timers.fire_timers(300));
        assert!(timers.is_empty());
        assert_eq!(timers.next_fire_time(), None);
    }

    #[test]
    fn test_timer_added_while_firing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut timers = WorkflowTimers::new();
        let inner_log = log.clone();
        timers.add_timer(
            100,
            Box::new(move |timers: &mut WorkflowTimers| {
                inner_log.lock().push("outer".to_string());
                let due_log = inner_log.clone();
                timers.add_timer(
                    100,
                    Box::new(move |_| due_log.lock().push("due".to_string())),
                );
                let later_log = inner_log.clone();
                timers.add_timer(
                    500,
                    Box::new(move |_| later_log.lock().push("later".to_string())),
                );
            }),
        );

        timers.fire_timers(100);
        assert_eq!(*log.lock(), vec!["outer", "due"]);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_fire_time(), Some(500));

        timers.fire_timers(1000);
        assert_eq!(*log.lock(), vec!["outer", "due", "later"]);
    }

    #[test]
    fn test_remove_unknown_timer_is_an_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut timers = WorkflowTimers::new();
        let handle = timers.add_timer(100, recorder(&log, "a"));
        assert!(timers.remove_timer(handle).is_ok());
        assert_eq!(
            timers.remove_timer(handle),
            Err(TimerError::UnknownTimer {
                fire_time: 100,
                id: handle.id
            })
        );
        timers.fire_timers(1000);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_remove_timer_added_while_firing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut timers = WorkflowTimers::new();
        let inner_log = log.clone();
        timers.add_timer(
            100,
            Box::new(move |timers: &mut WorkflowTimers| {
                inner_log.lock().push("outer".to_string());
                let dropped_log = inner_log.clone();
                let handle = timers.add_timer(
                    100,
                    Box::new(move |_| dropped_log.lock().push("removed".to_string())),
                );
                assert!(timers.remove_timer(handle).is_ok());
            }),
        );

        timers.fire_timers(1000);
        assert_eq!(*log.lock(), vec!["outer"]);
        assert!(timers.is_empty());
    }
}
