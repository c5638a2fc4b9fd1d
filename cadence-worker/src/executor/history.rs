//! Grouping of history into decision batches.
//!
//! A batch holds the events the workflow reacts to in one decision round: all
//! events up to a `DecisionTaskStarted` that was not timed out or failed. If
//! the round was completed, the events the service recorded for its decisions
//! follow the `DecisionTaskCompleted` and are attached to the batch so replay
//! can compare them with what the workflow emits again.

use cadence_core::{EventType, HistoryEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionEvents {
    /// Events to apply before running the workflow. Decision task events
    /// other than timeouts and failures are left out.
    pub events: Vec<HistoryEvent>,
    /// Events recorded for the round's decisions, empty for the open round.
    pub decision_events: Vec<HistoryEvent>,
    /// `MarkerRecorded` events among `decision_events`
    pub markers: Vec<HistoryEvent>,
    /// The round was already answered; its decisions are in history.
    pub replay: bool,
    /// Workflow time of the round: the timestamp of its started event
    pub replay_current_time_millis: i64,
    /// Id the first decision event of this round gets
    pub next_decision_event_id: i64,
    /// `None` for trailing events that no decision task has picked up yet
    pub started_event_id: Option<i64>,
}

/// Iterates over the decision batches of a history slice.
#[derive(Debug)]
pub struct DecisionEventsIterator<'a> {
    events: &'a [HistoryEvent],
    position: usize,
    previous_started_event_id: i64,
}

impl<'a> DecisionEventsIterator<'a> {
    pub fn new(events: &'a [HistoryEvent], previous_started_event_id: i64) -> Self {
        Self {
            events,
            position: 0,
            previous_started_event_id,
        }
    }

    fn is_round_abandoned(&self, started_index: usize) -> bool {
        matches!(
            self.events.get(started_index + 1).map(|e| e.event_type),
            Some(EventType::DecisionTaskTimedOut) | Some(EventType::DecisionTaskFailed)
        )
    }
}

impl<'a> Iterator for DecisionEventsIterator<'a> {
    type Item = DecisionEvents;

    fn next(&mut self) -> Option<DecisionEvents> {
        if self.position >= self.events.len() {
            return None;
        }
        let mut events = Vec::new();
        let mut index = self.position;
        while index < self.events.len() {
            let event = &self.events[index];
            if event.event_type != EventType::DecisionTaskStarted {
                if event.event_type != EventType::DecisionTaskCompleted {
                    events.push(event.clone());
                }
                index += 1;
                continue;
            }
            if self.is_round_abandoned(index) {
                index += 1;
                continue;
            }

            let started_event_id = event.event_id;
            let mut replay = started_event_id <= self.previous_started_event_id;
            let mut decision_events = Vec::new();
            index += 1;
            if self.events.get(index).map(|e| e.event_type) == Some(EventType::DecisionTaskCompleted)
            {
                replay = true;
                index += 1;
                while let Some(e) = self.events.get(index) {
                    if !e.event_type.is_decision_event() {
                        break;
                    }
                    decision_events.push(e.clone());
                    index += 1;
                }
            }
            self.position = index;
            let markers = decision_events
                .iter()
                .filter(|e| e.event_type == EventType::MarkerRecorded)
                .cloned()
                .collect();
            return Some(DecisionEvents {
                events,
                decision_events,
                markers,
                replay,
                replay_current_time_millis: event.timestamp_millis(),
                next_decision_event_id: started_event_id + 2,
                started_event_id: Some(started_event_id),
            });
        }

        self.position = self.events.len();
        let last = self.events.last()?;
        Some(DecisionEvents {
            events,
            decision_events: Vec::new(),
            markers: Vec::new(),
            replay: false,
            replay_current_time_millis: last.timestamp_millis(),
            next_decision_event_id: last.event_id + 1,
            started_event_id: None,
        })
    }
}

/// Splits the head of a sticky history into the decision events of the round
/// the worker answered last and the rest.
///
/// Sticky histories start with that round's `DecisionTaskCompleted`; for any
/// other history the first slice is empty.
pub fn split_previous_round(events: &[HistoryEvent]) -> (&[HistoryEvent], &[HistoryEvent]) {
    match events.first() {
        Some(first) if first.event_type == EventType::DecisionTaskCompleted => {
            let count = events[1..]
                .iter()
                .take_while(|e| e.event_type.is_decision_event())
                .count();
            (&events[1..1 + count], &events[1 + count..])
        }
        _ => (&[], events),
    }
}
