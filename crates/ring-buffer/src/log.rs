//! Sequenced event log

use crate::RingBuffer;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// An event with its sequence id and append time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent<T> {
    /// Strictly increasing, starting at 1
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub event: T,
}

/// Result of an incremental read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage<T> {
    pub events: Vec<LoggedEvent<T>>,
    /// Id of the newest event in the log, 0 when empty
    pub latest_event_id: u64,
}

/// Capacity-bounded, append-only log with monotonically increasing ids
pub struct EventLog<T> {
    entries: RingBuffer<LoggedEvent<T>>,
    next_id: Mutex<u64>,
}

impl<T: Clone> EventLog<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RingBuffer::new(capacity),
            next_id: Mutex::new(1),
        }
    }

    /// Stamp and append an event
    pub fn append(&self, event: T) -> LoggedEvent<T> {
        // id allocation and push happen under one lock so ids stay ordered
        let mut next_id = self.next_id.lock();
        let logged = LoggedEvent {
            id: *next_id,
            timestamp: Utc::now(),
            event,
        };
        *next_id += 1;
        self.entries.push(logged.clone());
        logged
    }

    /// The last `count` events, oldest first
    pub fn recent(&self, count: usize) -> Vec<LoggedEvent<T>> {
        self.entries.read_last(count)
    }

    /// Events with an id above `newer_than`, oldest first, at most `limit`
    pub fn newer_than(&self, newer_than: u64, limit: usize) -> EventPage<T> {
        let mut events = self.entries.filter(|e| e.id > newer_than);
        if events.len() > limit {
            events.drain(..events.len() - limit);
        }
        EventPage {
            events,
            latest_event_id: self.latest_id(),
        }
    }

    pub fn latest_id(&self) -> u64 {
        self.entries.last().map(|e| e.id).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one() {
        let log = EventLog::new(10);
        assert_eq!(log.latest_id(), 0);
        assert_eq!(log.append("connecting").id, 1);
        assert_eq!(log.append("connected").id, 2);
        assert_eq!(log.latest_id(), 2);
    }

    #[test]
    fn test_eviction_keeps_ids_increasing() {
        let log = EventLog::new(3);
        for i in 0..5 {
            log.append(i);
        }
        let ids: Vec<u64> = log.recent(10).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_newer_than_with_limit() {
        let log = EventLog::new(50);
        for i in 0..20 {
            log.append(i);
        }

        let page = log.newer_than(15, 100);
        assert_eq!(page.events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![16, 17, 18, 19, 20]);
        assert_eq!(page.latest_event_id, 20);

        // limit keeps the newest events
        let page = log.newer_than(0, 2);
        assert_eq!(page.events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![19, 20]);

        assert!(log.newer_than(20, 10).events.is_empty());
    }
}
