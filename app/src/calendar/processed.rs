use std::collections::HashSet;

use crate::core::time::{DateTime, Duration};

use super::CalendarEvent;

type EventKey = (String, DateTime);

/// Remembers which (event id, start time) pairs already acted, separately
/// for away and alarm handling since one event may carry both directives.
/// Old entries are purged after the retention window.
#[derive(Debug)]
pub struct ProcessedEvents {
    away: HashSet<EventKey>,
    alarm: HashSet<EventKey>,
    retention: Duration,
}

impl ProcessedEvents {
    pub fn new(retention: Duration) -> Self {
        Self {
            away: HashSet::new(),
            alarm: HashSet::new(),
            retention,
        }
    }

    pub fn contains_away(&self, event: &CalendarEvent) -> bool {
        self.away.contains(&key(event))
    }

    pub fn mark_away(&mut self, event: &CalendarEvent) {
        self.away.insert(key(event));
    }

    pub fn contains_alarm(&self, event: &CalendarEvent) -> bool {
        self.alarm.contains(&key(event))
    }

    pub fn mark_alarm(&mut self, event: &CalendarEvent) {
        self.alarm.insert(key(event));
    }

    pub fn purge(&mut self, now: DateTime) {
        let cutoff = now - self.retention;
        self.away.retain(|(_, start)| *start >= cutoff);
        self.alarm.retain(|(_, start)| *start >= cutoff);
    }
}

fn key(event: &CalendarEvent) -> EventKey {
    (event.id.clone(), event.start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::t;

    fn event(id: &str, start: DateTime) -> CalendarEvent {
        CalendarEvent {
            id: id.to_string(),
            summary: "[ALARM] test".to_string(),
            start,
        }
    }

    fn now() -> DateTime {
        DateTime::from_iso("2026-05-01T12:00:00Z").unwrap()
    }

    #[test]
    fn test_same_start_processed_once() {
        let mut processed = ProcessedEvents::new(t!(6 hours));
        let event = event("e1", now());

        assert!(!processed.contains_alarm(&event));
        processed.mark_alarm(&event);
        assert!(processed.contains_alarm(&event));
    }

    #[test]
    fn test_new_start_time_is_new_key() {
        let mut processed = ProcessedEvents::new(t!(6 hours));

        processed.mark_alarm(&event("e1", now()));

        assert!(!processed.contains_alarm(&event("e1", now() + t!(24 hours))));
    }

    #[test]
    fn test_away_and_alarm_tracked_independently() {
        let mut processed = ProcessedEvents::new(t!(6 hours));
        let event = event("e1", now());

        processed.mark_away(&event);

        assert!(processed.contains_away(&event));
        assert!(!processed.contains_alarm(&event));
    }

    #[test]
    fn test_purge_drops_old_entries_only() {
        let mut processed = ProcessedEvents::new(t!(6 hours));
        let old = event("old", now() - t!(7 hours));
        let recent = event("recent", now() - t!(1 hours));

        processed.mark_alarm(&old);
        processed.mark_alarm(&recent);
        processed.purge(now());

        assert!(!processed.contains_alarm(&old));
        assert!(processed.contains_alarm(&recent));
    }
}
