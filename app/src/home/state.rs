use std::collections::HashMap;

use crate::core::time::DateTime;

use super::ActuatorKind;

#[derive(Debug, Clone, Copy, Default)]
struct ActuatorRecord {
    active: bool,
    last_changed: Option<DateTime>,
}

/// Last-commanded state of every actuator. All actuators start inactive;
/// a restart deliberately resets to this safe default.
///
/// Not synchronized on its own. The command service wraps it, together with
/// the override windows, in a single mutex.
#[derive(Debug, Clone, Default)]
pub struct ActuatorStates {
    records: HashMap<ActuatorKind, ActuatorRecord>,
    window_angle: u8,
}

impl ActuatorStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, kind: ActuatorKind) -> bool {
        self.records.get(&kind).map(|r| r.active).unwrap_or(false)
    }

    pub fn window_angle(&self) -> u8 {
        self.window_angle
    }

    pub fn last_changed(&self, kind: ActuatorKind) -> Option<DateTime> {
        self.records.get(&kind).and_then(|r| r.last_changed)
    }

    /// Records the new active state and reports whether it differed from the
    /// previous one. Callers use the result to suppress redundant device
    /// writes and telemetry.
    pub fn set_active(&mut self, kind: ActuatorKind, active: bool, now: DateTime) -> bool {
        let record = self.records.entry(kind).or_default();

        if record.active == active {
            return false;
        }

        record.active = active;
        record.last_changed = Some(now);
        true
    }

    /// Stores the window angle and derives the open/closed state from it.
    /// Returns whether the derived boolean flipped; the angle itself is
    /// updated unconditionally.
    pub fn set_window_angle(&mut self, angle: u8, now: DateTime) -> bool {
        self.window_angle = angle;
        self.set_active(ActuatorKind::Window, angle > 0, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime {
        DateTime::from_iso("2026-04-01T10:00:00Z").unwrap()
    }

    #[test]
    fn test_starts_inactive() {
        let states = ActuatorStates::new();

        for kind in ActuatorKind::variants() {
            assert!(!states.is_active(kind));
            assert_eq!(states.last_changed(kind), None);
        }
        assert_eq!(states.window_angle(), 0);
    }

    #[test]
    fn test_set_reports_change_only_on_transition() {
        let mut states = ActuatorStates::new();

        assert!(states.set_active(ActuatorKind::Fan, true, now()));
        assert!(!states.set_active(ActuatorKind::Fan, true, now()));
        assert!(states.set_active(ActuatorKind::Fan, false, now()));
    }

    #[test]
    fn test_window_angle_derives_boolean() {
        let mut states = ActuatorStates::new();

        assert!(states.set_window_angle(45, now()));
        assert!(states.is_active(ActuatorKind::Window));

        //angle changes, derived state does not
        assert!(!states.set_window_angle(90, now()));
        assert_eq!(states.window_angle(), 90);

        assert!(states.set_window_angle(0, now()));
        assert!(!states.is_active(ActuatorKind::Window));
    }

    #[test]
    fn test_last_changed_tracks_transitions() {
        let mut states = ActuatorStates::new();
        let t0 = now();

        states.set_active(ActuatorKind::Light, true, t0);
        assert_eq!(states.last_changed(ActuatorKind::Light), Some(t0));

        let t1 = DateTime::from_iso("2026-04-01T11:00:00Z").unwrap();
        states.set_active(ActuatorKind::Light, true, t1);
        assert_eq!(states.last_changed(ActuatorKind::Light), Some(t0));
    }
}
