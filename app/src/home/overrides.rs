use std::collections::HashMap;

use crate::core::time::{DateTime, Duration};

use super::ActuatorKind;

/// Per-actuator suppression windows. While a window is armed, the rules
/// engine skips the actuator so a manual or inferred action is not undone by
/// the next evaluation tick.
///
/// Windows expire lazily when consulted; there is no timer per window.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    armed_until: HashMap<ActuatorKind, DateTime>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports whether the actuator is currently suppressed. A lapsed window
    /// is cleared on the way out.
    pub fn is_suppressed(&mut self, kind: ActuatorKind, now: DateTime) -> bool {
        match self.armed_until.get(&kind) {
            Some(expires_at) if now < *expires_at => true,
            Some(_) => {
                self.armed_until.remove(&kind);
                false
            }
            None => false,
        }
    }

    /// Arms the window unconditionally. Only one window per actuator exists,
    /// so re-arming replaces any previous one.
    pub fn arm(&mut self, kind: ActuatorKind, now: DateTime, duration: Duration) {
        self.armed_until.insert(kind, now + duration);
    }

    /// Clears the window. Manual intent always wins over a stale override
    /// left behind by an earlier automatic action.
    pub fn cancel(&mut self, kind: ActuatorKind) {
        self.armed_until.remove(&kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::t;

    fn at(iso: &str) -> DateTime {
        DateTime::from_iso(iso).unwrap()
    }

    #[test]
    fn test_not_suppressed_by_default() {
        let mut overrides = Overrides::new();

        assert!(!overrides.is_suppressed(ActuatorKind::Fan, at("2026-04-01T10:00:00Z")));
    }

    #[test]
    fn test_suppressed_within_window() {
        let mut overrides = Overrides::new();
        let t0 = at("2026-04-01T10:00:00Z");

        overrides.arm(ActuatorKind::Fan, t0, t!(60 seconds));

        assert!(overrides.is_suppressed(ActuatorKind::Fan, t0));
        assert!(overrides.is_suppressed(ActuatorKind::Fan, at("2026-04-01T10:00:59Z")));
    }

    #[test]
    fn test_lapsed_window_cleared_on_consult() {
        let mut overrides = Overrides::new();
        let t0 = at("2026-04-01T10:00:00Z");

        overrides.arm(ActuatorKind::Fan, t0, t!(60 seconds));

        //expiry boundary is inclusive
        assert!(!overrides.is_suppressed(ActuatorKind::Fan, at("2026-04-01T10:01:00Z")));
        //and the window stays cleared afterwards, even for earlier timestamps
        assert!(!overrides.is_suppressed(ActuatorKind::Fan, t0));
    }

    #[test]
    fn test_rearm_replaces_window() {
        let mut overrides = Overrides::new();

        overrides.arm(ActuatorKind::Light, at("2026-04-01T10:00:00Z"), t!(60 seconds));
        overrides.arm(ActuatorKind::Light, at("2026-04-01T10:00:30Z"), t!(60 seconds));

        assert!(overrides.is_suppressed(ActuatorKind::Light, at("2026-04-01T10:01:15Z")));
    }

    #[test]
    fn test_cancel_clears_window() {
        let mut overrides = Overrides::new();
        let t0 = at("2026-04-01T10:00:00Z");

        overrides.arm(ActuatorKind::Window, t0, t!(60 seconds));
        overrides.cancel(ActuatorKind::Window);

        assert!(!overrides.is_suppressed(ActuatorKind::Window, t0));
    }

    #[test]
    fn test_windows_are_per_actuator() {
        let mut overrides = Overrides::new();
        let t0 = at("2026-04-01T10:00:00Z");

        overrides.arm(ActuatorKind::Fan, t0, t!(60 seconds));

        assert!(overrides.is_suppressed(ActuatorKind::Fan, t0));
        assert!(!overrides.is_suppressed(ActuatorKind::Light, t0));
    }
}
