/// Occupancy flag derived from calendar AWAY events. Manual actuator
/// overrides never touch it.
#[derive(Debug, Clone)]
pub struct Presence {
    at_home: bool,
    baseline_published: bool,
}

impl Presence {
    pub fn new() -> Self {
        Self {
            at_home: true,
            baseline_published: false,
        }
    }

    pub fn at_home(&self) -> bool {
        self.at_home
    }

    /// Updates the flag and reports whether a publish is due. The first call
    /// always reports true so subscribers receive a baseline value on
    /// startup, even when nothing flipped.
    pub fn set(&mut self, at_home: bool) -> bool {
        let changed = !self.baseline_published || self.at_home != at_home;

        self.at_home = at_home;
        self.baseline_published = true;

        changed
    }
}

impl Default for Presence {
    fn default() -> Self {
        Self::new()
    }
}
