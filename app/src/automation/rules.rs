use serde::Deserialize;

use crate::core::time::Duration;

/// Threshold configuration for the periodic rules. Each actuator carries two
/// thresholds so its state holds steady between them (hysteresis).
#[derive(Debug, Deserialize, Clone)]
pub struct RulesSettings {
    pub tick_interval: Duration,
    pub fan_on_temperature: f64,
    pub fan_off_temperature: f64,
    pub window_open_humidity: f64,
    pub window_close_humidity: f64,
    pub light_on_below: i64,
    pub light_off_above: i64,
}

#[derive(Debug, Clone)]
pub struct RuleSet {
    fan_on: f64,
    fan_off: f64,
    window_open: f64,
    window_close: f64,
    light_low: i64,
    light_high: i64,
}

impl RuleSet {
    pub fn new(settings: &RulesSettings) -> anyhow::Result<Self> {
        if settings.fan_on_temperature < settings.fan_off_temperature {
            anyhow::bail!(
                "Fan on-threshold {} must not be below off-threshold {}",
                settings.fan_on_temperature,
                settings.fan_off_temperature
            );
        }
        if settings.fan_on_temperature == settings.fan_off_temperature {
            tracing::warn!(
                "Fan thresholds are equal ({}), hysteresis is disabled and the fan may oscillate",
                settings.fan_on_temperature
            );
        }

        if settings.window_open_humidity < settings.window_close_humidity {
            anyhow::bail!(
                "Window open-threshold {} must not be below close-threshold {}",
                settings.window_open_humidity,
                settings.window_close_humidity
            );
        }

        if settings.light_on_below > settings.light_off_above {
            anyhow::bail!(
                "Light on-threshold {} must not be above off-threshold {}",
                settings.light_on_below,
                settings.light_off_above
            );
        }

        Ok(Self {
            fan_on: settings.fan_on_temperature,
            fan_off: settings.fan_off_temperature,
            window_open: settings.window_open_humidity,
            window_close: settings.window_close_humidity,
            light_low: settings.light_on_below,
            light_high: settings.light_off_above,
        })
    }

    pub fn desired_fan(&self, currently_on: bool, temperature: f64) -> bool {
        if temperature > self.fan_on {
            true
        } else if temperature <= self.fan_off {
            false
        } else {
            currently_on
        }
    }

    /// Opening requires somebody at home; closing never does.
    pub fn desired_window(&self, currently_open: bool, humidity: f64, at_home: bool) -> bool {
        if humidity > self.window_open && at_home {
            true
        } else if humidity < self.window_close {
            false
        } else {
            currently_open
        }
    }

    pub fn desired_light(&self, currently_on: bool, light_level: i64) -> bool {
        if light_level < self.light_low {
            true
        } else if light_level > self.light_high {
            false
        } else {
            currently_on
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::t;

    pub fn test_settings() -> RulesSettings {
        RulesSettings {
            tick_interval: t!(2 seconds),
            fan_on_temperature: 25.0,
            fan_off_temperature: 24.0,
            window_open_humidity: 65.0,
            window_close_humidity: 60.0,
            light_on_below: 300,
            light_off_above: 700,
        }
    }

    fn rules() -> RuleSet {
        RuleSet::new(&test_settings()).unwrap()
    }

    #[test]
    fn test_fan_hysteresis_holds_between_thresholds() {
        let rules = rules();

        //off and between thresholds: stays off
        assert!(!rules.desired_fan(false, 24.5));
        //on and between thresholds: stays on
        assert!(rules.desired_fan(true, 24.5));

        assert!(rules.desired_fan(false, 25.1));
        assert!(!rules.desired_fan(true, 24.0));
    }

    #[test]
    fn test_fan_scenario_sequence() {
        let rules = rules();
        let mut on = false;

        for (temperature, expected) in [(20.0, false), (26.0, true), (23.0, false)] {
            on = rules.desired_fan(on, temperature);
            assert_eq!(on, expected, "after {} degrees", temperature);
        }
    }

    #[test]
    fn test_window_gated_by_presence_on_open_only() {
        let rules = rules();

        assert!(!rules.desired_window(false, 70.0, false));
        assert!(rules.desired_window(false, 70.0, true));

        //closing works regardless of presence
        assert!(!rules.desired_window(true, 50.0, false));
        assert!(!rules.desired_window(true, 50.0, true));
    }

    #[test]
    fn test_light_thresholds() {
        let rules = rules();

        assert!(rules.desired_light(false, 200));
        assert!(!rules.desired_light(true, 800));
        //dead band keeps current state
        assert!(rules.desired_light(true, 500));
        assert!(!rules.desired_light(false, 500));
    }

    #[test]
    fn test_inverted_fan_thresholds_rejected() {
        let mut settings = test_settings();
        settings.fan_on_temperature = 23.0;

        assert!(RuleSet::new(&settings).is_err());
    }

    #[test]
    fn test_equal_fan_thresholds_accepted() {
        let mut settings = test_settings();
        settings.fan_on_temperature = 24.0;

        assert!(RuleSet::new(&settings).is_ok());
    }
}
