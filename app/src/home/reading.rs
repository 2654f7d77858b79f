use serde::{Deserialize, Serialize};

/// Most recent sensor values from the device, replaced wholesale on every
/// valid parse. Fields the device did not report stay unset.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(default, rename = "light", skip_serializing_if = "Option::is_none")]
    pub light_level: Option<i64>,
}

impl SensorReading {
    pub fn has_values(&self) -> bool {
        self.temperature.is_some() || self.humidity.is_some() || self.light_level.is_some()
    }

    /// The reading-history table only stores rows with all three values, as
    /// the original schema did.
    pub fn is_complete(&self) -> bool {
        self.temperature.is_some() && self.humidity.is_some() && self.light_level.is_some()
    }
}
