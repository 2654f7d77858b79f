use config::{Config, ConfigError, Environment, File};
use infrastructure::{DatabaseConfig, MonitoringConfig, MqttConfig};
use serde::Deserialize;

use crate::{
    adapter::{device::DeviceLinkSettings, peer::PeerSettings},
    automation::RulesSettings,
    calendar::CalendarSettings,
    core::time::Duration,
};

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub monitoring: MonitoringConfig,
    pub peer_mqtt: MqttConfig,
    pub cloud_mqtt: MqttConfig,
    /// Reading history is optional; a controller without a database keeps
    /// everything else working.
    pub database: Option<DatabaseConfig>,
    pub device: DeviceLinkSettings,
    pub peer: PeerSettings,
    pub rules: RulesSettings,
    pub dispatch: DispatchSettings,
    /// Only the calendar-connected controller carries this section.
    pub calendar: Option<CalendarSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchSettings {
    pub override_duration: Duration,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name("config.toml"))
            .add_source(Environment::default().separator("_").list_separator(","));

        let s = builder.build()?;
        s.try_deserialize()
    }
}
