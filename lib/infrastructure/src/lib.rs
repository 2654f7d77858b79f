mod db;
mod monitoring;
mod mqtt;

pub use db::DatabaseConfig;
pub use monitoring::MonitoringConfig;
pub use mqtt::{Mqtt, MqttConfig, MqttInMessage, MqttOutMessage};
