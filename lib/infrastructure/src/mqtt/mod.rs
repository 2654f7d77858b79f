mod client;

pub use client::Mqtt;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttInMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttOutMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl MqttOutMessage {
    pub fn transient(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    pub fn retained(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    port: u16,
    client_id: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl MqttConfig {
    pub fn new_client(&self) -> Mqtt {
        Mqtt::connect(
            &self.host,
            self.port,
            &self.client_id,
            self.username.as_deref(),
            self.password.as_deref(),
        )
    }
}
