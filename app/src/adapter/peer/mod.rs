use infrastructure::MqttInMessage;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;

use crate::{
    command::CommandClient,
    home::{CommandOrigin, CommandPayload, InferredEvent, TargetValue},
};

#[derive(Debug, Deserialize, Clone)]
pub struct PeerSettings {
    pub topic_prefix: String,
    pub controller_id: String,
    pub sibling_id: String,
}

impl PeerSettings {
    pub fn command_topic(&self) -> String {
        format!("{}/{}/cmd", self.topic_prefix, self.controller_id)
    }

    pub fn data_topic(&self) -> String {
        format!("{}/{}/data", self.topic_prefix, self.controller_id)
    }

    pub fn status_topic(&self) -> String {
        format!("{}/{}/status", self.topic_prefix, self.controller_id)
    }

    pub fn sibling_data_topic(&self) -> String {
        format!("{}/{}/data", self.topic_prefix, self.sibling_id)
    }

    pub fn presence_topic(&self) -> String {
        format!("{}/home/presence_status", self.topic_prefix)
    }
}

/// Listens on the peer broker for remote commands and for inferred events
/// forwarded by the sibling controller.
pub struct PeerRunner {
    command_rx: Receiver<MqttInMessage>,
    sibling_rx: Receiver<MqttInMessage>,
    command: CommandClient,
}

impl PeerRunner {
    pub fn new(command_rx: Receiver<MqttInMessage>, sibling_rx: Receiver<MqttInMessage>, command: CommandClient) -> Self {
        Self {
            command_rx,
            sibling_rx,
            command,
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        loop {
            tokio::select! {
                msg = self.command_rx.recv() => match msg {
                    Some(msg) => self.handle_command(&msg).await,
                    None => {
                        tracing::error!("Peer command subscription closed");
                        return;
                    }
                },

                msg = self.sibling_rx.recv() => match msg {
                    Some(msg) => self.handle_sibling_data(&msg).await,
                    None => {
                        tracing::error!("Sibling data subscription closed");
                        return;
                    }
                },

                _ = token.cancelled() => {
                    tracing::info!("Peer listener stopping");
                    return;
                }
            }
        }
    }

    async fn handle_command(&self, msg: &MqttInMessage) {
        let payload = match CommandPayload::parse(&msg.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Dropping malformed peer command {:?}: {:?}", msg.payload, e);
                return;
            }
        };

        if let Err(e) = self.command.apply(CommandOrigin::Remote, payload).await {
            tracing::error!("Error applying peer command {:?}: {:?}", msg.payload, e);
        }
    }

    async fn handle_sibling_data(&self, msg: &MqttInMessage) {
        let json: Value = match serde_json::from_str(&msg.payload) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("Dropping malformed sibling message {:?}: {}", msg.payload, e);
                return;
            }
        };

        //sibling sensor readings share the topic and are not for us
        let Some(event_type) = json.get("ir_event_type").and_then(Value::as_str) else {
            return;
        };

        let event = match InferredEvent::parse(event_type) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Dropping unknown inferred event {:?}: {:?}", event_type, e);
                return;
            }
        };

        let payload = CommandPayload::Actuator {
            kind: event.kind,
            value: TargetValue::Toggle,
        };

        if let Err(e) = self.command.apply(CommandOrigin::Sibling, payload).await {
            tracing::error!("Error applying inferred event {:?}: {:?}", event_type, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> PeerSettings {
        PeerSettings {
            topic_prefix: "iot_project/group7".to_string(),
            controller_id: "edge1".to_string(),
            sibling_id: "edge2".to_string(),
        }
    }

    #[test]
    fn test_topic_layout() {
        let settings = settings();

        assert_eq!(settings.command_topic(), "iot_project/group7/edge1/cmd");
        assert_eq!(settings.data_topic(), "iot_project/group7/edge1/data");
        assert_eq!(settings.status_topic(), "iot_project/group7/edge1/status");
        assert_eq!(settings.sibling_data_topic(), "iot_project/group7/edge2/data");
        assert_eq!(settings.presence_topic(), "iot_project/group7/home/presence_status");
    }
}
