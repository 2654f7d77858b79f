use infrastructure::{MqttInMessage, MqttOutMessage};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio_util::sync::CancellationToken;

use crate::{
    command::{CommandClient, DispatchOutcome},
    home::{ActuatorKind, CommandOrigin, CommandPayload, DEFAULT_BEEP_MS, TargetValue, WINDOW_OPEN_ANGLE},
};

use super::RPC_RESPONSE_PREFIX;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    params: Value,
}

/// Serves cloud RPC requests. Every request gets a response, errors
/// included; the request id is the last topic segment.
pub struct RpcRunner {
    request_rx: Receiver<MqttInMessage>,
    response_tx: Sender<MqttOutMessage>,
    command: CommandClient,
}

impl RpcRunner {
    pub fn new(request_rx: Receiver<MqttInMessage>, response_tx: Sender<MqttOutMessage>, command: CommandClient) -> Self {
        Self {
            request_rx,
            response_tx,
            command,
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        loop {
            tokio::select! {
                msg = self.request_rx.recv() => match msg {
                    Some(msg) => self.handle_request(&msg).await,
                    None => {
                        tracing::error!("RPC subscription closed");
                        return;
                    }
                },

                _ = token.cancelled() => {
                    tracing::info!("RPC listener stopping");
                    return;
                }
            }
        }
    }

    async fn handle_request(&self, msg: &MqttInMessage) {
        let Some(request_id) = msg.topic.rsplit('/').next() else {
            tracing::error!("RPC request without id on topic {}", msg.topic);
            return;
        };

        tracing::info!("RPC request {}: {}", request_id, msg.payload);

        let response = match self.process(&msg.payload).await {
            Ok(response) => response,
            Err(e) => json!({"status": "ERROR", "error": e.to_string()}),
        };

        let topic = format!("{}{}", RPC_RESPONSE_PREFIX, request_id);
        if let Err(e) = self
            .response_tx
            .send(MqttOutMessage::transient(topic, response.to_string()))
            .await
        {
            tracing::error!("Error queueing RPC response {}: {}", request_id, e);
        }
    }

    async fn process(&self, payload: &str) -> anyhow::Result<Value> {
        let request: RpcRequest = serde_json::from_str(payload)?;

        match request.method.as_str() {
            "setLedState" => self.set_switch(ActuatorKind::Light, &request.params, "led_state_set_to").await,
            "setFanState" => self.set_switch(ActuatorKind::Fan, &request.params, "fan_state_set_to").await,
            "setBuzzerState" => {
                self.set_switch(ActuatorKind::Buzzer, &request.params, "buzzer_state_set_to")
                    .await
            }
            "setWindowAngle" => self.set_window_angle(&request.params).await,
            "beepBuzzer" => self.beep(&request.params).await,
            other => anyhow::bail!("Unknown method {:?}", other),
        }
    }

    async fn set_switch(&self, kind: ActuatorKind, params: &Value, response_key: &str) -> anyhow::Result<Value> {
        let value = TargetValue::parse(kind, params, None)?;
        let outcome = self
            .command
            .apply(CommandOrigin::Rpc, CommandPayload::Actuator { kind, value })
            .await?;

        match outcome {
            DispatchOutcome::Applied { active, .. } => Ok(json!({"status": "OK", response_key: active})),
            other => anyhow::bail!("Unexpected dispatch outcome {:?}", other),
        }
    }

    async fn set_window_angle(&self, params: &Value) -> anyhow::Result<Value> {
        let value = TargetValue::parse(ActuatorKind::Window, params, None)?;
        let angle = match value {
            TargetValue::Angle(angle) => angle,
            TargetValue::Switch(true) => WINDOW_OPEN_ANGLE,
            TargetValue::Switch(false) => 0,
            other => anyhow::bail!("Invalid window angle parameter {:?}", other),
        };

        self.command
            .apply(
                CommandOrigin::Rpc,
                CommandPayload::Actuator {
                    kind: ActuatorKind::Window,
                    value,
                },
            )
            .await?;

        Ok(json!({"status": "OK", "window_angle_set_to": angle}))
    }

    async fn beep(&self, params: &Value) -> anyhow::Result<Value> {
        let duration_ms = match params {
            Value::Null => DEFAULT_BEEP_MS,
            Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| anyhow::anyhow!("Invalid beep duration {}", n))?,
            other => anyhow::bail!("Invalid beep duration {}", other),
        };

        self.command
            .apply(
                CommandOrigin::Rpc,
                CommandPayload::Actuator {
                    kind: ActuatorKind::Buzzer,
                    value: TargetValue::Beep { duration_ms },
                },
            )
            .await?;

        Ok(json!({"status": "OK", "beep_duration_ms": duration_ms}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::cloud::TelemetrySink;
    use crate::adapter::device::DeviceHandle;
    use crate::automation::rules::{RuleSet, RulesSettings};
    use crate::command::{CommandModule, StatusPublisher};
    use crate::t;
    use assert_json_diff::assert_json_eq;
    use tokio::sync::mpsc;

    struct TestRig {
        runner: RpcRunner,
        device_rx: mpsc::Receiver<String>,
        response_rx: mpsc::Receiver<MqttOutMessage>,
        _peer_rx: mpsc::Receiver<MqttOutMessage>,
        _cloud_rx: mpsc::Receiver<MqttOutMessage>,
    }

    fn new_rig() -> TestRig {
        let (device_tx, device_rx) = mpsc::channel(32);
        let (peer_tx, _peer_rx) = mpsc::channel(32);
        let (cloud_tx, _cloud_rx) = mpsc::channel(32);
        let (response_tx, response_rx) = mpsc::channel(32);
        let (_request_tx, request_rx) = mpsc::channel(32);

        let rules = RuleSet::new(&RulesSettings {
            tick_interval: t!(2 seconds),
            fan_on_temperature: 25.0,
            fan_off_temperature: 24.0,
            window_open_humidity: 65.0,
            window_close_humidity: 60.0,
            light_on_below: 300,
            light_off_above: 700,
        })
        .unwrap();

        let command = CommandModule::new(
            DeviceHandle::new(device_tx),
            StatusPublisher::new(peer_tx, "home/edge1/status", TelemetrySink::new(cloud_tx)),
            rules,
            t!(60 seconds),
        );

        TestRig {
            runner: RpcRunner::new(request_rx, response_tx, command.client()),
            device_rx,
            response_rx,
            _peer_rx,
            _cloud_rx,
        }
    }

    fn request(id: &str, payload: &str) -> MqttInMessage {
        MqttInMessage {
            topic: format!("v1/devices/me/rpc/request/{}", id),
            payload: payload.to_string(),
        }
    }

    async fn response_json(rig: &mut TestRig) -> (String, serde_json::Value) {
        let msg = rig.response_rx.try_recv().expect("No RPC response queued");
        (msg.topic, serde_json::from_str(&msg.payload).unwrap())
    }

    #[tokio::test]
    async fn test_set_led_state() {
        let mut rig = new_rig();

        rig.runner
            .handle_request(&request("17", r#"{"method":"setLedState","params":true}"#))
            .await;

        let (topic, response) = response_json(&mut rig).await;
        assert_eq!(topic, "v1/devices/me/rpc/response/17");
        assert_json_eq!(response, json!({"status": "OK", "led_state_set_to": true}));
        assert_eq!(rig.device_rx.try_recv().unwrap(), "LED:ON");
    }

    #[tokio::test]
    async fn test_no_op_still_acknowledged() {
        let mut rig = new_rig();

        //light starts off, switching it off changes nothing
        rig.runner
            .handle_request(&request("1", r#"{"method":"setLedState","params":false}"#))
            .await;

        let (_, response) = response_json(&mut rig).await;
        assert_json_eq!(response, json!({"status": "OK", "led_state_set_to": false}));
        assert!(rig.device_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_set_window_angle_symbolic_and_numeric() {
        let mut rig = new_rig();

        rig.runner
            .handle_request(&request("2", r#"{"method":"setWindowAngle","params":"OPEN"}"#))
            .await;
        let (_, response) = response_json(&mut rig).await;
        assert_json_eq!(response, json!({"status": "OK", "window_angle_set_to": 90}));

        rig.runner
            .handle_request(&request("3", r#"{"method":"setWindowAngle","params":30}"#))
            .await;
        let (_, response) = response_json(&mut rig).await;
        assert_json_eq!(response, json!({"status": "OK", "window_angle_set_to": 30}));

        assert_eq!(rig.device_rx.try_recv().unwrap(), "WINDOW:90");
        assert_eq!(rig.device_rx.try_recv().unwrap(), "WINDOW:30");
    }

    #[tokio::test]
    async fn test_invalid_angle_returns_error_response() {
        let mut rig = new_rig();

        rig.runner
            .handle_request(&request("4", r#"{"method":"setWindowAngle","params":"sideways"}"#))
            .await;

        let (_, response) = response_json(&mut rig).await;
        assert_eq!(response["status"], "ERROR");
        assert!(rig.device_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_method_returns_error_response() {
        let mut rig = new_rig();

        rig.runner
            .handle_request(&request("5", r#"{"method":"makeCoffee"}"#))
            .await;

        let (_, response) = response_json(&mut rig).await;
        assert_eq!(response["status"], "ERROR");
    }

    #[tokio::test]
    async fn test_beep_buzzer_with_default_duration() {
        let mut rig = new_rig();

        rig.runner
            .handle_request(&request("6", r#"{"method":"beepBuzzer"}"#))
            .await;

        let (_, response) = response_json(&mut rig).await;
        assert_json_eq!(response, json!({"status": "OK", "beep_duration_ms": 2000}));
        assert_eq!(rig.device_rx.try_recv().unwrap(), "BUZZER_BEEP:2000");
    }

    #[tokio::test]
    async fn test_beep_buzzer_with_explicit_duration() {
        let mut rig = new_rig();

        rig.runner
            .handle_request(&request("7", r#"{"method":"beepBuzzer","params":750}"#))
            .await;

        let (_, response) = response_json(&mut rig).await;
        assert_json_eq!(response, json!({"status": "OK", "beep_duration_ms": 750}));
        assert_eq!(rig.device_rx.try_recv().unwrap(), "BUZZER_BEEP:750");
    }
}
