pub mod protocol;

use std::collections::HashMap;
use std::io::{Read as _, Write as _};
use std::sync::Arc;

use infrastructure::MqttOutMessage;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{
    Mutex,
    mpsc::{self, Receiver, Sender},
};
use tokio_util::sync::CancellationToken;

use crate::{
    adapter::{cloud::TelemetrySink, db::ReadingRepository},
    core::resilience::ExponentialBackoff,
    home::{ActuatorKind, InferredEvent, SensorReading},
    t,
};

#[derive(Debug, Deserialize, Clone)]
pub struct DeviceLinkSettings {
    pub port: String,
    pub baud_rate: u32,
    /// IR code (hex string) to the actuator it toggles.
    #[serde(default)]
    pub ir_codes: HashMap<String, String>,
    /// Actuator toggled by the hardware button, if any.
    #[serde(default)]
    pub button_toggles: Option<String>,
}

/// Command handle of the device link. Sends are serialized through the
/// writer task's queue, so callers never contend on the physical port.
#[derive(Clone)]
pub struct DeviceHandle {
    tx: Sender<String>,
}

impl DeviceHandle {
    pub fn new(tx: Sender<String>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, command: impl Into<String>) -> anyhow::Result<()> {
        let command = command.into();
        self.tx
            .send(command)
            .await
            .map_err(|e| anyhow::anyhow!("Device writer is gone: {}", e))
    }
}

/// Most recent sensor values, replaced wholesale by the reader.
#[derive(Clone, Default)]
pub struct ReadingCache {
    inner: Arc<Mutex<Option<SensorReading>>>,
}

impl ReadingCache {
    pub async fn latest(&self) -> Option<SensorReading> {
        *self.inner.lock().await
    }

    async fn store(&self, reading: SensorReading) {
        *self.inner.lock().await = Some(reading);
    }
}

type SharedPort = Arc<std::sync::Mutex<Option<Box<dyn serialport::SerialPort>>>>;

pub struct DeviceRunner {
    settings: DeviceLinkSettings,
    command_tx: Sender<String>,
    command_rx: Option<Receiver<String>>,
    readings: ReadingCache,
    peer_tx: Sender<MqttOutMessage>,
    data_topic: String,
    telemetry: TelemetrySink,
    history: Option<ReadingRepository>,
    inputs: InputTracker,
}

impl DeviceRunner {
    pub fn new(
        settings: DeviceLinkSettings,
        peer_tx: Sender<MqttOutMessage>,
        data_topic: impl Into<String>,
        telemetry: TelemetrySink,
        history: Option<ReadingRepository>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);

        Self {
            settings,
            command_tx,
            command_rx: Some(command_rx),
            readings: ReadingCache::default(),
            peer_tx,
            data_topic: data_topic.into(),
            telemetry,
            history,
            inputs: InputTracker::default(),
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle::new(self.command_tx.clone())
    }

    pub fn readings(&self) -> ReadingCache {
        self.readings.clone()
    }

    pub async fn run(mut self, token: CancellationToken) {
        let port_slot: SharedPort = Arc::new(std::sync::Mutex::new(None));

        let command_rx = self.command_rx.take().expect("Device runner started twice");
        let writer = tokio::task::spawn_blocking({
            let port_slot = port_slot.clone();
            move || write_loop(command_rx, port_slot)
        });

        let mut backoff = ExponentialBackoff::new(t!(1 seconds), t!(30 seconds));

        while !token.is_cancelled() {
            let port = {
                let path = self.settings.port.clone();
                let baud_rate = self.settings.baud_rate;
                tokio::task::spawn_blocking(move || open_port(&path, baud_rate)).await
            };

            match port {
                Ok(Ok(port)) => {
                    tracing::info!("Connected to device on {}", self.settings.port);
                    backoff.reset();
                    self.process_connection(port, &port_slot, &token).await;
                    *port_slot.lock().expect("Poisoned device port lock") = None;
                }
                Ok(Err(e)) => {
                    tracing::warn!("Error connecting to device on {}: {}", self.settings.port, e);
                }
                Err(e) => {
                    tracing::error!("Device connect task failed: {}", e);
                }
            }

            if token.is_cancelled() {
                break;
            }

            backoff.bump();
            tokio::select! {
                _ = tokio::time::sleep(backoff.next_delay().into()) => {}
                _ = token.cancelled() => {}
            }
        }

        writer.abort();
        tracing::info!("Device link stopped");
    }

    async fn process_connection(
        &mut self,
        port: Box<dyn serialport::SerialPort>,
        port_slot: &SharedPort,
        token: &CancellationToken,
    ) {
        match port.try_clone() {
            Ok(write_half) => {
                *port_slot.lock().expect("Poisoned device port lock") = Some(write_half);
            }
            Err(e) => {
                tracing::warn!("Error cloning device port for writing: {}", e);
                return;
            }
        }

        let (line_tx, mut line_rx) = mpsc::channel::<String>(32);
        let reader = tokio::task::spawn_blocking({
            let token = token.clone();
            move || read_loop(port, line_tx, token)
        });

        //the reader drops line_tx when the connection dies
        while let Some(line) = line_rx.recv().await {
            self.handle_line(&line).await;
        }

        if let Err(e) = reader.await {
            tracing::error!("Device reader task failed: {}", e);
        }
    }

    async fn handle_line(&mut self, line: &str) {
        let json: Value = match serde_json::from_str(line) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("Dropping malformed device line {:?}: {}", line, e);
                return;
            }
        };

        if let Some(error) = json.get("error").and_then(Value::as_str) {
            tracing::warn!("Device reported error: {}", error);
            return;
        }

        if let Some(event) = self.inputs.track(&json, &self.settings) {
            self.forward_inferred_event(event).await;
            return;
        }

        let reading: SensorReading = match serde_json::from_value(json) {
            Ok(reading) => reading,
            Err(e) => {
                tracing::warn!("Dropping unreadable sensor line {:?}: {}", line, e);
                return;
            }
        };

        if reading.has_values() {
            self.publish_reading(reading).await;
        }
    }

    async fn publish_reading(&self, reading: SensorReading) {
        self.readings.store(reading).await;

        let values = match serde_json::to_value(reading) {
            Ok(values) => values,
            Err(e) => {
                tracing::error!("Error serializing sensor reading: {}", e);
                return;
            }
        };

        if let Err(e) = self
            .peer_tx
            .send(MqttOutMessage::transient(self.data_topic.clone(), values.to_string()))
            .await
        {
            tracing::error!("Error queueing sensor reading for peer bus: {}", e);
        }

        if let Err(e) = self.telemetry.send_at(t!(now), values).await {
            tracing::error!("Error queueing sensor reading telemetry: {}", e);
        }

        if let Some(history) = &self.history
            && reading.is_complete()
            && let Err(e) = history.insert(&reading, t!(now)).await
        {
            tracing::error!("Error persisting sensor reading: {:?}", e);
        }
    }

    async fn forward_inferred_event(&self, event: InferredEvent) {
        tracing::info!("Forwarding inferred event {} to sibling", event.event_type());

        let payload = serde_json::json!({ "ir_event_type": event.event_type() });
        if let Err(e) = self
            .peer_tx
            .send(MqttOutMessage::transient(self.data_topic.clone(), payload.to_string()))
            .await
        {
            tracing::error!("Error queueing inferred event: {}", e);
        }
    }
}

/// Edge detection and deduplication for device input lines.
#[derive(Debug, Default)]
struct InputTracker {
    last_ir_code: Option<String>,
    last_button_state: Option<i64>,
}

impl InputTracker {
    fn track(&mut self, json: &Value, settings: &DeviceLinkSettings) -> Option<InferredEvent> {
        //semantic actions pass through as-is
        for key in ["ir_action", "button_action"] {
            if let Some(action) = json.get(key).and_then(Value::as_str) {
                return match InferredEvent::parse(action) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        tracing::warn!("Dropping unknown device action {:?}: {}", action, e);
                        None
                    }
                };
            }
        }

        if let Some(code) = json.get("ir_code").and_then(Value::as_str) {
            //repeat frames of the same code are not new presses
            if self.last_ir_code.as_deref() != Some(code) {
                self.last_ir_code = Some(code.to_string());
                return self.ir_event(code, settings);
            }
            return None;
        }

        if let Some(state) = json.get("button_state").and_then(Value::as_i64) {
            let rising_edge = state == 1 && self.last_button_state != Some(1);
            self.last_button_state = Some(state);

            if rising_edge {
                return settings
                    .button_toggles
                    .as_deref()
                    .and_then(|actuator| match ActuatorKind::parse(actuator) {
                        Ok(kind) => Some(InferredEvent { kind }),
                        Err(e) => {
                            tracing::warn!("Invalid button_toggles setting: {}", e);
                            None
                        }
                    });
            }
            return None;
        }

        None
    }

    fn ir_event(&self, code: &str, settings: &DeviceLinkSettings) -> Option<InferredEvent> {
        let code = code.to_uppercase();
        let actuator = settings
            .ir_codes
            .iter()
            .find(|(configured, _)| configured.to_uppercase() == code)
            .map(|(_, actuator)| actuator);

        match actuator {
            Some(actuator) => match ActuatorKind::parse(actuator) {
                Ok(kind) => Some(InferredEvent { kind }),
                Err(e) => {
                    tracing::warn!("Invalid ir_codes mapping for {}: {}", code, e);
                    None
                }
            },
            None => {
                tracing::debug!("IR code {} not mapped to an action", code);
                None
            }
        }
    }
}

fn open_port(path: &str, baud_rate: u32) -> anyhow::Result<Box<dyn serialport::SerialPort>> {
    let port = serialport::new(path, baud_rate)
        .timeout(std::time::Duration::from_millis(250))
        .open()?;
    Ok(port)
}

fn read_loop(mut port: Box<dyn serialport::SerialPort>, line_tx: Sender<String>, token: CancellationToken) {
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 256];

    while !token.is_cancelled() {
        match port.read(&mut chunk) {
            Ok(0) => {
                tracing::warn!("Device link returned EOF, reconnecting");
                return;
            }
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);

                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = pending.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).trim().to_string();

                    if !line.is_empty() && line_tx.blocking_send(line).is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                //idle link, loop around and check for cancellation
            }
            Err(e) => {
                tracing::warn!("Serial read failed: {}. Reconnecting", e);
                return;
            }
        }
    }
}

fn write_loop(mut command_rx: Receiver<String>, port_slot: SharedPort) {
    while let Some(command) = command_rx.blocking_recv() {
        let mut slot = port_slot.lock().expect("Poisoned device port lock");

        match slot.as_mut() {
            Some(port) => {
                tracing::debug!("Sending device command {:?}", command);
                if let Err(e) = port.write_all(format!("{}\n", command).as_bytes()) {
                    tracing::warn!("Error writing device command {:?}: {}", command, e);
                }
            }
            None => {
                tracing::warn!("Device not connected, dropping command {:?}", command);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings() -> DeviceLinkSettings {
        DeviceLinkSettings {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            ir_codes: HashMap::from([
                ("0xFF629D".to_string(), "LIGHT".to_string()),
                ("0xFFA25D".to_string(), "FAN".to_string()),
            ]),
            button_toggles: Some("LIGHT".to_string()),
        }
    }

    #[test]
    fn test_ir_code_maps_to_toggle_once_per_press() {
        let mut inputs = InputTracker::default();
        let settings = settings();

        let event = inputs.track(&json!({"ir_code": "0xff629d"}), &settings);
        assert_eq!(
            event,
            Some(InferredEvent {
                kind: ActuatorKind::Light
            })
        );

        //repeat frame of the held button
        assert_eq!(inputs.track(&json!({"ir_code": "0xff629d"}), &settings), None);

        //a different code is a new press
        assert_eq!(
            inputs.track(&json!({"ir_code": "0xFFA25D"}), &settings),
            Some(InferredEvent {
                kind: ActuatorKind::Fan
            })
        );
    }

    #[test]
    fn test_unmapped_ir_code_ignored() {
        let mut inputs = InputTracker::default();

        assert_eq!(inputs.track(&json!({"ir_code": "0xDEAD"}), &settings()), None);
    }

    #[test]
    fn test_button_rising_edge_toggles() {
        let mut inputs = InputTracker::default();
        let settings = settings();

        assert_eq!(
            inputs.track(&json!({"button_state": 1}), &settings),
            Some(InferredEvent {
                kind: ActuatorKind::Light
            })
        );
        //held down, then released, then pressed again
        assert_eq!(inputs.track(&json!({"button_state": 1}), &settings), None);
        assert_eq!(inputs.track(&json!({"button_state": 0}), &settings), None);
        assert!(inputs.track(&json!({"button_state": 1}), &settings).is_some());
    }

    #[test]
    fn test_semantic_action_passes_through() {
        let mut inputs = InputTracker::default();

        assert_eq!(
            inputs.track(&json!({"ir_action": "toggle_fan"}), &settings()),
            Some(InferredEvent {
                kind: ActuatorKind::Fan
            })
        );
        assert_eq!(inputs.track(&json!({"ir_action": "warp_drive"}), &settings()), None);
    }

    #[test]
    fn test_sensor_lines_are_not_input_events() {
        let mut inputs = InputTracker::default();

        assert_eq!(
            inputs.track(&json!({"temperature": 21.5, "humidity": 60.0}), &settings()),
            None
        );
    }
}
