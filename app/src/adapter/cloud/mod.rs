mod rpc;

pub use rpc::RpcRunner;

use infrastructure::MqttOutMessage;
use tokio::sync::mpsc::Sender;

use crate::core::time::DateTime;

pub const TELEMETRY_TOPIC: &str = "v1/devices/me/telemetry";
pub const RPC_REQUEST_FILTER: &str = "v1/devices/me/rpc/request/+";
pub const RPC_RESPONSE_PREFIX: &str = "v1/devices/me/rpc/response/";

/// Publishes telemetry JSON objects to the cloud broker. Shared by the rules
/// engine, the command dispatcher, the device reader and the calendar
/// integration so every path emits the same wire format.
#[derive(Clone)]
pub struct TelemetrySink {
    tx: Sender<MqttOutMessage>,
}

impl TelemetrySink {
    pub fn new(tx: Sender<MqttOutMessage>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, values: serde_json::Value) -> anyhow::Result<()> {
        self.tx
            .send(MqttOutMessage::transient(TELEMETRY_TOPIC, values.to_string()))
            .await
            .map_err(|e| anyhow::anyhow!("Error queueing telemetry message: {}", e))
    }

    /// Batched form with an explicit timestamp, used for sensor readings.
    pub async fn send_at(&self, ts: DateTime, values: serde_json::Value) -> anyhow::Result<()> {
        self.send(serde_json::json!({
            "ts": ts.timestamp_millis(),
            "values": values,
        }))
        .await
    }
}
