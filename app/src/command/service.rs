use infrastructure::MqttOutMessage;
use tokio::sync::{Mutex, mpsc::Sender};

use crate::{
    adapter::{cloud::TelemetrySink, device::DeviceHandle, device::protocol},
    automation::rules::RuleSet,
    core::time::{DateTime, Duration},
    home::{
        ActuatorKind, ActuatorStates, CommandOrigin, CommandPayload, Overrides, SensorReading, TargetValue,
        WINDOW_OPEN_ANGLE,
    },
    t,
};

/// Arbitration surface for every actuator mutation. Commands from all
/// origins and the periodic rules tick funnel through the same lock and the
/// same publish primitive, so no two paths can race the store or emit
/// duplicate telemetry for one change.
pub struct CommandService {
    state: Mutex<ControlState>,
    device: DeviceHandle,
    status: StatusPublisher,
    rules: RuleSet,
    override_duration: Duration,
}

/// Actuator states and override windows share one lock: the rules tick reads
/// one while conditionally writing the other, and that has to be atomic.
#[derive(Default)]
struct ControlState {
    actuators: ActuatorStates,
    overrides: Overrides,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DispatchOutcome {
    Applied { kind: ActuatorKind, active: bool, changed: bool },
    Beeped { duration_ms: u64 },
    Raw,
}

impl CommandService {
    pub fn new(device: DeviceHandle, status: StatusPublisher, rules: RuleSet, override_duration: Duration) -> Self {
        Self {
            state: Mutex::new(ControlState::default()),
            device,
            status,
            rules,
            override_duration,
        }
    }

    pub async fn apply(&self, origin: CommandOrigin, payload: CommandPayload) -> anyhow::Result<DispatchOutcome> {
        match payload {
            CommandPayload::Actuator { kind, value } => self.apply_actuator(origin, kind, value).await,
            CommandPayload::Raw { command } => self.apply_raw(origin, command).await,
        }
    }

    async fn apply_actuator(
        &self,
        origin: CommandOrigin,
        kind: ActuatorKind,
        value: TargetValue,
    ) -> anyhow::Result<DispatchOutcome> {
        let now = t!(now);
        let mut state = self.state.lock().await;
        let mut delta = StatusDelta::default();

        self.reconcile_override(&mut state, origin, kind, now);

        let outcome = match value {
            TargetValue::Beep { duration_ms } => {
                //one-shot, leaves the stored state alone
                self.device.send(protocol::beep_command(duration_ms)).await?;
                DispatchOutcome::Beeped { duration_ms }
            }
            TargetValue::Angle(angle) => {
                //angle granularity is finer than the stored boolean, so the
                //device write happens even when open/closed does not flip
                self.device.send(protocol::window_command(angle)).await?;
                let changed = state.actuators.set_window_angle(angle, now);
                if changed {
                    delta.record(kind, angle > 0);
                }
                DispatchOutcome::Applied {
                    kind,
                    active: angle > 0,
                    changed,
                }
            }
            TargetValue::Switch(_) | TargetValue::Toggle => {
                let target = match value {
                    TargetValue::Toggle => !state.actuators.is_active(kind),
                    TargetValue::Switch(on) => on,
                    _ => unreachable!(),
                };

                let changed = state.actuators.is_active(kind) != target;
                if changed {
                    self.switch_actuator(&mut state, kind, target, now).await?;
                    delta.record(kind, target);
                }
                DispatchOutcome::Applied {
                    kind,
                    active: target,
                    changed,
                }
            }
        };

        tracing::info!("Command from {} origin for {}: {:?}", origin, kind, outcome);
        self.status.publish(delta).await?;

        Ok(outcome)
    }

    async fn apply_raw(&self, origin: CommandOrigin, command: String) -> anyhow::Result<DispatchOutcome> {
        let now = t!(now);
        let mut state = self.state.lock().await;
        let mut delta = StatusDelta::default();

        self.device.send(command.clone()).await?;

        //keep the store truthful for raw lines with a recognized effect
        for (kind, value) in protocol::infer_updates(&command) {
            self.reconcile_override(&mut state, origin, kind, now);

            let changed = match value {
                TargetValue::Angle(angle) => state.actuators.set_window_angle(angle, now),
                TargetValue::Switch(on) => state.actuators.set_active(kind, on, now),
                _ => false,
            };

            if changed {
                delta.record(kind, state.actuators.is_active(kind));
            }
        }

        tracing::info!("Raw command from {} origin: {:?}", origin, command);
        self.status.publish(delta).await?;

        Ok(DispatchOutcome::Raw)
    }

    /// One evaluation pass over all sensor-driven rules. Suppressed or
    /// unreadable actuators are skipped; everything that actually changed is
    /// published as a single batched delta.
    pub async fn run_rules_tick(&self, reading: &SensorReading, at_home: bool) -> anyhow::Result<()> {
        let now = t!(now);
        let mut state = self.state.lock().await;
        let mut delta = StatusDelta::default();

        if let Some(temperature) = reading.temperature {
            let kind = ActuatorKind::Fan;
            if !state.overrides.is_suppressed(kind, now) {
                let current = state.actuators.is_active(kind);
                let desired = self.rules.desired_fan(current, temperature);
                if desired != current {
                    tracing::info!("Rule: temperature {} switches fan {}", temperature, on_off(desired));
                    self.switch_actuator(&mut state, kind, desired, now).await?;
                    delta.record(kind, desired);
                }
            }
        }

        if let Some(humidity) = reading.humidity {
            let kind = ActuatorKind::Window;
            if !state.overrides.is_suppressed(kind, now) {
                let current = state.actuators.is_active(kind);
                let desired = self.rules.desired_window(current, humidity, at_home);
                if desired != current {
                    tracing::info!("Rule: humidity {} moves window {}", humidity, on_off(desired));
                    self.switch_actuator(&mut state, kind, desired, now).await?;
                    delta.record(kind, desired);
                }
            }
        }

        if let Some(light_level) = reading.light_level {
            let kind = ActuatorKind::Light;
            if !state.overrides.is_suppressed(kind, now) {
                let current = state.actuators.is_active(kind);
                let desired = self.rules.desired_light(current, light_level);
                if desired != current {
                    tracing::info!("Rule: light level {} switches light {}", light_level, on_off(desired));
                    self.switch_actuator(&mut state, kind, desired, now).await?;
                    delta.record(kind, desired);
                }
            }
        }

        self.status.publish(delta).await
    }

    fn reconcile_override(&self, state: &mut ControlState, origin: CommandOrigin, kind: ActuatorKind, now: DateTime) {
        if origin.arms_override() {
            //an inferred action must not be undone by the next rules tick
            state.overrides.arm(kind, now, self.override_duration);
        } else {
            state.overrides.cancel(kind);
        }
    }

    async fn switch_actuator(
        &self,
        state: &mut ControlState,
        kind: ActuatorKind,
        active: bool,
        now: DateTime,
    ) -> anyhow::Result<()> {
        if kind == ActuatorKind::Window {
            let angle = if active { WINDOW_OPEN_ANGLE } else { 0 };
            self.device.send(protocol::window_command(angle)).await?;
            state.actuators.set_window_angle(angle, now);
        } else {
            for command in protocol::switch_commands(kind, active) {
                self.device.send(command).await?;
            }
            state.actuators.set_active(kind, active, now);
        }

        Ok(())
    }
}

fn on_off(active: bool) -> &'static str {
    if active { "on" } else { "off" }
}

/// Accumulated actuator-state changes of one dispatch or rules tick,
/// published once as `{"<kind>_status": bool, ...}`.
#[derive(Debug, Default)]
pub struct StatusDelta {
    changes: Vec<(ActuatorKind, bool)>,
}

impl StatusDelta {
    fn record(&mut self, kind: ActuatorKind, active: bool) {
        self.changes.retain(|(k, _)| *k != kind);
        self.changes.push((kind, active));
    }

    fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (kind, active) in &self.changes {
            map.insert(kind.status_key().to_string(), serde_json::Value::Bool(*active));
        }
        serde_json::Value::Object(map)
    }
}

/// The one publish primitive for actuator-status changes: one message to the
/// peer status topic, one to the cloud telemetry sink, both per batch.
#[derive(Clone)]
pub struct StatusPublisher {
    peer_tx: Sender<MqttOutMessage>,
    status_topic: String,
    telemetry: TelemetrySink,
}

impl StatusPublisher {
    pub fn new(peer_tx: Sender<MqttOutMessage>, status_topic: impl Into<String>, telemetry: TelemetrySink) -> Self {
        Self {
            peer_tx,
            status_topic: status_topic.into(),
            telemetry,
        }
    }

    async fn publish(&self, delta: StatusDelta) -> anyhow::Result<()> {
        if delta.is_empty() {
            return Ok(());
        }

        let values = delta.to_json();

        self.peer_tx
            .send(MqttOutMessage::transient(self.status_topic.clone(), values.to_string()))
            .await
            .map_err(|e| anyhow::anyhow!("Error queueing status message: {}", e))?;

        self.telemetry.send(values).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::rules::RulesSettings;
    use crate::core::time::FIXED_NOW;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;
    use tokio::sync::mpsc::{self, Receiver};

    struct TestRig {
        service: CommandService,
        device_rx: Receiver<String>,
        peer_rx: Receiver<MqttOutMessage>,
        cloud_rx: Receiver<MqttOutMessage>,
    }

    fn rules_settings() -> RulesSettings {
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

    fn new_rig() -> TestRig {
        let (device_tx, device_rx) = mpsc::channel(32);
        let (peer_tx, peer_rx) = mpsc::channel(32);
        let (cloud_tx, cloud_rx) = mpsc::channel(32);

        let service = CommandService::new(
            DeviceHandle::new(device_tx),
            StatusPublisher::new(peer_tx, "home/edge1/status", TelemetrySink::new(cloud_tx)),
            RuleSet::new(&rules_settings()).unwrap(),
            t!(60 seconds),
        );

        TestRig {
            service,
            device_rx,
            peer_rx,
            cloud_rx,
        }
    }

    fn drain<T>(rx: &mut Receiver<T>) -> Vec<T> {
        let mut out = vec![];
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn payloads(messages: Vec<MqttOutMessage>) -> Vec<serde_json::Value> {
        messages
            .into_iter()
            .map(|m| serde_json::from_str(&m.payload).unwrap())
            .collect()
    }

    fn switch(kind: ActuatorKind, on: bool) -> CommandPayload {
        CommandPayload::Actuator {
            kind,
            value: TargetValue::Switch(on),
        }
    }

    fn reading(temperature: Option<f64>, humidity: Option<f64>, light_level: Option<i64>) -> SensorReading {
        SensorReading {
            temperature,
            humidity,
            light_level,
        }
    }

    #[tokio::test]
    async fn test_repeated_command_is_idempotent() {
        let mut rig = new_rig();

        rig.service
            .apply(CommandOrigin::Remote, switch(ActuatorKind::Light, true))
            .await
            .unwrap();
        rig.service
            .apply(CommandOrigin::Remote, switch(ActuatorKind::Light, true))
            .await
            .unwrap();

        assert_eq!(drain(&mut rig.device_rx), vec!["LED:ON"]);
        assert_eq!(payloads(drain(&mut rig.peer_rx)), vec![json!({"light_status": true})]);
        assert_eq!(payloads(drain(&mut rig.cloud_rx)), vec![json!({"light_status": true})]);
    }

    #[tokio::test]
    async fn test_fan_rule_scenario() {
        let mut rig = new_rig();

        for temperature in [20.0, 26.0, 23.0] {
            rig.service
                .run_rules_tick(&reading(Some(temperature), None, None), true)
                .await
                .unwrap();
        }

        assert_eq!(
            drain(&mut rig.device_rx),
            vec!["FAN_SPEED:10", "FAN_STEPS:200", "FAN_OFF"]
        );
        assert_json_eq!(
            payloads(drain(&mut rig.cloud_rx)),
            json!([{"fan_status": true}, {"fan_status": false}])
        );
    }

    #[tokio::test]
    async fn test_tick_batches_multiple_changes_into_one_publish() {
        let mut rig = new_rig();

        rig.service
            .run_rules_tick(&reading(Some(30.0), None, Some(100)), true)
            .await
            .unwrap();

        let published = payloads(drain(&mut rig.peer_rx));
        assert_eq!(published.len(), 1);
        assert_json_eq!(published[0], json!({"fan_status": true, "light_status": true}));
    }

    #[tokio::test]
    async fn test_sibling_event_arms_override_against_rules() {
        let mut rig = new_rig();
        let t0 = DateTime::from_iso("2026-04-01T10:00:00Z").unwrap();

        //inferred toggle switches the light on and arms a 60s override
        FIXED_NOW
            .scope(t0, async {
                rig.service
                    .apply(
                        CommandOrigin::Sibling,
                        CommandPayload::Actuator {
                            kind: ActuatorKind::Light,
                            value: TargetValue::Toggle,
                        },
                    )
                    .await
            })
            .await
            .unwrap();

        //bright room would normally switch the light off, but the override holds
        FIXED_NOW
            .scope(t0 + t!(30 seconds), async {
                rig.service.run_rules_tick(&reading(None, None, Some(900)), true).await
            })
            .await
            .unwrap();

        assert_eq!(drain(&mut rig.device_rx), vec!["LED:ON"]);

        //after expiry the rule takes over again
        FIXED_NOW
            .scope(t0 + t!(61 seconds), async {
                rig.service.run_rules_tick(&reading(None, None, Some(900)), true).await
            })
            .await
            .unwrap();

        assert_eq!(drain(&mut rig.device_rx), vec!["LED:OFF"]);
    }

    #[tokio::test]
    async fn test_manual_command_does_not_arm_override() {
        let mut rig = new_rig();

        //manual open via the remote path
        rig.service
            .apply(
                CommandOrigin::Remote,
                CommandPayload::Actuator {
                    kind: ActuatorKind::Window,
                    value: TargetValue::Switch(true),
                },
            )
            .await
            .unwrap();

        //dry air on the very next tick closes it again
        rig.service
            .run_rules_tick(&reading(None, Some(50.0), None), true)
            .await
            .unwrap();

        assert_eq!(drain(&mut rig.device_rx), vec!["WINDOW:90", "WINDOW:0"]);
    }

    #[tokio::test]
    async fn test_manual_command_cancels_existing_override() {
        let mut rig = new_rig();
        let t0 = DateTime::from_iso("2026-04-01T10:00:00Z").unwrap();

        FIXED_NOW
            .scope(t0, async {
                rig.service
                    .apply(
                        CommandOrigin::Sibling,
                        CommandPayload::Actuator {
                            kind: ActuatorKind::Fan,
                            value: TargetValue::Toggle,
                        },
                    )
                    .await
                    .unwrap();
                rig.service
                    .apply(CommandOrigin::Remote, switch(ActuatorKind::Fan, false))
                    .await
                    .unwrap();
                //override is gone, the rule may switch the fan back on
                rig.service
                    .run_rules_tick(&reading(Some(30.0), None, None), true)
                    .await
            })
            .await
            .unwrap();

        assert_eq!(
            drain(&mut rig.device_rx),
            vec!["FAN_SPEED:10", "FAN_STEPS:200", "FAN_OFF", "FAN_SPEED:10", "FAN_STEPS:200"]
        );
    }

    #[tokio::test]
    async fn test_window_rule_gated_by_presence() {
        let mut rig = new_rig();

        rig.service
            .run_rules_tick(&reading(None, Some(70.0), None), false)
            .await
            .unwrap();
        assert_eq!(drain(&mut rig.device_rx), Vec::<String>::new());

        rig.service
            .run_rules_tick(&reading(None, Some(70.0), None), true)
            .await
            .unwrap();
        assert_eq!(drain(&mut rig.device_rx), vec!["WINDOW:90"]);
    }

    #[tokio::test]
    async fn test_angle_command_always_writes_device() {
        let mut rig = new_rig();

        for angle in [90, 45, 0] {
            rig.service
                .apply(
                    CommandOrigin::Rpc,
                    CommandPayload::Actuator {
                        kind: ActuatorKind::Window,
                        value: TargetValue::Angle(angle),
                    },
                )
                .await
                .unwrap();
        }

        //three writes, but window_status telemetry only on the two flips
        assert_eq!(drain(&mut rig.device_rx), vec!["WINDOW:90", "WINDOW:45", "WINDOW:0"]);
        assert_json_eq!(
            payloads(drain(&mut rig.peer_rx)),
            json!([{"window_status": true}, {"window_status": false}])
        );
    }

    #[tokio::test]
    async fn test_beep_writes_device_without_state_or_telemetry() {
        let mut rig = new_rig();

        for _ in 0..2 {
            rig.service
                .apply(
                    CommandOrigin::Rpc,
                    CommandPayload::Actuator {
                        kind: ActuatorKind::Buzzer,
                        value: TargetValue::Beep { duration_ms: 500 },
                    },
                )
                .await
                .unwrap();
        }

        assert_eq!(drain(&mut rig.device_rx), vec!["BUZZER_BEEP:500", "BUZZER_BEEP:500"]);
        assert!(drain(&mut rig.peer_rx).is_empty());
        assert!(drain(&mut rig.cloud_rx).is_empty());
    }

    #[tokio::test]
    async fn test_raw_command_updates_store() {
        let mut rig = new_rig();

        rig.service
            .apply(
                CommandOrigin::Remote,
                CommandPayload::Raw {
                    command: "LED:ON".to_string(),
                },
            )
            .await
            .unwrap();

        //store already knows the light is on, the typed command is a no-op
        rig.service
            .apply(CommandOrigin::Remote, switch(ActuatorKind::Light, true))
            .await
            .unwrap();

        assert_eq!(drain(&mut rig.device_rx), vec!["LED:ON"]);
        assert_eq!(payloads(drain(&mut rig.peer_rx)), vec![json!({"light_status": true})]);
    }
}
