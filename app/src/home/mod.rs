mod overrides;
mod presence;
mod reading;
mod state;

pub use overrides::Overrides;
pub use presence::Presence;
pub use reading::SensorReading;
pub use state::ActuatorStates;

use serde_json::Value;

pub const WINDOW_OPEN_ANGLE: u8 = 90;
pub const MAX_WINDOW_ANGLE: u8 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ActuatorKind {
    #[display("FAN")]
    Fan,
    #[display("WINDOW")]
    Window,
    #[display("LIGHT")]
    Light,
    #[display("BUZZER")]
    Buzzer,
}

impl ActuatorKind {
    pub fn variants() -> [ActuatorKind; 4] {
        [
            ActuatorKind::Fan,
            ActuatorKind::Window,
            ActuatorKind::Light,
            ActuatorKind::Buzzer,
        ]
    }

    /// Key under which state changes of this actuator appear in telemetry.
    pub fn status_key(&self) -> &'static str {
        match self {
            ActuatorKind::Fan => "fan_status",
            ActuatorKind::Window => "window_status",
            ActuatorKind::Light => "light_status",
            ActuatorKind::Buzzer => "buzzer_status",
        }
    }

    pub fn parse(name: &str) -> anyhow::Result<Self> {
        //LED is the historical device-protocol name of the light actuator
        match name.to_uppercase().as_str() {
            "FAN" => Ok(ActuatorKind::Fan),
            "WINDOW" => Ok(ActuatorKind::Window),
            "LIGHT" | "LED" => Ok(ActuatorKind::Light),
            "BUZZER" => Ok(ActuatorKind::Buzzer),
            other => anyhow::bail!("Unknown actuator {:?}", other),
        }
    }
}

/// Where a command entered the system. Only inferred sibling-device events
/// arm an override window; every other origin expresses direct intent and
/// cancels one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum CommandOrigin {
    #[display("remote")]
    Remote,
    #[display("rpc")]
    Rpc,
    #[display("sibling")]
    Sibling,
    #[display("alarm")]
    Alarm,
}

impl CommandOrigin {
    pub fn arms_override(&self) -> bool {
        matches!(self, CommandOrigin::Sibling)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetValue {
    Switch(bool),
    Angle(u8),
    Toggle,
    Beep { duration_ms: u64 },
}

impl TargetValue {
    /// Normalizes a requested value from its wire form. Accepts booleans,
    /// numbers and the symbolic forms ON/OFF/OPEN/CLOSE/BEEP.
    pub fn parse(kind: ActuatorKind, value: &Value, duration_ms: Option<u64>) -> anyhow::Result<Self> {
        match value {
            Value::Bool(b) => Ok(TargetValue::Switch(*b)),
            Value::Number(n) => {
                let n = n
                    .as_i64()
                    .ok_or_else(|| anyhow::anyhow!("Non-integer value {} for {}", n, kind))?;
                Self::from_number(kind, n)
            }
            Value::String(s) => match s.to_uppercase().as_str() {
                "ON" | "OPEN" => Ok(TargetValue::Switch(true)),
                "OFF" | "CLOSE" => Ok(TargetValue::Switch(false)),
                "BEEP" if kind == ActuatorKind::Buzzer => Ok(TargetValue::Beep {
                    duration_ms: duration_ms.unwrap_or(DEFAULT_BEEP_MS),
                }),
                other => match other.parse::<i64>() {
                    Ok(n) => Self::from_number(kind, n),
                    Err(_) => anyhow::bail!("Unparseable value {:?} for {}", s, kind),
                },
            },
            other => anyhow::bail!("Unsupported value {} for {}", other, kind),
        }
    }

    fn from_number(kind: ActuatorKind, n: i64) -> anyhow::Result<Self> {
        match kind {
            ActuatorKind::Window => {
                if !(0..=MAX_WINDOW_ANGLE as i64).contains(&n) {
                    anyhow::bail!("Window angle {} out of range 0-{}", n, MAX_WINDOW_ANGLE);
                }
                Ok(TargetValue::Angle(n as u8))
            }
            _ => Ok(TargetValue::Switch(n != 0)),
        }
    }
}

pub const DEFAULT_BEEP_MS: u64 = 2000;

/// Command message as it arrives on the peer bus, parsed once at the
/// boundary: either a typed actuator request or a raw device-protocol line.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    Actuator { kind: ActuatorKind, value: TargetValue },
    Raw { command: String },
}

impl CommandPayload {
    pub fn parse(payload: &str) -> anyhow::Result<Self> {
        let json: Value = serde_json::from_str(payload)?;

        if let Some(raw) = json.get("raw_command") {
            let command = raw
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("raw_command must be a string"))?;
            return Ok(CommandPayload::Raw {
                command: command.to_string(),
            });
        }

        let actuator = json
            .get("actuator")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("Command without actuator field: {}", payload))?;
        let value = json
            .get("value")
            .ok_or_else(|| anyhow::anyhow!("Command without value field: {}", payload))?;
        let duration_ms = json.get("duration").and_then(Value::as_u64);

        let kind = ActuatorKind::parse(actuator)?;
        let value = TargetValue::parse(kind, value, duration_ms)?;

        Ok(CommandPayload::Actuator { kind, value })
    }
}

/// Semantic event derived from a device input (IR code, button press) and
/// forwarded between the two controllers over the peer bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferredEvent {
    pub kind: ActuatorKind,
}

impl InferredEvent {
    pub fn event_type(&self) -> String {
        format!("toggle_{}", self.kind.to_string().to_lowercase())
    }

    pub fn parse(event_type: &str) -> anyhow::Result<Self> {
        match event_type.strip_prefix("toggle_") {
            Some(actuator) => Ok(Self {
                kind: ActuatorKind::parse(actuator)?,
            }),
            None => anyhow::bail!("Unknown inferred event type {:?}", event_type),
        }
    }
}
