//! Text protocol spoken over the serial link. One command per line; the
//! device answers with one JSON object per line.

use crate::home::{ActuatorKind, TargetValue};

/// Commands to bring an actuator into the given on/off state. The fan needs
/// a speed and an initial step count to actually start moving.
pub fn switch_commands(kind: ActuatorKind, active: bool) -> Vec<String> {
    match (kind, active) {
        (ActuatorKind::Fan, true) => vec!["FAN_SPEED:10".to_string(), "FAN_STEPS:200".to_string()],
        (ActuatorKind::Fan, false) => vec!["FAN_OFF".to_string()],
        (ActuatorKind::Light, true) => vec!["LED:ON".to_string()],
        (ActuatorKind::Light, false) => vec!["LED:OFF".to_string()],
        (ActuatorKind::Buzzer, true) => vec!["BUZZER:ON".to_string()],
        (ActuatorKind::Buzzer, false) => vec!["BUZZER:OFF".to_string()],
        (ActuatorKind::Window, _) => {
            vec![window_command(if active { crate::home::WINDOW_OPEN_ANGLE } else { 0 })]
        }
    }
}

pub fn window_command(angle: u8) -> String {
    format!("WINDOW:{}", angle)
}

pub fn beep_command(duration_ms: u64) -> String {
    format!("BUZZER_BEEP:{}", duration_ms)
}

/// State changes implied by a raw command line, so the store stays truthful
/// when a caller bypasses the typed command path.
pub fn infer_updates(raw: &str) -> Vec<(ActuatorKind, TargetValue)> {
    let raw = raw.trim().to_uppercase();

    if let Some(angle) = raw.strip_prefix("WINDOW:") {
        return match angle.parse::<u8>() {
            Ok(angle) => vec![(ActuatorKind::Window, TargetValue::Angle(angle))],
            Err(_) => vec![],
        };
    }

    match raw.as_str() {
        "LED:ON" => vec![(ActuatorKind::Light, TargetValue::Switch(true))],
        "LED:OFF" => vec![(ActuatorKind::Light, TargetValue::Switch(false))],
        "FAN_OFF" => vec![(ActuatorKind::Fan, TargetValue::Switch(false))],
        "BUZZER:ON" => vec![(ActuatorKind::Buzzer, TargetValue::Switch(true))],
        "BUZZER:OFF" => vec![(ActuatorKind::Buzzer, TargetValue::Switch(false))],
        _ => vec![],
    }
}
