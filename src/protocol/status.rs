//! Canonical device status model and payload parsing
//!
//! Broker payloads arrive either as short codes (`P1`..`P6`) or as the
//! human-readable strings the controller firmware published before the code
//! migration. Both forms map onto the same typed states; anything else maps to
//! `Unknown`, so parsing never fails.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Gate state as reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Closed,
    Open,
    Opening,
    Closing,
    Stopped,
    StopMode,
    #[default]
    Unknown,
}

impl GateState {
    /// Stable human-readable label in the controller's locale
    pub fn label(&self) -> &'static str {
        match self {
            GateState::Closed => "Brána zavřena",
            GateState::Open => "Brána otevřena",
            GateState::Opening => "Otevírá se...",
            GateState::Closing => "Zavírá se...",
            GateState::Stopped => "Zastavena",
            GateState::StopMode => "STOP režim",
            GateState::Unknown => "Neznámý stav",
        }
    }

    pub fn is_moving(&self) -> bool {
        matches!(self, GateState::Opening | GateState::Closing)
    }

    /// Closing observations end every countdown and confirmation window
    pub fn is_closing_or_closed(&self) -> bool {
        matches!(self, GateState::Closed | GateState::Closing)
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Garage door state; open/closed beyond `P1` is inferred, not reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GarageState {
    Closed,
    Open,
    Opening,
    Closing,
    #[default]
    Unknown,
}

impl GarageState {
    pub fn label(&self) -> &'static str {
        match self {
            GarageState::Closed => "Garáž zavřena",
            GarageState::Open => "Garáž otevřena",
            GarageState::Opening => "Garáž - otevírá se...",
            GarageState::Closing => "Garáž - zavírá se...",
            GarageState::Unknown => "Neznámý stav",
        }
    }

    pub fn is_moving(&self) -> bool {
        matches!(self, GarageState::Opening | GarageState::Closing)
    }
}

impl fmt::Display for GarageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Connection quality shown next to the device status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
    #[default]
    Disconnected,
}

/// Which transport produced the current status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Direct,
    HttpProxy,
    #[default]
    None,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Direct => f.write_str("direct"),
            TransportKind::HttpProxy => f.write_str("http_proxy"),
            TransportKind::None => f.write_str("none"),
        }
    }
}

/// Immutable device status snapshot owned by the messaging client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceStatus {
    pub gate_state: GateState,
    pub garage_state: GarageState,
    pub connected: bool,
    pub connection_quality: ConnectionQuality,
    pub transport: TransportKind,
    pub last_error: Option<String>,
    pub latency_ms: Option<u64>,
}

impl DeviceStatus {
    /// Status of a client that has no live transport
    pub fn disconnected() -> Self {
        Self::default()
    }

    /// Enforce `connected == false => Disconnected` quality
    pub fn normalized(mut self) -> Self {
        if !self.connected {
            self.connection_quality = ConnectionQuality::Disconnected;
        }
        self
    }
}

/// Map a gate payload to its state. Total: unmapped input yields `Unknown`.
pub fn parse_gate_code(raw: &str) -> GateState {
    match raw.trim() {
        "P1" | "Brána zavřena" => GateState::Closed,
        "P2" | "Brána otevřena" => GateState::Open,
        "P3" | "Otevírá se..." => GateState::Opening,
        "P4" | "Zavírá se..." => GateState::Closing,
        "P5" | "Zastavena" => GateState::Stopped,
        "P6" | "STOP režim" => GateState::StopMode,
        _ => GateState::Unknown,
    }
}

/// Marker the garage controller sends while the door travels
const GARAGE_MOVEMENT_MARKER: &str = "POHYB";

/// Map a garage payload to its state. Movement reports are deliberately
/// `Unknown`: the direction is not reported by the hardware.
pub fn parse_garage_code(raw: &str) -> GarageState {
    let raw = raw.trim().to_ascii_uppercase();
    if raw.contains(GARAGE_MOVEMENT_MARKER) {
        return GarageState::Unknown;
    }
    match raw.as_str() {
        "P1" => GarageState::Closed,
        _ => GarageState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_gate_codes_map_to_states() {
        assert_eq!(parse_gate_code("P1"), GateState::Closed);
        assert_eq!(parse_gate_code("P2"), GateState::Open);
        assert_eq!(parse_gate_code("P3"), GateState::Opening);
        assert_eq!(parse_gate_code("P4"), GateState::Closing);
        assert_eq!(parse_gate_code("P5"), GateState::Stopped);
        assert_eq!(parse_gate_code("P6"), GateState::StopMode);
        assert_eq!(parse_gate_code("P9"), GateState::Unknown);
    }

    #[test]
    fn test_legacy_gate_strings_match_codes() {
        let pairs = [
            ("P1", "Brána zavřena"),
            ("P2", "Brána otevřena"),
            ("P3", "Otevírá se..."),
            ("P4", "Zavírá se..."),
            ("P5", "Zastavena"),
            ("P6", "STOP režim"),
        ];
        for (code, legacy) in pairs {
            assert_eq!(parse_gate_code(code), parse_gate_code(legacy), "{legacy}");
        }
    }

    #[test]
    fn test_gate_payload_is_trimmed() {
        assert_eq!(parse_gate_code("  P2\n"), GateState::Open);
        assert_eq!(parse_gate_code(""), GateState::Unknown);
        assert_eq!(parse_gate_code("p2"), GateState::Unknown);
    }

    #[test]
    fn test_garage_codes() {
        assert_eq!(parse_garage_code("P1"), GarageState::Closed);
        assert_eq!(parse_garage_code("POHYB"), GarageState::Unknown);
        assert_eq!(parse_garage_code("P1 POHYB"), GarageState::Unknown);
        assert_eq!(parse_garage_code("P2"), GarageState::Unknown);
    }

    #[test]
    fn test_garage_codes_ignore_case() {
        assert_eq!(parse_garage_code("p1"), GarageState::Closed);
        assert_eq!(parse_garage_code(" p1 \n"), GarageState::Closed);
        assert_eq!(parse_garage_code("pohyb"), GarageState::Unknown);
        assert_eq!(parse_garage_code("Garáž v pohybu"), GarageState::Unknown);
    }

    #[test]
    fn test_label_round_trips_through_parser() {
        for state in [
            GateState::Closed,
            GateState::Open,
            GateState::Opening,
            GateState::Closing,
            GateState::Stopped,
            GateState::StopMode,
        ] {
            assert_eq!(parse_gate_code(state.label()), state);
        }
    }

    #[test]
    fn test_normalized_forces_disconnected_quality() {
        let status = DeviceStatus {
            connected: false,
            connection_quality: ConnectionQuality::Excellent,
            ..DeviceStatus::default()
        }
        .normalized();
        assert_eq!(status.connection_quality, ConnectionQuality::Disconnected);

        let live = DeviceStatus {
            connected: true,
            connection_quality: ConnectionQuality::Good,
            ..DeviceStatus::default()
        }
        .normalized();
        assert_eq!(live.connection_quality, ConnectionQuality::Good);
    }

    proptest! {
        #[test]
        fn parse_gate_code_is_total_and_deterministic(raw in ".*") {
            let first = parse_gate_code(&raw);
            let second = parse_gate_code(&raw);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn garage_movement_marker_always_unknown(prefix in "[A-Z0-9 ]{0,8}", suffix in "[A-Z0-9 ]{0,8}") {
            let raw = format!("{prefix}POHYB{suffix}");
            prop_assert_eq!(parse_garage_code(&raw), GarageState::Unknown);
        }
    }
}
