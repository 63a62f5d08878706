// src/bridge/state.rs - Device session state machine
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
    Flashing,
    Running,
    Error,
}

impl BridgeState {
    /// Whether `self -> next` is an edge of the session state machine.
    pub fn can_transition_to(self, next: BridgeState) -> bool {
        use BridgeState::*;
        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, Connected | Error) => true,
            (Connected, Flashing | Running | Error) => true,
            (Flashing, Connected | Error) => true,
            (Running, Connected | Error) => true,
            (Error, Disconnected) => true,
            // Disconnecting is always allowed, including a lost link while running.
            (Connecting | Connected | Flashing | Running, Disconnected) => true,
            _ => false,
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, BridgeState::Connected | BridgeState::Flashing | BridgeState::Running)
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeState::Disconnected => "disconnected",
            BridgeState::Connecting => "connecting",
            BridgeState::Connected => "connected",
            BridgeState::Flashing => "flashing",
            BridgeState::Running => "running",
            BridgeState::Error => "error",
        };
        f.write_str(name)
    }
}
