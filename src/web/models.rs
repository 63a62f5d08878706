//! Contains the data models for API requests and responses.

use crate::bridge::{BridgeState, TerminalSnapshot};
use crate::linker::CompiledProgram;
use serde::{Deserialize, Serialize};

/// A compiled block program.
#[derive(Debug, Serialize, Deserialize)]
pub struct CompileResponse {
    pub source: String,
    /// The generated statements exactly as they appear between the user-code markers.
    pub user_code: String,
    pub digest: String,
    pub bytes: usize,
}

impl From<&CompiledProgram> for CompileResponse {
    fn from(program: &CompiledProgram) -> Self {
        Self {
            source: program.source().to_string(),
            user_code: program.user_code().to_string(),
            digest: program.digest(),
            bytes: program.len(),
        }
    }
}

/// Represents the current state of the board connection.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceStatusResponse {
    pub state: BridgeState,
    pub terminal: TerminalSnapshot,
}

/// Text typed into the device terminal.
#[derive(Debug, Deserialize)]
pub struct TerminalInputRequest {
    pub data: String,
}

/// Body of every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Received byte count when a firmware size check failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u64>,
}
