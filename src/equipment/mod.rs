//! Equipment Controller contract (section 4.H): the state-machine shape
//! every consumer controller follows. Only the contract lives here; `fan`
//! and `water_meter` are the two representative controllers built against
//! it.

pub mod fan;
pub mod water_meter;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::manager::Manager;
use crate::model::ValueRecord;

/// Operating mode, sourced from an `auto_manual` data point (`1 = Auto`,
/// `0 = Manual`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Auto,
    Manual,
}

/// Generic error classification every controller re-evaluates each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    DeviceOfflineSkipped,
    InvalidData,
    OnButNotRunning,
    OffButRunning,
    CommandFailed,
}

impl ErrorKind {
    /// User-visible string, e.g. `"ON BUT NOT RUNNING"`.
    pub fn message(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "SENSOR TIMEOUT",
            ErrorKind::DeviceOfflineSkipped => "DEVICE OFFLINE - SKIPPED",
            ErrorKind::InvalidData => "INVALID SENSOR DATA",
            ErrorKind::OnButNotRunning => "ON BUT NOT RUNNING",
            ErrorKind::OffButRunning => "OFF BUT RUNNING",
            ErrorKind::CommandFailed => "COMMAND FAILED",
        }
    }
}

/// Snapshot of a controller's state, returned by its `status()` method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub mode: Mode,
    pub commanded_on: bool,
    pub actual_on: bool,
    pub is_running: bool,
    pub error: Option<ErrorKind>,
    pub error_message: String,
    pub interlocked: bool,
}

impl State {
    pub fn initial() -> Self {
        Self {
            mode: Mode::Manual,
            commanded_on: false,
            actual_on: false,
            is_running: false,
            error: None,
            error_message: String::new(),
            interlocked: false,
        }
    }

    /// Apply a new error classification, logging the edge transitions
    /// (`nil -> X` at `ERROR`, `X -> nil` at `INFO`) per section 4.H.
    pub fn apply_error(&mut self, controller_name: &str, new_error: Option<ErrorKind>) {
        if self.error == new_error {
            return;
        }
        match new_error {
            Some(kind) => {
                error!(controller = controller_name, error = ?kind, "equipment error");
                self.error_message = kind.message().to_string();
            }
            None => {
                info!(controller = controller_name, "equipment error cleared");
                self.error_message.clear();
            }
        }
        self.error = new_error;
    }
}

/// Read one of a controller's configured data points and classify a
/// transport-level failure into [`ErrorKind::Timeout`] /
/// [`ErrorKind::InvalidData`], used by every controller's poll tick.
pub async fn read_bool_input(manager: &Manager, name: &str) -> Result<bool, ErrorKind> {
    match manager.read_direct(name).await {
        Ok(ValueRecord::Digital(d)) => Ok(d.state != 0),
        Ok(_) => Err(ErrorKind::InvalidData),
        Err(crate::error::CoreError::Timeout) => Err(ErrorKind::Timeout),
        Err(crate::error::CoreError::DeviceOfflineSkipped { .. }) => Err(ErrorKind::DeviceOfflineSkipped),
        Err(_) => Err(ErrorKind::InvalidData),
    }
}

/// Command gating shared by every controller (section 4.H): rejected when
/// interlocked or while the device is believed unreachable (timed out or
/// skip-set).
pub fn command_allowed(state: &State) -> bool {
    !state.interlocked
        && !matches!(state.error, Some(ErrorKind::Timeout) | Some(ErrorKind::DeviceOfflineSkipped))
}
