//! Core data model (section 3): port/data-point configuration, their
//! process-owned runtime counterparts, the cache entry shape, and the
//! failure/skip bookkeeping the Port Worker and Manager share.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::codec::{ByteOrder, DecodedValue, ValueType};

/// Which fieldbus dialect a port speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    ModbusRtu,
    ModbusTcp,
    RtuOverTcp,
    S7,
    Virtual,
}

/// Serial line parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl Default for Parity {
    fn default() -> Self {
        Parity::None
    }
}

/// Serial line settings, meaningful only for `Protocol::ModbusRtu`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineSettings {
    #[serde(default = "default_speed")]
    pub speed: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_speed() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_timeout_ms() -> u64 {
    6000
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            speed: default_speed(),
            parity: Parity::default(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Port configuration as loaded from the configured `ports.toml` (the
/// serde-level wire representation; see `config::PortRecord` for the file
/// schema it is built from).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub device_path: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub line_settings: LineSettings,
    #[serde(default)]
    pub description: String,
}

/// Live connection status of a [`RuntimePort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortStatus {
    Connected,
    Disconnected,
    Error,
}

/// Process-owned counterpart to [`Port`]. The Manager mutates `status` and
/// `error_reason` as the transport connects, drops, and reconnects; the
/// transport handle itself lives inside the Port Worker, not here — this
/// struct is the Manager's view for status reporting.
#[derive(Debug, Clone)]
pub struct RuntimePort {
    pub path: String,
    pub config: Port,
    pub status: PortStatus,
    pub error_reason: Option<String>,
}

impl RuntimePort {
    pub fn new(path: String, config: Port) -> Self {
        Self {
            path,
            config,
            status: PortStatus::Disconnected,
            error_reason: None,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.config.protocol, Protocol::Virtual)
    }
}

/// Read-side function a data point may be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadFn {
    ReadDigitalInput,
    ReadDigitalOutput,
    ReadAnalogInput,
    ReadAnalogOutput,
    ReadVirtualDigitalOutput,
}

/// Write-side function a data point may be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteFn {
    WriteDigitalOutput,
    WriteAnalogOutput,
    WriteVirtualDigitalOutput,
}

/// Data-point configuration (section 3). At least one of `read_fn`/`write_fn`
/// is always present; this is enforced by `config::load_data_points`, not by
/// the type, since TOML does not make the disjunction convenient to encode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPoint {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    pub port_path: String,
    pub slave_id: u8,
    pub register: u16,
    #[serde(default)]
    pub channel: Option<u8>,
    #[serde(default)]
    pub read_fn: Option<ReadFn>,
    #[serde(default)]
    pub write_fn: Option<WriteFn>,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default = "default_value_type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub min_valid: Option<f64>,
    #[serde(default)]
    pub max_valid: Option<f64>,
    #[serde(default)]
    pub inverted: bool,
    #[serde(default)]
    pub color_zones: Option<JsonValue>,
}

fn default_scale_factor() -> f64 {
    1.0
}

fn default_value_type() -> ValueType {
    ValueType::Uint16
}

/// Process-owned counterpart to [`DataPoint`]; currently identical in shape
/// but kept distinct so future process-only fields (e.g. a resolved
/// register-map template handle) do not leak into the persisted record.
pub type RuntimeDataPoint = DataPoint;

/// Value shape stored in the cache for an analog data point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalogRecord {
    pub value: f64,
    pub raw: DecodedValue,
    pub unit: Option<String>,
    pub value_type: ValueType,
    pub valid: bool,
    pub min_valid: Option<f64>,
    pub max_valid: Option<f64>,
    pub color_zones: Option<JsonValue>,
}

/// Value shape stored in the cache for a digital data point, post-inversion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DigitalRecord {
    pub state: u8,
}

/// What a successful read produces, keyed into the cache by data-point name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueRecord {
    Analog(AnalogRecord),
    Digital(DigitalRecord),
    Composite(HashMap<String, JsonValue>),
}

/// A single cache slot: the last outcome observed for a data point, held
/// exactly as the Manager last wrote it (invariant 4 of section 3).
#[derive(Debug, Clone)]
pub enum CacheEntry {
    Ok(ValueRecord),
    Err(String),
}

/// `(port_path, slave_id)` tracking key shared by [`FailureTracker`] and
/// [`SkipSet`].
pub type SlaveKey = (String, u8);

/// Consecutive-timeout counters per `(port, slave)`, cleared on any
/// successful read and on explicit reload/reset (section 3, invariant 1-2).
#[derive(Debug, Clone, Default)]
pub struct FailureTracker {
    counts: HashMap<SlaveKey, u32>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_timeout(&mut self, key: &SlaveKey) -> u32 {
        let counter = self.counts.entry(key.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn clear(&mut self, key: &SlaveKey) {
        self.counts.remove(key);
    }

    pub fn clear_port(&mut self, port_path: &str) {
        self.counts.retain(|(p, _), _| p != port_path);
    }

    pub fn count(&self, key: &SlaveKey) -> u32 {
        *self.counts.get(key).unwrap_or(&0)
    }
}

/// `(port, slave)` pairs currently refused service (section 3, invariant 3).
#[derive(Debug, Clone, Default)]
pub struct SkipSet {
    skipped: HashSet<SlaveKey>,
}

impl SkipSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: SlaveKey) {
        self.skipped.insert(key);
    }

    pub fn contains(&self, key: &SlaveKey) -> bool {
        self.skipped.contains(key)
    }

    pub fn clear_port(&mut self, port_path: &str) {
        self.skipped.retain(|(p, _)| p != port_path);
    }

    pub fn remove(&mut self, key: &SlaveKey) {
        self.skipped.remove(key);
    }
}

/// Threshold at which consecutive timeouts cause a slave to be skipped
/// (section 4.F: exactly 3).
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// Default per-request transport timeout (section 4.B).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 3000;
