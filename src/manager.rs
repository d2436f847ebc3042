//! Data-Point Manager (section 4.G): the process-wide authority over ports,
//! data points, the result cache, and the auto-reconnect state machine.
//! Shaped like the teacher's `QemuSupervisor` — a `Clone`-able, `Arc`-backed
//! struct callers invoke directly through async methods, not a mailbox
//! actor.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

use crate::config::{self, CoreConfig};
use crate::error::CoreError;
use crate::io_dispatch::virtual_io::{self, VirtualStateTable};
use crate::model::{
    DataPoint, Port, PortStatus, Protocol, ReadFn, RuntimePort, ValueRecord, WriteFn,
};
use crate::port_worker::{self, PortWorkerHandle, WriteValue};
use crate::simulated::SimulatedDevice;
use crate::transport::modbus_rtu::{ModbusRtuTransport, RtuLineConfig};
use crate::transport::modbus_tcp::ModbusTcpTransport;
use crate::transport::rtu_over_tcp::RtuOverTcpTransport;
use crate::transport::s7::S7Transport;
use crate::transport::Transport;

/// Broadcast payload for the refresh signal (section 4.G): carries no
/// value, just the name of the data point whose cache entry changed,
/// following the teacher's `QemuEvent` broadcast pattern.
#[derive(Debug, Clone)]
pub struct DataRefreshed {
    pub data_point: String,
}

/// Read-only snapshot of a port's connection state, as returned by
/// `get_port_statuses`.
#[derive(Debug, Clone)]
pub struct PortStatusSnapshot {
    pub status: PortStatus,
    pub error_reason: Option<String>,
    pub connected: bool,
}

struct ManagerInner {
    config: CoreConfig,
    ports: RwLock<HashMap<String, RuntimePort>>,
    data_points: RwLock<HashMap<String, DataPoint>>,
    workers: RwLock<HashMap<String, PortWorkerHandle>>,
    cache: RwLock<HashMap<String, crate::model::CacheEntry>>,
    reconnect_counts: RwLock<HashMap<String, u32>>,
    reconnecting: RwLock<HashSet<String>>,
    virtual_table: RwLock<VirtualStateTable>,
    simulated_devices: RwLock<HashMap<String, SimulatedDevice>>,
    refresh_tx: broadcast::Sender<DataRefreshed>,
}

/// Process-wide authority over the I/O core. Clone freely; every clone
/// shares the same underlying state through the inner `Arc`.
#[derive(Clone)]
pub struct Manager(Arc<ManagerInner>);

impl Manager {
    /// Build an empty Manager (no ports, no data points) bound to `config`.
    /// Callers populate state with `declare_port`/`declare_data_point`, or
    /// use [`Manager::startup`] to load from `config.config_dir`.
    pub fn new(config: CoreConfig) -> Self {
        let (refresh_tx, _rx) = broadcast::channel(256);
        Manager(Arc::new(ManagerInner {
            config,
            ports: RwLock::new(HashMap::new()),
            data_points: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            reconnect_counts: RwLock::new(HashMap::new()),
            reconnecting: RwLock::new(HashSet::new()),
            virtual_table: RwLock::new(HashMap::new()),
            simulated_devices: RwLock::new(HashMap::new()),
            refresh_tx,
        }))
    }

    /// Load `ports.toml`/`data_points.toml` from `config.config_dir`, open a
    /// transport and start a Port Worker for every non-virtual port
    /// (section 4.G, "Startup").
    pub async fn startup(config: CoreConfig) -> anyhow::Result<Self> {
        let manager = Manager::new(config);
        manager.load_and_connect_all().await?;
        Ok(manager)
    }

    async fn load_and_connect_all(&self) -> anyhow::Result<()> {
        let port_records = config::load_ports(&self.0.config.config_dir)?;
        let dp_records = config::load_data_points(&self.0.config.config_dir)?;

        for record in port_records {
            self.declare_port(record.path, record.port).await?;
        }
        for dp in dp_records {
            self.declare_data_point(dp).await?;
        }
        Ok(())
    }

    /// Subscribe to the cache-change broadcast.
    pub fn subscribe_refresh(&self) -> broadcast::Receiver<DataRefreshed> {
        self.0.refresh_tx.subscribe()
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.0.config.default_timeout_ms)
    }

    async fn open_transport(&self, port_path: &str, port: &Port) -> Result<Box<dyn Transport>, CoreError> {
        if self.0.config.simulation_mode {
            let mut devices = self.0.simulated_devices.write().await;
            let device = devices
                .entry(port_path.to_string())
                .or_insert_with(SimulatedDevice::new)
                .clone();
            return Ok(Box::new(device.transport()));
        }

        let timeout_ms = port.line_settings.timeout_ms;
        let result: Result<Box<dyn Transport>, crate::error::TransportError> = match port.protocol {
            Protocol::ModbusRtu => {
                let line = RtuLineConfig {
                    device: port.device_path.clone(),
                    baud_rate: port.line_settings.speed,
                    data_bits: port.line_settings.data_bits,
                    stop_bits: port.line_settings.stop_bits,
                    parity: match port.line_settings.parity {
                        crate::model::Parity::None => 'N',
                        crate::model::Parity::Even => 'E',
                        crate::model::Parity::Odd => 'O',
                    },
                    timeout_ms,
                };
                ModbusRtuTransport::open(&line).map(|t| Box::new(t) as Box<dyn Transport>)
            }
            Protocol::ModbusTcp => ModbusTcpTransport::connect(&port.device_path, timeout_ms)
                .await
                .map(|t| Box::new(t) as Box<dyn Transport>),
            Protocol::RtuOverTcp => RtuOverTcpTransport::connect(&port.device_path, timeout_ms)
                .await
                .map(|t| Box::new(t) as Box<dyn Transport>),
            Protocol::S7 => {
                // Rack/slot are not part of the port record; 0/1 matches the
                // common S7-1200/1500 default and is documented in DESIGN.md.
                S7Transport::connect(&port.device_path, 0, 1, timeout_ms)
                    .await
                    .map(|t| Box::new(t) as Box<dyn Transport>)
            }
            Protocol::Virtual => unreachable!("virtual ports never open a transport"),
        };
        result.map_err(CoreError::from)
    }

    async fn start_worker_for(&self, port_path: &str) -> Result<(), CoreError> {
        let port_config = {
            let ports = self.0.ports.read().await;
            ports
                .get(port_path)
                .ok_or_else(|| CoreError::PortNotFound(port_path.to_string()))?
                .config
                .clone()
        };

        if matches!(port_config.protocol, Protocol::Virtual) {
            return Ok(());
        }

        match self.open_transport(port_path, &port_config).await {
            Ok(transport) => {
                let handle = port_worker::spawn(
                    port_path.to_string(),
                    port_config.protocol,
                    transport,
                    self.request_timeout(),
                    self.0.config.max_consecutive_timeouts,
                );
                self.0.workers.write().await.insert(port_path.to_string(), handle);
                self.set_port_status(port_path, PortStatus::Connected, None).await;
                Ok(())
            }
            Err(e) => {
                self.set_port_status(port_path, PortStatus::Error, Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn set_port_status(&self, port_path: &str, status: PortStatus, reason: Option<String>) {
        let mut ports = self.0.ports.write().await;
        if let Some(runtime_port) = ports.get_mut(port_path) {
            runtime_port.status = status;
            runtime_port.error_reason = reason;
        }
    }

    fn publish_refresh(&self, data_point: &str) {
        let _ = self.0.refresh_tx.send(DataRefreshed {
            data_point: data_point.to_string(),
        });
    }

    // ---- Public contract (section 4.G table) ----------------------------

    /// Cached `Ok(value)` or cached error for `name`. `NoData` if the data
    /// point has never been polled.
    pub async fn query(&self, name: &str) -> Result<crate::model::CacheEntry, CoreError> {
        let cache = self.0.cache.read().await;
        cache.get(name).cloned().ok_or_else(|| CoreError::NoData(name.to_string()))
    }

    /// Force a live read via the owning Port Worker (or the virtual table),
    /// update the cache, and return the outcome.
    pub async fn read_direct(&self, name: &str) -> Result<ValueRecord, CoreError> {
        let data_point = self.get_data_point(name).await?;

        if data_point.read_fn == Some(ReadFn::ReadVirtualDigitalOutput) {
            let slave_id = data_point.slave_id;
            let channel = data_point.channel.unwrap_or(1);
            let bit = virtual_io::read_virtual_digital_output(&*self.0.virtual_table.read().await, slave_id, channel);
            let logical = if data_point.inverted { !bit } else { bit };
            let record = ValueRecord::Digital(crate::model::DigitalRecord { state: logical as u8 });
            self.write_cache_ok(name, &record).await;
            return Ok(record);
        }

        let port = self.get_port(&data_point.port_path).await?;
        if port.is_virtual() {
            return Err(CoreError::VirtualPort);
        }

        let worker = {
            let workers = self.0.workers.read().await;
            workers.get(&data_point.port_path).cloned()
        };
        let Some(worker) = worker else {
            return Err(CoreError::PortNotConnected(data_point.port_path.clone()));
        };

        match worker.read(data_point.clone()).await {
            Ok(record) => {
                self.write_cache_ok(name, &record).await;
                Ok(record)
            }
            Err(err) => {
                self.0.cache.write().await.insert(name.to_string(), crate::model::CacheEntry::Err(err.to_string()));
                self.publish_refresh(name);
                if matches!(err, CoreError::Disconnected) {
                    self.on_port_disconnected(data_point.port_path.clone()).await;
                }
                Err(err)
            }
        }
    }

    async fn write_cache_ok(&self, name: &str, record: &ValueRecord) {
        self.0
            .cache
            .write()
            .await
            .insert(name.to_string(), crate::model::CacheEntry::Ok(record.clone()));
        self.publish_refresh(name);
    }

    /// Dispatch a write (command) against `name`. `params` is interpreted
    /// against the data point's `write_fn`: `{"state": bool}` for digital
    /// writes, `{"value": number}` for analog writes.
    pub async fn command(&self, name: &str, _action: &str, params: &HashMap<String, JsonValue>) -> Result<(), CoreError> {
        let data_point = self.get_data_point(name).await?;
        let write_fn = data_point.write_fn.ok_or_else(|| CoreError::NoWriteFn(name.to_string()))?;

        if write_fn == WriteFn::WriteVirtualDigitalOutput {
            let value = params
                .get("state")
                .and_then(JsonValue::as_bool)
                .ok_or_else(|| CoreError::InvalidResponse("missing boolean 'state' param".to_string()))?;
            let on_wire = if data_point.inverted { !value } else { value };
            virtual_io::write_virtual_digital_output(
                &mut *self.0.virtual_table.write().await,
                data_point.slave_id,
                data_point.channel.unwrap_or(1),
                on_wire,
            );
            self.publish_refresh(name);
            return Ok(());
        }

        let port = self.get_port(&data_point.port_path).await?;
        if port.is_virtual() {
            return Err(CoreError::VirtualPort);
        }

        let worker = {
            let workers = self.0.workers.read().await;
            workers.get(&data_point.port_path).cloned()
        };
        let Some(worker) = worker else {
            return Err(CoreError::PortNotConnected(data_point.port_path.clone()));
        };

        let write_value = match write_fn {
            WriteFn::WriteDigitalOutput => {
                let value = params
                    .get("state")
                    .and_then(JsonValue::as_bool)
                    .ok_or_else(|| CoreError::InvalidResponse("missing boolean 'state' param".to_string()))?;
                WriteValue::Digital(value)
            }
            WriteFn::WriteAnalogOutput => {
                let value = params
                    .get("value")
                    .and_then(JsonValue::as_f64)
                    .ok_or_else(|| CoreError::InvalidResponse("missing numeric 'value' param".to_string()))?;
                WriteValue::Analog(value)
            }
            WriteFn::WriteVirtualDigitalOutput => unreachable!(),
        };

        let result = worker.write(data_point.clone(), write_value).await;
        if let Err(CoreError::Disconnected) = &result {
            self.on_port_disconnected(data_point.port_path.clone()).await;
        }
        result
    }

    pub async fn list_data_points(&self) -> Vec<(String, String)> {
        self.0
            .data_points
            .read()
            .await
            .values()
            .map(|dp| (dp.name.clone(), dp.description.clone()))
            .collect()
    }

    pub async fn list_ports(&self) -> Vec<(String, String)> {
        self.0
            .ports
            .read()
            .await
            .values()
            .map(|p| (p.path.clone(), p.config.description.clone()))
            .collect()
    }

    pub async fn get_port_statuses(&self) -> HashMap<String, PortStatusSnapshot> {
        self.0
            .ports
            .read()
            .await
            .values()
            .map(|p| {
                (
                    p.path.clone(),
                    PortStatusSnapshot {
                        status: p.status,
                        error_reason: p.error_reason.clone(),
                        connected: p.status == PortStatus::Connected,
                    },
                )
            })
            .collect()
    }

    /// Stop and recreate the transport and Port Worker for `port_path`,
    /// clearing its failure counters and skip set.
    pub async fn reload_port(&self, port_path: &str) -> Result<(), CoreError> {
        let port = self.get_port(port_path).await?;
        if port.is_virtual() {
            return Err(CoreError::VirtualPort);
        }

        if let Some(handle) = self.0.workers.write().await.remove(port_path) {
            drop(handle);
        }
        self.0.reconnect_counts.write().await.remove(port_path);
        self.start_worker_for(port_path).await
    }

    /// Stop every worker and transport, reload configuration from disk, and
    /// restart everything.
    pub async fn reload(&self) -> Result<(), CoreError> {
        let paths: Vec<String> = self.0.ports.read().await.keys().cloned().collect();
        for path in &paths {
            self.0.workers.write().await.remove(path);
        }
        self.0.ports.write().await.clear();
        self.0.data_points.write().await.clear();
        self.0.reconnect_counts.write().await.clear();
        self.0.cache.write().await.clear();

        self.load_and_connect_all()
            .await
            .map_err(|e| CoreError::InvalidResponse(e.to_string()))
    }

    /// Register a new port (or replace an existing one) and, unless it is
    /// virtual, open its transport and start its Port Worker.
    pub async fn declare_port(&self, path: String, port: Port) -> anyhow::Result<()> {
        {
            let mut ports = self.0.ports.write().await;
            ports.insert(path.clone(), RuntimePort::new(path.clone(), port));
        }
        self.persist_ports().await?;
        if let Err(e) = self.start_worker_for(&path).await {
            warn!(port = %path, error = %e, "failed to start port worker at declare time");
        }
        Ok(())
    }

    /// Remove a port and its Port Worker. Fails with `PortInUse` if any
    /// data point still references it.
    pub async fn delete_port(&self, path: &str) -> Result<(), CoreError> {
        let in_use = self.0.data_points.read().await.values().any(|dp| dp.port_path == path);
        if in_use {
            return Err(CoreError::PortInUse(path.to_string()));
        }
        if self.0.ports.write().await.remove(path).is_none() {
            return Err(CoreError::PortNotFound(path.to_string()));
        }
        self.0.workers.write().await.remove(path);
        self.0.simulated_devices.write().await.remove(path);
        self.0
            .reconnect_counts
            .write()
            .await
            .remove(path);
        self.persist_ports()
            .await
            .map_err(|e| CoreError::InvalidResponse(e.to_string()))
    }

    /// Register a new data point, validating that its port exists.
    pub async fn declare_data_point(&self, data_point: DataPoint) -> anyhow::Result<()> {
        {
            let ports = self.0.ports.read().await;
            if !ports.contains_key(&data_point.port_path) {
                anyhow::bail!("data point '{}' references unknown port '{}'", data_point.name, data_point.port_path);
            }
        }
        self.0.data_points.write().await.insert(data_point.name.clone(), data_point);
        self.persist_data_points().await
    }

    async fn persist_ports(&self) -> anyhow::Result<()> {
        let dir = &self.0.config.config_dir;
        if !dir.exists() {
            return Ok(());
        }
        let ports = self.0.ports.read().await;
        let records: Vec<config::PortRecord> = ports
            .values()
            .map(|p| config::PortRecord {
                path: p.path.clone(),
                port: p.config.clone(),
            })
            .collect();
        write_toml_table(dir, "ports.toml", "port", &records)
    }

    async fn persist_data_points(&self) -> anyhow::Result<()> {
        let dir = &self.0.config.config_dir;
        if !dir.exists() {
            return Ok(());
        }
        let data_points = self.0.data_points.read().await;
        let records: Vec<DataPoint> = data_points.values().cloned().collect();
        write_toml_table(dir, "data_points.toml", "data_point", &records)
    }

    async fn get_data_point(&self, name: &str) -> Result<DataPoint, CoreError> {
        self.0
            .data_points
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(name.to_string()))
    }

    async fn get_port(&self, path: &str) -> Result<RuntimePort, CoreError> {
        self.0
            .ports
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| CoreError::PortNotFound(path.to_string()))
    }

    /// Bespoke write-path carve-out (section 4.H): issue a transport
    /// command directly against `port_path`'s worker, bypassing data-point
    /// dispatch and the generic interpreter's encoder entirely.
    pub async fn raw_command(&self, port_path: &str, cmd: crate::transport::Command) -> Result<crate::transport::Frame, CoreError> {
        let worker = {
            let workers = self.0.workers.read().await;
            workers.get(port_path).cloned()
        };
        let Some(worker) = worker else {
            return Err(CoreError::PortNotConnected(port_path.to_string()));
        };
        worker.raw_command(cmd).await
    }

    // ---- Simulation API (section 4.G, `simulate_input/register/offline`) --

    pub async fn simulate_input(&self, data_point_name: &str, value: bool) -> Result<(), CoreError> {
        let data_point = self.get_data_point(data_point_name).await?;
        let device = self.simulated_device_for(&data_point.port_path).await?;
        match data_point.read_fn {
            Some(ReadFn::ReadDigitalInput) => device.set_input_bit(data_point.register, value).await,
            Some(ReadFn::ReadDigitalOutput) => device.set_coil(data_point.register, value).await,
            _ => return Err(CoreError::InvalidResponse("data point is not a digital input".to_string())),
        }
        Ok(())
    }

    pub async fn simulate_register(&self, data_point_name: &str, value: f64) -> Result<(), CoreError> {
        let data_point = self.get_data_point(data_point_name).await?;
        let device = self.simulated_device_for(&data_point.port_path).await?;
        let regs = crate::codec::encode(value, data_point.value_type, data_point.byte_order)?;
        for (i, reg) in regs.iter().enumerate() {
            let addr = data_point.register + i as u16;
            match data_point.read_fn {
                Some(ReadFn::ReadAnalogInput) => device.set_input(addr, *reg).await,
                _ => device.set_register(addr, *reg).await,
            }
        }
        Ok(())
    }

    pub async fn simulate_offline(&self, port_path: &str, offline: bool) -> Result<(), CoreError> {
        let device = self.simulated_device_for(port_path).await?;
        device.set_offline(offline).await;
        Ok(())
    }

    pub(crate) async fn simulated_device_for(&self, port_path: &str) -> Result<SimulatedDevice, CoreError> {
        self.0
            .simulated_devices
            .read()
            .await
            .get(port_path)
            .cloned()
            .ok_or_else(|| CoreError::InvalidResponse(format!("port '{port_path}' has no simulated device (not in simulation mode, or never connected)")))
    }

    // ---- Auto-reconnect state machine (section 4.G) -----------------------

    async fn on_port_disconnected(&self, port_path: String) {
        self.set_port_status(&port_path, PortStatus::Disconnected, Some("transport closed".to_string())).await;
        self.0.workers.write().await.remove(&port_path);

        let already_running = {
            let mut reconnecting = self.0.reconnecting.write().await;
            !reconnecting.insert(port_path.clone())
        };
        if already_running {
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager.reconnect_loop(port_path).await;
        });
    }

    async fn reconnect_loop(&self, port_path: String) {
        loop {
            let n = *self.0.reconnect_counts.read().await.get(&port_path).unwrap_or(&0);
            let delay = backoff_delay(n);
            tokio::time::sleep(delay).await;

            // An operator may have already reloaded the port manually; if a
            // worker now exists, this retry is a no-op (section 4.G,
            // "Tie-breaks and edge cases").
            if self.0.workers.read().await.contains_key(&port_path) {
                break;
            }

            match self.start_worker_for(&port_path).await {
                Ok(()) => {
                    self.0.reconnect_counts.write().await.remove(&port_path);
                    if let Some(handle) = self.0.workers.read().await.get(&port_path).cloned() {
                        handle.reset().await;
                    }
                    info!(port = %port_path, "reconnected");
                    break;
                }
                Err(e) => {
                    let mut counts = self.0.reconnect_counts.write().await;
                    let n = counts.entry(port_path.clone()).or_insert(0);
                    *n += 1;
                    error!(port = %port_path, attempt = *n, error = %e, "reconnect attempt failed");
                }
            }
        }
        self.0.reconnecting.write().await.remove(&port_path);
    }
}

/// `min(5s * 2^min(n,5), 60s)` with +/-20% jitter (section 4.G).
fn backoff_delay(n: u32) -> Duration {
    let exp = n.min(5);
    let base_ms = 5_000u64.saturating_mul(1u64 << exp).min(60_000);
    let jitter_fraction = rand::thread_rng().gen_range(-0.2..=0.2);
    let jittered_ms = (base_ms as f64 * (1.0 + jitter_fraction)).max(0.0) as u64;
    Duration::from_millis(jittered_ms)
}

fn write_toml_table<T: serde::Serialize>(dir: &Path, file_name: &str, key: &str, records: &[T]) -> anyhow::Result<()> {
    let mut table = toml::value::Table::new();
    table.insert(key.to_string(), toml::Value::try_from(records)?);
    let rendered = toml::to_string_pretty(&table)?;
    std::fs::write(dir.join(file_name), rendered)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LineSettings, Protocol};
    use std::collections::HashMap as Map;

    fn sim_config() -> CoreConfig {
        CoreConfig {
            simulation_mode: true,
            config_dir: std::env::temp_dir().join("henhouse-io-core-manager-test-nonexistent"),
            ..CoreConfig::default()
        }
    }

    fn virtual_port() -> Port {
        Port {
            device_path: "virtual".to_string(),
            protocol: Protocol::Virtual,
            line_settings: LineSettings::default(),
            description: "virtual bus".to_string(),
        }
    }

    fn sim_port() -> Port {
        Port {
            device_path: "sim0".to_string(),
            protocol: Protocol::ModbusRtu,
            line_settings: LineSettings::default(),
            description: "simulated RTU bus".to_string(),
        }
    }

    #[tokio::test]
    async fn scenario_s1_digital_read() {
        let manager = Manager::new(sim_config());
        manager.declare_port("portA".to_string(), sim_port()).await.unwrap();
        manager
            .declare_data_point(DataPoint {
                name: "df_coil1".to_string(),
                kind: "digital".to_string(),
                description: String::new(),
                port_path: "portA".to_string(),
                slave_id: 1,
                register: 0,
                channel: Some(3),
                read_fn: Some(ReadFn::ReadDigitalInput),
                write_fn: None,
                scale_factor: 1.0,
                offset: 0.0,
                unit: None,
                value_type: crate::codec::ValueType::Bool,
                byte_order: crate::codec::ByteOrder::HighLow,
                min_valid: None,
                max_valid: None,
                inverted: false,
                color_zones: None,
            })
            .await
            .unwrap();

        manager.simulate_input("df_coil1", true).await.unwrap();

        let record = manager.read_direct("df_coil1").await.unwrap();
        match record {
            ValueRecord::Digital(d) => assert_eq!(d.state, 1),
            _ => panic!("expected digital record"),
        }

        let cached = manager.query("df_coil1").await.unwrap();
        matches!(cached, crate::model::CacheEntry::Ok(_));
    }

    #[tokio::test]
    async fn scenario_s2_inversion() {
        let manager = Manager::new(sim_config());
        manager.declare_port("portB".to_string(), sim_port()).await.unwrap();
        manager
            .declare_data_point(DataPoint {
                name: "fan_coil".to_string(),
                kind: "digital".to_string(),
                description: String::new(),
                port_path: "portB".to_string(),
                slave_id: 1,
                register: 0,
                channel: Some(1),
                read_fn: Some(ReadFn::ReadDigitalOutput),
                write_fn: Some(WriteFn::WriteDigitalOutput),
                scale_factor: 1.0,
                offset: 0.0,
                unit: None,
                value_type: crate::codec::ValueType::Bool,
                byte_order: crate::codec::ByteOrder::HighLow,
                min_valid: None,
                max_valid: None,
                inverted: true,
                color_zones: None,
            })
            .await
            .unwrap();

        let device = manager.simulated_device_for("portB").await.unwrap();
        device.set_coil(0, true).await;

        let record = manager.read_direct("fan_coil").await.unwrap();
        match record {
            ValueRecord::Digital(d) => assert_eq!(d.state, 0),
            _ => panic!("expected digital record"),
        }

        let mut params = Map::new();
        params.insert("state".to_string(), JsonValue::Bool(true));
        manager.command("fan_coil", "set_state", &params).await.unwrap();
        assert!(!device.coil(0).await);
    }

    #[tokio::test]
    async fn virtual_data_point_never_touches_a_worker() {
        let manager = Manager::new(sim_config());
        manager.declare_port("virtualA".to_string(), virtual_port()).await.unwrap();
        manager
            .declare_data_point(DataPoint {
                name: "vd1".to_string(),
                kind: "digital".to_string(),
                description: String::new(),
                port_path: "virtualA".to_string(),
                slave_id: 1,
                register: 0,
                channel: Some(1),
                read_fn: Some(ReadFn::ReadVirtualDigitalOutput),
                write_fn: Some(WriteFn::WriteVirtualDigitalOutput),
                scale_factor: 1.0,
                offset: 0.0,
                unit: None,
                value_type: crate::codec::ValueType::Bool,
                byte_order: crate::codec::ByteOrder::HighLow,
                min_valid: None,
                max_valid: None,
                inverted: false,
                color_zones: None,
            })
            .await
            .unwrap();

        let mut params = Map::new();
        params.insert("state".to_string(), JsonValue::Bool(true));
        manager.command("vd1", "set_state", &params).await.unwrap();
        let record = manager.read_direct("vd1").await.unwrap();
        match record {
            ValueRecord::Digital(d) => assert_eq!(d.state, 1),
            _ => panic!("expected digital record"),
        }
        assert!(manager.0.workers.read().await.is_empty());
    }

    #[tokio::test]
    async fn scenario_s3_timeout_skip_set() {
        let manager = Manager::new(sim_config());
        manager.declare_port("portC".to_string(), sim_port()).await.unwrap();
        manager
            .declare_data_point(DataPoint {
                name: "df_coil_flaky".to_string(),
                kind: "digital".to_string(),
                description: String::new(),
                port_path: "portC".to_string(),
                slave_id: 1,
                register: 0,
                channel: Some(1),
                read_fn: Some(ReadFn::ReadDigitalInput),
                write_fn: None,
                scale_factor: 1.0,
                offset: 0.0,
                unit: None,
                value_type: crate::codec::ValueType::Bool,
                byte_order: crate::codec::ByteOrder::HighLow,
                min_valid: None,
                max_valid: None,
                inverted: false,
                color_zones: None,
            })
            .await
            .unwrap();

        let device = manager.simulated_device_for("portC").await.unwrap();
        device.set_offline(true).await;

        // Two consecutive timeouts must not skip yet (Testable Property #8).
        for _ in 0..2 {
            let err = manager.read_direct("df_coil_flaky").await.unwrap_err();
            assert_eq!(err.code(), "timeout");
        }

        // The third consecutive timeout crosses the threshold.
        let err = manager.read_direct("df_coil_flaky").await.unwrap_err();
        assert_eq!(err.code(), "device_offline_skipped");

        // Bring the device back online: if the skip-set actually gated the
        // worker, the next read still returns device_offline_skipped instead
        // of reaching (and succeeding against) the now-healthy transport.
        device.set_offline(false).await;
        let err = manager.read_direct("df_coil_flaky").await.unwrap_err();
        assert_eq!(err.code(), "device_offline_skipped");
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_s4_reconnect_clears_skip_set() {
        let manager = Manager::new(sim_config());
        manager.declare_port("portD".to_string(), sim_port()).await.unwrap();
        manager
            .declare_data_point(DataPoint {
                name: "df_coil_reconnect".to_string(),
                kind: "digital".to_string(),
                description: String::new(),
                port_path: "portD".to_string(),
                slave_id: 1,
                register: 0,
                channel: Some(1),
                read_fn: Some(ReadFn::ReadDigitalInput),
                write_fn: None,
                scale_factor: 1.0,
                offset: 0.0,
                unit: None,
                value_type: crate::codec::ValueType::Bool,
                byte_order: crate::codec::ByteOrder::HighLow,
                min_valid: None,
                max_valid: None,
                inverted: false,
                color_zones: None,
            })
            .await
            .unwrap();
        assert!(manager.0.workers.read().await.contains_key("portD"));

        // Drive the worker's slave into the skip-set first, so reconnect's
        // reset is actually exercised rather than a no-op.
        let device = manager.simulated_device_for("portD").await.unwrap();
        device.set_offline(true).await;
        for _ in 0..3 {
            let _ = manager.read_direct("df_coil_reconnect").await;
        }
        assert_eq!(
            manager.read_direct("df_coil_reconnect").await.unwrap_err().code(),
            "device_offline_skipped"
        );

        // Simulate the transport dropping out from under the worker.
        manager.on_port_disconnected("portD".to_string()).await;
        assert!(!manager.0.workers.read().await.contains_key("portD"));
        assert_eq!(
            manager.get_port_statuses().await.get("portD").unwrap().status,
            PortStatus::Disconnected
        );

        device.set_offline(false).await;

        // Let the paused clock run forward past the backoff delay and give
        // the spawned reconnect loop a chance to run.
        tokio::time::sleep(Duration::from_secs(7)).await;

        assert!(manager.0.workers.read().await.contains_key("portD"));
        assert_eq!(
            manager.get_port_statuses().await.get("portD").unwrap().status,
            PortStatus::Connected
        );
        assert!(manager.0.reconnect_counts.read().await.get("portD").is_none());

        // Reset on reconnect clears the skip-set; a read now reaches the
        // (now online) transport instead of short-circuiting.
        let record = manager.read_direct("df_coil_reconnect").await.unwrap();
        matches!(record, ValueRecord::Digital(_));
    }

    #[test]
    fn backoff_sequence_matches_spec() {
        let expected_bases = [5_000u64, 10_000, 20_000, 40_000, 60_000, 60_000];
        for (n, base) in expected_bases.iter().enumerate() {
            let delay = backoff_delay(n as u32);
            let lower = (*base as f64 * 0.8) as u64;
            let upper = (*base as f64 * 1.2) as u64;
            assert!(delay.as_millis() as u64 >= lower && delay.as_millis() as u64 <= upper);
        }
    }
}
