//! Water meter controller: reads flow/volume through the Generic Device
//! Interpreter, but drives valve open/close through a hand-written
//! transport call — the "bespoke write path" carve-out documented in
//! section 4.H and Design Note "Configuration-driven polymorphism for
//! devices". The valve command is a single coded register write that does
//! not fit the interpreter's per-field encoder (it multiplexes an open/
//! close/stop opcode onto one register rather than a scaled measurement).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{CoreError, TransportError};
use crate::interpreter::{self, RegisterMapTemplate};
use crate::manager::Manager;
use crate::transport::{Command, Frame, Transport};

use super::{command_allowed, ErrorKind, Mode, State};

const VALVE_OPCODE_CLOSE: u16 = 0x0000;
const VALVE_OPCODE_OPEN: u16 = 0x0001;
const VALVE_COMMAND_REGISTER: u16 = 40;

/// Adapts the Manager's `raw_command` carve-out to the `Transport` trait so
/// the Generic Device Interpreter can run its reads against a worker-owned
/// transport without the worker ever handing out the transport itself.
struct RawCommandTransport {
    manager: Manager,
    port_path: String,
}

#[async_trait]
impl Transport for RawCommandTransport {
    async fn request(&mut self, cmd: Command) -> Result<Frame, TransportError> {
        self.manager
            .raw_command(&self.port_path, cmd)
            .await
            .map_err(|err| TransportError::Malformed(err.to_string()))
    }
}

pub struct WaterMeterConfigBuilder {
    name: String,
    title: String,
    port_path: Option<String>,
    slave_id: u8,
    template: Option<RegisterMapTemplate>,
    poll_interval: Duration,
}

impl WaterMeterConfigBuilder {
    pub fn port(mut self, port_path: impl Into<String>, slave_id: u8) -> Self {
        self.port_path = Some(port_path.into());
        self.slave_id = slave_id;
        self
    }

    pub fn template(mut self, template: RegisterMapTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn build(self) -> anyhow::Result<WaterMeterConfig> {
        Ok(WaterMeterConfig {
            name: self.name,
            title: self.title,
            port_path: self.port_path.ok_or_else(|| anyhow::anyhow!("port is required"))?,
            slave_id: self.slave_id,
            template: self.template.ok_or_else(|| anyhow::anyhow!("template is required"))?,
            poll_interval: self.poll_interval,
        })
    }
}

#[derive(Clone)]
pub struct WaterMeterConfig {
    pub name: String,
    pub title: String,
    pub port_path: String,
    pub slave_id: u8,
    pub template: RegisterMapTemplate,
    pub poll_interval: Duration,
}

impl WaterMeterConfig {
    pub fn builder(name: impl Into<String>, title: impl Into<String>) -> WaterMeterConfigBuilder {
        WaterMeterConfigBuilder {
            name: name.into(),
            title: title.into(),
            port_path: None,
            slave_id: 1,
            template: None,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Last interpreted reading, exposed alongside the controller's generic
/// equipment `State`.
#[derive(Debug, Clone, Default)]
pub struct WaterMeterReading {
    pub flow_rate: Option<f64>,
    pub total_volume: Option<f64>,
    pub valve_open: Option<bool>,
}

#[derive(Clone)]
pub struct WaterMeterController {
    config: WaterMeterConfig,
    manager: Manager,
    state: Arc<RwLock<State>>,
    reading: Arc<RwLock<WaterMeterReading>>,
}

impl WaterMeterController {
    pub fn new(config: WaterMeterConfig, manager: Manager) -> Self {
        Self {
            config,
            manager,
            state: Arc::new(RwLock::new(State {
                mode: Mode::Auto,
                ..State::initial()
            })),
            reading: Arc::new(RwLock::new(WaterMeterReading::default())),
        }
    }

    pub async fn status(&self) -> State {
        self.state.read().await.clone()
    }

    pub async fn reading(&self) -> WaterMeterReading {
        self.reading.read().await.clone()
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.poll_interval);
            loop {
                interval.tick().await;
                self.poll_once().await;
            }
        })
    }

    async fn poll_once(&self) {
        let mut transport = RawCommandTransport {
            manager: self.manager.clone(),
            port_path: self.config.port_path.clone(),
        };
        let outcome = interpreter::interpret(&mut transport, self.config.slave_id, &self.config.template).await;

        match outcome {
            Ok(record) => {
                let mut reading = self.reading.write().await;
                reading.flow_rate = record.get("flow_rate").and_then(|v| v.as_f64());
                reading.total_volume = record.get("total_volume").and_then(|v| v.as_f64());
                reading.valve_open = record
                    .get("valve_status")
                    .and_then(|v| v.get("open"))
                    .and_then(|v| v.as_bool());
                self.state.write().await.apply_error(&self.config.name, None);
            }
            Err(_) => {
                self.state.write().await.apply_error(&self.config.name, Some(ErrorKind::Timeout));
            }
        }
    }

    async fn send_valve_opcode(&self, opcode: u16) -> Result<(), CoreError> {
        {
            let state = self.state.read().await;
            if !command_allowed(&state) {
                return Err(CoreError::CommandException);
            }
        }
        let cmd = Command::WriteHolding {
            slave: self.config.slave_id,
            addr: VALVE_COMMAND_REGISTER,
            value: opcode,
        };
        let result = self.manager.raw_command(&self.config.port_path, cmd).await;
        if result.is_err() {
            self.state.write().await.apply_error(&self.config.name, Some(ErrorKind::CommandFailed));
        }
        result.map(|_| ())
    }

    pub async fn open_valve(&self) -> Result<(), CoreError> {
        self.send_valve_opcode(VALVE_OPCODE_OPEN).await
    }

    pub async fn close_valve(&self) -> Result<(), CoreError> {
        self.send_valve_opcode(VALVE_OPCODE_CLOSE).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ByteOrder, ValueType};
    use crate::config::CoreConfig;
    use crate::interpreter::{Access, FieldDescriptor, FunctionCode};
    use crate::model::{LineSettings, Port, Protocol};

    fn sim_config() -> CoreConfig {
        CoreConfig {
            simulation_mode: true,
            config_dir: std::env::temp_dir().join("henhouse-io-core-water-meter-test-nonexistent"),
            ..CoreConfig::default()
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

    fn meter_template() -> RegisterMapTemplate {
        RegisterMapTemplate {
            function_code: FunctionCode::Holding,
            batch_start: 0,
            batch_count: 2,
            batches: None,
            byte_order: ByteOrder::HighLow,
            registers: vec![FieldDescriptor {
                name: "total_volume".to_string(),
                address: 0,
                count: 1,
                value_type: ValueType::Uint16,
                multiplier: 1.0,
                values: None,
                bits: None,
                access: Access::R,
            }],
        }
    }

    async fn new_controller() -> (Manager, WaterMeterController) {
        let manager = Manager::new(sim_config());
        manager.declare_port("portW".to_string(), sim_port()).await.unwrap();
        let config = WaterMeterConfig::builder("water_meter_1", "Water Meter 1")
            .port("portW", 1)
            .template(meter_template())
            .build()
            .unwrap();
        let controller = WaterMeterController::new(config, manager.clone());
        (manager, controller)
    }

    #[tokio::test]
    async fn read_side_uses_generic_interpreter() {
        let (manager, controller) = new_controller().await;
        let device = manager.simulated_device_for("portW").await.unwrap();
        device.set_register(0, 42).await;

        controller.poll_once().await;

        let reading = controller.reading().await;
        assert_eq!(reading.total_volume, Some(42.0));
        assert_eq!(controller.status().await.error, None);
    }

    #[tokio::test]
    async fn open_close_valve_bypasses_generic_encoder() {
        let (manager, controller) = new_controller().await;
        let device = manager.simulated_device_for("portW").await.unwrap();

        controller.open_valve().await.unwrap();
        assert_eq!(device.register(VALVE_COMMAND_REGISTER).await, VALVE_OPCODE_OPEN);

        controller.close_valve().await.unwrap();
        assert_eq!(device.register(VALVE_COMMAND_REGISTER).await, VALVE_OPCODE_CLOSE);
    }

    #[tokio::test]
    async fn valve_command_rejected_while_interlocked() {
        let (_manager, controller) = new_controller().await;
        controller.state.write().await.interlocked = true;
        let err = controller.open_valve().await.unwrap_err();
        assert_eq!(err.code(), "command_exception");
    }
}
