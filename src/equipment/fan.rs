//! Fan controller: coil + running feedback + auto/manual switch, matching
//! scenario S6 ("Equipment controller reconciliation").

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;

use crate::error::CoreError;
use crate::manager::Manager;

use super::{command_allowed, read_bool_input, ErrorKind, Mode, State};

/// Builder for [`FanConfig`], following the teacher's typed-config
/// construction style.
pub struct FanConfigBuilder {
    name: String,
    title: String,
    on_off_coil: Option<String>,
    running_feedback: Option<String>,
    auto_manual: Option<String>,
    poll_interval: Duration,
    mismatch_ticks_to_error: u32,
}

impl FanConfigBuilder {
    pub fn on_off_coil(mut self, name: impl Into<String>) -> Self {
        self.on_off_coil = Some(name.into());
        self
    }

    pub fn running_feedback(mut self, name: impl Into<String>) -> Self {
        self.running_feedback = Some(name.into());
        self
    }

    pub fn auto_manual(mut self, name: impl Into<String>) -> Self {
        self.auto_manual = Some(name.into());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn build(self) -> anyhow::Result<FanConfig> {
        Ok(FanConfig {
            name: self.name,
            title: self.title,
            on_off_coil: self.on_off_coil.ok_or_else(|| anyhow::anyhow!("on_off_coil is required"))?,
            running_feedback: self
                .running_feedback
                .ok_or_else(|| anyhow::anyhow!("running_feedback is required"))?,
            auto_manual: self.auto_manual.ok_or_else(|| anyhow::anyhow!("auto_manual is required"))?,
            poll_interval: self.poll_interval,
            mismatch_ticks_to_error: self.mismatch_ticks_to_error,
        })
    }
}

/// Typed, builder-constructed configuration for a fan controller.
#[derive(Debug, Clone)]
pub struct FanConfig {
    pub name: String,
    pub title: String,
    pub on_off_coil: String,
    pub running_feedback: String,
    pub auto_manual: String,
    pub poll_interval: Duration,
    mismatch_ticks_to_error: u32,
}

impl FanConfig {
    pub fn builder(name: impl Into<String>, title: impl Into<String>) -> FanConfigBuilder {
        FanConfigBuilder {
            name: name.into(),
            title: title.into(),
            on_off_coil: None,
            running_feedback: None,
            auto_manual: None,
            poll_interval: Duration::from_millis(500),
            mismatch_ticks_to_error: 2,
        }
    }
}

/// Long-lived fan controller actor, polling at `config.poll_interval` and
/// reconciling commanded vs. actual state (section 4.H).
#[derive(Clone)]
pub struct FanController {
    config: FanConfig,
    manager: Manager,
    state: Arc<RwLock<State>>,
}

impl FanController {
    pub fn new(config: FanConfig, manager: Manager) -> Self {
        Self {
            config,
            manager,
            state: Arc::new(RwLock::new(State::initial())),
        }
    }

    pub async fn status(&self) -> State {
        self.state.read().await.clone()
    }

    /// Spawn the polling loop. Mismatch ticks are tracked locally to this
    /// task, not in shared `State` — only the loop observes consecutive
    /// ticks.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut mismatch_ticks: u32 = 0;
            let mut interval = tokio::time::interval(self.config.poll_interval);
            loop {
                interval.tick().await;
                self.poll_once(&mut mismatch_ticks).await;
            }
        })
    }

    async fn poll_once(&self, mismatch_ticks: &mut u32) {
        let mode_result = read_bool_input(&self.manager, &self.config.auto_manual).await;
        let coil_result = read_bool_input(&self.manager, &self.config.on_off_coil).await;
        let feedback_result = read_bool_input(&self.manager, &self.config.running_feedback).await;

        let mut state = self.state.write().await;

        if let Err(kind) = mode_result.as_ref() {
            state.apply_error(&self.config.name, Some(*kind));
            return;
        }
        state.mode = if mode_result.unwrap() { Mode::Auto } else { Mode::Manual };

        let (coil, feedback) = match (coil_result, feedback_result) {
            (Ok(c), Ok(f)) => (c, f),
            (Err(kind), _) | (_, Err(kind)) => {
                state.apply_error(&self.config.name, Some(kind));
                *mismatch_ticks = 0;
                return;
            }
        };

        state.commanded_on = coil;
        state.actual_on = feedback;
        state.is_running = feedback;

        let mismatched = coil != feedback;
        if mismatched {
            *mismatch_ticks += 1;
        } else {
            *mismatch_ticks = 0;
        }

        // Manual mode: panel operators expect the relay to be bypassed, so
        // on/off-but-running errors are suppressed (section 4.H, "Mode
        // source").
        let suppress_running_mismatch = state.mode == Mode::Manual;

        let classification = if mismatched && *mismatch_ticks >= self.config.mismatch_ticks_to_error && !suppress_running_mismatch {
            if coil && !feedback {
                Some(ErrorKind::OnButNotRunning)
            } else {
                Some(ErrorKind::OffButRunning)
            }
        } else {
            None
        };

        state.apply_error(&self.config.name, classification);
    }

    async fn set_coil(&self, value: bool) -> Result<(), CoreError> {
        {
            let state = self.state.read().await;
            if !command_allowed(&state) {
                return Err(CoreError::CommandException);
            }
            if state.mode == Mode::Auto {
                return Err(CoreError::CommandException);
            }
        }
        let mut params = std::collections::HashMap::new();
        params.insert("state".to_string(), serde_json::Value::Bool(value));
        let result = self.manager.command(&self.config.on_off_coil, "set_state", &params).await;
        if result.is_err() {
            self.state.write().await.apply_error(&self.config.name, Some(ErrorKind::CommandFailed));
        }
        result
    }

    pub async fn turn_on(&self) -> Result<(), CoreError> {
        self.set_coil(true).await
    }

    pub async fn turn_off(&self) -> Result<(), CoreError> {
        self.set_coil(false).await
    }

    pub async fn set_mode(&self, mode: Mode) {
        info!(controller = %self.config.name, ?mode, "mode change requested");
        self.state.write().await.mode = mode;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ByteOrder, ValueType};
    use crate::config::CoreConfig;
    use crate::model::{DataPoint, LineSettings, Port, Protocol, ReadFn, WriteFn};

    fn sim_config() -> CoreConfig {
        CoreConfig {
            simulation_mode: true,
            config_dir: std::env::temp_dir().join("henhouse-io-core-fan-test-nonexistent"),
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

    fn digital_point(
        name: &str,
        port_path: &str,
        register: u16,
        read_fn: Option<ReadFn>,
        write_fn: Option<WriteFn>,
    ) -> DataPoint {
        DataPoint {
            name: name.to_string(),
            kind: "digital".to_string(),
            description: String::new(),
            port_path: port_path.to_string(),
            slave_id: 1,
            register,
            channel: Some(1),
            read_fn,
            write_fn,
            scale_factor: 1.0,
            offset: 0.0,
            unit: None,
            value_type: ValueType::Bool,
            byte_order: ByteOrder::HighLow,
            min_valid: None,
            max_valid: None,
            inverted: false,
            color_zones: None,
        }
    }

    async fn new_controller() -> (Manager, FanController) {
        let manager = Manager::new(sim_config());
        manager.declare_port("portF".to_string(), sim_port()).await.unwrap();
        manager
            .declare_data_point(digital_point("fan_auto_manual", "portF", 0, Some(ReadFn::ReadDigitalInput), None))
            .await
            .unwrap();
        manager
            .declare_data_point(digital_point(
                "fan_coil",
                "portF",
                1,
                Some(ReadFn::ReadDigitalOutput),
                Some(WriteFn::WriteDigitalOutput),
            ))
            .await
            .unwrap();
        manager
            .declare_data_point(digital_point("fan_feedback", "portF", 2, Some(ReadFn::ReadDigitalInput), None))
            .await
            .unwrap();

        let config = FanConfig::builder("fan_1", "Fan 1")
            .on_off_coil("fan_coil")
            .running_feedback("fan_feedback")
            .auto_manual("fan_auto_manual")
            .build()
            .unwrap();
        let controller = FanController::new(config, manager.clone());
        (manager, controller)
    }

    #[tokio::test]
    async fn mismatch_two_ticks_then_recovery() {
        let (manager, controller) = new_controller().await;
        let device = manager.simulated_device_for("portF").await.unwrap();
        device.set_input_bit(0, true).await; // auto mode
        device.set_coil(1, true).await; // commanded on
        device.set_input_bit(2, false).await; // feedback off: mismatch

        let mut ticks = 0;
        controller.poll_once(&mut ticks).await;
        assert_eq!(ticks, 1);
        assert_eq!(controller.status().await.error, None, "below mismatch_ticks_to_error threshold");

        controller.poll_once(&mut ticks).await;
        assert_eq!(ticks, 2);
        assert_eq!(controller.status().await.error, Some(ErrorKind::OnButNotRunning));

        device.set_input_bit(2, true).await; // feedback recovers
        controller.poll_once(&mut ticks).await;
        assert_eq!(ticks, 0);
        assert_eq!(controller.status().await.error, None);
    }

    #[tokio::test]
    async fn manual_mode_suppresses_running_mismatch() {
        let (manager, controller) = new_controller().await;
        let device = manager.simulated_device_for("portF").await.unwrap();
        device.set_input_bit(0, false).await; // manual mode
        device.set_coil(1, true).await;
        device.set_input_bit(2, false).await;

        let mut ticks = 0;
        for _ in 0..3 {
            controller.poll_once(&mut ticks).await;
        }

        assert_eq!(controller.status().await.mode, Mode::Manual);
        assert_eq!(controller.status().await.error, None);
    }
}
