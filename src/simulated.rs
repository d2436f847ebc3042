//! In-memory register/coil/bit tables standing in for a physical device
//! (section 4.C). Deterministic and test-driven: nothing here talks to a
//! real socket or serial line. A [`SimulatedDevice`] handle lets a test (or
//! the Manager's `simulate_*` API) poke values and flip the device offline
//! without touching the `Transport` it backs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::TransportError;
use crate::transport::{Command, Frame, Transport};

#[derive(Debug, Default)]
struct SimulatedState {
    coils: HashMap<u16, bool>,
    discrete_inputs: HashMap<u16, bool>,
    holding_registers: HashMap<u16, u16>,
    input_registers: HashMap<u16, u16>,
    offline: bool,
}

/// Shared, clonable handle to a simulated device's memory. Tests hold one
/// of these alongside the [`SimulatedTransport`] handed to the Port Worker.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevice {
    state: Arc<RwLock<SimulatedState>>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_coil(&self, addr: u16, value: bool) {
        self.state.write().await.coils.insert(addr, value);
    }

    pub async fn set_input_bit(&self, addr: u16, value: bool) {
        self.state.write().await.discrete_inputs.insert(addr, value);
    }

    pub async fn set_register(&self, addr: u16, value: u16) {
        self.state.write().await.holding_registers.insert(addr, value);
    }

    pub async fn set_input(&self, addr: u16, value: u16) {
        self.state.write().await.input_registers.insert(addr, value);
    }

    pub async fn set_offline(&self, offline: bool) {
        self.state.write().await.offline = offline;
    }

    pub async fn is_offline(&self) -> bool {
        self.state.read().await.offline
    }

    /// Alias for [`Self::set_coil`], matching the output-bit naming used by
    /// equipment controllers driving a coil (section 4.C).
    pub async fn set_output_bit(&self, addr: u16, value: bool) {
        self.set_coil(addr, value).await;
    }

    /// Alias for [`Self::set_input`] (section 4.C).
    pub async fn set_analog_input(&self, addr: u16, value: u16) {
        self.set_input(addr, value).await;
    }

    pub async fn coil(&self, addr: u16) -> bool {
        *self.state.read().await.coils.get(&addr).unwrap_or(&false)
    }

    pub async fn input_bit(&self, addr: u16) -> bool {
        *self.state.read().await.discrete_inputs.get(&addr).unwrap_or(&false)
    }

    pub async fn register(&self, addr: u16) -> u16 {
        *self.state.read().await.holding_registers.get(&addr).unwrap_or(&0)
    }

    /// Build a [`Transport`] handle backed by this device's memory.
    pub fn transport(&self) -> SimulatedTransport {
        SimulatedTransport {
            state: self.state.clone(),
        }
    }
}

/// A `Transport` implementor over [`SimulatedDevice`] memory. Multiple
/// instances may share the same backing state (useful to simulate several
/// slaves multiplexed on one virtual bus).
pub struct SimulatedTransport {
    state: Arc<RwLock<SimulatedState>>,
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn request(&mut self, cmd: Command) -> Result<Frame, TransportError> {
        let mut state = self.state.write().await;
        if state.offline {
            return Err(TransportError::Timeout);
        }
        match cmd {
            Command::ReadCoils { addr, count, .. } => {
                let bits = (addr..addr + count)
                    .map(|a| *state.coils.get(&a).unwrap_or(&false))
                    .collect();
                Ok(Frame::Bits(bits))
            }
            Command::ReadInputs { addr, count, .. } => {
                let bits = (addr..addr + count)
                    .map(|a| *state.discrete_inputs.get(&a).unwrap_or(&false))
                    .collect();
                Ok(Frame::Bits(bits))
            }
            Command::ReadHoldingRegisters { addr, count, .. } => {
                let regs = (addr..addr + count)
                    .map(|a| *state.holding_registers.get(&a).unwrap_or(&0))
                    .collect();
                Ok(Frame::Registers(regs))
            }
            Command::ReadInputRegisters { addr, count, .. } => {
                let regs = (addr..addr + count)
                    .map(|a| *state.input_registers.get(&a).unwrap_or(&0))
                    .collect();
                Ok(Frame::Registers(regs))
            }
            Command::WriteCoil { addr, value, .. } => {
                state.coils.insert(addr, value);
                Ok(Frame::Ack)
            }
            Command::WriteHolding { addr, value, .. } => {
                state.holding_registers.insert(addr, value);
                Ok(Frame::Ack)
            }
        }
    }

    fn is_alive(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_reflects_set_value() {
        let device = SimulatedDevice::new();
        device.set_register(10, 4242).await;
        let mut transport = device.transport();
        let frame = transport
            .request(Command::ReadHoldingRegisters {
                slave: 1,
                addr: 10,
                count: 1,
            })
            .await
            .unwrap();
        assert_eq!(frame, Frame::Registers(vec![4242]));
    }

    #[tokio::test]
    async fn offline_device_times_out() {
        let device = SimulatedDevice::new();
        device.set_offline(true).await;
        let mut transport = device.transport();
        let err = transport
            .request(Command::ReadHoldingRegisters {
                slave: 1,
                addr: 0,
                count: 1,
            })
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout);
    }

    #[tokio::test]
    async fn write_coil_then_read_back() {
        let device = SimulatedDevice::new();
        let mut transport = device.transport();
        transport
            .request(Command::WriteCoil {
                slave: 1,
                addr: 3,
                value: true,
            })
            .await
            .unwrap();
        let frame = transport
            .request(Command::ReadCoils {
                slave: 1,
                addr: 3,
                count: 1,
            })
            .await
            .unwrap();
        assert_eq!(frame, Frame::Bits(vec![true]));
    }
}
