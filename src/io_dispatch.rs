//! I/O dispatch (section 4.D): translates a `(protocol, slave, register,
//! channel)` tuple into the right [`Transport`] command and back into a
//! decoded value. Protocol-agnostic — callers (the Port Worker) never build
//! a `Command` directly for a data point.

use crate::codec::{self, ByteOrder, DecodedValue, ValueType};
use crate::error::TransportError;
use crate::model::Protocol;
use crate::transport::{Command, Frame, Transport};

fn digital_read_command(protocol: Protocol, slave: u8, register: u16, channel: Option<u8>, coil: bool) -> Command {
    match protocol {
        Protocol::S7 => {
            let bit = channel.unwrap_or(1).saturating_sub(1);
            let addr = register.wrapping_mul(8) + bit as u16;
            if coil {
                Command::ReadCoils { slave, addr, count: 1 }
            } else {
                Command::ReadInputs { slave, addr, count: 1 }
            }
        }
        _ => {
            if coil {
                Command::ReadCoils { slave, addr: register, count: 8 }
            } else {
                Command::ReadInputs { slave, addr: register, count: 8 }
            }
        }
    }
}

fn select_channel_bit(protocol: Protocol, bits: Vec<bool>, channel: Option<u8>) -> Result<bool, TransportError> {
    match protocol {
        Protocol::S7 => bits.first().copied().ok_or_else(|| {
            TransportError::Malformed("S7 digital read returned no bits".to_string())
        }),
        _ => {
            let index = channel.unwrap_or(1).saturating_sub(1) as usize;
            bits.get(index).copied().ok_or_else(|| {
                TransportError::Malformed(format!("channel {index} out of range for 8-bit batch"))
            })
        }
    }
}

/// Digital input/output register access (section 4.D, `DigitalIO`).
pub mod digital_io {
    use super::*;

    pub async fn read_digital_input(
        transport: &mut dyn Transport,
        protocol: Protocol,
        slave: u8,
        register: u16,
        channel: Option<u8>,
    ) -> Result<bool, TransportError> {
        let cmd = digital_read_command(protocol, slave, register, channel, false);
        match transport.request(cmd).await? {
            Frame::Bits(bits) => select_channel_bit(protocol, bits, channel),
            other => Err(unexpected_frame("bits", &other)),
        }
    }

    pub async fn read_digital_output(
        transport: &mut dyn Transport,
        protocol: Protocol,
        slave: u8,
        register: u16,
        channel: Option<u8>,
    ) -> Result<bool, TransportError> {
        let cmd = digital_read_command(protocol, slave, register, channel, true);
        match transport.request(cmd).await? {
            Frame::Bits(bits) => select_channel_bit(protocol, bits, channel),
            other => Err(unexpected_frame("bits", &other)),
        }
    }

    pub async fn write_digital_output(
        transport: &mut dyn Transport,
        protocol: Protocol,
        slave: u8,
        register: u16,
        channel: Option<u8>,
        value: bool,
    ) -> Result<(), TransportError> {
        let addr = match protocol {
            Protocol::S7 => {
                let bit = channel.unwrap_or(1).saturating_sub(1);
                register.wrapping_mul(8) + bit as u16
            }
            _ => register,
        };
        let cmd = Command::WriteCoil { slave, addr, value };
        transport.request(cmd).await?;
        Ok(())
    }
}

/// Analog input/output register access (section 4.D, `AnalogIO`).
pub mod analog_io {
    use super::*;

    async fn read_registers(
        transport: &mut dyn Transport,
        slave: u8,
        register: u16,
        count: u16,
        input: bool,
    ) -> Result<Vec<u16>, TransportError> {
        let cmd = if input {
            Command::ReadInputRegisters { slave, addr: register, count }
        } else {
            Command::ReadHoldingRegisters { slave, addr: register, count }
        };
        match transport.request(cmd).await? {
            Frame::Registers(regs) => Ok(regs),
            other => Err(unexpected_frame("registers", &other)),
        }
    }

    pub async fn read_analog_input(
        transport: &mut dyn Transport,
        slave: u8,
        register: u16,
        value_type: ValueType,
        byte_order: ByteOrder,
    ) -> Result<DecodedValue, TransportError> {
        let regs = read_registers(transport, slave, register, value_type.register_count() as u16, true).await?;
        codec::decode(&regs, value_type, byte_order).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    pub async fn read_analog_output(
        transport: &mut dyn Transport,
        slave: u8,
        register: u16,
        value_type: ValueType,
        byte_order: ByteOrder,
    ) -> Result<DecodedValue, TransportError> {
        let regs = read_registers(transport, slave, register, value_type.register_count() as u16, false).await?;
        codec::decode(&regs, value_type, byte_order).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    pub async fn write_analog_output(
        transport: &mut dyn Transport,
        slave: u8,
        register: u16,
        value: f64,
        value_type: ValueType,
        byte_order: ByteOrder,
    ) -> Result<(), TransportError> {
        let regs = codec::encode(value, value_type, byte_order).map_err(|e| TransportError::Malformed(e.to_string()))?;
        if regs.len() == 1 {
            transport
                .request(Command::WriteHolding { slave, addr: register, value: regs[0] })
                .await?;
        } else {
            for (i, reg) in regs.iter().enumerate() {
                transport
                    .request(Command::WriteHolding {
                        slave,
                        addr: register + i as u16,
                        value: *reg,
                    })
                    .await?;
            }
        }
        Ok(())
    }
}

/// Database-backed virtual digital state (section 4.D, `Virtual`). No
/// transport call — the Manager owns the table keyed `(slave_id, channel)`
/// and these functions operate purely on an in-memory map passed by the
/// caller, since a virtual data point never reaches the Port Worker
/// (invariant 2, section 3).
pub mod virtual_io {
    use std::collections::HashMap;

    pub type VirtualStateTable = HashMap<(u8, u8), bool>;

    pub fn read_virtual_digital_output(table: &VirtualStateTable, slave_id: u8, channel: u8) -> bool {
        *table.get(&(slave_id, channel)).unwrap_or(&false)
    }

    pub fn write_virtual_digital_output(table: &mut VirtualStateTable, slave_id: u8, channel: u8, value: bool) {
        table.insert((slave_id, channel), value);
    }
}

fn unexpected_frame(expected: &str, got: &Frame) -> TransportError {
    TransportError::Malformed(format!("expected {expected} frame, got {got:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedDevice;

    #[tokio::test]
    async fn modbus_digital_read_selects_channel() {
        let device = SimulatedDevice::new();
        device.set_input_bit(2, true).await;
        let mut transport = device.transport();
        let bit = digital_io::read_digital_input(&mut transport, Protocol::ModbusRtu, 1, 0, Some(3))
            .await
            .unwrap();
        assert!(bit);
    }

    #[tokio::test]
    async fn analog_read_decodes_uint16() {
        let device = SimulatedDevice::new();
        device.set_register(5, 1234).await;
        let mut transport = device.transport();
        let value = analog_io::read_analog_output(&mut transport, 1, 5, ValueType::Uint16, ByteOrder::HighLow)
            .await
            .unwrap();
        assert_eq!(value, DecodedValue::Unsigned(1234));
    }

    #[test]
    fn virtual_io_round_trips_without_transport() {
        let mut table = virtual_io::VirtualStateTable::new();
        virtual_io::write_virtual_digital_output(&mut table, 1, 2, true);
        assert!(virtual_io::read_virtual_digital_output(&table, 1, 2));
        assert!(!virtual_io::read_virtual_digital_output(&table, 1, 3));
    }
}
