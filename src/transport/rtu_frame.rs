//! Shared RTU PDU framing, used by both the serial RTU driver and the
//! RTU-over-TCP driver (same byte layout, different carrier).

use super::{modbus_crc16, Command, Frame};
use crate::error::TransportError;

const FN_READ_COILS: u8 = 0x01;
const FN_READ_DISCRETE_INPUTS: u8 = 0x02;
const FN_READ_HOLDING: u8 = 0x03;
const FN_READ_INPUT: u8 = 0x04;
const FN_WRITE_COIL: u8 = 0x05;
const FN_WRITE_HOLDING: u8 = 0x06;

/// Build the slave+PDU+CRC byte sequence for `cmd`.
pub fn build_request(cmd: &Command) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    match *cmd {
        Command::ReadCoils { slave, addr, count } => {
            frame.push(slave);
            frame.push(FN_READ_COILS);
            frame.extend_from_slice(&addr.to_be_bytes());
            frame.extend_from_slice(&count.to_be_bytes());
        }
        Command::ReadInputs { slave, addr, count } => {
            frame.push(slave);
            frame.push(FN_READ_DISCRETE_INPUTS);
            frame.extend_from_slice(&addr.to_be_bytes());
            frame.extend_from_slice(&count.to_be_bytes());
        }
        Command::ReadHoldingRegisters { slave, addr, count } => {
            frame.push(slave);
            frame.push(FN_READ_HOLDING);
            frame.extend_from_slice(&addr.to_be_bytes());
            frame.extend_from_slice(&count.to_be_bytes());
        }
        Command::ReadInputRegisters { slave, addr, count } => {
            frame.push(slave);
            frame.push(FN_READ_INPUT);
            frame.extend_from_slice(&addr.to_be_bytes());
            frame.extend_from_slice(&count.to_be_bytes());
        }
        Command::WriteCoil { slave, addr, value } => {
            frame.push(slave);
            frame.push(FN_WRITE_COIL);
            frame.extend_from_slice(&addr.to_be_bytes());
            frame.extend_from_slice(if value { &[0xFF, 0x00] } else { &[0x00, 0x00] });
        }
        Command::WriteHolding { slave, addr, value } => {
            frame.push(slave);
            frame.push(FN_WRITE_HOLDING);
            frame.extend_from_slice(&addr.to_be_bytes());
            frame.extend_from_slice(&value.to_be_bytes());
        }
    }
    let crc = modbus_crc16(&frame);
    frame.push((crc & 0xFF) as u8);
    frame.push((crc >> 8) as u8);
    frame
}

/// Number of response bytes (including slave/function/CRC) expected for
/// `cmd`, used by carriers that need to know how much to read.
pub fn expected_response_len(cmd: &Command) -> usize {
    match *cmd {
        Command::ReadCoils { count, .. } | Command::ReadInputs { count, .. } => {
            3 + (count as usize).div_ceil(8) + 2
        }
        Command::ReadHoldingRegisters { count, .. } | Command::ReadInputRegisters { count, .. } => {
            3 + (count as usize) * 2 + 2
        }
        Command::WriteCoil { .. } | Command::WriteHolding { .. } => 8,
    }
}

/// Parse a raw response buffer (slave+PDU+CRC) against the command that
/// produced it.
pub fn parse_response(cmd: &Command, raw: &[u8]) -> Result<Frame, TransportError> {
    if raw.len() < 4 {
        return Err(TransportError::Malformed("response too short".to_string()));
    }
    let (body, crc_bytes) = raw.split_at(raw.len() - 2);
    let expected_crc = modbus_crc16(body);
    let got_crc = (crc_bytes[1] as u16) << 8 | crc_bytes[0] as u16;
    if expected_crc != got_crc {
        return Err(TransportError::Crc);
    }

    let function = raw[1];
    if function & 0x80 != 0 {
        return Err(TransportError::BadFunction);
    }

    match *cmd {
        Command::ReadCoils { count, .. } | Command::ReadInputs { count, .. } => {
            let byte_count = raw[2] as usize;
            let data = &raw[3..3 + byte_count];
            let mut bits = Vec::with_capacity(count as usize);
            for i in 0..count as usize {
                let byte = data[i / 8];
                bits.push((byte >> (i % 8)) & 1 == 1);
            }
            Ok(Frame::Bits(bits))
        }
        Command::ReadHoldingRegisters { count, .. } | Command::ReadInputRegisters { count, .. } => {
            let byte_count = raw[2] as usize;
            if byte_count != count as usize * 2 {
                return Err(TransportError::Malformed(format!(
                    "expected {} register bytes, frame declares {}",
                    count * 2,
                    byte_count
                )));
            }
            let data = &raw[3..3 + byte_count];
            let regs = data
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            Ok(Frame::Registers(regs))
        }
        Command::WriteCoil { .. } | Command::WriteHolding { .. } => Ok(Frame::Ack),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_read_holding_request() {
        let cmd = Command::ReadHoldingRegisters {
            slave: 1,
            addr: 0,
            count: 2,
        };
        let frame = build_request(&cmd);
        assert_eq!(&frame[0..6], &[1, 0x03, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(frame.len(), 8);
    }

    #[test]
    fn parse_holding_response_roundtrip() {
        let cmd = Command::ReadHoldingRegisters {
            slave: 1,
            addr: 0,
            count: 2,
        };
        let mut resp = vec![1, 0x03, 4, 0x00, 0x01, 0x00, 0x02];
        let crc = modbus_crc16(&resp);
        resp.push((crc & 0xFF) as u8);
        resp.push((crc >> 8) as u8);
        let frame = parse_response(&cmd, &resp).unwrap();
        assert_eq!(frame, Frame::Registers(vec![1, 2]));
    }

    #[test]
    fn bad_crc_is_rejected() {
        let cmd = Command::ReadHoldingRegisters {
            slave: 1,
            addr: 0,
            count: 1,
        };
        let resp = vec![1, 0x03, 2, 0x00, 0x01, 0xDE, 0xAD];
        let err = parse_response(&cmd, &resp).unwrap_err();
        assert_eq!(err, TransportError::Crc);
    }

    #[test]
    fn exception_response_is_bad_function() {
        let cmd = Command::ReadHoldingRegisters {
            slave: 1,
            addr: 0,
            count: 1,
        };
        let mut resp = vec![1, 0x83, 0x02];
        let crc = modbus_crc16(&resp);
        resp.push((crc & 0xFF) as u8);
        resp.push((crc >> 8) as u8);
        let err = parse_response(&cmd, &resp).unwrap_err();
        assert_eq!(err, TransportError::BadFunction);
    }
}
