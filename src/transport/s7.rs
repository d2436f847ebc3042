//! Siemens S7 over ISO-on-TCP (RFC 1006) with a COTP connection and the S7
//! "Read/Write Var" job service (section 4.B.4).
//!
//! Digital points are byte-addressed: `addr` is a bit number, decomposed
//! into `byte = addr / 8, bit = addr % 8`. Analog points are word-addressed:
//! `addr` is a 16-bit word index, decomposed into `byte_offset = addr * 2`.
//! Reads/writes to coils and inputs target the process-image Q/I areas;
//! holding/input registers target data block 1, matching the convention
//! used by the generic device interpreter's register-map templates.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{Command, Frame, Transport};
use crate::error::TransportError;

const AREA_INPUTS: u8 = 0x81;
const AREA_OUTPUTS: u8 = 0x82;
const AREA_DATA_BLOCK: u8 = 0x84;

const TRANSPORT_SIZE_BIT: u8 = 0x01;
const TRANSPORT_SIZE_BYTE: u8 = 0x02;
const TRANSPORT_SIZE_WORD: u8 = 0x04;

const DEFAULT_DB_NUMBER: u16 = 1;

pub struct S7Transport {
    stream: TcpStream,
    timeout: Duration,
}

impl S7Transport {
    pub async fn connect(addr: &str, rack: u8, slot: u8, timeout_ms: u64) -> Result<Self, TransportError> {
        let timeout = Duration::from_millis(timeout_ms);
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Malformed(format!("connect {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);

        tokio::time::timeout(timeout, async {
            cotp_connect(&mut stream, rack, slot).await?;
            s7_setup_communication(&mut stream).await
        })
        .await
        .map_err(|_| TransportError::Timeout)??;

        Ok(Self { stream, timeout })
    }
}

/// TPKT+COTP Connection Request/Confirm. TSAPs follow the common
/// `rack*32 + slot` convention used by most S7-300/400/1200/1500 gateways.
async fn cotp_connect(stream: &mut TcpStream, rack: u8, slot: u8) -> Result<(), TransportError> {
    let dst_tsap: u16 = 0x0100 | ((rack as u16) << 8 | slot as u16) & 0x00FF;
    let src_tsap: u16 = 0x0100;

    let mut cotp = vec![
        0x21, // length indicator (filled below)
        0xE0, // CR: connection request
        0x00, 0x00, // destination reference
        0x00, 0x01, // source reference
        0x00, // class/options
    ];
    cotp.push(0xC1);
    cotp.push(0x02);
    cotp.extend_from_slice(&src_tsap.to_be_bytes());
    cotp.push(0xC2);
    cotp.push(0x02);
    cotp.extend_from_slice(&dst_tsap.to_be_bytes());
    cotp.push(0xC0);
    cotp.push(0x01);
    cotp.push(0x0A);
    cotp[0] = (cotp.len() - 1) as u8;

    send_tpkt(stream, &cotp).await?;
    let resp = recv_tpkt(stream).await?;
    if resp.len() < 2 || resp[1] != 0xD0 {
        return Err(TransportError::Malformed(
            "COTP connection confirm rejected".to_string(),
        ));
    }
    Ok(())
}

/// S7 "Setup Communication" job, negotiating PDU/parallel-job limits.
async fn s7_setup_communication(stream: &mut TcpStream) -> Result<(), TransportError> {
    let header = s7_header(0x01, 8, 0);
    let parameter = vec![0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0xF0];
    let mut pdu = header;
    pdu.extend_from_slice(&parameter);
    send_cotp_data(stream, &pdu).await?;

    let resp = recv_cotp_data(stream).await?;
    if resp.len() < 2 || resp[1] != 0x03 {
        return Err(TransportError::Malformed(
            "unexpected S7 setup-communication response".to_string(),
        ));
    }
    Ok(())
}

fn s7_header(rosctr: u8, param_len: u16, data_len: u16) -> Vec<u8> {
    vec![
        0x32, // protocol id
        rosctr,
        0x00,
        0x00, // redundancy identification
        0x00,
        0x01, // protocol data unit reference
        (param_len >> 8) as u8,
        (param_len & 0xFF) as u8,
        (data_len >> 8) as u8,
        (data_len & 0xFF) as u8,
    ]
}

fn area_and_addr(cmd: &Command) -> (u8, u8, u16, u32) {
    match *cmd {
        Command::ReadInputs { addr, .. } => (AREA_INPUTS, TRANSPORT_SIZE_BIT, 0, addr as u32),
        Command::ReadCoils { addr, .. } | Command::WriteCoil { addr, .. } => {
            (AREA_OUTPUTS, TRANSPORT_SIZE_BIT, 0, addr as u32)
        }
        Command::ReadInputRegisters { addr, .. } => {
            (AREA_INPUTS, TRANSPORT_SIZE_WORD, 0, addr as u32 * 16)
        }
        Command::ReadHoldingRegisters { addr, .. } | Command::WriteHolding { addr, .. } => {
            (AREA_DATA_BLOCK, TRANSPORT_SIZE_WORD, DEFAULT_DB_NUMBER, addr as u32 * 16)
        }
    }
}

fn item_count(cmd: &Command) -> u16 {
    match *cmd {
        Command::ReadInputs { count, .. }
        | Command::ReadCoils { count, .. }
        | Command::ReadInputRegisters { count, .. }
        | Command::ReadHoldingRegisters { count, .. } => count,
        Command::WriteCoil { .. } | Command::WriteHolding { .. } => 1,
    }
}

fn build_read_request(cmd: &Command) -> Vec<u8> {
    let (area, transport_size, db, bit_addr) = area_and_addr(cmd);
    let count = item_count(cmd);
    let mut parameter = vec![0x04, 0x01]; // Read Var, 1 item
    parameter.push(0x12); // item spec
    parameter.push(0x0A); // item spec length
    parameter.push(0x10); // addressing mode: S7ANY
    parameter.push(transport_size);
    parameter.extend_from_slice(&count.to_be_bytes());
    parameter.extend_from_slice(&db.to_be_bytes());
    parameter.push(area);
    parameter.extend_from_slice(&bit_addr.to_be_bytes()[1..]);

    let mut pdu = s7_header(0x01, parameter.len() as u16, 0);
    pdu.extend_from_slice(&parameter);
    pdu
}

fn build_write_request(cmd: &Command) -> Vec<u8> {
    let (area, transport_size, db, bit_addr) = area_and_addr(cmd);
    let (payload, data_transport_size): (Vec<u8>, u8) = match *cmd {
        Command::WriteCoil { value, .. } => (vec![if value { 1 } else { 0 }], 0x03),
        Command::WriteHolding { value, .. } => (value.to_be_bytes().to_vec(), 0x04),
        _ => unreachable!("build_write_request called with a read command"),
    };

    let mut parameter = vec![0x05, 0x01]; // Write Var, 1 item
    parameter.push(0x12);
    parameter.push(0x0A);
    parameter.push(0x10);
    parameter.push(transport_size);
    parameter.extend_from_slice(&1u16.to_be_bytes());
    parameter.extend_from_slice(&db.to_be_bytes());
    parameter.push(area);
    parameter.extend_from_slice(&bit_addr.to_be_bytes()[1..]);

    let mut data = vec![0x00, data_transport_size];
    data.extend_from_slice(&((payload.len() * 8) as u16).to_be_bytes());
    data.extend_from_slice(&payload);

    let mut pdu = s7_header(0x01, parameter.len() as u16, data.len() as u16);
    pdu.extend_from_slice(&parameter);
    pdu.extend_from_slice(&data);
    pdu
}

fn parse_read_response(cmd: &Command, pdu: &[u8]) -> Result<Frame, TransportError> {
    if pdu.len() < 12 {
        return Err(TransportError::Malformed("S7 response too short".to_string()));
    }
    let data = &pdu[12..];
    if data.len() < 2 {
        return Err(TransportError::Malformed("S7 item header missing".to_string()));
    }
    let return_code = data[0];
    if return_code != 0xFF {
        return Err(TransportError::BadFunction);
    }
    let bit_len = (data[2] as usize) << 8 | data[3] as usize;
    let byte_len = bit_len.div_ceil(8);
    let body = &data[4..];

    match *cmd {
        Command::ReadInputs { count, .. } | Command::ReadCoils { count, .. } => {
            let mut bits = Vec::with_capacity(count as usize);
            for i in 0..count as usize {
                let byte = body.get(i / 8).copied().unwrap_or(0);
                bits.push((byte >> (i % 8)) & 1 == 1);
            }
            Ok(Frame::Bits(bits))
        }
        Command::ReadInputRegisters { count, .. } | Command::ReadHoldingRegisters { count, .. } => {
            let needed = count as usize * 2;
            if body.len() < needed {
                return Err(TransportError::Malformed(format!(
                    "expected {needed} data bytes, got {} (declared {byte_len})",
                    body.len()
                )));
            }
            let regs = body[..needed]
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            Ok(Frame::Registers(regs))
        }
        Command::WriteCoil { .. } | Command::WriteHolding { .. } => unreachable!(),
    }
}

fn parse_write_response(pdu: &[u8]) -> Result<Frame, TransportError> {
    if pdu.len() < 13 {
        return Err(TransportError::Malformed("S7 write response too short".to_string()));
    }
    if pdu[12] != 0xFF {
        return Err(TransportError::BadFunction);
    }
    Ok(Frame::Ack)
}

async fn send_tpkt(stream: &mut TcpStream, payload: &[u8]) -> Result<(), TransportError> {
    let total_len = payload.len() + 4;
    let mut out = Vec::with_capacity(total_len);
    out.push(0x03);
    out.push(0x00);
    out.extend_from_slice(&(total_len as u16).to_be_bytes());
    out.extend_from_slice(payload);
    stream
        .write_all(&out)
        .await
        .map_err(|_| TransportError::TransportClosed)
}

async fn recv_tpkt(stream: &mut TcpStream) -> Result<Vec<u8>, TransportError> {
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|_| TransportError::TransportClosed)?;
    let total_len = u16::from_be_bytes([header[2], header[3]]) as usize;
    if total_len < 4 {
        return Err(TransportError::Malformed("TPKT length underflow".to_string()));
    }
    let mut body = vec![0u8; total_len - 4];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|_| TransportError::TransportClosed)?;
    Ok(body)
}

/// Send an S7 PDU wrapped in a COTP data packet (TPDU type 0xF0, EOT set).
async fn send_cotp_data(stream: &mut TcpStream, s7_pdu: &[u8]) -> Result<(), TransportError> {
    let mut cotp = vec![0x02, 0xF0, 0x80];
    cotp.extend_from_slice(s7_pdu);
    send_tpkt(stream, &cotp).await
}

async fn recv_cotp_data(stream: &mut TcpStream) -> Result<Vec<u8>, TransportError> {
    let frame = recv_tpkt(stream).await?;
    if frame.len() < 3 || frame[1] != 0xF0 {
        return Err(TransportError::Malformed("expected COTP data TPDU".to_string()));
    }
    Ok(frame[3..].to_vec())
}

#[async_trait]
impl Transport for S7Transport {
    async fn request(&mut self, cmd: Command) -> Result<Frame, TransportError> {
        let is_write = matches!(cmd, Command::WriteCoil { .. } | Command::WriteHolding { .. });
        let request = if is_write {
            build_write_request(&cmd)
        } else {
            build_read_request(&cmd)
        };

        tokio::time::timeout(self.timeout, async {
            send_cotp_data(&mut self.stream, &request).await?;
            recv_cotp_data(&mut self.stream).await
        })
        .await
        .map_err(|_| TransportError::Timeout)
        .and_then(|r| r)
        .and_then(|pdu| {
            if is_write {
                parse_write_response(&pdu)
            } else {
                parse_read_response(&cmd, &pdu)
            }
        })
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
