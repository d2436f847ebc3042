//! Modbus TCP (MBAP header framing) over a `tokio::net::TcpStream`
//! (section 4.B.2).

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{Command, Frame, Transport};
use crate::error::TransportError;

const FN_READ_COILS: u8 = 0x01;
const FN_READ_DISCRETE_INPUTS: u8 = 0x02;
const FN_READ_HOLDING: u8 = 0x03;
const FN_READ_INPUT: u8 = 0x04;
const FN_WRITE_COIL: u8 = 0x05;
const FN_WRITE_HOLDING: u8 = 0x06;

pub struct ModbusTcpTransport {
    stream: TcpStream,
    timeout: Duration,
    next_transaction_id: AtomicU16,
}

impl ModbusTcpTransport {
    pub async fn connect(addr: &str, timeout_ms: u64) -> Result<Self, TransportError> {
        let timeout = Duration::from_millis(timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Malformed(format!("connect {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);
        Ok(Self {
            stream,
            timeout,
            next_transaction_id: AtomicU16::new(1),
        })
    }

    fn build_pdu(cmd: &Command) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(5);
        match *cmd {
            Command::ReadCoils { addr, count, .. } => {
                pdu.push(FN_READ_COILS);
                pdu.extend_from_slice(&addr.to_be_bytes());
                pdu.extend_from_slice(&count.to_be_bytes());
            }
            Command::ReadInputs { addr, count, .. } => {
                pdu.push(FN_READ_DISCRETE_INPUTS);
                pdu.extend_from_slice(&addr.to_be_bytes());
                pdu.extend_from_slice(&count.to_be_bytes());
            }
            Command::ReadHoldingRegisters { addr, count, .. } => {
                pdu.push(FN_READ_HOLDING);
                pdu.extend_from_slice(&addr.to_be_bytes());
                pdu.extend_from_slice(&count.to_be_bytes());
            }
            Command::ReadInputRegisters { addr, count, .. } => {
                pdu.push(FN_READ_INPUT);
                pdu.extend_from_slice(&addr.to_be_bytes());
                pdu.extend_from_slice(&count.to_be_bytes());
            }
            Command::WriteCoil { addr, value, .. } => {
                pdu.push(FN_WRITE_COIL);
                pdu.extend_from_slice(&addr.to_be_bytes());
                pdu.extend_from_slice(if value { &[0xFF, 0x00] } else { &[0x00, 0x00] });
            }
            Command::WriteHolding { addr, value, .. } => {
                pdu.push(FN_WRITE_HOLDING);
                pdu.extend_from_slice(&addr.to_be_bytes());
                pdu.extend_from_slice(&value.to_be_bytes());
            }
        }
        pdu
    }

    fn unit_id(cmd: &Command) -> u8 {
        match *cmd {
            Command::ReadCoils { slave, .. }
            | Command::ReadInputs { slave, .. }
            | Command::ReadHoldingRegisters { slave, .. }
            | Command::ReadInputRegisters { slave, .. }
            | Command::WriteCoil { slave, .. }
            | Command::WriteHolding { slave, .. } => slave,
        }
    }

    fn parse_pdu(cmd: &Command, pdu: &[u8]) -> Result<Frame, TransportError> {
        if pdu.is_empty() {
            return Err(TransportError::Malformed("empty PDU".to_string()));
        }
        if pdu[0] & 0x80 != 0 {
            return Err(TransportError::BadFunction);
        }
        match *cmd {
            Command::ReadCoils { count, .. } | Command::ReadInputs { count, .. } => {
                let byte_count = pdu[1] as usize;
                let data = &pdu[2..2 + byte_count];
                let mut bits = Vec::with_capacity(count as usize);
                for i in 0..count as usize {
                    bits.push((data[i / 8] >> (i % 8)) & 1 == 1);
                }
                Ok(Frame::Bits(bits))
            }
            Command::ReadHoldingRegisters { count, .. } | Command::ReadInputRegisters { count, .. } => {
                let byte_count = pdu[1] as usize;
                if byte_count != count as usize * 2 {
                    return Err(TransportError::Malformed(format!(
                        "expected {} register bytes, got {byte_count}",
                        count * 2
                    )));
                }
                let data = &pdu[2..2 + byte_count];
                let regs = data
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                Ok(Frame::Registers(regs))
            }
            Command::WriteCoil { .. } | Command::WriteHolding { .. } => Ok(Frame::Ack),
        }
    }
}

#[async_trait]
impl Transport for ModbusTcpTransport {
    async fn request(&mut self, cmd: Command) -> Result<Frame, TransportError> {
        let pdu = Self::build_pdu(&cmd);
        let unit = Self::unit_id(&cmd);
        let txn = self.next_transaction_id.fetch_add(1, Ordering::Relaxed);

        let mut mbap = Vec::with_capacity(7 + pdu.len());
        mbap.extend_from_slice(&txn.to_be_bytes());
        mbap.extend_from_slice(&0u16.to_be_bytes()); // protocol id
        mbap.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        mbap.push(unit);
        mbap.extend_from_slice(&pdu);

        tokio::time::timeout(self.timeout, async {
            self.stream
                .write_all(&mbap)
                .await
                .map_err(|_| TransportError::TransportClosed)?;

            let mut header = [0u8; 7];
            self.stream
                .read_exact(&mut header)
                .await
                .map_err(|_| TransportError::TransportClosed)?;
            let resp_txn = u16::from_be_bytes([header[0], header[1]]);
            let length = u16::from_be_bytes([header[4], header[5]]) as usize;
            if resp_txn != txn {
                return Err(TransportError::Malformed(
                    "transaction id mismatch".to_string(),
                ));
            }
            if length == 0 {
                return Err(TransportError::Malformed("zero-length MBAP body".to_string()));
            }
            let mut pdu_buf = vec![0u8; length - 1];
            self.stream
                .read_exact(&mut pdu_buf)
                .await
                .map_err(|_| TransportError::TransportClosed)?;
            Ok(pdu_buf)
        })
        .await
        .map_err(|_| TransportError::Timeout)
        .and_then(|r| r)
        .and_then(|pdu_buf| Self::parse_pdu(&cmd, &pdu_buf))
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
