//! Modbus RTU over a physical or virtual serial line (section 4.B.1).

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use super::rtu_frame;
use super::{Command, Frame, Transport};
use crate::error::TransportError;

/// Serial line parameters for an RTU port, mirroring the fields carried in
/// `PortRecord` for `PortKind::ModbusRtu`.
#[derive(Debug, Clone)]
pub struct RtuLineConfig {
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: char,
    pub timeout_ms: u64,
}

impl Default for RtuLineConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: 'N',
            timeout_ms: 3000,
        }
    }
}

pub struct ModbusRtuTransport {
    port: SerialStream,
    timeout: Duration,
}

impl ModbusRtuTransport {
    pub fn open(cfg: &RtuLineConfig) -> Result<Self, TransportError> {
        let data_bits = match cfg.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let stop_bits = match cfg.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };
        let parity = match cfg.parity {
            'E' | 'e' => Parity::Even,
            'O' | 'o' => Parity::Odd,
            _ => Parity::None,
        };

        let port = tokio_serial::new(&cfg.device, cfg.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| TransportError::Malformed(format!("open {}: {e}", cfg.device)))?;

        Ok(Self {
            port,
            timeout: Duration::from_millis(cfg.timeout_ms),
        })
    }
}

#[async_trait]
impl Transport for ModbusRtuTransport {
    async fn request(&mut self, cmd: Command) -> Result<Frame, TransportError> {
        let request = rtu_frame::build_request(&cmd);
        let expected = rtu_frame::expected_response_len(&cmd);

        tokio::time::timeout(self.timeout, async {
            self.port
                .write_all(&request)
                .await
                .map_err(|_| TransportError::TransportClosed)?;

            let mut buf = vec![0u8; expected];
            self.port
                .read_exact(&mut buf)
                .await
                .map_err(|_| TransportError::TransportClosed)?;
            Ok(buf)
        })
        .await
        .map_err(|_| TransportError::Timeout)
        .and_then(|r| r)
        .and_then(|raw| rtu_frame::parse_response(&cmd, &raw))
    }

    async fn close(&mut self) {
        let _ = self.port.shutdown().await;
    }
}
