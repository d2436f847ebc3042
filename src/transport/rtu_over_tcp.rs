//! RTU-over-TCP: the same slave+PDU+CRC byte layout as serial RTU, carried
//! over a bare TCP socket with no MBAP header (section 4.B.3). Common for
//! serial-to-Ethernet gateways that bridge a physical RTU bus.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::rtu_frame;
use super::{Command, Frame, Transport};
use crate::error::TransportError;

pub struct RtuOverTcpTransport {
    stream: TcpStream,
    timeout: Duration,
}

impl RtuOverTcpTransport {
    pub async fn connect(addr: &str, timeout_ms: u64) -> Result<Self, TransportError> {
        let timeout = Duration::from_millis(timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Malformed(format!("connect {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);
        Ok(Self { stream, timeout })
    }
}

#[async_trait]
impl Transport for RtuOverTcpTransport {
    async fn request(&mut self, cmd: Command) -> Result<Frame, TransportError> {
        let request = rtu_frame::build_request(&cmd);
        let expected = rtu_frame::expected_response_len(&cmd);

        tokio::time::timeout(self.timeout, async {
            self.stream
                .write_all(&request)
                .await
                .map_err(|_| TransportError::TransportClosed)?;

            let mut buf = vec![0u8; expected];
            self.stream
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
        let _ = self.stream.shutdown().await;
    }
}
