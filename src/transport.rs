//! Transport framers for Modbus TCP and RTU.
//!
//! Both transports exchange the same PDU; what differs is the
//! envelope. [`TcpTransport`] wraps PDUs in an MBAP header and
//! correlates responses through a per-connection transaction counter.
//! [`RtuTransport`] wraps them in `[unit][PDU][crc16]` over a serial
//! stream and reconstructs response boundaries with the
//! expected-length-from-header strategy, since RTU has no length
//! prefix.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_serial::{ClearBuffer, DataBits, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};

use crate::crc16;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{FunctionCode, ModbusRequest, ModbusResponse, BROADCAST_UNIT};

/// Maximum frame size for Modbus TCP, sized for the largest supported
/// request — a 125-register multi-write: MBAP (6) + unit (1) +
/// 256-byte PDU.
pub const MAX_TCP_FRAME_SIZE: usize = 263;

/// Maximum frame size for Modbus RTU, sized the same way: unit (1) +
/// 256-byte PDU + CRC (2).
pub const MAX_RTU_FRAME_SIZE: usize = 259;

/// MBAP header size (transaction + protocol + length), excluding the
/// unit id.
pub const MBAP_HEADER_SIZE: usize = 6;

/// Transport abstraction: one request/response exchange at a time.
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    /// Send a request and await its response.
    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse>;

    /// Whether the underlying stream is usable.
    fn is_connected(&self) -> bool;

    /// Close the transport.
    async fn close(&mut self) -> ModbusResult<()>;

    /// Counters accumulated since the transport was created.
    fn get_stats(&self) -> TransportStats;
}

/// Transport statistics.
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// RS-485 transmit-enable pin.
///
/// Half-duplex transceivers need their driver enabled for the duration
/// of the transmit and released before the reply arrives. The
/// implementation must guarantee the falling edge lands after the
/// write has drained.
#[async_trait]
pub trait TxEnablePin: Send + Sync {
    async fn set_state(&mut self, active: bool) -> ModbusResult<()>;
}

/// Hook invoked after the frame is written and flushed, before the
/// TX-enable pin is released. Used for drain timing on ports whose
/// flush returns before the UART FIFO empties.
pub type PostWriteHook = Box<dyn Fn() + Send + Sync>;

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// Modbus TCP transport (MBAP framing).
pub struct TcpTransport {
    stream: Option<TcpStream>,
    pub address: SocketAddr,
    timeout: Duration,
    transaction_id: u16,
    stats: TransportStats,
}

impl TcpTransport {
    /// Connect to a Modbus TCP server.
    pub async fn new(address: SocketAddr, timeout: Duration) -> ModbusResult<Self> {
        let stream = TcpStream::connect(address).await.map_err(|e| {
            ModbusError::connection(format!("failed to connect to {}: {}", address, e))
        })?;

        Ok(Self {
            stream: Some(stream),
            address,
            timeout,
            transaction_id: 0,
            stats: TransportStats::default(),
        })
    }

    /// Re-establish a dropped connection.
    pub async fn reconnect(&mut self) -> ModbusResult<()> {
        self.stream = None;
        let stream = TcpStream::connect(self.address).await.map_err(|e| {
            ModbusError::connection(format!("failed to reconnect to {}: {}", self.address, e))
        })?;
        self.stream = Some(stream);
        Ok(())
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        if self.transaction_id == 0 {
            self.transaction_id = 1;
        }
        self.transaction_id
    }

    /// Encode an MBAP frame for `request` and advance the transaction
    /// counter. Returns the frame and the transaction id it carries.
    fn encode_request(&mut self, request: &ModbusRequest) -> (Vec<u8>, u16) {
        let transaction_id = self.next_transaction_id();
        let mut pdu = request.pdu();

        // Legacy TCP encoding: single-coil ON frames the value word as
        // 0xFFFF instead of RTU's 0xFF00. Servers accept both.
        if request.function == FunctionCode::WriteSingleCoil && pdu[3] == 0xFF {
            pdu[4] = 0xFF;
        }

        let length = 1 + pdu.len() as u16;
        let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + 1 + pdu.len());
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.push(request.unit_id);
        frame.extend_from_slice(&pdu);
        (frame, transaction_id)
    }

    fn fail_timeout(&mut self, operation: &str) -> ModbusError {
        self.stats.timeouts += 1;
        self.stats.errors += 1;
        self.stream = None;
        ModbusError::timeout(operation, self.timeout.as_millis() as u64)
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        request.validate()?;

        if self.stream.is_none() {
            return Err(ModbusError::NotConnected);
        }

        let (frame, transaction_id) = self.encode_request(request);
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        let stream = self.stream.as_mut().unwrap();
        match timeout(self.timeout, stream.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.stats.errors += 1;
                self.stream = None;
                return Err(ModbusError::connection_lost(e.to_string()));
            }
            Err(_) => return Err(self.fail_timeout("send request")),
        }

        // MBAP (7) + function + length-or-exception byte.
        let mut head = [0u8; 9];
        let stream = self.stream.as_mut().unwrap();
        match timeout(self.timeout, stream.read_exact(&mut head)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                self.stats.errors += 1;
                self.stream = None;
                return Err(ModbusError::connection_lost(e.to_string()));
            }
            Err(_) => return Err(self.fail_timeout("read response header")),
        }

        let response_txn = u16::from_be_bytes([head[0], head[1]]);
        let protocol_id = u16::from_be_bytes([head[2], head[3]]);
        let length = u16::from_be_bytes([head[4], head[5]]) as usize;
        let unit_id = head[6];
        let function = head[7];

        if protocol_id != 0 {
            self.stats.errors += 1;
            return Err(ModbusError::frame("non-zero protocol id"));
        }
        if response_txn != transaction_id {
            self.stats.errors += 1;
            return Err(ModbusError::TransactionMismatch {
                expected: transaction_id,
                actual: response_txn,
            });
        }
        if length < 3 || length > MAX_TCP_FRAME_SIZE {
            self.stats.errors += 1;
            return Err(ModbusError::frame(format!("bad MBAP length {}", length)));
        }

        // `length` counts unit id + PDU; unit + 2 PDU bytes are read.
        let mut pdu = Vec::with_capacity(length - 1);
        pdu.push(function);
        pdu.push(head[8]);
        let remaining = length - 3;
        if remaining > 0 {
            let mut tail = vec![0u8; remaining];
            let stream = self.stream.as_mut().unwrap();
            match timeout(self.timeout, stream.read_exact(&mut tail)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    self.stats.errors += 1;
                    self.stream = None;
                    return Err(ModbusError::connection_lost(e.to_string()));
                }
                Err(_) => return Err(self.fail_timeout("read response data")),
            }
            pdu.extend_from_slice(&tail);
        }

        self.stats.responses_received += 1;
        self.stats.bytes_received += (9 + remaining) as u64;

        let response = ModbusResponse::from_pdu(unit_id, &pdu).map_err(|e| {
            self.stats.errors += 1;
            e
        })?;

        if response.function != request.function {
            self.stats.errors += 1;
            return Err(ModbusError::protocol(format!(
                "function echo mismatch: sent {}, got {}",
                request.function, response.function
            )));
        }

        Ok(response)
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

// ---------------------------------------------------------------------------
// RTU
// ---------------------------------------------------------------------------

/// Modbus RTU transport over a serial stream.
pub struct RtuTransport {
    port: SerialStream,
    timeout: Duration,
    tx_enable: Option<Box<dyn TxEnablePin>>,
    post_write: Option<PostWriteHook>,
    open: bool,
    stats: TransportStats,
}

impl RtuTransport {
    /// Open a serial port with 8N1 framing and the default timeout.
    pub fn new(path: &str, baud_rate: u32) -> ModbusResult<Self> {
        Self::new_with_config(
            path,
            baud_rate,
            DataBits::Eight,
            StopBits::One,
            Parity::None,
            Duration::from_millis(crate::DEFAULT_TIMEOUT_MS),
        )
    }

    /// Open a serial port with explicit framing parameters.
    pub fn new_with_config(
        path: &str,
        baud_rate: u32,
        data_bits: DataBits,
        stop_bits: StopBits,
        parity: Parity,
        timeout: Duration,
    ) -> ModbusResult<Self> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .open_native_async()
            .map_err(|e| ModbusError::connection(format!("failed to open {}: {}", path, e)))?;

        Ok(Self {
            port,
            timeout,
            tx_enable: None,
            post_write: None,
            open: true,
            stats: TransportStats::default(),
        })
    }

    /// Attach an RS-485 transmit-enable pin.
    pub fn set_tx_enable(&mut self, pin: Box<dyn TxEnablePin>) {
        self.tx_enable = Some(pin);
    }

    /// Install a hook that runs after write+flush, before the
    /// TX-enable pin is released.
    pub fn set_post_write_hook(&mut self, hook: PostWriteHook) {
        self.post_write = Some(hook);
    }

    /// Read exactly `buf.len()` bytes, bounded by `deadline`. On
    /// expiry the receive buffer is drained so stragglers cannot
    /// corrupt the next exchange.
    async fn read_exact_deadline(&mut self, buf: &mut [u8], deadline: Instant) -> ModbusResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let _ = self.port.clear(ClearBuffer::Input);
                self.stats.timeouts += 1;
                return Err(ModbusError::timeout(
                    "read response",
                    self.timeout.as_millis() as u64,
                ));
            }
            match timeout(remaining, self.port.read(&mut buf[filled..])).await {
                Ok(Ok(0)) => return Err(ModbusError::connection_lost("serial port closed")),
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    let _ = self.port.clear(ClearBuffer::Input);
                    self.stats.timeouts += 1;
                    return Err(ModbusError::timeout(
                        "read response",
                        self.timeout.as_millis() as u64,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Total RTU response frame length implied by the 3-byte header,
    /// given the function code that was sent.
    fn expected_frame_len(function: u8, third_byte: u8) -> ModbusResult<usize> {
        match function {
            // Write echoes: addr + fc + address(2) + value/qty(2) + crc(2).
            0x05 | 0x06 | 0x0F | 0x10 => Ok(8),
            // Report Server ID carries a run-indicator byte before the CRC.
            0x11 => Ok(3 + third_byte as usize + 1 + 2),
            // Reads: addr + fc + byte count + data + crc.
            0x01 | 0x02 | 0x03 | 0x04 | 0x17 => Ok(3 + third_byte as usize + 2),
            other => Err(ModbusError::invalid_function(other)),
        }
    }

    async fn receive_response(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        let deadline = Instant::now() + self.timeout;

        let mut header = [0u8; 3];
        self.read_exact_deadline(&mut header, deadline).await?;
        let unit_id = header[0];
        let function = header[1];

        // Exception frame: [addr][fc|0x80][code][crc_lo][crc_hi].
        if function & 0x80 != 0 {
            let mut crc = [0u8; 2];
            self.read_exact_deadline(&mut crc, deadline).await?;
            let frame = [header[0], header[1], header[2], crc[0], crc[1]];
            crc16::check_crc(&frame).map_err(|e| {
                self.stats.errors += 1;
                e
            })?;
            self.stats.errors += 1;
            return Err(ModbusError::exception(function & 0x7F, header[2]));
        }

        if function != request.function.to_u8() {
            self.stats.errors += 1;
            let _ = self.port.clear(ClearBuffer::Input);
            return Err(ModbusError::protocol(format!(
                "function echo mismatch: sent 0x{:02X}, got 0x{:02X}",
                request.function.to_u8(),
                function
            )));
        }

        let total = Self::expected_frame_len(function, header[2])?;
        if total > MAX_RTU_FRAME_SIZE {
            self.stats.errors += 1;
            return Err(ModbusError::frame(format!("frame length {} too large", total)));
        }

        let mut frame = BytesMut::with_capacity(total);
        frame.put_slice(&header);
        frame.resize(total, 0);
        self.read_exact_deadline(&mut frame[3..], deadline).await?;

        crc16::check_crc(&frame).map_err(|e| {
            self.stats.errors += 1;
            e
        })?;

        if request.unit_id != 0xFF && unit_id != request.unit_id {
            self.stats.errors += 1;
            return Err(ModbusError::frame(format!(
                "unit address mismatch: sent {}, got {}",
                request.unit_id, unit_id
            )));
        }

        self.stats.responses_received += 1;
        self.stats.bytes_received += total as u64;

        ModbusResponse::from_pdu(unit_id, &frame[1..total - 2])
    }
}

#[async_trait]
impl ModbusTransport for RtuTransport {
    async fn request(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        request.validate()?;

        if !self.open {
            return Err(ModbusError::NotConnected);
        }

        let pdu = request.pdu();
        let mut frame = BytesMut::with_capacity(pdu.len() + 3);
        frame.put_u8(request.unit_id);
        frame.put_slice(&pdu);
        frame.put_u16(0);
        crc16::fill_crc(&mut frame)?;

        // Drop stragglers from previous timed-out exchanges before the
        // new request goes out.
        let _ = self.port.clear(ClearBuffer::Input);

        if let Some(pin) = self.tx_enable.as_mut() {
            pin.set_state(true).await?;
        }

        let mut write_result = self.port.write_all(&frame).await;
        if write_result.is_ok() {
            write_result = self.port.flush().await;
        }

        if let Some(hook) = &self.post_write {
            hook();
        }
        if let Some(pin) = self.tx_enable.as_mut() {
            pin.set_state(false).await?;
        }

        write_result.map_err(|e| {
            self.stats.errors += 1;
            ModbusError::from(e)
        })?;

        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        // Broadcasts are never answered.
        if request.unit_id == BROADCAST_UNIT {
            return Ok(ModbusResponse::new(
                BROADCAST_UNIT,
                request.function,
                Vec::new(),
            ));
        }

        self.receive_response(request).await
    }

    fn is_connected(&self) -> bool {
        self.open
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.open = false;
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ModbusRequest;

    #[test]
    fn test_expected_frame_lengths() {
        // Write echo is always 8 bytes.
        assert_eq!(RtuTransport::expected_frame_len(0x06, 0x00).unwrap(), 8);
        assert_eq!(RtuTransport::expected_frame_len(0x10, 0x00).unwrap(), 8);
        // Read of 2 registers: 3 + 4 + 2.
        assert_eq!(RtuTransport::expected_frame_len(0x03, 4).unwrap(), 9);
        // Report Server ID adds the run-indicator byte.
        assert_eq!(RtuTransport::expected_frame_len(0x11, 3).unwrap(), 9);
        assert!(RtuTransport::expected_frame_len(0x2B, 0).is_err());
    }

    #[test]
    fn test_rtu_request_frame_bytes() {
        let request = ModbusRequest::read(7, FunctionCode::ReadHoldingRegisters, 11, 13);
        let pdu = request.pdu();
        let mut frame = BytesMut::new();
        frame.put_u8(request.unit_id);
        frame.put_slice(&pdu);
        frame.put_u16(0);
        crc16::fill_crc(&mut frame).unwrap();
        assert_eq!(&frame[..], &[0x07, 0x03, 0x00, 0x0B, 0x00, 0x0D, 0xF5, 0xAB]);
    }

    #[tokio::test]
    async fn test_tcp_transport_refuses_when_disconnected() {
        let addr = "127.0.0.1:59999".parse().unwrap();
        // No server listening; creation fails with a connection error.
        let result = TcpTransport::new(addr, Duration::from_millis(200)).await;
        assert!(result.is_err());
    }
}
