//! Modbus server dispatchers for TCP and RTU.
//!
//! Both servers parse inbound frames, invoke a user-supplied
//! [`ServerHandler`] and encode the result back out. The handler trait
//! has default method bodies that answer `IllegalFunction`, so an
//! implementation only fills in the functions it serves;
//! [`RegisterBank`](crate::register_bank::RegisterBank) is the
//! batteries-included implementation backed by in-memory storage.
//!
//! Dispatch is shared: [`dispatch_pdu`] switches on the function code
//! and maps handler errors to exception responses. The transports wrap
//! it differently — MBAP echo for TCP, address + CRC for RTU. An RTU
//! frame that fails its CRC check is never answered; the server emits
//! [`ServerEvent::CrcErrorDetected`] instead.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_serial::{ClearBuffer, DataBits, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};

use crate::crc16;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{
    pack_bits, registers_to_bytes, unpack_bits, ServerId, UnitId, BROADCAST_UNIT,
};
use crate::transport::{MAX_RTU_FRAME_SIZE, MAX_TCP_FRAME_SIZE};

/// Notifications emitted by a running server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected(SocketAddr),
    ClientDisconnected(SocketAddr),
    /// An RTU request frame failed its CRC check and was dropped
    /// without a response.
    CrcErrorDetected,
}

/// User-supplied request handlers.
///
/// Every method defaults to an `IllegalFunction` exception; implement
/// the ones the server should answer. Handlers are called from the
/// server's receive task and must not block.
#[async_trait]
pub trait ServerHandler: Send + Sync {
    async fn read_coils(&self, unit_id: UnitId, address: u16, count: u16) -> ModbusResult<Vec<bool>> {
        let _ = (unit_id, address, count);
        Err(ModbusError::exception(0x01, 0x01))
    }

    async fn read_discrete_inputs(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<bool>> {
        let _ = (unit_id, address, count);
        Err(ModbusError::exception(0x02, 0x01))
    }

    async fn read_holding_registers(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        let _ = (unit_id, address, count);
        Err(ModbusError::exception(0x03, 0x01))
    }

    async fn read_input_registers(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        let _ = (unit_id, address, count);
        Err(ModbusError::exception(0x04, 0x01))
    }

    async fn write_single_coil(&self, unit_id: UnitId, address: u16, value: bool) -> ModbusResult<()> {
        let _ = (unit_id, address, value);
        Err(ModbusError::exception(0x05, 0x01))
    }

    async fn write_single_register(
        &self,
        unit_id: UnitId,
        address: u16,
        value: u16,
    ) -> ModbusResult<()> {
        let _ = (unit_id, address, value);
        Err(ModbusError::exception(0x06, 0x01))
    }

    async fn write_multiple_coils(
        &self,
        unit_id: UnitId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        let _ = (unit_id, address, values);
        Err(ModbusError::exception(0x0F, 0x01))
    }

    async fn write_multiple_registers(
        &self,
        unit_id: UnitId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        let _ = (unit_id, address, values);
        Err(ModbusError::exception(0x10, 0x01))
    }

    async fn report_server_id(&self, unit_id: UnitId) -> ModbusResult<ServerId> {
        let _ = unit_id;
        Err(ModbusError::exception(0x11, 0x01))
    }
}

/// Server lifecycle shared by both transports.
#[async_trait]
pub trait ModbusServer: Send + Sync {
    /// Launch the receiver task. Fails if already running.
    async fn start(&mut self) -> ModbusResult<()>;

    /// Signal the receiver task to exit after its current iteration.
    /// Idempotent.
    async fn stop(&mut self) -> ModbusResult<()>;

    fn is_running(&self) -> bool;

    fn get_stats(&self) -> ServerStats;
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections_count: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub crc_errors: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
}

fn exception_code_for(error: &ModbusError) -> u8 {
    match error {
        ModbusError::Exception { code, .. } => *code,
        ModbusError::InvalidFunction { .. } => 0x01,
        ModbusError::InvalidAddress { .. } => 0x02,
        ModbusError::InvalidData { .. } | ModbusError::Frame { .. } => 0x03,
        _ => 0x04,
    }
}

/// Build an exception response PDU for `function`.
pub fn exception_pdu(function: u8, code: u8) -> Vec<u8> {
    vec![function | 0x80, code]
}

async fn process_pdu(
    handler: &dyn ServerHandler,
    unit_id: UnitId,
    pdu: &[u8],
) -> ModbusResult<Vec<u8>> {
    if pdu.is_empty() {
        return Err(ModbusError::frame("empty request PDU"));
    }
    let function = pdu[0];
    let data = &pdu[1..];

    match function {
        0x01 | 0x02 => {
            if data.len() < 4 {
                return Err(ModbusError::frame("short read request"));
            }
            let address = u16::from_be_bytes([data[0], data[1]]);
            let count = u16::from_be_bytes([data[2], data[3]]);
            if count == 0 || count > 2000 {
                return Err(ModbusError::invalid_data("bad coil count"));
            }
            let bits = if function == 0x01 {
                handler.read_coils(unit_id, address, count).await?
            } else {
                handler.read_discrete_inputs(unit_id, address, count).await?
            };
            let packed = pack_bits(&bits[..bits.len().min(count as usize)]);
            let mut response = Vec::with_capacity(2 + packed.len());
            response.push(function);
            response.push(packed.len() as u8);
            response.extend_from_slice(&packed);
            Ok(response)
        }
        0x03 | 0x04 => {
            if data.len() < 4 {
                return Err(ModbusError::frame("short read request"));
            }
            let address = u16::from_be_bytes([data[0], data[1]]);
            let count = u16::from_be_bytes([data[2], data[3]]);
            if count == 0 || count > crate::MAX_REGISTERS_PER_REQUEST {
                return Err(ModbusError::invalid_data("bad register count"));
            }
            let registers = if function == 0x03 {
                handler.read_holding_registers(unit_id, address, count).await?
            } else {
                handler.read_input_registers(unit_id, address, count).await?
            };
            let mut response = Vec::with_capacity(2 + registers.len() * 2);
            response.push(function);
            response.push((registers.len() * 2) as u8);
            response.extend_from_slice(&registers_to_bytes(&registers));
            Ok(response)
        }
        0x05 => {
            if data.len() < 4 {
                return Err(ModbusError::frame("short write request"));
            }
            let address = u16::from_be_bytes([data[0], data[1]]);
            let raw = u16::from_be_bytes([data[2], data[3]]);
            // RTU frames ON as 0xFF00; the legacy TCP encoding uses
            // 0xFFFF. Accept both.
            let value = match raw {
                0x0000 => false,
                0xFF00 | 0xFFFF => true,
                _ => return Err(ModbusError::invalid_data("bad coil value")),
            };
            handler.write_single_coil(unit_id, address, value).await?;
            let mut response = Vec::with_capacity(5);
            response.push(function);
            response.extend_from_slice(&data[..4]);
            Ok(response)
        }
        0x06 => {
            if data.len() < 4 {
                return Err(ModbusError::frame("short write request"));
            }
            let address = u16::from_be_bytes([data[0], data[1]]);
            let value = u16::from_be_bytes([data[2], data[3]]);
            handler.write_single_register(unit_id, address, value).await?;
            let mut response = Vec::with_capacity(5);
            response.push(function);
            response.extend_from_slice(&data[..4]);
            Ok(response)
        }
        0x0F => {
            if data.len() < 5 {
                return Err(ModbusError::frame("short write request"));
            }
            let address = u16::from_be_bytes([data[0], data[1]]);
            let count = u16::from_be_bytes([data[2], data[3]]);
            let byte_count = data[4] as usize;
            if count == 0 || count > 1968 {
                return Err(ModbusError::invalid_data("bad coil count"));
            }
            if data.len() < 5 + byte_count || byte_count < (count as usize).div_ceil(8) {
                return Err(ModbusError::frame("truncated coil payload"));
            }
            let values = unpack_bits(&data[5..5 + byte_count], count as usize);
            handler.write_multiple_coils(unit_id, address, &values).await?;
            let mut response = Vec::with_capacity(5);
            response.push(function);
            response.extend_from_slice(&data[..4]);
            Ok(response)
        }
        0x10 => {
            if data.len() < 5 {
                return Err(ModbusError::frame("short write request"));
            }
            let address = u16::from_be_bytes([data[0], data[1]]);
            let count = u16::from_be_bytes([data[2], data[3]]);
            let byte_count = data[4] as usize;
            if byte_count != count as usize * 2 || data.len() < 5 + byte_count {
                return Err(ModbusError::frame("truncated register payload"));
            }
            let values: Vec<u16> = data[5..5 + byte_count]
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            handler
                .write_multiple_registers(unit_id, address, &values)
                .await?;
            let mut response = Vec::with_capacity(5);
            response.push(function);
            response.extend_from_slice(&data[..4]);
            Ok(response)
        }
        0x11 => {
            let id = handler.report_server_id(unit_id).await?;
            let byte_count = 1 + id.additional_data.len();
            let mut response = Vec::with_capacity(3 + byte_count);
            response.push(function);
            response.push(byte_count as u8);
            response.push(id.server_id);
            response.extend_from_slice(&id.additional_data);
            response.push(id.run_indicator);
            Ok(response)
        }
        0x17 => {
            if data.len() < 9 {
                return Err(ModbusError::frame("short read/write request"));
            }
            let read_address = u16::from_be_bytes([data[0], data[1]]);
            let read_count = u16::from_be_bytes([data[2], data[3]]);
            let write_address = u16::from_be_bytes([data[4], data[5]]);
            let write_count = u16::from_be_bytes([data[6], data[7]]);
            let byte_count = data[8] as usize;
            if byte_count != write_count as usize * 2 || data.len() < 9 + byte_count {
                return Err(ModbusError::frame("truncated register payload"));
            }
            if read_count == 0 || read_count > crate::MAX_REGISTERS_PER_REQUEST {
                return Err(ModbusError::invalid_data("bad register count"));
            }
            let values: Vec<u16> = data[9..9 + byte_count]
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            // Write executes before the read, per the function's
            // definition.
            handler
                .write_multiple_registers(unit_id, write_address, &values)
                .await?;
            let registers = handler
                .read_holding_registers(unit_id, read_address, read_count)
                .await?;
            let mut response = Vec::with_capacity(2 + registers.len() * 2);
            response.push(function);
            response.push((registers.len() * 2) as u8);
            response.extend_from_slice(&registers_to_bytes(&registers));
            Ok(response)
        }
        other => Err(ModbusError::invalid_function(other)),
    }
}

/// Dispatch a request PDU to `handler`, mapping any error to an
/// exception response PDU. Never fails: the caller always has
/// something well-formed to send back.
pub async fn dispatch_pdu(handler: &dyn ServerHandler, unit_id: UnitId, pdu: &[u8]) -> Vec<u8> {
    match process_pdu(handler, unit_id, pdu).await {
        Ok(response) => response,
        Err(e) => {
            let function = pdu.first().copied().unwrap_or(0);
            debug!("request 0x{:02X} from unit {} failed: {}", function, unit_id, e);
            exception_pdu(function, exception_code_for(&e))
        }
    }
}

// ---------------------------------------------------------------------------
// TCP server
// ---------------------------------------------------------------------------

/// Modbus TCP server configuration.
#[derive(Clone)]
pub struct ModbusTcpServerConfig {
    pub bind_address: SocketAddr,
    pub max_connections: usize,
    pub request_timeout: Duration,
}

impl Default for ModbusTcpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], crate::DEFAULT_TCP_PORT)),
            max_connections: 100,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Modbus TCP server: one accept-loop task, one task per connection.
pub struct ModbusTcpServer {
    config: ModbusTcpServerConfig,
    handler: Arc<dyn ServerHandler>,
    stats: Arc<Mutex<ServerStats>>,
    events: broadcast::Sender<ServerEvent>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    running: Arc<AtomicBool>,
    start_time: Option<Instant>,
    local_addr: Option<SocketAddr>,
}

impl ModbusTcpServer {
    /// Create a server bound to `bind_address` once started.
    pub fn new(bind_address: &str, handler: Arc<dyn ServerHandler>) -> ModbusResult<Self> {
        let bind_address = bind_address
            .parse()
            .map_err(|e| ModbusError::configuration(format!("invalid bind address: {}", e)))?;
        Ok(Self::with_config(
            ModbusTcpServerConfig {
                bind_address,
                ..Default::default()
            },
            handler,
        ))
    }

    pub fn with_config(config: ModbusTcpServerConfig, handler: Arc<dyn ServerHandler>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            handler,
            stats: Arc::new(Mutex::new(ServerStats::default())),
            events,
            shutdown_tx: None,
            running: Arc::new(AtomicBool::new(false)),
            start_time: None,
            local_addr: None,
        }
    }

    /// Subscribe to [`ServerEvent`] notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// The address the listener is bound to, once started. Useful when
    /// binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn handle_connection(
        mut stream: TcpStream,
        peer: SocketAddr,
        handler: Arc<dyn ServerHandler>,
        stats: Arc<Mutex<ServerStats>>,
        events: broadcast::Sender<ServerEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
        request_timeout: Duration,
    ) {
        info!("client connected: {}", peer);
        let _ = events.send(ServerEvent::ClientConnected(peer));
        stats.lock().unwrap().connections_count += 1;

        let mut buffer = BytesMut::with_capacity(MAX_TCP_FRAME_SIZE);

        'conn: loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break 'conn,
                result = timeout(request_timeout, stream.read_buf(&mut buffer)) => {
                    match result {
                        Ok(Ok(0)) => break 'conn,
                        Ok(Ok(n)) => {
                            stats.lock().unwrap().bytes_received += n as u64;
                        }
                        Ok(Err(e)) => {
                            warn!("read error from {}: {}", peer, e);
                            break 'conn;
                        }
                        Err(_) => {
                            debug!("idle timeout from {}", peer);
                            break 'conn;
                        }
                    }
                }
            }

            // Drain every complete MBAP frame in the buffer.
            while buffer.len() >= 7 {
                let length = u16::from_be_bytes([buffer[4], buffer[5]]) as usize;
                if length < 2 || 6 + length > MAX_TCP_FRAME_SIZE {
                    warn!("malformed MBAP length {} from {}", length, peer);
                    break 'conn;
                }
                if buffer.len() < 6 + length {
                    break;
                }
                let frame = buffer.split_to(6 + length);
                let protocol_id = u16::from_be_bytes([frame[2], frame[3]]);
                if protocol_id != 0 {
                    warn!("non-zero protocol id from {}", peer);
                    break 'conn;
                }
                let unit_id = frame[6];
                stats.lock().unwrap().total_requests += 1;

                let response_pdu = dispatch_pdu(handler.as_ref(), unit_id, &frame[7..]).await;
                let is_exception = response_pdu
                    .first()
                    .map(|f| f & 0x80 != 0)
                    .unwrap_or(true);

                let mut response = Vec::with_capacity(7 + response_pdu.len());
                response.extend_from_slice(&frame[0..2]);
                response.extend_from_slice(&0u16.to_be_bytes());
                response.extend_from_slice(&(1 + response_pdu.len() as u16).to_be_bytes());
                response.push(unit_id);
                response.extend_from_slice(&response_pdu);

                if let Err(e) = stream.write_all(&response).await {
                    error!("failed to respond to {}: {}", peer, e);
                    break 'conn;
                }

                let mut stats = stats.lock().unwrap();
                stats.bytes_sent += response.len() as u64;
                if is_exception {
                    stats.failed_requests += 1;
                } else {
                    stats.successful_requests += 1;
                }
            }
        }

        info!("client disconnected: {}", peer);
        let _ = events.send(ServerEvent::ClientDisconnected(peer));
    }
}

#[async_trait]
impl ModbusServer for ModbusTcpServer {
    async fn start(&mut self) -> ModbusResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ModbusError::configuration("server is already running"));
        }

        let listener = TcpListener::bind(self.config.bind_address).await.map_err(|e| {
            ModbusError::connection(format!(
                "failed to bind to {}: {}",
                self.config.bind_address, e
            ))
        })?;
        self.local_addr = listener.local_addr().ok();

        info!("Modbus TCP server listening on {}", self.config.bind_address);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.start_time = Some(Instant::now());
        self.running.store(true, Ordering::SeqCst);

        let handler = self.handler.clone();
        let stats = self.stats.clone();
        let events = self.events.clone();
        let running = self.running.clone();
        let request_timeout = self.config.request_timeout;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                let handler = handler.clone();
                                let stats = stats.clone();
                                let events = events.clone();
                                let shutdown_rx = shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    Self::handle_connection(
                                        stream,
                                        peer,
                                        handler,
                                        stats,
                                        events,
                                        shutdown_rx,
                                        request_timeout,
                                    )
                                    .await;
                                });
                            }
                            Err(e) => error!("accept failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Modbus TCP server stopping");
                        break;
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        });

        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(());
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn get_stats(&self) -> ServerStats {
        let mut stats = self.stats.lock().unwrap().clone();
        if let Some(start_time) = self.start_time {
            stats.uptime_seconds = start_time.elapsed().as_secs();
        }
        stats
    }
}

// ---------------------------------------------------------------------------
// RTU server
// ---------------------------------------------------------------------------

/// Modbus RTU server configuration.
#[derive(Clone)]
pub struct ModbusRtuServerConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    /// Unit address this server answers for; `None` answers every
    /// address. Broadcast writes (unit 0) are always executed and
    /// never answered.
    pub unit_id: Option<UnitId>,
    /// Deadline for the remainder of a frame once its first bytes have
    /// arrived.
    pub frame_timeout: Duration,
}

impl ModbusRtuServerConfig {
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            unit_id: None,
            frame_timeout: Duration::from_millis(500),
        }
    }
}

/// Modbus RTU server: a single receiver task on the serial stream.
pub struct ModbusRtuServer {
    config: ModbusRtuServerConfig,
    handler: Arc<dyn ServerHandler>,
    stats: Arc<Mutex<ServerStats>>,
    events: broadcast::Sender<ServerEvent>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    running: Arc<AtomicBool>,
    start_time: Option<Instant>,
}

impl ModbusRtuServer {
    pub fn new(config: ModbusRtuServerConfig, handler: Arc<dyn ServerHandler>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            handler,
            stats: Arc::new(Mutex::new(ServerStats::default())),
            events,
            shutdown_tx: None,
            running: Arc::new(AtomicBool::new(false)),
            start_time: None,
        }
    }

    /// Subscribe to [`ServerEvent`] notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Read the remainder of a request whose first two bytes (address,
    /// function) have arrived, using the length implied by the
    /// function code. Returns the complete frame including CRC.
    async fn read_request(
        port: &mut SerialStream,
        head: [u8; 2],
        frame_timeout: Duration,
    ) -> ModbusResult<BytesMut> {
        let function = head[1];
        let mut frame = BytesMut::with_capacity(MAX_RTU_FRAME_SIZE);
        frame.put_slice(&head);

        match function {
            // Fixed-size requests: start/value + quantity/value + CRC.
            0x01..=0x06 => {
                let mut rest = [0u8; 6];
                timeout(frame_timeout, port.read_exact(&mut rest)).await??;
                frame.put_slice(&rest);
            }
            // Multi-writes: the byte count at offset 6 reveals the tail.
            0x0F | 0x10 => {
                let mut fixed = [0u8; 5];
                timeout(frame_timeout, port.read_exact(&mut fixed)).await??;
                frame.put_slice(&fixed);
                let byte_count = fixed[4] as usize;
                if 7 + byte_count + 2 > MAX_RTU_FRAME_SIZE {
                    return Err(ModbusError::frame("request frame too large"));
                }
                let mut tail = vec![0u8; byte_count + 2];
                timeout(frame_timeout, port.read_exact(&mut tail)).await??;
                frame.put_slice(&tail);
            }
            // Report Server ID request is just address + function + CRC.
            0x11 => {
                let mut crc = [0u8; 2];
                timeout(frame_timeout, port.read_exact(&mut crc)).await??;
                frame.put_slice(&crc);
            }
            _ => {
                return Err(ModbusError::invalid_function(function));
            }
        }
        Ok(frame)
    }

    /// Drain whatever is in flight after an unparseable request so the
    /// receiver resynchronises on the next frame.
    async fn drain_input(port: &mut SerialStream) {
        let mut scratch = [0u8; 64];
        while let Ok(Ok(n)) = timeout(Duration::from_millis(50), port.read(&mut scratch)).await {
            if n == 0 {
                break;
            }
        }
        let _ = port.clear(ClearBuffer::Input);
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        mut port: SerialStream,
        handler: Arc<dyn ServerHandler>,
        unit_filter: Option<UnitId>,
        stats: Arc<Mutex<ServerStats>>,
        events: broadcast::Sender<ServerEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
        running: Arc<AtomicBool>,
        frame_timeout: Duration,
    ) {
        loop {
            let mut head = [0u8; 2];
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = port.read_exact(&mut head) => {
                    if let Err(e) = result {
                        error!("serial read failed: {}", e);
                        break;
                    }
                }
            }

            let frame = match Self::read_request(&mut port, head, frame_timeout).await {
                Ok(frame) => frame,
                Err(ModbusError::InvalidFunction { code }) => {
                    // Unknown length: resynchronise, then answer
                    // IllegalFunction unless it was a broadcast.
                    Self::drain_input(&mut port).await;
                    stats.lock().unwrap().failed_requests += 1;
                    if head[0] != BROADCAST_UNIT
                        && unit_filter.map(|u| u == head[0]).unwrap_or(true)
                    {
                        let pdu = exception_pdu(code, 0x01);
                        let _ = Self::send_response(&mut port, head[0], &pdu, &stats).await;
                    }
                    continue;
                }
                Err(e) => {
                    debug!("incomplete request frame: {}", e);
                    Self::drain_input(&mut port).await;
                    continue;
                }
            };

            stats.lock().unwrap().bytes_received += frame.len() as u64;

            // A CRC failure is never answered (Modbus-standard); emit
            // the event and keep listening.
            if crc16::check_crc(&frame).is_err() {
                warn!("CRC error on request frame, dropping");
                let mut stats = stats.lock().unwrap();
                stats.crc_errors += 1;
                stats.failed_requests += 1;
                drop(stats);
                let _ = events.send(ServerEvent::CrcErrorDetected);
                continue;
            }

            let unit_id = frame[0];
            if let Some(my_unit) = unit_filter {
                if unit_id != my_unit && unit_id != BROADCAST_UNIT {
                    continue;
                }
            }

            stats.lock().unwrap().total_requests += 1;
            let response_pdu =
                dispatch_pdu(handler.as_ref(), unit_id, &frame[1..frame.len() - 2]).await;

            // Broadcasts are executed but never answered.
            if unit_id == BROADCAST_UNIT {
                continue;
            }

            let is_exception = response_pdu.first().map(|f| f & 0x80 != 0).unwrap_or(true);
            if Self::send_response(&mut port, unit_id, &response_pdu, &stats)
                .await
                .is_err()
            {
                break;
            }
            let mut stats = stats.lock().unwrap();
            if is_exception {
                stats.failed_requests += 1;
            } else {
                stats.successful_requests += 1;
            }
        }
        running.store(false, Ordering::SeqCst);
    }

    async fn send_response(
        port: &mut SerialStream,
        unit_id: UnitId,
        pdu: &[u8],
        stats: &Arc<Mutex<ServerStats>>,
    ) -> ModbusResult<()> {
        let mut response = BytesMut::with_capacity(pdu.len() + 3);
        response.put_u8(unit_id);
        response.put_slice(pdu);
        response.put_u16(0);
        crc16::fill_crc(&mut response)?;
        port.write_all(&response).await?;
        port.flush().await?;
        stats.lock().unwrap().bytes_sent += response.len() as u64;
        Ok(())
    }
}

#[async_trait]
impl ModbusServer for ModbusRtuServer {
    async fn start(&mut self) -> ModbusResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ModbusError::configuration("server is already running"));
        }

        let port = tokio_serial::new(&self.config.port, self.config.baud_rate)
            .data_bits(self.config.data_bits)
            .stop_bits(self.config.stop_bits)
            .parity(self.config.parity)
            .open_native_async()
            .map_err(|e| {
                ModbusError::connection(format!("failed to open {}: {}", self.config.port, e))
            })?;

        info!(
            "Modbus RTU server listening on {} at {} baud",
            self.config.port, self.config.baud_rate
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.start_time = Some(Instant::now());
        self.running.store(true, Ordering::SeqCst);

        tokio::spawn(Self::run_loop(
            port,
            self.handler.clone(),
            self.config.unit_id,
            self.stats.clone(),
            self.events.clone(),
            shutdown_rx,
            self.running.clone(),
            self.config.frame_timeout,
        ));

        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(());
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn get_stats(&self) -> ServerStats {
        let mut stats = self.stats.lock().unwrap().clone();
        if let Some(start_time) = self.start_time {
            stats.uptime_seconds = start_time.elapsed().as_secs();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register_bank::RegisterBank;

    #[tokio::test]
    async fn test_dispatch_read_holding_registers() {
        let bank = RegisterBank::new();
        bank.set_holding_registers(10, &[0x002A, 0x0014]).unwrap();

        let response = dispatch_pdu(&bank, 7, &[0x03, 0x00, 0x0A, 0x00, 0x02]).await;
        assert_eq!(response, vec![0x03, 0x04, 0x00, 0x2A, 0x00, 0x14]);
    }

    #[tokio::test]
    async fn test_dispatch_write_read_roundtrip() {
        let bank = RegisterBank::new();

        // Write multiple registers, then read them back.
        let write = dispatch_pdu(
            &bank,
            1,
            &[0x10, 0x00, 0x64, 0x00, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78],
        )
        .await;
        assert_eq!(write, vec![0x10, 0x00, 0x64, 0x00, 0x02]);

        let read = dispatch_pdu(&bank, 1, &[0x03, 0x00, 0x64, 0x00, 0x02]).await;
        assert_eq!(read, vec![0x03, 0x04, 0x12, 0x34, 0x56, 0x78]);
    }

    #[tokio::test]
    async fn test_dispatch_coil_on_encodings() {
        let bank = RegisterBank::new();

        // RTU-style ON.
        let resp = dispatch_pdu(&bank, 1, &[0x05, 0x00, 0x07, 0xFF, 0x00]).await;
        assert_eq!(resp, vec![0x05, 0x00, 0x07, 0xFF, 0x00]);
        assert!(bank.read_coils(1, 7, 1).await.unwrap()[0]);

        // Legacy TCP-style ON.
        let resp = dispatch_pdu(&bank, 1, &[0x05, 0x00, 0x08, 0xFF, 0xFF]).await;
        assert_eq!(resp, vec![0x05, 0x00, 0x08, 0xFF, 0xFF]);
        assert!(bank.read_coils(1, 8, 1).await.unwrap()[0]);

        // Anything else is an IllegalDataValue exception.
        let resp = dispatch_pdu(&bank, 1, &[0x05, 0x00, 0x09, 0x12, 0x34]).await;
        assert_eq!(resp, vec![0x85, 0x03]);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_function() {
        let bank = RegisterBank::new();
        let response = dispatch_pdu(&bank, 1, &[0x2B, 0x00, 0x00]).await;
        assert_eq!(response, vec![0xAB, 0x01]);
    }

    #[tokio::test]
    async fn test_dispatch_multiple_coils_lsb_first() {
        let bank = RegisterBank::new();

        // S5 payload: 17 alternating coils starting at 19.
        let response = dispatch_pdu(
            &bank,
            17,
            &[0x0F, 0x00, 0x13, 0x00, 0x11, 0x03, 0x55, 0x55, 0x01],
        )
        .await;
        assert_eq!(response, vec![0x0F, 0x00, 0x13, 0x00, 0x11]);

        let coils = bank.read_coils(17, 19, 17).await.unwrap();
        for (i, coil) in coils.iter().enumerate() {
            assert_eq!(*coil, i % 2 == 0, "coil {}", i);
        }
    }

    #[tokio::test]
    async fn test_dispatch_out_of_range_address() {
        let bank = RegisterBank::with_sizes(16, 16, 16, 16);
        let response = dispatch_pdu(&bank, 1, &[0x03, 0x00, 0x20, 0x00, 0x01]).await;
        assert_eq!(response, vec![0x83, 0x02]);
    }
}
