//! High-level Modbus client implementations.
//!
//! Modbus TCP and RTU share the application layer (the PDU) and differ
//! only in transport encapsulation, so the request/response logic is
//! written once in [`GenericModbusClient`] and reused by
//! [`ModbusTcpClient`] and [`ModbusRtuClient`].
//!
//! All operations take `&self`: a single-permit `tokio::sync::Mutex`
//! inside the client serialises exchanges so exactly one frame is on
//! the wire per client instance. Concurrent callers queue on the gate
//! and are granted access in FIFO order, which lets a polling engine
//! and ad-hoc writers share one client safely.
//!
//! Legacy register numbering is honoured for convenience: holding
//! register addresses ≥ 40001 and input register addresses ≥ 30001
//! are normalised to 0-based wire offsets before framing. A caller
//! passing 40001 therefore cannot address wire offset 40001 directly.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use crate::codec::{self, WordOrder};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::protocol::{FunctionCode, ModbusRequest, ModbusResponse, ServerId, UnitId};
use crate::transport::{ModbusTransport, RtuTransport, TcpTransport, TransportStats, TxEnablePin};

/// Connection lifecycle notifications emitted by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
}

/// First register number of the legacy 4xxxx holding-register range.
pub const HOLDING_REGISTER_BASE: u16 = 40001;
/// First register number of the legacy 3xxxx input-register range.
pub const INPUT_REGISTER_BASE: u16 = 30001;

fn normalize_holding(address: u16) -> u16 {
    if address >= HOLDING_REGISTER_BASE {
        address - HOLDING_REGISTER_BASE
    } else {
        address
    }
}

fn normalize_input(address: u16) -> u16 {
    if address >= INPUT_REGISTER_BASE {
        address - INPUT_REGISTER_BASE
    } else {
        address
    }
}

fn check_register_count(count: u16) -> ModbusResult<()> {
    if count == 0 || count > crate::MAX_REGISTERS_PER_REQUEST {
        return Err(ModbusError::invalid_data(format!(
            "register count {} out of range 1..={}",
            count,
            crate::MAX_REGISTERS_PER_REQUEST
        )));
    }
    Ok(())
}

fn check_coil_count(count: u16) -> ModbusResult<()> {
    if count == 0 || count > crate::MAX_COILS_PER_REQUEST {
        return Err(ModbusError::invalid_data(format!(
            "coil count {} out of range 1..={}",
            count,
            crate::MAX_COILS_PER_REQUEST
        )));
    }
    Ok(())
}

/// Client operations shared by every transport.
///
/// Failure semantics: `Timeout`, `CrcMismatch`, `Exception` and
/// transport faults propagate to the caller; nothing is retried here.
/// Count violations fail before any I/O.
#[async_trait]
pub trait ModbusClient: Send + Sync {
    /// Read coils (0x01).
    async fn read_coils(&self, unit_id: UnitId, address: u16, count: u16)
        -> ModbusResult<Vec<bool>>;

    /// Read discrete inputs (0x02).
    async fn read_discrete_inputs(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<bool>>;

    /// Read holding registers (0x03). Addresses ≥ 40001 are normalised.
    async fn read_holding_registers(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>>;

    /// Read input registers (0x04). Addresses ≥ 30001 are normalised.
    async fn read_input_registers(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>>;

    /// Read `float_count` IEEE-754 floats from holding registers, two
    /// registers each, low word first.
    async fn read_holding_registers_f32(
        &self,
        unit_id: UnitId,
        address: u16,
        float_count: u16,
    ) -> ModbusResult<Vec<f32>>;

    /// Write a single coil (0x05).
    async fn write_single_coil(
        &self,
        unit_id: UnitId,
        address: u16,
        value: bool,
    ) -> ModbusResult<()>;

    /// Write a single holding register (0x06). Addresses ≥ 40001 are
    /// normalised.
    async fn write_single_register(
        &self,
        unit_id: UnitId,
        address: u16,
        value: u16,
    ) -> ModbusResult<()>;

    /// Write multiple coils (0x0F), LSB-first packed.
    async fn write_multiple_coils(
        &self,
        unit_id: UnitId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()>;

    /// Write multiple holding registers (0x10).
    async fn write_multiple_registers(
        &self,
        unit_id: UnitId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()>;

    /// Write then read holding registers in one transaction (0x17).
    async fn read_write_multiple_registers(
        &self,
        unit_id: UnitId,
        read_address: u16,
        read_count: u16,
        write_address: u16,
        values: &[u16],
    ) -> ModbusResult<Vec<u16>>;

    /// Report server id (0x11).
    async fn report_server_id(&self, unit_id: UnitId) -> ModbusResult<ServerId>;

    /// Whether the client considers itself connected.
    fn is_connected(&self) -> bool;

    /// Close the underlying transport. Idempotent.
    async fn close(&self) -> ModbusResult<()>;

    /// Transport statistics snapshot.
    async fn get_stats(&self) -> TransportStats;
}

/// Transport-generic client implementing the shared PDU logic.
pub struct GenericModbusClient<T> {
    transport: Mutex<T>,
    logger: Option<CallbackLogger>,
    connected: AtomicBool,
    events: broadcast::Sender<ClientEvent>,
}

impl<T: ModbusTransport> GenericModbusClient<T> {
    pub fn new(transport: T) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            connected: AtomicBool::new(transport.is_connected()),
            transport: Mutex::new(transport),
            logger: None,
            events,
        }
    }

    pub fn with_logger(transport: T, logger: CallbackLogger) -> Self {
        let mut client = Self::new(transport);
        client.logger = Some(logger);
        client
    }

    /// Subscribe to connection events. Lagging receivers lose the
    /// oldest events rather than blocking the client.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn set_connected(&self, now: bool) {
        let was = self.connected.swap(now, Ordering::SeqCst);
        if was != now {
            let _ = self.events.send(if now {
                ClientEvent::Connected
            } else {
                ClientEvent::Disconnected
            });
        }
    }

    /// Run one framed exchange under the single-permit gate.
    pub async fn execute(&self, request: ModbusRequest) -> ModbusResult<ModbusResponse> {
        let mut transport = self.transport.lock().await;

        if let Some(logger) = &self.logger {
            logger.log_request(
                request.unit_id,
                request.function.to_u8(),
                request.address,
                request.quantity,
                &request.data,
            );
        }

        let result = transport.request(&request).await;

        if let Some(logger) = &self.logger {
            match &result {
                Ok(response) => {
                    logger.log_response(response.unit_id, response.function.to_u8(), &response.data)
                }
                Err(e) => logger.error(&format!("{} failed: {}", request.function, e)),
            }
        }

        let connected = transport.is_connected();
        drop(transport);
        self.set_connected(connected);
        result
    }
}

#[async_trait]
impl<T: ModbusTransport> ModbusClient for GenericModbusClient<T> {
    async fn read_coils(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<bool>> {
        check_coil_count(count)?;
        let request = ModbusRequest::read(unit_id, FunctionCode::ReadCoils, address, count);
        let response = self.execute(request).await?;
        response.parse_bits(count)
    }

    async fn read_discrete_inputs(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<bool>> {
        check_coil_count(count)?;
        let request =
            ModbusRequest::read(unit_id, FunctionCode::ReadDiscreteInputs, address, count);
        let response = self.execute(request).await?;
        response.parse_bits(count)
    }

    async fn read_holding_registers(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        check_register_count(count)?;
        let request = ModbusRequest::read(
            unit_id,
            FunctionCode::ReadHoldingRegisters,
            normalize_holding(address),
            count,
        );
        let response = self.execute(request).await?;
        let registers = response.parse_registers()?;
        if registers.len() != count as usize {
            return Err(ModbusError::frame(format!(
                "expected {} registers, got {}",
                count,
                registers.len()
            )));
        }
        Ok(registers)
    }

    async fn read_input_registers(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        check_register_count(count)?;
        let request = ModbusRequest::read(
            unit_id,
            FunctionCode::ReadInputRegisters,
            normalize_input(address),
            count,
        );
        let response = self.execute(request).await?;
        let registers = response.parse_registers()?;
        if registers.len() != count as usize {
            return Err(ModbusError::frame(format!(
                "expected {} registers, got {}",
                count,
                registers.len()
            )));
        }
        Ok(registers)
    }

    async fn read_holding_registers_f32(
        &self,
        unit_id: UnitId,
        address: u16,
        float_count: u16,
    ) -> ModbusResult<Vec<f32>> {
        let register_count = float_count.checked_mul(2).ok_or_else(|| {
            ModbusError::invalid_data(format!("float count {} too large", float_count))
        })?;
        let registers = self
            .read_holding_registers(unit_id, address, register_count)
            .await?;
        registers
            .chunks_exact(2)
            .map(|pair| codec::to_f32(pair, WordOrder::LowFirst))
            .collect()
    }

    async fn write_single_coil(
        &self,
        unit_id: UnitId,
        address: u16,
        value: bool,
    ) -> ModbusResult<()> {
        let request = ModbusRequest::write_single_coil(unit_id, address, value);
        self.execute(request).await?;
        Ok(())
    }

    async fn write_single_register(
        &self,
        unit_id: UnitId,
        address: u16,
        value: u16,
    ) -> ModbusResult<()> {
        let request =
            ModbusRequest::write_single_register(unit_id, normalize_holding(address), value);
        self.execute(request).await?;
        Ok(())
    }

    async fn write_multiple_coils(
        &self,
        unit_id: UnitId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        if values.is_empty() {
            return Err(ModbusError::invalid_data("no coil values"));
        }
        check_coil_count(values.len() as u16)?;
        let request = ModbusRequest::write_multiple_coils(unit_id, address, values);
        self.execute(request).await?;
        Ok(())
    }

    async fn write_multiple_registers(
        &self,
        unit_id: UnitId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        if values.is_empty() {
            return Err(ModbusError::invalid_data("no register values"));
        }
        if values.len() as u16 > crate::MAX_WRITE_REGISTERS {
            return Err(ModbusError::invalid_data(format!(
                "register count {} out of range 1..={}",
                values.len(),
                crate::MAX_WRITE_REGISTERS
            )));
        }
        let request = ModbusRequest::write_multiple_registers(
            unit_id,
            normalize_holding(address),
            values,
        );
        self.execute(request).await?;
        Ok(())
    }

    async fn read_write_multiple_registers(
        &self,
        unit_id: UnitId,
        read_address: u16,
        read_count: u16,
        write_address: u16,
        values: &[u16],
    ) -> ModbusResult<Vec<u16>> {
        check_register_count(read_count)?;
        if values.is_empty() {
            return Err(ModbusError::invalid_data("no register values"));
        }
        let request = ModbusRequest::read_write_multiple_registers(
            unit_id,
            normalize_holding(read_address),
            read_count,
            normalize_holding(write_address),
            values,
        );
        let response = self.execute(request).await?;
        response.parse_registers()
    }

    async fn report_server_id(&self, unit_id: UnitId) -> ModbusResult<ServerId> {
        let request = ModbusRequest::report_server_id(unit_id);
        let response = self.execute(request).await?;
        response.parse_server_id()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> ModbusResult<()> {
        let mut transport = self.transport.lock().await;
        transport.close().await?;
        drop(transport);
        self.set_connected(false);
        Ok(())
    }

    async fn get_stats(&self) -> TransportStats {
        self.transport.lock().await.get_stats()
    }
}

/// Modbus TCP client.
pub struct ModbusTcpClient {
    inner: GenericModbusClient<TcpTransport>,
    address: SocketAddr,
}

impl ModbusTcpClient {
    /// Connect to `address` with the given response timeout.
    pub async fn new(address: SocketAddr, timeout: Duration) -> ModbusResult<Self> {
        let transport = TcpTransport::new(address, timeout).await?;
        Ok(Self {
            inner: GenericModbusClient::new(transport),
            address,
        })
    }

    /// Connect using a `host:port` string.
    pub async fn from_address(address: &str, timeout: Duration) -> ModbusResult<Self> {
        let address: SocketAddr = address
            .parse()
            .map_err(|e| ModbusError::configuration(format!("invalid address: {}", e)))?;
        Self::new(address, timeout).await
    }

    /// Connect with an attached packet logger.
    pub async fn with_logging(
        address: &str,
        timeout: Duration,
        logger: Option<CallbackLogger>,
    ) -> ModbusResult<Self> {
        let address: SocketAddr = address
            .parse()
            .map_err(|e| ModbusError::configuration(format!("invalid address: {}", e)))?;
        let transport = TcpTransport::new(address, timeout).await?;
        Ok(Self {
            inner: GenericModbusClient::with_logger(transport, logger.unwrap_or_default()),
            address,
        })
    }

    /// Wrap an already-connected transport.
    pub fn from_transport(transport: TcpTransport) -> Self {
        let address = transport.address;
        Self {
            inner: GenericModbusClient::new(transport),
            address,
        }
    }

    /// The server address this client targets.
    pub fn server_address(&self) -> SocketAddr {
        self.address
    }

    /// Re-establish a dropped connection.
    pub async fn reconnect(&self) -> ModbusResult<()> {
        let mut transport = self.inner.transport.lock().await;
        transport.reconnect().await?;
        drop(transport);
        self.inner.set_connected(true);
        Ok(())
    }

    /// Subscribe to [`ClientEvent`] notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.subscribe_events()
    }

    /// Run a raw request through the gate.
    pub async fn execute(&self, request: ModbusRequest) -> ModbusResult<ModbusResponse> {
        self.inner.execute(request).await
    }
}

#[async_trait]
impl ModbusClient for ModbusTcpClient {
    async fn read_coils(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<bool>> {
        self.inner.read_coils(unit_id, address, count).await
    }

    async fn read_discrete_inputs(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<bool>> {
        self.inner.read_discrete_inputs(unit_id, address, count).await
    }

    async fn read_holding_registers(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.inner.read_holding_registers(unit_id, address, count).await
    }

    async fn read_input_registers(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.inner.read_input_registers(unit_id, address, count).await
    }

    async fn read_holding_registers_f32(
        &self,
        unit_id: UnitId,
        address: u16,
        float_count: u16,
    ) -> ModbusResult<Vec<f32>> {
        self.inner
            .read_holding_registers_f32(unit_id, address, float_count)
            .await
    }

    async fn write_single_coil(
        &self,
        unit_id: UnitId,
        address: u16,
        value: bool,
    ) -> ModbusResult<()> {
        self.inner.write_single_coil(unit_id, address, value).await
    }

    async fn write_single_register(
        &self,
        unit_id: UnitId,
        address: u16,
        value: u16,
    ) -> ModbusResult<()> {
        self.inner.write_single_register(unit_id, address, value).await
    }

    async fn write_multiple_coils(
        &self,
        unit_id: UnitId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        self.inner.write_multiple_coils(unit_id, address, values).await
    }

    async fn write_multiple_registers(
        &self,
        unit_id: UnitId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        self.inner
            .write_multiple_registers(unit_id, address, values)
            .await
    }

    async fn read_write_multiple_registers(
        &self,
        unit_id: UnitId,
        read_address: u16,
        read_count: u16,
        write_address: u16,
        values: &[u16],
    ) -> ModbusResult<Vec<u16>> {
        self.inner
            .read_write_multiple_registers(unit_id, read_address, read_count, write_address, values)
            .await
    }

    async fn report_server_id(&self, unit_id: UnitId) -> ModbusResult<ServerId> {
        self.inner.report_server_id(unit_id).await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn close(&self) -> ModbusResult<()> {
        self.inner.close().await
    }

    async fn get_stats(&self) -> TransportStats {
        self.inner.get_stats().await
    }
}

/// Modbus RTU client over a serial port.
pub struct ModbusRtuClient {
    inner: GenericModbusClient<RtuTransport>,
}

impl ModbusRtuClient {
    /// Open `port` at `baud_rate` with 8N1 framing and the default
    /// timeout.
    pub fn new(port: &str, baud_rate: u32) -> ModbusResult<Self> {
        let transport = RtuTransport::new(port, baud_rate)?;
        Ok(Self {
            inner: GenericModbusClient::new(transport),
        })
    }

    /// Open with explicit serial parameters and an optional logger.
    pub fn with_config_and_logging(
        port: &str,
        baud_rate: u32,
        data_bits: tokio_serial::DataBits,
        stop_bits: tokio_serial::StopBits,
        parity: tokio_serial::Parity,
        timeout: Duration,
        logger: Option<CallbackLogger>,
    ) -> ModbusResult<Self> {
        let transport =
            RtuTransport::new_with_config(port, baud_rate, data_bits, stop_bits, parity, timeout)?;
        Ok(Self {
            inner: GenericModbusClient::with_logger(transport, logger.unwrap_or_default()),
        })
    }

    /// Wrap an already-open transport.
    pub fn from_transport(transport: RtuTransport) -> Self {
        Self {
            inner: GenericModbusClient::new(transport),
        }
    }

    /// Attach an RS-485 transmit-enable pin.
    pub async fn set_tx_enable(&self, pin: Box<dyn TxEnablePin>) {
        self.inner.transport.lock().await.set_tx_enable(pin);
    }

    /// Subscribe to [`ClientEvent`] notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.subscribe_events()
    }

    /// Run a raw request through the gate.
    pub async fn execute(&self, request: ModbusRequest) -> ModbusResult<ModbusResponse> {
        self.inner.execute(request).await
    }
}

#[async_trait]
impl ModbusClient for ModbusRtuClient {
    async fn read_coils(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<bool>> {
        self.inner.read_coils(unit_id, address, count).await
    }

    async fn read_discrete_inputs(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<bool>> {
        self.inner.read_discrete_inputs(unit_id, address, count).await
    }

    async fn read_holding_registers(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.inner.read_holding_registers(unit_id, address, count).await
    }

    async fn read_input_registers(
        &self,
        unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.inner.read_input_registers(unit_id, address, count).await
    }

    async fn read_holding_registers_f32(
        &self,
        unit_id: UnitId,
        address: u16,
        float_count: u16,
    ) -> ModbusResult<Vec<f32>> {
        self.inner
            .read_holding_registers_f32(unit_id, address, float_count)
            .await
    }

    async fn write_single_coil(
        &self,
        unit_id: UnitId,
        address: u16,
        value: bool,
    ) -> ModbusResult<()> {
        self.inner.write_single_coil(unit_id, address, value).await
    }

    async fn write_single_register(
        &self,
        unit_id: UnitId,
        address: u16,
        value: u16,
    ) -> ModbusResult<()> {
        self.inner.write_single_register(unit_id, address, value).await
    }

    async fn write_multiple_coils(
        &self,
        unit_id: UnitId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        self.inner.write_multiple_coils(unit_id, address, values).await
    }

    async fn write_multiple_registers(
        &self,
        unit_id: UnitId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        self.inner
            .write_multiple_registers(unit_id, address, values)
            .await
    }

    async fn read_write_multiple_registers(
        &self,
        unit_id: UnitId,
        read_address: u16,
        read_count: u16,
        write_address: u16,
        values: &[u16],
    ) -> ModbusResult<Vec<u16>> {
        self.inner
            .read_write_multiple_registers(unit_id, read_address, read_count, write_address, values)
            .await
    }

    async fn report_server_id(&self, unit_id: UnitId) -> ModbusResult<ServerId> {
        self.inner.report_server_id(unit_id).await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn close(&self) -> ModbusResult<()> {
        self.inner.close().await
    }

    async fn get_stats(&self) -> TransportStats {
        self.inner.get_stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_normalisation() {
        assert_eq!(normalize_holding(40001), 0);
        assert_eq!(normalize_holding(40008), 7);
        assert_eq!(normalize_holding(7), 7);
        assert_eq!(normalize_holding(40000), 40000);
        assert_eq!(normalize_input(30001), 0);
        assert_eq!(normalize_input(30013), 12);
        assert_eq!(normalize_input(100), 100);
    }

    #[test]
    fn test_count_checks() {
        assert!(check_register_count(125).is_ok());
        assert!(check_register_count(126).is_err());
        assert!(check_register_count(0).is_err());
        assert!(check_coil_count(125).is_ok());
        assert!(check_coil_count(126).is_err());
    }
}
