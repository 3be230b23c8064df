//! # grid-modbus
//!
//! A Modbus TCP/RTU client and server library for industrial
//! automation, energy metering and SCADA gateways, built on tokio.
//!
//! ## Features
//!
//! - Modbus TCP (MBAP framing, transaction correlation) and Modbus RTU
//!   (CRC-16 framing over serial, RS-485 TX-enable support)
//! - Shared-client concurrency: every client call goes through a
//!   FIFO-fair single-permit gate, so one client can serve many tasks
//!   without interleaving frames on the wire
//! - Server dispatchers for both transports driven by a user
//!   [`ServerHandler`], with [`RegisterBank`] as the in-memory default
//! - A [`PolledDevice`] engine that mirrors remote holding registers
//!   into typed local sinks on a timer, with scale/offset and
//!   word-order handling
//! - Register decoding extensions: 16/32/64-bit integers, IEEE-754
//!   floats and 48/64-bit Mod-10000 meter values in either word order
//!
//! ## Supported function codes
//!
//! | Code | Function | Client | Server |
//! |------|----------|--------|--------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//! | 0x11 | Report Server ID | ✅ | ✅ |
//! | 0x17 | Read/Write Multiple Registers | ✅ | ✅ |
//!
//! ## Client example
//!
//! ```rust,no_run
//! use grid_modbus::{ModbusClient, ModbusTcpClient, ModbusResult};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let client = ModbusTcpClient::from_address("127.0.0.1:502", Duration::from_secs(5)).await?;
//!
//!     let values = client.read_holding_registers(1, 0, 10).await?;
//!     println!("registers: {:?}", values);
//!
//!     client.write_single_register(1, 100, 0x1234).await?;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Server example
//!
//! ```rust,no_run
//! use grid_modbus::{ModbusServer, ModbusTcpServer, RegisterBank};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bank = Arc::new(RegisterBank::new());
//!     let mut server = ModbusTcpServer::new("127.0.0.1:502", bank)?;
//!     server.start().await?;
//!     // serving until stop()
//!     Ok(())
//! }
//! ```
//!
//! ## Polled device example
//!
//! ```rust,no_run
//! use grid_modbus::{ModbusTcpClient, PolledDevice, RegisterMapping, SourceFormat, sink_f32};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(ModbusTcpClient::from_address("10.0.0.9:502", Duration::from_secs(5)).await?);
//! let device = PolledDevice::new(client, 1).with_period(Duration::from_secs(2));
//!
//! // Registers 100-101 hold a CDAB float scaled by 0.1.
//! device.add_mapping(
//!     RegisterMapping::scaled(100, 2, SourceFormat::LittleEndianFloat, sink_f32(|v| {
//!         println!("voltage: {v}");
//!     }))?
//!     .with_scale(0.1),
//! ).await;
//!
//! device.start_polling();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod crc16;
pub mod error;
pub mod logging;
pub mod poll;
pub mod protocol;
pub mod register_bank;
pub mod server;
pub mod transport;
pub mod utils;

pub use client::{
    ClientEvent, GenericModbusClient, ModbusClient, ModbusRtuClient, ModbusTcpClient,
    HOLDING_REGISTER_BASE, INPUT_REGISTER_BASE,
};
pub use codec::WordOrder;
pub use error::{ModbusError, ModbusResult};
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};
pub use poll::{
    sink_f32, sink_f64, sink_i16, sink_i32, sink_i64, sink_u8, PolledDevice, RegisterMapping,
    SourceFormat,
};
pub use protocol::{
    ExceptionCode, FunctionCode, ModbusRequest, ModbusResponse, ServerId, UnitId,
};
pub use register_bank::RegisterBank;
pub use server::{
    ModbusRtuServer, ModbusRtuServerConfig, ModbusServer, ModbusTcpServer, ModbusTcpServerConfig,
    ServerEvent, ServerHandler, ServerStats,
};
pub use transport::{
    ModbusTransport, RtuTransport, TcpTransport, TransportStats, TxEnablePin,
};
pub use utils::{OperationTimer, PerformanceMetrics};

/// Default response timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default poll period for [`PolledDevice`], in seconds.
pub const DEFAULT_POLL_PERIOD_SECS: u64 = 5;

/// Minimum interval between poll ticks.
pub const MIN_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// Maximum registers per read transaction.
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum registers per Write Multiple Registers request. The same
/// uniform ceiling applies to reads and writes.
pub const MAX_WRITE_REGISTERS: u16 = 125;

/// Maximum coils per client call (reads and multi-writes).
pub const MAX_COILS_PER_REQUEST: u16 = 125;

/// Modbus TCP default port.
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
