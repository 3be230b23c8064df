//! Error handling for the grid-modbus library.
//!
//! Every fallible operation in the crate returns [`ModbusResult`]. The
//! [`ModbusError`] enum covers transport failures (I/O, connection,
//! timeout), protocol violations (framing, CRC, transaction
//! correlation, exception responses) and argument validation.
//!
//! Errors carry enough context to act on: a CRC mismatch includes the
//! offending frame bytes, a device exception includes the original
//! function code, a timeout names the operation that expired. The
//! classification helpers ([`ModbusError::is_recoverable`],
//! [`ModbusError::is_transport_error`],
//! [`ModbusError::is_protocol_error`]) support retry policies in the
//! caller — the library itself never retries.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Diagnostic code for a failed send (not a wire value).
pub const DIAG_SEND_FAILED: u8 = 100;
/// Diagnostic code for an out-of-range address or count.
pub const DIAG_INVALID_OFFSET: u8 = 128;
/// Diagnostic code for operations attempted while disconnected.
pub const DIAG_NOT_CONNECTED: u8 = 253;
/// Diagnostic code for a connection dropped mid-exchange.
pub const DIAG_CONNECTION_LOST: u8 = 254;
/// Diagnostic code for an expired response deadline.
pub const DIAG_TIMEOUT: u8 = 255;

/// Errors produced by Modbus operations.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// Low-level I/O failure on the socket or serial port.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment failed.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Operation attempted on a client that is not connected.
    #[error("Not connected")]
    NotConnected,

    /// The peer closed or dropped the connection mid-exchange.
    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    /// No response within the configured window.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Modbus protocol violation that fits no more specific category.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// A TCP response carried a transaction id other than the one last
    /// issued on this connection.
    #[error("Transaction id mismatch: expected {expected}, got {actual}")]
    TransactionMismatch { expected: u16, actual: u16 },

    /// Unknown or unsupported function code.
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Address/count combination outside the addressable range.
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Argument validation failure (count limits, empty payloads, bad
    /// coil values).
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// RTU CRC mismatch on a well-formed length frame. Never retried,
    /// and a server never answers it.
    #[error("CRC mismatch: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch {
        expected: u16,
        actual: u16,
        frame: Vec<u8>,
    },

    /// The device returned a Modbus exception response.
    #[error("Modbus exception: function=0x{function:02X}, code=0x{code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Malformed frame (short MBAP, truncated payload, bad length).
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Client or server configuration problem.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Operation or conversion this crate does not support.
    #[error("Unsupported: {message}")]
    Unsupported { message: String },
}

impl ModbusError {
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn connection_lost<S: Into<String>>(message: S) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn crc_mismatch(expected: u16, actual: u16, frame: &[u8]) -> Self {
        Self::CrcMismatch {
            expected,
            actual,
            frame: frame.to_vec(),
        }
    }

    /// Build an exception error from the echoed function code and the
    /// exception code byte, attaching the standard description.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Server Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Server Device Busy",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception {
            function,
            code,
            message,
        }
    }

    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Whether a retry of the failed operation could plausibly succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. }
            | Self::Connection { .. }
            | Self::ConnectionLost { .. }
            | Self::Timeout { .. } => true,
            // Acknowledge and Busy signal a device that will recover.
            Self::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            _ => false,
        }
    }

    /// Whether the error originated in the transport rather than the
    /// Modbus protocol layer.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Connection { .. }
                | Self::NotConnected
                | Self::ConnectionLost { .. }
                | Self::Timeout { .. }
        )
    }

    /// Whether the error is a Modbus protocol violation.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::TransactionMismatch { .. }
                | Self::InvalidFunction { .. }
                | Self::Exception { .. }
                | Self::Frame { .. }
                | Self::CrcMismatch { .. }
        )
    }

    /// Numeric diagnostic code for this error.
    ///
    /// Device exceptions report their wire code; transport failures
    /// report the synthetic codes (`100` send failed, `128` invalid
    /// offset, `253` not connected, `254` connection lost, `255`
    /// timeout). Returns `None` for errors with no conventional code.
    pub fn diagnostic_code(&self) -> Option<u8> {
        match self {
            Self::Exception { code, .. } => Some(*code),
            Self::Io { .. } | Self::Connection { .. } => Some(DIAG_SEND_FAILED),
            Self::InvalidAddress { .. } => Some(DIAG_INVALID_OFFSET),
            Self::NotConnected => Some(DIAG_NOT_CONNECTED),
            Self::ConnectionLost { .. } => Some(DIAG_CONNECTION_LOST),
            Self::Timeout { .. } => Some(DIAG_TIMEOUT),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Self::connection_lost(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("operation", 0)
    }
}

impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let err = ModbusError::timeout("read holding registers", 5000);
        assert!(err.is_recoverable());
        assert!(err.is_transport_error());
        assert!(!err.is_protocol_error());

        let err = ModbusError::exception(0x03, 0x02);
        assert!(!err.is_recoverable());
        assert!(err.is_protocol_error());

        let err = ModbusError::exception(0x03, 0x06);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_diagnostic_codes() {
        assert_eq!(
            ModbusError::timeout("x", 1).diagnostic_code(),
            Some(DIAG_TIMEOUT)
        );
        assert_eq!(
            ModbusError::NotConnected.diagnostic_code(),
            Some(DIAG_NOT_CONNECTED)
        );
        assert_eq!(
            ModbusError::connection_lost("reset").diagnostic_code(),
            Some(DIAG_CONNECTION_LOST)
        );
        assert_eq!(
            ModbusError::invalid_address(1000, 200).diagnostic_code(),
            Some(DIAG_INVALID_OFFSET)
        );
        assert_eq!(ModbusError::exception(3, 2).diagnostic_code(), Some(2));
        assert_eq!(ModbusError::protocol("x").diagnostic_code(), None);
    }

    #[test]
    fn test_crc_error_display() {
        let err = ModbusError::crc_mismatch(0x1234, 0x5678, &[0x01, 0x03]);
        let msg = format!("{}", err);
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));
    }

    #[test]
    fn test_io_error_mapping() {
        let lost: ModbusError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(lost, ModbusError::ConnectionLost { .. }));

        let plain: ModbusError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(plain, ModbusError::Io { .. }));
    }
}
