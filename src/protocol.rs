//! Modbus protocol definitions and PDU codec.
//!
//! The PDU (function code plus data) is identical for both transports;
//! RTU wraps it in `[unit][PDU][crc]` and TCP in an MBAP header. This
//! module owns the function/exception code enums, the request and
//! response types, PDU construction for every supported function code
//! and the payload parsers, plus the bit/register packing helpers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ModbusError, ModbusResult};

/// Modbus register or coil address (0-based on the wire).
pub type ModbusAddress = u16;

/// Unit (slave) address. 0 is the broadcast address; 0xFF is commonly
/// used as a wildcard for TCP gateways.
pub type UnitId = u8;

/// Broadcast unit address: writes are executed, no response is sent.
pub const BROADCAST_UNIT: UnitId = 0;

/// Single-coil ON value as framed on the wire.
pub const COIL_ON: u16 = 0xFF00;
/// Single-coil OFF value as framed on the wire.
pub const COIL_OFF: u16 = 0x0000;

/// Modbus function codes supported by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
    /// Report Server ID (0x11)
    ReportServerId = 0x11,
    /// Read/Write Multiple Registers (0x17)
    ReadWriteMultipleRegisters = 0x17,
}

impl FunctionCode {
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(Self::ReadCoils),
            0x02 => Ok(Self::ReadDiscreteInputs),
            0x03 => Ok(Self::ReadHoldingRegisters),
            0x04 => Ok(Self::ReadInputRegisters),
            0x05 => Ok(Self::WriteSingleCoil),
            0x06 => Ok(Self::WriteSingleRegister),
            0x0F => Ok(Self::WriteMultipleCoils),
            0x10 => Ok(Self::WriteMultipleRegisters),
            0x11 => Ok(Self::ReportServerId),
            0x17 => Ok(Self::ReadWriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Functions whose response payload starts with a byte count.
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::ReadHoldingRegisters
                | Self::ReadInputRegisters
                | Self::ReadWriteMultipleRegisters
        )
    }

    /// Functions whose response echoes address and value/quantity.
    pub fn is_write_function(self) -> bool {
        matches!(
            self,
            Self::WriteSingleCoil
                | Self::WriteSingleRegister
                | Self::WriteMultipleCoils
                | Self::WriteMultipleRegisters
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::ReadCoils => "Read Coils",
            Self::ReadDiscreteInputs => "Read Discrete Inputs",
            Self::ReadHoldingRegisters => "Read Holding Registers",
            Self::ReadInputRegisters => "Read Input Registers",
            Self::WriteSingleCoil => "Write Single Coil",
            Self::WriteSingleRegister => "Write Single Register",
            Self::WriteMultipleCoils => "Write Multiple Coils",
            Self::WriteMultipleRegisters => "Write Multiple Registers",
            Self::ReportServerId => "Report Server ID",
            Self::ReadWriteMultipleRegisters => "Read/Write Multiple Registers",
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), *self as u8)
    }
}

/// Modbus exception codes as carried in exception responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetFailed = 0x0B,
}

impl ExceptionCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::ServerDeviceFailure),
            0x05 => Some(Self::Acknowledge),
            0x06 => Some(Self::ServerDeviceBusy),
            0x0A => Some(Self::GatewayPathUnavailable),
            0x0B => Some(Self::GatewayTargetFailed),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Result of a Report Server ID request.
///
/// The byte immediately before the CRC is an opaque run-indicator
/// status byte; no semantics are assigned to it here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerId {
    pub server_id: u8,
    pub run_indicator: u8,
    pub additional_data: Vec<u8>,
}

/// A Modbus request, transport-independent.
///
/// `address`/`quantity` describe the (read) range; `data` carries the
/// function-specific payload. For Read/Write Multiple Registers the
/// read range lives in `address`/`quantity` and the complete write
/// section (start, quantity, byte count, values) lives in `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub unit_id: UnitId,
    pub function: FunctionCode,
    pub address: ModbusAddress,
    pub quantity: u16,
    pub data: Vec<u8>,
}

impl ModbusRequest {
    /// Read request for coils, discrete inputs, holding or input
    /// registers (FC 01/02/03/04).
    pub fn read(
        unit_id: UnitId,
        function: FunctionCode,
        address: ModbusAddress,
        quantity: u16,
    ) -> Self {
        Self {
            unit_id,
            function,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    /// Write Single Coil (FC 05). ON frames as 0xFF00, OFF as 0x0000.
    pub fn write_single_coil(unit_id: UnitId, address: ModbusAddress, value: bool) -> Self {
        let wire = if value { COIL_ON } else { COIL_OFF };
        Self {
            unit_id,
            function: FunctionCode::WriteSingleCoil,
            address,
            quantity: 1,
            data: wire.to_be_bytes().to_vec(),
        }
    }

    /// Write Single Register (FC 06).
    pub fn write_single_register(unit_id: UnitId, address: ModbusAddress, value: u16) -> Self {
        Self {
            unit_id,
            function: FunctionCode::WriteSingleRegister,
            address,
            quantity: 1,
            data: value.to_be_bytes().to_vec(),
        }
    }

    /// Write Multiple Coils (FC 15). Values pack LSB-first into bytes.
    pub fn write_multiple_coils(unit_id: UnitId, address: ModbusAddress, values: &[bool]) -> Self {
        Self {
            unit_id,
            function: FunctionCode::WriteMultipleCoils,
            address,
            quantity: values.len() as u16,
            data: pack_bits(values),
        }
    }

    /// Write Multiple Registers (FC 16).
    pub fn write_multiple_registers(
        unit_id: UnitId,
        address: ModbusAddress,
        values: &[u16],
    ) -> Self {
        Self {
            unit_id,
            function: FunctionCode::WriteMultipleRegisters,
            address,
            quantity: values.len() as u16,
            data: registers_to_bytes(values),
        }
    }

    /// Report Server ID (FC 17).
    pub fn report_server_id(unit_id: UnitId) -> Self {
        Self {
            unit_id,
            function: FunctionCode::ReportServerId,
            address: 0,
            quantity: 0,
            data: Vec::new(),
        }
    }

    /// Read/Write Multiple Registers (FC 23). The write is performed
    /// by the server before the read.
    pub fn read_write_multiple_registers(
        unit_id: UnitId,
        read_address: ModbusAddress,
        read_quantity: u16,
        write_address: ModbusAddress,
        write_values: &[u16],
    ) -> Self {
        let mut data = Vec::with_capacity(5 + write_values.len() * 2);
        data.extend_from_slice(&write_address.to_be_bytes());
        data.extend_from_slice(&(write_values.len() as u16).to_be_bytes());
        data.push((write_values.len() * 2) as u8);
        data.extend_from_slice(&registers_to_bytes(write_values));
        Self {
            unit_id,
            function: FunctionCode::ReadWriteMultipleRegisters,
            address: read_address,
            quantity: read_quantity,
            data,
        }
    }

    /// Encode this request as a PDU (function code first, no unit
    /// address, no checksum, no MBAP header).
    pub fn pdu(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(6 + self.data.len());
        pdu.push(self.function.to_u8());
        match self.function {
            FunctionCode::ReadCoils
            | FunctionCode::ReadDiscreteInputs
            | FunctionCode::ReadHoldingRegisters
            | FunctionCode::ReadInputRegisters => {
                pdu.extend_from_slice(&self.address.to_be_bytes());
                pdu.extend_from_slice(&self.quantity.to_be_bytes());
            }
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
                pdu.extend_from_slice(&self.address.to_be_bytes());
                pdu.extend_from_slice(&self.data);
            }
            FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
                pdu.extend_from_slice(&self.address.to_be_bytes());
                pdu.extend_from_slice(&self.quantity.to_be_bytes());
                pdu.push(self.data.len() as u8);
                pdu.extend_from_slice(&self.data);
            }
            FunctionCode::ReportServerId => {}
            FunctionCode::ReadWriteMultipleRegisters => {
                pdu.extend_from_slice(&self.address.to_be_bytes());
                pdu.extend_from_slice(&self.quantity.to_be_bytes());
                pdu.extend_from_slice(&self.data);
            }
        }
        pdu
    }

    /// Validate counts and payload shape before any I/O happens.
    pub fn validate(&self) -> ModbusResult<()> {
        match self.function {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                if self.quantity == 0 || self.quantity > crate::MAX_COILS_PER_REQUEST {
                    return Err(ModbusError::invalid_data(format!(
                        "coil count {} out of range 1..={}",
                        self.quantity,
                        crate::MAX_COILS_PER_REQUEST
                    )));
                }
            }
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                if self.quantity == 0 || self.quantity > crate::MAX_REGISTERS_PER_REQUEST {
                    return Err(ModbusError::invalid_data(format!(
                        "register count {} out of range 1..={}",
                        self.quantity,
                        crate::MAX_REGISTERS_PER_REQUEST
                    )));
                }
            }
            FunctionCode::WriteMultipleCoils => {
                if self.quantity == 0 || self.quantity > crate::MAX_COILS_PER_REQUEST {
                    return Err(ModbusError::invalid_data(format!(
                        "coil count {} out of range 1..={}",
                        self.quantity,
                        crate::MAX_COILS_PER_REQUEST
                    )));
                }
            }
            FunctionCode::WriteMultipleRegisters => {
                if self.quantity == 0 || self.quantity > crate::MAX_WRITE_REGISTERS {
                    return Err(ModbusError::invalid_data(format!(
                        "register count {} out of range 1..={}",
                        self.quantity,
                        crate::MAX_WRITE_REGISTERS
                    )));
                }
                if self.data.len() != self.quantity as usize * 2 {
                    return Err(ModbusError::invalid_data("register payload length mismatch"));
                }
            }
            FunctionCode::ReadWriteMultipleRegisters => {
                if self.quantity == 0 || self.quantity > crate::MAX_REGISTERS_PER_REQUEST {
                    return Err(ModbusError::invalid_data(format!(
                        "read count {} out of range 1..={}",
                        self.quantity,
                        crate::MAX_REGISTERS_PER_REQUEST
                    )));
                }
                if self.data.len() < 5 {
                    return Err(ModbusError::invalid_data("missing write section"));
                }
            }
            _ => {}
        }
        let end = u32::from(self.address) + u32::from(self.quantity);
        if end > 0x1_0000 {
            return Err(ModbusError::invalid_address(self.address, self.quantity));
        }
        Ok(())
    }

}

/// A Modbus response, transport-independent.
///
/// `data` holds the PDU bytes after the function code: a byte count
/// plus payload for reads, the echoed address and value/quantity for
/// writes.
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub unit_id: UnitId,
    pub function: FunctionCode,
    pub data: Vec<u8>,
}

impl ModbusResponse {
    pub fn new(unit_id: UnitId, function: FunctionCode, data: Vec<u8>) -> Self {
        Self {
            unit_id,
            function,
            data,
        }
    }

    /// Parse a response PDU (function code first). An exception
    /// response (bit 7 set) maps to [`ModbusError::Exception`].
    pub fn from_pdu(unit_id: UnitId, pdu: &[u8]) -> ModbusResult<Self> {
        if pdu.is_empty() {
            return Err(ModbusError::frame("empty response PDU"));
        }
        let raw_function = pdu[0];
        if raw_function & 0x80 != 0 {
            let code = pdu.get(1).copied().unwrap_or(0);
            return Err(ModbusError::exception(raw_function & 0x7F, code));
        }
        let function = FunctionCode::from_u8(raw_function)?;
        Ok(Self::new(unit_id, function, pdu[1..].to_vec()))
    }

    /// Decode a register-read payload into u16 values.
    pub fn parse_registers(&self) -> ModbusResult<Vec<u16>> {
        if self.data.is_empty() {
            return Err(ModbusError::frame("empty response data"));
        }
        let byte_count = self.data[0] as usize;
        if self.data.len() < 1 + byte_count {
            return Err(ModbusError::frame("truncated register data"));
        }
        if byte_count % 2 != 0 {
            return Err(ModbusError::frame("odd register byte count"));
        }
        bytes_to_registers(&self.data[1..1 + byte_count])
    }

    /// Decode a coil/discrete-input payload into exactly `count`
    /// booleans, LSB-first. Unused high bits are discarded.
    pub fn parse_bits(&self, count: u16) -> ModbusResult<Vec<bool>> {
        if self.data.is_empty() {
            return Err(ModbusError::frame("empty response data"));
        }
        let byte_count = self.data[0] as usize;
        if self.data.len() < 1 + byte_count {
            return Err(ModbusError::frame("truncated coil data"));
        }
        if byte_count < (count as usize).div_ceil(8) {
            return Err(ModbusError::frame("coil byte count too small"));
        }
        Ok(unpack_bits(&self.data[1..1 + byte_count], count as usize))
    }

    /// Decode a Report Server ID payload.
    pub fn parse_server_id(&self) -> ModbusResult<ServerId> {
        if self.data.len() < 2 {
            return Err(ModbusError::frame("short server id response"));
        }
        let byte_count = self.data[0] as usize;
        if byte_count == 0 || self.data.len() < 1 + byte_count + 1 {
            return Err(ModbusError::frame("truncated server id response"));
        }
        Ok(ServerId {
            server_id: self.data[1],
            additional_data: self.data[2..1 + byte_count].to_vec(),
            run_indicator: self.data[1 + byte_count],
        })
    }
}

/// Pack booleans into bytes, LSB-first within each byte. Unused high
/// bits of the final byte stay zero.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `bit_count` booleans from LSB-first packed bytes.
pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
    (0..bit_count)
        .map(|i| {
            bytes
                .get(i / 8)
                .map(|b| b & (1 << (i % 8)) != 0)
                .unwrap_or(false)
        })
        .collect()
}

/// Encode registers big-endian.
pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(registers.len() * 2);
    for &register in registers {
        bytes.extend_from_slice(&register.to_be_bytes());
    }
    bytes
}

/// Decode big-endian bytes into registers.
pub fn bytes_to_registers(bytes: &[u8]) -> ModbusResult<Vec<u16>> {
    if bytes.len() % 2 != 0 {
        return Err(ModbusError::invalid_data("odd register byte length"));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_code_roundtrip() {
        for code in [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x0F, 0x10, 0x11, 0x17] {
            assert_eq!(FunctionCode::from_u8(code).unwrap().to_u8(), code);
        }
        assert!(FunctionCode::from_u8(0x2B).is_err());
    }

    #[test]
    fn test_read_request_pdu() {
        let req = ModbusRequest::read(7, FunctionCode::ReadHoldingRegisters, 11, 13);
        assert_eq!(req.pdu(), vec![0x03, 0x00, 0x0B, 0x00, 0x0D]);
    }

    #[test]
    fn test_write_single_coil_pdu() {
        let on = ModbusRequest::write_single_coil(1, 7, true);
        assert_eq!(on.pdu(), vec![0x05, 0x00, 0x07, 0xFF, 0x00]);
        let off = ModbusRequest::write_single_coil(1, 7, false);
        assert_eq!(off.pdu(), vec![0x05, 0x00, 0x07, 0x00, 0x00]);
    }

    #[test]
    fn test_write_single_register_pdu() {
        let req = ModbusRequest::write_single_register(1, 7, 42);
        assert_eq!(req.pdu(), vec![0x06, 0x00, 0x07, 0x00, 0x2A]);
    }

    #[test]
    fn test_write_multiple_coils_pdu() {
        // 17 alternating coils, LSB-first: 55 55 01
        let values: Vec<bool> = (0..17).map(|i| i % 2 == 0).collect();
        let req = ModbusRequest::write_multiple_coils(17, 19, &values);
        assert_eq!(
            req.pdu(),
            vec![0x0F, 0x00, 0x13, 0x00, 0x11, 0x03, 0x55, 0x55, 0x01]
        );
    }

    #[test]
    fn test_write_multiple_registers_pdu() {
        let req = ModbusRequest::write_multiple_registers(1, 1, &[0x000A, 0x0102]);
        assert_eq!(
            req.pdu(),
            vec![0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
    }

    #[test]
    fn test_report_server_id_pdu() {
        let req = ModbusRequest::report_server_id(9);
        assert_eq!(req.pdu(), vec![0x11]);
    }

    #[test]
    fn test_read_write_registers_pdu() {
        let req = ModbusRequest::read_write_multiple_registers(1, 3, 6, 14, &[0x00FF]);
        assert_eq!(
            req.pdu(),
            vec![0x17, 0x00, 0x03, 0x00, 0x06, 0x00, 0x0E, 0x00, 0x01, 0x02, 0x00, 0xFF]
        );
    }

    #[test]
    fn test_validation_limits() {
        let too_many = ModbusRequest::read(1, FunctionCode::ReadHoldingRegisters, 0, 126);
        assert!(too_many.validate().is_err());

        let max = ModbusRequest::read(1, FunctionCode::ReadHoldingRegisters, 0, 125);
        assert!(max.validate().is_ok());

        let zero = ModbusRequest::read(1, FunctionCode::ReadCoils, 0, 0);
        assert!(zero.validate().is_err());

        let overflow = ModbusRequest::read(1, FunctionCode::ReadHoldingRegisters, 65500, 100);
        assert!(overflow.validate().is_err());

        // Writes share the uniform 125-register ceiling.
        let max_write = ModbusRequest::write_multiple_registers(1, 0, &[0u16; 125]);
        assert!(max_write.validate().is_ok());
        let over_write = ModbusRequest::write_multiple_registers(1, 0, &[0u16; 126]);
        assert!(over_write.validate().is_err());
    }

    #[test]
    fn test_exception_response_mapping() {
        let err = ModbusResponse::from_pdu(1, &[0x83, 0x02]).unwrap_err();
        match err {
            ModbusError::Exception { function, code, .. } => {
                assert_eq!(function, 0x03);
                assert_eq!(code, 0x02);
            }
            other => panic!("expected exception, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_registers() {
        let resp = ModbusResponse::new(
            7,
            FunctionCode::ReadHoldingRegisters,
            vec![0x04, 0x00, 0x2A, 0x00, 0x14],
        );
        assert_eq!(resp.parse_registers().unwrap(), vec![0x002A, 0x0014]);
    }

    #[test]
    fn test_parse_bits_lsb_first() {
        let resp = ModbusResponse::new(17, FunctionCode::ReadCoils, vec![0x01, 0b0000_1010]);
        let bits = resp.parse_bits(7).unwrap();
        assert_eq!(
            bits,
            vec![false, true, false, true, false, false, false]
        );
    }

    #[test]
    fn test_bit_pack_roundtrip() {
        let bits: Vec<bool> = (0..21).map(|i| i % 3 == 0).collect();
        let packed = pack_bits(&bits);
        // Unused high bits of the final byte must be zero.
        assert_eq!(packed[2] & 0b1110_0000, 0);
        assert_eq!(unpack_bits(&packed, bits.len()), bits);
    }

    #[test]
    fn test_parse_server_id() {
        let resp = ModbusResponse::new(
            9,
            FunctionCode::ReportServerId,
            vec![0x03, 0x0A, b'o', b'k', 0xFF],
        );
        let id = resp.parse_server_id().unwrap();
        assert_eq!(id.server_id, 0x0A);
        assert_eq!(id.additional_data, b"ok");
        assert_eq!(id.run_indicator, 0xFF);
    }

    #[test]
    fn test_register_bytes_roundtrip() {
        let values = vec![0x1234, 0x5678, 0x9ABC];
        let bytes = registers_to_bytes(&values);
        assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC]);
        assert_eq!(bytes_to_registers(&bytes).unwrap(), values);
        assert!(bytes_to_registers(&bytes[..3]).is_err());
    }
}
