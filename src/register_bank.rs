//! In-memory data store implementing [`ServerHandler`].
//!
//! Four independent tables back the four Modbus data types: coils,
//! discrete inputs, holding registers, input registers. All access is
//! bounds-checked against the configured sizes; out-of-range requests
//! surface as `InvalidAddress`, which the dispatcher answers with an
//! `IllegalDataAddress` exception.
//!
//! The `set_*` methods exist for the process hosting the server:
//! simulators and gateways update input registers and discrete inputs
//! directly while remote clients read them.

use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ServerId, UnitId};
use crate::server::ServerHandler;

const DEFAULT_TABLE_SIZE: usize = 10_000;

/// Thread-safe storage for the four Modbus data tables.
pub struct RegisterBank {
    coils: RwLock<Vec<bool>>,
    discrete_inputs: RwLock<Vec<bool>>,
    holding_registers: RwLock<Vec<u16>>,
    input_registers: RwLock<Vec<u16>>,
    server_id: ServerId,
}

impl RegisterBank {
    /// Create a bank with 10000 entries per table.
    pub fn new() -> Self {
        Self::with_sizes(
            DEFAULT_TABLE_SIZE,
            DEFAULT_TABLE_SIZE,
            DEFAULT_TABLE_SIZE,
            DEFAULT_TABLE_SIZE,
        )
    }

    /// Create a bank with explicit table sizes.
    pub fn with_sizes(
        coils: usize,
        discrete_inputs: usize,
        holding_registers: usize,
        input_registers: usize,
    ) -> Self {
        Self {
            coils: RwLock::new(vec![false; coils]),
            discrete_inputs: RwLock::new(vec![false; discrete_inputs]),
            holding_registers: RwLock::new(vec![0; holding_registers]),
            input_registers: RwLock::new(vec![0; input_registers]),
            server_id: ServerId {
                server_id: 1,
                run_indicator: 0xFF,
                additional_data: Vec::new(),
            },
        }
    }

    /// Set the identity returned for Report Server ID requests.
    pub fn with_server_id(mut self, server_id: ServerId) -> Self {
        self.server_id = server_id;
        self
    }

    fn check_range(len: usize, address: u16, count: usize) -> ModbusResult<usize> {
        let start = address as usize;
        let end = start + count;
        if end > len {
            return Err(ModbusError::invalid_address(address, count as u16));
        }
        Ok(start)
    }

    /// Overwrite holding registers starting at `address`.
    pub fn set_holding_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        let mut table = self.holding_registers.write().unwrap();
        let start = Self::check_range(table.len(), address, values.len())?;
        table[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    /// Overwrite input registers starting at `address`.
    pub fn set_input_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        let mut table = self.input_registers.write().unwrap();
        let start = Self::check_range(table.len(), address, values.len())?;
        table[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    /// Overwrite coils starting at `address`.
    pub fn set_coils(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        let mut table = self.coils.write().unwrap();
        let start = Self::check_range(table.len(), address, values.len())?;
        table[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    /// Overwrite discrete inputs starting at `address`.
    pub fn set_discrete_inputs(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        let mut table = self.discrete_inputs.write().unwrap();
        let start = Self::check_range(table.len(), address, values.len())?;
        table[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    /// Snapshot of holding registers, for inspection.
    pub fn holding_registers(&self, address: u16, count: u16) -> ModbusResult<Vec<u16>> {
        let table = self.holding_registers.read().unwrap();
        let start = Self::check_range(table.len(), address, count as usize)?;
        Ok(table[start..start + count as usize].to_vec())
    }
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerHandler for RegisterBank {
    async fn read_coils(&self, _unit_id: UnitId, address: u16, count: u16) -> ModbusResult<Vec<bool>> {
        let table = self.coils.read().unwrap();
        let start = Self::check_range(table.len(), address, count as usize)?;
        Ok(table[start..start + count as usize].to_vec())
    }

    async fn read_discrete_inputs(
        &self,
        _unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<bool>> {
        let table = self.discrete_inputs.read().unwrap();
        let start = Self::check_range(table.len(), address, count as usize)?;
        Ok(table[start..start + count as usize].to_vec())
    }

    async fn read_holding_registers(
        &self,
        _unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        let table = self.holding_registers.read().unwrap();
        let start = Self::check_range(table.len(), address, count as usize)?;
        Ok(table[start..start + count as usize].to_vec())
    }

    async fn read_input_registers(
        &self,
        _unit_id: UnitId,
        address: u16,
        count: u16,
    ) -> ModbusResult<Vec<u16>> {
        let table = self.input_registers.read().unwrap();
        let start = Self::check_range(table.len(), address, count as usize)?;
        Ok(table[start..start + count as usize].to_vec())
    }

    async fn write_single_coil(
        &self,
        _unit_id: UnitId,
        address: u16,
        value: bool,
    ) -> ModbusResult<()> {
        let mut table = self.coils.write().unwrap();
        let start = Self::check_range(table.len(), address, 1)?;
        table[start] = value;
        Ok(())
    }

    async fn write_single_register(
        &self,
        _unit_id: UnitId,
        address: u16,
        value: u16,
    ) -> ModbusResult<()> {
        let mut table = self.holding_registers.write().unwrap();
        let start = Self::check_range(table.len(), address, 1)?;
        table[start] = value;
        Ok(())
    }

    async fn write_multiple_coils(
        &self,
        _unit_id: UnitId,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        let mut table = self.coils.write().unwrap();
        let start = Self::check_range(table.len(), address, values.len())?;
        table[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    async fn write_multiple_registers(
        &self,
        _unit_id: UnitId,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        let mut table = self.holding_registers.write().unwrap();
        let start = Self::check_range(table.len(), address, values.len())?;
        table[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    async fn report_server_id(&self, _unit_id: UnitId) -> ModbusResult<ServerId> {
        Ok(self.server_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_coil_roundtrip() {
        let bank = RegisterBank::new();
        bank.write_single_coil(1, 10, true).await.unwrap();
        assert_eq!(bank.read_coils(1, 10, 1).await.unwrap(), vec![true]);

        bank.write_multiple_coils(1, 20, &[true, false, true]).await.unwrap();
        assert_eq!(
            bank.read_coils(1, 20, 3).await.unwrap(),
            vec![true, false, true]
        );
    }

    #[tokio::test]
    async fn test_register_roundtrip() {
        let bank = RegisterBank::new();
        bank.write_single_register(1, 5, 0xABCD).await.unwrap();
        assert_eq!(
            bank.read_holding_registers(1, 5, 1).await.unwrap(),
            vec![0xABCD]
        );

        bank.write_multiple_registers(1, 100, &[0x1111, 0x2222, 0x3333])
            .await
            .unwrap();
        assert_eq!(
            bank.read_holding_registers(1, 100, 3).await.unwrap(),
            vec![0x1111, 0x2222, 0x3333]
        );
    }

    #[tokio::test]
    async fn test_input_tables_are_separate() {
        let bank = RegisterBank::new();
        bank.set_input_registers(0, &[0x1234]).unwrap();
        bank.set_discrete_inputs(0, &[true]).unwrap();

        assert_eq!(bank.read_input_registers(1, 0, 1).await.unwrap(), vec![0x1234]);
        assert_eq!(bank.read_discrete_inputs(1, 0, 1).await.unwrap(), vec![true]);
        // Holding registers untouched.
        assert_eq!(bank.read_holding_registers(1, 0, 1).await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_out_of_range() {
        let bank = RegisterBank::with_sizes(8, 8, 8, 8);
        assert!(bank.read_coils(1, 6, 4).await.is_err());
        assert!(bank.write_single_register(1, 8, 1).await.is_err());
        assert!(bank.set_holding_registers(7, &[1, 2]).is_err());
    }

    #[tokio::test]
    async fn test_server_id() {
        let bank = RegisterBank::new().with_server_id(ServerId {
            server_id: 0x0A,
            run_indicator: 0xFF,
            additional_data: b"meter".to_vec(),
        });
        let id = bank.report_server_id(1).await.unwrap();
        assert_eq!(id.server_id, 0x0A);
        assert_eq!(id.additional_data, b"meter");
    }
}
