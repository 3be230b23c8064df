//! Validation, formatting and timing helpers.

use std::time::{Duration, Instant};

use log::debug;

use crate::error::{ModbusError, ModbusResult};

/// Rolling success/failure timing statistics for client operations.
#[derive(Debug, Clone, Default)]
pub struct PerformanceMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub avg_duration: Duration,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, duration: Duration) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.total_duration += duration;
        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
        self.avg_duration = self.total_duration / self.total_requests as u32;
    }

    pub fn record_failure(&mut self, duration: Duration) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.total_duration += duration;
        self.avg_duration = self.total_duration / self.total_requests as u32;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64 * 100.0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Scoped timer logging the duration of an operation.
pub struct OperationTimer {
    start: Instant,
    operation: String,
}

impl OperationTimer {
    pub fn start(operation: &str) -> Self {
        Self {
            start: Instant::now(),
            operation: operation.to_string(),
        }
    }

    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        debug!("{} completed in {:?}", self.operation, duration);
        duration
    }
}

/// Argument validation shared by clients and servers.
pub mod validation {
    use super::*;

    /// Unit addresses 1-247 address a single device; 0 is broadcast
    /// and 248-255 are reserved (0xFF is tolerated as a TCP wildcard).
    pub fn validate_unit_id(unit_id: u8) -> ModbusResult<()> {
        if (248..255).contains(&unit_id) {
            return Err(ModbusError::invalid_data(format!(
                "unit id {} is reserved",
                unit_id
            )));
        }
        Ok(())
    }

    /// The range must stay inside the 16-bit address space.
    pub fn validate_address_range(start: u16, count: u16) -> ModbusResult<()> {
        if count == 0 {
            return Err(ModbusError::invalid_address(start, count));
        }
        if u32::from(start) + u32::from(count) > 0x1_0000 {
            return Err(ModbusError::invalid_address(start, count));
        }
        Ok(())
    }

    pub fn validate_register_count(count: u16) -> ModbusResult<()> {
        if count == 0 || count > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(ModbusError::invalid_data(format!(
                "register count {} out of range 1..={}",
                count,
                crate::MAX_REGISTERS_PER_REQUEST
            )));
        }
        Ok(())
    }

    pub fn validate_coil_count(count: u16) -> ModbusResult<()> {
        if count == 0 || count > crate::MAX_COILS_PER_REQUEST {
            return Err(ModbusError::invalid_data(format!(
                "coil count {} out of range 1..={}",
                count,
                crate::MAX_COILS_PER_REQUEST
            )));
        }
        Ok(())
    }
}

/// Rendering helpers for diagnostics.
pub mod format {
    use super::*;

    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers
            .iter()
            .map(|r| format!("{:04X}", r))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }
}

/// Logger bootstrap for tests and binaries.
pub mod logging {
    /// Initialise `env_logger` once, tolerating repeat calls.
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let mut metrics = PerformanceMetrics::new();
        metrics.record_success(Duration::from_millis(100));
        metrics.record_success(Duration::from_millis(200));
        metrics.record_failure(Duration::from_millis(150));

        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 2);
        assert!((metrics.success_rate() - 66.67).abs() < 0.1);
        assert_eq!(metrics.min_duration, Some(Duration::from_millis(100)));
        assert_eq!(metrics.max_duration, Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_validation() {
        assert!(validation::validate_unit_id(0).is_ok());
        assert!(validation::validate_unit_id(247).is_ok());
        assert!(validation::validate_unit_id(255).is_ok());
        assert!(validation::validate_unit_id(250).is_err());

        assert!(validation::validate_address_range(0, 10).is_ok());
        assert!(validation::validate_address_range(65530, 6).is_ok());
        assert!(validation::validate_address_range(65530, 7).is_err());
        assert!(validation::validate_address_range(0, 0).is_err());

        assert!(validation::validate_register_count(125).is_ok());
        assert!(validation::validate_register_count(126).is_err());
        assert!(validation::validate_coil_count(125).is_ok());
        assert!(validation::validate_coil_count(0).is_err());
    }

    #[test]
    fn test_formatting() {
        assert_eq!(
            format::bytes_to_hex(&[0x01, 0x03, 0x10, 0xFF]),
            "01 03 10 FF"
        );
        assert_eq!(format::registers_to_hex(&[0x1234, 0x5678]), "1234 5678");
        assert_eq!(format::format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format::format_duration(Duration::from_millis(80)), "80ms");
    }
}
