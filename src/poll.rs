//! Polled device mirror engine.
//!
//! A [`PolledDevice`] keeps local mirror values in sync with a remote
//! device's holding registers. Each [`RegisterMapping`] projects a
//! contiguous register window onto a typed sink closure, optionally
//! applying `value * scale` then `value + offset` on the way. A timer
//! task reads every mapping in registration order once per period.
//!
//! The engine serialises against other users of the client through
//! the client's own request gate, and holds its own mapping lock for
//! the duration of a refresh pass so the mapping list cannot mutate
//! mid-tick. [`PolledDevice::write_holding_register`] takes the same
//! mapping lock, so writes interleave between ticks rather than inside
//! them.
//!
//! A read timeout aborts the remainder of the current tick (the device
//! is presumed absent) but unregisters nothing; polling resumes on the
//! next tick. A sink that rejects a value — out of range for its
//! target type — permanently disables that one mapping.

use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::client::ModbusClient;
use crate::codec::{self, WordOrder};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::UnitId;

/// Interpretation of a mapping's register window.
///
/// `LittleEndian*` means the low word arrives in the first register;
/// bytes within each register are always big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    BigEndianInteger,
    LittleEndianInteger,
    BigEndianFloat,
    LittleEndianFloat,
}

impl SourceFormat {
    fn word_order(self) -> WordOrder {
        match self {
            Self::BigEndianInteger | Self::BigEndianFloat => WordOrder::HighFirst,
            Self::LittleEndianInteger | Self::LittleEndianFloat => WordOrder::LowFirst,
        }
    }

    fn is_float(self) -> bool {
        matches!(self, Self::BigEndianFloat | Self::LittleEndianFloat)
    }
}

/// Sink receiving the decoded, scaled value of a mapping.
///
/// Returning an error marks the mapping as failed and disables it;
/// the typed adapters ([`sink_i16`], [`sink_f32`], …) do this for
/// values that do not fit the target type.
pub type SinkFn = Box<dyn Fn(f64) -> ModbusResult<()> + Send + Sync>;

/// Custom decoder receiving the raw register window.
pub type CustomDecodeFn = Box<dyn Fn(&[u16]) -> ModbusResult<()> + Send + Sync>;

enum MappingAction {
    Scaled {
        format: SourceFormat,
        scale: Option<f64>,
        offset: Option<f64>,
        sink: SinkFn,
    },
    Custom(CustomDecodeFn),
}

/// One register window bound to a mirror target.
pub struct RegisterMapping {
    start: u16,
    count: u16,
    action: MappingAction,
    disabled: bool,
}

impl RegisterMapping {
    /// Map `count` registers (1, 2 or 4) at `start` through the
    /// standard decode path: interpret per `format`, scale, offset,
    /// deposit into `sink`.
    pub fn scaled(
        start: u16,
        count: u16,
        format: SourceFormat,
        sink: impl Fn(f64) -> ModbusResult<()> + Send + Sync + 'static,
    ) -> ModbusResult<Self> {
        if !matches!(count, 1 | 2 | 4) {
            return Err(ModbusError::invalid_data(format!(
                "mapping register count must be 1, 2 or 4, got {}",
                count
            )));
        }
        if format.is_float() && count == 1 {
            return Err(ModbusError::invalid_data(
                "float mappings need 2 or 4 registers",
            ));
        }
        Ok(Self {
            start,
            count,
            action: MappingAction::Scaled {
                format,
                scale: None,
                offset: None,
                sink: Box::new(sink),
            },
            disabled: false,
        })
    }

    /// Map `count` registers at `start` through a custom decoder that
    /// receives the raw register window. Scale and offset do not
    /// apply.
    pub fn custom(
        start: u16,
        count: u16,
        decode: impl Fn(&[u16]) -> ModbusResult<()> + Send + Sync + 'static,
    ) -> ModbusResult<Self> {
        if count == 0 || count > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(ModbusError::invalid_data(format!(
                "mapping register count {} out of range 1..={}",
                count,
                crate::MAX_REGISTERS_PER_REQUEST
            )));
        }
        Ok(Self {
            start,
            count,
            action: MappingAction::Custom(Box::new(decode)),
            disabled: false,
        })
    }

    /// Multiply the decoded value by `scale` before the offset.
    pub fn with_scale(mut self, value: f64) -> Self {
        if let MappingAction::Scaled { scale, .. } = &mut self.action {
            *scale = Some(value);
        }
        self
    }

    /// Add `offset` to the decoded (and scaled) value.
    pub fn with_offset(mut self, value: f64) -> Self {
        if let MappingAction::Scaled { offset, .. } = &mut self.action {
            *offset = Some(value);
        }
        self
    }

    /// The register window this mapping reads.
    pub fn range(&self) -> (u16, u16) {
        (self.start, self.count)
    }

    /// Whether a fatal sink error has disabled this mapping.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn apply(&self, registers: &[u16]) -> ModbusResult<()> {
        match &self.action {
            MappingAction::Custom(decode) => decode(registers),
            MappingAction::Scaled {
                format,
                scale,
                offset,
                sink,
            } => {
                let order = format.word_order();
                let raw = match (format.is_float(), self.count) {
                    (false, 1) => f64::from(codec::to_i16(registers)?),
                    (false, 2) => f64::from(codec::to_i32(registers, order)?),
                    (false, 4) => codec::to_i64(registers, order)? as f64,
                    (true, 2) => f64::from(codec::to_f32(registers, order)?),
                    (true, 4) => codec::to_f64(registers, order)?,
                    _ => unreachable!("validated at construction"),
                };
                let mut value = raw;
                if let Some(scale) = scale {
                    value *= scale;
                }
                if let Some(offset) = offset {
                    value += offset;
                }
                sink(value)
            }
        }
    }
}

fn range_checked_sink<T, F>(
    min: f64,
    max: f64,
    type_name: &'static str,
    convert: fn(f64) -> T,
    sink: F,
) -> SinkFn
where
    F: Fn(T) + Send + Sync + 'static,
    T: 'static,
{
    Box::new(move |value| {
        if !value.is_finite() || value < min || value > max {
            return Err(ModbusError::unsupported(format!(
                "value {} not representable as {}",
                value, type_name
            )));
        }
        sink(convert(value));
        Ok(())
    })
}

/// Sink into an unsigned 8-bit target.
pub fn sink_u8(sink: impl Fn(u8) + Send + Sync + 'static) -> SinkFn {
    range_checked_sink(0.0, f64::from(u8::MAX), "u8", |v| v as u8, sink)
}

/// Sink into a signed 16-bit target.
pub fn sink_i16(sink: impl Fn(i16) + Send + Sync + 'static) -> SinkFn {
    range_checked_sink(
        f64::from(i16::MIN),
        f64::from(i16::MAX),
        "i16",
        |v| v as i16,
        sink,
    )
}

/// Sink into a signed 32-bit target.
pub fn sink_i32(sink: impl Fn(i32) + Send + Sync + 'static) -> SinkFn {
    range_checked_sink(
        f64::from(i32::MIN),
        f64::from(i32::MAX),
        "i32",
        |v| v as i32,
        sink,
    )
}

/// Sink into a signed 64-bit target.
pub fn sink_i64(sink: impl Fn(i64) + Send + Sync + 'static) -> SinkFn {
    range_checked_sink(
        i64::MIN as f64,
        i64::MAX as f64,
        "i64",
        |v| v as i64,
        sink,
    )
}

/// Sink into an f32 target.
pub fn sink_f32(sink: impl Fn(f32) + Send + Sync + 'static) -> SinkFn {
    range_checked_sink(
        f64::from(f32::MIN),
        f64::from(f32::MAX),
        "f32",
        |v| v as f32,
        sink,
    )
}

/// Sink into an f64 target.
pub fn sink_f64(sink: impl Fn(f64) + Send + Sync + 'static) -> SinkFn {
    Box::new(move |value| {
        sink(value);
        Ok(())
    })
}

/// Periodic mirror of a remote device's holding registers.
pub struct PolledDevice {
    client: Arc<dyn ModbusClient>,
    unit_id: UnitId,
    period: Duration,
    mappings: Arc<Mutex<Vec<RegisterMapping>>>,
    task: std::sync::Mutex<Option<(JoinHandle<()>, broadcast::Sender<()>)>>,
}

impl PolledDevice {
    /// Bind a device at `unit_id` behind `client`, polling at the
    /// default period.
    pub fn new(client: Arc<dyn ModbusClient>, unit_id: UnitId) -> Self {
        Self {
            client,
            unit_id,
            period: Duration::from_secs(crate::DEFAULT_POLL_PERIOD_SECS),
            mappings: Arc::new(Mutex::new(Vec::new())),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Set the poll period. Clamped to the 100 ms floor.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period.max(crate::MIN_POLL_INTERVAL);
        self
    }

    /// Register a mapping. Mappings refresh in registration order.
    pub async fn add_mapping(&self, mapping: RegisterMapping) {
        self.mappings.lock().await.push(mapping);
    }

    /// Remove every mapping.
    pub async fn clear_mappings(&self) {
        self.mappings.lock().await.clear();
    }

    /// Run one refresh pass immediately, outside the timer.
    pub async fn refresh(&self) {
        let mut mappings = self.mappings.lock().await;
        Self::run_pass(self.client.as_ref(), self.unit_id, &mut mappings).await;
    }

    async fn run_pass(
        client: &dyn ModbusClient,
        unit_id: UnitId,
        mappings: &mut [RegisterMapping],
    ) {
        for mapping in mappings.iter_mut() {
            if mapping.disabled {
                continue;
            }
            match client
                .read_holding_registers(unit_id, mapping.start, mapping.count)
                .await
            {
                Ok(registers) => {
                    if let Err(e) = mapping.apply(&registers) {
                        error!(
                            "mapping at register {} disabled: {}",
                            mapping.start, e
                        );
                        mapping.disabled = true;
                    }
                }
                Err(e @ ModbusError::Timeout { .. }) => {
                    // Device absent: abandon this tick, keep the
                    // mappings for the next one.
                    warn!("poll tick aborted at register {}: {}", mapping.start, e);
                    break;
                }
                Err(e) => {
                    warn!("poll read at register {} failed: {}", mapping.start, e);
                }
            }
        }
    }

    /// Launch the poll timer. Idempotent while running.
    pub fn start_polling(&self) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let client = self.client.clone();
        let mappings = self.mappings.clone();
        let unit_id = self.unit_id;
        let period = self.period;

        let handle = tokio::spawn(async move {
            loop {
                let tick_start = Instant::now();
                {
                    let mut mappings = mappings.lock().await;
                    Self::run_pass(client.as_ref(), unit_id, &mut mappings).await;
                }
                let delay = period
                    .saturating_sub(tick_start.elapsed())
                    .max(crate::MIN_POLL_INTERVAL);
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = sleep(delay) => {}
                }
            }
        });

        *task = Some((handle, shutdown_tx));
    }

    /// Stop the poll timer. Idempotent.
    pub fn stop_polling(&self) {
        if let Some((_handle, shutdown_tx)) = self.task.lock().unwrap().take() {
            let _ = shutdown_tx.send(());
        }
    }

    /// Whether the poll timer is running.
    pub fn is_polling(&self) -> bool {
        self.task.lock().unwrap().is_some()
    }

    /// Write holding registers on the bound device, delegating to the
    /// client's single- or multi-register write. Takes the mapping
    /// lock, so writes never land in the middle of a refresh pass.
    pub async fn write_holding_register(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        if values.is_empty() {
            return Err(ModbusError::invalid_data("no register values"));
        }
        let _mappings = self.mappings.lock().await;
        if values.len() == 1 {
            self.client
                .write_single_register(self.unit_id, address, values[0])
                .await
        } else {
            self.client
                .write_multiple_registers(self.unit_id, address, values)
                .await
        }
    }
}

impl Drop for PolledDevice {
    fn drop(&mut self) {
        if let Some((_handle, shutdown_tx)) = self.task.lock().unwrap().take() {
            let _ = shutdown_tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn capture() -> (Arc<StdMutex<Option<f64>>>, SinkFn) {
        let slot = Arc::new(StdMutex::new(None));
        let writer = slot.clone();
        let sink = sink_f64(move |v| {
            *writer.lock().unwrap() = Some(v);
        });
        (slot, sink)
    }

    #[test]
    fn test_scaled_integer_mapping() {
        let (slot, sink) = capture();
        let mapping = RegisterMapping::scaled(0, 1, SourceFormat::BigEndianInteger, sink)
            .unwrap()
            .with_scale(0.1)
            .with_offset(-40.0);

        mapping.apply(&[500]).unwrap();
        assert_eq!(slot.lock().unwrap().unwrap(), 10.0);
    }

    #[test]
    fn test_signed_16bit_decode() {
        let (slot, sink) = capture();
        let mapping =
            RegisterMapping::scaled(0, 1, SourceFormat::BigEndianInteger, sink).unwrap();
        mapping.apply(&[0xFFFF]).unwrap();
        assert_eq!(slot.lock().unwrap().unwrap(), -1.0);
    }

    #[test]
    fn test_float_mapping_word_orders() {
        // 25.0f32 = 0x41C80000
        let (slot, sink) = capture();
        let mapping =
            RegisterMapping::scaled(0, 2, SourceFormat::BigEndianFloat, sink).unwrap();
        mapping.apply(&[0x41C8, 0x0000]).unwrap();
        assert_eq!(slot.lock().unwrap().unwrap(), 25.0);

        let (slot, sink) = capture();
        let mapping =
            RegisterMapping::scaled(0, 2, SourceFormat::LittleEndianFloat, sink).unwrap();
        mapping.apply(&[0x0000, 0x41C8]).unwrap();
        assert_eq!(slot.lock().unwrap().unwrap(), 25.0);
    }

    #[test]
    fn test_64bit_integer_mapping() {
        let (slot, sink) = capture();
        let mapping =
            RegisterMapping::scaled(0, 4, SourceFormat::BigEndianInteger, sink).unwrap();
        mapping.apply(&[0, 0, 0x0001, 0x0000]).unwrap();
        assert_eq!(slot.lock().unwrap().unwrap(), 65536.0);
    }

    #[test]
    fn test_custom_decoder_gets_raw_registers() {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let writer = seen.clone();
        let mapping = RegisterMapping::custom(5, 3, move |regs| {
            *writer.lock().unwrap() = regs.to_vec();
            Ok(())
        })
        .unwrap();

        mapping.apply(&[1, 2, 3]).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_sink_range_check() {
        let sink = sink_i16(|_| {});
        assert!(sink(100.0).is_ok());
        assert!(sink(40_000.0).is_err());
        assert!(sink(f64::NAN).is_err());

        let sink = sink_u8(|_| {});
        assert!(sink(255.0).is_ok());
        assert!(sink(-1.0).is_err());
    }

    #[test]
    fn test_invalid_mapping_shapes() {
        assert!(RegisterMapping::scaled(0, 3, SourceFormat::BigEndianInteger, |_| Ok(())).is_err());
        assert!(RegisterMapping::scaled(0, 1, SourceFormat::BigEndianFloat, |_| Ok(())).is_err());
        assert!(RegisterMapping::custom(0, 0, |_| Ok(())).is_err());
    }
}
