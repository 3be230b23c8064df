//! CRC-16/MODBUS frame checksum.
//!
//! RTU frames append a 16-bit CRC computed over the address byte and
//! the PDU, transmitted low byte first. The checksum itself comes from
//! the `crc` crate's CRC_16_MODBUS definition (polynomial 0xA001
//! reflected, initial value 0xFFFF).

use crc::{Crc, CRC_16_MODBUS};

use crate::error::{ModbusError, ModbusResult};

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Compute the CRC-16/MODBUS checksum of `data`.
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Write the CRC of everything before the last two bytes of `frame`
/// into those two bytes, low byte first.
///
/// Returns an error if `frame` is too short to hold a CRC.
pub fn fill_crc(frame: &mut [u8]) -> ModbusResult<()> {
    if frame.len() < 3 {
        return Err(ModbusError::frame("frame too short for CRC"));
    }
    let split = frame.len() - 2;
    let crc = crc16(&frame[..split]);
    frame[split] = (crc & 0xFF) as u8;
    frame[split + 1] = (crc >> 8) as u8;
    Ok(())
}

/// Verify the trailing CRC of a complete RTU frame.
///
/// On mismatch returns [`ModbusError::CrcMismatch`] carrying the
/// expected value, the received value and the frame bytes.
pub fn check_crc(frame: &[u8]) -> ModbusResult<()> {
    if frame.len() < 4 {
        return Err(ModbusError::frame("frame too short for CRC check"));
    }
    let split = frame.len() - 2;
    let expected = crc16(&frame[..split]);
    let actual = u16::from_le_bytes([frame[split], frame[split + 1]]);
    if expected != actual {
        return Err(ModbusError::crc_mismatch(expected, actual, frame));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit-by-bit reference implementation used to cross-check the
    /// table-driven `crc` crate.
    fn reference_crc16(data: &[u8]) -> u16 {
        let mut crc = 0xFFFFu16;
        for byte in data {
            crc ^= u16::from(*byte);
            for _ in 0..8 {
                if crc & 0x0001 != 0 {
                    crc = (crc >> 1) ^ 0xA001;
                } else {
                    crc >>= 1;
                }
            }
        }
        crc
    }

    #[test]
    fn test_known_vectors() {
        let cases: &[(&[u8], u16)] = &[
            (&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02], 0x0BC4),
            (&[0x01, 0x04, 0x00, 0x00, 0x00, 0x01], 0xCA31),
            (&[0x07, 0x03, 0x00, 0x0B, 0x00, 0x0D], 0xABF5),
            (&[0x01, 0x06, 0x00, 0x07, 0x00, 0x2A], 0xD4B9),
            (&[0x11, 0x01, 0x00, 0x0D, 0x00, 0x07], 0x9BEE),
        ];
        for (data, expected) in cases {
            assert_eq!(crc16(data), *expected, "vector {:02X?}", data);
        }
    }

    #[test]
    fn test_matches_reference() {
        let buffers: &[&[u8]] = &[
            &[],
            &[0x00],
            &[0xFF; 32],
            &[0x01, 0x05, 0x00, 0x07, 0xFF, 0x00],
            &[0x11, 0x0F, 0x00, 0x13, 0x00, 0x11, 0x03, 0x55, 0x55, 0x01],
        ];
        for buf in buffers {
            assert_eq!(crc16(buf), reference_crc16(buf));
        }
    }

    #[test]
    fn test_fill_and_check() {
        let mut frame = vec![0x07, 0x03, 0x00, 0x0B, 0x00, 0x0D, 0x00, 0x00];
        fill_crc(&mut frame).unwrap();
        assert_eq!(&frame, &[0x07, 0x03, 0x00, 0x0B, 0x00, 0x0D, 0xF5, 0xAB]);
        assert!(check_crc(&frame).is_ok());

        frame[3] ^= 0x01;
        let err = check_crc(&frame).unwrap_err();
        assert!(matches!(err, ModbusError::CrcMismatch { .. }));
    }

    #[test]
    fn test_short_frames_rejected() {
        assert!(fill_crc(&mut [0x01, 0x02]).is_err());
        assert!(check_crc(&[0x01, 0x02, 0x03]).is_err());
    }
}
