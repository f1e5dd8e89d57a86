//! Bounds-checked little-endian reads over a byte buffer.

use crate::error::MeasurementError;

/// Read-only view over a buffer with a movable position.
///
/// Every read is checked against the buffer length and reports the failing
/// offset instead of panicking.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// Cursor positioned at `offset`. The position itself is validated on read.
    pub fn at(buf: &'a [u8], offset: usize) -> Self {
        Self { buf, offset }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrow `len` bytes at an absolute offset without moving.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8], MeasurementError> {
        offset
            .checked_add(len)
            .and_then(|end| self.buf.get(offset..end))
            .ok_or(MeasurementError::Truncated {
                offset,
                needed: len,
                len: self.buf.len(),
            })
    }

    /// Take `len` bytes and advance.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8], MeasurementError> {
        let bytes = self.slice(self.offset, len)?;
        self.offset += len;
        Ok(bytes)
    }

    /// Take a fixed-size array and advance.
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], MeasurementError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u16_le(&mut self) -> Result<u16, MeasurementError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32_le(&mut self) -> Result<u32, MeasurementError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64_le(&mut self) -> Result<u64, MeasurementError> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

/// Read a little-endian `u16` at an absolute offset.
pub fn read_u16(buf: &[u8], offset: usize) -> Result<u16, MeasurementError> {
    Cursor::at(buf, offset).u16_le()
}

/// Read a little-endian `u32` at an absolute offset.
pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32, MeasurementError> {
    Cursor::at(buf, offset).u32_le()
}

/// Overwrite bytes at an absolute offset, failing if the range is out of bounds.
pub fn write_bytes(buf: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), MeasurementError> {
    let len = buf.len();
    offset
        .checked_add(bytes.len())
        .and_then(|end| buf.get_mut(offset..end))
        .ok_or(MeasurementError::Truncated {
            offset,
            needed: bytes.len(),
            len,
        })?
        .copy_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_reads() {
        let data = [0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0xff];
        let mut c = Cursor::new(&data);
        assert_eq!(c.u16_le().unwrap(), 0x1234);
        assert_eq!(c.u32_le().unwrap(), 0x12345678);
        assert_eq!(c.offset(), 6);
        assert_eq!(c.take(1).unwrap(), &[0xff]);
    }

    #[test]
    fn test_read_past_end_reports_offset() {
        let data = [0u8; 6];
        let err = read_u32(&data, 4).unwrap_err();
        assert!(matches!(
            err,
            MeasurementError::Truncated {
                offset: 4,
                needed: 4,
                len: 6
            }
        ));
    }

    #[test]
    fn test_offset_overflow_is_an_error() {
        let data = [0u8; 4];
        assert!(Cursor::new(&data).slice(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_write_bytes_bounds() {
        let mut buf = [0u8; 4];
        write_bytes(&mut buf, 2, &[1, 2]).unwrap();
        assert_eq!(buf, [0, 0, 1, 2]);
        assert!(write_bytes(&mut buf, 3, &[1, 2]).is_err());
    }
}
