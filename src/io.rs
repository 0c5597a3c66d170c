//! Byte-level encode/decode plumbing shared by pages, cells and the
//! journal. All multi-byte integers are little-endian on disk.

use std::mem::size_of;

use crate::{error::DbError, types::DbResult};

pub trait Encodeable {
    fn encode(&self, w: &mut ByteWriter);
}

pub trait Decodeable: Sized {
    fn decode(r: &mut ByteReader<'_>) -> DbResult<Self>;
}

/// Append-only buffer used to marshal a page or a journal record.
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn write<T: Encodeable + ?Sized>(&mut self, obj: &T) {
        obj.encode(self);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Finish into a zero-padded buffer of exactly `size` bytes.
    pub fn into_padded_bytes(self, size: usize) -> DbResult<Vec<u8>> {
        let mut buf = self.buf;
        if buf.len() > size {
            return Err(DbError::corrupt(format!(
                "marshaled content is {} bytes, limit is {}",
                buf.len(),
                size
            )));
        }
        buf.resize(size, 0);
        Ok(buf)
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over a borrowed buffer. Decoding never panics; running off the
/// end of the buffer reports a corrupt file.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read<T: Decodeable>(&mut self) -> DbResult<T> {
        T::decode(self)
    }

    pub fn read_bytes(&mut self, count: usize) -> DbResult<&'a [u8]> {
        if self.pos + count > self.buf.len() {
            return Err(DbError::corrupt(format!(
                "unexpected end of buffer, need {} bytes at offset {}, have {}",
                count,
                self.pos,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

impl Encodeable for bool {
    fn encode(&self, w: &mut ByteWriter) {
        w.write_bytes(&[*self as u8]);
    }
}

impl Decodeable for bool {
    fn decode(r: &mut ByteReader<'_>) -> DbResult<Self> {
        let b: u8 = r.read()?;
        match b {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DbError::corrupt(format!("invalid bool byte {}", other))),
        }
    }
}

macro_rules! impl_codec {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self, w: &mut ByteWriter) {
                    w.write_bytes(&self.to_le_bytes());
                }
            }

            impl Decodeable for $t {
                fn decode(r: &mut ByteReader<'_>) -> DbResult<Self> {
                    let bytes = r.read_bytes(size_of::<Self>())?;
                    Ok(Self::from_le_bytes(bytes.try_into().unwrap()))
                }
            }
        )*
    }
}

impl_codec!(for u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let mut w = ByteWriter::new();
        w.write(&42u32);
        w.write(&-7i64);
        w.write(&true);
        w.write(&1.5f64);

        let buf = w.into_bytes();
        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read::<u32>().unwrap(), 42);
        assert_eq!(r.read::<i64>().unwrap(), -7);
        assert!(r.read::<bool>().unwrap());
        assert_eq!(r.read::<f64>().unwrap(), 1.5);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_little_endian_layout() {
        let mut w = ByteWriter::new();
        w.write(&0x01020304u32);
        assert_eq!(w.into_bytes(), vec![0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_short_buffer_is_an_error() {
        let buf = [1u8, 2];
        let mut r = ByteReader::new(&buf);
        assert!(r.read::<u64>().is_err());
    }

    #[test]
    fn test_padded_output() {
        let mut w = ByteWriter::new();
        w.write_bytes(&[1, 2, 3]);
        let padded = w.into_padded_bytes(8).unwrap();
        assert_eq!(padded, vec![1, 2, 3, 0, 0, 0, 0, 0]);

        let mut w = ByteWriter::new();
        w.write_bytes(&[0u8; 9]);
        assert!(w.into_padded_bytes(8).is_err());
    }
}
