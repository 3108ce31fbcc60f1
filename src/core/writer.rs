//! Write cursor used by outgoing packets.
//!
//! A packet writes into a caller-provided buffer at a caller-provided offset. The byte
//! count reported back is the high-water mark of the cursor, so a body writer can skip a
//! length field, write the payload, seek back and fill the length in.

use crate::error::{ProtocolError, Result};
use crate::utils::text::ascii_byte;

pub struct PacketWriter<'a> {
    buf: &'a mut [u8],
    start: usize,
    position: usize,
    high_water: usize,
}

impl<'a> PacketWriter<'a> {
    /// Writer starting at `offset` in `buf`.
    pub fn new(buf: &'a mut [u8], offset: usize) -> Result<Self> {
        if offset > buf.len() {
            return Err(ProtocolError::BufferOverflow {
                needed: offset,
                available: buf.len(),
            });
        }
        Ok(Self {
            buf,
            start: offset,
            position: offset,
            high_water: offset,
        })
    }

    /// Bytes written so far, measured to the furthest position reached.
    pub fn written(&self) -> usize {
        self.high_water - self.start
    }

    /// Cursor position relative to the packet start.
    pub fn position(&self) -> usize {
        self.position - self.start
    }

    pub fn seek_from_start(&mut self, count: usize) -> Result<()> {
        let target = self.start.saturating_add(count);
        self.move_to(target)
    }

    pub fn seek_from_current(&mut self, delta: isize) -> Result<()> {
        let target = self
            .position
            .checked_add_signed(delta)
            .filter(|&t| t >= self.start)
            .ok_or_else(|| {
                ProtocolError::InvalidData(format!(
                    "seek by {delta} from {} leaves the packet",
                    self.position()
                ))
            })?;
        self.move_to(target)
    }

    fn move_to(&mut self, target: usize) -> Result<()> {
        if target > self.buf.len() {
            return Err(ProtocolError::BufferOverflow {
                needed: target - self.start,
                available: self.buf.len() - self.start,
            });
        }
        self.position = target;
        self.high_water = self.high_water.max(target);
        Ok(())
    }

    fn reserve(&mut self, len: usize) -> Result<&mut [u8]> {
        let begin = self.position;
        let end = begin.saturating_add(len);
        self.move_to(end)?;
        Ok(&mut self.buf[begin..end])
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.reserve(1)?[0] = value;
        Ok(())
    }

    pub fn write_i8(&mut self, value: i8) -> Result<()> {
        self.write_u8(value as u8)
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(u8::from(value))
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_bytes_reversed(&mut self, bytes: &[u8]) -> Result<()> {
        let dst = self.reserve(bytes.len())?;
        for (d, s) in dst.iter_mut().zip(bytes.iter().rev()) {
            *d = *s;
        }
        Ok(())
    }

    /// Zero-fill `count` bytes.
    pub fn write_zeros(&mut self, count: usize) -> Result<()> {
        self.reserve(count)?.fill(0);
        Ok(())
    }

    /// ASCII text without terminator; non-ASCII characters become `?`.
    pub fn write_ascii(&mut self, value: &str) -> Result<()> {
        let dst = self.reserve(value.chars().count())?;
        for (d, c) in dst.iter_mut().zip(value.chars()) {
            *d = ascii_byte(c);
        }
        Ok(())
    }

    /// ASCII field of exactly `len` bytes: truncated or zero-filled.
    pub fn write_ascii_fixed(&mut self, value: &str, len: usize) -> Result<()> {
        let dst = self.reserve(len)?;
        dst.fill(0);
        for (d, c) in dst.iter_mut().zip(value.chars()) {
            *d = ascii_byte(c);
        }
        Ok(())
    }

    /// Big-endian UTF-16 text without terminator.
    pub fn write_utf16be(&mut self, value: &str) -> Result<()> {
        for unit in value.encode_utf16() {
            self.write_bytes(&unit.to_be_bytes())?;
        }
        Ok(())
    }

    /// Big-endian UTF-16 field of `max_chars` code units (`2 * max_chars` bytes).
    pub fn write_utf16be_fixed(&mut self, value: &str, max_chars: usize) -> Result<()> {
        self.write_utf16_fixed(value, max_chars, u16::to_be_bytes)
    }

    /// Little-endian UTF-16 text without terminator.
    pub fn write_utf16le(&mut self, value: &str) -> Result<()> {
        for unit in value.encode_utf16() {
            self.write_bytes(&unit.to_le_bytes())?;
        }
        Ok(())
    }

    /// Little-endian UTF-16 field of `max_chars` code units (`2 * max_chars` bytes).
    pub fn write_utf16le_fixed(&mut self, value: &str, max_chars: usize) -> Result<()> {
        self.write_utf16_fixed(value, max_chars, u16::to_le_bytes)
    }

    fn write_utf16_fixed(
        &mut self,
        value: &str,
        max_chars: usize,
        encode: fn(u16) -> [u8; 2],
    ) -> Result<()> {
        let dst = self.reserve(max_chars.saturating_mul(2))?;
        dst.fill(0);
        for (d, unit) in dst.chunks_exact_mut(2).zip(value.encode_utf16()) {
            d.copy_from_slice(&encode(unit));
        }
        Ok(())
    }

    /// UTF-8 text preceded by its `i32` byte count.
    pub fn write_prefixed_utf8(&mut self, value: &str) -> Result<()> {
        let len = i32::try_from(value.len())
            .map_err(|_| ProtocolError::InvalidData("string too long".to_string()))?;
        self.write_i32(len)?;
        self.write_bytes(value.as_bytes())
    }
}
