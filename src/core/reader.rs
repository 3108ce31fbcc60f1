//! Read cursor over the bytes of one incoming packet.
//!
//! The reader sees everything after the packet id that is currently buffered, which may
//! be less than the packet needs. Reading past the end yields
//! [`ProtocolError::Truncated`], which the framing loop turns into "need more data".
//!
//! The number of bytes a packet consumed is the cursor's high-water mark, not its final
//! position: a packet may read a length field further ahead and seek back.

use crate::error::{ProtocolError, Result};
use crate::utils::text::{remove_illegal_chars, truncate_at_nul};

pub struct PacketReader<'a> {
    bytes: &'a [u8],
    position: usize,
    high_water: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            position: 0,
            high_water: 0,
        }
    }

    /// Bytes currently buffered for this packet (excluding the id).
    pub fn available(&self) -> usize {
        self.bytes.len()
    }

    /// Cursor position relative to the first byte after the id.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Furthest position the cursor has reached.
    pub fn consumed(&self) -> usize {
        self.high_water
    }

    /// Bytes between the cursor and the end of the buffered data.
    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.position)
    }

    /// Move the cursor to `count` bytes after the id. May go past the buffered data.
    pub fn seek_from_start(&mut self, count: usize) {
        self.move_to(count);
    }

    /// Move the cursor relative to its current position.
    pub fn seek_from_current(&mut self, delta: isize) -> Result<()> {
        let target = self.position.checked_add_signed(delta).ok_or_else(|| {
            ProtocolError::InvalidData(format!(
                "seek by {delta} from {} leaves the packet",
                self.position
            ))
        })?;
        self.move_to(target);
        Ok(())
    }

    #[inline]
    fn move_to(&mut self, position: usize) {
        self.position = position;
        self.high_water = self.high_water.max(position);
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(ProtocolError::Truncated {
                needed: self.position.saturating_add(len),
                available: self.bytes.len(),
            })?;
        let slice = &self.bytes[self.position..end];
        self.move_to(end);
        Ok(slice)
    }

    #[inline]
    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Fixed-length text field, cut at the first NUL, line breaks removed, tabs as spaces.
    pub fn read_ascii(&mut self, len: usize) -> Result<String> {
        Ok(remove_illegal_chars(&self.read_ascii_raw(len)?))
    }

    /// Fixed-length text field, only cut at the first NUL.
    pub fn read_ascii_raw(&mut self, len: usize) -> Result<String> {
        let raw = String::from_utf8_lossy(self.take(len)?);
        Ok(truncate_at_nul(&raw).to_owned())
    }

    /// NUL-terminated text; the terminator is consumed but not returned.
    pub fn read_terminated_ascii(&mut self) -> Result<String> {
        let rest = &self.bytes[self.position.min(self.bytes.len())..];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::Truncated {
                needed: self.bytes.len() + 1,
                available: self.bytes.len(),
            })?;
        let text = self.read_ascii(len)?;
        self.take(1)?;
        Ok(text)
    }

    /// Big-endian UTF-16 field of `len` bytes, sanitized like [`read_ascii`](Self::read_ascii).
    pub fn read_utf16be(&mut self, len: usize) -> Result<String> {
        Ok(remove_illegal_chars(&self.read_utf16be_raw(len)?))
    }

    /// Big-endian UTF-16 field of `len` bytes, only cut at the first NUL.
    pub fn read_utf16be_raw(&mut self, len: usize) -> Result<String> {
        let units = self
            .take(len)?
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
        let decoded: String = char::decode_utf16(units)
            .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
        Ok(truncate_at_nul(&decoded).to_owned())
    }

    /// UTF-8 text preceded by an `i32` byte count. Not sanitized.
    pub fn read_prefixed_utf8(&mut self) -> Result<String> {
        let len = self.read_i32()?;
        let len = usize::try_from(len)
            .map_err(|_| ProtocolError::InvalidData(format!("negative string length {len}")))?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ProtocolError::InvalidData(format!("invalid UTF-8 string: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_integers() {
        let bytes = [0x12, 0x34, 0xff, 0xfe, 0x00, 0x00, 0x01, 0x00, 0x80];
        let mut r = PacketReader::new(&bytes);
        assert_eq!(r.read_u16().ok(), Some(0x1234));
        assert_eq!(r.read_i16().ok(), Some(-2));
        assert_eq!(r.read_u32().ok(), Some(256));
        assert_eq!(r.read_i8().ok(), Some(-128));
        assert_eq!(r.consumed(), 9);
    }

    #[test]
    fn test_reading_past_end_is_truncation() {
        let mut r = PacketReader::new(&[0x01]);
        let err = r.read_u16().unwrap_err();
        assert!(err.is_truncation());
        assert_eq!(r.consumed(), 0);
    }

    #[test]
    fn test_high_water_survives_backward_seek() {
        let bytes = [0u8, 0, 0, 5, 9];
        let mut r = PacketReader::new(&bytes);
        r.seek_from_start(3);
        let len = r.read_u8().unwrap_or_default();
        r.seek_from_start(0);
        assert_eq!(len, 5);
        assert_eq!(r.position(), 0);
        assert_eq!(r.consumed(), 4);
    }

    #[test]
    fn test_seek_before_start_fails() {
        let mut r = PacketReader::new(&[1, 2, 3]);
        assert!(r.seek_from_current(-1).is_err());
    }

    #[test]
    fn test_ascii_field_truncates_and_sanitizes() {
        let bytes = b"ab\tc\0garbage";
        let mut r = PacketReader::new(bytes);
        assert_eq!(r.read_ascii(12).ok().as_deref(), Some("ab c"));
        assert_eq!(r.consumed(), 12);
    }

    #[test]
    fn test_terminated_ascii_consumes_terminator() {
        let bytes = b"name\0\x07";
        let mut r = PacketReader::new(bytes);
        assert_eq!(r.read_terminated_ascii().ok().as_deref(), Some("name"));
        assert_eq!(r.read_u8().ok(), Some(7));
    }

    #[test]
    fn test_unterminated_ascii_needs_more_data() {
        let mut r = PacketReader::new(b"abc");
        assert!(r.read_terminated_ascii().unwrap_err().is_truncation());
    }

    #[test]
    fn test_utf16be_with_embedded_nul() {
        let bytes = [0x00, b'h', 0x00, b'i', 0x00, 0x00, 0x00, b'x'];
        let mut r = PacketReader::new(&bytes);
        assert_eq!(r.read_utf16be(8).ok().as_deref(), Some("hi"));
    }

    #[test]
    fn test_prefixed_utf8() {
        let mut bytes = 3i32.to_be_bytes().to_vec();
        bytes.extend_from_slice("a\nb".as_bytes());
        let mut r = PacketReader::new(&bytes);
        // not sanitized
        assert_eq!(r.read_prefixed_utf8().ok().as_deref(), Some("a\nb"));
    }

    #[test]
    fn test_negative_prefixed_length_is_invalid() {
        let bytes = (-1i32).to_be_bytes();
        let mut r = PacketReader::new(&bytes);
        assert!(matches!(
            r.read_prefixed_utf8(),
            Err(ProtocolError::InvalidData(_))
        ));
    }
}
