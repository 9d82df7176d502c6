use chrono::TimeDelta;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{WireError, WireResult};
use crate::time::{DateKind, WireDate, delta_from_ticks};
use crate::token::Token;

// -----------------------------------------------------------------------------
// StreamReader

/// A checked cursor over a received byte buffer.
///
/// Every read validates the remaining length first and fails with
/// [`WireError::Truncated`] instead of panicking; a decode operation that
/// runs off the end of its buffer is a stream format error, not a bug.
#[derive(Debug)]
pub struct StreamReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> StreamReader<'a> {
    #[inline]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// The current read position. Decoded objects are recorded under the
    /// offset their body starts at.
    #[inline(always)]
    pub fn position(&self) -> u32 {
        self.pos as u32
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, count: usize) -> WireResult<&'a [u8]> {
        if self.remaining() < count {
            return Err(WireError::Truncated {
                position: self.pos,
                needed: count - self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(bytes)
    }

    // -------------------------------------------------------------------------
    // Tokens

    /// Reads and consumes the next token byte.
    pub fn read_token(&mut self) -> WireResult<Token> {
        Token::try_from(self.take(1)?[0])
    }

    /// Looks at the next token byte without consuming it.
    pub fn peek_token(&self) -> WireResult<Token> {
        if self.remaining() == 0 {
            return Err(WireError::Truncated {
                position: self.pos,
                needed: 1,
            });
        }
        Token::try_from(self.buf[self.pos])
    }

    // -------------------------------------------------------------------------
    // Raw takes

    #[inline]
    pub fn read_u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    #[inline]
    pub fn read_i8(&mut self) -> WireResult<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    #[inline]
    pub fn read_bool(&mut self) -> WireResult<bool> {
        Ok(self.take(1)?[0] != 0)
    }

    #[inline]
    pub fn read_u16(&mut self) -> WireResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    #[inline]
    pub fn read_i16(&mut self) -> WireResult<i16> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    #[inline]
    pub fn read_u32(&mut self) -> WireResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    #[inline]
    pub fn read_i32(&mut self) -> WireResult<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    #[inline]
    pub fn read_u64(&mut self) -> WireResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    #[inline]
    pub fn read_i64(&mut self) -> WireResult<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    #[inline]
    pub fn read_f32(&mut self) -> WireResult<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    #[inline]
    pub fn read_f64(&mut self) -> WireResult<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Reads a 4-byte count validated against the remaining buffer.
    pub fn read_len(&mut self) -> WireResult<usize> {
        let length = self.read_u32()?;
        if length as usize > self.remaining() {
            return Err(WireError::BadLength {
                length,
                remaining: self.remaining(),
            });
        }
        Ok(length as usize)
    }

    /// Borrows the next `count` bytes.
    #[inline]
    pub fn read_bytes(&mut self, count: usize) -> WireResult<&'a [u8]> {
        self.take(count)
    }

    // -------------------------------------------------------------------------
    // Composite payloads

    pub fn read_char(&mut self) -> WireResult<char> {
        let scalar = self.read_u32()?;
        char::from_u32(scalar).ok_or(WireError::InvalidChar(scalar))
    }

    pub fn read_str(&mut self) -> WireResult<String> {
        let length = self.read_len()?;
        let bytes = self.take(length)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    pub fn read_uuid(&mut self) -> WireResult<Uuid> {
        let bytes: [u8; 16] = self.take(16)?.try_into().unwrap();
        Ok(Uuid::from_bytes(bytes))
    }

    pub fn read_decimal(&mut self) -> WireResult<Decimal> {
        let bytes: [u8; 16] = self.take(16)?.try_into().unwrap();
        Ok(Decimal::deserialize(bytes))
    }

    pub fn read_date(&mut self) -> WireResult<WireDate> {
        let ticks = self.read_i64()?;
        let kind = DateKind::try_from(self.read_u8()?)?;
        Ok(WireDate::new(ticks, kind))
    }

    pub fn read_span(&mut self) -> WireResult<TimeDelta> {
        Ok(delta_from_ticks(self.read_i64()?))
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::StreamReader;
    use crate::error::WireError;
    use crate::token::Token;

    #[test]
    fn truncation_is_an_error() {
        let mut reader = StreamReader::new(&[0x2A, 0x00]);
        assert_eq!(
            reader.read_i32(),
            Err(WireError::Truncated {
                position: 0,
                needed: 2
            })
        );
        // The failed read consumed nothing.
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn peek_does_not_consume() {
        let bytes = [Token::Int.as_u8(), 0x2A, 0, 0, 0];
        let mut reader = StreamReader::new(&bytes);
        assert_eq!(reader.peek_token().unwrap(), Token::Int);
        assert_eq!(reader.position(), 0);
        assert_eq!(reader.read_token().unwrap(), Token::Int);
        assert_eq!(reader.read_i32().unwrap(), 42);
    }

    #[test]
    fn oversized_length_prefix() {
        let mut reader = StreamReader::new(&[0xFF, 0xFF, 0xFF, 0x7F, b'x']);
        assert!(matches!(
            reader.read_len(),
            Err(WireError::BadLength { .. })
        ));
    }

    #[test]
    fn string_round_trip() {
        let mut writer = crate::StreamWriter::new();
        writer.write_str("héllo");
        let bytes = writer.into_bytes();
        let mut reader = StreamReader::new(&bytes);
        assert_eq!(reader.read_str().unwrap(), "héllo");
        assert_eq!(reader.remaining(), 0);
    }
}
