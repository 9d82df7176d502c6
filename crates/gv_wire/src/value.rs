use chrono::TimeDelta;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::WireResult;
use crate::reader::StreamReader;
use crate::time::WireDate;
use crate::token::Token;
use crate::writer::StreamWriter;

// -----------------------------------------------------------------------------
// SimpleValue

/// A value whose token carries the whole payload inline: the primitive
/// fastpath of the stream.
///
/// Simple values never take part in type headers, back-references or
/// delegated serializer payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum SimpleValue {
    Null,
    Bool(bool),
    Byte(u8),
    SByte(i8),
    Short(i16),
    UShort(u16),
    Int(i32),
    UInt(u32),
    Long(i64),
    ULong(u64),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
    Char(char),
    Str(String),
    Guid(Uuid),
    Date(WireDate),
    Span(TimeDelta),
}

impl StreamWriter {
    /// Writes a simple value as its token plus inline payload.
    pub fn write_simple(&mut self, value: &SimpleValue) {
        match value {
            SimpleValue::Null => self.write_token(Token::Null),
            SimpleValue::Bool(true) => self.write_token(Token::True),
            SimpleValue::Bool(false) => self.write_token(Token::False),
            SimpleValue::Byte(v) => {
                self.write_token(Token::Byte);
                self.write_u8(*v);
            }
            SimpleValue::SByte(v) => {
                self.write_token(Token::SByte);
                self.write_i8(*v);
            }
            SimpleValue::Short(v) => {
                self.write_token(Token::Short);
                self.write_i16(*v);
            }
            SimpleValue::UShort(v) => {
                self.write_token(Token::UShort);
                self.write_u16(*v);
            }
            SimpleValue::Int(v) => {
                self.write_token(Token::Int);
                self.write_i32(*v);
            }
            SimpleValue::UInt(v) => {
                self.write_token(Token::UInt);
                self.write_u32(*v);
            }
            SimpleValue::Long(v) => {
                self.write_token(Token::Long);
                self.write_i64(*v);
            }
            SimpleValue::ULong(v) => {
                self.write_token(Token::ULong);
                self.write_u64(*v);
            }
            SimpleValue::Float(v) => {
                self.write_token(Token::Float);
                self.write_f32(*v);
            }
            SimpleValue::Double(v) => {
                self.write_token(Token::Double);
                self.write_f64(*v);
            }
            SimpleValue::Decimal(v) => {
                self.write_token(Token::Decimal);
                self.write_decimal(v);
            }
            SimpleValue::Char(v) => {
                self.write_token(Token::Char);
                self.write_char(*v);
            }
            SimpleValue::Str(v) => {
                self.write_token(Token::String);
                self.write_str(v);
            }
            SimpleValue::Guid(v) => {
                self.write_token(Token::Guid);
                self.write_uuid(v);
            }
            SimpleValue::Date(v) => {
                self.write_token(Token::Date);
                self.write_date(*v);
            }
            SimpleValue::Span(v) => {
                self.write_token(Token::TimeSpan);
                self.write_span(*v);
            }
        }
    }
}

impl StreamReader<'_> {
    /// Reads the next value if its token is simple.
    ///
    /// Non-destructive on anything else: the cursor stays on the token
    /// byte and `None` is returned, so structural dispatch can take over.
    pub fn try_read_simple(&mut self) -> WireResult<Option<SimpleValue>> {
        let value = match self.peek_token()? {
            Token::Null => SimpleValue::Null,
            Token::True => SimpleValue::Bool(true),
            Token::False => SimpleValue::Bool(false),
            Token::Byte => SimpleValue::Byte(self.skip_token().read_u8()?),
            Token::SByte => SimpleValue::SByte(self.skip_token().read_i8()?),
            Token::Short => SimpleValue::Short(self.skip_token().read_i16()?),
            Token::UShort => SimpleValue::UShort(self.skip_token().read_u16()?),
            Token::Int => SimpleValue::Int(self.skip_token().read_i32()?),
            Token::UInt => SimpleValue::UInt(self.skip_token().read_u32()?),
            Token::Long => SimpleValue::Long(self.skip_token().read_i64()?),
            Token::ULong => SimpleValue::ULong(self.skip_token().read_u64()?),
            Token::Float => SimpleValue::Float(self.skip_token().read_f32()?),
            Token::Double => SimpleValue::Double(self.skip_token().read_f64()?),
            Token::Decimal => SimpleValue::Decimal(self.skip_token().read_decimal()?),
            Token::Char => SimpleValue::Char(self.skip_token().read_char()?),
            Token::String => SimpleValue::Str(self.skip_token().read_str()?),
            Token::Guid => SimpleValue::Guid(self.skip_token().read_uuid()?),
            Token::Date => SimpleValue::Date(self.skip_token().read_date()?),
            Token::TimeSpan => SimpleValue::Span(self.skip_token().read_span()?),
            _ => return Ok(None),
        };
        // The payload-less tokens still need consuming.
        if matches!(
            value,
            SimpleValue::Null | SimpleValue::Bool(_)
        ) {
            self.read_token()?;
        }
        Ok(Some(value))
    }

    fn skip_token(&mut self) -> &mut Self {
        // Only called right after a successful peek.
        let _ = self.read_token();
        self
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use super::SimpleValue;
    use crate::time::{DateKind, WireDate};
    use crate::token::Token;
    use crate::{StreamReader, StreamWriter};

    fn round_trip(value: SimpleValue) {
        let mut writer = StreamWriter::new();
        writer.write_simple(&value);
        let bytes = writer.into_bytes();
        let mut reader = StreamReader::new(&bytes);
        assert_eq!(reader.try_read_simple().unwrap(), Some(value));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn simple_round_trips() {
        round_trip(SimpleValue::Null);
        round_trip(SimpleValue::Bool(true));
        round_trip(SimpleValue::Bool(false));
        round_trip(SimpleValue::Byte(0xA5));
        round_trip(SimpleValue::SByte(-3));
        round_trip(SimpleValue::Short(-1234));
        round_trip(SimpleValue::UShort(65_000));
        round_trip(SimpleValue::Int(i32::MIN));
        round_trip(SimpleValue::UInt(u32::MAX));
        round_trip(SimpleValue::Long(i64::MAX));
        round_trip(SimpleValue::ULong(u64::MAX));
        round_trip(SimpleValue::Float(2.5));
        round_trip(SimpleValue::Double(-0.125));
        round_trip(SimpleValue::Decimal(Decimal::new(31415, 4)));
        round_trip(SimpleValue::Char('Ω'));
        round_trip(SimpleValue::Str("hello".into()));
        round_trip(SimpleValue::Guid(Uuid::from_u128(0xDEAD_BEEF)));
        round_trip(SimpleValue::Date(WireDate::new(
            638_000_000_000_000_000,
            DateKind::Utc,
        )));
        round_trip(SimpleValue::Span(TimeDelta::seconds(42)));
    }

    #[test]
    fn non_simple_leaves_cursor_on_token() {
        let bytes = [Token::SpecifiedType.as_u8(), Token::NamedType.as_u8()];
        let mut reader = StreamReader::new(&bytes);
        assert_eq!(reader.try_read_simple().unwrap(), None);
        assert_eq!(reader.position(), 0);
        assert_eq!(reader.read_token().unwrap(), Token::SpecifiedType);
    }

    proptest::proptest! {
        #[test]
        fn arbitrary_ints_round_trip(v in proptest::num::i64::ANY) {
            round_trip(SimpleValue::Long(v));
        }

        #[test]
        fn arbitrary_strings_round_trip(s in ".*") {
            round_trip(SimpleValue::Str(s));
        }

        #[test]
        fn arbitrary_doubles_round_trip(v in proptest::num::f64::ANY) {
            let mut writer = StreamWriter::new();
            writer.write_simple(&SimpleValue::Double(v));
            let bytes = writer.into_bytes();
            let mut reader = StreamReader::new(&bytes);
            // Compare bit patterns so NaN payloads survive too.
            match reader.try_read_simple().unwrap() {
                Some(SimpleValue::Double(back)) => {
                    proptest::prop_assert_eq!(back.to_bits(), v.to_bits())
                }
                other => panic!("expected a double, decoded {other:?}"),
            }
        }
    }

    #[test]
    fn int_byte_shape() {
        let mut writer = StreamWriter::new();
        writer.write_simple(&SimpleValue::Int(42));
        assert_eq!(writer.as_bytes(), &[Token::Int.as_u8(), 0x2A, 0, 0, 0]);
    }

    #[test]
    fn string_byte_shape() {
        let mut writer = StreamWriter::new();
        writer.write_simple(&SimpleValue::Str("hello".into()));
        let mut expected = vec![Token::String.as_u8(), 5, 0, 0, 0];
        expected.extend_from_slice(b"hello");
        assert_eq!(writer.as_bytes(), expected.as_slice());
    }
}
