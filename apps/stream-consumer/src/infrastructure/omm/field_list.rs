//! Field List Decoder
//!
//! Turns the `fields` payload of a message into [`FieldEntry`] values.
//!
//! The payload is a `MessagePack` array of `[field_id, type_code, data]`
//! triples where `data` is binary or nil. Decoding is total below the
//! container: every element yields exactly one entry, and an element that
//! cannot be read becomes a [`FieldValue::Error`] entry instead of failing
//! the message.
//!
//! # Payload encodings
//!
//! | Type  | Bytes                                                     |
//! |-------|-----------------------------------------------------------|
//! | Int   | 1–8, big-endian two's complement                          |
//! | UInt  | 1–8, big-endian                                           |
//! | Real  | hint byte, then 1–8 byte signed mantissa                  |
//! | Date  | day, month, year (u16)                                    |
//! | Time  | hour, minute, second \[, millisecond (u16)\]              |
//! | Enum  | u16 code                                                  |
//! | Ascii | 7-bit text                                                |
//! | Rmtes | opaque                                                    |
//! | Error | u16 code, UTF-8 text                                      |
//!
//! Nil or zero-length data is blank whatever the declared type.

use std::sync::Arc;

use rmpv::Value;

use crate::domain::field::{
    DataType, Date, EnumValue, FieldDictionary, FieldEntry, FieldError, FieldValue, Real,
    RealHint, Time, error_codes,
};
use crate::infrastructure::omm::codec::CodecError;

/// Decoder for field list payloads.
#[derive(Debug, Clone)]
pub struct FieldListDecoder {
    dictionary: Arc<FieldDictionary>,
}

impl Default for FieldListDecoder {
    fn default() -> Self {
        Self::new(Arc::new(FieldDictionary::builtin()))
    }
}

impl FieldListDecoder {
    /// Create a decoder backed by a dictionary.
    #[must_use]
    pub const fn new(dictionary: Arc<FieldDictionary>) -> Self {
        Self { dictionary }
    }

    /// Dictionary used for names and enum displays.
    #[must_use]
    pub fn dictionary(&self) -> &FieldDictionary {
        &self.dictionary
    }

    /// Decode an encoded field list.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a `MessagePack` array.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<FieldEntry>, CodecError> {
        let mut cursor = bytes;
        let value = rmpv::decode::read_value(&mut cursor)?;
        self.decode_value(&value)
    }

    /// Decode an already parsed field list.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an array.
    pub fn decode_value(&self, value: &Value) -> Result<Vec<FieldEntry>, CodecError> {
        let entries = value.as_array().ok_or_else(|| {
            CodecError::InvalidFormat(format!("field list must be an array, got {value}"))
        })?;
        Ok(self.decode_entries(entries))
    }

    /// Decode every element of a field list, one entry per element.
    #[must_use]
    pub fn decode_entries(&self, entries: &[Value]) -> Vec<FieldEntry> {
        entries.iter().map(|entry| self.decode_entry(entry)).collect()
    }

    fn decode_entry(&self, entry: &Value) -> FieldEntry {
        let parts = entry.as_array().map_or(&[][..], Vec::as_slice);

        let field_id = parts
            .first()
            .and_then(Value::as_i64)
            .and_then(|id| i16::try_from(id).ok());
        let type_code = parts
            .get(1)
            .and_then(Value::as_u64)
            .and_then(|code| u8::try_from(code).ok());

        let (Some(field_id), Some(type_code), 3) = (field_id, type_code, parts.len()) else {
            return FieldEntry {
                field_id: field_id.unwrap_or_default(),
                name: None,
                data_type: DataType::Unknown(type_code.unwrap_or_default()),
                value: FieldValue::Error(FieldError::new(
                    error_codes::INVALID_ENTRY,
                    "expected [field_id, type, data]",
                )),
            };
        };

        let data_type = DataType::from_code(type_code);
        let value = match &parts[2] {
            Value::Nil => FieldValue::Blank,
            Value::Binary(bytes) if bytes.is_empty() => FieldValue::Blank,
            Value::Binary(bytes) => self.decode_data(field_id, data_type, bytes),
            other => FieldValue::Error(FieldError::new(
                error_codes::INVALID_ENTRY,
                format!("expected binary or nil data, got {other}"),
            )),
        };

        FieldEntry {
            field_id,
            name: self.dictionary.name(field_id).map(ToString::to_string),
            data_type,
            value,
        }
    }

    fn decode_data(&self, field_id: i16, data_type: DataType, bytes: &[u8]) -> FieldValue {
        let decoded = match data_type {
            DataType::Int => decode_int(bytes).map(FieldValue::Int),
            DataType::UInt => decode_uint(bytes).map(FieldValue::UInt),
            DataType::Real => decode_real(bytes).map(FieldValue::Real),
            DataType::Date => decode_date(bytes).map(FieldValue::Date),
            DataType::Time => decode_time(bytes).map(FieldValue::Time),
            DataType::Enum => decode_u16(bytes).map(|code| {
                FieldValue::Enum(EnumValue {
                    code,
                    display: self
                        .dictionary
                        .enum_display(field_id, code)
                        .map(ToString::to_string),
                })
            }),
            DataType::AsciiString => decode_ascii(bytes).map(FieldValue::Ascii),
            DataType::RmtesString => Ok(FieldValue::Rmtes(bytes.to_vec())),
            DataType::Error => decode_error(bytes).map(FieldValue::Error),
            DataType::Unknown(type_code) => Ok(FieldValue::Unsupported {
                type_code,
                raw: bytes.to_vec(),
            }),
        };

        decoded.unwrap_or_else(FieldValue::Error)
    }
}

// =============================================================================
// Primitive decoders
// =============================================================================

fn invalid_length(what: &str, len: usize) -> FieldError {
    FieldError::new(
        error_codes::INVALID_LENGTH,
        format!("invalid {what} length {len}"),
    )
}

fn widen(bytes: &[u8], fill: u8) -> [u8; 8] {
    let mut buf = [fill; 8];
    buf[8 - bytes.len()..].copy_from_slice(bytes);
    buf
}

fn decode_int(bytes: &[u8]) -> Result<i64, FieldError> {
    if !(1..=8).contains(&bytes.len()) {
        return Err(invalid_length("int", bytes.len()));
    }
    let fill = if bytes[0] & 0x80 == 0 { 0x00 } else { 0xFF };
    Ok(i64::from_be_bytes(widen(bytes, fill)))
}

fn decode_uint(bytes: &[u8]) -> Result<u64, FieldError> {
    if !(1..=8).contains(&bytes.len()) {
        return Err(invalid_length("uint", bytes.len()));
    }
    Ok(u64::from_be_bytes(widen(bytes, 0x00)))
}

fn decode_u16(bytes: &[u8]) -> Result<u16, FieldError> {
    match bytes {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(invalid_length("enum", bytes.len())),
    }
}

fn decode_real(bytes: &[u8]) -> Result<Real, FieldError> {
    let Some((&hint_byte, mantissa)) = bytes.split_first() else {
        return Err(invalid_length("real", 0));
    };

    let hint = RealHint::from_byte(hint_byte).ok_or_else(|| {
        FieldError::new(
            error_codes::INVALID_HINT,
            format!("invalid real hint {hint_byte}"),
        )
    })?;

    match hint {
        RealHint::Infinity | RealHint::NegInfinity | RealHint::NotANumber
            if mantissa.len() <= 8 =>
        {
            Ok(Real::new(0, hint))
        }
        _ => decode_int(mantissa)
            .map(|m| Real::new(m, hint))
            .map_err(|_| invalid_length("real", bytes.len())),
    }
}

fn decode_date(bytes: &[u8]) -> Result<Date, FieldError> {
    match bytes {
        [day, month, y_hi, y_lo] => Ok(Date {
            day: *day,
            month: *month,
            year: u16::from_be_bytes([*y_hi, *y_lo]),
        }),
        _ => Err(invalid_length("date", bytes.len())),
    }
}

fn decode_time(bytes: &[u8]) -> Result<Time, FieldError> {
    match bytes {
        [hour, minute, second] => Ok(Time {
            hour: *hour,
            minute: *minute,
            second: *second,
            millisecond: 0,
        }),
        [hour, minute, second, ms_hi, ms_lo] => Ok(Time {
            hour: *hour,
            minute: *minute,
            second: *second,
            millisecond: u16::from_be_bytes([*ms_hi, *ms_lo]),
        }),
        _ => Err(invalid_length("time", bytes.len())),
    }
}

fn decode_ascii(bytes: &[u8]) -> Result<String, FieldError> {
    if !bytes.is_ascii() {
        return Err(FieldError::new(
            error_codes::INVALID_TEXT,
            "non-ASCII byte in ASCII field",
        ));
    }
    String::from_utf8(bytes.to_vec())
        .map_err(|e| FieldError::new(error_codes::INVALID_TEXT, e.to_string()))
}

fn decode_error(bytes: &[u8]) -> Result<FieldError, FieldError> {
    let [hi, lo, text @ ..] = bytes else {
        return Err(invalid_length("error", bytes.len()));
    };
    let text = std::str::from_utf8(text)
        .map_err(|e| FieldError::new(error_codes::INVALID_TEXT, e.to_string()))?;
    Ok(FieldError::new(u16::from_be_bytes([*hi, *lo]), text))
}
