//! Field List Value Model
//!
//! Normalized, codec-agnostic representation of self-describing field
//! entries. Each entry carries the field id, the type declared on the wire,
//! and the decoded value. Decoding problems never escape as errors; they are
//! carried as [`FieldValue::Error`] so one bad field cannot spoil a message.

mod dictionary;

use std::fmt;

use rust_decimal::Decimal;

pub use dictionary::FieldDictionary;

// =============================================================================
// Data Types
// =============================================================================

/// Wire type codes for field entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Signed integer.
    Int,
    /// Unsigned integer.
    UInt,
    /// Scaled decimal.
    Real,
    /// Calendar date.
    Date,
    /// Time of day.
    Time,
    /// Enumerated code.
    Enum,
    /// 7-bit ASCII text.
    AsciiString,
    /// Multilingual text carried in its source encoding.
    RmtesString,
    /// Error code with text.
    Error,
    /// A code outside the known set.
    Unknown(u8),
}

impl DataType {
    /// Map a wire type code to a data type.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            3 => Self::Int,
            4 => Self::UInt,
            8 => Self::Real,
            9 => Self::Date,
            10 => Self::Time,
            14 => Self::Enum,
            17 => Self::AsciiString,
            19 => Self::RmtesString,
            27 => Self::Error,
            other => Self::Unknown(other),
        }
    }

    /// Wire type code for this data type.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Int => 3,
            Self::UInt => 4,
            Self::Real => 8,
            Self::Date => 9,
            Self::Time => 10,
            Self::Enum => 14,
            Self::AsciiString => 17,
            Self::RmtesString => 19,
            Self::Error => 27,
            Self::Unknown(code) => code,
        }
    }

    /// Display name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int => "Int",
            Self::UInt => "UInt",
            Self::Real => "Real",
            Self::Date => "Date",
            Self::Time => "Time",
            Self::Enum => "Enum",
            Self::AsciiString => "Ascii",
            Self::RmtesString => "Rmtes",
            Self::Error => "Error",
            Self::Unknown(_) => "Unknown",
        }
    }
}

/// Tag describing which kind of value an entry decoded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    /// Signed integer.
    Int,
    /// Unsigned integer.
    UInt,
    /// Scaled decimal.
    Real,
    /// Calendar date.
    Date,
    /// Time of day.
    Time,
    /// Enumerated code.
    Enum,
    /// ASCII text.
    AsciiString,
    /// Multilingual text.
    RmtesString,
    /// Error code with text.
    Error,
    /// No value.
    Blank,
    /// Type code not understood by the decoder.
    Unsupported,
}

// =============================================================================
// Real
// =============================================================================

/// Scale hint of a [`Real`] value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RealHint {
    /// Mantissa × 10^n, n in -14..=7.
    Exponent(i8),
    /// Mantissa ÷ 2^n, n in 0..=8.
    Fraction(u8),
    /// Positive infinity.
    Infinity,
    /// Negative infinity.
    NegInfinity,
    /// Not a number.
    NotANumber,
}

impl RealHint {
    /// Decode a wire hint byte.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn from_byte(hint: u8) -> Option<Self> {
        match hint {
            0..=21 => Some(Self::Exponent(hint as i8 - 14)),
            22..=30 => Some(Self::Fraction(hint - 22)),
            33 => Some(Self::Infinity),
            34 => Some(Self::NegInfinity),
            35 => Some(Self::NotANumber),
            _ => None,
        }
    }

    /// Encode as a wire hint byte.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Exponent(exp) => (exp + 14) as u8,
            Self::Fraction(pow) => pow + 22,
            Self::Infinity => 33,
            Self::NegInfinity => 34,
            Self::NotANumber => 35,
        }
    }
}

/// A scaled numeric value: mantissa plus scale hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Real {
    /// Unscaled value.
    pub mantissa: i64,
    /// Scale to apply.
    pub hint: RealHint,
}

impl Real {
    /// Create a real from mantissa and hint.
    #[must_use]
    pub const fn new(mantissa: i64, hint: RealHint) -> Self {
        Self { mantissa, hint }
    }

    /// Exact decimal value, or `None` for infinities, NaN, or values whose
    /// scale does not fit a `Decimal`.
    #[must_use]
    pub fn to_decimal(&self) -> Option<Decimal> {
        match self.hint {
            RealHint::Exponent(exp) if exp <= 0 => {
                let scale = u32::from(exp.unsigned_abs());
                Decimal::try_from_i128_with_scale(i128::from(self.mantissa), scale).ok()
            }
            RealHint::Exponent(exp) => {
                let factor = Decimal::from(10_i64.pow(u32::from(exp.unsigned_abs())));
                Decimal::from(self.mantissa).checked_mul(factor)
            }
            RealHint::Fraction(pow) => {
                let divisor = Decimal::from(1_i64 << pow);
                Decimal::from(self.mantissa).checked_div(divisor)
            }
            RealHint::Infinity | RealHint::NegInfinity | RealHint::NotANumber => None,
        }
    }

    /// Floating-point approximation, defined for every hint.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> f64 {
        match self.hint {
            RealHint::Exponent(exp) => self.mantissa as f64 * 10_f64.powi(i32::from(exp)),
            RealHint::Fraction(pow) => self.mantissa as f64 / f64::from(1_u32 << pow),
            RealHint::Infinity => f64::INFINITY,
            RealHint::NegInfinity => f64::NEG_INFINITY,
            RealHint::NotANumber => f64::NAN,
        }
    }
}

impl fmt::Display for Real {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_decimal() {
            Some(value) => write!(f, "{value}"),
            None => write!(f, "{}", self.as_f64()),
        }
    }
}

// =============================================================================
// Date / Time
// =============================================================================

/// Calendar date carried exactly as received (no validation or timezone).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Date {
    /// Day of month.
    pub day: u8,
    /// Month of year.
    pub month: u8,
    /// Year.
    pub year: u16,
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} / {}", self.day, self.month, self.year)
    }
}

/// Time of day carried exactly as received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Time {
    /// Hour.
    pub hour: u8,
    /// Minute.
    pub minute: u8,
    /// Second.
    pub second: u8,
    /// Millisecond.
    pub millisecond: u16,
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} : {} : {} : {}",
            self.hour, self.minute, self.second, self.millisecond
        )
    }
}

// =============================================================================
// Enum / Error
// =============================================================================

/// Enumerated value with its display string when the dictionary knows it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnumValue {
    /// Numeric code.
    pub code: u16,
    /// Display string from the dictionary.
    pub display: Option<String>,
}

impl fmt::Display for EnumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display {
            Some(display) => f.write_str(display),
            None => write!(f, "{}", self.code),
        }
    }
}

/// Error codes produced by the decoder for entries it could not read.
pub mod error_codes {
    /// The entry was not a `[fid, type, data]` triple.
    pub const INVALID_ENTRY: u16 = 0xFF01;
    /// The payload length does not match the declared type.
    pub const INVALID_LENGTH: u16 = 0xFF02;
    /// The real hint byte is outside the known set.
    pub const INVALID_HINT: u16 = 0xFF03;
    /// ASCII payload contained non-ASCII bytes, or error text was not UTF-8.
    pub const INVALID_TEXT: u16 = 0xFF04;
}

/// Error value: either sent by the provider or produced by a failed decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldError {
    /// Error code.
    pub code: u16,
    /// Human-readable description.
    pub text: String,
}

impl FieldError {
    /// Create a field error.
    #[must_use]
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }
}

impl FieldError {
    /// Check whether the error was produced locally by a failed decode
    /// rather than sent by the provider.
    #[must_use]
    pub const fn is_decode_failure(&self) -> bool {
        matches!(
            self.code,
            error_codes::INVALID_ENTRY
                | error_codes::INVALID_LENGTH
                | error_codes::INVALID_HINT
                | error_codes::INVALID_TEXT
        )
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.text)
    }
}

// =============================================================================
// Field Value / Entry
// =============================================================================

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Scaled decimal.
    Real(Real),
    /// Calendar date.
    Date(Date),
    /// Time of day.
    Time(Time),
    /// Enumerated value.
    Enum(EnumValue),
    /// ASCII text.
    Ascii(String),
    /// Multilingual text, raw bytes in source encoding.
    Rmtes(Vec<u8>),
    /// Error code with text.
    Error(FieldError),
    /// Explicit "no value" marker.
    Blank,
    /// Unrecognized type code; raw bytes kept.
    Unsupported {
        /// Type code as received.
        type_code: u8,
        /// Raw payload.
        raw: Vec<u8>,
    },
}

impl FieldValue {
    /// Tag of this value.
    #[must_use]
    pub const fn type_tag(&self) -> TypeTag {
        match self {
            Self::Int(_) => TypeTag::Int,
            Self::UInt(_) => TypeTag::UInt,
            Self::Real(_) => TypeTag::Real,
            Self::Date(_) => TypeTag::Date,
            Self::Time(_) => TypeTag::Time,
            Self::Enum(_) => TypeTag::Enum,
            Self::Ascii(_) => TypeTag::AsciiString,
            Self::Rmtes(_) => TypeTag::RmtesString,
            Self::Error(_) => TypeTag::Error,
            Self::Blank => TypeTag::Blank,
            Self::Unsupported { .. } => TypeTag::Unsupported,
        }
    }

    /// Check for the blank marker.
    #[must_use]
    pub const fn is_blank(&self) -> bool {
        matches!(self, Self::Blank)
    }

    /// Check for an entry the decoder could not read.
    #[must_use]
    pub const fn is_decode_failure(&self) -> bool {
        match self {
            Self::Error(e) => e.is_decode_failure(),
            _ => false,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Real(v) => write!(f, "{v}"),
            Self::Date(v) => write!(f, "{v}"),
            Self::Time(v) => write!(f, "{v}"),
            Self::Enum(v) => write!(f, "{v}"),
            Self::Ascii(v) => f.write_str(v),
            Self::Rmtes(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
            Self::Error(e) => write!(f, "{e}"),
            Self::Blank => f.write_str("blank"),
            Self::Unsupported { type_code, raw } => {
                write!(f, "<unsupported type {type_code}, {} bytes>", raw.len())
            }
        }
    }
}

/// One self-describing `(id, type, value)` unit of a field list.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldEntry {
    /// Field identifier.
    pub field_id: i16,
    /// Acronym from the dictionary.
    pub name: Option<String>,
    /// Type declared on the wire.
    pub data_type: DataType,
    /// Decoded value.
    pub value: FieldValue,
}

impl FieldEntry {
    /// Tag of the decoded value (`Blank` and `Error` override the declared type).
    #[must_use]
    pub const fn type_tag(&self) -> TypeTag {
        self.value.type_tag()
    }

    /// Render the entry as a single console line.
    #[must_use]
    pub fn display(&self) -> String {
        format!(
            "Fid {} Name = {} DataType: {} Value: {}",
            self.field_id,
            self.name.as_deref().unwrap_or("<unknown>"),
            self.data_type.as_str(),
            self.value
        )
    }
}
