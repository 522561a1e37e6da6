use thiserror::Error;

/// Errors produced while parsing values handed up by the native layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    /// Address string or byte slice has the wrong length
    #[error("Invalid device address length: {0}")]
    Length(usize),

    /// Address is not six separator-delimited octets
    #[error("Malformed device address: {0}")]
    Format(String),

    /// An octet contains a non-hex character
    #[error("Invalid hex octet in device address: {0}")]
    InvalidDigit(String),
}

/// A raw integer from the native layer did not map to a known enum value
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Unknown {kind} value from native layer: {value}")]
pub struct UnknownValue {
    /// Which enum was being decoded
    pub kind: &'static str,
    /// The offending raw value
    pub value: i32,
}
