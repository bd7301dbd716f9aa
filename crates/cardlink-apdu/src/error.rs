use thiserror::Error;

/// Errors raised while building, encoding or decoding APDUs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApduError {
    /// A header byte was supplied outside 0..=255.
    #[error("{field} must be 0-255, got {value}")]
    HeaderOutOfRange { field: &'static str, value: i64 },

    /// Command data longer than the extended Lc field can express.
    #[error("Command data too long: {0} bytes (max 65535)")]
    DataTooLong(usize),

    /// Expected length outside 0..=65536.
    #[error("Le out of range: {0} (max 65536)")]
    LeOutOfRange(u32),

    /// Fewer bytes than the smallest valid structure.
    #[error("APDU too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// Body length disagrees with the Lc/Le fields.
    #[error("APDU body of {body} bytes does not match Lc={lc}")]
    LengthMismatch { lc: usize, body: usize },

    /// Extended form announced but the length fields are malformed.
    #[error("Invalid extended APDU: {0}")]
    InvalidExtended(&'static str),
}

pub type Result<T> = std::result::Result<T, ApduError>;

impl ApduError {
    /// Whether the error comes from decoding bytes rather than from building a value.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::TooShort { .. } | Self::LengthMismatch { .. } | Self::InvalidExtended(_)
        )
    }
}

impl From<ApduError> for cardlink_core::Error {
    fn from(error: ApduError) -> Self {
        if error.is_decode_error() {
            cardlink_core::Error::protocol(error.to_string())
        } else {
            cardlink_core::Error::invalid_parameter(error.to_string())
        }
    }
}
