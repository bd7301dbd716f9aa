use std::fmt;

use cardlink_core::constants::STATUS_WORD_LEN;

use crate::error::{ApduError, Result};
use crate::status::StatusWord;

/// A response APDU: optional data followed by the two status bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResponseApdu {
    data: Vec<u8>,
    sw: StatusWord,
}

impl ResponseApdu {
    /// Create a response from data and a combined status word.
    pub fn new(data: impl Into<Vec<u8>>, sw: impl Into<StatusWord>) -> Self {
        Self {
            data: data.into(),
            sw: sw.into(),
        }
    }

    /// A `9000` response carrying `data`.
    pub fn success(data: impl Into<Vec<u8>>) -> Self {
        Self::new(data, StatusWord::SUCCESS)
    }

    /// A data-less response with the given status word.
    pub fn status(sw: impl Into<StatusWord>) -> Self {
        Self::new(Vec::new(), sw)
    }

    /// Split raw bytes into data and status word.
    ///
    /// # Errors
    ///
    /// Fails only when fewer than two bytes are supplied.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STATUS_WORD_LEN {
            return Err(ApduError::TooShort {
                expected: STATUS_WORD_LEN,
                actual: bytes.len(),
            });
        }

        let (data, trailer) = bytes.split_at(bytes.len() - STATUS_WORD_LEN);
        Ok(Self {
            data: data.to_vec(),
            sw: StatusWord::from_bytes(trailer[0], trailer[1]),
        })
    }

    /// Data followed by SW1 SW2.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + STATUS_WORD_LEN);
        bytes.extend_from_slice(&self.data);
        bytes.push(self.sw.sw1());
        bytes.push(self.sw.sw2());
        bytes
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn sw1(&self) -> u8 {
        self.sw.sw1()
    }

    pub fn sw2(&self) -> u8 {
        self.sw.sw2()
    }

    /// Combined status word as `u16`, e.g. `0x9000`.
    pub fn sw(&self) -> u16 {
        self.sw.as_u16()
    }

    pub fn status_word(&self) -> StatusWord {
        self.sw
    }

    pub fn is_success(&self) -> bool {
        self.sw.is_success()
    }
}

impl TryFrom<&[u8]> for ResponseApdu {
    type Error = ApduError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        Self::decode(bytes)
    }
}

impl fmt::Display for ResponseApdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", hex::encode_upper(&self.data), self.sw)
    }
}
