//! Command APDU model and codec.
//!
//! # Layouts
//!
//! ```text
//! Case 1   CLA INS P1 P2
//! Case 2S  CLA INS P1 P2 Le
//! Case 3S  CLA INS P1 P2 Lc Data
//! Case 4S  CLA INS P1 P2 Lc Data Le
//! Case 2E  CLA INS P1 P2 00 Le1 Le2
//! Case 3E  CLA INS P1 P2 00 Lc1 Lc2 Data
//! Case 4E  CLA INS P1 P2 00 Lc1 Lc2 Data Le1 Le2
//! ```
//!
//! The extended form is chosen iff the data field is longer than 255 bytes or
//! Le is above 256. A one-byte Le of `00` means 256, a two-byte Le of `0000`
//! means 65536. Lc is always derived from the data length.
//!
//! # Examples
//!
//! ```
//! use cardlink_apdu::CommandApdu;
//!
//! let select = CommandApdu::builder(0x00, 0xA4, 0x04, 0x00)
//!     .data(vec![0xA0, 0x00, 0x00, 0x00, 0x03])
//!     .le(0)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(select.le(), Some(256));
//! assert_eq!(
//!     select.encode(),
//!     vec![0x00, 0xA4, 0x04, 0x00, 0x05, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x00]
//! );
//! assert_eq!(CommandApdu::decode(&select.encode()).unwrap(), select);
//! ```

use bytes::BufMut;
use std::fmt;

use cardlink_core::constants::{
    APDU_HEADER_LEN, MAX_EXTENDED_LC, MAX_EXTENDED_LE, MAX_SHORT_LC, MAX_SHORT_LE,
};

use crate::error::{ApduError, Result};

/// Structural case of a command, per ISO 7816-3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApduCase {
    /// No data, no Le.
    Case1,
    /// Le only.
    Case2,
    /// Data only.
    Case3,
    /// Data and Le.
    Case4,
}

/// A command APDU.
///
/// Values are only obtainable through [`CommandApdu::new`], the
/// [`builder`](CommandApdu::builder) or [`decode`](CommandApdu::decode), all of
/// which enforce the length limits, so every value can be encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandApdu {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Vec<u8>,
    le: Option<u32>,
}

impl CommandApdu {
    /// Create a bodyless (case 1) command.
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    /// Create a bodyless command from wider integers, range-checking each byte.
    ///
    /// # Errors
    ///
    /// Returns [`ApduError::HeaderOutOfRange`] if any value is outside 0..=255.
    ///
    /// ```
    /// use cardlink_apdu::CommandApdu;
    ///
    /// assert!(CommandApdu::try_new(0x00, 0xA4, 0x04, 0x00).is_ok());
    /// assert!(CommandApdu::try_new(0x100, 0xA4, 0x04, 0x00).is_err());
    /// assert!(CommandApdu::try_new(0x00, -1, 0x04, 0x00).is_err());
    /// ```
    pub fn try_new(cla: i64, ins: i64, p1: i64, p2: i64) -> Result<Self> {
        Ok(Self::new(
            header_byte("CLA", cla)?,
            header_byte("INS", ins)?,
            header_byte("P1", p1)?,
            header_byte("P2", p2)?,
        ))
    }

    /// Start building a command with the given header.
    pub fn builder(cla: u8, ins: u8, p1: u8, p2: u8) -> CommandBuilder {
        CommandBuilder {
            header: Self::new(cla, ins, p1, p2),
            data: Vec::new(),
            le: None,
        }
    }

    /// SELECT by DF name (AID), asking for the FCI.
    pub fn select_by_name(aid: impl Into<Vec<u8>>) -> Result<Self> {
        Self::builder(0x00, 0xA4, 0x04, 0x00).data(aid).le(0).build()
    }

    /// GET RESPONSE for `len` pending bytes (0 means 256).
    pub fn get_response(cla: u8, len: u8) -> Self {
        let le = if len == 0 { MAX_SHORT_LE } else { u32::from(len) };
        Self {
            le: Some(le),
            ..Self::new(cla, 0xC0, 0x00, 0x00)
        }
    }

    pub fn cla(&self) -> u8 {
        self.cla
    }

    pub fn ins(&self) -> u8 {
        self.ins
    }

    pub fn p1(&self) -> u8 {
        self.p1
    }

    pub fn p2(&self) -> u8 {
        self.p2
    }

    /// Command data; empty when the command has no body.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Expected response length, if any.
    pub fn le(&self) -> Option<u32> {
        self.le
    }

    /// Copy of this command with a different Le, used to retry after `6Cxx`.
    pub fn with_le(&self, le: u32) -> Result<Self> {
        CommandBuilder {
            header: Self::new(self.cla, self.ins, self.p1, self.p2),
            data: self.data.clone(),
            le: Some(le),
        }
        .build()
    }

    /// Structural case of this command.
    pub fn case(&self) -> ApduCase {
        match (self.data.is_empty(), self.le.is_some()) {
            (true, false) => ApduCase::Case1,
            (true, true) => ApduCase::Case2,
            (false, false) => ApduCase::Case3,
            (false, true) => ApduCase::Case4,
        }
    }

    /// Whether encoding uses the extended-length layout.
    pub fn is_extended(&self) -> bool {
        self.data.len() > MAX_SHORT_LC || self.le.is_some_and(|le| le > MAX_SHORT_LE)
    }

    /// Number of bytes [`encode`](Self::encode) produces.
    pub fn encoded_len(&self) -> usize {
        let extended = self.is_extended();
        let mut len = APDU_HEADER_LEN;
        if extended && (!self.data.is_empty() || self.le.is_some()) {
            len += 1;
        }
        if !self.data.is_empty() {
            len += if extended { 2 } else { 1 } + self.data.len();
        }
        if self.le.is_some() {
            len += if extended { 2 } else { 1 };
        }
        len
    }

    /// Encode into a freshly allocated buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Encode by appending to `buf`.
    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&[self.cla, self.ins, self.p1, self.p2]);

        if self.is_extended() {
            buf.put_u8(0x00);
            if !self.data.is_empty() {
                buf.put_u16(self.data.len() as u16);
                buf.put_slice(&self.data);
            }
            if let Some(le) = self.le {
                // 65536 wraps to 0x0000
                buf.put_u16(le as u16);
            }
        } else {
            if !self.data.is_empty() {
                buf.put_u8(self.data.len() as u8);
                buf.put_slice(&self.data);
            }
            if let Some(le) = self.le {
                // 256 wraps to 0x00
                buf.put_u8(le as u8);
            }
        }
    }

    /// Decode a command from its wire form.
    ///
    /// # Errors
    ///
    /// Fails on inputs shorter than the header and on any body whose length
    /// disagrees with its Lc/Le fields. Bytes are never silently dropped.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < APDU_HEADER_LEN {
            return Err(ApduError::TooShort {
                expected: APDU_HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let header = Self::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let body = &bytes[APDU_HEADER_LEN..];

        match body {
            [] => Ok(header),
            [le] => Ok(Self {
                le: Some(short_le(*le)),
                ..header
            }),
            [0x00, rest @ ..] => decode_extended(header, rest),
            [lc, rest @ ..] => decode_short(header, usize::from(*lc), rest),
        }
    }
}

fn header_byte(field: &'static str, value: i64) -> Result<u8> {
    u8::try_from(value).map_err(|_| ApduError::HeaderOutOfRange { field, value })
}

fn short_le(byte: u8) -> u32 {
    if byte == 0 { MAX_SHORT_LE } else { u32::from(byte) }
}

fn extended_le(hi: u8, lo: u8) -> u32 {
    match u16::from_be_bytes([hi, lo]) {
        0 => MAX_EXTENDED_LE,
        le => u32::from(le),
    }
}

/// `rest` is everything after the Lc byte.
fn decode_short(header: CommandApdu, lc: usize, rest: &[u8]) -> Result<CommandApdu> {
    if rest.len() == lc {
        Ok(CommandApdu {
            data: rest.to_vec(),
            ..header
        })
    } else if rest.len() == lc + 1 {
        Ok(CommandApdu {
            data: rest[..lc].to_vec(),
            le: Some(short_le(rest[lc])),
            ..header
        })
    } else {
        Err(ApduError::LengthMismatch {
            lc,
            body: rest.len(),
        })
    }
}

/// `rest` is everything after the leading `00` marker.
fn decode_extended(header: CommandApdu, rest: &[u8]) -> Result<CommandApdu> {
    match rest {
        [hi, lo] => Ok(CommandApdu {
            le: Some(extended_le(*hi, *lo)),
            ..header
        }),
        [hi, lo, body @ ..] => {
            let lc = usize::from(u16::from_be_bytes([*hi, *lo]));
            if lc == 0 {
                return Err(ApduError::InvalidExtended("Lc of zero followed by a body"));
            }
            if body.len() == lc {
                Ok(CommandApdu {
                    data: body.to_vec(),
                    ..header
                })
            } else if body.len() == lc + 2 {
                Ok(CommandApdu {
                    data: body[..lc].to_vec(),
                    le: Some(extended_le(body[lc], body[lc + 1])),
                    ..header
                })
            } else {
                Err(ApduError::LengthMismatch {
                    lc,
                    body: body.len(),
                })
            }
        }
        _ => Err(ApduError::InvalidExtended("truncated length field")),
    }
}

impl TryFrom<&[u8]> for CommandApdu {
    type Error = ApduError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        Self::decode(bytes)
    }
}

impl From<&CommandApdu> for Vec<u8> {
    fn from(command: &CommandApdu) -> Self {
        command.encode()
    }
}

impl fmt::Display for CommandApdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.encode()))
    }
}

/// Builder for [`CommandApdu`].
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    header: CommandApdu,
    data: Vec<u8>,
    le: Option<u32>,
}

impl CommandBuilder {
    /// Set the data field. An empty vector means "no data".
    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Set the expected response length.
    ///
    /// `0` asks for the maximum and is normalised to 256, or to 65536 when the
    /// data field forces the extended form.
    pub fn le(mut self, le: u32) -> Self {
        self.le = Some(le);
        self
    }

    /// Validate lengths and produce the command.
    pub fn build(self) -> Result<CommandApdu> {
        if self.data.len() > MAX_EXTENDED_LC {
            return Err(ApduError::DataTooLong(self.data.len()));
        }

        let le = match self.le {
            Some(le) if le > MAX_EXTENDED_LE => return Err(ApduError::LeOutOfRange(le)),
            Some(0) if self.data.len() > MAX_SHORT_LC => Some(MAX_EXTENDED_LE),
            Some(0) => Some(MAX_SHORT_LE),
            other => other,
        };

        Ok(CommandApdu {
            data: self.data,
            le,
            ..self.header
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case1_encoding() {
        let cmd = CommandApdu::new(0x00, 0xB0, 0x00, 0x00);
        assert_eq!(cmd.case(), ApduCase::Case1);
        assert_eq!(cmd.encode(), vec![0x00, 0xB0, 0x00, 0x00]);
    }

    #[test]
    fn test_case2_short_le_256_is_zero_byte() {
        let cmd = CommandApdu::builder(0x00, 0xB0, 0x00, 0x00)
            .le(256)
            .build()
            .unwrap();
        assert!(!cmd.is_extended());
        assert_eq!(cmd.encode(), vec![0x00, 0xB0, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_case2_extended() {
        let cmd = CommandApdu::builder(0x00, 0xB0, 0x00, 0x00)
            .le(257)
            .build()
            .unwrap();
        assert!(cmd.is_extended());
        assert_eq!(cmd.encode(), vec![0x00, 0xB0, 0x00, 0x00, 0x00, 0x01, 0x01]);
        assert_eq!(cmd.encoded_len(), 7);
    }

    #[test]
    fn test_case2_extended_le_65536_is_zero_word() {
        let cmd = CommandApdu::builder(0x00, 0xB0, 0x00, 0x00)
            .le(65_536)
            .build()
            .unwrap();
        assert_eq!(cmd.encode(), vec![0x00, 0xB0, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(CommandApdu::decode(&cmd.encode()).unwrap().le(), Some(65_536));
    }

    #[test]
    fn test_case3_short() {
        let cmd = CommandApdu::builder(0x00, 0xD6, 0x00, 0x00)
            .data(vec![0x01, 0x02])
            .build()
            .unwrap();
        assert_eq!(cmd.case(), ApduCase::Case3);
        assert_eq!(cmd.encode(), vec![0x00, 0xD6, 0x00, 0x00, 0x02, 0x01, 0x02]);
    }

    #[test]
    fn test_case4_extended_layout() {
        let data = vec![0xAB; 300];
        let cmd = CommandApdu::builder(0x80, 0x2A, 0x9E, 0x9A)
            .data(data.clone())
            .le(0)
            .build()
            .unwrap();
        assert_eq!(cmd.le(), Some(65_536));

        let bytes = cmd.encode();
        assert_eq!(&bytes[..7], &[0x80, 0x2A, 0x9E, 0x9A, 0x00, 0x01, 0x2C]);
        assert_eq!(&bytes[7..307], data.as_slice());
        assert_eq!(&bytes[307..], &[0x00, 0x00]);
        assert_eq!(bytes.len(), cmd.encoded_len());
    }

    #[test]
    fn test_le_zero_normalises_to_short_maximum() {
        let cmd = CommandApdu::builder(0x00, 0xCA, 0x00, 0x6E)
            .le(0)
            .build()
            .unwrap();
        assert_eq!(cmd.le(), Some(256));
    }

    #[test]
    fn test_build_rejects_oversized_values() {
        let err = CommandApdu::builder(0, 0, 0, 0)
            .data(vec![0; 65_536])
            .build()
            .unwrap_err();
        assert_eq!(err, ApduError::DataTooLong(65_536));

        let err = CommandApdu::builder(0, 0, 0, 0).le(65_537).build().unwrap_err();
        assert_eq!(err, ApduError::LeOutOfRange(65_537));
    }

    #[test]
    fn test_try_new_range_checks_every_field() {
        assert!(matches!(
            CommandApdu::try_new(0, 0, 0, 256),
            Err(ApduError::HeaderOutOfRange { field: "P2", value: 256 })
        ));
        assert!(matches!(
            CommandApdu::try_new(0, 0, -3, 0),
            Err(ApduError::HeaderOutOfRange { field: "P1", value: -3 })
        ));
        let cmd = CommandApdu::try_new(0xFF, 0xFF, 0xFF, 0xFF).unwrap();
        assert_eq!(cmd.cla(), 0xFF);
    }

    #[test]
    fn test_decode_rejects_short_input() {
        assert_eq!(
            CommandApdu::decode(&[0x00, 0xA4, 0x04]),
            Err(ApduError::TooShort {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn test_decode_five_bytes_is_le() {
        let cmd = CommandApdu::decode(&[0x00, 0xCA, 0x00, 0x6E, 0x00]).unwrap();
        assert_eq!(cmd.case(), ApduCase::Case2);
        assert_eq!(cmd.le(), Some(256));
    }

    #[test]
    fn test_decode_rejects_truncated_short_body() {
        // Lc says 5, only 3 bytes follow
        let err = CommandApdu::decode(&[0x00, 0xA4, 0x04, 0x00, 0x05, 0xA0, 0x00, 0x00]);
        assert_eq!(err, Err(ApduError::LengthMismatch { lc: 5, body: 3 }));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let err = CommandApdu::decode(&[0x00, 0xA4, 0x04, 0x00, 0x01, 0xA0, 0x00, 0x00]);
        assert_eq!(err, Err(ApduError::LengthMismatch { lc: 1, body: 3 }));
    }

    #[test]
    fn test_decode_rejects_truncated_extended_header() {
        let err = CommandApdu::decode(&[0x00, 0xA4, 0x04, 0x00, 0x00, 0x01]);
        assert_eq!(err, Err(ApduError::InvalidExtended("truncated length field")));
    }

    #[test]
    fn test_decode_rejects_extended_zero_lc_with_body() {
        let err = CommandApdu::decode(&[0x00, 0xA4, 0x04, 0x00, 0x00, 0x00, 0x00, 0x01]);
        assert!(matches!(err, Err(ApduError::InvalidExtended(_))));
    }

    #[test]
    fn test_get_response() {
        let cmd = CommandApdu::get_response(0x00, 0x10);
        assert_eq!(cmd.encode(), vec![0x00, 0xC0, 0x00, 0x00, 0x10]);
        assert_eq!(CommandApdu::get_response(0x00, 0x00).le(), Some(256));
    }

    #[test]
    fn test_with_le_keeps_body() {
        let cmd = CommandApdu::builder(0x00, 0xB0, 0x00, 0x00)
            .data(vec![0x01])
            .le(0x20)
            .build()
            .unwrap();
        let retried = cmd.with_le(0x08).unwrap();
        assert_eq!(retried.data(), &[0x01]);
        assert_eq!(retried.le(), Some(0x08));
    }

    #[test]
    fn test_display_is_upper_hex() {
        let cmd = CommandApdu::get_response(0x00, 0x0A);
        assert_eq!(cmd.to_string(), "00C000000A");
    }
}
