//! ISO 7816-4 status words.

use std::fmt;

/// The SW1 SW2 trailer of a response, as one 16-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusWord(u16);

impl StatusWord {
    pub const SUCCESS: Self = Self(0x9000);
    pub const WARNING_NO_CHANGE: Self = Self(0x6200);
    pub const WARNING_EOF: Self = Self(0x6282);
    pub const EXEC_ERROR: Self = Self(0x6400);
    pub const WRONG_LENGTH: Self = Self(0x6700);
    pub const LOGICAL_CHANNEL_NOT_SUPPORTED: Self = Self(0x6881);
    pub const COMMAND_NOT_ALLOWED: Self = Self(0x6900);
    pub const SECURITY_STATUS_NOT_SATISFIED: Self = Self(0x6982);
    pub const AUTH_METHOD_BLOCKED: Self = Self(0x6983);
    pub const CONDITIONS_NOT_SATISFIED: Self = Self(0x6985);
    pub const WRONG_DATA: Self = Self(0x6A80);
    pub const FUNCTION_NOT_SUPPORTED: Self = Self(0x6A81);
    pub const FILE_NOT_FOUND: Self = Self(0x6A82);
    pub const RECORD_NOT_FOUND: Self = Self(0x6A83);
    pub const INCORRECT_P1_P2: Self = Self(0x6A86);
    pub const REFERENCED_DATA_NOT_FOUND: Self = Self(0x6A88);
    pub const WRONG_P1_P2: Self = Self(0x6B00);
    pub const INS_NOT_SUPPORTED: Self = Self(0x6D00);
    pub const CLA_NOT_SUPPORTED: Self = Self(0x6E00);
    pub const UNKNOWN_ERROR: Self = Self(0x6F00);

    pub const fn new(sw: u16) -> Self {
        Self(sw)
    }

    pub const fn from_bytes(sw1: u8, sw2: u8) -> Self {
        Self(((sw1 as u16) << 8) | sw2 as u16)
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    pub const fn sw1(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn sw2(&self) -> u8 {
        self.0 as u8
    }

    /// `9000`.
    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }

    /// `62xx` or `63xx`: processed with a warning.
    pub fn is_warning(&self) -> bool {
        matches!(self.sw1(), 0x62 | 0x63)
    }

    /// For `61xx`, the number of bytes still available (`6100` means 256).
    pub fn bytes_remaining(&self) -> Option<u32> {
        (self.sw1() == 0x61).then(|| match self.sw2() {
            0 => 256,
            n => u32::from(n),
        })
    }

    /// For `6Cxx`, the Le the card asks for (`6C00` means 256).
    pub fn correct_le(&self) -> Option<u32> {
        (self.sw1() == 0x6C).then(|| match self.sw2() {
            0 => 256,
            n => u32::from(n),
        })
    }

    /// For `63Cx`, the remaining verification retries.
    pub fn retries_remaining(&self) -> Option<u8> {
        (self.0 & 0xFFF0 == 0x63C0).then_some(self.sw2() & 0x0F)
    }

    /// Short description of well-known status words.
    pub fn description(&self) -> &'static str {
        match *self {
            Self::SUCCESS => "success",
            Self::WARNING_NO_CHANGE => "no information given, state unchanged",
            Self::WARNING_EOF => "end of file reached before reading Le bytes",
            Self::EXEC_ERROR => "execution error, state unchanged",
            Self::WRONG_LENGTH => "wrong length",
            Self::LOGICAL_CHANNEL_NOT_SUPPORTED => "logical channel not supported",
            Self::COMMAND_NOT_ALLOWED => "command not allowed",
            Self::SECURITY_STATUS_NOT_SATISFIED => "security status not satisfied",
            Self::AUTH_METHOD_BLOCKED => "authentication method blocked",
            Self::CONDITIONS_NOT_SATISFIED => "conditions of use not satisfied",
            Self::WRONG_DATA => "incorrect data field",
            Self::FUNCTION_NOT_SUPPORTED => "function not supported",
            Self::FILE_NOT_FOUND => "file or application not found",
            Self::RECORD_NOT_FOUND => "record not found",
            Self::INCORRECT_P1_P2 => "incorrect P1-P2",
            Self::REFERENCED_DATA_NOT_FOUND => "referenced data not found",
            Self::WRONG_P1_P2 => "wrong parameters P1-P2",
            Self::INS_NOT_SUPPORTED => "instruction not supported",
            Self::CLA_NOT_SUPPORTED => "class not supported",
            Self::UNKNOWN_ERROR => "no precise diagnosis",
            _ if self.bytes_remaining().is_some() => "more response bytes available",
            _ if self.correct_le().is_some() => "wrong Le, exact length indicated",
            _ if self.retries_remaining().is_some() => "verification failed, retries left",
            _ => "unknown status",
        }
    }
}

impl From<u16> for StatusWord {
    fn from(sw: u16) -> Self {
        Self(sw)
    }
}

impl From<StatusWord> for u16 {
    fn from(sw: StatusWord) -> Self {
        sw.0
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_from_bytes() {
        let sw = StatusWord::from_bytes(0x6A, 0x82);
        assert_eq!(sw, StatusWord::FILE_NOT_FOUND);
        assert_eq!(sw.sw1(), 0x6A);
        assert_eq!(sw.sw2(), 0x82);
        assert_eq!(sw.to_string(), "6A82");
    }

    #[rstest]
    #[case(0x6110, Some(16))]
    #[case(0x6100, Some(256))]
    #[case(0x9000, None)]
    fn test_bytes_remaining(#[case] sw: u16, #[case] expected: Option<u32>) {
        assert_eq!(StatusWord::new(sw).bytes_remaining(), expected);
    }

    #[rstest]
    #[case(0x6C08, Some(8))]
    #[case(0x6C00, Some(256))]
    #[case(0x6700, None)]
    fn test_correct_le(#[case] sw: u16, #[case] expected: Option<u32>) {
        assert_eq!(StatusWord::new(sw).correct_le(), expected);
    }

    #[test]
    fn test_retries_and_description() {
        let sw = StatusWord::new(0x63C2);
        assert_eq!(sw.retries_remaining(), Some(2));
        assert!(sw.is_warning());
        assert_eq!(sw.description(), "verification failed, retries left");
        assert_eq!(StatusWord::SUCCESS.description(), "success");
        assert_eq!(StatusWord::new(0x6F12).description(), "unknown status");
    }
}
