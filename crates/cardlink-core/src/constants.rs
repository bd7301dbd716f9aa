//! Protocol and runtime constants.
//!
//! Length limits follow ISO 7816-4: a standard-length command carries at
//! most 255 data bytes and asks for at most 256 response bytes; the
//! extended form raises both limits to 65535 and 65536.

/// Length of the CLA INS P1 P2 command header.
pub const APDU_HEADER_LEN: usize = 4;

/// Length of the SW1 SW2 trailer of every response.
pub const STATUS_WORD_LEN: usize = 2;

/// Largest data field of a standard-length command.
pub const MAX_SHORT_LC: usize = 255;

/// Largest expected response length of a standard-length command.
pub const MAX_SHORT_LE: u32 = 256;

/// Largest data field of an extended-length command.
pub const MAX_EXTENDED_LC: usize = 65_535;

/// Largest expected response length of an extended-length command.
pub const MAX_EXTENDED_LE: u32 = 65_536;

/// Largest response (data plus status word) the runtime accepts from a link.
pub const MAX_RESPONSE_LEN: usize = MAX_EXTENDED_LE as usize + STATUS_WORD_LEN;

/// Default capacity of the application event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default capacity of the per-device presence channel.
pub const DEFAULT_PRESENCE_CAPACITY: usize = 32;

/// Default bound on GET RESPONSE / Le-correction rounds for one chained exchange.
pub const DEFAULT_MAX_CHAINED_RESPONSES: usize = 64;

/// Default PC/SC status-change poll interval in milliseconds.
pub const DEFAULT_PCSC_POLL_INTERVAL_MS: u64 = 250;

/// Default time a forced release may take per device, in milliseconds.
pub const DEFAULT_RELEASE_TIMEOUT_MS: u64 = 5_000;
