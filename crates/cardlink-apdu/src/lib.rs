//! ISO 7816-4 APDU codec.
//!
//! Pure value-to-bytes and bytes-to-value transforms for command and response
//! APDUs, including the extended-length form. No I/O and no shared state.

pub mod command;
pub mod error;
pub mod response;
pub mod status;

pub use command::{ApduCase, CommandApdu, CommandBuilder};
pub use error::{ApduError, Result};
pub use response::ResponseApdu;
pub use status::StatusWord;
