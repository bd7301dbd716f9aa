//! Simulated readers for tests and development.
//!
//! The mock transport behaves like a reader service with scriptable cards,
//! so the whole runtime can be exercised without hardware.

pub mod transport;

pub use transport::{ExchangeRecord, MockCard, MockOperation, MockTransport, MockTransportHandle};
