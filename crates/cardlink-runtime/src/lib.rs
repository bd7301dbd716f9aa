//! SmartCard communication runtime.
//!
//! This crate implements the layered card contract on top of a pluggable
//! reader transport:
//!
//! - [`Platform`]: init/release, reader enumeration and acquisition.
//! - [`Device`]: an acquired reader in reader mode. Tracks card presence,
//!   waits for a card and opens sessions.
//! - [`CardSession`]: one open link to a card. Exchanges APDUs.
//!
//! A [`SystemEventCoordinator`] turns host lifecycle signals (screen off,
//! suspend) into a forced release of every device, cancelling outstanding
//! waits first.
//!
//! # Example
//!
//! ```no_run
//! use cardlink_apdu::CommandApdu;
//! use cardlink_runtime::prelude::*;
//! use cardlink_runtime::{MockCard, MockTransport};
//!
//! #[tokio::main]
//! async fn main() -> cardlink_core::Result<()> {
//!     let (transport, control) = MockTransport::with_reader("reader-0");
//!     control.insert_card("reader-0", MockCard::new().with_historical_bytes(vec![0x80, 0x73]));
//!
//!     let platform = Platform::with_defaults(transport)?;
//!     platform.init().await?;
//!
//!     let device = platform.acquire_device("reader-0").await?;
//!     device.wait_for_card_presence(1_000).await?;
//!     let card = device.start_session().await?;
//!
//!     let response = card.transmit(&CommandApdu::select_by_name(vec![0xA0, 0x00, 0x00])?).await?;
//!     assert!(response.status_word().is_success());
//!
//!     platform.release().await
//! }
//! ```
//!
//! # Transports
//!
//! The in-process [`MockTransport`] is always available and is what the
//! tests run against. Real readers go through the platform PC/SC service
//! with the `hardware-pcsc` feature.
//!
//! # Events
//!
//! Lifecycle notifications are broadcast as
//! [`EventPayload`](cardlink_core::EventPayload)s; see
//! [`Platform::subscribe_events`]. Delivery is at most once: a subscriber
//! that falls behind loses the oldest events.

pub mod config;
pub mod coordinator;
pub mod device;
pub mod events;
pub mod mock;
pub mod platform;
pub mod registry;
pub mod session;
pub mod state;
pub mod traits;
pub mod transport;

use std::sync::{Mutex, MutexGuard};

pub use config::PlatformConfig;
pub use coordinator::{ReleaseReport, SystemEvent, SystemEventCoordinator, SystemEventSender};
pub use device::Device;
pub use events::{EventBus, EventStream};
pub use mock::{MockCard, MockOperation, MockTransport, MockTransportHandle};
pub use platform::Platform;
pub use session::CardSession;
pub use state::{DeviceState, StateTransition};
pub use transport::{AnyTransport, FailureCode, Transport, TransportFailure};

/// Everything needed to drive the runtime through its traits.
pub mod prelude {
    pub use crate::traits::{
        CardChannel, CardDevice, DeviceCatalog, PlatformLifecycle, wait_and_connect,
    };
    pub use crate::{CardSession, Device, Platform, PlatformConfig};
}

/// Lock a std mutex, recovering the data if a holder panicked.
///
/// Every critical section in this crate leaves the data consistent before
/// anything that can panic, so the data is still valid after poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
