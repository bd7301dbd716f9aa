//! Capability traits.
//!
//! The layered contract (platform, device, card channel) as traits, so code
//! can be written against the capabilities it needs rather than the concrete
//! runtime types. [`Platform`], [`Device`] and [`CardSession`] implement them
//! by delegating to their inherent methods.
//!
//! ```no_run
//! use cardlink_runtime::traits::{CardChannel, CardDevice, wait_and_connect};
//!
//! async fn read_select<D: CardDevice>(device: &D) -> cardlink_core::Result<u16> {
//!     let card = wait_and_connect(device, 10_000).await?;
//!     let response = card.select(&[0xA0, 0x00, 0x00, 0x00, 0x03]).await?;
//!     card.release().await?;
//!     Ok(response.sw())
//! }
//! ```

#![allow(async_fn_in_trait)]

use cardlink_apdu::{CommandApdu, ResponseApdu};
use cardlink_core::{DeviceInfo, Result};

use crate::device::Device;
use crate::platform::Platform;
use crate::session::CardSession;

/// Init/release of the whole runtime.
pub trait PlatformLifecycle {
    async fn init(&self) -> Result<()>;

    async fn release(&self) -> Result<()>;
}

/// Enumerating and acquiring readers.
pub trait DeviceCatalog {
    type Device: CardDevice;

    async fn get_device_info(&self) -> Result<Vec<DeviceInfo>>;

    async fn acquire_device(&self, id: &str) -> Result<Self::Device>;
}

/// An acquired reader.
pub trait CardDevice {
    type Session: CardChannel;

    fn is_device_available(&self) -> bool;

    fn is_card_present(&self) -> Result<bool>;

    async fn wait_for_card_presence(&self, timeout_ms: i64) -> Result<()>;

    async fn start_session(&self) -> Result<Self::Session>;

    async fn release(&self) -> Result<()>;
}

/// An open link to one card.
pub trait CardChannel {
    async fn get_atr(&self) -> Result<Vec<u8>>;

    async fn transmit(&self, command: &CommandApdu) -> Result<ResponseApdu>;

    async fn reset(&self) -> Result<()>;

    async fn release(&self) -> Result<()>;

    /// SELECT the application with this AID.
    async fn select(&self, aid: &[u8]) -> Result<ResponseApdu> {
        let command = CommandApdu::select_by_name(aid)?;
        self.transmit(&command).await
    }
}

/// Wait for a card and open a session to it.
pub async fn wait_and_connect<D: CardDevice>(device: &D, timeout_ms: i64) -> Result<D::Session> {
    device.wait_for_card_presence(timeout_ms).await?;
    device.start_session().await
}

impl PlatformLifecycle for Platform {
    async fn init(&self) -> Result<()> {
        Platform::init(self).await
    }

    async fn release(&self) -> Result<()> {
        Platform::release(self).await
    }
}

impl DeviceCatalog for Platform {
    type Device = Device;

    async fn get_device_info(&self) -> Result<Vec<DeviceInfo>> {
        Platform::get_device_info(self).await
    }

    async fn acquire_device(&self, id: &str) -> Result<Device> {
        Platform::acquire_device(self, id).await
    }
}

impl CardDevice for Device {
    type Session = CardSession;

    fn is_device_available(&self) -> bool {
        Device::is_device_available(self)
    }

    fn is_card_present(&self) -> Result<bool> {
        Device::is_card_present(self)
    }

    async fn wait_for_card_presence(&self, timeout_ms: i64) -> Result<()> {
        Device::wait_for_card_presence(self, timeout_ms).await
    }

    async fn start_session(&self) -> Result<CardSession> {
        Device::start_session(self).await
    }

    async fn release(&self) -> Result<()> {
        Device::release(self).await
    }
}

impl CardChannel for CardSession {
    async fn get_atr(&self) -> Result<Vec<u8>> {
        CardSession::get_atr(self).await
    }

    async fn transmit(&self, command: &CommandApdu) -> Result<ResponseApdu> {
        CardSession::transmit(self, command).await
    }

    async fn reset(&self) -> Result<()> {
        CardSession::reset(self).await
    }

    async fn release(&self) -> Result<()> {
        CardSession::release(self).await
    }
}
