use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of an acquired device.
///
/// Handles are allocated monotonically and never reused within a process, so
/// a stale handle can always be told apart from a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    /// Wrap a raw handle value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw handle value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// Opaque identifier of a card session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CardHandle(u64);

impl CardHandle {
    /// Wrap a raw handle value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw handle value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CardHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "card#{}", self.0)
    }
}

/// Card-facing protocol of a device (device to card).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum D2cProtocol {
    /// Contact interface, ISO 7816-3 (T=0 / T=1).
    Iso7816,
    /// Proximity interface, ISO 14443 A/B.
    Iso14443,
    /// FeliCa (JIS X 6319-4).
    Felica,
    Unknown,
}

/// Host-facing protocol of a device (platform to device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum P2dProtocol {
    Usb,
    Ble,
    Nfc,
    /// Built into the host, e.g. a phone's NFC controller.
    Internal,
    Unknown,
}

/// Description of an available reader or antenna.
///
/// Returned by enumeration and immutable afterwards. The `id` is unique and
/// stable within a single platform init/release cycle only; it must not be
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Identifier used with `acquire_device`.
    pub id: String,

    /// Device can exchange APDUs with a card.
    pub supports_apdu: bool,

    /// Device can emulate a card towards an external reader.
    pub supports_hce: bool,

    /// Device is built into the host.
    pub is_integrated_device: bool,

    /// Device can be unplugged at runtime.
    pub is_removable_device: bool,

    /// Card-facing transport.
    pub d2c_protocol: D2cProtocol,

    /// Host-facing transport.
    pub p2d_protocol: P2dProtocol,

    /// Optional human-friendly name.
    pub friendly_name: Option<String>,

    /// Optional free-form description.
    pub description: Option<String>,
}

impl DeviceInfo {
    /// Create a description for an APDU-capable device with unknown protocols.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            supports_apdu: true,
            supports_hce: false,
            is_integrated_device: false,
            is_removable_device: false,
            d2c_protocol: D2cProtocol::Unknown,
            p2d_protocol: P2dProtocol::Unknown,
            friendly_name: None,
            description: None,
        }
    }

    /// A removable USB contact reader as exposed by a PC/SC service.
    pub fn contact_reader(id: impl Into<String>) -> Self {
        Self::new(id)
            .with_removable(true)
            .with_protocols(D2cProtocol::Iso7816, P2dProtocol::Usb)
    }

    /// A host-integrated NFC controller.
    pub fn integrated_nfc(id: impl Into<String>) -> Self {
        Self::new(id)
            .with_integrated(true)
            .with_protocols(D2cProtocol::Iso14443, P2dProtocol::Internal)
    }

    /// Set both protocol tags.
    pub fn with_protocols(mut self, d2c: D2cProtocol, p2d: P2dProtocol) -> Self {
        self.d2c_protocol = d2c;
        self.p2d_protocol = p2d;
        self
    }

    pub fn with_integrated(mut self, integrated: bool) -> Self {
        self.is_integrated_device = integrated;
        self
    }

    pub fn with_removable(mut self, removable: bool) -> Self {
        self.is_removable_device = removable;
        self
    }

    pub fn with_apdu_support(mut self, supported: bool) -> Self {
        self.supports_apdu = supported;
        self
    }

    pub fn with_hce_support(mut self, supported: bool) -> Self {
        self.supports_hce = supported;
        self
    }

    /// Set the display name.
    pub fn with_friendly_name(mut self, name: impl Into<String>) -> Self {
        self.friendly_name = Some(name.into());
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Name for display: the friendly name if set, the id otherwise.
    pub fn display_name(&self) -> &str {
        self.friendly_name.as_deref().unwrap_or(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contact_reader_defaults() {
        let info = DeviceInfo::contact_reader("ACS ACR39U 00 00");
        assert!(info.supports_apdu);
        assert!(!info.supports_hce);
        assert!(info.is_removable_device);
        assert!(!info.is_integrated_device);
        assert_eq!(info.d2c_protocol, D2cProtocol::Iso7816);
        assert_eq!(info.p2d_protocol, P2dProtocol::Usb);
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        let info = DeviceInfo::integrated_nfc("nfc0");
        assert_eq!(info.display_name(), "nfc0");

        let info = info.with_friendly_name("Internal NFC");
        assert_eq!(info.display_name(), "Internal NFC");
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(DeviceHandle::from_raw(3).to_string(), "dev#3");
        assert_eq!(CardHandle::from_raw(7).to_string(), "card#7");
    }

    #[test]
    fn test_device_info_serialization() {
        let info = DeviceInfo::contact_reader("r1").with_description("desk reader");
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"d2c_protocol\":\"iso7816\""));
        let back: DeviceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
