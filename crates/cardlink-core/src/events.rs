//! Notification vocabulary.
//!
//! Events are informational only: they carry no ownership and are delivered
//! at most once per physical occurrence. Consumers must not rely on seeing
//! every event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{CardHandle, DeviceHandle};

/// Closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    DeviceAcquired,
    DeviceReleased,
    CardFound,
    CardLost,
    SessionStarted,
    SessionReset,
    TransmitSent,
    TransmitFailed,
    WaitTimeout,
    ReaderModeEnabled,
    ReaderModeDisabled,
    DebugInfo,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DeviceAcquired => "DEVICE_ACQUIRED",
            Self::DeviceReleased => "DEVICE_RELEASED",
            Self::CardFound => "CARD_FOUND",
            Self::CardLost => "CARD_LOST",
            Self::SessionStarted => "SESSION_STARTED",
            Self::SessionReset => "SESSION_RESET",
            Self::TransmitSent => "TRANSMIT_SENT",
            Self::TransmitFailed => "TRANSMIT_FAILED",
            Self::WaitTimeout => "WAIT_TIMEOUT",
            Self::ReaderModeEnabled => "READER_MODE_ENABLED",
            Self::ReaderModeDisabled => "READER_MODE_DISABLED",
            Self::DebugInfo => "DEBUG_INFO",
        };
        f.write_str(name)
    }
}

/// A single notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    /// What happened.
    pub kind: EventKind,

    /// Device the event refers to.
    pub device: DeviceHandle,

    /// Card session the event refers to, if any.
    pub card: Option<CardHandle>,

    /// Free-form details.
    pub details: String,

    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
}

impl EventPayload {
    /// Create a device-level event stamped with the current time.
    pub fn new(kind: EventKind, device: DeviceHandle, details: impl Into<String>) -> Self {
        Self {
            kind,
            device,
            card: None,
            details: details.into(),
            timestamp: Utc::now(),
        }
    }

    /// Attach a card handle.
    pub fn with_card(mut self, card: CardHandle) -> Self {
        self.card = Some(card);
        self
    }
}

impl fmt::Display for EventPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.device)?;
        if let Some(card) = self.card {
            write!(f, " {card}")?;
        }
        if !self.details.is_empty() {
            write!(f, ": {}", self.details)?;
        }
        Ok(())
    }
}
