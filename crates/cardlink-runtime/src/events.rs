//! Platform event fan-out.
//!
//! Every device and session publishes [`EventPayload`]s on one broadcast
//! channel owned by the platform. Subscribers get an [`EventStream`], optionally
//! narrowed to a single device. Delivery is at most once: a subscriber that
//! falls behind by more than the channel capacity skips the oldest events.

use cardlink_core::{DeviceHandle, EventKind, EventPayload};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{trace, warn};

/// Sending side of the platform event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventPayload>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per subscriber.
    ///
    /// `capacity` must be non-zero; [`PlatformConfig::validate`](crate::PlatformConfig::validate)
    /// guarantees that for platform-owned buses.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, payload: EventPayload) {
        trace!("Event {}", payload);
        let _ = self.tx.send(payload);
    }

    /// Shorthand for [`emit`](Self::emit) with a fresh payload.
    pub fn notify(&self, kind: EventKind, device: DeviceHandle, details: impl Into<String>) {
        self.emit(EventPayload::new(kind, device, details));
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            device: None,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving side of the platform event channel.
#[derive(Debug)]
pub struct EventStream {
    rx: broadcast::Receiver<EventPayload>,
    device: Option<DeviceHandle>,
}

impl EventStream {
    /// Only yield events about `device`.
    pub fn for_device(mut self, device: DeviceHandle) -> Self {
        self.device = Some(device);
        self
    }

    fn accepts(&self, payload: &EventPayload) -> bool {
        self.device.is_none_or(|device| payload.device == device)
    }

    /// Wait for the next matching event.
    ///
    /// Returns `None` once the platform is gone and the backlog is drained.
    pub async fn recv(&mut self) -> Option<EventPayload> {
        loop {
            match self.rx.recv().await {
                Ok(payload) if self.accepts(&payload) => return Some(payload),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event if one is already queued.
    pub fn try_recv(&mut self) -> Option<EventPayload> {
        loop {
            match self.rx.try_recv() {
                Ok(payload) if self.accepts(&payload) => return Some(payload),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, {} events dropped", skipped);
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// All matching events currently queued.
    pub fn drain(&mut self) -> Vec<EventPayload> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardlink_core::DeviceHandle;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(8);
        let mut stream = bus.subscribe();

        bus.notify(EventKind::CardFound, DeviceHandle::from_raw(1), "card in field");

        let event = stream.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::CardFound);
        assert_eq!(event.device, DeviceHandle::from_raw(1));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(8);
        assert_eq!(bus.subscriber_count(), 0);
        bus.notify(EventKind::DebugInfo, DeviceHandle::from_raw(1), "nobody listening");
    }

    #[test]
    fn test_device_filter() {
        let bus = EventBus::new(8);
        let mut stream = bus.subscribe().for_device(DeviceHandle::from_raw(2));

        bus.notify(EventKind::CardFound, DeviceHandle::from_raw(1), "");
        bus.notify(EventKind::CardLost, DeviceHandle::from_raw(2), "");
        bus.notify(EventKind::CardFound, DeviceHandle::from_raw(3), "");

        let events = stream.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::CardLost);
    }

    #[test]
    fn test_lagging_subscriber_skips_oldest() {
        let bus = EventBus::new(2);
        let mut stream = bus.subscribe();
        let device = DeviceHandle::from_raw(1);

        for details in ["a", "b", "c", "d"] {
            bus.notify(EventKind::DebugInfo, device, details);
        }

        let details: Vec<_> = stream.drain().into_iter().map(|e| e.details).collect();
        assert_eq!(details, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_recv_returns_none_when_bus_dropped() {
        let bus = EventBus::new(4);
        let mut stream = bus.subscribe();
        drop(bus);
        assert!(stream.recv().await.is_none());
    }
}
