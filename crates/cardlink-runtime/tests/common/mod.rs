//! Shared setup for the runtime integration tests.

#![allow(dead_code)]

use std::time::Duration;

use cardlink_core::{EventKind, EventPayload};
use cardlink_runtime::{
    Device, EventStream, MockCard, MockTransport, MockTransportHandle, Platform, PlatformConfig,
};
use tracing_subscriber::EnvFilter;

pub const READER: &str = "Mock Reader 0";

/// Historical bytes of the default test card.
pub const HISTORICAL_BYTES: [u8; 4] = [0x80, 0x73, 0xC8, 0x21];

/// Route runtime logs to the test output. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_card() -> MockCard {
    MockCard::new().with_historical_bytes(HISTORICAL_BYTES.to_vec())
}

/// An initialized platform with one empty reader.
pub async fn platform_with_config(config: PlatformConfig) -> (Platform, MockTransportHandle) {
    init_tracing();
    let (transport, control) = MockTransport::with_reader(READER);
    let platform = Platform::new(transport, config).unwrap();
    platform.init().await.unwrap();
    (platform, control)
}

pub async fn platform() -> (Platform, MockTransportHandle) {
    platform_with_config(PlatformConfig::default()).await
}

/// An acquired device with `card` in its field, presence already observed.
pub async fn device_with_card(card: MockCard) -> (Platform, MockTransportHandle, Device) {
    let (platform, control) = platform().await;
    control.insert_card(READER, card);
    let device = platform.acquire_device(READER).await.unwrap();
    device.wait_for_card_presence(1_000).await.unwrap();
    (platform, control, device)
}

/// Wait for the next event of `kind`, skipping others.
pub async fn next_event(events: &mut EventStream, kind: EventKind) -> EventPayload {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(event) if event.kind == kind => return event,
                Some(_) => continue,
                None => panic!("event bus closed while waiting for {kind}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {kind} event within 2s"))
}
