//! Platform entry point.
//!
//! A [`Platform`] owns one transport, the device table and the system-event
//! coordinator. It enumerates readers, hands out [`Device`]s and tears all of
//! them down on release.

use std::sync::{Arc, Mutex};

use cardlink_core::{DeviceHandle, DeviceInfo, Error, ErrorKind, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PlatformConfig;
use crate::coordinator::{
    ReleaseReport, SystemEvent, SystemEventCoordinator, SystemEventSender,
};
use crate::device::{Device, DeviceSetup, DeviceTable};
use crate::events::{EventBus, EventStream};
use crate::lock;
use crate::registry::Registry;
use crate::transport::{AnyTransport, PresenceSink, Transport, TransportFailure};

#[derive(Debug)]
struct PlatformInner {
    transport: Arc<AnyTransport>,
    config: PlatformConfig,
    events: EventBus,
    devices: Arc<DeviceTable>,
    coordinator: SystemEventCoordinator,
    /// Serializes acquire and release.
    gate: tokio::sync::Mutex<()>,
    /// Set while initialized; parent of every device's cancellation token.
    cycle: Mutex<Option<CancellationToken>>,
}

/// Entry point of the runtime.
///
/// Cheap to clone; clones refer to the same platform.
///
/// # Examples
///
/// ```no_run
/// use cardlink_apdu::CommandApdu;
/// use cardlink_runtime::{MockTransport, Platform};
///
/// # async fn example() -> cardlink_core::Result<()> {
/// let (transport, _control) = MockTransport::with_reader("reader-0");
/// let platform = Platform::with_defaults(transport)?;
/// platform.init().await?;
///
/// let info = platform.get_device_info().await?;
/// let device = platform.acquire_device(&info[0].id).await?;
/// device.wait_for_card_presence(5_000).await?;
///
/// let card = device.start_session().await?;
/// let response = card
///     .transmit(&CommandApdu::select_by_name(&[0xA0, 0x00, 0x00, 0x00, 0x03])?)
///     .await?;
/// println!("{}", response.status_word());
///
/// card.release().await?;
/// device.release().await?;
/// platform.release().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Platform {
    inner: Arc<PlatformInner>,
}

impl Platform {
    /// Build a platform on `transport`.
    ///
    /// # Errors
    ///
    /// `INVALID_PARAMETER` if `config` does not validate.
    pub fn new(transport: impl Into<AnyTransport>, config: PlatformConfig) -> Result<Self> {
        config.validate()?;

        let devices: Arc<DeviceTable> = Arc::new(Mutex::new(Registry::new()));
        let coordinator =
            SystemEventCoordinator::new(Arc::clone(&devices), config.release_timeout());

        Ok(Self {
            inner: Arc::new(PlatformInner {
                transport: Arc::new(transport.into()),
                events: EventBus::new(config.event_capacity),
                config,
                devices,
                coordinator,
                gate: tokio::sync::Mutex::new(()),
                cycle: Mutex::new(None),
            }),
        })
    }

    pub fn with_defaults(transport: impl Into<AnyTransport>) -> Result<Self> {
        Self::new(transport, PlatformConfig::default())
    }

    /// Build a platform on the system PC/SC service, polling readers at
    /// `config.pcsc_poll_interval()`.
    ///
    /// # Errors
    ///
    /// `INVALID_PARAMETER` if `config` does not validate, or the mapped
    /// failure to reach the PC/SC service.
    #[cfg(feature = "hardware-pcsc")]
    pub fn pcsc(config: PlatformConfig) -> Result<Self> {
        config.validate()?;
        let transport = crate::transport::pcsc::PcscTransport::from_config(&config)?;
        Self::new(transport, config)
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.inner.config
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.inner.cycle).is_some()
    }

    /// Initialize and start listening for system events.
    ///
    /// # Errors
    ///
    /// `ALREADY_INITIALIZED` if called twice without [`release`](Self::release).
    pub async fn init(&self) -> Result<()> {
        let _gate = self.inner.gate.lock().await;
        {
            let mut cycle = lock(&self.inner.cycle);
            if cycle.is_some() {
                return Err(Error::already_initialized("platform is already initialized"));
            }
            *cycle = Some(CancellationToken::new());
        }

        self.inner.coordinator.register();
        info!("Platform initialized on {} transport", self.inner.transport.kind());
        Ok(())
    }

    /// Release every acquired device and stop listening for system events.
    ///
    /// Failures releasing individual devices are logged, not returned.
    ///
    /// # Errors
    ///
    /// `NOT_INITIALIZED` if not initialized.
    pub async fn release(&self) -> Result<()> {
        self.shutdown(true).await.map(|_| ())
    }

    /// Like [`release`](Self::release) but never fails. Returns what the
    /// device teardown did.
    pub async fn release_force(&self) -> ReleaseReport {
        self.shutdown(false).await.unwrap_or_default()
    }

    async fn shutdown(&self, require_init: bool) -> Result<ReleaseReport> {
        let _gate = self.inner.gate.lock().await;
        let cycle = lock(&self.inner.cycle).take();
        if cycle.is_none() && require_init {
            return Err(Error::not_initialized("platform is not initialized"));
        }

        self.inner.coordinator.unregister();
        if let Some(cycle) = cycle {
            cycle.cancel();
        }

        let report = self.inner.coordinator.release_all("platform release").await;
        if !report.is_clean() {
            warn!("Platform release left devices behind: {}", report);
        }
        info!("Platform released");
        Ok(report)
    }

    fn ensure_initialized(&self) -> Result<CancellationToken> {
        lock(&self.inner.cycle)
            .clone()
            .ok_or_else(|| Error::not_initialized("platform is not initialized"))
    }

    /// Snapshot of the readers the transport currently offers.
    ///
    /// # Errors
    ///
    /// `NOT_INITIALIZED` before [`init`](Self::init), or the mapped transport
    /// failure.
    pub async fn get_device_info(&self) -> Result<Vec<DeviceInfo>> {
        self.ensure_initialized()?;
        let devices = self.inner.transport.enumerate().await?;
        debug!("Enumerated {} device(s)", devices.len());
        Ok(devices)
    }

    /// Acquire a reader and turn reader mode on.
    ///
    /// # Errors
    ///
    /// - `NOT_INITIALIZED` before [`init`](Self::init).
    /// - `INVALID_PARAMETER` if `id` is not in the current enumeration.
    /// - `ALREADY_CONNECTED` if the reader is already acquired.
    /// - `READER_ERROR` / `PLATFORM_ERROR` if reader mode cannot be enabled.
    pub async fn acquire_device(&self, id: &str) -> Result<Device> {
        let _gate = self.inner.gate.lock().await;
        let cycle = self.ensure_initialized()?;

        let info = self
            .inner
            .transport
            .enumerate()
            .await?
            .into_iter()
            .find(|info| info.id == id)
            .ok_or_else(|| Error::invalid_parameter(format!("unknown device id: {id}")))?;

        if lock(&self.inner.devices)
            .values()
            .any(|device| device.info().id == id)
        {
            return Err(Error::already_connected(format!("{id} is already acquired")));
        }

        let (sink, signals) = PresenceSink::channel(self.inner.config.presence_channel_capacity);
        self.inner
            .transport
            .activate(id, sink)
            .await
            .map_err(activation_error)?;

        let setup = DeviceSetup {
            info,
            transport: Arc::clone(&self.inner.transport),
            events: self.inner.events.clone(),
            cancel: cycle.child_token(),
            table: Arc::downgrade(&self.inner.devices),
            signals,
            max_chained_responses: self.inner.config.max_chained_responses,
        };

        let device = {
            let mut devices = lock(&self.inner.devices);
            let (_, device) = devices.insert_with(|handle| Device::spawn(handle, setup));
            device.clone()
        };
        info!("Acquired {} as {}", id, device.handle());
        Ok(device)
    }

    /// Handles of the devices currently acquired.
    pub fn acquired_devices(&self) -> Vec<DeviceHandle> {
        lock(&self.inner.devices).handles()
    }

    /// The acquired device with this handle.
    ///
    /// # Errors
    ///
    /// `NOT_CONNECTED` if the device was released or never existed.
    pub fn device(&self, handle: DeviceHandle) -> Result<Device> {
        lock(&self.inner.devices)
            .get(handle)
            .cloned()
            .ok_or_else(|| Error::not_connected(format!("{handle} is not acquired")))
    }

    pub fn subscribe_events(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    /// Sender the host uses to deliver lifecycle signals.
    pub fn system_events(&self) -> SystemEventSender {
        self.inner.coordinator.sender()
    }

    /// Handle a lifecycle signal right away and report what was released.
    pub async fn dispatch_system_event(&self, event: SystemEvent) -> ReleaseReport {
        self.inner.coordinator.dispatch(event).await
    }
}

/// Reader and platform failures keep their kind, everything else is a reader error.
fn activation_error(failure: TransportFailure) -> Error {
    let error = Error::from(failure);
    match error.kind() {
        ErrorKind::ReaderError | ErrorKind::PlatformError => error,
        _ => Error::reader_error(format!("cannot enable reader mode: {}", error.message())),
    }
}
