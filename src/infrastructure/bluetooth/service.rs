//! Hub Service Module
//!
//! High-level operations on a SPIKE Prime hub. Owns the transport, the
//! request correlator and the device state decoder, and routes inbound
//! frames between them.

use crate::domain::device_state::DeviceStateDecoder;
use crate::domain::models::{ConnectionState, DisconnectReason, HubEvent, HubSnapshot};
use crate::domain::settings::Settings;
use crate::error::{HubError, RequestError};
use crate::infrastructure::bluetooth::correlator::RequestCorrelator;
use crate::infrastructure::bluetooth::link::{BleLink, DiscoveryFilter};
use crate::infrastructure::bluetooth::transport::{FrameHandler, Transport, TransportConfig};
use crate::infrastructure::bluetooth::upload::{FileUploadSession, UploadConfig, MAX_CHUNK_SIZE};
use crate::protocol::frame::{Message, MessageKind};
use crate::protocol::messages::{
    HubInfo, HubNotification, HubRequest, HubResponse, ProgramAction, ResponseStatus,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Highest program slot on the hub
pub const MAX_SLOT: u8 = 19;

const EVENT_CAPACITY: usize = 256;

/// Runtime configuration of a [`HubService`]
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub filter: DiscoveryFilter,
    pub connect_retries: u32,
    pub connect_retry_delay: Duration,
    pub request_timeout: Duration,
    pub chunk_timeout: Duration,
    pub notification_interval_ms: u16,
    pub default_packet_size: usize,
    pub default_chunk_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for HubConfig {
    fn from(s: &Settings) -> Self {
        Self {
            filter: s.discovery_filter(),
            connect_retries: s.connect_retries,
            connect_retry_delay: Duration::from_millis(s.connect_retry_delay_ms),
            request_timeout: Duration::from_millis(s.request_timeout_ms),
            chunk_timeout: Duration::from_millis(s.chunk_timeout_ms),
            notification_interval_ms: s.device_notification_interval_ms,
            default_packet_size: s.default_packet_size,
            default_chunk_size: s.default_chunk_size.clamp(1, MAX_CHUNK_SIZE),
        }
    }
}

/// Dispatches decoded frames: responses to the correlator, notifications to
/// the decoder and event subscribers
struct FrameRouter {
    correlator: Arc<RequestCorrelator>,
    decoder: Arc<DeviceStateDecoder>,
    events: broadcast::Sender<HubEvent>,
    info: Arc<Mutex<Option<HubInfo>>>,
}

impl FrameRouter {
    fn on_notification(&self, payload: &[u8]) {
        let notification = match HubNotification::deserialize(payload) {
            Ok(n) => n,
            Err(e) => {
                debug!("Ignoring notification: {}", e);
                return;
            }
        };

        match notification {
            HubNotification::Device(readings) => match self.decoder.ingest(&readings) {
                Ok(snapshot) => {
                    let _ = self.events.send(HubEvent::DeviceNotification { snapshot });
                }
                Err(e) => warn!("Dropping device notification: {}", e),
            },
            HubNotification::ProgramFlow { stopped } => {
                info!("Program {}", if stopped { "stopped" } else { "started" });
                let _ = self.events.send(HubEvent::ProgramFlow { stopped });
            }
            HubNotification::Console(text) => {
                info!("Hub console: {}", text);
                let _ = self.events.send(HubEvent::Console { text });
            }
        }
    }
}

impl FrameHandler for FrameRouter {
    fn on_frame(&self, message: Message) {
        match message.kind {
            MessageKind::Response => {
                // Unknown ids are logged by the correlator
                let _ = self.correlator.on_response(message);
            }
            MessageKind::Notification => self.on_notification(&message.payload),
            MessageKind::Request => warn!("Ignoring request {} from hub", message.id),
        }
    }

    fn on_disconnected(&self, reason: DisconnectReason) {
        self.correlator.fail_all(RequestError::LinkLost);
        self.decoder.reset();
        if let Ok(mut info) = self.info.lock() {
            *info = None;
        }
        if reason == DisconnectReason::LinkLost {
            let _ = self.events.send(HubEvent::Disconnected);
        }
    }

    fn on_state_changed(&self, state: ConnectionState) {
        let _ = self.events.send(HubEvent::ConnectionState { state });
    }
}

/// Main service coordinating all hub operations
pub struct HubService {
    transport: Arc<Transport>,
    correlator: Arc<RequestCorrelator>,
    decoder: Arc<DeviceStateDecoder>,
    events: broadcast::Sender<HubEvent>,
    config: HubConfig,
    info: Arc<Mutex<Option<HubInfo>>>,
}

impl HubService {
    pub fn new(link: Arc<dyn BleLink>, config: HubConfig) -> Self {
        let transport = Arc::new(Transport::new(
            link,
            TransportConfig {
                connect_retries: config.connect_retries,
                connect_retry_delay: config.connect_retry_delay,
                packet_size: config.default_packet_size,
            },
        ));
        let correlator = Arc::new(RequestCorrelator::new(transport.clone()));
        let decoder = Arc::new(DeviceStateDecoder::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let info = Arc::new(Mutex::new(None));

        transport.on_frame(Arc::new(FrameRouter {
            correlator: correlator.clone(),
            decoder: decoder.clone(),
            events: events.clone(),
            info: info.clone(),
        }));

        Self {
            transport,
            correlator,
            decoder,
            events,
            config,
            info,
        }
    }

    /// Connect, read the hub's limits and enable device notifications
    pub async fn connect(&self) -> Result<HubInfo, HubError> {
        self.transport.connect(&self.config.filter).await?;

        let setup = async {
            let info = self.hub_info().await?;
            self.enable_device_notifications(self.config.notification_interval_ms)
                .await?;
            Ok::<_, HubError>(info)
        };

        match setup.await {
            Ok(info) => {
                info!(
                    "Hub ready: firmware {}, rpc {}, max chunk {} bytes",
                    info.firmware_version(),
                    info.rpc_version(),
                    info.max_chunk_size
                );
                Ok(info)
            }
            Err(e) => {
                warn!("Hub setup failed: {}", e);
                self.transport.disconnect().await;
                Err(e)
            }
        }
    }

    /// Session state, including the cached hub info, is dropped with the link
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// Query the hub's versions and limits; packet size follows the answer
    pub async fn hub_info(&self) -> Result<HubInfo, HubError> {
        let info = match self.request(&HubRequest::Info).await? {
            HubResponse::Info(info) => info,
            other => {
                return Err(RequestError::UnexpectedResponse {
                    expected: "InfoResponse",
                    received: other.name(),
                }
                .into())
            }
        };

        self.transport.set_packet_size(info.max_packet_size as usize);
        if let Ok(mut cached) = self.info.lock() {
            *cached = Some(info);
        }
        Ok(info)
    }

    /// Info from the last handshake, if connected
    pub fn cached_info(&self) -> Option<HubInfo> {
        self.info.lock().ok().and_then(|info| *info)
    }

    /// Clear a program slot. Returns `false` when the hub reports the slot
    /// was already empty.
    pub async fn clear_slot(&self, slot: u8) -> Result<bool, HubError> {
        check_slot(slot)?;
        match self.status(&HubRequest::ClearSlot { slot }).await? {
            ResponseStatus::Ack => Ok(true),
            ResponseStatus::Nak => {
                info!("Clear slot {} not acknowledged, slot was likely empty", slot);
                Ok(false)
            }
            _ => Err(HubError::Refused("clear slot")),
        }
    }

    /// Replace the program in `slot` with `bytes`
    pub async fn upload_program_file(
        &self,
        file_name: &str,
        slot: u8,
        bytes: &[u8],
    ) -> Result<(), HubError> {
        check_slot(slot)?;
        self.clear_slot(slot).await?;

        let chunk_size = self
            .cached_info()
            .map(|info| info.max_chunk_size as usize)
            .filter(|&size| size > 0)
            .unwrap_or(self.config.default_chunk_size);

        let mut session = FileUploadSession::new(
            self.correlator.as_ref(),
            UploadConfig {
                chunk_size,
                request_timeout: self.config.request_timeout,
                chunk_timeout: self.config.chunk_timeout,
            },
        )
        .with_events(self.events.clone());

        session.upload(file_name, slot, bytes).await?;
        Ok(())
    }

    pub async fn start_program(&self, slot: u8) -> Result<(), HubError> {
        self.program_flow(ProgramAction::Start, slot, "program start")
            .await
    }

    pub async fn stop_program(&self, slot: u8) -> Result<(), HubError> {
        self.program_flow(ProgramAction::Stop, slot, "program stop")
            .await
    }

    pub async fn enable_device_notifications(&self, interval_ms: u16) -> Result<(), HubError> {
        match self
            .status(&HubRequest::DeviceNotification { interval_ms })
            .await?
        {
            ResponseStatus::Ack => {
                debug!("Device notifications every {} ms", interval_ms);
                Ok(())
            }
            _ => Err(HubError::Refused("device notifications")),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> HubSnapshot {
        self.decoder.snapshot()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<HubSnapshot> {
        self.decoder.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    async fn program_flow(
        &self,
        action: ProgramAction,
        slot: u8,
        operation: &'static str,
    ) -> Result<(), HubError> {
        check_slot(slot)?;
        match self.status(&HubRequest::ProgramFlow { action, slot }).await? {
            ResponseStatus::Ack => Ok(()),
            _ => Err(HubError::Refused(operation)),
        }
    }

    async fn request(&self, request: &HubRequest) -> Result<HubResponse, HubError> {
        Ok(self
            .correlator
            .request(request, self.config.request_timeout)
            .await?)
    }

    async fn status(&self, request: &HubRequest) -> Result<ResponseStatus, HubError> {
        let response = self.request(request).await?;
        response.status().ok_or_else(|| {
            HubError::from(RequestError::UnexpectedResponse {
                expected: request.expected_response(),
                received: response.name(),
            })
        })
    }
}

fn check_slot(slot: u8) -> Result<(), HubError> {
    if slot > MAX_SLOT {
        return Err(HubError::InvalidSlot(slot));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::MockLink;

    #[test]
    fn test_config_from_settings() {
        let mut settings = Settings::default();
        settings.chunk_timeout_ms = 1500;
        settings.device_notification_interval_ms = 100;
        let config = HubConfig::from(&settings);
        assert_eq!(config.chunk_timeout, Duration::from_millis(1500));
        assert_eq!(config.notification_interval_ms, 100);
        assert_eq!(config.default_packet_size, 20);

        settings.default_chunk_size = 1 << 20;
        assert_eq!(HubConfig::from(&settings).default_chunk_size, MAX_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn test_slot_range_is_checked_locally() {
        let link = Arc::new(MockLink::new());
        let service = HubService::new(link.clone(), HubConfig::default());
        assert_eq!(
            service.clear_slot(20).await,
            Err(HubError::InvalidSlot(20))
        );
        assert_eq!(
            service.start_program(MAX_SLOT + 1).await,
            Err(HubError::InvalidSlot(MAX_SLOT + 1))
        );
        assert!(link.written().is_empty());
    }

    #[tokio::test]
    async fn test_operations_need_a_connection() {
        let service = HubService::new(Arc::new(MockLink::new()), HubConfig::default());
        let err = service.stop_program(0).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotConnected);
        assert_eq!(service.connection_state(), ConnectionState::Disconnected);
    }
}
