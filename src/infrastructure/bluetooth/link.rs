//! Platform seam between the transport and a BLE stack.

use crate::error::{ConnectError, SendError};
use crate::infrastructure::bluetooth::protocol;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Which peripheral to connect to and which characteristics to use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub service_uuid: String,
    pub rx_char_uuid: String,
    pub tx_char_uuid: String,
    /// Accept peripherals that only advertise this company id
    pub manufacturer_id: Option<u16>,
    pub name_prefix: Option<String>,
    pub scan_timeout: Duration,
}

impl Default for DiscoveryFilter {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE_UUID.to_string(),
            rx_char_uuid: protocol::RX_CHAR_UUID.to_string(),
            tx_char_uuid: protocol::TX_CHAR_UUID.to_string(),
            manufacturer_id: Some(protocol::LEGO_MANUFACTURER_ID),
            name_prefix: None,
            scan_timeout: Duration::from_secs(10),
        }
    }
}

/// What a backend saw in one advertisement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub local_name: Option<String>,
    pub advertises_service: bool,
    pub manufacturer_ids: Vec<u16>,
}

impl DiscoveryFilter {
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        if let Some(prefix) = &self.name_prefix {
            let named = advertisement
                .local_name
                .as_deref()
                .is_some_and(|name| name.starts_with(prefix.as_str()));
            if !named {
                return false;
            }
        }

        advertisement.advertises_service
            || self
                .manufacturer_id
                .is_some_and(|id| advertisement.manufacturer_ids.contains(&id))
    }
}

/// Raw traffic from the hub characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Data(Vec<u8>),
    Disconnected,
}

/// One physical BLE connection to a hub.
///
/// `connect` hands back the notification stream of the TX characteristic;
/// the stream ends with [`LinkEvent::Disconnected`] (or closes) when the
/// link drops.
#[async_trait]
pub trait BleLink: Send + Sync {
    async fn connect(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<mpsc::UnboundedReceiver<LinkEvent>, ConnectError>;

    /// Write one packet to the RX characteristic
    async fn write(&self, packet: &[u8]) -> Result<(), SendError>;

    async fn disconnect(&self);
}

/// Finish the setup that follows a radio connect. The hub serves one
/// controller at a time, so if `setup` fails `release` runs before the error
/// is returned.
pub async fn release_on_error<T, E, R>(
    setup: impl Future<Output = Result<T, E>>,
    release: impl FnOnce() -> R,
) -> Result<T, E>
where
    E: fmt::Display,
    R: Future<Output = ()>,
{
    match setup.await {
        Ok(value) => Ok(value),
        Err(e) => {
            warn!("Hub setup failed, releasing device: {}", e);
            release().await;
            Err(e)
        }
    }
}

/// Backend for the current platform
pub fn default_link() -> Result<Arc<dyn BleLink>, ConnectError> {
    #[cfg(windows)]
    {
        Ok(Arc::new(super::connection::WinRtLink::new()))
    }
    #[cfg(all(not(windows), feature = "btleplug"))]
    {
        Ok(Arc::new(super::btleplug_backend::BtleplugLink::new()))
    }
    #[cfg(all(not(windows), not(feature = "btleplug")))]
    {
        Err(ConnectError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_filter_accepts_service_or_manufacturer() {
        let filter = DiscoveryFilter::default();

        assert!(filter.matches(&Advertisement {
            advertises_service: true,
            ..Default::default()
        }));
        assert!(filter.matches(&Advertisement {
            manufacturer_ids: vec![0x004C, protocol::LEGO_MANUFACTURER_ID],
            ..Default::default()
        }));
        assert!(!filter.matches(&Advertisement {
            local_name: Some("Speaker".into()),
            manufacturer_ids: vec![0x004C],
            ..Default::default()
        }));
    }

    #[test]
    fn test_filter_name_prefix() {
        let filter = DiscoveryFilter {
            name_prefix: Some("Team".into()),
            ..Default::default()
        };
        let mut advertisement = Advertisement {
            local_name: Some("Team Hub 3".into()),
            advertises_service: true,
            manufacturer_ids: Vec::new(),
        };
        assert!(filter.matches(&advertisement));

        advertisement.local_name = Some("Other".into());
        assert!(!filter.matches(&advertisement));
        advertisement.local_name = None;
        assert!(!filter.matches(&advertisement));
    }

    #[tokio::test]
    async fn test_failed_setup_releases_device() {
        let released = AtomicU32::new(0);
        let counter = &released;
        let release = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        };

        let result: Result<u8, ConnectError> = release_on_error(
            async { Err(ConnectError::ServiceUnavailable("no TX characteristic".into())) },
            release,
        )
        .await;
        assert_eq!(
            result,
            Err(ConnectError::ServiceUnavailable("no TX characteristic".into()))
        );
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let result: Result<u8, ConnectError> = release_on_error(async { Ok(7) }, release).await;
        assert_eq!(result, Ok(7));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
