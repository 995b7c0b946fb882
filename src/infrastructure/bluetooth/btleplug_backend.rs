//! btleplug implementation of [`BleLink`] for Linux and macOS.

use crate::error::{ConnectError, SendError};
use crate::infrastructure::bluetooth::link::{
    release_on_error, Advertisement, BleLink, DiscoveryFilter, LinkEvent,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

struct Session {
    peripheral: Peripheral,
    rx_char: Characteristic,
    notify_task: JoinHandle<()>,
}

#[derive(Default)]
pub struct BtleplugLink {
    session: Mutex<Option<Session>>,
}

impl BtleplugLink {
    pub fn new() -> Self {
        Self::default()
    }
}

fn parse(uuid: &str) -> Result<Uuid, ConnectError> {
    Uuid::parse_str(uuid).map_err(|_| ConnectError::ServiceUnavailable(format!("invalid UUID {uuid:?}")))
}

fn link_failed(e: btleplug::Error) -> ConnectError {
    ConnectError::LinkFailed(e.to_string())
}

async fn first_adapter() -> Result<Adapter, ConnectError> {
    let manager = Manager::new().await.map_err(link_failed)?;
    manager
        .adapters()
        .await
        .map_err(link_failed)?
        .into_iter()
        .next()
        .ok_or_else(|| ConnectError::LinkFailed("no Bluetooth adapter".to_string()))
}

async fn find_hub(
    adapter: &Adapter,
    filter: &DiscoveryFilter,
    service_uuid: Uuid,
) -> Result<Peripheral, ConnectError> {
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(link_failed)?;
    info!("Scanning for service UUID: {}", service_uuid);

    let deadline = tokio::time::Instant::now() + filter.scan_timeout;
    while tokio::time::Instant::now() < deadline {
        for peripheral in adapter.peripherals().await.map_err(link_failed)? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            let advertisement = Advertisement {
                local_name: properties.local_name.clone(),
                advertises_service: properties.services.contains(&service_uuid),
                manufacturer_ids: properties.manufacturer_data.keys().copied().collect(),
            };
            if filter.matches(&advertisement) {
                info!("Found hub {:?} ({})", properties.local_name, peripheral.id());
                let _ = adapter.stop_scan().await;
                return Ok(peripheral);
            }
        }
        tokio::time::sleep(SCAN_POLL_INTERVAL).await;
    }

    let _ = adapter.stop_scan().await;
    warn!("No hub found within {:?}", filter.scan_timeout);
    Err(ConnectError::NotFound)
}

#[async_trait]
impl BleLink for BtleplugLink {
    async fn connect(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<mpsc::UnboundedReceiver<LinkEvent>, ConnectError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(ConnectError::AlreadyConnected);
        }

        let service_uuid = parse(&filter.service_uuid)?;
        let rx_uuid = parse(&filter.rx_char_uuid)?;
        let tx_uuid = parse(&filter.tx_char_uuid)?;

        let adapter = first_adapter().await?;
        let peripheral = find_hub(&adapter, filter, service_uuid).await?;

        peripheral.connect().await.map_err(link_failed)?;

        let setup = async {
            peripheral
                .discover_services()
                .await
                .map_err(|e| ConnectError::ServiceUnavailable(e.to_string()))?;

            let characteristics = peripheral.characteristics();
            let find = |uuid: Uuid, what: &str| {
                characteristics
                    .iter()
                    .find(|c| c.uuid == uuid)
                    .cloned()
                    .ok_or_else(|| {
                        ConnectError::ServiceUnavailable(format!("{what} characteristic not found"))
                    })
            };
            let rx_char = find(rx_uuid, "RX")?;
            let tx_char = find(tx_uuid, "TX")?;

            peripheral
                .subscribe(&tx_char)
                .await
                .map_err(|e| ConnectError::ServiceUnavailable(e.to_string()))?;
            let notifications = peripheral.notifications().await.map_err(link_failed)?;
            let central_events = adapter.events().await.map_err(link_failed)?;
            Ok::<_, ConnectError>((rx_char, notifications, central_events))
        };

        let (rx_char, mut notifications, mut central_events) = release_on_error(setup, || async {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect failed: {}", e);
            }
        })
        .await?;
        info!("Connected to hub {}", peripheral.id());

        let (tx, rx) = mpsc::unbounded_channel();
        let peripheral_id = peripheral.id();
        let notify_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = notifications.next() => match notification {
                        Some(n) if n.uuid == tx_uuid => {
                            if tx.send(LinkEvent::Data(n.value)).is_err() {
                                return;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                    event = central_events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => break,
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            debug!("Hub notification stream ended");
            let _ = tx.send(LinkEvent::Disconnected);
        });

        *session = Some(Session {
            peripheral,
            rx_char,
            notify_task,
        });
        Ok(rx)
    }

    async fn write(&self, packet: &[u8]) -> Result<(), SendError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(SendError::NotConnected)?;
        session
            .peripheral
            .write(&session.rx_char, packet, WriteType::WithoutResponse)
            .await
            .map_err(|e| match e {
                btleplug::Error::NotConnected => SendError::LinkLost,
                other => SendError::WriteFailed(other.to_string()),
            })
    }

    async fn disconnect(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.notify_task.abort();
            if let Err(e) = session.peripheral.disconnect().await {
                warn!("Disconnect failed: {}", e);
            }
        }
    }
}
