//! BLE Scanner Module
//!
//! Finds a SPIKE Prime hub through the WinRT advertisement watcher.

use crate::error::ConnectError;
use crate::infrastructure::bluetooth::link::{Advertisement, DiscoveryFilter};
use crate::infrastructure::bluetooth::protocol;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Foundation::TypedEventHandler;

/// Address and name of a matching peripheral
#[derive(Debug, Clone)]
pub struct ScannedHub {
    pub address: u64,
    pub name: Option<String>,
    pub signal_strength: i16,
}

/// BLE Scanner for discovering hubs
pub struct BleScanner {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
}

impl BleScanner {
    pub fn new() -> Self {
        Self { watcher: None }
    }

    /// Scan until the first hub matching `filter` shows up or the scan times out
    pub async fn find(&mut self, filter: &DiscoveryFilter) -> Result<ScannedHub, ConnectError> {
        self.stop();

        let service_uuid: GUID = protocol::parse_uuid(&filter.service_uuid)?.into();
        info!("Scanning for service UUID: {}", filter.service_uuid);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(scan_failed)?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(scan_failed)?;

        let filter_clone = filter.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let adv = args.Advertisement()?;

                    let mut advertises_service = false;
                    let service_uuids = adv.ServiceUuids()?;
                    for i in 0..service_uuids.Size()? {
                        if service_uuids.GetAt(i)? == service_uuid {
                            advertises_service = true;
                            break;
                        }
                    }

                    let mut manufacturer_ids = Vec::new();
                    let manufacturer_data = adv.ManufacturerData()?;
                    for i in 0..manufacturer_data.Size()? {
                        manufacturer_ids.push(manufacturer_data.GetAt(i)?.CompanyId()?);
                    }

                    let name = adv.LocalName()?.to_string();
                    let advertisement = Advertisement {
                        local_name: (!name.is_empty()).then_some(name),
                        advertises_service,
                        manufacturer_ids,
                    };

                    if filter_clone.matches(&advertisement) {
                        let _ = tx.send(ScannedHub {
                            address: args.BluetoothAddress()?,
                            name: advertisement.local_name,
                            signal_strength: args.RawSignalStrengthInDBm()?,
                        });
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&handler).map_err(scan_failed)?;
        watcher.Start().map_err(scan_failed)?;
        self.watcher = Some(watcher);

        let found = tokio::time::timeout(filter.scan_timeout, rx.recv()).await;
        self.stop();

        match found {
            Ok(Some(hub)) => {
                info!(
                    "Found hub {:?} at {:#X} ({} dBm)",
                    hub.name, hub.address, hub.signal_strength
                );
                Ok(hub)
            }
            _ => {
                warn!("No hub found within {:?}", filter.scan_timeout);
                Err(ConnectError::NotFound)
            }
        }
    }

    pub fn stop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            debug!("Stopping BLE scan");
            let _ = watcher.Stop();
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.watcher.is_some()
    }
}

impl Default for BleScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn scan_failed(e: windows::core::Error) -> ConnectError {
    ConnectError::LinkFailed(format!("scan failed: {e}"))
}
