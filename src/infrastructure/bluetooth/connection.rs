//! BLE Connection Module
//!
//! WinRT implementation of [`BleLink`]: connects to the hub, resolves the
//! SPIKE GATT service and streams TX notifications.

use crate::error::{ConnectError, SendError};
use crate::infrastructure::bluetooth::link::{
    release_on_error, BleLink, DiscoveryFilter, LinkEvent,
};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::scanner::BleScanner;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

struct Session {
    device: BluetoothLEDevice,
    // Held so Windows keeps the link up
    gatt_session: Option<GattSession>,
    rx_char: GattCharacteristic,
    tx_char: GattCharacteristic,
    value_token: i64,
    status_token: i64,
}

/// WinRT BLE link to one hub
pub struct WinRtLink {
    session: Mutex<Option<Session>>,
}

impl WinRtLink {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(None),
        }
    }

    fn rx_char(&self) -> Option<GattCharacteristic> {
        self.session
            .lock()
            .ok()
            .and_then(|s| s.as_ref().map(|s| s.rx_char.clone()))
    }

    /// Create a GattSession to maintain the BLE connection
    async fn create_gatt_session(device: &BluetoothLEDevice) -> windows::core::Result<GattSession> {
        let device_id = device.BluetoothDeviceId()?;
        let session = GattSession::FromDeviceIdAsync(&device_id)?.await?;
        session.SetMaintainConnection(true)?;
        Ok(session)
    }

    async fn get_characteristics(
        device: &BluetoothLEDevice,
        filter: &DiscoveryFilter,
    ) -> Result<(GattCharacteristic, GattCharacteristic), ConnectError> {
        let service_uuid: GUID = protocol::parse_uuid(&filter.service_uuid)?.into();
        let rx_uuid: GUID = protocol::parse_uuid(&filter.rx_char_uuid)?.into();
        let tx_uuid: GUID = protocol::parse_uuid(&filter.tx_char_uuid)?.into();

        let services_result = device
            .GetGattServicesForUuidAsync(service_uuid)
            .map_err(unavailable)?
            .await
            .map_err(unavailable)?;
        let status = services_result.Status().map_err(unavailable)?;
        if status != GattCommunicationStatus::Success {
            error!("Failed to get GATT services: {:?}", status);
            return Err(ConnectError::ServiceUnavailable(format!(
                "GATT service query returned {status:?}"
            )));
        }

        let services = services_result.Services().map_err(unavailable)?;
        if services.Size().map_err(unavailable)? == 0 {
            return Err(ConnectError::ServiceUnavailable(
                "SPIKE service not found".to_string(),
            ));
        }
        let service = services.GetAt(0).map_err(unavailable)?;
        info!("Found hub service");

        let chars_result = service
            .GetCharacteristicsAsync()
            .map_err(unavailable)?
            .await
            .map_err(unavailable)?;
        if chars_result.Status().map_err(unavailable)? != GattCommunicationStatus::Success {
            return Err(ConnectError::ServiceUnavailable(
                "failed to get characteristics".to_string(),
            ));
        }

        let characteristics = chars_result.Characteristics().map_err(unavailable)?;
        let mut rx_char = None;
        let mut tx_char = None;
        for i in 0..characteristics.Size().map_err(unavailable)? {
            let c = characteristics.GetAt(i).map_err(unavailable)?;
            let uuid = c.Uuid().map_err(unavailable)?;
            if uuid == rx_uuid {
                rx_char = Some(c);
            } else if uuid == tx_uuid {
                tx_char = Some(c);
            }
        }

        let rx = rx_char.ok_or_else(|| {
            ConnectError::ServiceUnavailable("RX characteristic not found".to_string())
        })?;
        let tx = tx_char.ok_or_else(|| {
            ConnectError::ServiceUnavailable("TX characteristic not found".to_string())
        })?;
        Ok((rx, tx))
    }

    async fn enable_notifications(tx_char: &GattCharacteristic) -> Result<(), ConnectError> {
        let status = tx_char
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )
            .map_err(unavailable)?
            .await
            .map_err(unavailable)?;
        if status != GattCommunicationStatus::Success {
            return Err(ConnectError::ServiceUnavailable(format!(
                "notification subscription returned {status:?}"
            )));
        }
        info!("Notifications enabled");
        Ok(())
    }
}

impl Default for WinRtLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleLink for WinRtLink {
    async fn connect(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<mpsc::UnboundedReceiver<LinkEvent>, ConnectError> {
        if self.session.lock().map(|s| s.is_some()).unwrap_or(false) {
            return Err(ConnectError::AlreadyConnected);
        }

        let hub = BleScanner::new().find(filter).await?;
        info!("Connecting to Bluetooth device: {:#X}", hub.address);

        let device = BluetoothLEDevice::FromBluetoothAddressAsync(hub.address)
            .map_err(link_failed)?
            .await
            .map_err(link_failed)?;

        let setup = async {
            let gatt_session = match Self::create_gatt_session(&device).await {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!("Failed to create GattSession, continuing anyway: {}", e);
                    None
                }
            };

            let (rx_char, tx_char) = Self::get_characteristics(&device, filter).await?;
            Self::enable_notifications(&tx_char).await?;

            let (tx, rx) = mpsc::unbounded_channel();

            let data_tx = tx.clone();
            let value_handler = TypedEventHandler::new(
                move |_: windows::core::Ref<GattCharacteristic>,
                      args: windows::core::Ref<GattValueChangedEventArgs>| {
                    if let Some(args) = args.as_ref() {
                        let value = args.CharacteristicValue()?;
                        let reader = DataReader::FromBuffer(&value)?;
                        let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
                        reader.ReadBytes(&mut bytes)?;
                        let _ = data_tx.send(LinkEvent::Data(bytes));
                    }
                    Ok(())
                },
            );
            let value_token = tx_char.ValueChanged(&value_handler).map_err(link_failed)?;

            let status_tx = tx;
            let status_handler =
                TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                    if let Some(dev) = dev.as_ref() {
                        if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                            let _ = status_tx.send(LinkEvent::Disconnected);
                        }
                    }
                    Ok(())
                });
            let status_token = device
                .ConnectionStatusChanged(&status_handler)
                .map_err(link_failed)?;

            Ok::<_, ConnectError>((
                Session {
                    device: device.clone(),
                    gatt_session,
                    rx_char,
                    tx_char,
                    value_token,
                    status_token,
                },
                rx,
            ))
        };
        let (session, rx) = release_on_error(setup, || async {
            let _ = device.Close();
        })
        .await?;

        if let Ok(mut slot) = self.session.lock() {
            *slot = Some(session);
        }
        Ok(rx)
    }

    async fn write(&self, packet: &[u8]) -> Result<(), SendError> {
        let rx_char = self.rx_char().ok_or(SendError::NotConnected)?;

        let writer = DataWriter::new().map_err(write_failed)?;
        writer.WriteBytes(packet).map_err(write_failed)?;
        let buffer = writer.DetachBuffer().map_err(write_failed)?;

        let status = rx_char
            .WriteValueWithOptionAsync(&buffer, GattWriteOption::WriteWithoutResponse)
            .map_err(write_failed)?
            .await
            .map_err(write_failed)?;
        match status {
            GattCommunicationStatus::Success => Ok(()),
            GattCommunicationStatus::Unreachable => Err(SendError::LinkLost),
            other => Err(SendError::WriteFailed(format!("{other:?}"))),
        }
    }

    async fn disconnect(&self) {
        let session = self.session.lock().ok().and_then(|mut s| s.take());
        if let Some(session) = session {
            let _ = session.tx_char.RemoveValueChanged(session.value_token);
            let _ = session
                .device
                .RemoveConnectionStatusChanged(session.status_token);
            if let Some(gatt_session) = session.gatt_session {
                let _ = gatt_session.Close();
            }
            let _ = session.device.Close();
            info!("Hub device released");
        }
    }
}

fn link_failed(e: windows::core::Error) -> ConnectError {
    ConnectError::LinkFailed(e.message().to_string())
}

fn unavailable(e: windows::core::Error) -> ConnectError {
    ConnectError::ServiceUnavailable(e.message().to_string())
}

fn write_failed(e: windows::core::Error) -> SendError {
    SendError::WriteFailed(e.message().to_string())
}
