//! Device notification decoding
//!
//! A device notification carries a list of readings, each starting with a
//! one-byte tag. Readings are decoded into [`DeviceReading`]s, folded into a
//! fresh [`HubSnapshot`], and published by replacing the previous snapshot.

use crate::domain::models::{
    Color, DeviceReading, HubSnapshot, ImuReading, MotorReading, PortId, PortState,
};
use crate::error::DecodeError;
use tokio::sync::watch;
use tracing::{debug, trace};

pub mod tag {
    pub const BATTERY: u8 = 0x00;
    pub const IMU: u8 = 0x01;
    pub const DISPLAY: u8 = 0x02;
    pub const MOTOR: u8 = 0x0A;
    pub const FORCE_SENSOR: u8 = 0x0B;
    pub const COLOR_SENSOR: u8 = 0x0C;
    pub const DISTANCE_SENSOR: u8 = 0x0D;
    pub const COLOR_MATRIX: u8 = 0x0E;
}

/// Device types reported for motors
const MOTOR_DEVICE_TYPES: [u8; 5] = [48, 49, 65, 75, 76];

/// Decode the reading list of a device notification
pub fn decode(payload: &[u8]) -> Result<Vec<DeviceReading>, DecodeError> {
    let mut readings = Vec::new();
    let mut cursor = Cursor { bytes: payload, position: 0, tag: 0 };

    while cursor.position < payload.len() {
        cursor.tag = cursor.u8()?;
        let reading = match cursor.tag {
            tag::BATTERY => DeviceReading::Battery { level: cursor.u8()? },
            tag::IMU => DeviceReading::Imu(ImuReading {
                face_up: cursor.u8()?,
                yaw_face: cursor.u8()?,
                yaw: cursor.i16()?,
                pitch: cursor.i16()?,
                roll: cursor.i16()?,
                accelerometer: [cursor.i16()?, cursor.i16()?, cursor.i16()?],
                gyroscope: [cursor.i16()?, cursor.i16()?, cursor.i16()?],
            }),
            tag::DISPLAY => DeviceReading::Display {
                pixels: cursor.array::<25>()?,
            },
            tag::MOTOR => DeviceReading::Motor {
                port: cursor.port()?,
                reading: MotorReading {
                    device_type: cursor.u8()?,
                    absolute_position: cursor.i16()?,
                    power: cursor.i16()?,
                    speed: cursor.u8()? as i8,
                    position: cursor.i32()?,
                },
            },
            tag::FORCE_SENSOR => DeviceReading::ForceSensor {
                port: cursor.port()?,
                value: cursor.u8()?,
                pressed: cursor.u8()? != 0,
            },
            tag::COLOR_SENSOR => DeviceReading::ColorSensor {
                port: cursor.port()?,
                color: Color::from_index(cursor.u8()? as i8),
                red: cursor.u16()?,
                green: cursor.u16()?,
                blue: cursor.u16()?,
            },
            tag::DISTANCE_SENSOR => {
                let port = cursor.port()?;
                let raw = cursor.i16()?;
                DeviceReading::DistanceSensor {
                    port,
                    distance_mm: (raw >= 0).then_some(raw),
                }
            }
            tag::COLOR_MATRIX => DeviceReading::ColorMatrix {
                port: cursor.port()?,
                pixels: cursor.array::<9>()?,
            },
            unknown => {
                // Length of an unknown reading is unknowable, stop here
                debug!("Unknown device reading tag {:#04x}, skipping rest", unknown);
                readings.push(DeviceReading::Unknown { tag: unknown });
                break;
            }
        };
        readings.push(reading);
    }

    Ok(readings)
}

/// Build a snapshot from one notification's readings. Ports not mentioned are empty.
pub fn apply(readings: &[DeviceReading]) -> HubSnapshot {
    let mut snapshot = HubSnapshot::default();

    for reading in readings {
        match *reading {
            DeviceReading::Battery { level } => snapshot.battery = Some(level),
            DeviceReading::Imu(imu) => snapshot.imu = Some(imu),
            DeviceReading::Display { pixels } => snapshot.display = Some(pixels),
            DeviceReading::Motor { port, reading } => {
                snapshot.ports[port.index()] = if MOTOR_DEVICE_TYPES.contains(&reading.device_type) {
                    PortState::Motor {
                        device_type: reading.device_type,
                        absolute_position: reading.absolute_position,
                        power: reading.power,
                        speed: reading.speed,
                        position: reading.position,
                    }
                } else {
                    PortState::Unknown {
                        device_type: reading.device_type,
                    }
                };
            }
            DeviceReading::ForceSensor { port, value, pressed } => {
                snapshot.ports[port.index()] = PortState::ForceSensor { value, pressed };
            }
            DeviceReading::ColorSensor {
                port,
                color,
                red,
                green,
                blue,
            } => {
                snapshot.ports[port.index()] = PortState::ColorSensor {
                    color,
                    red,
                    green,
                    blue,
                };
            }
            DeviceReading::DistanceSensor { port, distance_mm } => {
                snapshot.ports[port.index()] = PortState::DistanceSensor { distance_mm };
            }
            DeviceReading::ColorMatrix { port, pixels } => {
                snapshot.ports[port.index()] = PortState::ColorMatrix { pixels };
            }
            DeviceReading::Unknown { .. } => {}
        }
    }

    snapshot
}

/// Owns the published snapshot
pub struct DeviceStateDecoder {
    snapshot: watch::Sender<HubSnapshot>,
}

impl Default for DeviceStateDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStateDecoder {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(HubSnapshot::default());
        Self { snapshot }
    }

    /// Decode a notification and replace the published snapshot.
    /// On error the previous snapshot stays in place.
    pub fn ingest(&self, payload: &[u8]) -> Result<HubSnapshot, DecodeError> {
        let readings = decode(payload)?;
        let snapshot = apply(&readings);
        trace!("Device snapshot: {:?}", snapshot);
        self.snapshot.send_replace(snapshot.clone());
        Ok(snapshot)
    }

    /// Copy of the latest snapshot
    pub fn snapshot(&self) -> HubSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HubSnapshot> {
        self.snapshot.subscribe()
    }

    /// Empty every port, used when the link goes down
    pub fn reset(&self) {
        self.snapshot.send_replace(HubSnapshot::default());
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
    tag: u8,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], DecodeError> {
        let end = self.position + n;
        if end > self.bytes.len() {
            return Err(DecodeError::Truncated {
                tag: self.tag,
                needed: end,
                actual: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn port(&mut self) -> Result<PortId, DecodeError> {
        PortId::try_from(self.u8()?)
    }
}
