//! Hub state and events shared between the transport and its consumers

use crate::error::DecodeError;
use serde::Serialize;
use std::fmt;

/// Number of external ports on a SPIKE Prime hub
pub const PORT_COUNT: usize = 6;

/// Connection lifecycle of the BLE link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Error => "error",
        };
        f.write_str(text)
    }
}

/// Why the link went down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    LinkLost,
}

/// Events published to application consumers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HubEvent {
    ConnectionState { state: ConnectionState },
    /// The link dropped without being asked to
    Disconnected,
    DeviceNotification { snapshot: HubSnapshot },
    ProgramFlow { stopped: bool },
    Console { text: String },
    UploadProgress { slot: u8, bytes_sent: u32, total: u32 },
}

/// Hub port A-F, stored as 0-5
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PortId(u8);

impl PortId {
    pub const A: Self = Self(0);
    pub const B: Self = Self(1);
    pub const C: Self = Self(2);
    pub const D: Self = Self(3);
    pub const E: Self = Self(4);
    pub const F: Self = Self(5);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn letter(self) -> char {
        (b'A' + self.0) as char
    }

    pub fn all() -> impl Iterator<Item = PortId> {
        (0..PORT_COUNT as u8).map(PortId)
    }
}

impl TryFrom<u8> for PortId {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (value as usize) < PORT_COUNT {
            Ok(Self(value))
        } else {
            Err(DecodeError::InvalidPort(value))
        }
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Color reported by the color sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    Black,
    Magenta,
    Purple,
    Blue,
    Azure,
    Turquoise,
    Green,
    Yellow,
    Orange,
    Red,
    White,
    Unknown,
}

impl Color {
    pub fn from_index(index: i8) -> Self {
        match index {
            0 => Self::Black,
            1 => Self::Magenta,
            2 => Self::Purple,
            3 => Self::Blue,
            4 => Self::Azure,
            5 => Self::Turquoise,
            6 => Self::Green,
            7 => Self::Yellow,
            8 => Self::Orange,
            9 => Self::Red,
            10 => Self::White,
            _ => Self::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Black => "black",
            Self::Magenta => "magenta",
            Self::Purple => "purple",
            Self::Blue => "blue",
            Self::Azure => "azure",
            Self::Turquoise => "turquoise",
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Orange => "orange",
            Self::Red => "red",
            Self::White => "white",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImuReading {
    pub face_up: u8,
    pub yaw_face: u8,
    pub yaw: i16,
    pub pitch: i16,
    pub roll: i16,
    pub accelerometer: [i16; 3],
    pub gyroscope: [i16; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MotorReading {
    pub device_type: u8,
    pub absolute_position: i16,
    pub power: i16,
    pub speed: i8,
    pub position: i32,
}

/// One entry of a device notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceReading {
    Battery { level: u8 },
    Imu(ImuReading),
    Display { pixels: [u8; 25] },
    Motor { port: PortId, reading: MotorReading },
    ForceSensor { port: PortId, value: u8, pressed: bool },
    ColorSensor { port: PortId, color: Color, red: u16, green: u16, blue: u16 },
    /// `None` when nothing is in range
    DistanceSensor { port: PortId, distance_mm: Option<i16> },
    ColorMatrix { port: PortId, pixels: [u8; 9] },
    /// Tag this decoder does not know; everything after it was skipped
    Unknown { tag: u8 },
}

/// What is plugged into a port, as of the latest notification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "device", rename_all = "snake_case")]
pub enum PortState {
    #[default]
    Empty,
    Motor {
        device_type: u8,
        absolute_position: i16,
        power: i16,
        speed: i8,
        position: i32,
    },
    ForceSensor {
        value: u8,
        pressed: bool,
    },
    ColorSensor {
        color: Color,
        red: u16,
        green: u16,
        blue: u16,
    },
    DistanceSensor {
        distance_mm: Option<i16>,
    },
    ColorMatrix {
        pixels: [u8; 9],
    },
    Unknown {
        device_type: u8,
    },
}

/// Published hub state; always replaced as a whole
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubSnapshot {
    pub ports: [PortState; PORT_COUNT],
    pub battery: Option<u8>,
    pub imu: Option<ImuReading>,
    pub display: Option<[u8; 25]>,
}

impl HubSnapshot {
    pub fn port(&self, port: PortId) -> &PortState {
        &self.ports[port.index()]
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_range() {
        assert_eq!(PortId::try_from(5).unwrap(), PortId::F);
        assert_eq!(PortId::try_from(6), Err(DecodeError::InvalidPort(6)));
        assert_eq!(PortId::C.to_string(), "C");
    }

    #[test]
    fn test_color_table() {
        assert_eq!(Color::from_index(0), Color::Black);
        assert_eq!(Color::from_index(9), Color::Red);
        assert_eq!(Color::from_index(10).name(), "white");
        assert_eq!(Color::from_index(-1), Color::Unknown);
        assert_eq!(Color::from_index(42), Color::Unknown);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(HubEvent::ProgramFlow { stopped: true }).unwrap();
        assert_eq!(json["event"], "program_flow");
        assert_eq!(json["stopped"], true);
    }
}
