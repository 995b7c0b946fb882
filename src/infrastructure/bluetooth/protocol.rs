//! SPIKE Prime BLE Protocol
//!
//! GATT layout and advertisement identifiers of the hub.

use crate::error::ConnectError;

/// SPIKE Prime BLE Service UUID
pub const SERVICE_UUID: &str = "0000fd02-0000-1000-8000-00805f9b34fb";

/// Characteristic the hub receives on (we write)
pub const RX_CHAR_UUID: &str = "0000fd02-0001-1000-8000-00805f9b34fb";

/// Characteristic the hub transmits on (we subscribe)
pub const TX_CHAR_UUID: &str = "0000fd02-0002-1000-8000-00805f9b34fb";

/// LEGO company identifier in advertisement manufacturer data
pub const LEGO_MANUFACTURER_ID: u16 = 0x0397;

/// UUID split into the GUID field layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UuidFields {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

/// Parse a hyphenated UUID string
pub fn parse_uuid(uuid_str: &str) -> Result<UuidFields, ConnectError> {
    let invalid = || ConnectError::ServiceUnavailable(format!("invalid UUID {uuid_str:?}"));
    let hex = uuid_str.replace('-', "");

    if hex.len() != 32 || !hex.is_ascii() {
        return Err(invalid());
    }

    let data1 = u32::from_str_radix(&hex[0..8], 16).map_err(|_| invalid())?;
    let data2 = u16::from_str_radix(&hex[8..12], 16).map_err(|_| invalid())?;
    let data3 = u16::from_str_radix(&hex[12..16], 16).map_err(|_| invalid())?;

    let mut data4 = [0u8; 8];
    for (i, byte) in data4.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[16 + i * 2..18 + i * 2], 16).map_err(|_| invalid())?;
    }

    Ok(UuidFields {
        data1,
        data2,
        data3,
        data4,
    })
}

#[cfg(windows)]
impl From<UuidFields> for windows::core::GUID {
    fn from(fields: UuidFields) -> Self {
        windows::core::GUID {
            data1: fields.data1,
            data2: fields.data2,
            data3: fields.data3,
            data4: fields.data4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uuid() {
        let fields = parse_uuid(RX_CHAR_UUID).unwrap();
        assert_eq!(fields.data1, 0x0000_fd02);
        assert_eq!(fields.data2, 0x0001);
        assert_eq!(fields.data4, [0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb]);
    }

    #[test]
    fn test_parse_uuid_rejects_garbage() {
        assert!(parse_uuid("not-a-uuid").is_err());
        assert!(parse_uuid("zzzzfd02-0000-1000-8000-00805f9b34fb").is_err());
    }
}
