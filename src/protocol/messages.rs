//! SPIKE hub message catalog.
//!
//! These are the payloads carried inside a [`Message`](super::frame::Message).
//! The first payload byte identifies the message type; every multi-byte field
//! is little-endian.

use crate::error::ProtocolError;

/// Longest program file name the hub accepts (the field is 32 bytes, nul terminated)
pub const MAX_FILE_NAME_LEN: usize = 31;

const FILE_NAME_FIELD_LEN: usize = 32;

/// Message type identifiers
pub mod id {
    pub const INFO_REQUEST: u8 = 0x00;
    pub const INFO_RESPONSE: u8 = 0x01;
    pub const START_FILE_UPLOAD_REQUEST: u8 = 0x0C;
    pub const START_FILE_UPLOAD_RESPONSE: u8 = 0x0D;
    pub const TRANSFER_CHUNK_REQUEST: u8 = 0x10;
    pub const TRANSFER_CHUNK_RESPONSE: u8 = 0x11;
    pub const FINISH_FILE_UPLOAD_REQUEST: u8 = 0x12;
    pub const FINISH_FILE_UPLOAD_RESPONSE: u8 = 0x13;
    pub const PROGRAM_FLOW_REQUEST: u8 = 0x1E;
    pub const PROGRAM_FLOW_RESPONSE: u8 = 0x1F;
    pub const PROGRAM_FLOW_NOTIFICATION: u8 = 0x20;
    pub const CONSOLE_NOTIFICATION: u8 = 0x21;
    pub const DEVICE_NOTIFICATION_REQUEST: u8 = 0x28;
    pub const DEVICE_NOTIFICATION_RESPONSE: u8 = 0x29;
    pub const DEVICE_NOTIFICATION: u8 = 0x3C;
    pub const CLEAR_SLOT_REQUEST: u8 = 0x46;
    pub const CLEAR_SLOT_RESPONSE: u8 = 0x47;
}

/// Status byte of an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ack,
    Nak,
    StorageFull,
    SlotBusy,
}

impl ResponseStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Ack => 0x00,
            Self::Nak => 0x01,
            Self::StorageFull => 0x02,
            Self::SlotBusy => 0x03,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x00 => Ok(Self::Ack),
            0x01 => Ok(Self::Nak),
            0x02 => Ok(Self::StorageFull),
            0x03 => Ok(Self::SlotBusy),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }

    pub fn is_ack(self) -> bool {
        self == Self::Ack
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramAction {
    Start,
    Stop,
}

impl ProgramAction {
    fn as_byte(self) -> u8 {
        match self {
            Self::Start => 0x00,
            Self::Stop => 0x01,
        }
    }
}

/// Hub capabilities reported by the info handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubInfo {
    pub rpc_major: u8,
    pub rpc_minor: u8,
    pub rpc_build: u16,
    pub firmware_major: u8,
    pub firmware_minor: u8,
    pub firmware_build: u16,
    pub max_packet_size: u16,
    pub max_message_size: u16,
    pub max_chunk_size: u16,
    pub product_group: u16,
}

impl HubInfo {
    pub fn rpc_version(&self) -> String {
        format!("{}.{}.{}", self.rpc_major, self.rpc_minor, self.rpc_build)
    }

    pub fn firmware_version(&self) -> String {
        format!(
            "{}.{}.{}",
            self.firmware_major, self.firmware_minor, self.firmware_build
        )
    }
}

/// Requests sent to the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubRequest {
    Info,
    StartFileUpload {
        file_name: String,
        slot: u8,
        total_size: u32,
        file_crc: u32,
    },
    TransferChunk {
        sequence: u32,
        offset: u32,
        running_crc: u32,
        data: Vec<u8>,
    },
    FinishFileUpload {
        total_size: u32,
        file_crc: u32,
    },
    ProgramFlow {
        action: ProgramAction,
        slot: u8,
    },
    DeviceNotification {
        interval_ms: u16,
    },
    ClearSlot {
        slot: u8,
    },
}

impl HubRequest {
    pub fn type_id(&self) -> u8 {
        match self {
            Self::Info => id::INFO_REQUEST,
            Self::StartFileUpload { .. } => id::START_FILE_UPLOAD_REQUEST,
            Self::TransferChunk { .. } => id::TRANSFER_CHUNK_REQUEST,
            Self::FinishFileUpload { .. } => id::FINISH_FILE_UPLOAD_REQUEST,
            Self::ProgramFlow { .. } => id::PROGRAM_FLOW_REQUEST,
            Self::DeviceNotification { .. } => id::DEVICE_NOTIFICATION_REQUEST,
            Self::ClearSlot { .. } => id::CLEAR_SLOT_REQUEST,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Info => "InfoRequest",
            Self::StartFileUpload { .. } => "StartFileUploadRequest",
            Self::TransferChunk { .. } => "TransferChunkRequest",
            Self::FinishFileUpload { .. } => "FinishFileUploadRequest",
            Self::ProgramFlow { .. } => "ProgramFlowRequest",
            Self::DeviceNotification { .. } => "DeviceNotificationRequest",
            Self::ClearSlot { .. } => "ClearSlotRequest",
        }
    }

    /// Name of the response this request must be answered with
    pub fn expected_response(&self) -> &'static str {
        match self {
            Self::Info => "InfoResponse",
            Self::StartFileUpload { .. } => "StartFileUploadResponse",
            Self::TransferChunk { .. } => "TransferChunkResponse",
            Self::FinishFileUpload { .. } => "FinishFileUploadResponse",
            Self::ProgramFlow { .. } => "ProgramFlowResponse",
            Self::DeviceNotification { .. } => "DeviceNotificationResponse",
            Self::ClearSlot { .. } => "ClearSlotResponse",
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![self.type_id()];
        match self {
            Self::Info => {}
            Self::StartFileUpload {
                file_name,
                slot,
                total_size,
                file_crc,
            } => {
                let mut field = [0u8; FILE_NAME_FIELD_LEN];
                let name = file_name.as_bytes();
                let len = name.len().min(MAX_FILE_NAME_LEN);
                field[..len].copy_from_slice(&name[..len]);
                out.extend_from_slice(&field);
                out.push(*slot);
                out.extend_from_slice(&total_size.to_le_bytes());
                out.extend_from_slice(&file_crc.to_le_bytes());
            }
            Self::TransferChunk {
                sequence,
                offset,
                running_crc,
                data,
            } => {
                out.extend_from_slice(&sequence.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&running_crc.to_le_bytes());
                // FileUploadSession never builds a chunk longer than u16::MAX
                out.extend_from_slice(&(data.len() as u16).to_le_bytes());
                out.extend_from_slice(data);
            }
            Self::FinishFileUpload {
                total_size,
                file_crc,
            } => {
                out.extend_from_slice(&total_size.to_le_bytes());
                out.extend_from_slice(&file_crc.to_le_bytes());
            }
            Self::ProgramFlow { action, slot } => {
                out.push(action.as_byte());
                out.push(*slot);
            }
            Self::DeviceNotification { interval_ms } => {
                out.extend_from_slice(&interval_ms.to_le_bytes());
            }
            Self::ClearSlot { slot } => out.push(*slot),
        }
        out
    }

    /// Parse a request payload; used by hub simulators
    pub fn deserialize(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload)?;
        let request = match r.message {
            id::INFO_REQUEST => Self::Info,
            id::START_FILE_UPLOAD_REQUEST => {
                let field = r.bytes(FILE_NAME_FIELD_LEN)?;
                let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
                Self::StartFileUpload {
                    file_name: String::from_utf8_lossy(&field[..end]).into_owned(),
                    slot: r.u8()?,
                    total_size: r.u32()?,
                    file_crc: r.u32()?,
                }
            }
            id::TRANSFER_CHUNK_REQUEST => {
                let sequence = r.u32()?;
                let offset = r.u32()?;
                let running_crc = r.u32()?;
                let size = r.u16()? as usize;
                Self::TransferChunk {
                    sequence,
                    offset,
                    running_crc,
                    data: r.bytes(size)?.to_vec(),
                }
            }
            id::FINISH_FILE_UPLOAD_REQUEST => Self::FinishFileUpload {
                total_size: r.u32()?,
                file_crc: r.u32()?,
            },
            id::PROGRAM_FLOW_REQUEST => {
                let action = if r.u8()? == 0 {
                    ProgramAction::Start
                } else {
                    ProgramAction::Stop
                };
                Self::ProgramFlow {
                    action,
                    slot: r.u8()?,
                }
            }
            id::DEVICE_NOTIFICATION_REQUEST => Self::DeviceNotification {
                interval_ms: r.u16()?,
            },
            id::CLEAR_SLOT_REQUEST => Self::ClearSlot { slot: r.u8()? },
            other => return Err(ProtocolError::UnknownMessage(other)),
        };
        Ok(request)
    }
}

/// Responses received from the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubResponse {
    Info(HubInfo),
    StartFileUpload(ResponseStatus),
    TransferChunk {
        status: ResponseStatus,
        sequence: u32,
    },
    FinishFileUpload(ResponseStatus),
    ProgramFlow(ResponseStatus),
    DeviceNotification(ResponseStatus),
    ClearSlot(ResponseStatus),
}

impl HubResponse {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Info(_) => "InfoResponse",
            Self::StartFileUpload(_) => "StartFileUploadResponse",
            Self::TransferChunk { .. } => "TransferChunkResponse",
            Self::FinishFileUpload(_) => "FinishFileUploadResponse",
            Self::ProgramFlow(_) => "ProgramFlowResponse",
            Self::DeviceNotification(_) => "DeviceNotificationResponse",
            Self::ClearSlot(_) => "ClearSlotResponse",
        }
    }

    /// Whether this response is the shape `request` is answered with
    pub fn answers(&self, request: &HubRequest) -> bool {
        self.name() == request.expected_response()
    }

    /// Status of a plain acknowledgement; `None` for the info response
    pub fn status(&self) -> Option<ResponseStatus> {
        match self {
            Self::Info(_) => None,
            Self::StartFileUpload(s)
            | Self::FinishFileUpload(s)
            | Self::ProgramFlow(s)
            | Self::DeviceNotification(s)
            | Self::ClearSlot(s) => Some(*s),
            Self::TransferChunk { status, .. } => Some(*status),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Self::Info(info) => {
                let mut out = vec![id::INFO_RESPONSE, info.rpc_major, info.rpc_minor];
                out.extend_from_slice(&info.rpc_build.to_le_bytes());
                out.push(info.firmware_major);
                out.push(info.firmware_minor);
                out.extend_from_slice(&info.firmware_build.to_le_bytes());
                out.extend_from_slice(&info.max_packet_size.to_le_bytes());
                out.extend_from_slice(&info.max_message_size.to_le_bytes());
                out.extend_from_slice(&info.max_chunk_size.to_le_bytes());
                out.extend_from_slice(&info.product_group.to_le_bytes());
                out
            }
            Self::StartFileUpload(s) => vec![id::START_FILE_UPLOAD_RESPONSE, s.as_byte()],
            Self::TransferChunk { status, sequence } => {
                let mut out = vec![id::TRANSFER_CHUNK_RESPONSE, status.as_byte()];
                out.extend_from_slice(&sequence.to_le_bytes());
                out
            }
            Self::FinishFileUpload(s) => vec![id::FINISH_FILE_UPLOAD_RESPONSE, s.as_byte()],
            Self::ProgramFlow(s) => vec![id::PROGRAM_FLOW_RESPONSE, s.as_byte()],
            Self::DeviceNotification(s) => vec![id::DEVICE_NOTIFICATION_RESPONSE, s.as_byte()],
            Self::ClearSlot(s) => vec![id::CLEAR_SLOT_RESPONSE, s.as_byte()],
        }
    }

    pub fn deserialize(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload)?;
        let response = match r.message {
            id::INFO_RESPONSE => Self::Info(HubInfo {
                rpc_major: r.u8()?,
                rpc_minor: r.u8()?,
                rpc_build: r.u16()?,
                firmware_major: r.u8()?,
                firmware_minor: r.u8()?,
                firmware_build: r.u16()?,
                max_packet_size: r.u16()?,
                max_message_size: r.u16()?,
                max_chunk_size: r.u16()?,
                product_group: r.u16()?,
            }),
            id::START_FILE_UPLOAD_RESPONSE => Self::StartFileUpload(r.status()?),
            id::TRANSFER_CHUNK_RESPONSE => Self::TransferChunk {
                status: r.status()?,
                sequence: r.u32()?,
            },
            id::FINISH_FILE_UPLOAD_RESPONSE => Self::FinishFileUpload(r.status()?),
            id::PROGRAM_FLOW_RESPONSE => Self::ProgramFlow(r.status()?),
            id::DEVICE_NOTIFICATION_RESPONSE => Self::DeviceNotification(r.status()?),
            id::CLEAR_SLOT_RESPONSE => Self::ClearSlot(r.status()?),
            other => return Err(ProtocolError::UnknownMessage(other)),
        };
        Ok(response)
    }
}

/// Unsolicited messages from the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubNotification {
    ProgramFlow { stopped: bool },
    Console(String),
    /// Raw device-message list, decoded by the device state decoder
    Device(Vec<u8>),
}

impl HubNotification {
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Self::ProgramFlow { stopped } => {
                vec![id::PROGRAM_FLOW_NOTIFICATION, u8::from(*stopped)]
            }
            Self::Console(text) => {
                let mut out = vec![id::CONSOLE_NOTIFICATION];
                out.extend_from_slice(text.as_bytes());
                out.push(0);
                out
            }
            Self::Device(readings) => {
                let mut out = vec![id::DEVICE_NOTIFICATION];
                out.extend_from_slice(&(readings.len() as u16).to_le_bytes());
                out.extend_from_slice(readings);
                out
            }
        }
    }

    pub fn deserialize(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(payload)?;
        let notification = match r.message {
            id::PROGRAM_FLOW_NOTIFICATION => Self::ProgramFlow {
                stopped: r.u8()? != 0,
            },
            id::CONSOLE_NOTIFICATION => {
                let rest = r.rest();
                let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                Self::Console(String::from_utf8_lossy(&rest[..end]).into_owned())
            }
            id::DEVICE_NOTIFICATION => {
                let size = r.u16()? as usize;
                Self::Device(r.bytes(size)?.to_vec())
            }
            other => return Err(ProtocolError::UnknownMessage(other)),
        };
        Ok(notification)
    }
}

/// Cursor over a payload that reports truncation against its message type
struct Reader<'a> {
    message: u8,
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn new(payload: &'a [u8]) -> Result<Self, ProtocolError> {
        let (&message, _) = payload.split_first().ok_or(ProtocolError::Empty)?;
        Ok(Self {
            message,
            bytes: payload,
            position: 1,
        })
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.position + n;
        if end > self.bytes.len() {
            return Err(ProtocolError::Truncated {
                message: self.message,
                needed: end,
                actual: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.bytes[self.position..];
        self.position = self.bytes.len();
        slice
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn status(&mut self) -> Result<ResponseStatus, ProtocolError> {
        ResponseStatus::from_byte(self.u8()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> HubInfo {
        HubInfo {
            rpc_major: 1,
            rpc_minor: 0,
            rpc_build: 3,
            firmware_major: 1,
            firmware_minor: 6,
            firmware_build: 62,
            max_packet_size: 20,
            max_message_size: 512,
            max_chunk_size: 40,
            product_group: 0,
        }
    }

    #[test]
    fn test_clear_slot_layout() {
        assert_eq!(HubRequest::ClearSlot { slot: 0 }.serialize(), vec![0x46, 0x00]);
    }

    #[test]
    fn test_start_file_upload_layout() {
        let bytes = HubRequest::StartFileUpload {
            file_name: "program.py".into(),
            slot: 2,
            total_size: 120,
            file_crc: 0xAABB_CCDD,
        }
        .serialize();

        assert_eq!(bytes.len(), 1 + 32 + 1 + 4 + 4);
        assert_eq!(bytes[0], id::START_FILE_UPLOAD_REQUEST);
        assert_eq!(&bytes[1..11], b"program.py");
        assert!(bytes[11..33].iter().all(|&b| b == 0));
        assert_eq!(bytes[33], 2);
        assert_eq!(&bytes[34..38], &120u32.to_le_bytes());
        assert_eq!(&bytes[38..42], &0xAABB_CCDDu32.to_le_bytes());
    }

    #[test]
    fn test_transfer_chunk_parses_back() {
        let request = HubRequest::TransferChunk {
            sequence: 1,
            offset: 40,
            running_crc: 0x1234_5678,
            data: vec![b'x'; 40],
        };
        assert_eq!(HubRequest::deserialize(&request.serialize()).unwrap(), request);
    }

    #[test]
    fn test_info_response_parses() {
        let info = sample_info();
        let parsed = HubResponse::deserialize(&HubResponse::Info(info).serialize()).unwrap();
        assert_eq!(parsed, HubResponse::Info(info));
        assert_eq!(info.firmware_version(), "1.6.62");
    }

    #[test]
    fn test_truncated_info_response() {
        let err = HubResponse::deserialize(&[id::INFO_RESPONSE, 1, 0]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Truncated {
                message: id::INFO_RESPONSE,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_status_and_type() {
        assert_eq!(
            HubResponse::deserialize(&[id::CLEAR_SLOT_RESPONSE, 9]).unwrap_err(),
            ProtocolError::UnknownStatus(9)
        );
        assert_eq!(
            HubResponse::deserialize(&[0x7F]).unwrap_err(),
            ProtocolError::UnknownMessage(0x7F)
        );
        assert_eq!(HubResponse::deserialize(&[]).unwrap_err(), ProtocolError::Empty);
    }

    #[test]
    fn test_response_answers_request() {
        let request = HubRequest::ClearSlot { slot: 0 };
        assert!(HubResponse::ClearSlot(ResponseStatus::Nak).answers(&request));
        assert!(!HubResponse::ProgramFlow(ResponseStatus::Ack).answers(&request));
    }

    #[test]
    fn test_console_notification_strips_terminator() {
        let payload = HubNotification::Console("hello".into()).serialize();
        assert_eq!(
            HubNotification::deserialize(&payload).unwrap(),
            HubNotification::Console("hello".into())
        );
    }

    #[test]
    fn test_device_notification_size_is_checked() {
        let err = HubNotification::deserialize(&[id::DEVICE_NOTIFICATION, 10, 0, 1, 2]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }
}
