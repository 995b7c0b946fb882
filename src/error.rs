//! Error types for every layer of the hub link.
//!
//! Each layer has its own enum so callers can match on exactly what can go
//! wrong at that boundary. [`HubError`] wraps them for the high-level
//! operations and exposes a machine-readable [`ErrorKind`].

use serde::Serialize;
use thiserror::Error;

/// Failure to establish the BLE link
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("no hub found advertising the SPIKE service")]
    NotFound,
    #[error("hub service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("BLE link failed: {0}")]
    LinkFailed(String),
    #[error("already connected")]
    AlreadyConnected,
    #[error("no BLE backend available on this platform")]
    Unsupported,
}

/// Failure to write a frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,
    #[error("link lost while writing")]
    LinkLost,
    #[error("characteristic write failed: {0}")]
    WriteFailed(String),
}

/// Inbound frame rejected by the codec; recovered by discarding the frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("checksum mismatch (frame {expected:#010x}, computed {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

/// Payload of a frame does not match the hub message layout
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty message payload")]
    Empty,
    #[error("unknown message type {0:#04x}")]
    UnknownMessage(u8),
    #[error("message {message:#04x} truncated: need {needed} bytes, got {actual}")]
    Truncated {
        message: u8,
        needed: usize,
        actual: usize,
    },
    #[error("unknown status code {0:#04x}")]
    UnknownStatus(u8),
}

/// Device notification that cannot be turned into a snapshot
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("device reading {tag:#04x} truncated: need {needed} bytes, got {actual}")]
    Truncated { tag: u8, needed: usize, actual: usize },
    #[error("port {0} is out of range")]
    InvalidPort(u8),
}

/// Failure of a correlated request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("no response to request {id} before the deadline")]
    Timeout { id: u16 },
    #[error("link lost before the response arrived")]
    LinkLost,
    #[error("request cancelled")]
    Cancelled,
    #[error("response with unknown id {0}")]
    UnknownResponseId(u16),
    #[error("every request id is in flight")]
    IdsExhausted,
    #[error("expected {expected} but received {received}")]
    UnexpectedResponse {
        expected: &'static str,
        received: &'static str,
    },
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Failure of a program upload; the slot is left indeterminate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("hub storage is full")]
    StorageFull,
    #[error("slot is busy")]
    SlotBusy,
    #[error("hub rejected the upload")]
    Rejected,
    #[error("chunk {sequence} was not acknowledged")]
    ChunkNak { sequence: u32 },
    #[error("chunk {sequence} timed out")]
    ChunkTimeout { sequence: u32 },
    #[error("chunk out of order: expected {expected}, got {got}")]
    OutOfOrder { expected: u32, got: u32 },
    #[error("chunk of {size} bytes exceeds the {max} byte limit")]
    ChunkTooLarge { size: usize, max: usize },
    #[error("chunk overflows the announced size of {total} bytes")]
    Overflow { total: u32 },
    #[error("upload incomplete: {sent} of {total} bytes sent")]
    Incomplete { sent: u32, total: u32 },
    #[error("hub rejected the completed transfer")]
    TransferRejected,
    #[error("file name longer than {max} bytes")]
    FileNameTooLong { max: usize },
    #[error("upload not started")]
    NotStarted,
    #[error("upload session aborted; clear the slot before retrying")]
    Aborted,
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Error of a high-level hub operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("hub refused {0}")]
    Refused(&'static str),
    #[error("slot {0} is out of range")]
    InvalidSlot(u8),
}

/// Machine-readable error code surfaced to the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    ServiceUnavailable,
    LinkFailed,
    AlreadyConnected,
    Unsupported,
    NotConnected,
    LinkLost,
    WriteFailed,
    ChecksumMismatch,
    MalformedFrame,
    Protocol,
    Timeout,
    Cancelled,
    UnknownResponseId,
    IdsExhausted,
    UnexpectedResponse,
    StorageFull,
    SlotBusy,
    UploadRejected,
    ChunkNak,
    ChunkTimeout,
    OutOfOrder,
    InvalidUpload,
    UploadAborted,
    Refused,
    InvalidSlot,
}

impl ConnectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::NotFound,
            Self::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            Self::LinkFailed(_) => ErrorKind::LinkFailed,
            Self::AlreadyConnected => ErrorKind::AlreadyConnected,
            Self::Unsupported => ErrorKind::Unsupported,
        }
    }
}

impl SendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConnected => ErrorKind::NotConnected,
            Self::LinkLost => ErrorKind::LinkLost,
            Self::WriteFailed(_) => ErrorKind::WriteFailed,
        }
    }
}

impl RequestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::LinkLost => ErrorKind::LinkLost,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::UnknownResponseId(_) => ErrorKind::UnknownResponseId,
            Self::IdsExhausted => ErrorKind::IdsExhausted,
            Self::UnexpectedResponse { .. } => ErrorKind::UnexpectedResponse,
            Self::Send(e) => e.kind(),
            Self::Protocol(_) => ErrorKind::Protocol,
        }
    }
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StorageFull => ErrorKind::StorageFull,
            Self::SlotBusy => ErrorKind::SlotBusy,
            Self::Rejected | Self::TransferRejected => ErrorKind::UploadRejected,
            Self::ChunkNak { .. } => ErrorKind::ChunkNak,
            Self::ChunkTimeout { .. } => ErrorKind::ChunkTimeout,
            Self::OutOfOrder { .. } => ErrorKind::OutOfOrder,
            Self::ChunkTooLarge { .. }
            | Self::Overflow { .. }
            | Self::Incomplete { .. }
            | Self::FileNameTooLong { .. }
            | Self::NotStarted => ErrorKind::InvalidUpload,
            Self::Aborted => ErrorKind::UploadAborted,
            Self::Request(e) => e.kind(),
        }
    }
}

impl HubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect(e) => e.kind(),
            Self::Send(e) => e.kind(),
            Self::Request(e) => e.kind(),
            Self::Upload(e) => e.kind(),
            Self::Refused(_) => ErrorKind::Refused,
            Self::InvalidSlot(_) => ErrorKind::InvalidSlot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_passes_through_layers() {
        let err = HubError::from(UploadError::from(RequestError::Timeout { id: 7 }));
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let err = HubError::from(RequestError::from(SendError::NotConnected));
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ChunkTimeout).unwrap();
        assert_eq!(json, "\"chunk_timeout\"");
    }
}
