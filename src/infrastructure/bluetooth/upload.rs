//! Program file upload
//!
//! ```text
//! StartFileUpload ──ack──► TransferChunk(0) ──ack──► ... TransferChunk(n) ──ack──► FinishFileUpload
//! ```
//!
//! Every step is one correlated request. Only one chunk is outstanding at a
//! time and any failure aborts the session for good. A slot touched by an
//! aborted session must be cleared before the next upload.

use crate::domain::models::HubEvent;
use crate::error::{RequestError, UploadError};
use crate::infrastructure::bluetooth::correlator::Requester;
use crate::protocol::checksum::{checksum, checksum_default, DEFAULT_ALIGN};
use crate::protocol::messages::{HubRequest, HubResponse, ResponseStatus, MAX_FILE_NAME_LEN};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Largest chunk the 16-bit length field of a transfer can describe
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub chunk_size: usize,
    pub request_timeout: Duration,
    pub chunk_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            request_timeout: Duration::from_secs(5),
            chunk_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Transferring,
    Complete,
    Aborted,
}

pub struct FileUploadSession<'a> {
    requester: &'a dyn Requester,
    config: UploadConfig,
    events: Option<broadcast::Sender<HubEvent>>,
    state: UploadState,
    slot: u8,
    total_size: u32,
    file_crc: u32,
    next_sequence: u32,
    bytes_sent: u32,
    running_crc: u32,
}

impl<'a> FileUploadSession<'a> {
    pub fn new(requester: &'a dyn Requester, mut config: UploadConfig) -> Self {
        config.chunk_size = config.chunk_size.min(MAX_CHUNK_SIZE);
        Self {
            requester,
            config,
            events: None,
            state: UploadState::Idle,
            slot: 0,
            total_size: 0,
            file_crc: 0,
            next_sequence: 0,
            bytes_sent: 0,
            running_crc: 0,
        }
    }

    /// Publish `UploadProgress` after every acknowledged chunk
    pub fn with_events(mut self, events: broadcast::Sender<HubEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn bytes_sent(&self) -> u32 {
        self.bytes_sent
    }

    fn abort(&mut self, error: UploadError) -> UploadError {
        warn!("Upload to slot {} aborted: {}", self.slot, error);
        self.state = UploadState::Aborted;
        error
    }

    fn require_transferring(&self) -> Result<(), UploadError> {
        match self.state {
            UploadState::Transferring => Ok(()),
            UploadState::Aborted => Err(UploadError::Aborted),
            UploadState::Idle | UploadState::Complete => Err(UploadError::NotStarted),
        }
    }

    pub async fn start(
        &mut self,
        file_name: &str,
        slot: u8,
        total_size: u32,
        file_crc: u32,
    ) -> Result<(), UploadError> {
        match self.state {
            UploadState::Idle => {}
            // One session carries one upload
            _ => return Err(UploadError::Aborted),
        }
        if file_name.len() > MAX_FILE_NAME_LEN {
            return Err(UploadError::FileNameTooLong {
                max: MAX_FILE_NAME_LEN,
            });
        }

        self.slot = slot;
        self.total_size = total_size;
        self.file_crc = file_crc;
        info!(
            "Starting upload of {} ({} bytes, crc {:#010x}) to slot {}",
            file_name, total_size, file_crc, slot
        );

        let request = HubRequest::StartFileUpload {
            file_name: file_name.to_string(),
            slot,
            total_size,
            file_crc,
        };
        let status = match self
            .requester
            .request(&request, self.config.request_timeout)
            .await
        {
            Ok(HubResponse::StartFileUpload(status)) => status,
            Ok(other) => {
                return Err(self.abort(UploadError::Request(RequestError::UnexpectedResponse {
                    expected: request.expected_response(),
                    received: other.name(),
                })))
            }
            Err(e) => return Err(self.abort(UploadError::Request(e))),
        };

        match status {
            ResponseStatus::Ack => {
                self.state = UploadState::Transferring;
                Ok(())
            }
            ResponseStatus::StorageFull => Err(self.abort(UploadError::StorageFull)),
            ResponseStatus::SlotBusy => Err(self.abort(UploadError::SlotBusy)),
            ResponseStatus::Nak => Err(self.abort(UploadError::Rejected)),
        }
    }

    pub async fn send_chunk(&mut self, sequence: u32, bytes: &[u8]) -> Result<(), UploadError> {
        self.require_transferring()?;

        if sequence != self.next_sequence {
            return Err(self.abort(UploadError::OutOfOrder {
                expected: self.next_sequence,
                got: sequence,
            }));
        }
        if bytes.len() > self.config.chunk_size {
            return Err(self.abort(UploadError::ChunkTooLarge {
                size: bytes.len(),
                max: self.config.chunk_size,
            }));
        }
        let sent_after = self.bytes_sent as u64 + bytes.len() as u64;
        if sent_after > self.total_size as u64 {
            return Err(self.abort(UploadError::Overflow {
                total: self.total_size,
            }));
        }

        let running_crc = checksum(bytes, self.running_crc, DEFAULT_ALIGN);
        let request = HubRequest::TransferChunk {
            sequence,
            offset: self.bytes_sent,
            running_crc,
            data: bytes.to_vec(),
        };
        debug!(
            "Chunk {}: {} bytes at offset {}",
            sequence,
            bytes.len(),
            self.bytes_sent
        );

        let response = self
            .requester
            .request(&request, self.config.chunk_timeout)
            .await;
        match response {
            Ok(HubResponse::TransferChunk {
                status: ResponseStatus::Ack,
                sequence: acked,
            }) if acked == sequence => {}
            Ok(HubResponse::TransferChunk {
                status: ResponseStatus::Ack,
                sequence: acked,
            }) => {
                return Err(self.abort(UploadError::OutOfOrder {
                    expected: sequence,
                    got: acked,
                }))
            }
            Ok(HubResponse::TransferChunk { .. }) => {
                return Err(self.abort(UploadError::ChunkNak { sequence }))
            }
            Ok(other) => {
                return Err(self.abort(UploadError::Request(RequestError::UnexpectedResponse {
                    expected: request.expected_response(),
                    received: other.name(),
                })))
            }
            Err(RequestError::Timeout { .. }) => {
                return Err(self.abort(UploadError::ChunkTimeout { sequence }))
            }
            Err(e) => return Err(self.abort(UploadError::Request(e))),
        }

        self.running_crc = running_crc;
        self.bytes_sent = sent_after as u32;
        self.next_sequence += 1;

        if let Some(events) = &self.events {
            let _ = events.send(HubEvent::UploadProgress {
                slot: self.slot,
                bytes_sent: self.bytes_sent,
                total: self.total_size,
            });
        }
        Ok(())
    }

    pub async fn finish(&mut self) -> Result<(), UploadError> {
        self.require_transferring()?;

        if self.bytes_sent < self.total_size {
            return Err(self.abort(UploadError::Incomplete {
                sent: self.bytes_sent,
                total: self.total_size,
            }));
        }

        let request = HubRequest::FinishFileUpload {
            total_size: self.total_size,
            file_crc: self.file_crc,
        };
        match self
            .requester
            .request(&request, self.config.request_timeout)
            .await
        {
            Ok(HubResponse::FinishFileUpload(ResponseStatus::Ack)) => {
                self.state = UploadState::Complete;
                info!("Upload to slot {} complete", self.slot);
                Ok(())
            }
            Ok(HubResponse::FinishFileUpload(_)) => Err(self.abort(UploadError::TransferRejected)),
            Ok(other) => Err(self.abort(UploadError::Request(RequestError::UnexpectedResponse {
                expected: request.expected_response(),
                received: other.name(),
            }))),
            Err(e) => Err(self.abort(UploadError::Request(e))),
        }
    }

    /// Run the whole upload of `data` into `slot`
    pub async fn upload(&mut self, file_name: &str, slot: u8, data: &[u8]) -> Result<(), UploadError> {
        let total_size = u32::try_from(data.len()).map_err(|_| UploadError::Overflow { total: u32::MAX })?;
        self.start(file_name, slot, total_size, checksum_default(data))
            .await?;

        for (sequence, chunk) in data.chunks(self.config.chunk_size.max(1)).enumerate() {
            self.send_chunk(sequence as u32, chunk).await?;
        }

        self.finish().await
    }
}
