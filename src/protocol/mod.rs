//! Wire protocol of the SPIKE Prime hub
//!
//! - [`checksum`] - CRC-32 with zero padding
//! - [`cobs`] - link-level byte stuffing
//! - [`frame`] - message envelope and frame reassembly
//! - [`messages`] - typed hub requests, responses and notifications

pub mod checksum;
pub mod cobs;
pub mod frame;
pub mod messages;

pub use checksum::checksum;
pub use frame::{FrameAssembler, Message, MessageKind, NOTIFICATION_ID};
pub use messages::{HubInfo, HubNotification, HubRequest, HubResponse, ProgramAction, ResponseStatus};
