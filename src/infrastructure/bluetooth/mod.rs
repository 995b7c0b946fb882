//! Bluetooth Module
//!
//! Provides the BLE link to a SPIKE Prime hub.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       HubService                        │
//! │   (connect, upload, start/stop program, hub events)     │
//! └──────────┬───────────────────┬──────────────────────────┘
//!            │                   │
//!            ▼                   ▼
//! ┌───────────────────┐  ┌──────────────────┐
//! │ FileUploadSession │─►│ RequestCorrelator│
//! └───────────────────┘  └────────┬─────────┘
//!                                 │ frames      ▲ responses
//!                                 ▼             │
//!                        ┌──────────────────────┴──┐   notifications
//!                        │        Transport        │──────────────► DeviceStateDecoder
//!                        └────────────┬────────────┘
//!                                     │ packets
//!                                     ▼
//!                        ┌─────────────────────────┐
//!                        │ BleLink (WinRT/btleplug │
//!                        │          /mock)         │
//!                        └─────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT UUIDs and advertisement identifiers
//! - [`link`] - the [`BleLink`](link::BleLink) platform seam
//! - [`transport`] - connection state machine, packetization, reassembly
//! - [`correlator`] - request ids, pending table, timeouts
//! - [`upload`] - chunked program transfer
//! - [`service`] - high-level hub operations
//! - [`mock`] - in-memory link for tests

pub mod correlator;
pub mod link;
pub mod mock;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod upload;

#[cfg(windows)]
pub mod connection;
#[cfg(windows)]
pub mod scanner;

#[cfg(feature = "btleplug")]
pub mod btleplug_backend;

pub use link::{default_link, BleLink, DiscoveryFilter};
pub use service::{HubConfig, HubService};
