//! BLE transport and device protocol for LEGO SPIKE Prime hubs.
//!
//! [`HubService`] is the entry point: it connects through a
//! [`BleLink`](infrastructure::bluetooth::BleLink), uploads and runs programs,
//! and publishes decoded hub state as [`HubEvent`]s.

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod protocol;

pub use domain::models::{ConnectionState, HubEvent, HubSnapshot, PortId, PortState};
pub use error::{ErrorKind, HubError};
pub use infrastructure::bluetooth::{HubConfig, HubService};
pub use protocol::checksum::checksum;
