//! Domain types: connection lifecycle, hub events, device state and settings

pub mod device_state;
pub mod models;
pub mod settings;
