use crate::infrastructure::bluetooth::link::DiscoveryFilter;
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "spike_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE Settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_rx_uuid")]
    pub ble_rx_char_uuid: String,
    #[serde(default = "default_tx_uuid")]
    pub ble_tx_char_uuid: String,
    #[serde(default = "default_manufacturer_id")]
    pub ble_manufacturer_id: u16,
    #[serde(default)]
    pub device_name_prefix: Option<String>,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,

    // Connection Settings
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,

    // Protocol Settings
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,
    #[serde(default = "default_notification_interval_ms")]
    pub device_notification_interval_ms: u16,
    #[serde(default = "default_packet_size")]
    pub default_packet_size: usize,
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),

            ble_service_uuid: default_service_uuid(),
            ble_rx_char_uuid: default_rx_uuid(),
            ble_tx_char_uuid: default_tx_uuid(),
            ble_manufacturer_id: default_manufacturer_id(),
            device_name_prefix: None,
            scan_timeout_ms: default_scan_timeout_ms(),

            connect_retries: default_connect_retries(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),

            request_timeout_ms: default_request_timeout_ms(),
            chunk_timeout_ms: default_chunk_timeout_ms(),
            device_notification_interval_ms: default_notification_interval_ms(),
            default_packet_size: default_packet_size(),
            default_chunk_size: default_chunk_size(),
        }
    }
}

impl Settings {
    pub fn discovery_filter(&self) -> DiscoveryFilter {
        DiscoveryFilter {
            service_uuid: self.ble_service_uuid.clone(),
            rx_char_uuid: self.ble_rx_char_uuid.clone(),
            tx_char_uuid: self.ble_tx_char_uuid.clone(),
            manufacturer_id: Some(self.ble_manufacturer_id),
            name_prefix: self.device_name_prefix.clone(),
            scan_timeout: Duration::from_millis(self.scan_timeout_ms),
        }
    }
}

fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_rx_uuid() -> String {
    protocol::RX_CHAR_UUID.to_string()
}
fn default_tx_uuid() -> String {
    protocol::TX_CHAR_UUID.to_string()
}
fn default_manufacturer_id() -> u16 {
    protocol::LEGO_MANUFACTURER_ID
}
fn default_scan_timeout_ms() -> u64 {
    10_000
}
fn default_connect_retries() -> u32 {
    3
}
fn default_connect_retry_delay_ms() -> u64 {
    1000
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_chunk_timeout_ms() -> u64 {
    5000
}
fn default_notification_interval_ms() -> u16 {
    5000
}
fn default_packet_size() -> usize {
    20
}
fn default_chunk_size() -> usize {
    512
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    /// Load from an explicit path instead of the per-user config directory
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("SpikeLink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &PathBuf {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
