//! Device identity reported to the hub.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use voicesat_protocol::{
    API_VERSION_MAJOR, API_VERSION_MINOR, DeviceInfoResponse, HelloResponse, voice_feature,
};

use crate::config::ServerConfig;

/// Environment variable that pins the MAC address.
pub const FIXED_MAC_ENV: &str = "FIXED_MAC_ADDRESS";

const MANUFACTURER: &str = "voicesat";
const MODEL: &str = "Voice Satellite";
const ZERO_MAC: &str = "00:00:00:00:00:00";

static SEPARATOR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s-]+").expect("Invalid separator regex"));

/// Everything the hub learns about this device during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Advertised device name (`<slug>-<last 6 MAC digits>`).
    pub name: String,
    /// Name shown in the hub UI.
    pub friendly_name: String,
    /// MAC address, colon separated.
    pub mac_address: String,
    /// Whether the connect request must carry a password.
    pub uses_password: bool,
}

impl DeviceIdentity {
    /// Builds the identity from configuration, resolving the MAC address.
    pub fn from_config(config: &ServerConfig) -> Self {
        let env_mac = std::env::var(FIXED_MAC_ENV).ok();
        let mac_address = resolve_mac(
            env_mac.as_deref(),
            config.mac_address.as_deref(),
            Path::new("/sys/class/net"),
        );
        Self::new(config, mac_address)
    }

    /// Builds the identity with an explicit MAC address.
    pub fn new(config: &ServerConfig, mac_address: String) -> Self {
        Self {
            name: device_name(&config.name, &mac_address),
            friendly_name: config
                .friendly_name
                .clone()
                .unwrap_or_else(|| config.name.clone()),
            mac_address,
            uses_password: config.password.is_some(),
        }
    }

    /// Reply to a hello request.
    pub fn hello_response(&self) -> HelloResponse {
        HelloResponse {
            api_version_major: API_VERSION_MAJOR,
            api_version_minor: API_VERSION_MINOR,
            server_info: format!("voicesat {}", env!("CARGO_PKG_VERSION")),
            name: self.name.clone(),
        }
    }

    /// Reply to a device info request.
    pub fn device_info(&self) -> DeviceInfoResponse {
        DeviceInfoResponse {
            uses_password: self.uses_password,
            name: self.name.clone(),
            mac_address: self.mac_address.clone(),
            manufacturer: MANUFACTURER.to_string(),
            model: MODEL.to_string(),
            friendly_name: self.friendly_name.clone(),
            project_name: "voicesat.satellite".to_string(),
            project_version: env!("CARGO_PKG_VERSION").to_string(),
            voice_assistant_feature_flags: voice_feature::VOICE_ASSISTANT
                | voice_feature::API_AUDIO
                | voice_feature::ANNOUNCE
                | voice_feature::START_CONVERSATION
                | voice_feature::TIMERS,
            ..Default::default()
        }
    }
}

/// Derives the advertised device name.
///
/// The base name is lowercased, runs of whitespace and dashes become a
/// single `-`, and the last six hex digits of the MAC are appended.
pub fn device_name(base: &str, mac_address: &str) -> String {
    let lowered = base.to_lowercase();
    let slug = SEPARATOR_REGEX.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    let digits: String = mac_address
        .chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let suffix = &digits[digits.len().saturating_sub(6)..];
    format!("{slug}-{suffix}")
}

/// Picks the MAC address: environment, then configuration, then the first
/// non-loopback interface under `sysfs_net`, then all zeros.
pub fn resolve_mac(env: Option<&str>, configured: Option<&str>, sysfs_net: &Path) -> String {
    if let Some(mac) = env.filter(|m| !m.trim().is_empty()) {
        debug!(mac, "Using MAC address from environment");
        return mac.trim().to_lowercase();
    }
    if let Some(mac) = configured.filter(|m| !m.trim().is_empty()) {
        return mac.trim().to_lowercase();
    }
    match mac_from_sysfs(sysfs_net) {
        Some(mac) => mac,
        None => {
            warn!("No network interface MAC address found, using {ZERO_MAC}");
            ZERO_MAC.to_string()
        }
    }
}

fn mac_from_sysfs(root: &Path) -> Option<String> {
    let mut interfaces: Vec<_> = std::fs::read_dir(root)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    interfaces.sort();

    interfaces.into_iter().find_map(|path| {
        if path.file_name().is_some_and(|name| name == "lo") {
            return None;
        }
        let mac = std::fs::read_to_string(path.join("address")).ok()?;
        let mac = mac.trim().to_lowercase();
        (!mac.is_empty() && mac != ZERO_MAC).then_some(mac)
    })
}
