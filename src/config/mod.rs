//! Configuration management
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `RESTCOMM_` environment variables (`RESTCOMM_SIP__USERNAME=alice`).

pub mod preferences;

pub use preferences::{PreferenceChange, PreferenceStore, PreferenceValue, Preferences};

use crate::domain::profile::{SipProfile, DEFAULT_LOCAL_PORT, DEFAULT_REMOTE_IP, DEFAULT_REMOTE_PORT, DEFAULT_TRANSPORT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub sip: SipConfig,
    pub media: MediaConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SipConfig {
    /// Empty means "detect from the route to the registrar"
    pub local_ip: String,
    pub local_port: u16,
    pub transport: String,
    pub registrar_ip: String,
    pub registrar_port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConfig {
    pub rtp_port_start: u16,
    pub rtp_port_end: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub register_on_start: bool,
    /// Extra headers put on every INVITE
    #[serde(default)]
    pub custom_headers: Vec<CustomHeader>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sip: SipConfig {
                local_ip: String::new(),
                local_port: DEFAULT_LOCAL_PORT,
                transport: DEFAULT_TRANSPORT.to_string(),
                registrar_ip: DEFAULT_REMOTE_IP.to_string(),
                registrar_port: DEFAULT_REMOTE_PORT,
                username: String::new(),
                password: String::new(),
            },
            media: MediaConfig {
                rtp_port_start: 40000,
                rtp_port_end: 40999,
            },
            device: DeviceConfig {
                register_on_start: true,
                custom_headers: Vec::new(),
            },
        }
    }
}

impl Config {
    /// Build the configuration from defaults, `path` (if given and present)
    /// and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("RESTCOMM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Profile for the session manager
    pub fn profile(&self) -> SipProfile {
        let mut profile = SipProfile::new();
        profile.set_local_ip(&self.sip.local_ip);
        profile.set_local_port(self.sip.local_port);
        profile.set_transport(&self.sip.transport);
        profile.set_remote_ip(&self.sip.registrar_ip);
        profile.set_remote_port(self.sip.registrar_port);
        profile.set_sip_user_name(&self.sip.username);
        profile.set_sip_password(&self.sip.password);
        profile
    }

    pub fn custom_headers(&self) -> HashMap<String, String> {
        self.device
            .custom_headers
            .iter()
            .map(|h| (h.name.clone(), h.value.clone()))
            .collect()
    }
}
