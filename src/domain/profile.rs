//! SIP identity and addressing

use crate::config::preferences::{
    Preferences, PREF_LOCAL_PORT, PREF_PROXY_IP, PREF_PROXY_PORT, PREF_SIP_PASSWORD,
    PREF_SIP_USER, PREF_TRANSPORT,
};
use crate::infrastructure::protocols::sip::{SipError, TransportProtocol};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::{info, warn};

pub const DEFAULT_LOCAL_PORT: u16 = 5080;
pub const DEFAULT_TRANSPORT: &str = "udp";
pub const DEFAULT_REMOTE_IP: &str = "23.23.228.238";
pub const DEFAULT_REMOTE_PORT: u16 = 5060;

/// Who we are and where the registrar lives.
///
/// Mutated only through setters so every change is logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SipProfile {
    local_ip: String,
    local_port: u16,
    transport: String,
    remote_ip: String,
    remote_port: u16,
    sip_user_name: String,
    sip_password: String,
}

impl Default for SipProfile {
    fn default() -> Self {
        Self {
            local_ip: String::new(),
            local_port: DEFAULT_LOCAL_PORT,
            transport: DEFAULT_TRANSPORT.to_string(),
            remote_ip: DEFAULT_REMOTE_IP.to_string(),
            remote_port: DEFAULT_REMOTE_PORT,
            sip_user_name: String::new(),
            sip_password: String::new(),
        }
    }
}

impl SipProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn remote_ip(&self) -> &str {
        &self.remote_ip
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn sip_user_name(&self) -> &str {
        &self.sip_user_name
    }

    pub fn sip_password(&self) -> &str {
        &self.sip_password
    }

    pub fn set_local_ip(&mut self, local_ip: &str) {
        info!("Setting local IP: {}", local_ip);
        self.local_ip = local_ip.to_string();
    }

    pub fn set_local_port(&mut self, local_port: u16) {
        info!("Setting local port: {}", local_port);
        self.local_port = local_port;
    }

    pub fn set_transport(&mut self, transport: &str) {
        info!("Setting transport: {}", transport);
        self.transport = transport.to_string();
    }

    pub fn set_remote_ip(&mut self, remote_ip: &str) {
        info!("Setting remote IP: {}", remote_ip);
        self.remote_ip = remote_ip.to_string();
    }

    pub fn set_remote_port(&mut self, remote_port: u16) {
        info!("Setting remote port: {}", remote_port);
        self.remote_port = remote_port;
    }

    pub fn set_sip_user_name(&mut self, sip_user_name: &str) {
        info!("Setting SIP user name: {}", sip_user_name);
        self.sip_user_name = sip_user_name.to_string();
    }

    pub fn set_sip_password(&mut self, sip_password: &str) {
        info!("Setting SIP password");
        self.sip_password = sip_password.to_string();
    }

    /// Local address usable in Via, Contact and SDP
    pub fn local_ip_addr(&self) -> Result<IpAddr, SipError> {
        let ip: IpAddr = self
            .local_ip
            .trim()
            .parse()
            .map_err(|_| SipError::MalformedAddress(format!("local IP {:?}", self.local_ip)))?;

        if ip.is_unspecified() {
            return Err(SipError::MalformedAddress(format!(
                "local IP {} is not a usable endpoint",
                ip
            )));
        }

        Ok(ip)
    }

    pub fn transport_protocol(&self) -> Result<TransportProtocol, SipError> {
        TransportProtocol::parse(&self.transport)
            .ok_or_else(|| SipError::InvalidArgument(format!("unsupported transport {:?}", self.transport)))
    }

    /// `remote_ip:remote_port`
    pub fn remote_host_port(&self) -> String {
        format!("{}:{}", self.remote_ip, self.remote_port)
    }

    /// Address of record: `sip:<user>@<remote_ip>:<remote_port>`
    pub fn aor(&self) -> String {
        format!("sip:{}@{}", self.sip_user_name, self.remote_host_port())
    }

    /// Re-read the persisted settings. Missing keys leave fields untouched.
    pub fn apply_preferences(&mut self, prefs: &Preferences) {
        if let Some(ip) = prefs.get_str(PREF_PROXY_IP) {
            if ip != self.remote_ip {
                self.set_remote_ip(ip);
            }
        }
        if let Some(port) = prefs.get_int(PREF_PROXY_PORT) {
            match u16::try_from(port) {
                Ok(port) if port != self.remote_port => self.set_remote_port(port),
                Ok(_) => {}
                Err(_) => warn!("Ignoring out-of-range proxy port {}", port),
            }
        }
        if let Some(user) = prefs.get_str(PREF_SIP_USER) {
            if user != self.sip_user_name {
                self.set_sip_user_name(user);
            }
        }
        if let Some(password) = prefs.get_str(PREF_SIP_PASSWORD) {
            if password != self.sip_password {
                self.set_sip_password(password);
            }
        }
        if let Some(port) = prefs.get_int(PREF_LOCAL_PORT) {
            match u16::try_from(port) {
                Ok(port) if port != self.local_port => self.set_local_port(port),
                Ok(_) => {}
                Err(_) => warn!("Ignoring out-of-range local port {}", port),
            }
        }
        if let Some(transport) = prefs.get_str(PREF_TRANSPORT) {
            if transport != self.transport {
                self.set_transport(transport);
            }
        }
    }
}
