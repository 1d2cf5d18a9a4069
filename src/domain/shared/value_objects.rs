//! Shared value objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// SIP URI value object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    user: String,
    host: String,
    port: Option<u16>,
}

impl SipUri {
    pub fn new(user: String, host: String, port: Option<u16>) -> Self {
        Self { user, host, port }
    }

    pub fn parse(uri: &str) -> Result<Self, String> {
        let rest = uri
            .strip_prefix("sip:")
            .ok_or_else(|| "URI must start with 'sip:'".to_string())?;

        let (user, host_port) = rest
            .split_once('@')
            .ok_or_else(|| "Invalid SIP URI format".to_string())?;

        Self::from_parts(user, host_port)
    }

    /// Resolve a dial target against the registrar.
    ///
    /// `sip:bob@host` and `bob@host` keep their host; a bare `bob` is placed
    /// on `default_host:default_port`.
    pub fn from_target(target: &str, default_host: &str, default_port: u16) -> Result<Self, String> {
        let target = target.trim();
        let rest = target.strip_prefix("sip:").unwrap_or(target);

        match rest.split_once('@') {
            Some((user, host_port)) => Self::from_parts(user, host_port),
            None => {
                if rest.is_empty() || rest.contains(':') || rest.contains(';') {
                    return Err(format!("Invalid dial target: {:?}", target));
                }
                if default_host.is_empty() {
                    return Err("No registrar host to resolve a bare user against".to_string());
                }
                Ok(Self::new(
                    rest.to_string(),
                    default_host.to_string(),
                    Some(default_port),
                ))
            }
        }
    }

    fn from_parts(user: &str, host_port: &str) -> Result<Self, String> {
        if user.is_empty() {
            return Err("SIP URI has an empty user part".to_string());
        }

        // URI parameters are not carried
        let host_port = host_port.split(';').next().unwrap_or(host_port);
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| format!("Invalid port in SIP URI: {}", port))?;
                (host, Some(port))
            }
            None => (host_port, None),
        };

        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(format!("Invalid host in SIP URI: {:?}", host));
        }

        Ok(Self::new(user.to_string(), host.to_string(), port))
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(port) = self.port {
            write!(f, "sip:{}@{}:{}", self.user, self.host, port)
        } else {
            write!(f, "sip:{}@{}", self.user, self.host)
        }
    }
}
