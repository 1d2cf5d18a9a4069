//! Audio SDP offers and answers

use super::message::SipError;
use std::net::IpAddr;

/// Payload type and encoding the client offers
const PCMU_PAYLOAD: &str = "0";
const PCMU_ENCODING: &str = "PCMU/8000";
const PTIME_MS: u32 = 20;

#[derive(Debug, Clone)]
pub struct SdpSession {
    pub version: u32,
    pub origin: SdpOrigin,
    pub session_name: String,
    pub connection: Option<SdpConnection>,
    pub media: Vec<SdpMedia>,
}

#[derive(Debug, Clone)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct SdpConnection {
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub media_type: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,
    pub rtpmap: Vec<(String, String)>,
    pub ptime: Option<u32>,
    /// Media-level `c=` line, overrides the session one
    pub connection: Option<SdpConnection>,
}

fn address_type(ip: IpAddr) -> &'static str {
    if ip.is_ipv4() {
        "IP4"
    } else {
        "IP6"
    }
}

impl SdpSession {
    /// Single PCMU audio stream on `local_ip:local_port`.
    pub fn create_audio_session(local_ip: IpAddr, local_port: u16) -> Result<Self, SipError> {
        if local_port == 0 {
            return Err(SipError::SdpConstruction(
                "local RTP port must be non-zero".to_string(),
            ));
        }
        if local_ip.is_unspecified() {
            return Err(SipError::SdpConstruction(format!(
                "{} is not a usable media address",
                local_ip
            )));
        }

        Ok(Self {
            version: 0,
            origin: SdpOrigin {
                username: "-".to_string(),
                session_id: chrono::Utc::now().timestamp().to_string(),
                session_version: "1".to_string(),
                address_type: address_type(local_ip).to_string(),
                address: local_ip.to_string(),
            },
            session_name: "-".to_string(),
            connection: Some(SdpConnection {
                address_type: address_type(local_ip).to_string(),
                address: local_ip.to_string(),
            }),
            media: vec![SdpMedia {
                media_type: "audio".to_string(),
                port: local_port,
                protocol: "RTP/AVP".to_string(),
                formats: vec![PCMU_PAYLOAD.to_string()],
                rtpmap: vec![(PCMU_PAYLOAD.to_string(), PCMU_ENCODING.to_string())],
                ptime: Some(PTIME_MS),
                connection: None,
            }],
        })
    }

    pub fn to_string(&self) -> String {
        let mut sdp = String::new();

        sdp.push_str(&format!("v={}\r\n", self.version));
        sdp.push_str(&format!(
            "o={} {} {} IN {} {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            self.origin.address_type,
            self.origin.address
        ));
        sdp.push_str(&format!("s={}\r\n", self.session_name));
        if let Some(conn) = &self.connection {
            sdp.push_str(&format!("c=IN {} {}\r\n", conn.address_type, conn.address));
        }
        sdp.push_str("t=0 0\r\n");

        for media in &self.media {
            sdp.push_str(&format!(
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                media.formats.join(" ")
            ));
            if let Some(conn) = &media.connection {
                sdp.push_str(&format!("c=IN {} {}\r\n", conn.address_type, conn.address));
            }
            for (pt, encoding) in &media.rtpmap {
                sdp.push_str(&format!("a=rtpmap:{} {}\r\n", pt, encoding));
            }
            if let Some(ptime) = media.ptime {
                sdp.push_str(&format!("a=ptime:{}\r\n", ptime));
            }
            sdp.push_str("a=sendrecv\r\n");
        }

        sdp
    }

    /// Parse a remote offer or answer. Unknown lines are skipped.
    pub fn parse(sdp_body: &str) -> Option<Self> {
        let mut version = 0;
        let mut origin: Option<SdpOrigin> = None;
        let mut session_name = String::new();
        let mut connection: Option<SdpConnection> = None;
        let mut media: Vec<SdpMedia> = Vec::new();
        let mut current_media: Option<SdpMedia> = None;

        for line in sdp_body.lines() {
            let line = line.trim();
            if line.len() < 2 || !line.contains('=') {
                continue;
            }

            let (field_type, value) = line.split_at(2);
            let value = value.trim();

            match field_type {
                "v=" => {
                    version = value.parse().unwrap_or(0);
                }
                "o=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 6 {
                        origin = Some(SdpOrigin {
                            username: parts[0].to_string(),
                            session_id: parts[1].to_string(),
                            session_version: parts[2].to_string(),
                            address_type: parts[4].to_string(),
                            address: parts[5].to_string(),
                        });
                    }
                }
                "s=" => {
                    session_name = value.to_string();
                }
                "c=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        let conn = SdpConnection {
                            address_type: parts[1].to_string(),
                            address: parts[2].split('/').next().unwrap_or(parts[2]).to_string(),
                        };
                        match current_media.as_mut() {
                            Some(m) => m.connection = Some(conn),
                            None => connection = Some(conn),
                        }
                    }
                }
                "m=" => {
                    if let Some(m) = current_media.take() {
                        media.push(m);
                    }

                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 4 {
                        current_media = Some(SdpMedia {
                            media_type: parts[0].to_string(),
                            port: parts[1].parse().unwrap_or(0),
                            protocol: parts[2].to_string(),
                            formats: parts[3..].iter().map(|s| s.to_string()).collect(),
                            rtpmap: Vec::new(),
                            ptime: None,
                            connection: None,
                        });
                    }
                }
                "a=" => {
                    if let Some(media) = current_media.as_mut() {
                        if let Some(rtpmap) = value.strip_prefix("rtpmap:") {
                            if let Some((pt, encoding)) = rtpmap.split_once(' ') {
                                media.rtpmap.push((pt.to_string(), encoding.to_string()));
                            }
                        } else if let Some(ptime) = value.strip_prefix("ptime:") {
                            media.ptime = ptime.trim().parse().ok();
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(m) = current_media.take() {
            media.push(m);
        }

        Some(Self {
            version,
            origin: origin?,
            session_name,
            connection,
            media,
        })
    }

    pub fn audio_media(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    /// Remote RTP endpoint: audio port plus the media-level or session-level address.
    pub fn audio_endpoint(&self) -> Option<(IpAddr, u16)> {
        let audio = self.audio_media()?;
        let conn = audio.connection.as_ref().or(self.connection.as_ref())?;
        let ip = conn.address.parse().ok()?;
        Some((ip, audio.port))
    }
}
