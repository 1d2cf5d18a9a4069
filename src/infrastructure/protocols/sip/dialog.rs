//! SIP dialogs (RFC 3261 section 12) as seen by a single user agent

use super::message::{addr_spec, SipRequest, SipResponse};
use crate::domain::session::CallDirection;
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

/// Fresh Call-ID
pub fn generate_call_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Fresh From/To tag
pub fn generate_tag() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

/// Fresh Via branch with the RFC 3261 magic cookie
pub fn generate_branch() -> String {
    format!("z9hG4bK{}", Uuid::new_v4().simple())
}

/// State shared by every request of one call
#[derive(Debug, Clone)]
pub struct Dialog {
    pub call_id: String,
    pub direction: CallDirection,
    /// Our URI (From on requests we send)
    pub local_uri: String,
    pub local_tag: String,
    /// Peer URI (To on requests we send)
    pub remote_uri: String,
    pub remote_tag: Option<String>,
    /// Request-URI for in-dialog requests
    pub remote_target: String,
    /// Last CSeq we used
    pub local_cseq: u32,
    pub invite_cseq: u32,
    pub invite_branch: String,
    /// Request-URI of the initial INVITE
    pub invite_uri: String,
    /// The INVITE that created the dialog (inbound) or the last one we sent
    pub invite: Option<SipRequest>,
    pub local_rtp_port: Option<u16>,
    pub remote_media: Option<(IpAddr, u16)>,
    /// Where the inbound INVITE came from; responses go back there
    pub peer_addr: Option<SocketAddr>,
    pub auth_attempted: bool,
    pub confirmed: bool,
    /// A 1xx arrived for our INVITE, so it may be cancelled
    pub provisional_received: bool,
    /// Last response we sent to an inbound INVITE
    pub last_response: Option<SipResponse>,
}

impl Dialog {
    /// Dialog for an INVITE we are about to send
    pub fn outbound(local_uri: String, remote_uri: String, local_rtp_port: u16) -> Self {
        Self {
            call_id: generate_call_id(),
            direction: CallDirection::Outbound,
            local_uri,
            local_tag: generate_tag(),
            remote_target: remote_uri.clone(),
            invite_uri: remote_uri.clone(),
            remote_uri,
            remote_tag: None,
            local_cseq: 1,
            invite_cseq: 1,
            invite_branch: generate_branch(),
            invite: None,
            local_rtp_port: Some(local_rtp_port),
            remote_media: None,
            peer_addr: None,
            auth_attempted: false,
            confirmed: false,
            provisional_received: false,
            last_response: None,
        }
    }

    /// Dialog created by a received INVITE
    pub fn inbound(invite: &SipRequest) -> Option<Self> {
        let call_id = invite.call_id()?;
        let remote_uri = invite.from_uri()?;
        let local_uri = invite.to_header().map(|v| addr_spec(&v))?;
        let remote_target = invite
            .header("Contact")
            .map(|v| addr_spec(&v))
            .unwrap_or_else(|| remote_uri.clone());

        Some(Self {
            call_id,
            direction: CallDirection::Inbound,
            local_uri,
            local_tag: generate_tag(),
            remote_uri,
            remote_tag: invite.from_tag(),
            remote_target,
            local_cseq: 0,
            invite_cseq: invite.cseq().unwrap_or(1),
            invite_branch: invite.branch().unwrap_or_default(),
            invite_uri: invite.uri().to_string(),
            invite: Some(invite.clone()),
            local_rtp_port: None,
            remote_media: None,
            peer_addr: None,
            auth_attempted: false,
            confirmed: false,
            provisional_received: false,
            last_response: None,
        })
    }

    /// Bump and return the CSeq for the next request we originate
    pub fn next_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }

    /// Learn the remote tag and target from a response to our INVITE
    pub fn update_from_response(&mut self, response: &SipResponse) {
        if let Some(tag) = response.to_tag() {
            self.remote_tag = Some(tag);
        }
        if let Some(contact) = response.contact_uri() {
            self.remote_target = contact;
        }
    }

    pub fn matches(&self, call_id: &str) -> bool {
        self.call_id == call_id
    }
}

/// Out-of-dialog MESSAGE exchange with one peer
#[derive(Debug, Clone)]
pub struct PagerSession {
    pub call_id: String,
    pub local_tag: String,
    pub remote_uri: String,
    pub cseq: u32,
}

impl PagerSession {
    pub fn new(remote_uri: String) -> Self {
        Self {
            call_id: generate_call_id(),
            local_tag: generate_tag(),
            remote_uri,
            cseq: 0,
        }
    }

    pub fn next_cseq(&mut self) -> u32 {
        self.cseq += 1;
        self.cseq
    }
}
