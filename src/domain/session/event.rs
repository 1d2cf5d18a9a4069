//! Events produced by the signaling engine

use crate::domain::shared::events::{DomainEvent, EventMetadata};
use chrono::{DateTime, Utc};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipEventKind {
    /// Inbound MESSAGE
    Message,
    /// Our MESSAGE got a failure response or could not be sent
    MessageFailed,
    /// Remote hung up
    Bye,
    /// Remote cancelled its INVITE before we answered
    Cancelled,
    /// 603 Decline
    Declined,
    /// 486 Busy Here / 600 Busy Everywhere
    BusyHere,
    /// Any other call failure
    ServiceUnavailable,
    /// Call answered
    CallConnected,
    /// 180/183 for our INVITE, or an inbound INVITE waiting for an answer
    LocalRinging,
    Registered,
    RegistrationFailed,
}

impl SipEventKind {
    /// Ends the call it belongs to
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SipEventKind::Bye
                | SipEventKind::Cancelled
                | SipEventKind::Declined
                | SipEventKind::BusyHere
                | SipEventKind::ServiceUnavailable
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SipEventKind::Message => "message",
            SipEventKind::MessageFailed => "message_failed",
            SipEventKind::Bye => "bye",
            SipEventKind::Cancelled => "cancelled",
            SipEventKind::Declined => "declined",
            SipEventKind::BusyHere => "busy_here",
            SipEventKind::ServiceUnavailable => "service_unavailable",
            SipEventKind::CallConnected => "call_connected",
            SipEventKind::LocalRinging => "local_ringing",
            SipEventKind::Registered => "registered",
            SipEventKind::RegistrationFailed => "registration_failed",
        }
    }
}

/// Something that happened on the wire
#[derive(Debug, Clone)]
pub struct SipEvent {
    pub metadata: EventMetadata,
    pub kind: SipEventKind,
    /// Remote party URI
    pub from: String,
    /// Message text, or a reason phrase for failures
    pub content: String,
    pub remote_rtp_port: Option<u16>,
    pub remote_ip: Option<IpAddr>,
    /// Dialog the event belongs to; `None` means the active one
    pub call_id: Option<String>,
    /// Final SIP status, when the event came from a response
    pub status: Option<u16>,
}

impl SipEvent {
    pub fn new(kind: SipEventKind) -> Self {
        Self {
            metadata: EventMetadata::new(kind.name()),
            kind,
            from: String::new(),
            content: String::new(),
            remote_rtp_port: None,
            remote_ip: None,
            call_id: None,
            status: None,
        }
    }

    pub fn message(from: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(SipEventKind::Message)
            .with_from(from)
            .with_content(content)
    }

    pub fn call_connected(remote_rtp_port: u16, remote_ip: Option<IpAddr>) -> Self {
        let mut event = Self::new(SipEventKind::CallConnected);
        event.remote_rtp_port = Some(remote_rtp_port);
        event.remote_ip = remote_ip;
        event
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl DomainEvent for SipEvent {
    fn event_type(&self) -> &'static str {
        self.kind.name()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata.occurred_at
    }
}
