//! Shared fakes for the integration tests

#![allow(dead_code)]

use restcomm_sip::application::CallNotifier;
use restcomm_sip::domain::SipEventKind;
use restcomm_sip::infrastructure::media::{AudioResource, MediaError};
use restcomm_sip::infrastructure::protocols::sip::{
    IncomingMessage, OutgoingMessage, SipError, SipMessage, Transport, TransportProtocol,
};
use restcomm_sip::SipProfile;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub const REGISTRAR: &str = "23.23.228.238:5060";

/// Profile used by every scenario: alice behind 10.0.0.2, default registrar
pub fn alice() -> SipProfile {
    let mut profile = SipProfile::new();
    profile.set_local_ip("10.0.0.2");
    profile.set_sip_user_name("alice");
    profile.set_sip_password("secret");
    profile.set_remote_ip("23.23.228.238");
    profile.set_remote_port(5060);
    profile
}

/// Transport that keeps everything it is asked to send
#[derive(Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<OutgoingMessage>>>,
    fail: Arc<AtomicBool>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following send fail
    pub fn fail_sends(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| String::from_utf8_lossy(&m.data).to_string())
            .collect()
    }

    pub fn destinations(&self) -> Vec<SocketAddr> {
        self.sent.lock().unwrap().iter().map(|m| m.destination).collect()
    }

    /// Requests whose request line starts with `method`
    pub fn requests(&self, method: &str) -> Vec<String> {
        let prefix = format!("{} ", method);
        self.sent()
            .into_iter()
            .filter(|m| m.starts_with(&prefix))
            .collect()
    }

    pub fn last_request(&self, method: &str) -> String {
        self.requests(method)
            .pop()
            .unwrap_or_else(|| panic!("no {} was sent", method))
    }

    /// Responses with the given status
    pub fn responses(&self, status: u16) -> Vec<String> {
        let prefix = format!("SIP/2.0 {} ", status);
        self.sent()
            .into_iter()
            .filter(|m| m.starts_with(&prefix))
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn start(&mut self) -> Result<(), SipError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), SipError> {
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SipError::TransportError("network unreachable".to_string()));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn take_receiver(&mut self) -> Option<mpsc::Receiver<IncomingMessage>> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some("10.0.0.2:5080".parse().unwrap())
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }
}

/// Value of the first header `name` in a raw message
pub fn header(message: &str, name: &str) -> Option<String> {
    message.split("\r\n").find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// Header names in order of appearance
pub fn header_names(message: &str) -> Vec<String> {
    message
        .split("\r\n\r\n")
        .next()
        .unwrap_or_default()
        .split("\r\n")
        .skip(1)
        .filter_map(|line| line.split_once(':').map(|(k, _)| k.trim().to_string()))
        .collect()
}

pub fn body(message: &str) -> &str {
    message.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or_default()
}

/// Answer one of our requests the way a proxy would
pub fn response_to(request: &str, status: u16, extra: &[(&str, &str)], body: &str) -> IncomingMessage {
    let reason = match status {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        401 => "Unauthorized",
        407 => "Proxy Authentication Required",
        486 => "Busy Here",
        487 => "Request Terminated",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => "Unknown",
    };

    let to = header(request, "To").unwrap_or_default();
    let to = if to.contains("tag=") {
        to
    } else {
        format!("{};tag=remote1", to)
    };

    let mut raw = format!("SIP/2.0 {} {}\r\n", status, reason);
    for name in ["Via", "From"] {
        raw.push_str(&format!("{}: {}\r\n", name, header(request, name).unwrap_or_default()));
    }
    raw.push_str(&format!("To: {}\r\n", to));
    for name in ["Call-ID", "CSeq"] {
        raw.push_str(&format!("{}: {}\r\n", name, header(request, name).unwrap_or_default()));
    }
    for (name, value) in extra {
        raw.push_str(&format!("{}: {}\r\n", name, value));
    }
    if !body.is_empty() {
        raw.push_str("Content-Type: application/sdp\r\n");
    }
    raw.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));

    incoming(&raw)
}

pub fn incoming(raw: &str) -> IncomingMessage {
    IncomingMessage {
        message: SipMessage::parse(raw.as_bytes()).unwrap(),
        source: REGISTRAR.parse().unwrap(),
        protocol: TransportProtocol::Udp,
    }
}

pub fn sdp_answer(ip: &str, port: u16) -> String {
    format!(
        "v=0\r\no=- 1 1 IN IP4 {ip}\r\ns=-\r\nc=IN IP4 {ip}\r\nt=0 0\r\nm=audio {port} RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n",
        ip = ip,
        port = port
    )
}

/// INVITE from bob for alice, as the proxy would relay it
pub fn inbound_invite(call_id: &str, cseq: u32, sdp: &str) -> IncomingMessage {
    let mut raw = format!(
        "INVITE sip:alice@10.0.0.2:5080 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 23.23.228.238:5060;branch=z9hG4bK{call_id}\r\n\
         Max-Forwards: 69\r\n\
         From: <sip:bob@example.com>;tag=bobtag\r\n\
         To: <sip:alice@23.23.228.238>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} INVITE\r\n\
         Contact: <sip:bob@192.0.2.7:5060>\r\n",
        call_id = call_id,
        cseq = cseq
    );
    if !sdp.is_empty() {
        raw.push_str("Content-Type: application/sdp\r\n");
    }
    raw.push_str(&format!("Content-Length: {}\r\n\r\n{}", sdp.len(), sdp));
    incoming(&raw)
}

/// In-dialog request from bob on an inbound call
pub fn inbound_request(method: &str, call_id: &str, cseq: u32, local_tag: Option<&str>) -> IncomingMessage {
    let to = match local_tag {
        Some(tag) => format!("<sip:alice@23.23.228.238>;tag={}", tag),
        None => "<sip:alice@23.23.228.238>".to_string(),
    };
    let raw = format!(
        "{method} sip:alice@10.0.0.2:5080 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 23.23.228.238:5060;branch=z9hG4bK{method}{cseq}\r\n\
         Max-Forwards: 69\r\n\
         From: <sip:bob@example.com>;tag=bobtag\r\n\
         To: {to}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} {method}\r\n\
         Content-Length: 0\r\n\r\n",
        method = method,
        to = to,
        call_id = call_id,
        cseq = cseq
    );
    incoming(&raw)
}

/// Out-of-dialog MESSAGE from bob
pub fn inbound_message(text: &str) -> IncomingMessage {
    let raw = format!(
        "MESSAGE sip:alice@10.0.0.2:5080 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 23.23.228.238:5060;branch=z9hG4bKmsg1\r\n\
         Max-Forwards: 69\r\n\
         From: <sip:bob@example.com>;tag=bobmsg\r\n\
         To: <sip:alice@23.23.228.238>\r\n\
         Call-ID: pager-1\r\n\
         CSeq: 1 MESSAGE\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {len}\r\n\r\n{text}",
        len = text.len(),
        text = text
    );
    incoming(&raw)
}

/// Audio resource that counts calls
#[derive(Default)]
pub struct CountingAudio {
    pub streams: AtomicUsize,
    pub releases: AtomicUsize,
    pub remote: Mutex<Vec<(u16, IpAddr)>>,
}

impl CountingAudio {
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn remote(&self) -> Vec<(u16, IpAddr)> {
        self.remote.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl AudioResource for CountingAudio {
    async fn setup_audio_stream(&self, _local_ip: IpAddr) -> Result<u16, MediaError> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        Ok(40000)
    }

    async fn setup_audio(&self, remote_rtp_port: u16, remote_ip: IpAddr) -> Result<(), MediaError> {
        self.remote.lock().unwrap().push((remote_rtp_port, remote_ip));
        Ok(())
    }

    async fn release_audio_resources(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Notifier that records one line per notification
#[derive(Default)]
pub struct RecordingNotifier {
    pub log: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait::async_trait]
impl CallNotifier for RecordingNotifier {
    async fn incoming_call(&self, from: &str) {
        self.push(format!("incoming:{}", from));
    }

    async fn call_connected(&self, from: &str) {
        self.push(format!("connected:{}", from));
    }

    async fn call_ended(&self, kind: SipEventKind, _from: &str) {
        self.push(format!("ended:{}", kind.name()));
    }

    async fn message_received(&self, from: &str, content: &str) {
        self.push(format!("message:{}:{}", from, content));
    }

    async fn message_failed(&self, to: &str, status: Option<u16>) {
        self.push(format!("message_failed:{}:{:?}", to, status));
    }

    async fn registration_changed(&self, registered: bool) {
        self.push(format!("registered:{}", registered));
    }
}
