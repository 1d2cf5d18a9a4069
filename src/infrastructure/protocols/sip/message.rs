//! SIP message types and parsing

use bytes::Bytes;
use rsip::headers::UntypedHeader;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Session manager is not initialized")]
    NotInitialized,

    #[error("Malformed address: {0}")]
    MalformedAddress(String),

    #[error("SDP construction error: {0}")]
    SdpConstruction(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// SIP methods the user agent sends or understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Info,
    Message,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Info => "INFO",
            SipMethod::Message => "MESSAGE",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Info => Some(SipMethod::Info),
            Method::Message => Some(SipMethod::Message),
            _ => None,
        }
    }

    pub fn to_rsip(&self) -> Method {
        match self {
            SipMethod::Register => Method::Register,
            SipMethod::Invite => Method::Invite,
            SipMethod::Ack => Method::Ack,
            SipMethod::Cancel => Method::Cancel,
            SipMethod::Bye => Method::Bye,
            SipMethod::Info => Method::Info,
            SipMethod::Message => Method::Message,
        }
    }

    /// Parse the method token used on the CSeq line
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "CANCEL" => Some(SipMethod::Cancel),
            "BYE" => Some(SipMethod::Bye),
            "INFO" => Some(SipMethod::Info),
            "MESSAGE" => Some(SipMethod::Message),
            _ => None,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Look up a header by name (case-insensitive) and return its value.
fn find_header(headers: &Headers, name: &str) -> Option<String> {
    headers.iter().find_map(|h| {
        let line = h.to_string();
        let (header_name, value) = line.split_once(':')?;
        if header_name.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// All values of a header, in message order.
fn find_headers(headers: &Headers, name: &str) -> Vec<String> {
    headers
        .iter()
        .filter_map(|h| {
            let line = h.to_string();
            let (header_name, value) = line.split_once(':')?;
            header_name
                .trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
        .collect()
}

/// Extract a `;name=value` parameter from a header value.
pub fn header_param(value: &str, name: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|param| {
        let (key, val) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(val.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

fn call_id_of(headers: &Headers) -> Option<String> {
    headers.iter().find_map(|h| match h {
        Header::CallId(cid) => Some(cid.value().to_string()),
        _ => None,
    })
}

fn cseq_of(headers: &Headers) -> Option<(u32, Option<SipMethod>)> {
    headers.iter().find_map(|h| match h {
        Header::CSeq(cseq) => {
            let mut parts = cseq.value().split_whitespace();
            let seq = parts.next()?.parse().ok()?;
            let method = parts.next().and_then(SipMethod::from_token);
            Some((seq, method))
        }
        _ => None,
    })
}

fn from_value(headers: &Headers) -> Option<String> {
    headers.iter().find_map(|h| match h {
        Header::From(from) => Some(from.value().to_string()),
        _ => None,
    })
}

fn to_value(headers: &Headers) -> Option<String> {
    headers.iter().find_map(|h| match h {
        Header::To(to) => Some(to.value().to_string()),
        _ => None,
    })
}

/// Pull the URI out of a name-addr (`"Bob" <sip:bob@host>;tag=x`) or addr-spec value.
pub fn addr_spec(value: &str) -> String {
    match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].to_string(),
        _ => value.split(';').next().unwrap_or(value).trim().to_string(),
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.inner.body).to_string()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        find_header(&self.inner.headers, name)
    }

    pub fn header_all(&self, name: &str) -> Vec<String> {
        find_headers(&self.inner.headers, name)
    }

    pub fn call_id(&self) -> Option<String> {
        call_id_of(&self.inner.headers)
    }

    pub fn from_header(&self) -> Option<String> {
        from_value(&self.inner.headers)
    }

    pub fn to_header(&self) -> Option<String> {
        to_value(&self.inner.headers)
    }

    pub fn from_uri(&self) -> Option<String> {
        self.from_header().map(|v| addr_spec(&v))
    }

    pub fn from_tag(&self) -> Option<String> {
        self.from_header().and_then(|v| header_param(&v, "tag"))
    }

    pub fn to_tag(&self) -> Option<String> {
        self.to_header().and_then(|v| header_param(&v, "tag"))
    }

    pub fn cseq(&self) -> Option<u32> {
        cseq_of(&self.inner.headers).map(|(seq, _)| seq)
    }

    /// Branch parameter of the topmost Via
    pub fn branch(&self) -> Option<String> {
        self.inner.headers.iter().find_map(|h| match h {
            Header::Via(via) => header_param(via.value(), "branch"),
            _ => None,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.inner.body).to_string()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        find_header(&self.inner.headers, name)
    }

    pub fn call_id(&self) -> Option<String> {
        call_id_of(&self.inner.headers)
    }

    /// CSeq number and method this response answers
    pub fn cseq(&self) -> Option<(u32, Option<SipMethod>)> {
        cseq_of(&self.inner.headers)
    }

    pub fn to_header(&self) -> Option<String> {
        to_value(&self.inner.headers)
    }

    pub fn to_tag(&self) -> Option<String> {
        self.to_header().and_then(|v| header_param(&v, "tag"))
    }

    /// Target URI from the Contact header, if the peer sent one
    pub fn contact_uri(&self) -> Option<String> {
        self.header("Contact").map(|v| addr_spec(&v))
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        if let Ok(request) = SipRequest::parse(data) {
            return Ok(SipMessage::Request(request));
        }

        if let Ok(response) = SipResponse::parse(data) {
            return Ok(SipMessage::Response(response));
        }

        Err(SipError::ParseError(
            "Could not parse as SIP request or response".to_string(),
        ))
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}
