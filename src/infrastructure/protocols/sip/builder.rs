//! SIP request and response construction
//!
//! Header order follows what the registrar expects from this client:
//! Via, Max-Forwards, From, To, Call-ID, CSeq, then method-specific headers.

use super::auth::ChallengeKind;
use super::dialog::{generate_branch, generate_call_id, generate_tag, Dialog, PagerSession};
use super::message::{SipError, SipRequest, SipResponse};
use super::sdp::SdpSession;
use super::transport::ListeningPoint;
use crate::domain::profile::SipProfile;
use crate::domain::session::DtmfDigit;
use crate::domain::shared::SipUri;
use rsip::headers::UntypedHeader;
use rsip::{Header, Headers, Method, Request, Response, StatusCode, Version};
use std::collections::HashMap;

pub const MAX_FORWARDS: u32 = 70;
pub const REGISTER_EXPIRES: u32 = 300;
pub const SUPPORTED: &str = "replaces, outbound";
pub const DTMF_DURATION_MS: u32 = 250;

/// Answer to a digest challenge, carried on a resubmitted request
#[derive(Debug, Clone)]
pub struct Credential {
    pub kind: ChallengeKind,
    pub value: String,
}

impl Credential {
    fn header(&self) -> Header {
        match self.kind {
            ChallengeKind::Www => Header::Authorization(self.value.clone().into()),
            ChallengeKind::Proxy => Header::ProxyAuthorization(self.value.clone().into()),
        }
    }
}

/// Identity of one registration transaction chain
#[derive(Debug, Clone)]
pub struct RegisterParams {
    pub call_id: String,
    pub from_tag: String,
    pub cseq: u32,
    pub expires: u32,
    pub credential: Option<Credential>,
}

impl RegisterParams {
    pub fn fresh(expires: u32) -> Self {
        Self {
            call_id: generate_call_id(),
            from_tag: generate_tag(),
            cseq: 1,
            expires,
            credential: None,
        }
    }
}

fn parse_uri(uri: &str) -> Result<rsip::Uri, SipError> {
    rsip::Uri::try_from(uri).map_err(|e| SipError::MalformedAddress(format!("{}: {}", uri, e)))
}

fn name_addr(uri: &str, tag: Option<&str>) -> String {
    match tag {
        Some(tag) => format!("<{}>;tag={}", uri, tag),
        None => format!("<{}>", uri),
    }
}

/// Builds requests for one profile bound to one listening point.
pub struct RequestBuilder<'a> {
    profile: &'a SipProfile,
    listening_point: ListeningPoint,
    custom_headers: &'a HashMap<String, String>,
}

impl<'a> RequestBuilder<'a> {
    /// Fails with `MalformedAddress` when the profile has no usable local IP.
    pub fn new(
        profile: &'a SipProfile,
        bound_port: u16,
        custom_headers: &'a HashMap<String, String>,
    ) -> Result<Self, SipError> {
        let ip = profile.local_ip_addr()?;
        let protocol = profile.transport_protocol()?;
        Ok(Self {
            profile,
            listening_point: ListeningPoint::new(ip, bound_port, protocol),
            custom_headers,
        })
    }

    pub fn listening_point(&self) -> &ListeningPoint {
        &self.listening_point
    }

    /// Resolve a dial target (`bob`, `bob@host`, `sip:bob@host`) to a URI string
    pub fn resolve_target(&self, to: &str) -> Result<String, SipError> {
        SipUri::from_target(to, self.profile.remote_ip(), self.profile.remote_port())
            .map(|uri| uri.to_string())
            .map_err(SipError::MalformedAddress)
    }

    fn require_user(&self) -> Result<&str, SipError> {
        let user = self.profile.sip_user_name();
        if user.is_empty() {
            return Err(SipError::MalformedAddress("SIP user name is empty".to_string()));
        }
        Ok(user)
    }

    fn require_remote(&self) -> Result<(), SipError> {
        if self.profile.remote_ip().is_empty() || self.profile.remote_port() == 0 {
            return Err(SipError::MalformedAddress(format!(
                "remote address {:?} is incomplete",
                self.profile.remote_host_port()
            )));
        }
        Ok(())
    }

    fn route(&self) -> Header {
        Header::Route(
            format!(
                "<sip:{};transport={};lr>",
                self.profile.remote_host_port(),
                self.listening_point.protocol.param()
            )
            .into(),
        )
    }

    fn contact(&self, user: &str) -> Header {
        Header::Contact(self.listening_point.contact(user).into())
    }

    /// Via, Max-Forwards, From, To, Call-ID, CSeq
    #[allow(clippy::too_many_arguments)]
    fn leading_headers(
        &self,
        branch: &str,
        from_uri: &str,
        from_tag: &str,
        to_uri: &str,
        to_tag: Option<&str>,
        call_id: &str,
        cseq: u32,
        method: &Method,
    ) -> Vec<Header> {
        vec![
            Header::Via(self.listening_point.via(branch).into()),
            Header::MaxForwards(MAX_FORWARDS.to_string().into()),
            Header::From(name_addr(from_uri, Some(from_tag)).into()),
            Header::To(name_addr(to_uri, to_tag).into()),
            Header::CallId(call_id.to_string().into()),
            Header::CSeq(format!("{} {}", cseq, method).into()),
        ]
    }

    fn finish(
        method: Method,
        uri: rsip::Uri,
        mut headers: Vec<Header>,
        content_type: Option<&str>,
        body: Vec<u8>,
    ) -> SipRequest {
        if let Some(content_type) = content_type {
            headers.push(Header::ContentType(content_type.to_string().into()));
        }
        headers.push(Header::ContentLength(body.len().to_string().into()));

        SipRequest::new(Request {
            method,
            uri,
            version: Version::V2,
            headers: Headers::from(headers),
            body,
        })
    }

    /// Initial REGISTER: CSeq 1, Expires 300, fresh Call-ID and tag
    pub fn register(&self) -> Result<SipRequest, SipError> {
        self.register_with(&RegisterParams::fresh(REGISTER_EXPIRES))
    }

    /// REGISTER within an existing registration chain (auth retry, refresh, expires 0)
    pub fn register_with(&self, params: &RegisterParams) -> Result<SipRequest, SipError> {
        let user = self.require_user()?;
        self.require_remote()?;

        let aor = self.profile.aor();
        let uri = parse_uri(&aor)?;

        let mut headers = self.leading_headers(
            &generate_branch(),
            &aor,
            &params.from_tag,
            &aor,
            None,
            &params.call_id,
            params.cseq,
            &Method::Register,
        );
        headers.push(self.contact(user));
        headers.push(Header::Expires(params.expires.to_string().into()));
        if let Some(credential) = &params.credential {
            headers.push(credential.header());
        }

        Ok(Self::finish(Method::Register, uri, headers, None, Vec::new()))
    }

    /// Dialog for a new outbound call to `to`
    pub fn new_dialog(&self, to: &str, local_rtp_port: u16) -> Result<Dialog, SipError> {
        self.require_user()?;
        self.require_remote()?;
        let target = self.resolve_target(to)?;
        parse_uri(&target)?;
        Ok(Dialog::outbound(self.profile.aor(), target, local_rtp_port))
    }

    /// INVITE for `dialog`, carrying an SDP offer on the dialog's RTP port
    pub fn invite(&self, dialog: &Dialog, credential: Option<&Credential>) -> Result<SipRequest, SipError> {
        let user = self.require_user()?;
        let port = dialog
            .local_rtp_port
            .ok_or_else(|| SipError::SdpConstruction("dialog has no local RTP port".to_string()))?;
        let sdp = SdpSession::create_audio_session(self.listening_point.ip, port)?;
        let uri = parse_uri(&dialog.invite_uri)?;

        let mut headers = self.leading_headers(
            &dialog.invite_branch,
            &dialog.local_uri,
            &dialog.local_tag,
            &dialog.remote_uri,
            None,
            &dialog.call_id,
            dialog.invite_cseq,
            &Method::Invite,
        );
        headers.push(self.route());
        headers.push(Header::Supported(SUPPORTED.into()));

        let mut custom: Vec<_> = self.custom_headers.iter().collect();
        custom.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in custom {
            headers.push(Header::Other(name.clone(), value.clone()));
        }

        headers.push(self.contact(user));
        headers.push(Header::Other(
            "Call-Info".to_string(),
            format!("<sip:{}>;purpose=info", self.profile.remote_host_port()),
        ));
        if let Some(credential) = credential {
            headers.push(credential.header());
        }

        Ok(Self::finish(
            Method::Invite,
            uri,
            headers,
            Some("application/sdp"),
            sdp.to_string().into_bytes(),
        ))
    }

    /// Out-of-dialog MESSAGE using the pager's current CSeq
    pub fn message(
        &self,
        pager: &PagerSession,
        text: &str,
        credential: Option<&Credential>,
    ) -> Result<SipRequest, SipError> {
        let user = self.require_user()?;
        self.require_remote()?;
        let uri = parse_uri(&pager.remote_uri)?;

        let mut headers = self.leading_headers(
            &generate_branch(),
            &self.profile.aor(),
            &pager.local_tag,
            &pager.remote_uri,
            None,
            &pager.call_id,
            pager.cseq,
            &Method::Message,
        );
        headers.push(self.route());
        headers.push(Header::Supported(SUPPORTED.into()));
        headers.push(self.contact(user));
        if let Some(credential) = credential {
            headers.push(credential.header());
        }

        Ok(Self::finish(
            Method::Message,
            uri,
            headers,
            Some("text/plain"),
            text.as_bytes().to_vec(),
        ))
    }

    /// In-dialog request with the given CSeq
    fn in_dialog(
        &self,
        dialog: &Dialog,
        method: Method,
        cseq: u32,
        content_type: Option<&str>,
        body: Vec<u8>,
    ) -> Result<SipRequest, SipError> {
        let user = self.require_user()?;
        let uri = parse_uri(&dialog.remote_target)?;

        let mut headers = self.leading_headers(
            &generate_branch(),
            &dialog.local_uri,
            &dialog.local_tag,
            &dialog.remote_uri,
            dialog.remote_tag.as_deref(),
            &dialog.call_id,
            cseq,
            &method,
        );
        headers.push(self.route());
        headers.push(self.contact(user));

        Ok(Self::finish(method, uri, headers, content_type, body))
    }

    /// ACK for a 2xx to our INVITE
    pub fn ack(&self, dialog: &Dialog) -> Result<SipRequest, SipError> {
        self.in_dialog(dialog, Method::Ack, dialog.invite_cseq, None, Vec::new())
    }

    /// ACK for a non-2xx final response; same branch as the INVITE
    pub fn ack_for_failure(&self, dialog: &Dialog, response: &SipResponse) -> Result<SipRequest, SipError> {
        let uri = parse_uri(&dialog.invite_uri)?;
        let to = response
            .to_header()
            .unwrap_or_else(|| name_addr(&dialog.remote_uri, None));

        let mut headers = self.leading_headers(
            &dialog.invite_branch,
            &dialog.local_uri,
            &dialog.local_tag,
            &dialog.remote_uri,
            None,
            &dialog.call_id,
            dialog.invite_cseq,
            &Method::Ack,
        );
        for header in headers.iter_mut() {
            if let Header::To(_) = header {
                *header = Header::To(to.clone().into());
            }
        }
        headers.push(self.route());

        Ok(Self::finish(Method::Ack, uri, headers, None, Vec::new()))
    }

    /// BYE with the given CSeq (callers bump `Dialog::next_cseq`)
    pub fn bye(&self, dialog: &Dialog, cseq: u32) -> Result<SipRequest, SipError> {
        self.in_dialog(dialog, Method::Bye, cseq, None, Vec::new())
    }

    /// CANCEL for our pending INVITE: same Request-URI, branch and CSeq number
    pub fn cancel(&self, dialog: &Dialog) -> Result<SipRequest, SipError> {
        let uri = parse_uri(&dialog.invite_uri)?;
        let mut headers = self.leading_headers(
            &dialog.invite_branch,
            &dialog.local_uri,
            &dialog.local_tag,
            &dialog.remote_uri,
            None,
            &dialog.call_id,
            dialog.invite_cseq,
            &Method::Cancel,
        );
        headers.push(self.route());

        Ok(Self::finish(Method::Cancel, uri, headers, None, Vec::new()))
    }

    /// INFO carrying one DTMF digit as `application/dtmf-relay`
    pub fn info_dtmf(&self, dialog: &Dialog, cseq: u32, digit: DtmfDigit) -> Result<SipRequest, SipError> {
        self.in_dialog(
            dialog,
            Method::Info,
            cseq,
            Some("application/dtmf-relay"),
            digit.relay_body(DTMF_DURATION_MS).into_bytes(),
        )
    }

    /// 200 OK to an inbound INVITE with our SDP answer
    pub fn answer(&self, dialog: &Dialog, invite: &SipRequest, local_rtp_port: u16) -> Result<SipResponse, SipError> {
        let user = self.require_user()?;
        let sdp = SdpSession::create_audio_session(self.listening_point.ip, local_rtp_port)?;

        ResponseBuilder::ok()
            .to_tag(&dialog.local_tag)
            .header(self.contact(user))
            .header(Header::ContentType("application/sdp".into()))
            .body(sdp.to_string().into_bytes())
            .build_for_request(invite)
    }

    /// 180 Ringing to an inbound INVITE
    pub fn ringing(&self, dialog: &Dialog, invite: &SipRequest) -> Result<SipResponse, SipError> {
        let user = self.require_user()?;
        ResponseBuilder::new(180)
            .to_tag(&dialog.local_tag)
            .header(self.contact(user))
            .build_for_request(invite)
    }
}

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    to_tag: Option<String>,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            to_tag: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn busy_here() -> Self {
        Self::new(486)
    }

    pub fn decline() -> Self {
        Self::new(603)
    }

    pub fn request_terminated() -> Self {
        Self::new(487)
    }

    pub fn call_does_not_exist() -> Self {
        Self::new(481)
    }

    /// Tag added to the To header when the request has none
    pub fn to_tag(mut self, tag: &str) -> Self {
        self.to_tag = Some(tag.to_string());
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut headers = Vec::new();

        // Copy essential headers from request
        for header in request.headers().iter() {
            match header {
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                    headers.push(header.clone());
                }
                Header::To(to) => match &self.to_tag {
                    Some(tag) if request.to_tag().is_none() => {
                        headers.push(Header::To(format!("{};tag={}", to.value(), tag).into()));
                    }
                    _ => headers.push(header.clone()),
                },
                _ => {}
            }
        }

        headers.extend(self.headers);
        headers.push(Header::ContentLength(self.body.len().to_string().into()));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}
