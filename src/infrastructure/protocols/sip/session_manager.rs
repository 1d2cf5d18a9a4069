//! SIP session manager
//!
//! Owns the registration, the single active dialog and the pager sessions.
//! All of it lives behind one lock, so inbound messages, user operations and
//! state machine events are applied one at a time in arrival order. Accepted
//! events go out on an unbounded channel to exactly one listener.

use super::auth::DigestChallenge;
use super::builder::{Credential, RegisterParams, RequestBuilder, ResponseBuilder, REGISTER_EXPIRES};
use super::dialog::{generate_branch, generate_tag, Dialog, PagerSession};
use super::message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use super::sdp::SdpSession;
use super::transport::{IncomingMessage, OutgoingMessage, Transport};
use crate::domain::profile::SipProfile;
use crate::domain::session::{
    CallDirection, DtmfDigit, SessionState, SessionStateMachine, SessionTrigger, SipEvent,
    SipEventKind,
};
use crate::infrastructure::metrics;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Profile and transport the manager sends through
#[derive(Clone)]
struct Binding {
    profile: SipProfile,
    transport: Arc<dyn Transport>,
    custom_headers: HashMap<String, String>,
    bound_port: u16,
}

impl Binding {
    fn builder(&self) -> Result<RequestBuilder<'_>, SipError> {
        RequestBuilder::new(&self.profile, self.bound_port, &self.custom_headers)
    }

    /// Requests always go to the registrar/proxy
    async fn destination(&self) -> Result<SocketAddr, SipError> {
        let target = self.profile.remote_host_port();
        let mut addrs = tokio::net::lookup_host(target.clone())
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to resolve {}: {}", target, e)))?;
        addrs
            .next()
            .ok_or_else(|| SipError::TransportError(format!("No address for {}", target)))
    }

    async fn send_request(&self, request: &SipRequest) -> Result<(), SipError> {
        let destination = self.destination().await?;
        let method = request.method().map(|m| m.as_str()).unwrap_or("UNKNOWN");
        debug!("Sending {} to {}", method, destination);

        self.transport
            .send(OutgoingMessage {
                data: request.to_bytes(),
                destination,
                protocol: self.transport.protocol(),
            })
            .await?;

        metrics::record_request_sent(method);
        Ok(())
    }

    async fn send_response(&self, response: &SipResponse, destination: SocketAddr) -> Result<(), SipError> {
        debug!("Sending {} to {}", response.status_code(), destination);

        self.transport
            .send(OutgoingMessage {
                data: response.to_bytes(),
                destination,
                protocol: self.transport.protocol(),
            })
            .await?;

        metrics::record_response_sent(response.status_code());
        Ok(())
    }
}

struct Registration {
    params: RegisterParams,
    auth_attempted: bool,
}

/// Non-INVITE transaction timeout (64*T1)
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(32);

/// Idle pager sessions kept for CSeq continuity
const MAX_PAGERS: usize = 64;

struct PendingMessage {
    remote_uri: String,
    text: String,
    auth_attempted: bool,
    sent_at: Instant,
}

#[derive(Default)]
struct SessionInner {
    binding: Option<Binding>,
    machine: SessionStateMachine,
    dialog: Option<Dialog>,
    /// Outbound dialog we cancelled; kept to ACK its final response
    cancelled: Option<Dialog>,
    registration: Option<Registration>,
    pagers: HashMap<String, PagerSession>,
    pending_messages: HashMap<(String, u32), PendingMessage>,
}

impl SessionInner {
    fn binding(&self) -> Result<Binding, SipError> {
        self.binding.clone().ok_or(SipError::NotInitialized)
    }

    /// Remove MESSAGEs that never got a final response, and idle pagers
    /// once there are too many
    fn expire_messages(&mut self, now: Instant) -> Vec<(String, PendingMessage)> {
        let stale: Vec<(String, u32)> = self
            .pending_messages
            .iter()
            .filter(|(_, m)| now.saturating_duration_since(m.sent_at) >= MESSAGE_TIMEOUT)
            .map(|(key, _)| key.clone())
            .collect();
        let expired = stale
            .into_iter()
            .filter_map(|key| {
                let message = self.pending_messages.remove(&key)?;
                Some((key.0, message))
            })
            .collect();

        if self.pagers.len() > MAX_PAGERS {
            let waiting: HashSet<&str> = self
                .pending_messages
                .values()
                .map(|m| m.remote_uri.as_str())
                .collect();
            self.pagers.retain(|uri, _| waiting.contains(uri.as_str()));
        }
        expired
    }

    /// `None` on the event means the active dialog
    fn dialog_matches(&self, event: &SipEvent) -> bool {
        match (&self.dialog, &event.call_id) {
            (Some(_), None) => true,
            (Some(dialog), Some(call_id)) => dialog.matches(call_id),
            (None, _) => false,
        }
    }
}

fn logged<T>(what: &str, result: Result<T, SipError>) -> Result<T, SipError> {
    result.map_err(|e| {
        error!("Failed to build {}: {}", what, e);
        e
    })
}

/// Remote RTP endpoint offered or answered in a message body
fn remote_media(body: &str) -> Option<(IpAddr, u16)> {
    SdpSession::parse(body).and_then(|sdp| sdp.audio_endpoint())
}

pub struct SipSessionManager {
    inner: Mutex<SessionInner>,
    events: mpsc::UnboundedSender<SipEvent>,
}

impl SipSessionManager {
    pub fn new(events: mpsc::UnboundedSender<SipEvent>) -> Self {
        Self {
            inner: Mutex::new(SessionInner::default()),
            events,
        }
    }

    /// Attach the profile and transport. The Contact port is the transport's
    /// bound port when it has one, the profile's local port otherwise.
    pub async fn bind(
        &self,
        profile: SipProfile,
        transport: Arc<dyn Transport>,
        custom_headers: HashMap<String, String>,
    ) -> Result<(), SipError> {
        profile.local_ip_addr()?;
        profile.transport_protocol()?;

        let bound_port = transport
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or_else(|| profile.local_port());

        info!(
            "Session manager bound to {}:{} for {}",
            profile.local_ip(),
            bound_port,
            profile.aor()
        );

        self.inner.lock().await.binding = Some(Binding {
            profile,
            transport,
            custom_headers,
            bound_port,
        });
        Ok(())
    }

    pub async fn is_bound(&self) -> bool {
        self.inner.lock().await.binding.is_some()
    }

    pub async fn profile(&self) -> Option<SipProfile> {
        self.inner.lock().await.binding.as_ref().map(|b| b.profile.clone())
    }

    /// Replace the profile; takes effect from the next request
    pub async fn set_profile(&self, profile: SipProfile) -> Result<(), SipError> {
        let mut inner = self.inner.lock().await;
        let binding = inner.binding.as_mut().ok_or(SipError::NotInitialized)?;
        binding.profile = profile;
        Ok(())
    }

    pub async fn set_custom_headers(&self, custom_headers: HashMap<String, String>) -> Result<(), SipError> {
        let mut inner = self.inner.lock().await;
        let binding = inner.binding.as_mut().ok_or(SipError::NotInitialized)?;
        binding.custom_headers = custom_headers;
        Ok(())
    }

    pub async fn custom_headers(&self) -> HashMap<String, String> {
        self.inner
            .lock()
            .await
            .binding
            .as_ref()
            .map(|b| b.custom_headers.clone())
            .unwrap_or_default()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.machine.state()
    }

    pub async fn is_registered(&self) -> bool {
        self.inner.lock().await.machine.is_registered()
    }

    pub async fn active_call_id(&self) -> Option<String> {
        self.inner.lock().await.dialog.as_ref().map(|d| d.call_id.clone())
    }

    pub async fn call_direction(&self) -> Option<CallDirection> {
        self.inner.lock().await.machine.direction()
    }

    /// Reset the registration flag from a stored snapshot. Ignored during a call.
    pub async fn restore_registration(&self, registered: bool) {
        let mut inner = self.inner.lock().await;
        if inner.machine.state().is_in_call() {
            warn!("Not restoring registration state during a call");
            return;
        }
        inner.machine = SessionStateMachine::restore(registered);
    }

    /// Send REGISTER with Expires 300
    pub async fn register(&self) -> Result<(), SipError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let binding = inner.binding()?;

        let params = RegisterParams::fresh(REGISTER_EXPIRES);
        let request = logged("REGISTER", binding.builder().and_then(|b| b.register_with(&params)))?;
        let call_id = params.call_id.clone();

        inner.registration = Some(Registration {
            params,
            auth_attempted: false,
        });
        if let Err(e) = inner.machine.process(SessionTrigger::RegisterSent) {
            debug!("{}", e);
        }

        info!("Registering {}", binding.profile.aor());
        if let Err(e) = binding.send_request(&request).await {
            warn!("REGISTER could not be sent: {}", e);
            let event = SipEvent::new(SipEventKind::RegistrationFailed)
                .with_call_id(call_id)
                .with_content(e.to_string());
            self.dispatch_locked(inner, event);
        }
        Ok(())
    }

    /// Send REGISTER with Expires 0
    pub async fn unregister(&self) -> Result<(), SipError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let binding = inner.binding()?;

        let params = match inner.registration.take() {
            Some(reg) => RegisterParams {
                cseq: reg.params.cseq + 1,
                expires: 0,
                credential: None,
                ..reg.params
            },
            None => RegisterParams::fresh(0),
        };
        let request = logged("REGISTER", binding.builder().and_then(|b| b.register_with(&params)))?;

        inner.registration = Some(Registration {
            params,
            auth_attempted: false,
        });

        info!("Unregistering {}", binding.profile.aor());
        if let Err(e) = binding.send_request(&request).await {
            warn!("Unregister could not be sent: {}", e);
            inner.registration = None;
            if let Err(e) = inner.machine.process(SessionTrigger::Unregistered) {
                debug!("{}", e);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Place a call. Only allowed while Idle or Registered.
    pub async fn call(&self, to: &str, local_rtp_port: u16) -> Result<(), SipError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let binding = inner.binding()?;

        let state = inner.machine.state();
        if !state.accepts_new_call() {
            return Err(SipError::InvalidState(format!(
                "cannot place a call while {}",
                state.name()
            )));
        }

        let builder = logged("INVITE", binding.builder())?;
        let mut dialog = logged("INVITE", builder.new_dialog(to, local_rtp_port))?;
        let request = logged("INVITE", builder.invite(&dialog, None))?;
        dialog.invite = Some(request.clone());

        inner
            .machine
            .process(SessionTrigger::OutgoingInvite)
            .map_err(SipError::InvalidState)?;
        let call_id = dialog.call_id.clone();
        let remote_uri = dialog.remote_uri.clone();
        inner.dialog = Some(dialog);
        metrics::update_active_calls(true);

        info!("Calling {} (Call-ID {})", remote_uri, call_id);
        if let Err(e) = binding.send_request(&request).await {
            warn!("INVITE could not be sent: {}", e);
            let event = SipEvent::new(SipEventKind::ServiceUnavailable)
                .with_from(remote_uri)
                .with_call_id(call_id)
                .with_content(e.to_string());
            self.dispatch_locked(inner, event);
        }
        Ok(())
    }

    /// Send a MESSAGE; independent of any call
    pub async fn send_message(&self, to: &str, text: &str) -> Result<(), SipError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let binding = inner.binding()?;

        for (call_id, expired) in inner.expire_messages(Instant::now()) {
            warn!("MESSAGE to {} got no final response", expired.remote_uri);
            let event = SipEvent::new(SipEventKind::MessageFailed)
                .with_from(expired.remote_uri)
                .with_content(expired.text)
                .with_call_id(call_id);
            self.dispatch_locked(inner, event);
        }

        let builder = logged("MESSAGE", binding.builder())?;
        let remote_uri = logged("MESSAGE", builder.resolve_target(to))?;

        let pager = inner
            .pagers
            .entry(remote_uri.clone())
            .or_insert_with(|| PagerSession::new(remote_uri.clone()));
        let cseq = pager.next_cseq();
        let request = logged("MESSAGE", builder.message(pager, text, None))?;
        let key = (pager.call_id.clone(), cseq);

        inner.pending_messages.insert(
            key.clone(),
            PendingMessage {
                remote_uri: remote_uri.clone(),
                text: text.to_string(),
                auth_attempted: false,
                sent_at: Instant::now(),
            },
        );

        debug!("Sending MESSAGE to {}", remote_uri);
        if let Err(e) = binding.send_request(&request).await {
            warn!("MESSAGE could not be sent: {}", e);
            inner.pending_messages.remove(&key);
            let event = SipEvent::new(SipEventKind::MessageFailed)
                .with_from(remote_uri)
                .with_content(text)
                .with_call_id(key.0);
            self.dispatch_locked(inner, event);
        }
        Ok(())
    }

    /// Send one DTMF digit as SIP INFO on the connected call
    pub async fn send_dtmf(&self, digit: &str) -> Result<(), SipError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let binding = inner.binding()?;

        if inner.machine.state() != SessionState::Connected {
            return Err(SipError::NotInitialized);
        }
        let digit = DtmfDigit::parse(digit)
            .ok_or_else(|| SipError::InvalidArgument(format!("invalid DTMF digit {:?}", digit)))?;

        let builder = logged("INFO", binding.builder())?;
        let dialog = inner.dialog.as_mut().ok_or(SipError::NotInitialized)?;
        let cseq = dialog.next_cseq();
        let request = logged("INFO", builder.info_dtmf(dialog, cseq, digit))?;

        debug!("Sending DTMF {}", digit.to_char());
        binding.send_request(&request).await
    }

    /// Answer the ringing inbound call with 200 OK and our SDP
    pub async fn accept_call(&self, local_rtp_port: u16) -> Result<(), SipError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let binding = inner.binding()?;
        let state = inner.machine.state();

        let dialog = match inner.dialog.as_mut() {
            Some(d) if d.direction == CallDirection::Inbound && state == SessionState::Ringing => d,
            _ => {
                return Err(SipError::InvalidState(
                    "no inbound call waiting for an answer".to_string(),
                ))
            }
        };
        let invite = dialog
            .invite
            .clone()
            .ok_or_else(|| SipError::InvalidState("inbound dialog without INVITE".to_string()))?;
        let peer = dialog
            .peer_addr
            .ok_or_else(|| SipError::InvalidState("inbound dialog without source".to_string()))?;
        let (remote_ip, remote_port) = dialog
            .remote_media
            .ok_or_else(|| SipError::InvalidState("inbound dialog without SDP offer".to_string()))?;

        let builder = logged("200 OK", binding.builder())?;
        let response = logged("200 OK", builder.answer(dialog, &invite, local_rtp_port))?;
        dialog.local_rtp_port = Some(local_rtp_port);
        dialog.last_response = Some(response.clone());
        let event = SipEvent::call_connected(remote_port, Some(remote_ip))
            .with_from(dialog.remote_uri.clone())
            .with_call_id(dialog.call_id.clone())
            .with_status(200);

        binding.send_response(&response, peer).await?;
        info!("Answered call {}", event.call_id.as_deref().unwrap_or_default());
        self.dispatch_locked(inner, event);
        Ok(())
    }

    /// Decline the ringing inbound call with 603
    pub async fn reject_call(&self) -> Result<(), SipError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let binding = inner.binding()?;
        let state = inner.machine.state();

        let dialog = match inner.dialog.as_ref() {
            Some(d) if d.direction == CallDirection::Inbound && state == SessionState::Ringing => d,
            _ => {
                return Err(SipError::InvalidState(
                    "no inbound call waiting for an answer".to_string(),
                ))
            }
        };
        let event = self.decline_inbound(&binding, dialog).await?;
        self.dispatch_locked(inner, event);
        Ok(())
    }

    async fn decline_inbound(&self, binding: &Binding, dialog: &Dialog) -> Result<SipEvent, SipError> {
        let invite = dialog
            .invite
            .as_ref()
            .ok_or_else(|| SipError::InvalidState("inbound dialog without INVITE".to_string()))?;
        let peer = dialog
            .peer_addr
            .ok_or_else(|| SipError::InvalidState("inbound dialog without source".to_string()))?;

        let response = ResponseBuilder::decline()
            .to_tag(&dialog.local_tag)
            .build_for_request(invite)?;
        binding.send_response(&response, peer).await?;
        info!("Declined call {}", dialog.call_id);

        Ok(SipEvent::new(SipEventKind::Declined)
            .with_from(dialog.remote_uri.clone())
            .with_call_id(dialog.call_id.clone())
            .with_status(603))
    }

    /// End the current call: BYE when connected, CANCEL while our INVITE is
    /// pending, 603 for an unanswered inbound call. No-op without a call.
    pub async fn hangup(&self) -> Result<(), SipError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let binding = inner.binding()?;
        let state = inner.machine.state();

        let mut dialog = match inner.dialog.take() {
            Some(d) if state.is_in_call() => d,
            other => {
                inner.dialog = other;
                debug!("Hangup with no call in progress");
                return Ok(());
            }
        };

        if let Err(e) = inner.machine.process(SessionTrigger::Ended) {
            debug!("{}", e);
        }
        metrics::update_active_calls(false);

        let builder = logged("hangup", binding.builder())?;
        match (state, dialog.direction) {
            (SessionState::Connected, _) => {
                let cseq = dialog.next_cseq();
                let bye = logged("BYE", builder.bye(&dialog, cseq))?;
                info!("Hanging up call {}", dialog.call_id);
                binding.send_request(&bye).await
            }
            (_, CallDirection::Outbound) => {
                info!("Cancelling call {}", dialog.call_id);
                if !dialog.provisional_received {
                    // CANCEL goes out with the first 1xx
                    debug!("CANCEL for {} waits for a provisional response", dialog.call_id);
                    inner.cancelled = Some(dialog);
                    return Ok(());
                }
                let cancel = logged("CANCEL", builder.cancel(&dialog))?;
                inner.cancelled = Some(dialog);
                binding.send_request(&cancel).await
            }
            (_, CallDirection::Inbound) => self.decline_inbound(&binding, &dialog).await.map(|_| ()),
        }
    }

    /// Process a message from the transport receive loop
    pub async fn handle_incoming(&self, incoming: IncomingMessage) -> Result<(), SipError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let binding = inner.binding()?;

        match incoming.message {
            SipMessage::Request(request) => {
                self.handle_request(inner, &binding, request, incoming.source).await
            }
            SipMessage::Response(response) => self.handle_response(inner, &binding, response).await,
        }
    }

    /// Feed an event through the state machine. Returns whether it was accepted.
    pub async fn dispatch(&self, event: SipEvent) -> bool {
        let mut guard = self.inner.lock().await;
        self.dispatch_locked(&mut guard, event)
    }

    fn dispatch_locked(&self, inner: &mut SessionInner, event: SipEvent) -> bool {
        let state = inner.machine.state();

        let accepted = match event.kind {
            SipEventKind::LocalRinging => {
                let direction = inner.dialog.as_ref().map(|d| d.direction);
                if !inner.dialog_matches(&event) {
                    false
                } else {
                    let trigger = match (state, direction) {
                        (SessionState::Calling, Some(CallDirection::Outbound)) => {
                            Some(SessionTrigger::RemoteRinging)
                        }
                        (SessionState::Idle | SessionState::Registered, Some(CallDirection::Inbound)) => {
                            Some(SessionTrigger::IncomingInvite)
                        }
                        _ => None,
                    };
                    trigger.map_or(false, |t| inner.machine.process(t).is_ok())
                }
            }
            SipEventKind::CallConnected => {
                inner.dialog_matches(&event)
                    && matches!(state, SessionState::Calling | SessionState::Ringing)
                    && inner.machine.process(SessionTrigger::Answered).is_ok()
            }
            kind if kind.is_terminal() => {
                let ended = inner.dialog_matches(&event)
                    && state.is_in_call()
                    && inner.machine.process(SessionTrigger::Ended).is_ok();
                if ended {
                    inner.dialog = None;
                    metrics::update_active_calls(false);
                }
                ended
            }
            SipEventKind::Registered => {
                inner.machine.process(SessionTrigger::RegistrationSucceeded).is_ok()
            }
            SipEventKind::RegistrationFailed => {
                inner.registration = None;
                inner.machine.process(SessionTrigger::RegistrationFailed).is_ok()
            }
            _ => true,
        };

        if accepted {
            debug!(
                "Event {} accepted: {} -> {}",
                event.kind.name(),
                state.name(),
                inner.machine.state().name()
            );
            metrics::record_event_dispatched(event.kind.name());
            if self.events.send(event).is_err() {
                warn!("Event listener is gone");
            }
        } else {
            debug!("Event {} dropped in state {}", event.kind.name(), state.name());
            metrics::record_event_dropped(event.kind.name());
        }

        accepted
    }

    async fn respond(
        &self,
        binding: &Binding,
        request: &SipRequest,
        response: ResponseBuilder,
        destination: SocketAddr,
    ) -> Result<(), SipError> {
        let response = response.build_for_request(request)?;
        binding.send_response(&response, destination).await
    }

    async fn handle_request(
        &self,
        inner: &mut SessionInner,
        binding: &Binding,
        request: SipRequest,
        source: SocketAddr,
    ) -> Result<(), SipError> {
        let method = match request.method() {
            Some(method) => method,
            None => {
                debug!("Unsupported method {} from {}", request.inner.method, source);
                return self
                    .respond(binding, &request, ResponseBuilder::new(405), source)
                    .await;
            }
        };
        debug!("Received {} from {}", method, source);

        match method {
            SipMethod::Invite => self.on_invite(inner, binding, request, source).await,
            SipMethod::Ack => {
                let call_id = request.call_id().unwrap_or_default();
                if let Some(dialog) = inner.dialog.as_mut().filter(|d| d.matches(&call_id)) {
                    dialog.confirmed = true;
                }
                Ok(())
            }
            SipMethod::Bye => {
                let call_id = request.call_id().unwrap_or_default();
                let remote = inner
                    .dialog
                    .as_ref()
                    .filter(|d| d.matches(&call_id))
                    .map(|d| d.remote_uri.clone());

                match remote {
                    Some(from) => {
                        self.respond(binding, &request, ResponseBuilder::ok(), source).await?;
                        let event = SipEvent::new(SipEventKind::Bye)
                            .with_from(from)
                            .with_call_id(call_id);
                        self.dispatch_locked(inner, event);
                        Ok(())
                    }
                    None => {
                        self.respond(binding, &request, ResponseBuilder::call_does_not_exist(), source)
                            .await
                    }
                }
            }
            SipMethod::Cancel => self.on_cancel(inner, binding, request, source).await,
            SipMethod::Message => {
                let from = request.from_uri().unwrap_or_default();
                let content = request.body_str();
                self.respond(
                    binding,
                    &request,
                    ResponseBuilder::ok().to_tag(&generate_tag()),
                    source,
                )
                .await?;

                let mut event = SipEvent::message(from, content);
                if let Some(call_id) = request.call_id() {
                    event = event.with_call_id(call_id);
                }
                self.dispatch_locked(inner, event);
                Ok(())
            }
            SipMethod::Info => {
                debug!("INFO body: {}", request.body_str());
                self.respond(binding, &request, ResponseBuilder::ok(), source).await
            }
            SipMethod::Register => {
                self.respond(binding, &request, ResponseBuilder::new(405), source).await
            }
        }
    }

    async fn on_invite(
        &self,
        inner: &mut SessionInner,
        binding: &Binding,
        request: SipRequest,
        source: SocketAddr,
    ) -> Result<(), SipError> {
        let call_id = request
            .call_id()
            .ok_or_else(|| SipError::InvalidMessage("INVITE without Call-ID".to_string()))?;

        if let Some(dialog) = inner.dialog.as_ref().filter(|d| d.matches(&call_id)) {
            return match dialog.last_response.as_ref() {
                Some(last) if dialog.direction == CallDirection::Inbound && !dialog.confirmed => {
                    debug!("Retransmitted INVITE {}, repeating {}", call_id, last.status_code());
                    binding.send_response(last, source).await
                }
                _ => {
                    debug!("Retransmitted INVITE {}", call_id);
                    Ok(())
                }
            };
        }

        if !inner.machine.state().accepts_new_call() {
            info!("Busy, rejecting INVITE {}", call_id);
            return self
                .respond(
                    binding,
                    &request,
                    ResponseBuilder::busy_here().to_tag(&generate_tag()),
                    source,
                )
                .await;
        }

        let Some(offer) = remote_media(&request.body_str()) else {
            warn!("INVITE {} has no usable audio offer", call_id);
            return self
                .respond(
                    binding,
                    &request,
                    ResponseBuilder::new(488).to_tag(&generate_tag()),
                    source,
                )
                .await;
        };

        let mut dialog = Dialog::inbound(&request)
            .ok_or_else(|| SipError::InvalidMessage("INVITE without dialog headers".to_string()))?;
        dialog.peer_addr = Some(source);
        dialog.remote_media = Some(offer);

        let ringing = logged("180 Ringing", binding.builder().and_then(|b| b.ringing(&dialog, &request)))?;
        let from = dialog.remote_uri.clone();
        dialog.last_response = Some(ringing.clone());
        inner.dialog = Some(dialog);

        if let Err(e) = binding.send_response(&ringing, source).await {
            warn!("180 Ringing could not be sent: {}", e);
        }

        info!("Incoming call from {} (Call-ID {})", from, call_id);
        let event = SipEvent::new(SipEventKind::LocalRinging)
            .with_from(from)
            .with_call_id(call_id);
        if self.dispatch_locked(inner, event) {
            metrics::update_active_calls(true);
        } else {
            inner.dialog = None;
        }
        Ok(())
    }

    async fn on_cancel(
        &self,
        inner: &mut SessionInner,
        binding: &Binding,
        request: SipRequest,
        source: SocketAddr,
    ) -> Result<(), SipError> {
        let call_id = request.call_id().unwrap_or_default();
        let state = inner.machine.state();

        let pending = inner
            .dialog
            .as_ref()
            .filter(|d| {
                d.matches(&call_id)
                    && d.direction == CallDirection::Inbound
                    && state == SessionState::Ringing
            })
            .cloned();

        let Some(dialog) = pending else {
            return self
                .respond(binding, &request, ResponseBuilder::call_does_not_exist(), source)
                .await;
        };

        self.respond(binding, &request, ResponseBuilder::ok(), source).await?;
        if let (Some(invite), Some(peer)) = (dialog.invite.as_ref(), dialog.peer_addr) {
            let terminated = ResponseBuilder::request_terminated()
                .to_tag(&dialog.local_tag)
                .build_for_request(invite)?;
            binding.send_response(&terminated, peer).await?;
        }

        info!("Call {} cancelled by {}", call_id, dialog.remote_uri);
        let event = SipEvent::new(SipEventKind::Cancelled)
            .with_from(dialog.remote_uri)
            .with_call_id(call_id)
            .with_status(487);
        self.dispatch_locked(inner, event);
        Ok(())
    }

    async fn handle_response(
        &self,
        inner: &mut SessionInner,
        binding: &Binding,
        response: SipResponse,
    ) -> Result<(), SipError> {
        let Some((cseq, Some(method))) = response.cseq() else {
            debug!("Response without usable CSeq dropped");
            return Ok(());
        };
        debug!("Received {} for {}", response.status_code(), method);

        match method {
            SipMethod::Register => self.on_register_response(inner, binding, response, cseq).await,
            SipMethod::Invite => self.on_invite_response(inner, binding, response).await,
            SipMethod::Message => self.on_message_response(inner, binding, response, cseq).await,
            _ => Ok(()),
        }
    }

    async fn on_register_response(
        &self,
        inner: &mut SessionInner,
        binding: &Binding,
        response: SipResponse,
        cseq: u32,
    ) -> Result<(), SipError> {
        let status = response.status_code();
        let call_id = response.call_id().unwrap_or_default();

        // Only the latest REGISTER of the binding counts
        let Some(reg) = inner
            .registration
            .as_mut()
            .filter(|r| r.params.call_id == call_id && r.params.cseq == cseq)
        else {
            debug!("Stale REGISTER response {} (CSeq {})", status, cseq);
            return Ok(());
        };

        match status {
            100..=199 => Ok(()),
            200..=299 if reg.params.expires == 0 => {
                inner.registration = None;
                if let Err(e) = inner.machine.process(SessionTrigger::Unregistered) {
                    debug!("{}", e);
                }
                info!("Unregistered {}", binding.profile.aor());
                Ok(())
            }
            200..=299 => {
                info!("Registered {}", binding.profile.aor());
                metrics::record_registration(true);
                let event = SipEvent::new(SipEventKind::Registered)
                    .with_from(binding.profile.aor())
                    .with_call_id(call_id)
                    .with_status(status);
                self.dispatch_locked(inner, event);
                Ok(())
            }
            401 | 407 if !reg.auth_attempted => {
                let retry = DigestChallenge::from_response(&response).and_then(|challenge| {
                    let value = challenge.authorize(
                        "REGISTER",
                        &binding.profile.aor(),
                        binding.profile.sip_user_name(),
                        binding.profile.sip_password(),
                    );
                    reg.auth_attempted = true;
                    reg.params.cseq += 1;
                    reg.params.credential = Some(Credential {
                        kind: challenge.kind,
                        value,
                    });
                    binding.builder()?.register_with(&reg.params)
                });

                let sent = match retry {
                    Ok(request) => {
                        debug!("Answering REGISTER challenge");
                        binding.send_request(&request).await
                    }
                    Err(e) => Err(e),
                };

                if let Err(e) = sent {
                    warn!("REGISTER authentication failed: {}", e);
                    metrics::record_registration(false);
                    let event = SipEvent::new(SipEventKind::RegistrationFailed)
                        .with_call_id(call_id)
                        .with_content(e.to_string())
                        .with_status(status);
                    self.dispatch_locked(inner, event);
                }
                Ok(())
            }
            _ => {
                warn!("Registration rejected with {}", status);
                metrics::record_registration(false);
                let event = SipEvent::new(SipEventKind::RegistrationFailed)
                    .with_call_id(call_id)
                    .with_content(format!("SIP {}", status))
                    .with_status(status);
                self.dispatch_locked(inner, event);
                Ok(())
            }
        }
    }

    async fn on_invite_response(
        &self,
        inner: &mut SessionInner,
        binding: &Binding,
        response: SipResponse,
    ) -> Result<(), SipError> {
        let status = response.status_code();
        let call_id = response.call_id().unwrap_or_default();
        let builder = binding.builder()?;

        if let Some(cancelled) = inner.cancelled.as_mut().filter(|d| d.matches(&call_id)) {
            // Kept after the final response so retransmissions are ACKed again
            match status {
                100..=199 if !cancelled.provisional_received => {
                    cancelled.provisional_received = true;
                    debug!("Sending deferred CANCEL for {}", call_id);
                    binding.send_request(&builder.cancel(cancelled)?).await?;
                }
                200..=299 => {
                    cancelled.update_from_response(&response);
                    binding.send_request(&builder.ack(cancelled)?).await?;
                    if cancelled.confirmed {
                        debug!("Retransmitted 2xx for cancelled call {}", call_id);
                    } else {
                        // Answered before our CANCEL arrived
                        cancelled.confirmed = true;
                        let cseq = cancelled.next_cseq();
                        binding.send_request(&builder.bye(cancelled, cseq)?).await?;
                    }
                }
                300.. => {
                    binding
                        .send_request(&builder.ack_for_failure(cancelled, &response)?)
                        .await?;
                }
                _ => {}
            }
            return Ok(());
        }

        let Some(dialog) = inner
            .dialog
            .as_mut()
            .filter(|d| d.matches(&call_id) && d.direction == CallDirection::Outbound)
        else {
            debug!("Stale INVITE response {}", status);
            return Ok(());
        };

        match status {
            100 => {
                dialog.provisional_received = true;
                Ok(())
            }
            101..=199 => {
                dialog.provisional_received = true;
                dialog.update_from_response(&response);
                if status == 180 || status == 183 {
                    let event = SipEvent::new(SipEventKind::LocalRinging)
                        .with_from(dialog.remote_uri.clone())
                        .with_call_id(call_id)
                        .with_status(status);
                    self.dispatch_locked(inner, event);
                }
                Ok(())
            }
            200..=299 => {
                dialog.update_from_response(&response);
                let ack = logged("ACK", builder.ack(dialog))?;
                if let Err(e) = binding.send_request(&ack).await {
                    warn!("ACK could not be sent: {}", e);
                }

                if dialog.confirmed {
                    debug!("Retransmitted 2xx for {}", call_id);
                    return Ok(());
                }
                dialog.confirmed = true;

                let from = dialog.remote_uri.clone();
                match remote_media(&response.body_str()) {
                    Some((ip, port)) => {
                        dialog.remote_media = Some((ip, port));
                        info!("Call {} connected, remote RTP {}:{}", call_id, ip, port);
                        let event = SipEvent::call_connected(port, Some(ip))
                            .with_from(from)
                            .with_call_id(call_id)
                            .with_status(status);
                        self.dispatch_locked(inner, event);
                    }
                    None => {
                        warn!("2xx for {} has no usable SDP answer, hanging up", call_id);
                        let cseq = dialog.next_cseq();
                        let bye = logged("BYE", builder.bye(dialog, cseq))?;
                        if let Err(e) = binding.send_request(&bye).await {
                            warn!("BYE could not be sent: {}", e);
                        }
                        let event = SipEvent::new(SipEventKind::ServiceUnavailable)
                            .with_from(from)
                            .with_call_id(call_id)
                            .with_content("answer without SDP")
                            .with_status(status);
                        self.dispatch_locked(inner, event);
                    }
                }
                Ok(())
            }
            401 | 407 if !dialog.auth_attempted => {
                let ack = logged("ACK", builder.ack_for_failure(dialog, &response))?;
                if let Err(e) = binding.send_request(&ack).await {
                    warn!("ACK could not be sent: {}", e);
                }

                let retry = DigestChallenge::from_response(&response).and_then(|challenge| {
                    let value = challenge.authorize(
                        "INVITE",
                        &dialog.invite_uri,
                        binding.profile.sip_user_name(),
                        binding.profile.sip_password(),
                    );
                    dialog.auth_attempted = true;
                    dialog.invite_cseq = dialog.next_cseq();
                    dialog.invite_branch = generate_branch();
                    let credential = Credential {
                        kind: challenge.kind,
                        value,
                    };
                    builder.invite(dialog, Some(&credential))
                });

                let sent = match retry {
                    Ok(request) => {
                        dialog.invite = Some(request.clone());
                        debug!("Answering INVITE challenge for {}", call_id);
                        binding.send_request(&request).await
                    }
                    Err(e) => Err(e),
                };

                if let Err(e) = sent {
                    warn!("INVITE authentication failed: {}", e);
                    let event = SipEvent::new(SipEventKind::ServiceUnavailable)
                        .with_from(dialog.remote_uri.clone())
                        .with_call_id(call_id)
                        .with_content(e.to_string())
                        .with_status(status);
                    self.dispatch_locked(inner, event);
                }
                Ok(())
            }
            _ => {
                let ack = logged("ACK", builder.ack_for_failure(dialog, &response))?;
                if let Err(e) = binding.send_request(&ack).await {
                    warn!("ACK could not be sent: {}", e);
                }

                if status == 487 {
                    debug!("INVITE {} terminated", call_id);
                    return Ok(());
                }

                let kind = match status {
                    486 | 600 => SipEventKind::BusyHere,
                    603 => SipEventKind::Declined,
                    _ => SipEventKind::ServiceUnavailable,
                };
                info!("Call {} failed with {}", call_id, status);
                let event = SipEvent::new(kind)
                    .with_from(dialog.remote_uri.clone())
                    .with_call_id(call_id)
                    .with_content(format!("SIP {}", status))
                    .with_status(status);
                self.dispatch_locked(inner, event);
                Ok(())
            }
        }
    }

    async fn on_message_response(
        &self,
        inner: &mut SessionInner,
        binding: &Binding,
        response: SipResponse,
        cseq: u32,
    ) -> Result<(), SipError> {
        let status = response.status_code();
        if status < 200 {
            return Ok(());
        }

        let call_id = response.call_id().unwrap_or_default();
        let Some(pending) = inner.pending_messages.remove(&(call_id.clone(), cseq)) else {
            debug!("Stale MESSAGE response {}", status);
            return Ok(());
        };

        if (200..300).contains(&status) {
            debug!("MESSAGE to {} delivered", pending.remote_uri);
            return Ok(());
        }

        if (status == 401 || status == 407) && !pending.auth_attempted {
            if let Some(pager) = inner.pagers.get_mut(&pending.remote_uri) {
                let retry = DigestChallenge::from_response(&response).and_then(|challenge| {
                    let value = challenge.authorize(
                        "MESSAGE",
                        &pending.remote_uri,
                        binding.profile.sip_user_name(),
                        binding.profile.sip_password(),
                    );
                    let credential = Credential {
                        kind: challenge.kind,
                        value,
                    };
                    pager.next_cseq();
                    binding.builder()?.message(pager, &pending.text, Some(&credential))
                });

                if let Ok(request) = retry {
                    let key = (pager.call_id.clone(), pager.cseq);
                    if binding.send_request(&request).await.is_ok() {
                        inner.pending_messages.insert(
                            key,
                            PendingMessage {
                                auth_attempted: true,
                                sent_at: Instant::now(),
                                ..pending
                            },
                        );
                        return Ok(());
                    }
                }
            }
        }

        warn!("MESSAGE to {} failed with {}", pending.remote_uri, status);
        let event = SipEvent::new(SipEventKind::MessageFailed)
            .with_from(pending.remote_uri)
            .with_content(pending.text)
            .with_call_id(call_id)
            .with_status(status);
        self.dispatch_locked(inner, event);
        Ok(())
    }
}
