//! Session manager integration tests
//!
//! Drive the manager with canned responses and requests and check both the
//! wire output and the events it emits.

mod common;

use common::*;
use restcomm_sip::domain::session::{SessionState, SipEvent, SipEventKind};
use restcomm_sip::infrastructure::protocols::sip::{SipError, SipSessionManager};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

async fn setup_with_headers(
    headers: HashMap<String, String>,
) -> (SipSessionManager, mpsc::UnboundedReceiver<SipEvent>, RecordingTransport) {
    let (tx, rx) = mpsc::unbounded_channel();
    let manager = SipSessionManager::new(tx);
    let transport = RecordingTransport::new();
    manager
        .bind(alice(), Arc::new(transport.clone()), headers)
        .await
        .unwrap();
    (manager, rx, transport)
}

async fn setup() -> (SipSessionManager, mpsc::UnboundedReceiver<SipEvent>, RecordingTransport) {
    setup_with_headers(HashMap::new()).await
}

fn next_kind(rx: &mut mpsc::UnboundedReceiver<SipEvent>) -> Option<SipEventKind> {
    rx.try_recv().ok().map(|e| e.kind)
}

/// Outbound call answered by bob at 192.0.2.20:30000
async fn connected_call(
    manager: &SipSessionManager,
    rx: &mut mpsc::UnboundedReceiver<SipEvent>,
    transport: &RecordingTransport,
) -> String {
    manager.call("bob@example.com", 4000).await.unwrap();
    let invite = transport.last_request("INVITE");
    manager
        .handle_incoming(response_to(&invite, 200, &[], &sdp_answer("192.0.2.20", 30000)))
        .await
        .unwrap();
    assert_eq!(next_kind(rx), Some(SipEventKind::CallConnected));
    invite
}

#[tokio::test]
async fn test_register_targets_registrar() {
    let (manager, mut rx, transport) = setup().await;

    manager.register().await.unwrap();
    assert_eq!(manager.state().await, SessionState::Registering);

    let register = transport.last_request("REGISTER");
    assert!(register.starts_with("REGISTER sip:alice@23.23.228.238:5060 SIP/2.0\r\n"));
    assert_eq!(header(&register, "CSeq").as_deref(), Some("1 REGISTER"));
    assert_eq!(header(&register, "Max-Forwards").as_deref(), Some("70"));
    assert_eq!(header(&register, "Expires").as_deref(), Some("300"));
    assert_eq!(transport.destinations(), vec![REGISTRAR.parse().unwrap()]);

    manager
        .handle_incoming(response_to(&register, 200, &[], ""))
        .await
        .unwrap();

    let event = rx.try_recv().unwrap();
    assert_eq!(event.kind, SipEventKind::Registered);
    assert_eq!(event.status, Some(200));
    assert_eq!(manager.state().await, SessionState::Registered);
    assert!(manager.is_registered().await);
}

#[tokio::test]
async fn test_register_answers_one_challenge() {
    let (manager, mut rx, transport) = setup().await;
    manager.register().await.unwrap();
    let first = transport.last_request("REGISTER");

    let challenge = [("WWW-Authenticate", r#"Digest realm="restcomm", nonce="abc123""#)];
    manager
        .handle_incoming(response_to(&first, 401, &challenge, ""))
        .await
        .unwrap();

    let retry = transport.last_request("REGISTER");
    assert_eq!(transport.requests("REGISTER").len(), 2);
    assert_eq!(header(&retry, "CSeq").as_deref(), Some("2 REGISTER"));
    assert_eq!(header(&retry, "Call-ID"), header(&first, "Call-ID"));
    let authorization = header(&retry, "Authorization").unwrap();
    assert!(authorization.contains(r#"username="alice""#));
    assert!(authorization.contains(r#"uri="sip:alice@23.23.228.238:5060""#));
    assert!(next_kind(&mut rx).is_none());

    // A second challenge is a failure, not another retry
    manager
        .handle_incoming(response_to(&retry, 401, &challenge, ""))
        .await
        .unwrap();
    assert_eq!(transport.requests("REGISTER").len(), 2);
    assert_eq!(next_kind(&mut rx), Some(SipEventKind::RegistrationFailed));
    assert_eq!(manager.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_register_transport_failure_becomes_event() {
    let (manager, mut rx, transport) = setup().await;
    transport.fail_sends();

    manager.register().await.unwrap();
    assert_eq!(next_kind(&mut rx), Some(SipEventKind::RegistrationFailed));
    assert_eq!(manager.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_unregister_returns_to_idle() {
    let (manager, mut rx, transport) = setup().await;
    manager.register().await.unwrap();
    let register = transport.last_request("REGISTER");
    manager
        .handle_incoming(response_to(&register, 200, &[], ""))
        .await
        .unwrap();
    assert_eq!(next_kind(&mut rx), Some(SipEventKind::Registered));

    manager.unregister().await.unwrap();
    let unregister = transport.last_request("REGISTER");
    assert_eq!(header(&unregister, "Expires").as_deref(), Some("0"));
    assert_eq!(header(&unregister, "CSeq").as_deref(), Some("2 REGISTER"));

    manager
        .handle_incoming(response_to(&unregister, 200, &[], ""))
        .await
        .unwrap();
    assert_eq!(manager.state().await, SessionState::Idle);
    assert!(!manager.is_registered().await);
}

/// register() immediately followed by unregister(), 200 for the unregister first
#[tokio::test]
async fn test_unregister_while_registering() {
    let (manager, mut rx, transport) = setup().await;
    manager.register().await.unwrap();
    let register = transport.last_request("REGISTER");
    manager.unregister().await.unwrap();
    let unregister = transport.last_request("REGISTER");
    assert_eq!(manager.state().await, SessionState::Registering);

    manager
        .handle_incoming(response_to(&unregister, 200, &[], ""))
        .await
        .unwrap();
    assert_eq!(manager.state().await, SessionState::Idle);

    // The late answer to the first REGISTER is stale
    manager
        .handle_incoming(response_to(&register, 200, &[], ""))
        .await
        .unwrap();
    assert!(next_kind(&mut rx).is_none());
    assert_eq!(manager.state().await, SessionState::Idle);
    assert!(!manager.is_registered().await);

    manager.call("bob@example.com", 4000).await.unwrap();
    assert_eq!(manager.state().await, SessionState::Calling);
}

#[tokio::test]
async fn test_unregister_while_registering_late_answer_first() {
    let (manager, mut rx, transport) = setup().await;
    manager.register().await.unwrap();
    let register = transport.last_request("REGISTER");
    manager.unregister().await.unwrap();
    let unregister = transport.last_request("REGISTER");
    assert_eq!(header(&unregister, "CSeq").as_deref(), Some("2 REGISTER"));

    manager
        .handle_incoming(response_to(&register, 200, &[], ""))
        .await
        .unwrap();
    assert!(next_kind(&mut rx).is_none());
    assert!(!manager.is_registered().await);

    manager
        .handle_incoming(response_to(&unregister, 200, &[], ""))
        .await
        .unwrap();
    assert!(next_kind(&mut rx).is_none());
    assert_eq!(manager.state().await, SessionState::Idle);

    // Inbound calls are answered again rather than refused as busy
    manager
        .handle_incoming(inbound_invite("in-after-unreg", 1, &sdp_answer("192.0.2.7", 30002)))
        .await
        .unwrap();
    assert_eq!(transport.responses(486).len(), 0);
    assert_eq!(next_kind(&mut rx), Some(SipEventKind::LocalRinging));
}

#[tokio::test]
async fn test_outbound_call_lifecycle() {
    let (manager, mut rx, transport) = setup().await;

    manager.call("bob@example.com", 4000).await.unwrap();
    assert_eq!(manager.state().await, SessionState::Calling);

    let invite = transport.last_request("INVITE");
    assert!(invite.starts_with("INVITE sip:bob@example.com SIP/2.0\r\n"));
    assert!(body(&invite).contains("m=audio 4000 RTP/AVP 0"));
    assert!(body(&invite).contains("c=IN IP4 10.0.0.2"));

    manager
        .handle_incoming(response_to(&invite, 100, &[], ""))
        .await
        .unwrap();
    assert!(next_kind(&mut rx).is_none());

    manager
        .handle_incoming(response_to(&invite, 180, &[], ""))
        .await
        .unwrap();
    manager
        .handle_incoming(response_to(&invite, 180, &[], ""))
        .await
        .unwrap();
    assert_eq!(next_kind(&mut rx), Some(SipEventKind::LocalRinging));
    assert!(next_kind(&mut rx).is_none());
    assert_eq!(manager.state().await, SessionState::Ringing);

    let answer = response_to(&invite, 200, &[], &sdp_answer("192.0.2.20", 30000));
    manager.handle_incoming(answer).await.unwrap();

    let event = rx.try_recv().unwrap();
    assert_eq!(event.kind, SipEventKind::CallConnected);
    assert_eq!(event.remote_rtp_port, Some(30000));
    assert_eq!(event.remote_ip, Some("192.0.2.20".parse::<IpAddr>().unwrap()));
    assert_eq!(event.from, "sip:bob@example.com");
    assert_eq!(manager.state().await, SessionState::Connected);

    let ack = transport.last_request("ACK");
    assert_eq!(header(&ack, "CSeq").as_deref(), Some("1 ACK"));
    assert!(header(&ack, "To").unwrap().contains("tag=remote1"));

    // Retransmitted 2xx is acknowledged again without a second event
    let again = response_to(&invite, 200, &[], &sdp_answer("192.0.2.20", 30000));
    manager.handle_incoming(again).await.unwrap();
    assert_eq!(transport.requests("ACK").len(), 2);
    assert!(next_kind(&mut rx).is_none());

    manager.hangup().await.unwrap();
    let bye = transport.last_request("BYE");
    assert_eq!(header(&bye, "CSeq").as_deref(), Some("2 BYE"));
    assert_eq!(manager.state().await, SessionState::Idle);
    assert!(manager.active_call_id().await.is_none());
}

#[tokio::test]
async fn test_call_failures_map_to_events() {
    for (status, kind) in [
        (486, SipEventKind::BusyHere),
        (600, SipEventKind::BusyHere),
        (603, SipEventKind::Declined),
        (503, SipEventKind::ServiceUnavailable),
        (404, SipEventKind::ServiceUnavailable),
    ] {
        let (manager, mut rx, transport) = setup().await;
        manager.call("bob", 4000).await.unwrap();
        let invite = transport.last_request("INVITE");

        manager
            .handle_incoming(response_to(&invite, status, &[], ""))
            .await
            .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, kind, "status {}", status);
        assert_eq!(event.status, Some(status));
        assert_eq!(manager.state().await, SessionState::Idle);

        let ack = transport.last_request("ACK");
        assert_eq!(header(&ack, "CSeq").as_deref(), Some("1 ACK"));
        assert_eq!(header(&ack, "Via"), header(&invite, "Via"));
    }
}

#[tokio::test]
async fn test_invite_transport_failure_becomes_event() {
    let (manager, mut rx, transport) = setup().await;
    transport.fail_sends();

    manager.call("bob", 4000).await.unwrap();
    assert_eq!(next_kind(&mut rx), Some(SipEventKind::ServiceUnavailable));
    assert_eq!(manager.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_answer_without_sdp_is_hung_up() {
    let (manager, mut rx, transport) = setup().await;
    manager.call("bob", 4000).await.unwrap();
    let invite = transport.last_request("INVITE");

    manager
        .handle_incoming(response_to(&invite, 200, &[], ""))
        .await
        .unwrap();

    assert_eq!(transport.requests("ACK").len(), 1);
    assert_eq!(transport.requests("BYE").len(), 1);
    assert_eq!(next_kind(&mut rx), Some(SipEventKind::ServiceUnavailable));
    assert_eq!(manager.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_invite_answers_proxy_challenge() {
    let (manager, mut rx, transport) = setup().await;
    manager.call("bob", 4000).await.unwrap();
    let first = transport.last_request("INVITE");

    let challenge = [(
        "Proxy-Authenticate",
        r#"Digest realm="restcomm", nonce="n0nce", qop="auth""#,
    )];
    manager
        .handle_incoming(response_to(&first, 407, &challenge, ""))
        .await
        .unwrap();

    assert_eq!(transport.requests("ACK").len(), 1);
    let retry = transport.last_request("INVITE");
    assert_eq!(header(&retry, "CSeq").as_deref(), Some("2 INVITE"));
    assert_eq!(header(&retry, "Call-ID"), header(&first, "Call-ID"));
    assert_ne!(header(&retry, "Via"), header(&first, "Via"));
    let credentials = header(&retry, "Proxy-Authorization").unwrap();
    assert!(credentials.contains("qop=auth"));
    assert!(credentials.contains(r#"uri="sip:bob@23.23.228.238:5060""#));

    assert!(next_kind(&mut rx).is_none());
    assert_eq!(manager.state().await, SessionState::Calling);
}

#[tokio::test]
async fn test_hangup_while_ringing_cancels() {
    let (manager, mut rx, transport) = setup().await;
    manager.call("bob", 4000).await.unwrap();
    let invite = transport.last_request("INVITE");
    manager
        .handle_incoming(response_to(&invite, 180, &[], ""))
        .await
        .unwrap();
    assert_eq!(next_kind(&mut rx), Some(SipEventKind::LocalRinging));

    manager.hangup().await.unwrap();
    let cancel = transport.last_request("CANCEL");
    assert_eq!(header(&cancel, "CSeq").as_deref(), Some("1 CANCEL"));
    assert_eq!(header(&cancel, "Via"), header(&invite, "Via"));
    assert_eq!(manager.state().await, SessionState::Idle);

    // The 487 for the cancelled INVITE is acknowledged silently
    manager
        .handle_incoming(response_to(&invite, 487, &[], ""))
        .await
        .unwrap();
    assert_eq!(transport.requests("ACK").len(), 1);
    assert!(next_kind(&mut rx).is_none());
}

#[tokio::test]
async fn test_cancel_waits_for_provisional_response() {
    let (manager, mut rx, transport) = setup().await;
    manager.call("bob", 4000).await.unwrap();
    let invite = transport.last_request("INVITE");

    manager.hangup().await.unwrap();
    assert!(transport.requests("CANCEL").is_empty());
    assert_eq!(manager.state().await, SessionState::Idle);

    manager
        .handle_incoming(response_to(&invite, 100, &[], ""))
        .await
        .unwrap();
    let cancel = transport.last_request("CANCEL");
    assert_eq!(header(&cancel, "CSeq").as_deref(), Some("1 CANCEL"));
    assert_eq!(header(&cancel, "Via"), header(&invite, "Via"));

    // Later provisionals do not repeat it
    manager
        .handle_incoming(response_to(&invite, 180, &[], ""))
        .await
        .unwrap();
    assert_eq!(transport.requests("CANCEL").len(), 1);

    manager
        .handle_incoming(response_to(&invite, 487, &[], ""))
        .await
        .unwrap();
    assert_eq!(transport.requests("ACK").len(), 1);
    assert!(next_kind(&mut rx).is_none());
}

#[tokio::test]
async fn test_cancelled_call_answered_anyway() {
    let (manager, mut rx, transport) = setup().await;
    manager.call("bob", 4000).await.unwrap();
    let invite = transport.last_request("INVITE");
    manager
        .handle_incoming(response_to(&invite, 180, &[], ""))
        .await
        .unwrap();
    assert_eq!(next_kind(&mut rx), Some(SipEventKind::LocalRinging));
    manager.hangup().await.unwrap();
    assert_eq!(transport.requests("CANCEL").len(), 1);

    let ok = response_to(&invite, 200, &[], &sdp_answer("192.0.2.20", 30000));
    manager.handle_incoming(ok).await.unwrap();
    assert_eq!(transport.requests("ACK").len(), 1);
    assert_eq!(transport.requests("BYE").len(), 1);

    // The retransmitted 2xx is ACKed again, the BYE is not repeated
    let ok = response_to(&invite, 200, &[], &sdp_answer("192.0.2.20", 30000));
    manager.handle_incoming(ok).await.unwrap();
    assert_eq!(transport.requests("ACK").len(), 2);
    assert_eq!(transport.requests("BYE").len(), 1);
    assert!(next_kind(&mut rx).is_none());
    assert_eq!(manager.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_retransmitted_invite_after_answer_repeats_ok() {
    let (manager, mut rx, transport) = setup().await;
    manager
        .handle_incoming(inbound_invite("in-rt", 1, &sdp_answer("192.0.2.7", 30002)))
        .await
        .unwrap();
    assert_eq!(next_kind(&mut rx), Some(SipEventKind::LocalRinging));
    manager.accept_call(4002).await.unwrap();
    assert_eq!(next_kind(&mut rx), Some(SipEventKind::CallConnected));

    manager
        .handle_incoming(inbound_invite("in-rt", 1, &sdp_answer("192.0.2.7", 30002)))
        .await
        .unwrap();
    let answers = transport.responses(200);
    assert_eq!(answers.len(), 2);
    assert_eq!(answers[0], answers[1]);
    assert!(next_kind(&mut rx).is_none());
    assert_eq!(manager.state().await, SessionState::Connected);
}

#[tokio::test]
async fn test_inbound_call_accepted_then_bye() {
    let (manager, mut rx, transport) = setup().await;

    manager
        .handle_incoming(inbound_invite("in-1", 1, &sdp_answer("192.0.2.7", 30002)))
        .await
        .unwrap();
    assert_eq!(transport.responses(180).len(), 1);

    let ringing = rx.try_recv().unwrap();
    assert_eq!(ringing.kind, SipEventKind::LocalRinging);
    assert_eq!(ringing.from, "sip:bob@example.com");
    assert_eq!(manager.state().await, SessionState::Ringing);

    // Retransmission of the same INVITE only repeats the 180
    manager
        .handle_incoming(inbound_invite("in-1", 1, &sdp_answer("192.0.2.7", 30002)))
        .await
        .unwrap();
    assert!(next_kind(&mut rx).is_none());
    assert_eq!(transport.responses(180).len(), 2);

    manager.accept_call(4002).await.unwrap();
    let ok = transport.responses(200).pop().unwrap();
    assert!(body(&ok).contains("m=audio 4002 RTP/AVP 0"));
    let local_tag = header(&ok, "To")
        .and_then(|to| to.split("tag=").nth(1).map(str::to_string))
        .unwrap();

    let connected = rx.try_recv().unwrap();
    assert_eq!(connected.kind, SipEventKind::CallConnected);
    assert_eq!(connected.remote_rtp_port, Some(30002));
    assert_eq!(connected.remote_ip, Some("192.0.2.7".parse::<IpAddr>().unwrap()));
    assert_eq!(manager.state().await, SessionState::Connected);

    manager
        .handle_incoming(inbound_request("ACK", "in-1", 1, Some(&local_tag)))
        .await
        .unwrap();
    manager
        .handle_incoming(inbound_request("BYE", "in-1", 2, Some(&local_tag)))
        .await
        .unwrap();

    assert_eq!(transport.responses(200).len(), 2);
    assert_eq!(next_kind(&mut rx), Some(SipEventKind::Bye));
    assert_eq!(manager.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_inbound_call_rejected() {
    let (manager, mut rx, transport) = setup().await;
    manager
        .handle_incoming(inbound_invite("in-2", 1, &sdp_answer("192.0.2.7", 30002)))
        .await
        .unwrap();
    assert_eq!(next_kind(&mut rx), Some(SipEventKind::LocalRinging));

    manager.reject_call().await.unwrap();
    assert_eq!(transport.responses(603).len(), 1);
    assert_eq!(next_kind(&mut rx), Some(SipEventKind::Declined));
    assert_eq!(manager.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_inbound_cancel() {
    let (manager, mut rx, transport) = setup().await;
    manager
        .handle_incoming(inbound_invite("in-3", 1, &sdp_answer("192.0.2.7", 30002)))
        .await
        .unwrap();
    assert_eq!(next_kind(&mut rx), Some(SipEventKind::LocalRinging));

    manager
        .handle_incoming(inbound_request("CANCEL", "in-3", 1, None))
        .await
        .unwrap();

    assert_eq!(transport.responses(200).len(), 1);
    assert_eq!(transport.responses(487).len(), 1);
    assert_eq!(next_kind(&mut rx), Some(SipEventKind::Cancelled));
    assert_eq!(manager.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_inbound_invite_while_busy() {
    let (manager, mut rx, transport) = setup().await;
    connected_call(&manager, &mut rx, &transport).await;

    manager
        .handle_incoming(inbound_invite("in-4", 1, &sdp_answer("192.0.2.7", 30002)))
        .await
        .unwrap();

    assert_eq!(transport.responses(486).len(), 1);
    assert!(next_kind(&mut rx).is_none());
    assert_eq!(manager.state().await, SessionState::Connected);
}

#[tokio::test]
async fn test_inbound_invite_without_offer() {
    let (manager, mut rx, transport) = setup().await;
    manager
        .handle_incoming(inbound_invite("in-5", 1, ""))
        .await
        .unwrap();

    assert_eq!(transport.responses(488).len(), 1);
    assert!(next_kind(&mut rx).is_none());
    assert_eq!(manager.state().await, SessionState::Idle);
}

#[tokio::test]
async fn test_bye_for_unknown_dialog() {
    let (manager, mut rx, transport) = setup().await;
    manager
        .handle_incoming(inbound_request("BYE", "nobody", 2, Some("x")))
        .await
        .unwrap();

    assert_eq!(transport.responses(481).len(), 1);
    assert!(next_kind(&mut rx).is_none());
}

#[tokio::test]
async fn test_inbound_message_during_call() {
    let (manager, mut rx, transport) = setup().await;
    connected_call(&manager, &mut rx, &transport).await;

    manager
        .handle_incoming(inbound_message("hello"))
        .await
        .unwrap();

    assert_eq!(transport.responses(200).len(), 1);
    let event = rx.try_recv().unwrap();
    assert_eq!(event.kind, SipEventKind::Message);
    assert_eq!(event.from, "sip:bob@example.com");
    assert_eq!(event.content, "hello");
    assert_eq!(manager.state().await, SessionState::Connected);
}

#[tokio::test]
async fn test_send_message_is_independent_of_call_state() {
    let (manager, mut rx, transport) = setup().await;

    manager.send_message("bob", "hi").await.unwrap();
    let message = transport.last_request("MESSAGE");
    assert!(message.starts_with("MESSAGE sip:bob@23.23.228.238:5060 SIP/2.0\r\n"));
    assert_eq!(header(&message, "Content-Type").as_deref(), Some("text/plain"));
    assert_eq!(header(&message, "CSeq").as_deref(), Some("1 MESSAGE"));
    assert_eq!(body(&message), "hi");

    connected_call(&manager, &mut rx, &transport).await;
    manager.send_message("bob", "still here").await.unwrap();
    let second = transport.last_request("MESSAGE");
    assert_eq!(header(&second, "CSeq").as_deref(), Some("2 MESSAGE"));
    assert_eq!(header(&second, "Call-ID"), header(&message, "Call-ID"));
    assert_eq!(manager.state().await, SessionState::Connected);
}

#[tokio::test]
async fn test_message_failure_reports_text() {
    let (manager, mut rx, transport) = setup().await;
    manager.send_message("bob", "hi").await.unwrap();
    let message = transport.last_request("MESSAGE");

    manager
        .handle_incoming(response_to(&message, 404, &[], ""))
        .await
        .unwrap();

    let event = rx.try_recv().unwrap();
    assert_eq!(event.kind, SipEventKind::MessageFailed);
    assert_eq!(event.from, "sip:bob@23.23.228.238:5060");
    assert_eq!(event.content, "hi");
    assert_eq!(event.status, Some(404));
}

#[tokio::test]
async fn test_dtmf_on_connected_call() {
    let (manager, mut rx, transport) = setup().await;
    connected_call(&manager, &mut rx, &transport).await;

    manager.send_dtmf("#").await.unwrap();
    let info = transport.last_request("INFO");
    assert_eq!(
        header(&info, "Content-Type").as_deref(),
        Some("application/dtmf-relay")
    );
    assert!(body(&info).contains("Signal=#"));
    assert!(matches!(
        manager.send_dtmf("12").await,
        Err(SipError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_custom_headers_on_every_invite() {
    let mut headers = HashMap::new();
    headers.insert("X-Account".to_string(), "42".to_string());
    let (manager, mut rx, transport) = setup_with_headers(headers).await;

    manager.call("bob", 4000).await.unwrap();
    let invite = transport.last_request("INVITE");
    assert_eq!(header(&invite, "X-Account").as_deref(), Some("42"));

    let names = header_names(&invite);
    let supported = names.iter().position(|n| n == "Supported").unwrap();
    assert_eq!(names[supported + 1], "X-Account");
    assert_eq!(names[supported + 2], "Contact");

    // Also on the authenticated resubmission
    let challenge = [("WWW-Authenticate", r#"Digest realm="restcomm", nonce="n1""#)];
    manager
        .handle_incoming(response_to(&invite, 401, &challenge, ""))
        .await
        .unwrap();
    let retry = transport.last_request("INVITE");
    assert_eq!(header(&retry, "X-Account").as_deref(), Some("42"));
    assert!(next_kind(&mut rx).is_none());
}

#[tokio::test]
async fn test_call_connected_rejected_when_idle() {
    let (manager, mut rx, _transport) = setup().await;
    assert!(!manager.dispatch(SipEvent::call_connected(30000, None)).await);
    assert!(next_kind(&mut rx).is_none());
    assert_eq!(manager.state().await, SessionState::Idle);
}
