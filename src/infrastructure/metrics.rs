//! Signaling metrics
//!
//! Counters go through the `metrics` facade; installing a recorder is up to
//! the host application.

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register metric descriptions with the installed recorder
pub fn describe_metrics() {
    describe_counter!(
        "sip_requests_sent_total",
        "Total number of SIP requests handed to the transport"
    );
    describe_counter!(
        "sip_responses_sent_total",
        "Total number of SIP responses handed to the transport"
    );
    describe_counter!(
        "sip_events_dispatched_total",
        "Total number of session events accepted by the state machine"
    );
    describe_counter!(
        "sip_events_dropped_total",
        "Total number of session events rejected by the state machine"
    );
    describe_counter!(
        "sip_registrations_total",
        "Total number of final REGISTER outcomes"
    );
    describe_gauge!("sip_active_calls", "1 while a call is in progress");
}

pub fn record_request_sent(method: &str) {
    counter!("sip_requests_sent_total", "method" => method.to_string()).increment(1);
}

pub fn record_response_sent(status: u16) {
    counter!("sip_responses_sent_total", "status" => status.to_string()).increment(1);
}

pub fn record_event_dispatched(kind: &'static str) {
    counter!("sip_events_dispatched_total", "kind" => kind).increment(1);
}

pub fn record_event_dropped(kind: &'static str) {
    counter!("sip_events_dropped_total", "kind" => kind).increment(1);
}

pub fn record_registration(success: bool) {
    counter!("sip_registrations_total", "success" => success.to_string()).increment(1);
}

pub fn update_active_calls(in_call: bool) {
    gauge!("sip_active_calls").set(if in_call { 1.0 } else { 0.0 });
}
