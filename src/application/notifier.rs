//! UI notifications
//!
//! The device reports call progress through `CallNotifier`; the host
//! application decides how to show it.

use crate::domain::session::SipEventKind;
use tracing::info;

/// Receiver of user-facing call notifications
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CallNotifier: Send + Sync {
    /// An inbound call is ringing, or our outbound call reached the callee
    async fn incoming_call(&self, from: &str);

    async fn call_connected(&self, from: &str);

    /// The call ended; `kind` says how
    async fn call_ended(&self, kind: SipEventKind, from: &str);

    async fn message_received(&self, from: &str, content: &str);

    async fn message_failed(&self, to: &str, status: Option<u16>);

    async fn registration_changed(&self, registered: bool);
}

/// Notifier that only writes to the log
#[derive(Debug, Default, Clone)]
pub struct LoggingNotifier;

#[async_trait::async_trait]
impl CallNotifier for LoggingNotifier {
    async fn incoming_call(&self, from: &str) {
        info!("Ringing: {}", from);
    }

    async fn call_connected(&self, from: &str) {
        info!("Connected: {}", from);
    }

    async fn call_ended(&self, kind: SipEventKind, from: &str) {
        info!("Call with {} ended ({})", from, kind.name());
    }

    async fn message_received(&self, from: &str, content: &str) {
        info!("Message from {}: {}", from, content);
    }

    async fn message_failed(&self, to: &str, status: Option<u16>) {
        match status {
            Some(status) => info!("Message to {} failed with {}", to, status),
            None => info!("Message to {} could not be sent", to),
        }
    }

    async fn registration_changed(&self, registered: bool) {
        if registered {
            info!("Registered");
        } else {
            info!("Not registered");
        }
    }
}
