//! restcomm-sip - SIP call and messaging engine for a client device
//!
//! A device registers with one SIP proxy, places or answers one call at a
//! time and exchanges instant messages. Call progress reaches the host
//! application through `CallNotifier`; audio is delegated to an
//! `AudioResource`.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{CallNotifier, Device, DeviceSnapshot};
pub use domain::{SessionState, SipEvent, SipEventKind, SipProfile};
pub use infrastructure::media::{AudioResource, MediaError};
pub use infrastructure::protocols::sip::{RequestBuilder, SipError, SipSessionManager};
