//! SIP user agent
//!
//! A client-side SIP stack based on RFC 3261: one registration, one call and
//! any number of pager (MESSAGE) exchanges per device.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Session Manager       │
//! │  (state machine, events)│
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Request Builder       │
//! │  (dialogs, SDP, digest) │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │  (UDP, TCP)             │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod dialog;
pub mod message;
pub mod sdp;
pub mod session_manager;
pub mod transport;

pub use auth::{ChallengeKind, DigestChallenge};
pub use builder::{Credential, RegisterParams, RequestBuilder, ResponseBuilder};
pub use dialog::{Dialog, PagerSession};
pub use message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use sdp::SdpSession;
pub use session_manager::SipSessionManager;
pub use transport::{
    IncomingMessage, ListeningPoint, OutgoingMessage, TcpTransport, Transport, TransportProtocol,
    UdpTransport,
};
