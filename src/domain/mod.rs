//! Domain layer - profile, session state and events
//!
//! Nothing here performs I/O.

pub mod profile;
pub mod session;
pub mod shared;

pub use profile::SipProfile;
pub use session::{SessionState, SipEvent, SipEventKind};
