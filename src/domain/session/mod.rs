//! Session context - call/registration state and the events that drive it

pub mod dtmf;
pub mod event;
pub mod state;

pub use dtmf::DtmfDigit;
pub use event::{SipEvent, SipEventKind};
pub use state::{CallDirection, CallStats, SessionState, SessionStateMachine, SessionTrigger};
