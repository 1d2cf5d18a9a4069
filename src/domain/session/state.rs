//! Session State Machine
//!
//! One registration plus at most one call per device. The state tracks the
//! call when there is one and falls back to the registration otherwise.

use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Nothing in progress
    Idle,
    /// REGISTER sent, no final response yet
    Registering,
    /// Registration live, no call
    Registered,
    /// INVITE sent
    Calling,
    /// 180/183 received, or inbound INVITE waiting for an answer
    Ringing,
    /// Call established
    Connected,
}

impl SessionState {
    /// A call (either direction) is in progress
    pub fn is_in_call(&self) -> bool {
        matches!(
            self,
            SessionState::Calling | SessionState::Ringing | SessionState::Connected
        )
    }

    /// A new call may start from here
    pub fn accepts_new_call(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Registered)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Registering => "Registering",
            SessionState::Registered => "Registered",
            SessionState::Calling => "Calling",
            SessionState::Ringing => "Ringing",
            SessionState::Connected => "Connected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// We received the INVITE
    Inbound,
    /// We sent the INVITE
    Outbound,
}

/// Call Statistics
#[derive(Debug, Clone)]
pub struct CallStats {
    pub created_at: Instant,
    pub answered_at: Option<Instant>,
    pub ended_at: Option<Instant>,
}

impl CallStats {
    pub fn new() -> Self {
        Self {
            created_at: Instant::now(),
            answered_at: None,
            ended_at: None,
        }
    }

    /// Time from INVITE to answer
    pub fn setup_duration(&self) -> Option<std::time::Duration> {
        self.answered_at.map(|t| t.duration_since(self.created_at))
    }

    /// Time from answer to hangup
    pub fn call_duration(&self) -> Option<std::time::Duration> {
        match (self.answered_at, self.ended_at) {
            (Some(answered), Some(ended)) => Some(ended.duration_since(answered)),
            _ => None,
        }
    }
}

impl Default for CallStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTrigger {
    RegisterSent,
    RegistrationSucceeded,
    RegistrationFailed,
    Unregistered,
    OutgoingInvite,
    IncomingInvite,
    RemoteRinging,
    Answered,
    Ended,
}

/// State Machine
#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    registered: bool,
    direction: Option<CallDirection>,
    stats: Option<CallStats>,
    last_call: Option<CallStats>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            registered: false,
            direction: None,
            stats: None,
            last_call: None,
        }
    }

    /// Rebuild a machine from a stored snapshot. Calls are not restored.
    pub fn restore(registered: bool) -> Self {
        let mut machine = Self::new();
        machine.registered = registered;
        machine.state = machine.resting_state();
        machine
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn direction(&self) -> Option<CallDirection> {
        self.direction
    }

    /// Statistics of the current call
    pub fn stats(&self) -> Option<&CallStats> {
        self.stats.as_ref()
    }

    /// Statistics of the most recently finished call
    pub fn last_call(&self) -> Option<&CallStats> {
        self.last_call.as_ref()
    }

    fn resting_state(&self) -> SessionState {
        if self.registered {
            SessionState::Registered
        } else {
            SessionState::Idle
        }
    }

    /// Process an input and transition state
    pub fn process(&mut self, trigger: SessionTrigger) -> Result<SessionState, String> {
        use SessionState::*;
        use SessionTrigger::*;

        let new_state = match (self.state, trigger) {
            // Registration never disturbs a call in progress
            (Idle | Registered | Registering, RegisterSent) => Registering,
            (s, RegisterSent) => s,

            (Registering, RegistrationSucceeded) => {
                self.registered = true;
                Registered
            }
            (s, RegistrationSucceeded) => {
                self.registered = true;
                s
            }

            (Registering, RegistrationFailed | Unregistered) | (Registered, Unregistered) => {
                self.registered = false;
                Idle
            }
            (s, RegistrationFailed | Unregistered) => {
                self.registered = false;
                s
            }

            (Idle | Registered, OutgoingInvite) => {
                self.direction = Some(CallDirection::Outbound);
                self.stats = Some(CallStats::new());
                Calling
            }
            (Idle | Registered, IncomingInvite) => {
                self.direction = Some(CallDirection::Inbound);
                self.stats = Some(CallStats::new());
                Ringing
            }

            (Calling, RemoteRinging) if self.direction == Some(CallDirection::Outbound) => Ringing,

            (Calling | Ringing, Answered) => {
                if let Some(stats) = self.stats.as_mut() {
                    stats.answered_at = Some(Instant::now());
                }
                Connected
            }

            (Calling | Ringing | Connected, Ended) => {
                if let Some(mut stats) = self.stats.take() {
                    stats.ended_at = Some(Instant::now());
                    self.last_call = Some(stats);
                }
                self.direction = None;
                self.resting_state()
            }

            (state, trigger) => {
                return Err(format!(
                    "Invalid transition from {} on {:?}",
                    state.name(),
                    trigger
                ));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
