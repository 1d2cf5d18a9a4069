//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - The SIP stack (messages, transports, session manager)
//! - The RTP audio endpoint
//! - Metrics

pub mod media;
pub mod metrics;
pub mod protocols;
