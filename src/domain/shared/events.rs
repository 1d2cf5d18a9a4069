//! Event plumbing shared by the domain

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Anything the engine reports to its listener
pub trait DomainEvent: Send + Sync {
    /// Stable snake_case name, used for logs and metric labels
    fn event_type(&self) -> &'static str;

    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Identity and timestamp attached to every event
#[derive(Debug, Clone, Serialize)]
pub struct EventMetadata {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub event_type: &'static str,
}

impl EventMetadata {
    pub fn new(event_type: &'static str) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event_type,
        }
    }

    /// Time since the event was created
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.occurred_at
    }
}
