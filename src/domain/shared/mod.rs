//! Shared kernel - Common types used across the session and device contexts

pub mod events;
pub mod value_objects;

pub use events::{DomainEvent, EventMetadata};
pub use value_objects::*;
