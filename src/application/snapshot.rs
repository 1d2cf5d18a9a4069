//! Persistable device state

use crate::domain::profile::SipProfile;
use crate::domain::session::SessionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Invalid snapshot: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}

/// Versioned state of a device. Calls in progress are never stored; a
/// restored device starts idle or registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub version: u32,
    pub profile: SipProfile,
    pub state: SessionState,
    pub registered: bool,
    pub custom_headers: HashMap<String, String>,
    pub taken_at: DateTime<Utc>,
}

impl DeviceSnapshot {
    pub fn new(
        profile: SipProfile,
        state: SessionState,
        registered: bool,
        custom_headers: HashMap<String, String>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            profile,
            state,
            registered,
            custom_headers,
            taken_at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        let snapshot: DeviceSnapshot = serde_json::from_str(json)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }
        Ok(snapshot)
    }
}
