//! Persisted key-value settings with change notification

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

pub const PREF_PROXY_IP: &str = "pref_proxy_ip";
pub const PREF_PROXY_PORT: &str = "pref_proxy_port";
pub const PREF_SIP_USER: &str = "pref_sip_user";
pub const PREF_SIP_PASSWORD: &str = "pref_sip_password";
pub const PREF_LOCAL_PORT: &str = "pref_local_port";
pub const PREF_TRANSPORT: &str = "pref_transport";

/// A stored setting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreferenceValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<&str> for PreferenceValue {
    fn from(value: &str) -> Self {
        PreferenceValue::Str(value.to_string())
    }
}

impl From<String> for PreferenceValue {
    fn from(value: String) -> Self {
        PreferenceValue::Str(value)
    }
}

impl From<i64> for PreferenceValue {
    fn from(value: i64) -> Self {
        PreferenceValue::Int(value)
    }
}

impl From<bool> for PreferenceValue {
    fn from(value: bool) -> Self {
        PreferenceValue::Bool(value)
    }
}

/// Point-in-time view of all settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    values: HashMap<String, PreferenceValue>,
}

impl Preferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&PreferenceValue> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(PreferenceValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Integer setting; numeric strings are accepted as well
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(PreferenceValue::Int(i)) => Some(*i),
            Some(PreferenceValue::Str(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(PreferenceValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Store a value, returning the previous one
    pub fn set(&mut self, key: &str, value: impl Into<PreferenceValue>) -> Option<PreferenceValue> {
        self.values.insert(key.to_string(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<PreferenceValue> {
        self.values.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }
}

/// Notification that a key changed
#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceChange {
    pub key: String,
    pub value: Option<PreferenceValue>,
}

/// Shared settings store; every write that changes a value is broadcast.
#[derive(Clone)]
pub struct PreferenceStore {
    inner: Arc<RwLock<Preferences>>,
    changes: broadcast::Sender<PreferenceChange>,
}

impl PreferenceStore {
    pub fn new(initial: Preferences) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(initial)),
            changes,
        }
    }

    pub async fn snapshot(&self) -> Preferences {
        self.inner.read().await.clone()
    }

    pub async fn set(&self, key: &str, value: impl Into<PreferenceValue>) {
        let value = value.into();
        let previous = self.inner.write().await.set(key, value.clone());
        if previous.as_ref() != Some(&value) {
            debug!("Preference {} changed", key);
            // No subscribers is fine
            let _ = self.changes.send(PreferenceChange {
                key: key.to_string(),
                value: Some(value),
            });
        }
    }

    pub async fn remove(&self, key: &str) {
        if self.inner.write().await.remove(key).is_some() {
            debug!("Preference {} removed", key);
            let _ = self.changes.send(PreferenceChange {
                key: key.to_string(),
                value: None,
            });
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PreferenceChange> {
        self.changes.subscribe()
    }
}

impl Default for PreferenceStore {
    fn default() -> Self {
        Self::new(Preferences::default())
    }
}
