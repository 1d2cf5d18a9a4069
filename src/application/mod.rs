//! Application layer - the device facade and its collaborators

pub mod device;
pub mod notifier;
pub mod snapshot;

pub use device::Device;
pub use notifier::{CallNotifier, LoggingNotifier};
pub use snapshot::{DeviceSnapshot, SnapshotError};
