//! Interface point for robot-control protocol adapters.
//!
//! Adapters address simulated hardware as `robot:interface:index` devices.
//! A [`DeviceTable`] binds each device to a link of the world, and a
//! [`Bridge`] serves reads, actuation and subscriptions against a world
//! shared with the stepping thread.
//!
//! # Invariants
//! - Every bridge call takes the world lock once and releases it before
//!   returning, so a call observes a single completed step.
//! - Unsubscribing never drives a subscription count below zero.

mod bridge;
mod device;

pub use bridge::{Bridge, Reading, ReadingData, SharedWorld, shared};
pub use device::{DeviceAddr, DeviceBinding, DeviceTable, InterfaceKind};

use robosim_kernel::SimError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("malformed device address `{0}`, expected robot:interface:index")]
    BadAddress(String),
    #[error("unknown interface `{0}`")]
    UnknownInterface(String),
    #[error("device {0} is not in the device table")]
    UnknownDevice(DeviceAddr),
    #[error("device {0} is already bound")]
    DuplicateDevice(DeviceAddr),
    #[error("device {0} is not bound to a link")]
    Unbound(DeviceAddr),
    #[error("device {0} does not accept commands")]
    ReadOnly(DeviceAddr),
    #[error("device {0} has no subscribers")]
    NotSubscribed(DeviceAddr),
    #[error(transparent)]
    World(#[from] SimError),
}

pub fn crate_info() -> &'static str {
    "robosim-bridge v0.1.0"
}
