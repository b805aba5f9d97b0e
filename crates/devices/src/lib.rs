//! Device abstraction for flowline.
//!
//! Transports implement [`InputDevice`] and/or [`OutputDevice`] and are
//! created through [`InputDeviceManager`] / [`OutputDeviceManager`]
//! factories. Cross-cutting behavior (failover, transformation, rate
//! limiting, ...) is added by wrapping one device in another; see
//! [`wrappers`].

pub mod batch;
pub mod device;
pub mod error;
pub mod manager;
pub mod message;
pub mod transaction;
pub mod transports;
pub mod wrappers;

pub use {
    batch::BatchReader,
    device::{INPUT_DEVICE_NAME_HEADER, InputDevice, OutputDevice},
    error::{Error, Result},
    manager::{DeviceManager, InputDeviceManager, OutputDeviceManager},
    message::{Headers, Message, MessageBundle},
    transaction::{InputTransaction, NullTransaction, ReadResult, TransactionScope},
};
