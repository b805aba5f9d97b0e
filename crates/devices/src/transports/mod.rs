//! Reference transports. Real deployments plug in their own broker or storage
//! clients through the same manager traits.

pub mod file_system;
pub mod memory;

pub use {
    file_system::{FileSystemDeviceManager, FileSystemOptions},
    memory::{InMemoryDeviceManager, QueueStats},
};
