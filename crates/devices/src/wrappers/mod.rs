//! Decorator devices. Every wrapper implements the same capability trait as
//! the device it owns, so wrappers nest to any depth.
//!
//! Each wrapper also comes with a manager that applies it to every device
//! created by an inner manager.

pub mod collection;
pub mod failover;
pub mod message_store;
pub mod rate_limited;
pub mod short_circuit;
pub mod transformer;
pub mod zlib;

pub use {
    collection::{
        CollectionInputDevice, CollectionInputDeviceManager, CollectionOrder,
        CollectionOutputDevice, CollectionOutputDeviceManager,
    },
    failover::{FailoverOutputDevice, FailoverOutputDeviceManager},
    message_store::{
        FileSystemMessageStore, MessageStore, MessageStoreInputDevice,
        MessageStoreInputDeviceManager, MessageStoreOutputDevice, MessageStoreOutputDeviceManager,
    },
    rate_limited::{
        RateLimitedInputDevice, RateLimitedInputDeviceManager, RateLimitedOutputDevice,
        RateLimitedOutputDeviceManager, RateLimiter,
    },
    short_circuit::{
        Circuit, ShortCircuitInputDevice, ShortCircuitInputDeviceManager,
        ShortCircuitOutputDevice, ShortCircuitOutputDeviceManager, ShortCircuitPolicy,
    },
    transformer::{
        FnInputTransformer, FnOutputTransformer, InputTransformer, OutputTransformer,
        TransformerInputDevice, TransformerInputDeviceManager, TransformerOutputDevice,
        TransformerOutputDeviceManager,
    },
    zlib::{ZLIB_MAGIC, ZlibTransformer},
};
