//! Shared error plumbing and lifecycle primitives used across all flowline crates.

pub mod error;
pub mod observe;
pub mod service;

pub use {
    error::FromMessage,
    observe::{Observable, SubscriptionId},
    service::{Service, ServiceState},
};
