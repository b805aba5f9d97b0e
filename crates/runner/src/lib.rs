//! Horizontal scaling by process: run N copies of a service, each in its own
//! OS process with its own devices, and supervise them.
//!
//! The parent side is [`ProcessRunner`]. A child re-executes the same binary
//! with [`control::INSTANCE_INDEX_ENV`] set and calls [`run_child`].

pub mod child;
pub mod control;
pub mod error;
pub mod factory;
pub mod process;
pub mod runner;

pub use {
    child::{listen_for_control, run_child},
    control::{instance_count, instance_index, is_child_process},
    error::{Error, Result},
    factory::{FnServiceFactory, ServiceFactory},
    process::{ChildCommand, ChildProcess},
    runner::{ProcessRunner, ProcessRunnerConfig, get_service_runner},
};
