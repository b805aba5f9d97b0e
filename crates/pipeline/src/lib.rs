//! Pipeline handlers and the service that drives them.
//!
//! A [`PipelineService`] polls input devices through a
//! [`flowline_devices::DeviceManager`], hands each message to a
//! [`PipelineHandler`], sends whatever the handler returns, and then commits
//! the read. Handler failures roll the read back and the loop carries on;
//! fatal device failures end the service with an error for its supervisor.

pub mod error;
pub mod handler;
pub mod health;
pub mod service;
pub mod signal;

pub use {
    error::{Error, Result},
    handler::{
        FixedRouterPipelineHandler, FnPipelineHandler, HandlerFn, HandlerInput, PipelineHandler,
        PipelineResult,
    },
    health::{HealthGuard, LoopHealthMonitor},
    service::{LoopMetrics, PipelineService, PipelineServiceConfig, ServiceHandle},
    signal::shutdown_signal,
};
