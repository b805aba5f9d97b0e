//! Metric name and label definitions.
//!
//! Centralizing these keeps names consistent across the devices, pipeline,
//! and runner crates.

/// Dispatch loop metrics
pub mod pipeline {
    /// Messages read and handed to the handler
    pub const MESSAGES_RECEIVED_TOTAL: &str = "flowline_pipeline_messages_received_total";
    /// Messages handled and committed
    pub const MESSAGES_HANDLED_TOTAL: &str = "flowline_pipeline_messages_handled_total";
    /// Messages rolled back after a handler failure
    pub const HANDLER_FAILURES_TOTAL: &str = "flowline_pipeline_handler_failures_total";
    /// Outgoing bundles sent to output devices
    pub const MESSAGES_SENT_TOTAL: &str = "flowline_pipeline_messages_sent_total";
    /// Handler duration in seconds
    pub const HANDLER_DURATION_SECONDS: &str = "flowline_pipeline_handler_duration_seconds";
    /// Full loop pass duration in seconds
    pub const LOOP_DURATION_SECONDS: &str = "flowline_pipeline_loop_duration_seconds";
    /// Loop passes that ended with an error
    pub const LOOP_FAILURES_TOTAL: &str = "flowline_pipeline_loop_failures_total";
}

/// Device and wrapper metrics
pub mod devices {
    /// Commits reaching a transport
    pub const COMMITS_TOTAL: &str = "flowline_device_commits_total";
    /// Rollbacks reaching a transport
    pub const ROLLBACKS_TOTAL: &str = "flowline_device_rollbacks_total";
    /// Sends that fell through to the failover device
    pub const FAILOVER_SENDS_TOTAL: &str = "flowline_device_failover_sends_total";
    /// Calls refused while a short circuit is open
    pub const SHORT_CIRCUIT_REJECTIONS_TOTAL: &str = "flowline_device_short_circuit_rejections_total";
    /// Number of currently open short circuits
    pub const SHORT_CIRCUITS_OPEN: &str = "flowline_device_short_circuits_open";
    /// Seconds spent waiting on a rate limiter
    pub const RATE_LIMIT_WAIT_SECONDS: &str = "flowline_device_rate_limit_wait_seconds";
    /// Files moved to a poison folder
    pub const POISONED_TOTAL: &str = "flowline_device_poisoned_total";
}

/// Process runner metrics
pub mod runner {
    /// Children spawned, including restarts
    pub const CHILDREN_SPAWNED_TOTAL: &str = "flowline_runner_children_spawned_total";
    /// Children that exited unsuccessfully
    pub const CHILD_FAILURES_TOTAL: &str = "flowline_runner_child_failures_total";
    /// Currently running children
    pub const CHILDREN_ALIVE: &str = "flowline_runner_children_alive";
    /// Children that missed a liveness check
    pub const LIVE_CHECK_FAILURES_TOTAL: &str = "flowline_runner_live_check_failures_total";
}

/// Common label keys
pub mod labels {
    pub const DEVICE: &str = "device";
    pub const OUTPUT_DEVICE: &str = "output_device";
    pub const SERVICE: &str = "service";
    pub const WRAPPER: &str = "wrapper";
    pub const INSTANCE: &str = "instance";
    pub const ERROR_TYPE: &str = "error_type";
}

/// Suggested histogram buckets, for recorders that need them
pub mod buckets {
    /// Handler duration, 1ms to 60s
    pub const HANDLER_DURATION: &[f64] = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    /// Rate limiter waits, 1ms to 10s
    pub const RATE_LIMIT_WAIT: &[f64] = &[0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0];
}
