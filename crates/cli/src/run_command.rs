use std::{path::Path, sync::Arc};

use {
    anyhow::bail,
    flowline_common::Service,
    flowline_config::{FlowlineConfig, Severity, TransportConfig},
    flowline_devices::transports::FileSystemDeviceManager,
    flowline_pipeline::shutdown_signal,
    flowline_runner::{ChildCommand, get_service_runner, is_child_process, run_child},
    tracing::{error, info},
};

use crate::wiring::{self, PipelineFactory};

pub async fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    let loaded = flowline_config::load_or_default(config_path)?;
    let config = loaded.config;

    if is_child_process() {
        // The parent forwards shutdown as a STOP command; a terminal Ctrl-C
        // reaches the whole process group, so honour signals here too.
        let factory = PipelineFactory::new(config, true);
        return run_child(&factory).await;
    }

    if loaded.path.is_none() {
        info!("no config file found, using defaults");
    }
    ensure_runnable(&config)?;
    recover_inflight(&config).await?;

    let factory = PipelineFactory::new(config.clone(), false);
    let mut command = ChildCommand::current_exe()?.arg("run");
    if let Some(path) = &loaded.path {
        command = command.arg("--config").arg(path.as_os_str());
    }
    let service: Arc<dyn Service> =
        get_service_runner(&factory, wiring::runner_config(&config), command)?;
    info!(
        service = service.name(),
        instances = config.runner.instances,
        transport = config.transport.kind(),
        "starting"
    );

    let signals = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            service.stop();
        })
    };
    let outcome = service.start().await;
    signals.abort();

    if let Err(e) = &outcome {
        error!(error = %format!("{e:#}"), "service failed");
    }
    outcome
}

/// Refuse to start on semantic config errors; `config check` lists them all.
fn ensure_runnable(config: &FlowlineConfig) -> anyhow::Result<()> {
    let errors: Vec<String> = flowline_config::check_config(config)
        .into_iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.to_string())
        .collect();
    if !errors.is_empty() {
        bail!("invalid config:\n  {}", errors.join("\n  "));
    }
    if config.service.output_device.is_none() {
        bail!("service.output_device is required to run");
    }
    Ok(())
}

/// Requeue messages a crashed run left claimed. Runs once in the parent,
/// before any reader starts.
async fn recover_inflight(config: &FlowlineConfig) -> anyhow::Result<()> {
    if let TransportConfig::FileSystem(fs) = &config.transport {
        let manager =
            FileSystemDeviceManager::new(fs.root.clone(), wiring::file_system_options(fs));
        manager.recover_inflight().await?;
    }
    Ok(())
}
