//! Child side of the control channel.

use std::sync::Arc;

use {
    flowline_common::Service,
    tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    tracing::{debug, info, warn},
};

use crate::{
    control::{self, PING_COMMAND, STOP_COMMAND},
    factory::ServiceFactory,
};

/// Build the service with `factory` and run it until the parent asks it to
/// stop (a `STOP` line, or stdin closing).
pub async fn run_child(factory: &dyn ServiceFactory) -> anyhow::Result<()> {
    let index = control::instance_index();
    let service: Arc<dyn Service> = Arc::from(factory.create_service()?);
    info!(instance = ?index, service = service.name(), "starting service instance");

    let listener = tokio::spawn(listen_for_control(
        Arc::clone(&service),
        tokio::io::stdin(),
        tokio::io::stdout(),
    ));
    let outcome = service.start().await;
    listener.abort();

    match &outcome {
        Ok(()) => info!(instance = ?index, "service instance stopped"),
        Err(e) => warn!(instance = ?index, error = %format!("{e:#}"), "service instance failed"),
    }
    outcome
}

/// Serve control commands from `reader` until `STOP` or EOF, then stop
/// `service`. Liveness answers go to `writer`.
pub async fn listen_for_control<R, W>(service: Arc<dyn Service>, reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match line.trim() {
                STOP_COMMAND => {
                    info!("stop requested by parent");
                    break;
                },
                PING_COMMAND => {
                    let answer = control::pong_line(service.state().is_active());
                    if let Err(e) = write_line(&mut writer, &answer).await {
                        warn!(error = %e, "failed to answer liveness check");
                    }
                },
                "" => {},
                other => warn!(command = other, "unknown control command"),
            },
            Ok(None) => {
                debug!("control channel closed");
                break;
            },
            Err(e) => {
                warn!(error = %e, "control channel failed");
                break;
            },
        }
    }
    service.stop();
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
