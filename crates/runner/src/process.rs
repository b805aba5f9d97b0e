//! One supervised child process.

use std::{
    ffi::OsString,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use {
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        process::{Child, ChildStdin, Command},
        sync::mpsc,
    },
    tracing::{debug, info, warn},
};

use crate::{
    control::{self, INSTANCE_COUNT_ENV, INSTANCE_INDEX_ENV, PING_COMMAND, STOP_COMMAND},
    error::{Error, Result},
};

/// What to execute for each instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
}

impl ChildCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-run the current executable with the current arguments.
    pub fn current_exe() -> Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: std::env::args_os().skip(1).collect(),
            envs: Vec::new(),
        })
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

/// Handle to a running instance.
pub struct ChildProcess {
    index: usize,
    child: Child,
    stdin: Option<ChildStdin>,
    pongs: mpsc::Receiver<bool>,
}

impl ChildProcess {
    pub fn spawn(command: &ChildCommand, index: usize, count: usize) -> Result<Self> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.envs.iter().map(|(k, v)| (k, v)))
            .env(INSTANCE_INDEX_ENV, index.to_string())
            .env(INSTANCE_COUNT_ENV, count.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| Error::Spawn { index, source })?;
        info!(instance = index, pid = child.id(), "instance started");

        let (pong_tx, pongs) = mpsc::channel(4);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(alive) = control::parse_pong(&line) {
                        let _ = pong_tx.try_send(alive);
                    } else {
                        info!(target: "flowline_child", instance = index, "{line}");
                    }
                }
            });
        }

        Ok(Self {
            index,
            stdin: child.stdin.take(),
            child,
            pongs,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for the process to exit. Cancel safe.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    async fn send(&mut self, command: &str) -> std::io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
        stdin.write_all(command.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    /// Ask the child whether its service is still active. A missing or late
    /// answer counts as dead.
    pub async fn check_alive(&mut self, timeout: Duration) -> bool {
        while self.pongs.try_recv().is_ok() {}
        if let Err(e) = self.send(PING_COMMAND).await {
            debug!(instance = self.index, error = %e, "liveness check not delivered");
            return false;
        }
        matches!(
            tokio::time::timeout(timeout, self.pongs.recv()).await,
            Ok(Some(true))
        )
    }

    /// Stop the child: `STOP` on stdin, then SIGTERM, then kill, waiting
    /// `grace` between steps.
    pub async fn stop(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Some(status);
        }

        if let Err(e) = self.send(STOP_COMMAND).await {
            debug!(instance = self.index, error = %e, "stop command not delivered");
        }
        self.stdin = None;
        if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
            info!(instance = self.index, %status, "instance exited");
            return Some(status);
        }

        #[cfg(unix)]
        {
            use nix::{
                sys::signal::{Signal, kill},
                unistd::Pid,
            };

            if let Some(pid) = self.child.id()
                && let Ok(pid) = i32::try_from(pid)
            {
                warn!(instance = self.index, "instance ignored stop command, sending SIGTERM");
                let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
            }
            if let Ok(Ok(status)) = tokio::time::timeout(grace, self.child.wait()).await {
                info!(instance = self.index, %status, "instance exited after SIGTERM");
                return Some(status);
            }
        }

        warn!(instance = self.index, "instance still running, killing");
        if let Err(e) = self.child.kill().await {
            warn!(instance = self.index, error = %e, "failed to kill instance");
            return None;
        }
        self.child.try_wait().ok().flatten()
    }
}
