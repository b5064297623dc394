use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::LaunchCommand;
use crate::error::BackendError;
use crate::traits::SandboxLauncher;

/// Boots the execution unit as a child process of the gateway. The child is
/// killed when the launcher is dropped.
pub struct ProcessLauncher {
    command: LaunchCommand,
    child: Mutex<Option<Child>>,
}

impl ProcessLauncher {
    pub fn new(command: LaunchCommand) -> Self {
        Self {
            command,
            child: Mutex::new(None),
        }
    }

    pub async fn shutdown(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to stop sandbox process");
            }
        }
    }
}

#[async_trait]
impl SandboxLauncher for ProcessLauncher {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn start(&self) -> Result<(), BackendError> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            match child.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => warn!(%status, "sandbox process exited, restarting"),
                Err(err) => warn!(error = %err, "sandbox process state unknown, restarting"),
            }
        }

        // stdout stays detached so a stdio transport is never corrupted.
        let child = Command::new(&self.command.program)
            .args(&self.command.args)
            .envs(self.command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| BackendError::Launch(format!("{}: {err}", self.command.program)))?;
        info!(
            program = %self.command.program,
            pid = child.id().unwrap_or_default(),
            "sandbox process started"
        );
        *guard = Some(child);
        Ok(())
    }
}

/// Execution unit managed outside the gateway; it is assumed to be running and
/// readiness is discovered by the proxy's connection retries alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExternalUnit;

#[async_trait]
impl SandboxLauncher for ExternalUnit {
    fn name(&self) -> &'static str {
        "external"
    }

    async fn is_running(&self) -> bool {
        true
    }

    async fn start(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
