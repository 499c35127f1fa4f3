use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use havoc_core::{Attack, AttackKind, HavocError, Result, StressCommand};

use crate::args::normalize;
use crate::process::{stop_process, ProcessTable, SystemProcessTable};

pub const STRESS_NG: &str = "stress-ng";

/// Linux truncates process names to 15 bytes.
const COMM_LEN: usize = 15;

/// Runs CPU and memory stress through a stress-ng child process.
pub struct StressAttack<P = SystemProcessTable> {
    binary: PathBuf,
    marker: String,
    table: Arc<P>,
}

impl StressAttack {
    pub fn new() -> Self {
        Self::with_binary(STRESS_NG)
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self::with_table(binary, SystemProcessTable)
    }
}

impl Default for StressAttack {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ProcessTable> StressAttack<P> {
    pub fn with_table(binary: impl Into<PathBuf>, table: P) -> Self {
        let binary = binary.into();
        let marker = process_marker(&binary);
        Self {
            binary,
            marker,
            table: Arc::new(table),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

/// The name the spawned stressor shows up under in the process table.
fn process_marker(binary: &Path) -> String {
    let name = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| STRESS_NG.to_string());
    name.chars().take(COMM_LEN).collect()
}

#[async_trait]
impl<P: ProcessTable + 'static> Attack for StressAttack<P> {
    type Command = StressCommand;

    fn kind(&self) -> AttackKind {
        AttackKind::Stress
    }

    async fn start(&self, command: &mut StressCommand) -> Result<()> {
        let args = normalize(command)?;
        debug!(binary = %self.binary.display(), args = ?args, "Stressor arguments");

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // Own process group, so the stressor outlives an agent restart
            // and its workers can be killed together.
            .process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            HavocError::Execution(format!(
                "failed to start {}: {e}",
                self.binary.display()
            ))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| HavocError::Execution("stressor exited before reporting a pid".into()))?;

        // Reap the child whenever it exits.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(pid, status = %status, "Stressor exited"),
                Err(e) => warn!(pid, error = %e, "Failed to wait for stressor"),
            }
        });

        command.pid = Some(pid);
        info!(pid, binary = %self.binary.display(), args = ?args, "Stressor started");
        Ok(())
    }

    async fn recover(&self, command: &StressCommand) -> Result<()> {
        match command.pid {
            Some(pid) => stop_process(self.table.as_ref(), pid, &self.marker),
            None => {
                debug!("No stressor pid recorded, nothing to stop");
                Ok(())
            }
        }
    }
}
