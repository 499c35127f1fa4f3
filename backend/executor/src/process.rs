//! Host process lookup and termination.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sysinfo::{PidExt, ProcessExt, System, SystemExt};
use tracing::{debug, info, warn};

use havoc_core::{HavocError, Result};

/// The slice of the host process table the executors need.
pub trait ProcessTable: Send + Sync {
    /// Name of the live process `pid`, or `None` if it no longer exists.
    fn name(&self, pid: u32) -> Option<String>;

    /// Send SIGKILL to `pid` and everything in its process group.
    fn kill(&self, pid: u32) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn name(&self, pid: u32) -> Option<String> {
        let pid = sysinfo::Pid::from_u32(pid);
        let mut system = System::new();
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|p| p.name().to_string())
    }

    fn kill(&self, pid: u32) -> Result<()> {
        let raw = i32::try_from(pid)
            .map_err(|_| HavocError::Execution(format!("pid {pid} out of range")))?;
        let pid = Pid::from_raw(raw);

        // Stressors are spawned as group leaders so their workers die with them.
        match signal::killpg(pid, Signal::SIGKILL) {
            Ok(()) => return Ok(()),
            Err(Errno::ESRCH) => debug!(pid = raw, "No process group, signalling pid only"),
            Err(e) => {
                return Err(HavocError::Execution(format!(
                    "failed to kill process group {raw}: {e}"
                )))
            }
        }
        match signal::kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(HavocError::Execution(format!(
                "failed to kill process {raw}: {e}"
            ))),
        }
    }
}

/// Kill `pid` if it is still the process we started.
///
/// A process that is gone, or whose name no longer contains `expected`, is
/// treated as already stopped: someone killed it by hand and the pid may
/// have been reused.
pub fn stop_process(table: &dyn ProcessTable, pid: u32, expected: &str) -> Result<()> {
    let Some(name) = table.name(pid) else {
        warn!(pid, "Process already exited");
        return Ok(());
    };
    if !name.contains(expected) {
        warn!(pid, name = %name, expected, "Process is not ours, maybe it was killed manually");
        return Ok(());
    }

    table.kill(pid).map_err(|e| {
        warn!(pid, error = %e, "Process kill failed");
        e
    })?;
    info!(pid, name = %name, "Process killed");
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory process table.
    #[derive(Default)]
    pub struct FakeProcessTable {
        pub procs: Mutex<HashMap<u32, String>>,
        pub killed: Mutex<Vec<u32>>,
        pub fail_kill: bool,
    }

    impl FakeProcessTable {
        pub fn with(procs: &[(u32, &str)]) -> Self {
            Self {
                procs: Mutex::new(
                    procs.iter().map(|(pid, name)| (*pid, name.to_string())).collect(),
                ),
                ..Default::default()
            }
        }

        pub fn killed(&self) -> Vec<u32> {
            self.killed.lock().unwrap().clone()
        }
    }

    impl ProcessTable for FakeProcessTable {
        fn name(&self, pid: u32) -> Option<String> {
            self.procs.lock().unwrap().get(&pid).cloned()
        }

        fn kill(&self, pid: u32) -> Result<()> {
            if self.fail_kill {
                return Err(HavocError::Execution("operation not permitted".into()));
            }
            self.procs.lock().unwrap().remove(&pid);
            self.killed.lock().unwrap().push(pid);
            Ok(())
        }
    }
}
