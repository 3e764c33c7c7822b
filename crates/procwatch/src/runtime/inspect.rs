//! External process-table inspection
//!
//! The wait channel never reports Running/Sleeping changes, so those are read
//! from the OS process table instead.

use nix::unistd::Pid;
use serde::Serialize;
use std::fmt;
use sysinfo::{ProcessStatus, ProcessesToUpdate, System};

/// State letter the kernel currently shows for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedState {
    Running,
    Sleeping,
    Stopped,
    Zombie,
    /// Present, in a state we do not map
    Other,
    /// Not in the process table
    Gone,
}

impl From<ProcessStatus> for ObservedState {
    fn from(status: ProcessStatus) -> Self {
        match status {
            ProcessStatus::Run => ObservedState::Running,
            ProcessStatus::Sleep | ProcessStatus::Idle => ObservedState::Sleeping,
            ProcessStatus::Stop | ProcessStatus::Tracing => ObservedState::Stopped,
            ProcessStatus::Zombie => ObservedState::Zombie,
            _ => ObservedState::Other,
        }
    }
}

impl fmt::Display for ObservedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObservedState::Running => "R (running)",
            ObservedState::Sleeping => "S (sleeping)",
            ObservedState::Stopped => "T (stopped)",
            ObservedState::Zombie => "Z (zombie)",
            ObservedState::Other => "other",
            ObservedState::Gone => "gone",
        };
        f.write_str(name)
    }
}

/// Reusable process-table reader
pub struct Inspector {
    system: System,
}

impl Default for Inspector {
    fn default() -> Self {
        Self::new()
    }
}

impl Inspector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Current kernel state for each pid, in input order
    pub fn observe(&mut self, pids: &[Pid]) -> Vec<(Pid, ObservedState)> {
        let sys_pids: Vec<sysinfo::Pid> = pids
            .iter()
            .map(|pid| sysinfo::Pid::from_u32(pid.as_raw() as u32))
            .collect();

        self.system
            .refresh_processes(ProcessesToUpdate::Some(&sys_pids), true);

        pids.iter()
            .zip(&sys_pids)
            .map(|(pid, sys_pid)| {
                let observed = self
                    .system
                    .process(*sys_pid)
                    .map(|p| ObservedState::from(p.status()))
                    .unwrap_or(ObservedState::Gone);
                (*pid, observed)
            })
            .collect()
    }
}
