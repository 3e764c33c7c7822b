//! Child process launcher

use crate::runtime::behavior::{Behavior, BehaviorError, HintError, SchedPolicy, SchedulingHint};
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::{fork, ForkResult, Pid};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};

/// What to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    /// Child name (for logging and reports)
    pub name: String,
    /// Work the child performs
    pub behavior: Behavior,
    /// Optional scheduling request
    pub hint: Option<SchedulingHint>,
}

impl ChildSpec {
    pub fn new(name: impl Into<String>, behavior: Behavior) -> Self {
        Self {
            name: name.into(),
            behavior,
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: SchedulingHint) -> Self {
        self.hint = Some(hint);
        self
    }
}

/// A freshly forked child
#[derive(Debug, Clone)]
pub struct SpawnedChild {
    pub pid: Pid,
    pub name: String,
    pub behavior: Behavior,
    /// Hint settings that could not be applied
    pub degraded: Vec<DegradedHint>,
}

impl SpawnedChild {
    /// Whether the child runs under default scheduling despite a hint
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// One scheduling setting the kernel refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "setting", rename_all = "snake_case")]
pub enum HintSetting {
    Policy { policy: SchedPolicy, priority: i32 },
    Nice { value: i32 },
}

impl fmt::Display for HintSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HintSetting::Policy { policy, priority } => {
                write!(f, "{} priority {}", policy, priority)
            }
            HintSetting::Nice { value } => write!(f, "nice {}", value),
        }
    }
}

/// Degraded-mode report: the child runs, but without part of its hint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedHint {
    pub pid: i32,
    pub name: String,
    pub setting: HintSetting,
    pub errno: i32,
    pub reason: String,
}

impl DegradedHint {
    fn new(pid: Pid, name: &str, setting: HintSetting, errno: Errno) -> Self {
        Self {
            pid: pid.as_raw(),
            name: name.to_string(),
            setting,
            errno: errno as i32,
            reason: errno.desc().to_string(),
        }
    }

    /// The caller lacked privilege (EPERM/EACCES)
    pub fn permission_denied(&self) -> bool {
        self.errno == Errno::EPERM as i32 || self.errno == Errno::EACCES as i32
    }
}

/// Errors that prevent a child from existing at all
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Invalid behavior for '{name}': {source}")]
    InvalidBehavior {
        name: String,
        #[source]
        source: BehaviorError,
    },

    #[error("Invalid scheduling hint for '{name}': {source}")]
    InvalidHint {
        name: String,
        #[source]
        source: HintError,
    },

    #[error("Failed to create handshake pipe for '{name}': {source}")]
    Handshake {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to fork '{name}': {source}")]
    Fork {
        name: String,
        #[source]
        source: nix::Error,
    },
}

/// One-shot pipe between parent and child.
///
/// Used twice: as the start gate the child waits on until the parent has
/// applied its hint, and as the ready signal the parent waits on until the
/// child has installed its signal handler.
struct Handshake {
    rx: File,
    tx: File,
}

impl Handshake {
    fn open(name: &str) -> Result<Self, LaunchError> {
        let (rx, tx) = nix::unistd::pipe().map_err(|source| LaunchError::Handshake {
            name: name.to_string(),
            source,
        })?;
        Ok(Self {
            rx: File::from(rx),
            tx: File::from(tx),
        })
    }

    /// Block until the other side releases, or exits
    fn wait(self) {
        let Handshake { mut rx, tx } = self;
        drop(tx);
        let mut byte = [0u8; 1];
        loop {
            match rx.read(&mut byte) {
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                _ => break,
            }
        }
    }

    /// Wake the side blocked in `wait`
    fn release(self) {
        let Handshake { rx, mut tx } = self;
        drop(rx);
        // A closed read end means the waiter is gone already
        let _ = tx.write(&[1]);
    }
}

/// Spawn a child running `spec.behavior` and return immediately.
///
/// The child shares no memory with the caller after this returns. When the spec
/// carries a scheduling hint the child waits on a start gate until the hint has
/// been applied, so its behavior always begins under the requested class (or
/// under the default one, reported in [`SpawnedChild::degraded`]). Behaviors that
/// install a signal handler have it in place before this returns.
pub fn spawn(spec: &ChildSpec) -> Result<SpawnedChild, LaunchError> {
    spec.behavior
        .validate()
        .map_err(|source| LaunchError::InvalidBehavior {
            name: spec.name.clone(),
            source,
        })?;
    if let Some(hint) = &spec.hint {
        hint.validate().map_err(|source| LaunchError::InvalidHint {
            name: spec.name.clone(),
            source,
        })?;
    }

    let gate = match spec.hint {
        Some(_) => Some(Handshake::open(&spec.name)?),
        None => None,
    };
    let ready = if spec.behavior.needs_ready_handshake() {
        Some(Handshake::open(&spec.name)?)
    } else {
        None
    };

    // SAFETY: the child branch never returns and calls only async-signal-safe
    // functions (sigaction, sigprocmask, read, write, close, the behavior loop, _exit).
    let fork_result = unsafe { fork() }.map_err(|source| LaunchError::Fork {
        name: spec.name.clone(),
        source,
    })?;

    match fork_result {
        ForkResult::Child => child_main(spec.behavior, gate, ready),
        ForkResult::Parent { child } => {
            if let Some(ready) = ready {
                ready.wait();
            }

            let mut degraded = Vec::new();
            if let (Some(hint), Some(gate)) = (spec.hint, gate) {
                degraded = apply_hint(child, &spec.name, &hint);
                gate.release();
            }

            log::info!(
                "[{}] Spawned pid {} ({})",
                spec.name,
                child,
                spec.behavior
            );
            for d in &degraded {
                log::warn!(
                    "[{}] Scheduling hint '{}' not applied ({}), running with default scheduling",
                    spec.name,
                    d.setting,
                    d.reason
                );
            }

            Ok(SpawnedChild {
                pid: child,
                name: spec.name.clone(),
                behavior: spec.behavior,
                degraded,
            })
        }
    }
}

fn child_main(behavior: Behavior, gate: Option<Handshake>, ready: Option<Handshake>) -> ! {
    reset_signal_state();
    behavior.prepare();
    if let Some(ready) = ready {
        ready.release();
    }
    if let Some(gate) = gate {
        gate.wait();
    }
    behavior.run()
}

/// Drop any handlers and masks inherited from the supervisor image
fn reset_signal_state() {
    for sig in [
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGQUIT,
    ] {
        // SAFETY: installing SIG_DFL runs no user code.
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }
    let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
}

fn apply_hint(pid: Pid, name: &str, hint: &SchedulingHint) -> Vec<DegradedHint> {
    let mut degraded = Vec::new();

    if let Some(value) = hint.nice {
        // SAFETY: plain syscall, no pointers involved.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid.as_raw() as libc::id_t, value) };
        if let Err(errno) = Errno::result(rc) {
            degraded.push(DegradedHint::new(
                pid,
                name,
                HintSetting::Nice { value },
                errno,
            ));
        }
    }

    if hint.changes_policy() {
        // SAFETY: zeroed sched_param is a valid value on every libc target.
        let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
        param.sched_priority = hint.priority;
        // SAFETY: `param` outlives the call.
        let rc = unsafe { libc::sched_setscheduler(pid.as_raw(), hint.policy.as_raw(), &param) };
        match Errno::result(rc) {
            Ok(_) => log::debug!(
                "[{}] Scheduling set to {} priority {}",
                name,
                hint.policy,
                hint.priority
            ),
            Err(errno) => degraded.push(DegradedHint::new(
                pid,
                name,
                HintSetting::Policy {
                    policy: hint.policy,
                    priority: hint.priority,
                },
                errno,
            )),
        }
    }

    degraded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_spec_builder() {
        let spec = ChildSpec::new("rt", Behavior::BusyLoop)
            .with_hint(SchedulingHint::realtime(SchedPolicy::Fifo, 80));
        assert_eq!(spec.name, "rt");
        assert_eq!(spec.hint.unwrap().priority, 80);
    }

    #[test]
    fn test_invalid_hint_rejected_before_fork() {
        let spec = ChildSpec::new("bad", Behavior::ExitImmediately { code: 0 })
            .with_hint(SchedulingHint::realtime(SchedPolicy::Fifo, 0));
        let result = spawn(&spec);
        assert!(matches!(result, Err(LaunchError::InvalidHint { .. })));
    }

    #[test]
    fn test_uncatchable_signal_rejected_before_fork() {
        let spec = ChildSpec::new(
            "stubborn",
            Behavior::ExitOnSignal {
                signal: libc::SIGKILL,
                code: 0,
            },
        );
        let err = spawn(&spec).unwrap_err();
        assert!(matches!(err, LaunchError::InvalidBehavior { .. }));
        assert!(err.to_string().contains("'stubborn'"));
    }

    #[test]
    fn test_degraded_hint_permission() {
        let hint = DegradedHint::new(
            Pid::from_raw(42),
            "rt",
            HintSetting::Policy {
                policy: SchedPolicy::Fifo,
                priority: 80,
            },
            Errno::EPERM,
        );
        assert!(hint.permission_denied());
        assert_eq!(hint.pid, 42);
        assert_eq!(hint.setting.to_string(), "fifo priority 80");

        let other = DegradedHint::new(
            Pid::from_raw(42),
            "rt",
            HintSetting::Nice { value: 5 },
            Errno::ESRCH,
        );
        assert!(!other.permission_denied());
        assert_eq!(other.setting.to_string(), "nice 5");
    }
}
