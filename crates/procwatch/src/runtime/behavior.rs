//! Child behaviors and scheduling hints

use crate::runtime::status::signal_name;
use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

/// Work a child performs once it has been forked.
///
/// Fixed at spawn time. Every variant except `ExitImmediately` and `ExitAfter`
/// runs until a signal ends it. Exit codes are `u8` because the kernel keeps
/// only the low eight bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Behavior {
    /// Spin on the CPU without ever yielding
    BusyLoop,
    /// Sleep forever in `interval_ms` chunks
    SleepLoop {
        #[serde(default = "default_sleep_interval_ms")]
        interval_ms: u64,
    },
    /// Exit at once with `code`
    ExitImmediately {
        #[serde(default)]
        code: u8,
    },
    /// Sleep for `delay_ms`, then exit with `code`
    ExitAfter {
        delay_ms: u64,
        #[serde(default)]
        code: u8,
    },
    /// Suspend until a signal arrives, forever
    WaitForSignal,
    /// Suspend with a handler for `signal` that exits with `code` instead of
    /// taking the default action
    ExitOnSignal {
        #[serde(default = "default_handled_signal")]
        signal: i32,
        #[serde(default)]
        code: u8,
    },
}

fn default_sleep_interval_ms() -> u64 {
    10_000
}

fn default_handled_signal() -> i32 {
    libc::SIGINT
}

/// Exit code used by the handler installed for `ExitOnSignal`.
///
/// Written once in the child before the handler is installed; the child owns
/// its copy of this static after fork.
static HANDLER_EXIT_CODE: AtomicI32 = AtomicI32::new(0);

extern "C" fn exit_from_handler(_: libc::c_int) {
    // SAFETY: _exit is async-signal-safe and never returns.
    unsafe { libc::_exit(HANDLER_EXIT_CODE.load(Ordering::Relaxed)) }
}

impl Behavior {
    /// Sleep loop with the default ten second interval
    pub fn sleep_loop() -> Self {
        Behavior::SleepLoop {
            interval_ms: default_sleep_interval_ms(),
        }
    }

    /// Short machine-friendly name
    pub fn kind(&self) -> &'static str {
        match self {
            Behavior::BusyLoop => "busy_loop",
            Behavior::SleepLoop { .. } => "sleep_loop",
            Behavior::ExitImmediately { .. } => "exit_immediately",
            Behavior::ExitAfter { .. } => "exit_after",
            Behavior::WaitForSignal => "wait_for_signal",
            Behavior::ExitOnSignal { .. } => "exit_on_signal",
        }
    }

    /// Whether the behavior ends on its own without any signal
    pub fn terminates_on_its_own(&self) -> bool {
        matches!(
            self,
            Behavior::ExitImmediately { .. } | Behavior::ExitAfter { .. }
        )
    }

    /// Whether the child installs something the parent must wait for before
    /// it may signal the child
    pub(crate) fn needs_ready_handshake(&self) -> bool {
        matches!(self, Behavior::ExitOnSignal { .. })
    }

    /// Check the parts serde cannot: the handled signal must exist and be catchable
    pub fn validate(&self) -> Result<(), BehaviorError> {
        if let Behavior::ExitOnSignal { signal, .. } = *self {
            match Signal::try_from(signal) {
                Ok(Signal::SIGKILL | Signal::SIGSTOP) | Err(_) => {
                    return Err(BehaviorError::UncatchableSignal(signal))
                }
                Ok(_) => {}
            }
        }
        Ok(())
    }

    /// Child-side setup that must be in place before the parent signals the child.
    ///
    /// Runs after `fork`; async-signal-safe calls only.
    pub(crate) fn prepare(&self) {
        if let Behavior::ExitOnSignal { signal, code } = *self {
            let Ok(signal) = Signal::try_from(signal) else {
                return;
            };
            HANDLER_EXIT_CODE.store(i32::from(code), Ordering::Relaxed);
            let action = SigAction::new(
                SigHandler::Handler(exit_from_handler),
                SaFlags::empty(),
                SigSet::empty(),
            );
            // SAFETY: the handler only calls _exit and reads an atomic.
            let _ = unsafe { signal::sigaction(signal, &action) };
        }
    }

    /// Child-side entry point. Never returns.
    ///
    /// Runs after `fork` in a possibly multi-threaded parent image, so only
    /// async-signal-safe calls are allowed here: no allocation, no locks, no logging.
    pub(crate) fn run(self) -> ! {
        match self {
            Behavior::BusyLoop => {
                let mut spins: u64 = 0;
                loop {
                    spins = std::hint::black_box(spins.wrapping_add(1));
                }
            }
            Behavior::SleepLoop { interval_ms } => loop {
                std::thread::sleep(Duration::from_millis(interval_ms.max(1)));
            },
            // SAFETY: _exit skips atexit handlers and stdio flushing that belong
            // to the parent image.
            Behavior::ExitImmediately { code } => unsafe { libc::_exit(i32::from(code)) },
            Behavior::ExitAfter { delay_ms, code } => {
                std::thread::sleep(Duration::from_millis(delay_ms));
                // SAFETY: as above.
                unsafe { libc::_exit(i32::from(code)) }
            }
            Behavior::WaitForSignal | Behavior::ExitOnSignal { .. } => loop {
                nix::unistd::pause();
            },
        }
    }
}

impl fmt::Display for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Behavior::SleepLoop { interval_ms } => write!(f, "sleep_loop({}ms)", interval_ms),
            Behavior::ExitImmediately { code } => write!(f, "exit_immediately({})", code),
            Behavior::ExitAfter { delay_ms, code } => {
                write!(f, "exit_after({}ms, {})", delay_ms, code)
            }
            Behavior::ExitOnSignal { signal, code } => {
                write!(f, "exit_on_signal({}, {})", signal_name(*signal), code)
            }
            other => f.write_str(other.kind()),
        }
    }
}

/// Behavior rejected before spawn
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BehaviorError {
    #[error("Signal {0} cannot be handled")]
    UncatchableSignal(i32),
}

/// Kernel scheduling policy requested for a child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedPolicy {
    /// Default time-sharing class
    #[default]
    Other,
    Batch,
    Idle,
    /// Real-time first-in first-out
    Fifo,
    /// Real-time round-robin
    RoundRobin,
}

impl SchedPolicy {
    /// Real-time classes take a static priority and usually need privilege
    pub fn is_realtime(self) -> bool {
        matches!(self, SchedPolicy::Fifo | SchedPolicy::RoundRobin)
    }

    pub(crate) fn as_raw(self) -> libc::c_int {
        match self {
            SchedPolicy::Other => libc::SCHED_OTHER,
            SchedPolicy::Batch => libc::SCHED_BATCH,
            SchedPolicy::Idle => libc::SCHED_IDLE,
            SchedPolicy::Fifo => libc::SCHED_FIFO,
            SchedPolicy::RoundRobin => libc::SCHED_RR,
        }
    }
}

impl fmt::Display for SchedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedPolicy::Other => "other",
            SchedPolicy::Batch => "batch",
            SchedPolicy::Idle => "idle",
            SchedPolicy::Fifo => "fifo",
            SchedPolicy::RoundRobin => "round_robin",
        };
        f.write_str(name)
    }
}

/// Valid static priorities for the real-time classes
pub const REALTIME_PRIORITY_RANGE: std::ops::RangeInclusive<i32> = 1..=99;

/// Valid nice values
pub const NICE_RANGE: std::ops::RangeInclusive<i32> = -20..=19;

/// Optional scheduling request attached to a spawn.
///
/// Failing to apply a valid hint never fails the spawn; the child keeps the
/// default class and the failure is reported as degraded mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchedulingHint {
    #[serde(default)]
    pub policy: SchedPolicy,
    /// Static priority, 1..=99 for real-time classes and 0 otherwise
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub nice: Option<i32>,
}

impl SchedulingHint {
    /// Real-time class with a static priority
    pub fn realtime(policy: SchedPolicy, priority: i32) -> Self {
        Self {
            policy,
            priority,
            nice: None,
        }
    }

    /// Default class with a nice value
    pub fn nice(value: i32) -> Self {
        Self {
            nice: Some(value),
            ..Default::default()
        }
    }

    /// Whether the policy/priority pair needs a `sched_setscheduler` call
    pub fn changes_policy(&self) -> bool {
        self.policy != SchedPolicy::Other || self.priority != 0
    }

    /// Check ranges before anything is forked
    pub fn validate(&self) -> Result<(), HintError> {
        if self.policy.is_realtime() {
            if !REALTIME_PRIORITY_RANGE.contains(&self.priority) {
                return Err(HintError::InvalidPriority {
                    policy: self.policy,
                    priority: self.priority,
                });
            }
        } else if self.priority != 0 {
            return Err(HintError::InvalidPriority {
                policy: self.policy,
                priority: self.priority,
            });
        }

        if let Some(nice) = self.nice {
            if !NICE_RANGE.contains(&nice) {
                return Err(HintError::InvalidNice(nice));
            }
        }

        Ok(())
    }
}

/// Scheduling hint rejected before spawn
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HintError {
    #[error("Priority {priority} is not valid for policy '{policy}'")]
    InvalidPriority { policy: SchedPolicy, priority: i32 },

    #[error("Nice value {0} is outside -20..=19")]
    InvalidNice(i32),
}
