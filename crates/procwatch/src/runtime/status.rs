//! Lifecycle states and wait-status classification

use nix::libc;
use nix::sys::signal::Signal;
use serde::Serialize;
use std::fmt;

/// Raw status word as filled in by `waitpid`
pub type RawStatus = libc::c_int;

/// Where a child is in its life, as far as the supervisor knows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Executing or runnable (initial)
    Running,
    /// Blocked on a timed or I/O wait
    Sleeping,
    /// Suspended by a stop signal, resumable
    Stopped,
    /// Terminated, exit status not consumed yet
    Zombie,
    /// Exit status consumed; the pid is no longer ours
    Reaped,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Reaped
    }

    /// Running or Sleeping: the states only external inspection can tell apart
    pub fn is_active(self) -> bool {
        matches!(self, LifecycleState::Running | LifecycleState::Sleeping)
    }

    /// State after `event`, or `None` when the event does not move this state.
    ///
    /// Exit and fatal-signal notifications are consumed by the wait that reported
    /// them, so they lead straight to `Reaped`. Nothing leaves `Reaped`.
    pub fn transition(self, event: &LifecycleEvent) -> Option<LifecycleState> {
        use LifecycleState::*;

        match (self, event) {
            (Reaped, _) => None,
            (_, LifecycleEvent::Unknown { .. }) => None,
            (_, LifecycleEvent::Exited { .. } | LifecycleEvent::Killed { .. }) => Some(Reaped),
            (Running | Sleeping, LifecycleEvent::Stopped { .. }) => Some(Stopped),
            // A stop that was continued before we consumed it shows up as continued only
            (Stopped | Running | Sleeping, LifecycleEvent::Continued) => Some(Running),
            (Stopped | Zombie, LifecycleEvent::Stopped { .. }) => None,
            (Zombie, LifecycleEvent::Continued) => None,
        }
    }

    /// Exit observed without consuming it
    pub fn to_zombie(self) -> Option<LifecycleState> {
        match self {
            LifecycleState::Running | LifecycleState::Sleeping | LifecycleState::Stopped => {
                Some(LifecycleState::Zombie)
            }
            LifecycleState::Zombie | LifecycleState::Reaped => None,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Running => "running",
            LifecycleState::Sleeping => "sleeping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Zombie => "zombie",
            LifecycleState::Reaped => "reaped",
        };
        f.write_str(name)
    }
}

/// One decoded wait notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Normal termination
    Exited { code: i32 },
    /// Terminated by a signal
    Killed { signal: i32, core_dumped: bool },
    /// Suspended by a signal
    Stopped { signal: i32 },
    /// Resumed by SIGCONT
    Continued,
    /// Status word matching none of the shapes above
    Unknown { raw: RawStatus },
}

impl LifecycleEvent {
    /// Classify a raw status word. Never fails; odd words become `Unknown`.
    pub fn decode(raw: RawStatus) -> Self {
        if libc::WIFEXITED(raw) {
            LifecycleEvent::Exited {
                code: libc::WEXITSTATUS(raw),
            }
        } else if libc::WIFSIGNALED(raw) {
            LifecycleEvent::Killed {
                signal: libc::WTERMSIG(raw),
                core_dumped: libc::WCOREDUMP(raw),
            }
        } else if libc::WIFSTOPPED(raw) {
            LifecycleEvent::Stopped {
                signal: libc::WSTOPSIG(raw),
            }
        } else if libc::WIFCONTINUED(raw) {
            LifecycleEvent::Continued
        } else {
            LifecycleEvent::Unknown { raw }
        }
    }

    /// Exit or fatal signal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::Exited { .. } | LifecycleEvent::Killed { .. }
        )
    }

    /// Signal number carried by the event, if any
    pub fn signal(&self) -> Option<i32> {
        match self {
            LifecycleEvent::Killed { signal, .. } | LifecycleEvent::Stopped { signal } => {
                Some(*signal)
            }
            _ => None,
        }
    }
}

/// Symbolic name for a signal number, or "?" for numbers nix does not know
pub fn signal_name(signal: i32) -> &'static str {
    Signal::try_from(signal).map(Signal::as_str).unwrap_or("?")
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Exited { code } => write!(f, "exited with code {}", code),
            LifecycleEvent::Killed {
                signal,
                core_dumped,
            } => {
                write!(f, "killed by signal {} ({})", signal, signal_name(*signal))?;
                if *core_dumped {
                    f.write_str(", core dumped")?;
                }
                Ok(())
            }
            LifecycleEvent::Stopped { signal } => {
                write!(f, "stopped by signal {} ({})", signal, signal_name(*signal))
            }
            LifecycleEvent::Continued => f.write_str("continued"),
            LifecycleEvent::Unknown { raw } => write!(f, "unknown status {:#06x}", raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Linux status word layouts
    const fn exited(code: i32) -> RawStatus {
        (code & 0xff) << 8
    }
    const fn signaled(sig: i32) -> RawStatus {
        sig & 0x7f
    }
    const fn stopped(sig: i32) -> RawStatus {
        (sig << 8) | 0x7f
    }
    const CONTINUED: RawStatus = 0xffff;

    #[test]
    fn test_decode_exited() {
        assert_eq!(
            LifecycleEvent::decode(exited(0)),
            LifecycleEvent::Exited { code: 0 }
        );
        assert_eq!(
            LifecycleEvent::decode(exited(42)),
            LifecycleEvent::Exited { code: 42 }
        );
    }

    #[test]
    fn test_decode_signaled() {
        assert_eq!(
            LifecycleEvent::decode(signaled(libc::SIGKILL)),
            LifecycleEvent::Killed {
                signal: libc::SIGKILL,
                core_dumped: false
            }
        );
        assert_eq!(
            LifecycleEvent::decode(signaled(libc::SIGSEGV) | 0x80),
            LifecycleEvent::Killed {
                signal: libc::SIGSEGV,
                core_dumped: true
            }
        );
    }

    #[test]
    fn test_decode_stopped_and_continued() {
        assert_eq!(
            LifecycleEvent::decode(stopped(libc::SIGSTOP)),
            LifecycleEvent::Stopped {
                signal: libc::SIGSTOP
            }
        );
        assert_eq!(
            LifecycleEvent::decode(stopped(libc::SIGTSTP)),
            LifecycleEvent::Stopped {
                signal: libc::SIGTSTP
            }
        );
        assert_eq!(LifecycleEvent::decode(CONTINUED), LifecycleEvent::Continued);
    }

    #[test]
    fn test_decode_unknown() {
        // Low byte 0xff matches neither exit, signal nor stop; not 0xffff either
        assert_eq!(
            LifecycleEvent::decode(0x00ff),
            LifecycleEvent::Unknown { raw: 0x00ff }
        );
        assert_eq!(
            LifecycleEvent::decode(0x12ff),
            LifecycleEvent::Unknown { raw: 0x12ff }
        );
    }

    #[test]
    fn test_terminal_events_reap() {
        for state in [
            LifecycleState::Running,
            LifecycleState::Sleeping,
            LifecycleState::Stopped,
            LifecycleState::Zombie,
        ] {
            assert_eq!(
                state.transition(&LifecycleEvent::Exited { code: 0 }),
                Some(LifecycleState::Reaped)
            );
            assert_eq!(
                state.transition(&LifecycleEvent::Killed {
                    signal: 9,
                    core_dumped: false
                }),
                Some(LifecycleState::Reaped)
            );
        }
    }

    #[test]
    fn test_stop_continue_cycle() {
        let stop = LifecycleEvent::Stopped { signal: 19 };
        let state = LifecycleState::Running.transition(&stop).unwrap();
        assert_eq!(state, LifecycleState::Stopped);
        assert!(!state.is_terminal());

        let state = state.transition(&LifecycleEvent::Continued).unwrap();
        assert_eq!(state, LifecycleState::Running);

        assert_eq!(
            LifecycleState::Sleeping.transition(&stop),
            Some(LifecycleState::Stopped)
        );
        assert_eq!(LifecycleState::Stopped.transition(&stop), None);
    }

    #[test]
    fn test_reaped_is_final() {
        let events = [
            LifecycleEvent::Exited { code: 0 },
            LifecycleEvent::Stopped { signal: 19 },
            LifecycleEvent::Continued,
            LifecycleEvent::Unknown { raw: 0xff },
        ];
        for event in &events {
            assert_eq!(LifecycleState::Reaped.transition(event), None);
        }
        assert_eq!(LifecycleState::Reaped.to_zombie(), None);
    }

    #[test]
    fn test_unknown_leaves_state() {
        let unknown = LifecycleEvent::Unknown { raw: 0xff };
        assert_eq!(LifecycleState::Stopped.transition(&unknown), None);
        assert_eq!(LifecycleState::Running.transition(&unknown), None);
    }

    #[test]
    fn test_zombie_marking() {
        assert_eq!(
            LifecycleState::Stopped.to_zombie(),
            Some(LifecycleState::Zombie)
        );
        assert_eq!(LifecycleState::Zombie.to_zombie(), None);
        assert_eq!(
            LifecycleState::Zombie.transition(&LifecycleEvent::Continued),
            None
        );
    }

    #[test]
    fn test_event_display() {
        assert_eq!(
            LifecycleEvent::Killed {
                signal: 9,
                core_dumped: false
            }
            .to_string(),
            "killed by signal 9 (SIGKILL)"
        );
        assert_eq!(
            LifecycleEvent::Stopped {
                signal: libc::SIGSTOP
            }
            .to_string(),
            format!("stopped by signal {} (SIGSTOP)", libc::SIGSTOP)
        );
        assert_eq!(
            LifecycleEvent::Unknown { raw: 0xff }.to_string(),
            "unknown status 0x00ff"
        );
        assert_eq!(signal_name(1000), "?");
    }
}
