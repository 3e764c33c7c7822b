//! Signal delivery to children

use nix::sys::signal::{kill as send_raw, Signal};
use nix::unistd::Pid;

/// Errors delivering a signal
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("Failed to send {signal:?} to process {pid}: {source}")]
    Delivery {
        pid: i32,
        signal: Signal,
        #[source]
        source: nix::Error,
    },
}

/// Deliver `signal` to `pid`
pub fn send(pid: Pid, signal: Signal) -> Result<(), SignalError> {
    log::debug!("Sending {:?} to pid {}", signal, pid);
    send_raw(pid, signal).map_err(|source| SignalError::Delivery {
        pid: pid.as_raw(),
        signal,
        source,
    })
}

/// Suspend (SIGSTOP)
pub fn stop(pid: Pid) -> Result<(), SignalError> {
    send(pid, Signal::SIGSTOP)
}

/// Resume a stopped child (SIGCONT)
pub fn resume(pid: Pid) -> Result<(), SignalError> {
    send(pid, Signal::SIGCONT)
}

/// Ask to terminate (SIGTERM)
pub fn terminate(pid: Pid) -> Result<(), SignalError> {
    send(pid, Signal::SIGTERM)
}

/// Terminate unconditionally (SIGKILL), works on stopped children too
pub fn kill(pid: Pid) -> Result<(), SignalError> {
    send(pid, Signal::SIGKILL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_error_names_signal() {
        // Pid i32::MAX is above any pid_max, so kill fails with ESRCH
        let err = stop(Pid::from_raw(i32::MAX)).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("SIGSTOP"), "{}", message);
        assert!(message.contains(&i32::MAX.to_string()), "{}", message);
    }
}
