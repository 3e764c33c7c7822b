//! Lifecycle monitor - blocks on the wait channel and classifies every change

use crate::runtime::behavior::Behavior;
use crate::runtime::inspect::{Inspector, ObservedState};
use crate::runtime::launcher::SpawnedChild;
use crate::runtime::report::{EventSink, MonitorEvent};
use crate::runtime::status::{LifecycleEvent, LifecycleState, RawStatus};
use indexmap::IndexMap;
use nix::errno::Errno;
use nix::libc;
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::Serialize;

/// Bookkeeping for one spawned child
#[derive(Debug, Clone)]
pub struct ChildRecord {
    pub pid: Pid,
    pub name: String,
    pub behavior: Behavior,
    pub state: LifecycleState,
    /// Most recent notification, if any arrived yet
    pub last_status: Option<LastStatus>,
}

impl ChildRecord {
    fn new(child: &SpawnedChild) -> Self {
        Self {
            pid: child.pid,
            name: child.name.clone(),
            behavior: child.behavior,
            state: LifecycleState::Running,
            last_status: None,
        }
    }
}

/// Raw word and its classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastStatus {
    pub raw: RawStatus,
    pub event: LifecycleEvent,
}

/// One classified notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildEvent {
    pub pid: i32,
    /// `None` for pids the monitor does not track
    pub name: Option<String>,
    pub event: LifecycleEvent,
    /// State after the event; `None` for untracked pids
    pub state: Option<LifecycleState>,
}

impl ChildEvent {
    pub fn is_tracked(&self) -> bool {
        self.name.is_some()
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.pid)
    }
}

/// A child whose exit status was consumed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReapedChild {
    pub pid: i32,
    pub name: String,
    pub event: LifecycleEvent,
}

/// Totals over the monitor's lifetime
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorSummary {
    /// Reaped children in reap order
    pub reaped: Vec<ReapedChild>,
    /// Statuses that decoded to none of the known shapes
    pub unknown: usize,
    /// Statuses for pids not in the table
    pub untracked: usize,
    /// Tracked children whose status was consumed elsewhere, dropped unreported
    pub lost: Vec<LostChild>,
}

/// A tracked child the wait channel no longer knows about
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LostChild {
    pub pid: i32,
    pub name: String,
    /// Last state the monitor had for it
    pub state: LifecycleState,
}

/// External snapshot of one tracked child
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inspection {
    pub pid: i32,
    pub name: String,
    pub observed: ObservedState,
    pub state: LifecycleState,
}

/// Which children a wait call covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitTarget {
    /// Any child of this process
    #[default]
    AnyChild,
    /// One specific child
    Child(Pid),
}

impl WaitTarget {
    /// Whether a wait on this target can report `pid`
    pub fn covers(self, pid: Pid) -> bool {
        match self {
            WaitTarget::AnyChild => true,
            WaitTarget::Child(target) => target == pid,
        }
    }

    fn as_raw(self) -> libc::pid_t {
        match self {
            WaitTarget::AnyChild => -1,
            WaitTarget::Child(pid) => pid.as_raw(),
        }
    }
}

enum WaitOutcome {
    Status(Pid, RawStatus),
    NothingReady,
    NoChildren,
}

/// Errors that end monitoring
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Waiting for child status changes failed: {0}")]
    Wait(#[source] nix::Error),

    #[error("Process {pid} is already tracked as '{name}'")]
    AlreadyTracked { pid: i32, name: String },
}

/// Owns the child table and is the only thing that mutates it.
///
/// Reaped records stay in the table until the next call into the monitor, so a
/// record is dropped only after the caller has had the chance to report it.
pub struct Monitor {
    target: WaitTarget,
    children: IndexMap<Pid, ChildRecord>,
    summary: MonitorSummary,
    inspector: Option<Inspector>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    /// Monitor waiting on any child
    pub fn new() -> Self {
        Self::with_target(WaitTarget::AnyChild)
    }

    pub fn with_target(target: WaitTarget) -> Self {
        Self {
            target,
            children: IndexMap::new(),
            summary: MonitorSummary::default(),
            inspector: None,
        }
    }

    pub fn target(&self) -> WaitTarget {
        self.target
    }

    /// Start tracking a spawned child
    pub fn track(&mut self, child: &SpawnedChild) -> Result<(), MonitorError> {
        self.sweep();

        if let Some(existing) = self.children.get(&child.pid) {
            return Err(MonitorError::AlreadyTracked {
                pid: child.pid.as_raw(),
                name: existing.name.clone(),
            });
        }

        log::debug!("[{}] Tracking pid {}", child.name, child.pid);
        self.children.insert(child.pid, ChildRecord::new(child));
        Ok(())
    }

    /// Number of children not yet reaped
    pub fn tracked(&self) -> usize {
        self.children
            .values()
            .filter(|r| !r.state.is_terminal())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked() == 0
    }

    pub fn record(&self, pid: Pid) -> Option<&ChildRecord> {
        self.children.get(&pid)
    }

    /// Current state; `None` once the record has been dropped
    pub fn state(&self, pid: Pid) -> Option<LifecycleState> {
        self.children.get(&pid).map(|r| r.state)
    }

    pub fn records(&self) -> impl Iterator<Item = &ChildRecord> {
        self.children.values()
    }

    pub fn summary(&self) -> &MonitorSummary {
        &self.summary
    }

    fn has_work(&self) -> bool {
        match self.target {
            WaitTarget::AnyChild => !self.is_empty(),
            WaitTarget::Child(pid) => self.state(pid).is_some_and(|s| !s.is_terminal()),
        }
    }

    /// Block until one notification arrives and classify it.
    ///
    /// Returns `Ok(None)` when nothing is left to wait for: the tracked set is
    /// empty or the kernel reports no children.
    pub fn next_event(&mut self) -> Result<Option<ChildEvent>, MonitorError> {
        self.sweep();

        loop {
            if !self.has_work() {
                return Ok(None);
            }

            match self.wait_raw(libc::WUNTRACED | libc::WCONTINUED)? {
                WaitOutcome::Status(pid, raw) => return Ok(Some(self.classify(pid, raw))),
                WaitOutcome::NothingReady => continue,
                WaitOutcome::NoChildren => {
                    self.drop_unreachable();
                    return Ok(None);
                }
            }
        }
    }

    /// Drain every notification that is ready right now, without blocking
    pub fn poll(&mut self) -> Result<Vec<ChildEvent>, MonitorError> {
        self.sweep();

        let mut events = Vec::new();
        loop {
            match self.wait_raw(libc::WUNTRACED | libc::WCONTINUED | libc::WNOHANG)? {
                WaitOutcome::Status(pid, raw) => events.push(self.classify(pid, raw)),
                WaitOutcome::NothingReady => break,
                WaitOutcome::NoChildren => {
                    self.drop_unreachable();
                    break;
                }
            }
        }
        Ok(events)
    }

    /// Dispatch every notification to `sink` until nothing is left to wait for
    pub fn run_forever<S: EventSink + ?Sized>(
        &mut self,
        sink: &mut S,
    ) -> Result<MonitorSummary, MonitorError> {
        log::info!("Monitoring {} children", self.tracked());

        while let Some(event) = self.next_event()? {
            sink.emit(MonitorEvent::Child(event));
        }
        self.sweep();

        let summary = self.summary.clone();
        log::info!(
            "Monitoring finished: {} reaped, {} unknown, {} untracked, {} lost",
            summary.reaped.len(),
            summary.unknown,
            summary.untracked,
            summary.lost.len()
        );
        sink.emit(MonitorEvent::Finished(summary.clone()));
        Ok(summary)
    }

    /// Peek whether `pid` has terminated without consuming its exit status.
    ///
    /// On success the record moves to `Zombie` and stays there until the next
    /// wait reaps it. Returns whether the child is now a zombie.
    pub fn observe_zombie(&mut self, pid: Pid) -> Result<bool, MonitorError> {
        // A zombie outside the target would never be reaped by this monitor
        if !self.target.covers(pid) {
            return Ok(false);
        }
        let Some(record) = self.children.get_mut(&pid) else {
            return Ok(false);
        };
        if record.state.is_terminal() {
            return Ok(false);
        }

        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT | WaitPidFlag::WNOHANG;
        match waitid(Id::Pid(pid), flags) {
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => {
                if let Some(next) = record.state.to_zombie() {
                    log::info!(
                        "[{}] pid {} terminated, not reaped yet ({} -> {})",
                        record.name,
                        pid,
                        record.state,
                        next
                    );
                    record.state = next;
                }
                Ok(record.state == LifecycleState::Zombie)
            }
            Ok(_) => Ok(false),
            Err(Errno::ECHILD) => Ok(false),
            Err(e) => Err(MonitorError::Wait(e)),
        }
    }

    /// Refresh Running/Sleeping from the OS process table.
    ///
    /// Stopped, Zombie and Reaped are owned by the wait channel and never
    /// changed here. Returns one snapshot per live record.
    pub fn refresh_activity(&mut self) -> Vec<Inspection> {
        let pids: Vec<Pid> = self
            .children
            .values()
            .filter(|r| !r.state.is_terminal())
            .map(|r| r.pid)
            .collect();
        if pids.is_empty() {
            return Vec::new();
        }

        let observed = self
            .inspector
            .get_or_insert_with(Inspector::new)
            .observe(&pids);

        let mut inspections = Vec::with_capacity(observed.len());
        for (pid, seen) in observed {
            let Some(record) = self.children.get_mut(&pid) else {
                continue;
            };

            if record.state.is_active() {
                let next = match seen {
                    ObservedState::Running => Some(LifecycleState::Running),
                    ObservedState::Sleeping => Some(LifecycleState::Sleeping),
                    _ => None,
                };
                if let Some(next) = next.filter(|n| *n != record.state) {
                    log::debug!(
                        "[{}] pid {} {} -> {}",
                        record.name,
                        pid,
                        record.state,
                        next
                    );
                    record.state = next;
                }
            }

            inspections.push(Inspection {
                pid: pid.as_raw(),
                name: record.name.clone(),
                observed: seen,
                state: record.state,
            });
        }
        inspections
    }

    /// One `waitpid` call, retried on EINTR
    fn wait_raw(&self, flags: libc::c_int) -> Result<WaitOutcome, MonitorError> {
        let target = self.target.as_raw();
        loop {
            let mut status: libc::c_int = 0;
            // SAFETY: `status` is a valid out-pointer for the duration of the call.
            let res = Errno::result(unsafe { libc::waitpid(target, &mut status, flags) });
            match res {
                Ok(0) => return Ok(WaitOutcome::NothingReady),
                Ok(pid) => return Ok(WaitOutcome::Status(Pid::from_raw(pid), status)),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(WaitOutcome::NoChildren),
                Err(e) => return Err(MonitorError::Wait(e)),
            }
        }
    }

    fn classify(&mut self, pid: Pid, raw: RawStatus) -> ChildEvent {
        let event = LifecycleEvent::decode(raw);

        let Some(record) = self
            .children
            .get_mut(&pid)
            .filter(|r| !r.state.is_terminal())
        else {
            self.summary.untracked += 1;
            log::debug!("Status for untracked pid {}: {}", pid, event);
            return ChildEvent {
                pid: pid.as_raw(),
                name: None,
                event,
                state: None,
            };
        };

        record.last_status = Some(LastStatus { raw, event });

        if let LifecycleEvent::Unknown { raw } = event {
            self.summary.unknown += 1;
            log::warn!(
                "[{}] Unrecognized wait status {:#06x} for pid {}, state left at {}",
                record.name,
                raw,
                pid,
                record.state
            );
        } else {
            match record.state.transition(&event) {
                Some(next) => {
                    log::info!(
                        "[{}] pid {} {} ({} -> {})",
                        record.name,
                        pid,
                        event,
                        record.state,
                        next
                    );
                    record.state = next;
                }
                None => log::debug!(
                    "[{}] pid {} {}, state stays {}",
                    record.name,
                    pid,
                    event,
                    record.state
                ),
            }
        }

        if record.state.is_terminal() {
            self.summary.reaped.push(ReapedChild {
                pid: pid.as_raw(),
                name: record.name.clone(),
                event,
            });
        }

        ChildEvent {
            pid: pid.as_raw(),
            name: Some(record.name.clone()),
            event,
            state: Some(record.state),
        }
    }

    /// ECHILD: every live record the target covers was reaped by someone else.
    ///
    /// Such records can never be reported, so they are dropped and counted
    /// instead of lingering as live children.
    fn drop_unreachable(&mut self) {
        let target = self.target;
        let lost: Vec<Pid> = self
            .children
            .values()
            .filter(|r| !r.state.is_terminal() && target.covers(r.pid))
            .map(|r| r.pid)
            .collect();

        for pid in lost {
            if let Some(record) = self.children.shift_remove(&pid) {
                log::warn!(
                    "[{}] pid {} is no longer our child (reaped elsewhere?), dropping it as {}",
                    record.name,
                    pid,
                    record.state
                );
                self.summary.lost.push(LostChild {
                    pid: pid.as_raw(),
                    name: record.name,
                    state: record.state,
                });
            }
        }
    }

    /// Drop records whose reap has already been reported
    fn sweep(&mut self) {
        self.children.retain(|_, r| !r.state.is_terminal());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_child(pid: i32, name: &str) -> SpawnedChild {
        SpawnedChild {
            pid: Pid::from_raw(pid),
            name: name.to_string(),
            behavior: Behavior::WaitForSignal,
            degraded: Vec::new(),
        }
    }

    const STOPPED_BY_SIGSTOP: RawStatus = (libc::SIGSTOP << 8) | 0x7f;

    #[test]
    fn test_empty_monitor_returns_immediately() {
        let mut monitor = Monitor::new();
        assert!(monitor.is_empty());
        assert!(monitor.next_event().unwrap().is_none());

        let mut events = Vec::new();
        let summary = monitor.run_forever(&mut events).unwrap();
        assert_eq!(summary, MonitorSummary::default());
        assert_eq!(events, vec![MonitorEvent::Finished(MonitorSummary::default())]);
    }

    #[test]
    fn test_track_rejects_duplicate_pid() {
        let mut monitor = Monitor::new();
        monitor.track(&fake_child(4242, "first")).unwrap();
        let err = monitor.track(&fake_child(4242, "second")).unwrap_err();
        assert!(matches!(err, MonitorError::AlreadyTracked { pid: 4242, .. }));
        assert_eq!(monitor.tracked(), 1);
    }

    #[test]
    fn test_classify_stop_continue_exit() {
        let mut monitor = Monitor::new();
        let pid = Pid::from_raw(4243);
        monitor.track(&fake_child(4243, "worker")).unwrap();

        let stopped = monitor.classify(pid, STOPPED_BY_SIGSTOP);
        assert_eq!(stopped.state, Some(LifecycleState::Stopped));
        assert_eq!(monitor.state(pid), Some(LifecycleState::Stopped));

        let continued = monitor.classify(pid, 0xffff);
        assert_eq!(continued.event, LifecycleEvent::Continued);
        assert_eq!(monitor.state(pid), Some(LifecycleState::Running));

        let exited = monitor.classify(pid, 3 << 8);
        assert_eq!(exited.event, LifecycleEvent::Exited { code: 3 });
        assert_eq!(exited.state, Some(LifecycleState::Reaped));
        assert!(monitor.is_empty());

        // Still visible until the caller comes back
        assert_eq!(monitor.state(pid), Some(LifecycleState::Reaped));
        monitor.sweep();
        assert_eq!(monitor.state(pid), None);

        assert_eq!(monitor.summary().reaped.len(), 1);
        assert_eq!(monitor.summary().reaped[0].name, "worker");
    }

    #[test]
    fn test_unknown_status_keeps_state() {
        let mut monitor = Monitor::new();
        let pid = Pid::from_raw(4244);
        monitor.track(&fake_child(4244, "odd")).unwrap();
        monitor.classify(pid, STOPPED_BY_SIGSTOP);

        let event = monitor.classify(pid, 0x00ff);
        assert_eq!(event.event, LifecycleEvent::Unknown { raw: 0x00ff });
        assert_eq!(event.state, Some(LifecycleState::Stopped));
        assert_eq!(monitor.summary().unknown, 1);

        let record = monitor.record(pid).unwrap();
        assert_eq!(record.last_status.unwrap().raw, 0x00ff);
    }

    #[test]
    fn test_untracked_pid_does_not_touch_table() {
        let mut monitor = Monitor::new();
        monitor.track(&fake_child(4245, "tracked")).unwrap();

        let event = monitor.classify(Pid::from_raw(9999), 0);
        assert!(!event.is_tracked());
        assert_eq!(event.state, None);
        assert_eq!(monitor.summary().untracked, 1);
        assert_eq!(monitor.tracked(), 1);
    }

    #[test]
    fn test_reaped_pid_is_not_revived() {
        let mut monitor = Monitor::new();
        let pid = Pid::from_raw(4246);
        monitor.track(&fake_child(4246, "once")).unwrap();
        monitor.classify(pid, 9);

        let again = monitor.classify(pid, 0xffff);
        assert!(!again.is_tracked());
        assert_eq!(monitor.summary().reaped.len(), 1);
    }

    #[test]
    fn test_pid_reuse_after_reap() {
        let mut monitor = Monitor::new();
        let pid = Pid::from_raw(4247);
        monitor.track(&fake_child(4247, "old")).unwrap();
        monitor.classify(pid, 0);

        monitor.track(&fake_child(4247, "new")).unwrap();
        assert_eq!(monitor.record(pid).unwrap().name, "new");
        assert_eq!(monitor.state(pid), Some(LifecycleState::Running));
    }

    #[test]
    fn test_observe_zombie_outside_target_is_refused() {
        let mine = Pid::from_raw(4250);
        let mut monitor = Monitor::with_target(WaitTarget::Child(mine));
        monitor.track(&fake_child(4251, "other")).unwrap();

        assert!(!monitor.observe_zombie(Pid::from_raw(4251)).unwrap());
        assert_eq!(
            monitor.state(Pid::from_raw(4251)),
            Some(LifecycleState::Running)
        );
        assert!(WaitTarget::AnyChild.covers(Pid::from_raw(4251)));
        assert!(!WaitTarget::Child(mine).covers(Pid::from_raw(4251)));
    }

    #[test]
    fn test_unreachable_records_dropped_and_counted() {
        let mut monitor = Monitor::with_target(WaitTarget::Child(Pid::from_raw(4252)));
        monitor.track(&fake_child(4252, "gone")).unwrap();
        monitor.track(&fake_child(4253, "elsewhere")).unwrap();

        monitor.drop_unreachable();

        assert_eq!(monitor.state(Pid::from_raw(4252)), None);
        // Outside the target, so ECHILD says nothing about it
        assert_eq!(
            monitor.state(Pid::from_raw(4253)),
            Some(LifecycleState::Running)
        );
        assert_eq!(
            monitor.summary().lost,
            vec![LostChild {
                pid: 4252,
                name: "gone".to_string(),
                state: LifecycleState::Running,
            }]
        );

        // The pid can be tracked again once dropped
        monitor.track(&fake_child(4252, "reused")).unwrap();
    }

    #[test]
    fn test_child_target_only_waits_for_its_pid() {
        let pid = Pid::from_raw(4248);
        let mut monitor = Monitor::with_target(WaitTarget::Child(pid));
        assert!(!monitor.has_work());

        monitor.track(&fake_child(4249, "other")).unwrap();
        assert!(!monitor.has_work());

        monitor.track(&fake_child(4248, "mine")).unwrap();
        assert!(monitor.has_work());
    }
}
