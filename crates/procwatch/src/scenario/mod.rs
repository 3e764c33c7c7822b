//! Supervision scenarios built on the launcher and monitor
//!
//! - [`supervise`]: launch a watch plan and report until every child is gone
//! - [`process_states`]: drive children through running, sleeping, zombie and
//!   stopped states and check each one is observed
//! - [`starvation`]: a real-time busy child competing with supervisor heartbeats

pub mod process_states;
pub mod starvation;
pub mod supervise;

use crate::runtime::{
    signals, spawn, ChildEvent, ChildSpec, EventSink, LaunchError, LifecycleEvent, Monitor,
    MonitorError, MonitorEvent, SignalError, SpawnedChild,
};
use nix::unistd::Pid;

/// Errors that abort a scenario
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("Launch failed: {0}")]
    Launch(#[from] LaunchError),

    #[error("Monitor failed: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Signal failed: {0}")]
    Signal(#[from] SignalError),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Expectation failed: {0}")]
    Expectation(String),
}

/// Spawn and track every spec, reporting each spawn.
///
/// On a launch error the children already started are killed and reaped.
pub(crate) fn launch_tracked<S: EventSink + ?Sized>(
    monitor: &mut Monitor,
    specs: &[ChildSpec],
    sink: &mut S,
) -> Result<Vec<SpawnedChild>, ScenarioError> {
    let mut children = Vec::with_capacity(specs.len());

    for spec in specs {
        let child = match spawn(spec) {
            Ok(child) => child,
            Err(e) => {
                abandon(monitor, sink);
                return Err(e.into());
            }
        };
        for event in MonitorEvent::from_spawn(&child) {
            sink.emit(event);
        }
        if let Err(e) = monitor.track(&child) {
            abandon(monitor, sink);
            return Err(e.into());
        }
        children.push(child);
    }

    Ok(children)
}

/// Run `body`, killing and reaping whatever is still tracked if it fails
pub(crate) fn guarded<S, T, F>(monitor: &mut Monitor, sink: &mut S, body: F) -> Result<T, ScenarioError>
where
    S: EventSink + ?Sized,
    F: FnOnce(&mut Monitor, &mut S) -> Result<T, ScenarioError>,
{
    let result = body(monitor, sink);
    if result.is_err() {
        abandon(monitor, sink);
    }
    result
}

/// Block until `pid` reports an event matching `wanted`.
///
/// Every event seen on the way is reported. Fails if `pid` is reaped first.
pub(crate) fn await_event<S, F>(
    monitor: &mut Monitor,
    sink: &mut S,
    pid: Pid,
    what: &str,
    wanted: F,
) -> Result<ChildEvent, ScenarioError>
where
    S: EventSink + ?Sized,
    F: Fn(&LifecycleEvent) -> bool,
{
    while let Some(event) = monitor.next_event()? {
        sink.emit(MonitorEvent::Child(event.clone()));
        if event.pid != pid.as_raw() {
            continue;
        }
        if wanted(&event.event) {
            return Ok(event);
        }
        if event.event.is_terminal() {
            return Err(ScenarioError::Expectation(format!(
                "pid {} {} while waiting for {}",
                pid, event.event, what
            )));
        }
    }

    Err(ScenarioError::Expectation(format!(
        "nothing left to wait for while expecting {} from pid {}",
        what, pid
    )))
}

/// Block until every pid in `pids` has been reaped, in whatever order
pub(crate) fn await_reaped<S: EventSink + ?Sized>(
    monitor: &mut Monitor,
    sink: &mut S,
    pids: &[Pid],
) -> Result<(), ScenarioError> {
    let pending = |monitor: &Monitor| {
        pids.iter()
            .any(|pid| monitor.state(*pid).is_some_and(|s| !s.is_terminal()))
    };

    while pending(monitor) {
        match monitor.next_event()? {
            Some(event) => sink.emit(MonitorEvent::Child(event)),
            None => {
                return Err(ScenarioError::Expectation(format!(
                    "nothing left to wait for before {:?} were reaped",
                    pids
                )))
            }
        }
    }
    Ok(())
}

/// Kill everything still tracked and reap it
pub(crate) fn abandon<S: EventSink + ?Sized>(monitor: &mut Monitor, sink: &mut S) {
    let live: Vec<Pid> = monitor
        .records()
        .filter(|r| !r.state.is_terminal())
        .map(|r| r.pid)
        .collect();
    if live.is_empty() {
        return;
    }

    log::warn!("Killing {} remaining children", live.len());
    for pid in live {
        if let Err(e) = signals::kill(pid) {
            log::warn!("{}", e);
        }
    }

    loop {
        match monitor.next_event() {
            Ok(Some(event)) => sink.emit(MonitorEvent::Child(event)),
            Ok(None) => break,
            Err(e) => {
                log::error!("Reaping abandoned children failed: {}", e);
                break;
            }
        }
    }
}
