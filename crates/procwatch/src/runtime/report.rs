//! Classified event stream and its sinks

use crate::runtime::behavior::Behavior;
use crate::runtime::launcher::{DegradedHint, SpawnedChild};
use crate::runtime::monitor::{ChildEvent, Inspection, MonitorSummary};
use crate::runtime::status::{LifecycleEvent, LifecycleState};
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

/// Everything the supervisor reports, in the order it happened
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// A child was forked
    Spawned {
        pid: i32,
        name: String,
        behavior: Behavior,
    },
    /// A scheduling hint could not be applied
    Degraded(DegradedHint),
    /// A wait notification, classified
    Child(ChildEvent),
    /// External process-table snapshot of one child
    Inspected(Inspection),
    /// Supervisor progress tick
    Heartbeat { seq: u32 },
    /// The supervisor itself got SIGINT/SIGTERM
    Interrupted,
    /// Monitoring ended with nothing left to wait for
    Finished(MonitorSummary),
}

impl MonitorEvent {
    /// `Spawned` plus one `Degraded` per refused hint setting
    pub fn from_spawn(child: &SpawnedChild) -> Vec<MonitorEvent> {
        let mut events = vec![MonitorEvent::Spawned {
            pid: child.pid.as_raw(),
            name: child.name.clone(),
            behavior: child.behavior,
        }];
        events.extend(child.degraded.iter().cloned().map(MonitorEvent::Degraded));
        events
    }

    /// Log level used when the event goes through the `log` facade
    pub fn level(&self) -> log::Level {
        match self {
            MonitorEvent::Degraded(_) | MonitorEvent::Interrupted => log::Level::Warn,
            MonitorEvent::Child(ChildEvent {
                event: LifecycleEvent::Unknown { .. },
                ..
            }) => log::Level::Warn,
            MonitorEvent::Child(ChildEvent { name: None, .. }) => log::Level::Debug,
            MonitorEvent::Heartbeat { .. } | MonitorEvent::Inspected(_) => log::Level::Debug,
            _ => log::Level::Info,
        }
    }
}

impl fmt::Display for MonitorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorEvent::Spawned {
                pid,
                name,
                behavior,
            } => write!(f, "[{}] pid={} spawned ({})", name, pid, behavior),
            MonitorEvent::Degraded(d) => write!(
                f,
                "[{}] pid={} degraded: {} not applied ({}), default scheduling",
                d.name, d.pid, d.setting, d.reason
            ),
            MonitorEvent::Child(ev) => {
                match &ev.name {
                    Some(name) => write!(f, "[{}] pid={} {}", name, ev.pid, ev.event)?,
                    None => write!(f, "pid={} (untracked) {}", ev.pid, ev.event)?,
                }
                if let Some(state) = ev.state {
                    write!(f, " -> {}", state)?;
                }
                Ok(())
            }
            MonitorEvent::Inspected(i) => write!(
                f,
                "[{}] pid={} observed {} (tracked as {})",
                i.name, i.pid, i.observed, i.state
            ),
            MonitorEvent::Heartbeat { seq } => write!(f, "supervisor heartbeat {}", seq),
            MonitorEvent::Interrupted => f.write_str("supervisor interrupted"),
            MonitorEvent::Finished(s) => write!(
                f,
                "monitoring finished: {} reaped, {} unknown, {} untracked, {} lost",
                s.reaped.len(),
                s.unknown,
                s.untracked,
                s.lost.len()
            ),
        }
    }
}

/// Destination for classified events
pub trait EventSink {
    fn emit(&mut self, event: MonitorEvent);
}

impl<S: EventSink + ?Sized> EventSink for &mut S {
    fn emit(&mut self, event: MonitorEvent) {
        (**self).emit(event);
    }
}

impl EventSink for Vec<MonitorEvent> {
    fn emit(&mut self, event: MonitorEvent) {
        self.push(event);
    }
}

impl EventSink for mpsc::UnboundedSender<MonitorEvent> {
    fn emit(&mut self, event: MonitorEvent) {
        // Receiver gone means the process is on its way out
        let _ = self.send(event);
    }
}

/// Writes every event through the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&mut self, event: MonitorEvent) {
        log::log!(event.level(), "{}", event);
    }
}

/// Running counts, owned by whoever consumes the stream
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Tally {
    pub spawned: usize,
    pub reaped: usize,
    pub stopped: usize,
    pub continued: usize,
    pub unknown: usize,
    pub degraded: usize,
}

impl Tally {
    pub fn observe(&mut self, event: &MonitorEvent) {
        match event {
            MonitorEvent::Spawned { .. } => self.spawned += 1,
            MonitorEvent::Degraded(_) => self.degraded += 1,
            MonitorEvent::Child(ev) if ev.is_tracked() => {
                match ev.event {
                    LifecycleEvent::Stopped { .. } => self.stopped += 1,
                    LifecycleEvent::Continued => self.continued += 1,
                    LifecycleEvent::Unknown { .. } => self.unknown += 1,
                    _ => {}
                }
                if ev.state == Some(LifecycleState::Reaped) {
                    self.reaped += 1;
                }
            }
            _ => {}
        }
    }

    /// Spawned children not reaped yet; these are orphaned on interruption
    pub fn live(&self) -> usize {
        self.spawned.saturating_sub(self.reaped)
    }
}
