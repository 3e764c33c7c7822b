//! Real-time starvation fixture
//!
//! A busy child under a real-time class competes with the supervisor, which
//! keeps emitting heartbeats. On a single CPU the heartbeats fall behind while
//! the child holds the processor; without privilege the child runs under the
//! default class instead and a degraded event says so.

use crate::runtime::{
    signals, Behavior, ChildSpec, EventSink, Monitor, MonitorEvent, MonitorSummary,
    SchedPolicy, SchedulingHint,
};
use crate::scenario::{await_reaped, guarded, launch_tracked, ScenarioError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct StarvationOptions {
    pub policy: SchedPolicy,
    pub priority: i32,
    pub heartbeats: u32,
    pub interval: Duration,
}

impl Default for StarvationOptions {
    fn default() -> Self {
        Self {
            policy: SchedPolicy::Fifo,
            priority: 80,
            heartbeats: 10,
            interval: Duration::from_millis(500),
        }
    }
}

impl StarvationOptions {
    fn spec(&self) -> ChildSpec {
        ChildSpec::new("realtime", Behavior::BusyLoop)
            .with_hint(SchedulingHint::realtime(self.policy, self.priority))
    }
}

/// Outcome of one starvation run
#[derive(Debug, Clone)]
pub struct StarvationReport {
    pub summary: MonitorSummary,
    /// The child ran without its real-time class
    pub degraded: bool,
    /// Time the heartbeats took beyond `heartbeats * interval`
    pub lag: Duration,
}

/// Run the fixture, reporting every event to `sink`
pub fn run<S: EventSink + ?Sized>(
    sink: &mut S,
    options: &StarvationOptions,
) -> Result<StarvationReport, ScenarioError> {
    log::info!(
        "Starting starvation fixture: {} priority {}, {} heartbeats every {:?}",
        options.policy,
        options.priority,
        options.heartbeats,
        options.interval
    );

    let mut monitor = Monitor::new();
    let children = launch_tracked(&mut monitor, &[options.spec()], sink)?;
    let child = &children[0];
    let pid = child.pid;

    let lag = guarded(&mut monitor, sink, |monitor, sink| {
        let started = Instant::now();
        for seq in 0..options.heartbeats {
            std::thread::sleep(options.interval);
            sink.emit(MonitorEvent::Heartbeat { seq });
        }
        let lag = started
            .elapsed()
            .saturating_sub(options.interval * options.heartbeats);
        log::info!("Heartbeats finished {:?} behind schedule", lag);

        signals::kill(pid)?;
        await_reaped(monitor, sink, &[pid])?;
        Ok(lag)
    })?;

    let summary = monitor.run_forever(sink)?;
    Ok(StarvationReport {
        summary,
        degraded: child.is_degraded(),
        lag,
    })
}
