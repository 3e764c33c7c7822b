//! Process-state demonstration fixture
//!
//! Spawns four children and walks each through the state it is named after:
//!
//! | child      | behavior           | what is checked                              |
//! |------------|--------------------|----------------------------------------------|
//! | `running`  | busy loop          | seen running, then killed                    |
//! | `sleeping` | sleep loop         | seen sleeping, then killed                   |
//! | `zombie`   | exit immediately   | observed as a zombie, reaped within deadline |
//! | `stopped`  | wait for a signal  | stopped, continued, then terminated          |

use crate::runtime::{
    signals, Behavior, ChildSpec, EventSink, LifecycleEvent, LifecycleState, Monitor,
    MonitorEvent, MonitorSummary,
};
use crate::scenario::{await_event, await_reaped, guarded, launch_tracked, ScenarioError};
use std::time::{Duration, Instant};

/// Timing knobs for the fixture
#[derive(Debug, Clone)]
pub struct ProcessStatesOptions {
    /// Pause after spawning before the process table is inspected
    pub settle: Duration,
    /// Sleep interval of the `sleeping` child
    pub sleep_interval_ms: u64,
    /// Upper bound from spawn to the reap of the `zombie` child
    pub reap_deadline: Duration,
    /// Upper bound from SIGSTOP to the stop notification
    pub stop_window: Duration,
}

impl Default for ProcessStatesOptions {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(1),
            sleep_interval_ms: 10_000,
            reap_deadline: Duration::from_secs(2),
            stop_window: Duration::from_secs(5),
        }
    }
}

impl ProcessStatesOptions {
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// The zombie is only reaped after the settle pause, so the pause must
    /// leave room inside the reap deadline
    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.settle >= self.reap_deadline {
            return Err(ScenarioError::InvalidOptions(format!(
                "settle {:?} must be shorter than the reap deadline {:?}",
                self.settle, self.reap_deadline
            )));
        }
        Ok(())
    }

    fn specs(&self) -> [ChildSpec; 4] {
        [
            ChildSpec::new("running", Behavior::BusyLoop),
            ChildSpec::new(
                "sleeping",
                Behavior::SleepLoop {
                    interval_ms: self.sleep_interval_ms,
                },
            ),
            ChildSpec::new("zombie", Behavior::ExitImmediately { code: 0 }),
            ChildSpec::new("stopped", Behavior::WaitForSignal),
        ]
    }
}

/// Run the fixture, reporting every event to `sink`.
///
/// Ends with every child reaped and a `Finished` event.
pub fn run<S: EventSink + ?Sized>(
    sink: &mut S,
    options: &ProcessStatesOptions,
) -> Result<MonitorSummary, ScenarioError> {
    options.validate()?;
    log::info!("Starting process-state fixture");

    let started = Instant::now();
    let mut monitor = Monitor::new();
    let children = launch_tracked(&mut monitor, &options.specs(), sink)?;
    let [busy, sleeper, exiting, waiter] = [0, 1, 2, 3].map(|i| children[i].pid);

    guarded(&mut monitor, sink, |monitor, sink| {
        std::thread::sleep(options.settle);

        // Reap of the exiting child is deferred so the zombie can be shown
        if !monitor.observe_zombie(exiting)? {
            return Err(ScenarioError::Expectation(format!(
                "'zombie' (pid {}) has not terminated after {:?}",
                exiting, options.settle
            )));
        }
        for inspection in monitor.refresh_activity() {
            sink.emit(MonitorEvent::Inspected(inspection));
        }

        for event in monitor.poll()? {
            sink.emit(MonitorEvent::Child(event));
        }
        if monitor.state(exiting) != Some(LifecycleState::Reaped) {
            return Err(ScenarioError::Expectation(format!(
                "'zombie' (pid {}) was not reaped by the first poll",
                exiting
            )));
        }
        let reaped_after = started.elapsed();
        if reaped_after > options.reap_deadline {
            return Err(ScenarioError::Expectation(format!(
                "'zombie' reaped after {:?}, deadline is {:?}",
                reaped_after, options.reap_deadline
            )));
        }

        signals::stop(waiter)?;
        let stop_sent = Instant::now();
        await_event(monitor, sink, waiter, "a stop", |e| {
            matches!(e, LifecycleEvent::Stopped { .. })
        })?;
        if stop_sent.elapsed() > options.stop_window {
            return Err(ScenarioError::Expectation(format!(
                "stop of 'stopped' reported after {:?}",
                stop_sent.elapsed()
            )));
        }

        signals::resume(waiter)?;
        await_event(monitor, sink, waiter, "a continue", |e| {
            *e == LifecycleEvent::Continued
        })?;

        signals::kill(busy)?;
        signals::kill(sleeper)?;
        await_reaped(monitor, sink, &[busy, sleeper])?;

        signals::terminate(waiter)?;
        await_reaped(monitor, sink, &[waiter])
    })?;

    Ok(monitor.run_forever(sink)?)
}
