//! Plain supervision of a watch plan

use crate::config::WatchPlan;
use crate::runtime::{EventSink, Monitor, MonitorSummary};
use crate::scenario::{launch_tracked, ScenarioError};

/// Launch every child in `plan` and report until none is left.
///
/// Children that never terminate keep this blocked until they are signalled
/// from outside.
pub fn run<S: EventSink + ?Sized>(
    plan: &WatchPlan,
    sink: &mut S,
) -> Result<MonitorSummary, ScenarioError> {
    let specs = plan.child_specs();
    log::info!("Supervising {} children", specs.len());

    let mut monitor = Monitor::new();
    launch_tracked(&mut monitor, &specs, sink)?;
    Ok(monitor.run_forever(sink)?)
}
