//! Procwatch
//!
//! A small process supervisor: it forks children with fixed behaviors, blocks
//! on the kernel's wait channel and classifies every lifecycle change into a
//! single event stream.
//!
//! # Overview
//!
//! - Launch children that spin, sleep, exit or wait for a signal, optionally
//!   under a real-time class or a nice value (applied best effort)
//! - Track each child through Running, Sleeping, Stopped, Zombie and Reaped
//! - Reap promptly and report stops, continues, exits and signal deaths
//! - Run fixtures that demonstrate each process state and real-time starvation
//!
//! # Example Watch Plan
//!
//! ```yaml
//! version: "1.0"
//!
//! children:
//!   spinner:
//!     behavior:
//!       kind: busy_loop
//!     scheduling:
//!       policy: fifo
//!       priority: 80
//!
//!   napper:
//!     behavior:
//!       kind: sleep_loop
//!       interval_ms: 10000
//! ```

pub mod cli;
pub mod config;
pub mod runtime;
pub mod scenario;

pub use cli::WatchArgs;
pub use config::{ChildConfig, WatchPlan, WatchPlanError};
pub use runtime::{
    Behavior, ChildEvent, ChildSpec, EventSink, LaunchError, LifecycleEvent, LifecycleState,
    LogSink, Monitor, MonitorError, MonitorEvent, MonitorSummary, SchedPolicy, SchedulingHint,
    SpawnedChild, Tally, WaitTarget,
};
pub use scenario::ScenarioError;
