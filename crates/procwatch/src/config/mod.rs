//! Watch plan configuration parsing

mod watch_plan;

pub use watch_plan::*;
