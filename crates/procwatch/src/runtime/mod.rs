//! Runtime components: launching, monitoring and reporting children

pub mod behavior;
pub mod inspect;
pub mod launcher;
pub mod monitor;
pub mod report;
pub mod signals;
pub mod status;

pub use behavior::*;
pub use inspect::*;
pub use launcher::{spawn, ChildSpec, DegradedHint, HintSetting, LaunchError, SpawnedChild};
pub use monitor::*;
pub use report::*;
pub use signals::SignalError;
pub use status::*;
