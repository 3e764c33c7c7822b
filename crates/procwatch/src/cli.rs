//! Command-line interface for procwatch

use crate::runtime::SchedPolicy;
use crate::scenario::process_states::ProcessStatesOptions;
use crate::scenario::starvation::StarvationOptions;
use argh::FromArgs;
use std::time::Duration;

/// Fork children, watch their lifecycle and report every change
#[derive(FromArgs, Debug)]
pub struct WatchArgs {
    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,

    /// print events as JSON lines instead of text
    #[argh(switch)]
    pub json: bool,

    #[argh(subcommand)]
    pub command: WatchCommand,
}

#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand)]
pub enum WatchCommand {
    Supervise(SuperviseArgs),
    States(StatesArgs),
    Starvation(StarvationArgs),
}

/// Launch the children of a watch plan and report until all are gone
#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "supervise")]
pub struct SuperviseArgs {
    /// path to the watch plan (default: two children waiting for a signal)
    #[argh(positional)]
    pub plan: Option<String>,

    /// validate the watch plan and exit
    #[argh(switch)]
    pub validate: bool,
}

/// Walk children through running, sleeping, zombie and stopped states
#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "states")]
pub struct StatesArgs {
    /// seconds to let the children settle before inspecting them (default: 1)
    #[argh(option, default = "1")]
    pub settle_secs: u64,
}

/// Run a real-time busy child against supervisor heartbeats
#[derive(FromArgs, Debug, PartialEq)]
#[argh(subcommand, name = "starvation")]
pub struct StarvationArgs {
    /// real-time priority of the busy child, 1-99 (default: 80)
    #[argh(option, short = 'p', default = "80")]
    pub priority: i32,

    /// number of heartbeats to emit (default: 10)
    #[argh(option, default = "10")]
    pub heartbeats: u32,

    /// milliseconds between heartbeats (default: 500)
    #[argh(option, default = "500")]
    pub interval_ms: u64,

    /// use round-robin instead of fifo
    #[argh(switch)]
    pub round_robin: bool,
}

impl WatchArgs {
    /// Filter passed to env_logger; unknown levels fall back to info
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "error" => "error",
            "warn" => "warn",
            "info" => "info",
            "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        }
    }
}

impl StatesArgs {
    pub fn options(&self) -> ProcessStatesOptions {
        ProcessStatesOptions::default().with_settle(Duration::from_secs(self.settle_secs))
    }
}

impl StarvationArgs {
    pub fn options(&self) -> StarvationOptions {
        StarvationOptions {
            policy: if self.round_robin {
                SchedPolicy::RoundRobin
            } else {
                SchedPolicy::Fifo
            },
            priority: self.priority,
            heartbeats: self.heartbeats,
            interval: Duration::from_millis(self.interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<WatchArgs, argh::EarlyExit> {
        WatchArgs::from_args(&["procwatch"], args)
    }

    #[test]
    fn test_supervise_defaults() {
        let args = parse(&["supervise"]).unwrap();
        assert_eq!(args.log_level, "info");
        assert!(!args.json);
        assert_eq!(
            args.command,
            WatchCommand::Supervise(SuperviseArgs {
                plan: None,
                validate: false
            })
        );
    }

    #[test]
    fn test_supervise_with_plan() {
        let args = parse(&["-l", "debug", "--json", "supervise", "plan.yaml", "--validate"]).unwrap();
        assert_eq!(args.log_filter(), "debug");
        assert!(args.json);
        assert_eq!(
            args.command,
            WatchCommand::Supervise(SuperviseArgs {
                plan: Some("plan.yaml".to_string()),
                validate: true
            })
        );
    }

    #[test]
    fn test_unknown_log_level_falls_back() {
        let args = parse(&["--log-level", "LOUD", "states"]).unwrap();
        assert_eq!(args.log_filter(), "info");
    }

    #[test]
    fn test_states_options() {
        let args = parse(&["states", "--settle-secs", "3"]).unwrap();
        let WatchCommand::States(states) = args.command else {
            panic!("expected states");
        };
        assert_eq!(states.options().settle, Duration::from_secs(3));
    }

    #[test]
    fn test_starvation_options() {
        let args = parse(&[
            "starvation",
            "-p",
            "42",
            "--heartbeats",
            "3",
            "--interval-ms",
            "100",
            "--round-robin",
        ])
        .unwrap();
        let WatchCommand::Starvation(starvation) = args.command else {
            panic!("expected starvation");
        };
        let options = starvation.options();
        assert_eq!(options.policy, SchedPolicy::RoundRobin);
        assert_eq!(options.priority, 42);
        assert_eq!(options.heartbeats, 3);
        assert_eq!(options.interval, Duration::from_millis(100));
    }

    #[test]
    fn test_subcommand_required() {
        assert!(parse(&[]).is_err());
    }
}
