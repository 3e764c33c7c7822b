//! Procwatch CLI
//!
//! Usage:
//!   procwatch supervise
//!   procwatch supervise plans/demo.yaml --validate
//!   procwatch --json states
//!   procwatch starvation -p 80 --heartbeats 10

use procwatch::cli::WatchCommand;
use procwatch::scenario::process_states::{self, ProcessStatesOptions};
use procwatch::scenario::starvation::{self, StarvationOptions};
use procwatch::scenario::supervise;
use procwatch::{EventSink, MonitorEvent, ScenarioError, Tally, WatchArgs, WatchPlan};
use std::io::Write;
use tokio::sync::mpsc;

/// Work handed to the blocking monitor thread
enum Job {
    Supervise(WatchPlan),
    States(ProcessStatesOptions),
    Starvation(StarvationOptions),
}

impl Job {
    fn run(self, sink: &mut mpsc::UnboundedSender<MonitorEvent>) -> Result<(), ScenarioError> {
        match self {
            Job::Supervise(plan) => {
                supervise::run(&plan, sink)?;
            }
            Job::States(options) => {
                process_states::run(sink, &options)?;
            }
            Job::Starvation(options) => {
                let report = starvation::run(sink, &options)?;
                if report.degraded {
                    log::warn!("Real-time class was not applied; the heartbeats ran unopposed");
                }
                log::info!("Supervisor heartbeats lagged by {:?}", report.lag);
            }
        }
        Ok(())
    }
}

fn print_event(event: &MonitorEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => log::error!("Failed to serialize event: {}", e),
        }
    } else {
        println!("{}", event);
    }
}

/// Print and count whatever is still queued. Returns true when an
/// interruption was among it.
fn drain(
    rx: &mut mpsc::UnboundedReceiver<MonitorEvent>,
    tally: &mut Tally,
    json: bool,
) -> bool {
    let mut interrupted = false;
    while let Ok(event) = rx.try_recv() {
        print_event(&event, json);
        if event == MonitorEvent::Interrupted {
            interrupted = true;
        } else {
            tally.observe(&event);
        }
    }
    interrupted
}

/// An interruption wins over however the worker ended
fn exit_code(interrupted: bool, succeeded: bool) -> i32 {
    if interrupted {
        130
    } else if succeeded {
        0
    } else {
        1
    }
}

fn exit(code: i32) -> ! {
    let _ = std::io::stdout().flush();
    std::process::exit(code)
}

#[tokio::main]
async fn main() {
    let args: WatchArgs = argh::from_env();

    // Initialize logging
    let env = env_logger::Env::default().default_filter_or(args.log_filter());
    env_logger::init_from_env(env);

    let json = args.json;
    let job = match args.command {
        WatchCommand::Supervise(supervise) => {
            let plan = match &supervise.plan {
                Some(path) => {
                    log::info!("Loading watch plan: {}", path);
                    match WatchPlan::from_file(path) {
                        Ok(plan) => plan,
                        Err(e) => {
                            log::error!("Failed to load watch plan: {}", e);
                            exit(1);
                        }
                    }
                }
                None => WatchPlan::supervisor_default(),
            };

            // Validate only mode
            if supervise.validate {
                println!(
                    "Watch plan '{}' is valid",
                    supervise.plan.as_deref().unwrap_or("<default>")
                );
                println!("  Version: {}", plan.version);
                println!("  Children: {}", plan.children.len());
                for (name, child) in &plan.children {
                    match &child.scheduling {
                        Some(hint) => println!(
                            "    {}: {} ({} priority {})",
                            name, child.behavior, hint.policy, hint.priority
                        ),
                        None => println!("    {}: {}", name, child.behavior),
                    }
                }
                return;
            }
            Job::Supervise(plan)
        }
        WatchCommand::States(states) => {
            let options = states.options();
            if let Err(e) = options.validate() {
                log::error!("{}", e);
                exit(1);
            }
            Job::States(options)
        }
        WatchCommand::Starvation(starvation) => Job::Starvation(starvation.options()),
    };

    let (tx, mut rx) = mpsc::unbounded_channel();

    // Set up Ctrl+C / SIGTERM handler; the reaction goes through the event stream
    {
        let mut tx = tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            tx.emit(MonitorEvent::Interrupted);
        }) {
            log::error!("Error setting Ctrl+C handler: {}", e);
            exit(1);
        }
    }

    // The wait call blocks its thread, so the monitor gets one of its own
    let mut worker = tokio::task::spawn_blocking(move || {
        let mut tx = tx;
        job.run(&mut tx)
    });

    let mut tally = Tally::default();
    let code = loop {
        tokio::select! {
            biased;

            Some(event) = rx.recv() => {
                print_event(&event, json);
                if event == MonitorEvent::Interrupted {
                    log::warn!(
                        "Interrupted, leaving {} children unreaped",
                        tally.live()
                    );
                    break 130;
                }
                tally.observe(&event);
            }

            result = &mut worker => {
                // Everything the worker sent is already queued
                let interrupted = drain(&mut rx, &mut tally, json);

                let succeeded = match result {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        log::error!("{}", e);
                        false
                    }
                    Err(e) => {
                        log::error!("Monitor thread failed: {}", e);
                        false
                    }
                };
                if interrupted {
                    log::warn!("Interrupted while the monitor was finishing");
                }
                break exit_code(interrupted, succeeded);
            }
        }
    };

    log::debug!(
        "Spawned {}, reaped {}, stopped {}, continued {}, unknown {}, degraded {}",
        tally.spawned,
        tally.reaped,
        tally.stopped,
        tally.continued,
        tally.unknown,
        tally.degraded
    );
    log::info!("Procwatch exiting");
    exit(code);
}
