//! Test helpers for tests that fork real children

#![allow(dead_code)]

use nix::unistd::Pid;
use procwatch::runtime::{signals, spawn, Behavior, ChildSpec, Monitor, SpawnedChild};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

static SERIAL: Mutex<()> = Mutex::new(());

/// Waiting on any child sees every child of the test process, so tests that
/// fork must not overlap
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Spawn `behavior` and track it in `monitor`
pub fn spawn_tracked(monitor: &mut Monitor, name: &str, behavior: Behavior) -> SpawnedChild {
    let child = spawn(&ChildSpec::new(name, behavior)).unwrap();
    monitor.track(&child).unwrap();
    child
}

/// Retry `check` every 20ms until it holds or `limit` passes
pub fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Kill `pid` and reap it through a throwaway monitor-free wait
pub fn kill_and_reap(pid: Pid) {
    let _ = signals::kill(pid);
    let _ = nix::sys::wait::waitpid(pid, None);
}
