/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use std::time::Duration;
use sysinfo::{Pid, Signal, System};
use tokio::time::sleep;

/// Returns the PID of a running process matching `name` exactly, if any.
/// With more than one match the first one is picked.
pub(crate) fn find_process_by_name(name: &str) -> Option<Pid> {
    let mut system = System::new();
    system.refresh_processes();
    let pid = system
        .processes_by_exact_name(name)
        .map(|process| process.pid())
        .next();
    pid
}

/// Waits for a process we did not spawn ourselves to exit, by polling the
/// process table.
pub(crate) async fn wait_for_exit(pid: Pid) {
    let mut system = System::new();
    while system.refresh_process(pid) {
        sleep(Duration::from_secs(1)).await;
    }
}

/// Asks a process to terminate. Returns false if it was already gone or the
/// signal could not be delivered.
pub(crate) fn terminate(pid: Pid) -> bool {
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return false;
    }
    system
        .process(pid)
        .and_then(|process| process.kill_with(Signal::Term))
        .unwrap_or(false)
}
