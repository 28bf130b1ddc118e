#[cfg(target_os = "windows")]
pub mod windows;

use sysinfo::System;
use tracing::{debug, warn};

/// Kills every process whose executable name matches one of `names`
/// (case-insensitive). The current process is never touched.
pub fn terminate_processes(names: &[String]) -> usize {
    if names.is_empty() {
        return 0;
    }
    let current = sysinfo::get_current_pid().ok();
    let mut system = System::new();
    system.refresh_processes();

    let mut terminated = 0;
    for (pid, process) in system.processes() {
        if Some(*pid) == current || !matches_name(process.name(), names) {
            continue;
        }
        if process.kill() {
            debug!("Killed {} (pid {})", process.name(), pid);
            terminated += 1;
        } else {
            warn!("Could not kill {} (pid {})", process.name(), pid);
        }
    }
    terminated
}

fn matches_name(process_name: &str, names: &[String]) -> bool {
    names.iter().any(|n| n.eq_ignore_ascii_case(process_name))
}

/// Hands the process's unused working-set pages back to the OS.
#[cfg(target_os = "windows")]
pub fn trim_working_set() -> bool {
    windows::empty_working_set()
}

#[cfg(not(target_os = "windows"))]
pub fn trim_working_set() -> bool {
    false
}
