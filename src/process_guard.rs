//! Process lifecycle management for stage-script children.
//!
//! Stage scripts are spawned on a pseudo-terminal and may run destructive
//! operations (partitioning, bootloader writes). If the wizard exits while a
//! stage runs, the child must not be left orphaned and half-way through a
//! disk write.
//!
//! - every spawned child PID is tracked in a global registry
//! - on exit (signal, cancellation, drop) all tracked process groups receive
//!   SIGTERM, a grace period, then SIGKILL

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Registry tracking all spawned stage-script processes.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
}

impl ChildRegistry {
    /// Get or create the global child registry.
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    /// Register a new child process.
    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!("Registered child process PID {pid}");
    }

    /// Unregister a child process (called when it exits normally).
    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!("Unregistered child process PID {pid}");
    }

    /// Number of tracked children.
    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate all tracked children: SIGTERM to each process group, wait up
    /// to `grace_period`, then SIGKILL whatever survived.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.pids.is_empty() {
            debug!("No child processes to terminate");
            return;
        }

        info!("Terminating {} child process(es)...", self.pids.len());

        let pids: Vec<u32> = self.pids.drain().collect();
        for &pid in &pids {
            // group signal first so the script's own children get it too
            if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to process group {pid}: {e}");
                if let Err(e2) = send_signal(pid, Signal::SIGTERM) {
                    warn!("Failed to send SIGTERM to PID {pid}: {e2}");
                }
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids.iter().all(|&pid| !is_process_alive(pid)) {
                info!("All child processes terminated gracefully");
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in &pids {
            if is_process_alive(pid) {
                warn!("Process group {pid} did not terminate, sending SIGKILL");
                if send_signal_to_group(pid, Signal::SIGKILL).is_err() {
                    let _ = send_signal(pid, Signal::SIGKILL);
                }
            }
        }
    }
}

fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Signal an entire process group (negative pid) so grandchildren of the
/// stage script are covered too.
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Check whether a process is still alive (not dead or zombie).
fn is_process_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // zombies still accept signals but are not running
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        let fields: Vec<&str> = stat.split_whitespace().collect();
        if fields.len() > 2 {
            return !matches!(fields[2], "Z" | "X");
        }
    }
    true
}

/// Gracefully terminate one child: SIGTERM to its process group, wait up to
/// `grace_period`, then SIGKILL. Used by pipeline cancellation, which must
/// only ever touch its own child.
pub fn terminate_gracefully(pid: u32, grace_period: Duration) {
    if send_signal_to_group(pid, Signal::SIGTERM).is_err() {
        let _ = send_signal(pid, Signal::SIGTERM);
    }

    let start = Instant::now();
    while start.elapsed() < grace_period {
        if !is_process_alive(pid) {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    warn!("Process group {pid} did not terminate, sending SIGKILL");
    if send_signal_to_group(pid, Signal::SIGKILL).is_err() {
        let _ = send_signal(pid, Signal::SIGKILL);
    }
}

/// RAII guard that terminates all tracked children on drop.
///
/// The binary holds one of these for its whole lifetime so that any exit
/// path, including panics, reaps running stage scripts.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }

    /// Number of currently tracked children.
    pub fn child_count(&self) -> usize {
        self.registry.lock().map(|r| r.count()).unwrap_or(0)
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        debug!("ProcessGuard dropped, initiating cleanup");
        if let Ok(mut registry) = self.registry.lock() {
            registry.terminate_all(Duration::from_secs(5));
        }
    }
}

/// Install handlers for SIGINT, SIGTERM and SIGHUP that reap children before
/// exiting. Call once at program start.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    thread::spawn(move || {
        for sig in signals.forever() {
            let signal_name = match sig {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                SIGHUP => "SIGHUP",
                _ => "UNKNOWN",
            };
            info!("Received {signal_name} signal, cleaning up...");

            if let Ok(mut registry) = ChildRegistry::global().lock() {
                registry.terminate_all(Duration::from_secs(3));
            }

            std::process::exit(128 + sig);
        }
    });

    Ok(())
}
