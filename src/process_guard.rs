//! Process lifecycle management for child processes
//!
//! The adapter's lifetime is bound to the wrapped tool's. Two mechanisms keep
//! them together:
//!
//! - Every child is spawned with `PR_SET_PDEATHSIG`, so it receives SIGTERM
//!   if the adapter dies first (crash, SIGKILL).
//! - Termination signals delivered to the adapter (SIGTERM, SIGHUP, SIGINT)
//!   are forwarded to the registered children. The adapter then reports the
//!   child's exit like any other.
//!
//! Children stay in the adapter's process group: the wrapped tool and
//! pinentry both need the controlling terminal for interactive prompts.

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info, warn};

/// Global registry of child process IDs
static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Registry tracking all spawned child processes
#[derive(Debug, Default)]
pub struct ChildRegistry {
    /// Set of child PIDs currently running
    pids: HashSet<u32>,
}

impl ChildRegistry {
    /// Get or create the global child registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    /// Register a new child process
    pub fn register(&mut self, pid: u32) {
        self.pids.insert(pid);
        debug!("Registered child process PID {}", pid);
    }

    /// Unregister a child process (called when it exits normally)
    pub fn unregister(&mut self, pid: u32) {
        self.pids.remove(&pid);
        debug!("Unregistered child process PID {}", pid);
    }

    /// Get count of tracked children
    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Send `signal` to every tracked child.
    ///
    /// Returns how many children the signal was delivered to.
    pub fn forward(&self, signal: Signal) -> usize {
        let mut delivered = 0;
        for &pid in &self.pids {
            match send_signal(pid, signal) {
                Ok(()) => {
                    debug!("Forwarded {} to PID {}", signal, pid);
                    delivered += 1;
                }
                Err(e) => warn!("Failed to forward {} to PID {}: {}", signal, pid, e),
            }
        }
        delivered
    }
}

/// Registers a child for the lifetime of the guard.
///
/// Unregistration happens on drop, so every exit path of the caller
/// (including early `?` returns) removes the PID.
#[derive(Debug)]
pub struct RegisteredChild {
    pid: u32,
}

impl RegisteredChild {
    pub fn new(pid: u32) -> Self {
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.register(pid);
        }
        Self { pid }
    }
}

impl Drop for RegisteredChild {
    fn drop(&mut self) {
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.unregister(self.pid);
        }
    }
}

/// Send a signal to a process
fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid as i32), signal)
}

/// Initialize global signal handlers
/// Handles SIGINT (Ctrl+C), SIGTERM, and SIGHUP
/// Call this once at program start
///
/// While a child runs, the signal is forwarded and the adapter keeps waiting
/// for it. With no child running the adapter exits with 128 + signal.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    thread::spawn(move || {
        for sig in signals.forever() {
            let Ok(signal) = Signal::try_from(sig) else {
                continue;
            };
            info!("Received {}", signal);

            let delivered = match ChildRegistry::global().lock() {
                Ok(registry) => registry.forward(signal),
                Err(_) => 0,
            };

            if delivered == 0 {
                std::process::exit(128 + sig);
            }
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to tie a child to our lifetime
pub trait CommandDeathPact {
    /// Deliver SIGTERM to the child if the adapter process dies
    fn with_parent_death_signal(&mut self) -> &mut Self;
}

impl CommandDeathPact for std::process::Command {
    fn with_parent_death_signal(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: prctl is async-signal-safe and touches no parent state
        unsafe {
            self.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}
