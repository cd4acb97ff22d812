use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Per-instance mutual exclusion for lifecycle calls.
///
/// Calls on different instances never wait on each other. Nothing is kept
/// for an instance once its last guard is dropped.
#[derive(Default)]
pub struct InstanceLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Exclusive access to one instance, released on drop.
pub struct InstanceGuard<'a> {
    locks: &'a InstanceLocks,
    instance_id: String,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no other guard for `instance_id` exists.
    pub fn acquire(&self, instance_id: &str) -> InstanceGuard<'_> {
        let mut held = self.held();
        while held.contains(instance_id) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(instance_id.to_owned());
        InstanceGuard {
            locks: self,
            instance_id: instance_id.to_owned(),
        }
    }

    pub fn try_acquire(&self, instance_id: &str) -> Option<InstanceGuard<'_>> {
        let mut held = self.held();
        if !held.insert(instance_id.to_owned()) {
            return None;
        }
        Some(InstanceGuard {
            locks: self,
            instance_id: instance_id.to_owned(),
        })
    }

    pub fn is_held(&self, instance_id: &str) -> bool {
        self.held().contains(instance_id)
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        self.locks.held().remove(&self.instance_id);
        self.locks.released.notify_all();
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C asks the server loop to stop; a second one exits immediately.
pub fn install_signal_handler() {
    let result = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, finishing in-flight requests...");
    });
    if let Err(e) = result {
        warn!("failed to install signal handler: {e}");
    }
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
