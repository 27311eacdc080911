use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared stop handle between the presentation layer and the conversion worker.
///
/// The handle is active while a batch may keep running.
/// Any clone can clear it, after which the worker starts no new file
/// and terminates the subprocess that is currently running.
/// Forcing the stop skips the grace period and kills the subprocess right away.
#[derive(Debug, Clone)]
pub struct CancellationController {
    active: Arc<AtomicBool>,
    forced: Arc<AtomicBool>,
}

impl CancellationController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(true)),
            forced: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the batch as running again.
    pub fn activate(&self) {
        self.forced.store(false, Ordering::SeqCst);
        self.active.store(true, Ordering::SeqCst);
    }

    /// Request the batch to stop.
    /// Returns `true` if the handle was still active before this call.
    pub fn cancel(&self) -> bool {
        self.active.swap(false, Ordering::SeqCst)
    }

    /// Stop without waiting for the running subprocess to exit on its own.
    /// Returns `true` if the stop was not forced before this call.
    pub fn force(&self) -> bool {
        self.active.store(false, Ordering::SeqCst);
        !self.forced.swap(true, Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        !self.is_active()
    }
}

impl Default for CancellationController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_active() {
        let controller = CancellationController::new();
        assert!(controller.is_active());
        assert!(!controller.is_cancelled());
    }

    #[test]
    fn cancel_is_visible_through_clones() {
        let controller = CancellationController::new();
        let handle = controller.clone();
        assert!(handle.cancel());
        assert!(controller.is_cancelled());
        // Second request reports the handle was already cleared
        assert!(!handle.cancel());
    }

    #[test]
    fn cancel_from_another_thread() {
        let controller = CancellationController::new();
        let handle = controller.clone();
        std::thread::spawn(move || handle.cancel()).join().unwrap();
        assert!(controller.is_cancelled());
        controller.activate();
        assert!(controller.is_active());
    }

    #[test]
    fn force_implies_cancel() {
        let controller = CancellationController::new();
        assert!(!controller.is_forced());
        assert!(controller.cancel());
        assert!(controller.force());
        assert!(controller.is_cancelled());
        assert!(controller.is_forced());
        assert!(!controller.force());

        controller.activate();
        assert!(controller.is_active());
        assert!(!controller.is_forced());
    }
}
