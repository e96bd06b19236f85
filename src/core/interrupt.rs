use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cancellation flag shared between the controller and the worker.
///
/// The controller writes it with [`InterruptChannel::signal_abort`], the
/// worker's instruction hook polls it with [`InterruptChannel::is_raised`].
/// Release/acquire ordering makes the abort visible to the next poll.
#[derive(Clone, Debug, Default)]
pub struct InterruptChannel {
    flag: Arc<AtomicBool>,
}

impl InterruptChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal_abort(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Clears the flag. Returns whether it was set.
    pub fn reset(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_is_visible_to_clones() {
        let controller = InterruptChannel::new();
        let worker = controller.clone();

        assert!(!worker.is_raised());
        controller.signal_abort();
        assert!(worker.is_raised());
    }

    #[test]
    fn test_signal_is_idempotent_and_resettable() {
        let channel = InterruptChannel::new();
        channel.signal_abort();
        channel.signal_abort();
        assert!(channel.reset());
        assert!(!channel.is_raised());
        assert!(!channel.reset());
    }

    #[test]
    fn test_signal_crosses_threads() {
        let channel = InterruptChannel::new();
        let remote = channel.clone();
        std::thread::spawn(move || remote.signal_abort())
            .join()
            .expect("signal thread");
        assert!(channel.is_raised());
    }
}
