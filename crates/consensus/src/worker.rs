//! Background workers.
//!
//! Each tracker implements [`Worker`]; the node gives every worker its own
//! thread and calls [`Worker::tick`] once per [`Worker::interval`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared interruption flag checked by long traversals.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A periodic background task.
///
/// `tick` must leave state consistent when it returns early because `stop`
/// was raised; abandoned work is picked up again on the next tick.
pub trait Worker: Send + Sync + 'static {
    /// Thread name.
    fn name(&self) -> &'static str;

    /// Pause between ticks.
    fn interval(&self) -> Duration;

    /// One pass of work. Errors are logged, never returned.
    fn tick(&self, stop: &StopFlag);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_flag_is_shared() {
        let flag = StopFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_stopped());
        flag.stop();
        assert!(clone.is_stopped());
    }
}
