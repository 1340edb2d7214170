//! Cooperative cancellation shared between a scheduler and the threads of a job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{DeliveryError, DeliveryResult};

/// Interval at which blocking waits re-check a cancel flag.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Shared "interrupt" flag for one running job.
///
/// Cloning shares the flag. Jobs check it at frame granularity and inside
/// every blocking wait.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` once the flag is raised.
    pub fn check(&self) -> DeliveryResult<()> {
        if self.is_cancelled() {
            Err(DeliveryError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// A flag raised when either this flag or `other` is raised.
    ///
    /// Pipelines use this to stop helper threads on their own errors without
    /// touching the caller's flag.
    pub fn child(&self) -> ChildCancelFlag {
        ChildCancelFlag {
            parent: self.clone(),
            local: CancelFlag::new(),
        }
    }
}

/// A cancel flag that also observes a parent flag.
#[derive(Debug, Clone)]
pub struct ChildCancelFlag {
    parent: CancelFlag,
    local: CancelFlag,
}

impl ChildCancelFlag {
    /// Raise only the local flag.
    pub fn cancel(&self) {
        self.local.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.local.is_cancelled() || self.parent.is_cancelled()
    }

    pub fn check(&self) -> DeliveryResult<()> {
        if self.is_cancelled() {
            Err(DeliveryError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(flag.check().is_ok());
        other.cancel();
        assert!(flag.is_cancelled());
        assert!(matches!(flag.check(), Err(DeliveryError::Cancelled)));
    }

    #[test]
    fn test_child_sees_parent_but_not_vice_versa() {
        let parent = CancelFlag::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let second = parent.child();
        assert!(!second.is_cancelled());
        parent.cancel();
        assert!(second.is_cancelled());
    }
}
