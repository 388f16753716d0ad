//! Cooperative cancellation, threaded through the auditor, Builder and
//! Deployer instead of the teacher's ad-hoc "set a flag" pattern (spec §9).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::OnceCell;

/// A single cancellation flag plus the first error that tripped it.
///
/// Cloning shares the same underlying state; every clone observes the same
/// cancellation. Already-dispatched futures are allowed to run to
/// completion, but callers check [`CancellationToken::is_cancelled`] before
/// acting on a future's result and discard it if the token has tripped.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    first_error: Arc<OnceCell<String>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            first_error: Arc::new(OnceCell::new()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Trip the token. Only the first call records its message; later
    /// callers are suppressed, matching spec §7's "first error wins".
    pub fn cancel(&self, message: impl Into<String>) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.first_error.set(message.into());
    }

    pub fn first_error(&self) -> Option<String> {
        self.first_error.get().cloned()
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel("first");
        token.cancel("second");
        assert!(token.is_cancelled());
        assert_eq!(token.first_error().as_deref(), Some("first"));
    }

    #[test]
    fn clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel("boom");
        assert!(token.is_cancelled());
    }
}
