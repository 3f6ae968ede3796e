use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide cancellation flag.
///
/// Set exactly once (signal or operator request), never reset. Sampling
/// loops check it once per iteration; an in-flight bus transaction always
/// completes before the flag is observed.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying flag, for `signal_hook::flag::register`.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clear_and_stays_set() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());

        // Repeated sets are harmless; there is no reset.
        token.cancel();
        assert!(token.is_cancelled());
    }
}
