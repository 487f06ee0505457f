//! Per-call context carrying cooperative cancellation

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Context passed to every solver entry point and to vertex bodies.
///
/// It is cheap to clone. Cancelling a context only affects the calls made
/// with it (and its children), never computations shared with other callers.
#[derive(Clone, Debug, Default)]
pub struct Context {
    token: CancellationToken,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context around an existing token
    pub fn with_token(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Clone the context with a child token: cancelling the child leaves the
    /// parent untouched, cancelling the parent cancels the child.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is cancelled
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_cancellation_is_scoped() {
        let parent = Context::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
