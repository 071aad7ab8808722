//! Traffic hooks
//!
//! Hooks see every intercepted request and response before the operator
//! does and may rewrite the bytes. Execution happens elsewhere; the engine
//! only sees whether a hook modified the data and a signal carrying the
//! final bytes.

use tokio::sync::oneshot;

use crate::project::{Direction, Request};

/// Result of handing bytes to the hooks.
pub struct HookResponse {
    /// A hook rewrote the bytes; `ready` will carry the replacement
    pub modified: bool,
    pub ready: oneshot::Receiver<Vec<u8>>,
}

impl HookResponse {
    /// A response reporting no modification.
    pub fn unmodified() -> Self {
        let (_tx, ready) = oneshot::channel();
        Self {
            modified: false,
            ready,
        }
    }

    /// A response whose replacement is already known.
    pub fn replaced(data: Vec<u8>) -> Self {
        let (tx, ready) = oneshot::channel();
        let _ = tx.send(data);
        Self {
            modified: true,
            ready,
        }
    }

    /// Bytes to continue with.
    ///
    /// Unmodified responses, and hooks that go away without answering,
    /// yield `original`.
    pub async fn wait(self, original: &[u8]) -> Vec<u8> {
        if !self.modified {
            return original.to_vec();
        }
        match self.ready.await {
            Ok(data) => data,
            Err(_) => {
                tracing::warn!("Hook dropped without a result, using original bytes");
                original.to_vec()
            }
        }
    }
}

/// Hook collaborator.
pub trait Hooks: Send + Sync {
    fn run_hooks(&self, direction: Direction, request: &Request, data: &[u8]) -> HookResponse;
}

/// No hooks installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl Hooks for NoHooks {
    fn run_hooks(&self, _: Direction, _: &Request, _: &[u8]) -> HookResponse {
        HookResponse::unmodified()
    }
}

/// Hooks backed by a closure returning replacement bytes, if any.
pub struct FnHooks<F>(pub F);

impl<F> Hooks for FnHooks<F>
where
    F: Fn(Direction, &Request, &[u8]) -> Option<Vec<u8>> + Send + Sync,
{
    fn run_hooks(&self, direction: Direction, request: &Request, data: &[u8]) -> HookResponse {
        match (self.0)(direction, request, data) {
            Some(replacement) if replacement != data => HookResponse::replaced(replacement),
            _ => HookResponse::unmodified(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::PROTOCOL_HTTP11;

    #[tokio::test]
    async fn test_no_hooks_returns_original() {
        let req = Request::new("http://x/", "GET", PROTOCOL_HTTP11);
        let response = NoHooks.run_hooks(Direction::BrowserToServer, &req, b"abc");
        assert!(!response.modified);
        assert_eq!(response.wait(b"abc").await, b"abc");
    }

    #[tokio::test]
    async fn test_fn_hooks_replace_matching_direction() {
        let hooks = FnHooks(|dir: Direction, _: &Request, data: &[u8]| {
            (dir == Direction::ServerToBrowser).then(|| data.to_ascii_uppercase())
        });
        let req = Request::new("http://x/", "GET", PROTOCOL_HTTP11);

        let response = hooks.run_hooks(Direction::ServerToBrowser, &req, b"abc");
        assert!(response.modified);
        assert_eq!(response.wait(b"abc").await, b"ABC");

        let untouched = hooks.run_hooks(Direction::BrowserToServer, &req, b"abc");
        assert!(!untouched.modified);
    }

    #[tokio::test]
    async fn test_abandoned_hook_falls_back() {
        let (tx, ready) = oneshot::channel();
        drop(tx);
        let response = HookResponse {
            modified: true,
            ready,
        };
        assert_eq!(response.wait(b"orig").await, b"orig");
    }
}
