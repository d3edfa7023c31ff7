use std::future::Future;
use std::pin::{Pin, pin};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use futures::future::{Either, select};
use parking_lot::Mutex;

use crate::error::Cancelled;

/// Cancellation handle shared by a task and whoever owns it.
///
/// Cancelling a token cancels every child token, transitively. Cancellation
/// happens at most once; later calls are no-ops.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    state: Mutex<TokenState>,
}

#[derive(Default)]
struct TokenState {
    cancelled: bool,
    wakers: Vec<Waker>,
    children: Vec<Weak<TokenInner>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token cancelled together with `self`, but cancellable on its own.
    pub fn child_token(&self) -> CancellationToken {
        let child = CancellationToken::new();
        let mut state = self.inner.state.lock();
        if state.cancelled {
            child.inner.state.lock().cancelled = true;
        } else {
            state.children.retain(|c| c.strong_count() > 0);
            state.children.push(Arc::downgrade(&child.inner));
        }
        child
    }

    pub fn cancel(&self) {
        let (wakers, children) = {
            let mut state = self.inner.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            (
                std::mem::take(&mut state.wakers),
                std::mem::take(&mut state.children),
            )
        };
        for waker in wakers {
            waker.wake();
        }
        for child in children.iter().filter_map(Weak::upgrade) {
            CancellationToken { inner: child }.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    /// Resolves once the token is cancelled.
    pub fn cancelled(&self) -> WaitForCancellation {
        WaitForCancellation {
            token: self.clone(),
        }
    }

    /// Drives `fut` until it finishes or the token is cancelled, whichever
    /// comes first. On cancellation `fut` is dropped without being polled
    /// again.
    pub async fn run_until_cancelled<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        let fut = pin!(fut);
        let cancelled = pin!(self.cancelled());
        match select(cancelled, fut).await {
            Either::Left(_) => Err(Cancelled),
            Either::Right((out, _)) => Ok(out),
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

pub struct WaitForCancellation {
    token: CancellationToken,
}

impl Future for WaitForCancellation {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.token.inner.state.lock();
        if state.cancelled {
            return Poll::Ready(());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn cancelling_parent_cancels_descendants() {
        let root = CancellationToken::new();
        let child = root.child_token();
        let grandchild = child.child_token();
        let sibling = root.child_token();

        child.cancel();
        assert!(!root.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(!sibling.is_cancelled());

        root.cancel();
        assert!(sibling.is_cancelled());
        assert!(root.child_token().is_cancelled());
    }

    #[test]
    fn run_until_cancelled_reports_cancellation() {
        let token = CancellationToken::new();
        assert_eq!(block_on(token.run_until_cancelled(async { 7 })), Ok(7));

        token.cancel();
        let out = block_on(token.run_until_cancelled(futures::future::pending::<()>()));
        assert_eq!(out, Err(Cancelled));
    }

    #[test]
    fn cancelled_future_wakes_waiters() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let mut pool = futures::executor::LocalPool::new();
        let done = std::rc::Rc::new(std::cell::Cell::new(false));
        let flag = done.clone();
        futures::task::LocalSpawnExt::spawn_local(&pool.spawner(), async move {
            waiter.cancelled().await;
            flag.set(true);
        })
        .unwrap();

        pool.run_until_stalled();
        assert!(!done.get());
        token.cancel();
        pool.run_until_stalled();
        assert!(done.get());
    }
}
