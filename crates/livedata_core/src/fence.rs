//! Write fences.
//!
//! A write fence lets a writer block until every live query notification
//! caused by its writes has been delivered. The fence is made ambient for
//! a piece of async code with [`WriteFence::scope`]; writes and crossbar
//! listeners running inside that scope find it with
//! [`WriteFence::current`] and register pending work with
//! [`WriteFence::begin_write`]. The writer then calls
//! [`WriteFence::arm_and_wait`], which returns once every token issued
//! from the fence has been committed.
//!
//! # Usage
//!
//! ```rust,ignore
//! let fence = WriteFence::new();
//! fence.scope(async {
//!     conn.insert("items", doc).await?;
//! }).await?;
//! fence.arm_and_wait().await;
//! // Every live query on "items" has delivered its callbacks.
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

tokio::task_local! {
    static CURRENT_FENCE: WriteFence;
}

static NEXT_FENCE_ID: AtomicU64 = AtomicU64::new(1);

struct FenceInner {
    id: u64,
    /// Number of tokens issued and not yet committed.
    outstanding: watch::Sender<usize>,
    fired: AtomicBool,
}

/// Barrier coupling writes to the notifications they cause.
///
/// Cheap to clone; clones refer to the same fence.
#[derive(Clone)]
pub struct WriteFence {
    inner: Arc<FenceInner>,
}

impl WriteFence {
    /// Creates a new, unarmed fence.
    #[must_use]
    pub fn new() -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            inner: Arc::new(FenceInner {
                id: NEXT_FENCE_ID.fetch_add(1, Ordering::Relaxed),
                outstanding,
                fired: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the fence active for the current task, if any.
    pub fn current() -> Option<WriteFence> {
        CURRENT_FENCE.try_with(WriteFence::clone).ok()
    }

    /// Begins a write on the current fence, or returns a no-op token when
    /// no fence is active.
    pub fn begin_current() -> WriteToken {
        Self::current().map_or_else(WriteToken::noop, |fence| fence.begin_write())
    }

    /// Runs `future` with this fence as the ambient fence.
    pub fn scope<F: Future>(&self, future: F) -> impl Future<Output = F::Output> {
        CURRENT_FENCE.scope(self.clone(), future)
    }

    /// Runs `future` inside the fence, then waits for every write it
    /// caused to be fully propagated.
    pub async fn run<F: Future>(&self, future: F) -> F::Output {
        let output = self.scope(future).await;
        self.arm_and_wait().await;
        output
    }

    /// Registers one pending unit of work against this fence.
    ///
    /// A fence that has already fired cannot be extended; the write is
    /// logged and a no-op token returned.
    pub fn begin_write(&self) -> WriteToken {
        if self.inner.fired.load(Ordering::SeqCst) {
            warn!(fence = self.inner.id, "write begun on a fence that already fired");
            return WriteToken::noop();
        }
        self.inner.outstanding.send_modify(|n| *n += 1);
        WriteToken {
            fence: Some(Arc::clone(&self.inner)),
        }
    }

    /// Suspends until every token issued from this fence is committed.
    ///
    /// Tokens begun while waiting are waited for too: the outstanding count
    /// is re-checked after every commit until it is zero.
    pub async fn arm_and_wait(&self) {
        let mut rx = self.inner.outstanding.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|outstanding| *outstanding == 0).await;
        self.inner.fired.store(true, Ordering::SeqCst);
        debug!(fence = self.inner.id, "write fence fired");
    }

    /// Returns the number of uncommitted tokens.
    pub fn outstanding(&self) -> usize {
        *self.inner.outstanding.borrow()
    }

    /// Returns true once `arm_and_wait` has completed.
    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }
}

impl Default for WriteFence {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WriteFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteFence")
            .field("id", &self.inner.id)
            .field("outstanding", &self.outstanding())
            .field("fired", &self.is_fired())
            .finish()
    }
}

/// One pending unit of notification work.
///
/// Committed by [`WriteToken::committed`], or when dropped, so a failed
/// write can never leave a fence waiting forever.
#[must_use = "a write token holds its fence open until committed"]
pub struct WriteToken {
    fence: Option<Arc<FenceInner>>,
}

impl WriteToken {
    /// A token attached to no fence.
    pub fn noop() -> Self {
        Self { fence: None }
    }

    /// Returns true if committing this token has no effect.
    pub fn is_noop(&self) -> bool {
        self.fence.is_none()
    }

    /// Marks the unit of work done.
    pub fn committed(mut self) {
        self.commit();
    }

    fn commit(&mut self) {
        if let Some(inner) = self.fence.take() {
            inner.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        }
    }
}

impl Drop for WriteToken {
    fn drop(&mut self) {
        self.commit();
    }
}

impl fmt::Debug for WriteToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteToken")
            .field("fence", &self.fence.as_ref().map(|inner| inner.id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn no_fence_outside_scope() {
        assert!(WriteFence::current().is_none());
        assert!(WriteFence::begin_current().is_noop());
    }

    #[tokio::test]
    async fn scope_makes_fence_ambient() {
        let fence = WriteFence::new();
        let token = fence
            .scope(async { WriteFence::begin_current() })
            .await;
        assert!(!token.is_noop());
        assert_eq!(fence.outstanding(), 1);
        token.committed();
        assert_eq!(fence.outstanding(), 0);
    }

    #[tokio::test]
    async fn arm_and_wait_with_nothing_outstanding() {
        let fence = WriteFence::new();
        fence.arm_and_wait().await;
        assert!(fence.is_fired());
    }

    #[tokio::test]
    async fn dropping_token_commits() {
        let fence = WriteFence::new();
        {
            let _token = fence.begin_write();
            assert_eq!(fence.outstanding(), 1);
        }
        assert_eq!(fence.outstanding(), 0);
    }

    #[tokio::test]
    async fn waits_for_tokens_begun_during_wait() {
        let fence = WriteFence::new();
        let done = Arc::new(AtomicUsize::new(0));

        // A chain: the first unit, on completion, starts a second one.
        let first = fence.begin_write();
        let chained = fence.clone();
        let flag = Arc::clone(&done);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let second = chained.begin_write();
            first.committed();
            tokio::time::sleep(Duration::from_millis(10)).await;
            flag.store(1, Ordering::SeqCst);
            second.committed();
        });

        fence.arm_and_wait().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(fence.outstanding(), 0);
    }

    #[tokio::test]
    async fn fired_fence_hands_out_noop_tokens() {
        let fence = WriteFence::new();
        fence.arm_and_wait().await;
        let token = fence.begin_write();
        assert!(token.is_noop());
        assert_eq!(fence.outstanding(), 0);
    }

    #[tokio::test]
    async fn run_returns_output() {
        let fence = WriteFence::new();
        let value = fence.run(async { 42 }).await;
        assert_eq!(value, 42);
        assert!(fence.is_fired());
    }
}
