//! Bounded ticket pool gating concurrent exec channels on one connection.
//!
//! Each remote command holds a ticket for the lifetime of its session
//! channel. A pool of size N hands out at most N tickets at a time; further
//! `take` calls suspend until a ticket comes back. Servers that refuse to
//! honour a negotiated channel shrink the pool: such tickets are
//! invalidated and their slot is never replenished.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

pub(crate) const DEFAULT_MAX_SESSION: i32 = 10;

/// Ticket pool sized from a connection's `max_session`:
/// `0` means the default of 10, negative disables bounding entirely.
pub struct SessionPool {
    size: i32,
    sem: Option<Arc<Semaphore>>,
}

impl SessionPool {
    pub fn new(max_session: i32) -> Self {
        let size = if max_session == 0 {
            DEFAULT_MAX_SESSION
        } else {
            max_session
        };
        let sem = if size > 0 {
            Some(Arc::new(Semaphore::new(size as usize)))
        } else {
            None
        };
        SessionPool { size, sem }
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    /// Tickets currently available without waiting. Unbounded pools report
    /// `None`.
    pub fn available(&self) -> Option<usize> {
        self.sem.as_ref().map(|s| s.available_permits())
    }

    /// Draws a ticket, suspending while the pool is saturated. Returns
    /// `None` once the pool has been closed.
    pub async fn take(&self) -> Option<SessionTicket> {
        let Some(sem) = &self.sem else {
            return Some(SessionTicket { permit: None });
        };
        match sem.clone().acquire_owned().await {
            Ok(permit) => Some(SessionTicket {
                permit: Some(permit),
            }),
            Err(_) => None,
        }
    }

    /// Closes the pool: pending and future `take` calls return `None`.
    /// Idempotent; tickets already out remain valid.
    pub fn close(&self) {
        if let Some(sem) = &self.sem {
            sem.close();
        }
    }
}

/// A drawn ticket. Dropping (or [`release`](SessionTicket::release)-ing) it
/// puts the slot back; [`invalidate`](SessionTicket::invalidate) consumes
/// the slot permanently. Move semantics make a second release or a
/// release-after-invalidate unrepresentable.
pub struct SessionTicket {
    permit: Option<OwnedSemaphorePermit>,
}

impl SessionTicket {
    /// Returns the ticket to the pool. Equivalent to dropping it; provided
    /// so call sites can be explicit.
    pub fn release(self) {}

    /// Permanently consumes this ticket's slot.
    pub fn invalidate(mut self) {
        if let Some(permit) = self.permit.take() {
            debug!("session slot invalidated");
            permit.forget();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn unbounded_always_succeeds() {
        let pool = SessionPool::new(-1);
        assert_eq!(pool.size(), -1);
        assert_eq!(pool.available(), None);
        for _ in 0..100 {
            let t = pool.take().await.unwrap();
            t.invalidate();
        }
        // Closing an unbounded pool is a no-op for take.
        pool.close();
        assert!(pool.take().await.is_some());
    }

    #[tokio::test]
    async fn default_size_is_ten() {
        let pool = SessionPool::new(0);
        assert_eq!(pool.size(), 10);
        assert_eq!(pool.available(), Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_take_blocks_until_release() {
        let pool = Arc::new(SessionPool::new(2));
        let a = pool.take().await.unwrap();
        let _b = pool.take().await.unwrap();

        // Third take must suspend.
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.take().await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        a.release();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn drop_returns_token() {
        let pool = SessionPool::new(3);
        {
            let _t = pool.take().await.unwrap();
            assert_eq!(pool.available(), Some(2));
        }
        assert_eq!(pool.available(), Some(3));
    }

    #[tokio::test]
    async fn invalidate_consumes_slot() {
        let pool = SessionPool::new(3);
        pool.take().await.unwrap().invalidate();
        assert_eq!(pool.available(), Some(2));
        pool.take().await.unwrap().invalidate();
        assert_eq!(pool.available(), Some(1));
        // Releases never resurrect invalidated slots.
        pool.take().await.unwrap().release();
        assert_eq!(pool.available(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn close_wakes_pending_takers() {
        let pool = Arc::new(SessionPool::new(1));
        let held = pool.take().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.take().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.close();
        assert!(waiter.await.unwrap(), "pending take reports closed");

        // Take after close also reports closed; double close is a no-op.
        pool.close();
        assert!(pool.take().await.is_none());
        drop(held);
    }
}
