//! Scheduling queue for readiness inspections.
//!
//! A deduplicating work queue with the client-go semantics controllers rely
//! on:
//! - an item is queued at most once, however many times it is added
//! - an item that is added while a worker holds it is marked dirty and
//!   re-queued when the worker calls [`WorkQueue::done`], so the same key is
//!   never processed concurrently
//! - failed items come back through [`WorkQueue::add_rate_limited`], delayed
//!   by the queue's [`RateLimiter`]
//!
//! After [`WorkQueue::shut_down`] every blocked [`WorkQueue::get`] returns
//! `None`, further adds are ignored and pending delayed adds are dropped.

use crate::backoff::RateLimiter;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    ready: Notify,
    limiter: Mutex<Box<dyn RateLimiter<T>>>,
}

/// Cloneable handle to a shared rate-limited work queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("WorkQueue")
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    /// Creates an empty queue using `limiter` for rate-limited re-adds.
    pub fn new(limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                ready: Notify::new(),
                limiter: Mutex::new(Box::new(limiter)),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn limiter(&self) -> MutexGuard<'_, Box<dyn RateLimiter<T>>> {
        self.inner.limiter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `item` as needing processing.
    pub fn add(&self, item: T) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            // Re-queued by `done`
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.ready.notify_one();
    }

    /// Blocks until an item is ready. Returns `None` once the queue is shut down.
    ///
    /// The caller owns the item until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            // Register before checking so an add between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Marks `item` as finished; re-queues it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let mut state = self.state();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.ready.notify_one();
        }
    }

    /// Clears the retry history of `item`.
    pub fn forget(&self, item: &T) {
        self.limiter().forget(item);
    }

    /// Number of rate-limited re-adds recorded for `item`.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter().num_requeues(item)
    }

    /// Adds `item` after `delay`.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Adds `item` after the delay chosen by the rate limiter.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.limiter().when(&item);
        trace!("rate limited re-add in {:?}", delay);
        self.add_after(item, delay);
    }

    /// Stops the queue and wakes every blocked `get`.
    pub fn shut_down(&self) {
        let mut state = self.state();
        state.shutting_down = true;
        state.queue.clear();
        drop(state);
        self.inner.ready.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of items waiting to be picked up.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// Whether no item is waiting to be picked up.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
