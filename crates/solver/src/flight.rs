//! De-duplicated shared computations
//!
//! A [`Flight`] runs at most one computation at a time and hands its
//! outcome to every caller that joined while it was running. The work runs
//! on its own task with its own cancellation token: a caller whose context
//! is cancelled stops waiting, and the work itself is cancelled only once
//! nobody is waiting anymore. Failed outcomes are forgotten so the next
//! caller starts over; successful ones are kept.

use crate::context::Context;
use crate::errors::{Result, SolverError};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use tokio_util::sync::CancellationToken;

struct Entry<T: Clone> {
    generation: u64,
    future: Shared<BoxFuture<'static, Result<T>>>,
    waiters: usize,
    token: CancellationToken,
}

struct Slot<T: Clone> {
    next_generation: u64,
    entry: Option<Entry<T>>,
}

pub(crate) struct Flight<T: Clone> {
    slot: Mutex<Slot<T>>,
}

impl<T> Default for Flight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Flight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                next_generation: 0,
                entry: None,
            }),
        }
    }

    /// Join the running computation, or start one with `start`
    pub(crate) async fn run<F, Fut>(&self, ctx: &Context, start: F) -> Result<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if ctx.is_cancelled() {
            return Err(SolverError::Cancelled);
        }

        let (generation, future) = {
            let mut slot = self.slot.lock();
            if let Some(entry) = slot.entry.as_mut() {
                entry.waiters += 1;
                (entry.generation, entry.future.clone())
            } else {
                let generation = slot.next_generation;
                slot.next_generation += 1;

                let token = CancellationToken::new();
                let work = start(Context::with_token(token.clone()));
                let watch = token.clone();
                let handle = tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        _ = watch.cancelled() => Err(SolverError::Cancelled),
                        result = work => result,
                    }
                });
                let future = async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(e) => Err(SolverError::task_failed(e.to_string())),
                    }
                }
                .boxed()
                .shared();

                slot.entry = Some(Entry {
                    generation,
                    future: future.clone(),
                    waiters: 1,
                    token,
                });
                (generation, future)
            }
        };

        let _waiter = Waiter {
            flight: self,
            generation,
        };
        tokio::select! {
            result = future => result,
            _ = ctx.cancelled() => Err(SolverError::Cancelled),
        }
    }

    /// Outcome of a finished successful computation
    pub(crate) fn peek(&self) -> Option<T> {
        let slot = self.slot.lock();
        match slot.entry.as_ref()?.future.peek() {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Forget the current computation, cancelling it if still running
    pub(crate) fn clear(&self) {
        if let Some(entry) = self.slot.lock().entry.take() {
            if entry.future.peek().is_none() {
                entry.token.cancel();
            }
        }
    }

    /// Forget a finished outcome; a running computation is left alone
    pub(crate) fn forget_finished(&self) {
        let mut slot = self.slot.lock();
        if slot.entry.as_ref().is_some_and(|e| e.future.peek().is_some()) {
            slot.entry = None;
        }
    }

    fn leave(&self, generation: u64) {
        let mut slot = self.slot.lock();
        let Some(entry) = slot.entry.as_mut() else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        entry.waiters = entry.waiters.saturating_sub(1);
        let forget = match entry.future.peek() {
            Some(Ok(_)) => false,
            Some(Err(_)) => true,
            None if entry.waiters == 0 => {
                entry.token.cancel();
                true
            }
            None => false,
        };
        if forget {
            slot.entry = None;
        }
    }
}

struct Waiter<'a, T>
where
    T: Clone + Send + Sync + 'static,
{
    flight: &'a Flight<T>,
    generation: u64,
}

impl<T> Drop for Waiter<'_, T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.flight.leave(self.generation);
    }
}
