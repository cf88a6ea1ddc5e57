//! Single-assignment completion handles.
//!
//! A [`GridFuture`] is completed exactly once; any number of tasks may await
//! it and any number of continuations may be attached. Continuations attached
//! after completion run immediately on the attaching thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::{GridError, Result};
use crate::sync::lock;

type Listener<T> = Box<dyn FnOnce(&Result<T>) + Send + 'static>;

enum Slot<T> {
    Pending(Vec<Listener<T>>),
    Done(Result<T>),
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    notify: Notify,
}

pub struct GridFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for GridFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for GridFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let done = matches!(*lock(&self.inner.slot), Slot::Done(_));
        f.debug_struct("GridFuture").field("done", &done).finish()
    }
}

impl<T: Clone + Send + 'static> Default for GridFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> GridFuture<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::Pending(Vec::new())),
                notify: Notify::new(),
            }),
        }
    }

    pub fn completed(result: Result<T>) -> Self {
        let fut = Self::new();
        fut.complete(result);
        fut
    }

    /// Complete the future; returns false if it was already completed.
    pub fn complete(&self, result: Result<T>) -> bool {
        let listeners = {
            let mut slot = lock(&self.inner.slot);
            match &mut *slot {
                Slot::Done(_) => return false,
                Slot::Pending(listeners) => {
                    let listeners = std::mem::take(listeners);
                    *slot = Slot::Done(result.clone());
                    listeners
                }
            }
        };
        for listener in listeners {
            listener(&result);
        }
        self.inner.notify.notify_waiters();
        true
    }

    pub fn on_done(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn on_error(&self, err: GridError) -> bool {
        self.complete(Err(err))
    }

    pub fn is_done(&self) -> bool {
        matches!(*lock(&self.inner.slot), Slot::Done(_))
    }

    pub fn result(&self) -> Option<Result<T>> {
        match &*lock(&self.inner.slot) {
            Slot::Done(result) => Some(result.clone()),
            Slot::Pending(_) => None,
        }
    }

    /// Attach a continuation.
    pub fn listen<F>(&self, listener: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        let done = {
            let mut slot = lock(&self.inner.slot);
            match &mut *slot {
                Slot::Pending(listeners) => {
                    listeners.push(Box::new(listener));
                    return;
                }
                Slot::Done(result) => result.clone(),
            }
        };
        listener(&done);
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn wait(&self) -> Result<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = self.result() {
                return result;
            }
            notified.await;
        }
    }

    /// Future completing once every input completes, regardless of outcome.
    pub fn all<I>(futures: I) -> GridFuture<()>
    where
        I: IntoIterator<Item = GridFuture<T>>,
    {
        let futures: Vec<_> = futures.into_iter().collect();
        let joined = GridFuture::new();
        if futures.is_empty() {
            joined.on_done(());
            return joined;
        }
        let remaining = Arc::new(AtomicUsize::new(futures.len()));
        for fut in futures {
            let remaining = remaining.clone();
            let joined = joined.clone();
            fut.listen(move |_| {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    joined.on_done(());
                }
            });
        }
        joined
    }
}
