//! # work_sync
//!
//! why: let many threads update one hot target without queueing on its lock one by one
//! relations: used by id_alloc updates to mark ids against the storage engine
//! what: Work trait, WorkSync combiner, AsyncApply completion handle

use crate::error::{RaftError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

const COMBINE_RETRY: Duration = Duration::from_millis(10);

/// A unit of work that can be merged with others bound for the same target
pub trait Work<T>: Send {
    fn combine(self, other: Self) -> Self;

    fn apply(self, target: &mut T) -> Result<()>;
}

#[derive(Default)]
struct Completion {
    // Err carries the message of the failed combined apply
    result: Mutex<Option<std::result::Result<(), String>>>,
    done: Condvar,
}

impl Completion {
    fn complete(&self, result: std::result::Result<(), String>) {
        *self.result.lock() = Some(result);
        self.done.notify_all();
    }

    fn poll(&self) -> Option<std::result::Result<(), String>> {
        self.result.lock().clone()
    }

    fn park(&self) {
        let mut result = self.result.lock();
        if result.is_none() {
            self.done.wait_for(&mut result, COMBINE_RETRY);
        }
    }
}

struct Unit<W> {
    work: W,
    completion: Arc<Completion>,
}

/// Work combiner.
///
/// Callers push their work; whoever holds the target lock drains every pending
/// unit, combines them, applies the result once and completes all drained
/// units. A caller's wait returns only after its own unit was applied.
pub struct WorkSync<T, W> {
    target: Mutex<T>,
    pending: Mutex<Vec<Unit<W>>>,
}

impl<T: Send, W: Work<T>> WorkSync<T, W> {
    pub fn new(target: T) -> Self {
        Self {
            target: Mutex::new(target),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// submit and block until the work is applied
    pub fn apply(&self, work: W) -> Result<()> {
        self.apply_async(work).wait()
    }

    /// submit without waiting; the handle performs or awaits the combined apply
    pub fn apply_async(&self, work: W) -> AsyncApply<'_, T, W> {
        let completion = Arc::new(Completion::default());
        self.pending.lock().push(Unit {
            work,
            completion: Arc::clone(&completion),
        });
        AsyncApply {
            sync: self,
            completion,
        }
    }

    /// read access to the target between applies
    pub fn with_target<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.target.lock())
    }

    fn await_completion(&self, completion: &Completion) -> Result<()> {
        loop {
            if let Some(result) = completion.poll() {
                return result.map_err(RaftError::WorkApplyFailed);
            }
            match self.target.try_lock() {
                Some(mut target) => self.combine_and_apply(&mut target),
                None => completion.park(),
            }
        }
    }

    fn combine_and_apply(&self, target: &mut T) {
        let units = std::mem::take(&mut *self.pending.lock());
        let mut units = units.into_iter();
        let Some(first) = units.next() else {
            return;
        };
        let mut completions = vec![first.completion];
        let mut combined = first.work;
        for unit in units {
            combined = combined.combine(unit.work);
            completions.push(unit.completion);
        }
        let result = combined.apply(target).map_err(|e| e.to_string());
        for completion in completions {
            completion.complete(result.clone());
        }
    }
}

/// Handle to a submitted unit of work
#[must_use = "work is only guaranteed applied once wait() returns"]
pub struct AsyncApply<'a, T, W> {
    sync: &'a WorkSync<T, W>,
    completion: Arc<Completion>,
}

impl<'a, T: Send, W: Work<T>> AsyncApply<'a, T, W> {
    pub fn wait(self) -> Result<()> {
        self.sync.await_completion(&self.completion)
    }
}
