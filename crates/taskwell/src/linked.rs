// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tasks whose lifecycle spans a chain of two dispatches.
//!
//! Dispatching a callable that itself returns a task produces a *chained*
//! task: the first dispatch runs the callable to obtain the inner task, and
//! the chained task then settles with the inner task's outcome. Cancellation
//! targets whichever stage is currently outstanding, and priority changes are
//! re-applied across the hand-off so a change racing the chain's progress is
//! not lost.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::task::{Body, RawTask, Task};

/// Which stage of the chain currently owns the outcome.
pub(crate) enum LinkStage<T> {
    /// The callable has not produced the inner task yet.
    Empty,
    /// Cancellation claimed the chain before the inner task existed.
    CancelClaimed,
    /// The inner task is outstanding.
    Inner(Arc<Task<T>>),
}

pub(crate) struct LinkedBody<T> {
    link: Mutex<LinkStage<T>>,
    /// The inner task, once produced. Never replaced, so results can be
    /// borrowed through it without holding the link lock.
    materialized: OnceLock<Arc<Task<T>>>,
    /// The stage task queued on the dispatcher to run the callable.
    stage: OnceLock<Arc<Task<()>>>,
    /// The completion continuation registered on the inner task.
    completion: OnceLock<Arc<Task<()>>>,
    /// Reports whether a cancellation attempt beat the chain; pending until
    /// the outcome is known.
    cancel_outcome: Arc<Task<bool>>,
    pub(crate) priority: AtomicI32,
}

impl<T: Send + Sync + 'static> LinkedBody<T> {
    pub(crate) fn new(priority: i32) -> Self {
        Self {
            link: Mutex::new(LinkStage::Empty),
            materialized: OnceLock::new(),
            stage: OnceLock::new(),
            completion: OnceLock::new(),
            cancel_outcome: Task::pending_value(),
            priority: AtomicI32::new(priority),
        }
    }

    pub(crate) fn result(&self) -> &T {
        self.materialized
            .get()
            .expect("chained task signaled before its inner task existed")
            .get()
    }
}

impl<T: Send + Sync + 'static> Task<T> {
    fn linked_body(&self) -> &LinkedBody<T> {
        match self.body() {
            Body::Linked(body) => body,
            _ => unreachable!("linked operation on a non-chained task"),
        }
    }

    /// Builds the chain: a chained outer task plus the stage task to submit
    /// to the dispatcher. The caller dispatches the returned stage.
    pub(crate) fn build_chain<F, C>(f: F, on_cancel: C, priority: i32) -> (Arc<Self>, Arc<dyn RawTask>)
    where
        F: FnOnce() -> Arc<Task<T>> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let outer = Task::linked(priority);
        let produced: Arc<OnceLock<Arc<dyn RawTask>>> = Arc::new(OnceLock::new());
        let stage = Task::<()>::function(
            Box::new({
                let outer = Arc::clone(&outer);
                let produced = Arc::clone(&produced);
                move || {
                    outer.linked_run_stage(f, &produced);
                    Some(())
                }
            }),
            Some(Box::new({
                let outer = Arc::clone(&outer);
                move || {
                    outer.linked_cancel_settled();
                    on_cancel();
                }
            })),
            priority,
            Some(produced),
        );
        let stored = outer.linked_body().stage.set(Arc::clone(&stage));
        debug_assert!(stored.is_ok());
        let stage: Arc<dyn RawTask> = stage;
        (outer, stage)
    }

    /// First stage: run the callable, install the inner task, and register
    /// the completion continuation that settles the chained task.
    fn linked_run_stage<F>(self: &Arc<Self>, f: F, produced: &OnceLock<Arc<dyn RawTask>>)
    where
        F: FnOnce() -> Arc<Task<T>>,
    {
        let body = self.linked_body();
        if matches!(*body.link.lock(), LinkStage::CancelClaimed) {
            self.linked_cancel_settled();
            return;
        }

        let inner = f();
        let _ = body.materialized.set(Arc::clone(&inner));
        let mut applied = body.priority.load(Ordering::Acquire);
        let installed = {
            let mut link = body.link.lock();
            if matches!(&*link, LinkStage::CancelClaimed) {
                false
            } else {
                *link = LinkStage::Inner(Arc::clone(&inner));
                true
            }
        };
        if installed {
            inner.change_priority(applied);
        } else {
            // Cancelled while the callable ran; the inner task inherits it.
            let _ = inner.cancel();
        }
        let _ = produced.set(Arc::clone(&inner) as Arc<dyn RawTask>);

        let completion = inner.then_with_cancel(
            {
                let outer = Arc::clone(self);
                move |_| {
                    outer.linked_signal_settled();
                }
            },
            {
                let outer = Arc::clone(self);
                move || {
                    outer.linked_cancel_settled();
                }
            },
            applied,
        );
        let _ = body.completion.set(Arc::clone(&completion));

        // A priority change that arrived between installation and here would
        // have missed one of the two targets; re-apply until stable.
        loop {
            let latest = body.priority.load(Ordering::Acquire);
            if latest == applied {
                break;
            }
            inner.change_priority(latest);
            completion.change_priority(latest);
            applied = latest;
        }
    }

    /// The chain completed: settle as signaled and report that cancellation
    /// did not win.
    pub(crate) fn linked_signal(self: &Arc<Self>) -> bool {
        self.linked_signal_settled()
    }

    fn linked_signal_settled(self: &Arc<Self>) -> bool {
        let body = self.linked_body();
        let transitioned = self.settle_signal_only();
        body.cancel_outcome.complete(false);
        transitioned
    }

    /// Some stage of the chain was cancelled: settle and report whether this
    /// chain's cancellation took effect.
    fn linked_cancel_settled(self: &Arc<Self>) -> bool {
        let body = self.linked_body();
        let transitioned = self.settle_cancel();
        body.cancel_outcome.complete(transitioned);
        transitioned
    }

    /// Cancels whichever stage of the chain is outstanding.
    ///
    /// The returned task reports `true` only if the last task in the chain
    /// did not complete; it stays pending until that is known.
    pub(crate) fn cancel_linked(self: &Arc<Self>) -> Arc<Task<bool>> {
        let body = self.linked_body();
        if !self.is_pending() {
            return Task::signaled(false);
        }

        let target = {
            let mut link = body.link.lock();
            match &*link {
                LinkStage::Empty => {
                    *link = LinkStage::CancelClaimed;
                    None
                }
                LinkStage::Inner(inner) => Some(Arc::clone(inner)),
                LinkStage::CancelClaimed => {
                    return Arc::clone(&body.cancel_outcome);
                }
            }
        };
        match target {
            // Inner task outstanding: cancelling it resolves the chain
            // through the completion continuation's cancel path.
            Some(inner) => {
                let _ = inner.cancel();
            }
            // Not materialized yet: cancel the stage task. If the stage has
            // already started running, its installation CAS will observe the
            // claim instead.
            None => {
                if let Some(stage) = body.stage.get() {
                    let _ = stage.cancel();
                }
            }
        }
        Arc::clone(&body.cancel_outcome)
    }

    /// Re-propagating priority change across the chain's hand-offs.
    pub(crate) fn change_priority_linked(self: &Arc<Self>, new_priority: i32) {
        let body = self.linked_body();
        if !self.is_pending() {
            return;
        }
        let mut previous = body.priority.swap(new_priority, Ordering::AcqRel);
        let mut applying = new_priority;
        while previous != applying {
            previous = applying;
            body.priority.store(applying, Ordering::Release);
            let target = {
                let link = body.link.lock();
                match &*link {
                    LinkStage::CancelClaimed => return,
                    LinkStage::Inner(inner) => Some(Arc::clone(inner)),
                    LinkStage::Empty => None,
                }
            };
            match target {
                Some(inner) => inner.change_priority(applying),
                None => {
                    if let Some(stage) = body.stage.get() {
                        stage.change_priority(applying);
                    }
                }
            }
            if let Some(completion) = body.completion.get() {
                completion.change_priority(applying);
            }
            applying = body.priority.load(Ordering::Acquire);
        }
    }
}
