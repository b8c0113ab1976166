// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tokens naming individual queue elements.

use std::fmt::Debug;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use crate::queue::Slot;

mod sealed {
    use std::sync::Arc;

    use crate::queue::Slot;

    pub trait TokenImpl<K, V> {
        /// The slot this token refers to, if it is still reachable.
        fn slot(&self) -> Option<Arc<Slot<K, V>>>;
    }
}

pub(crate) use sealed::TokenImpl;

/// A handle naming one element of a [`PriorityQueue`](crate::PriorityQueue).
///
/// Both token kinds implement this trait; queue operations that address an
/// element ([`remove`](crate::PriorityQueue::remove),
/// [`change_priority`](crate::PriorityQueue::change_priority)) accept either.
pub trait Token<K, V>: sealed::TokenImpl<K, V> {}

/// A weak handle to a queued element, returned by
/// [`insert`](crate::PriorityQueue::insert).
///
/// A `RemoveToken` does not keep the element alive: once the element has been
/// popped or removed, operations through the token report failure. The token
/// follows its element across priority changes.
pub struct RemoveToken<K, V> {
    pub(crate) slot: Weak<Slot<K, V>>,
}

impl<K, V> RemoveToken<K, V> {
    /// A token that names no element; all operations through it fail.
    #[must_use]
    pub fn detached() -> Self {
        Self { slot: Weak::new() }
    }
}

impl<K, V> Clone for RemoveToken<K, V> {
    fn clone(&self) -> Self {
        Self {
            slot: Weak::clone(&self.slot),
        }
    }
}

impl<K, V> Debug for RemoveToken<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoveToken").finish_non_exhaustive()
    }
}

impl<K, V> sealed::TokenImpl<K, V> for RemoveToken<K, V> {
    fn slot(&self) -> Option<Arc<Slot<K, V>>> {
        self.slot.upgrade()
    }
}

impl<K, V> Token<K, V> for RemoveToken<K, V> {}

/// A strong handle to an element observed by
/// [`pop`](crate::PriorityQueue::pop) or [`peek`](crate::PriorityQueue::peek),
/// carrying the element's value and the priority it held when observed.
///
/// Dereferences to the element's value. The token keeps the value alive even
/// after the element has left the queue.
pub struct ValueToken<K, V> {
    pub(crate) slot: Arc<Slot<K, V>>,
    pub(crate) priority: K,
}

impl<K, V> ValueToken<K, V> {
    /// The element's priority at the moment this token was produced.
    ///
    /// A concurrent [`change_priority`](crate::PriorityQueue::change_priority)
    /// may have moved the element since; the snapshot is what the observing
    /// operation acted on.
    pub fn priority(&self) -> K
    where
        K: Clone,
    {
        self.priority.clone()
    }

    /// The element's value.
    pub fn value(&self) -> &V {
        self.slot.value()
    }
}

impl<K, V> Deref for ValueToken<K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        self.value()
    }
}

impl<K, V> Clone for ValueToken<K, V>
where
    K: Clone,
{
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            priority: self.priority.clone(),
        }
    }
}

impl<K, V> Debug for ValueToken<K, V>
where
    K: Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueToken")
            .field("priority", &self.priority)
            .field("value", self.value())
            .finish()
    }
}

impl<K, V> sealed::TokenImpl<K, V> for ValueToken<K, V> {
    fn slot(&self) -> Option<Arc<Slot<K, V>>> {
        Some(Arc::clone(&self.slot))
    }
}

impl<K, V> Token<K, V> for ValueToken<K, V> {}
