//! Intrusive priority queue of blocked threads.
//!
//! Every waiter links a [`QueueNode`] living in its own stack frame into the
//! queue of the primitive it blocks on, so queue membership costs no
//! allocation. The queue is not self-synchronizing: every method takes an
//! [`IrqKey`] witness proving that the caller holds the global critical
//! section.
//!
//! A node can be taken out of the queue by two racing parties: a notifier
//! popping the head, or the waiter itself removing its node after a timeout
//! or spurious wakeup. Whoever unlinks the node also claims its payload in
//! the same critical section, so exactly one party ever processes it;
//! [`PriorityQueue::remove`] is an idempotent no-op for the loser.

use crate::sync::IrqKey;
use core::cell::Cell;
use core::marker::PhantomPinned;
use core::pin::Pin;
use core::ptr::NonNull;
use skein_kernel::{Priority, ThreadId};

pub struct QueueNode {
    priority: Priority,
    payload: Cell<Option<ThreadId>>,
    next: Cell<Option<NonNull<QueueNode>>>,
    linked: Cell<bool>,
    _pin: PhantomPinned,
}

impl QueueNode {
    pub const fn new(priority: Priority, thread: ThreadId) -> QueueNode {
        QueueNode {
            priority,
            payload: Cell::new(Some(thread)),
            next: Cell::new(None),
            linked: Cell::new(false),
            _pin: PhantomPinned,
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// True once a notifier has claimed this node's payload.
    pub fn is_claimed(&self, _key: IrqKey<'_>) -> bool {
        self.payload.get().is_none()
    }
}

impl Drop for QueueNode {
    fn drop(&mut self) {
        // A node must be unlinked before its stack frame goes away.
        debug_assert!(!self.linked.get());
    }
}

/// Priority-ordered list of queue nodes. The head is the most urgent node;
/// equal priorities are served first-in-first-out.
pub struct PriorityQueue {
    head: Cell<Option<NonNull<QueueNode>>>,
}

unsafe impl Send for PriorityQueue {}

impl PriorityQueue {
    pub const fn new() -> PriorityQueue {
        PriorityQueue {
            head: Cell::new(None),
        }
    }

    pub fn is_empty(&self, _key: IrqKey<'_>) -> bool {
        self.head.get().is_none()
    }

    /// Links `node` into priority order, after any node of equal priority.
    /// O(n). The node must stay pinned until it is unlinked again; every
    /// wait path in this crate removes its node before returning.
    pub fn insert(&self, _key: IrqKey<'_>, node: Pin<&QueueNode>) {
        debug_assert!(!node.linked.get());
        let node_ptr = NonNull::from(node.get_ref());
        node.linked.set(true);

        let mut prev: Option<NonNull<QueueNode>> = None;
        let mut cursor = self.head.get();
        while let Some(current) = cursor {
            let current = unsafe { current.as_ref() };
            if node.priority().is_higher_than(current.priority) {
                break;
            }
            prev = cursor;
            cursor = current.next.get();
        }

        node.next.set(cursor);
        match prev {
            Some(prev) => unsafe { prev.as_ref() }.next.set(Some(node_ptr)),
            None => self.head.set(Some(node_ptr)),
        }
    }

    /// Unlinks the most urgent node and claims its payload, in one step
    /// under the caller's critical section. O(1).
    pub fn remove_head(&self, _key: IrqKey<'_>) -> Option<(Priority, ThreadId)> {
        let head = self.head.get()?;
        let head = unsafe { head.as_ref() };
        self.head.set(head.next.get());
        head.next.set(None);
        head.linked.set(false);
        let priority = head.priority;
        head.payload.take().map(|thread| (priority, thread))
    }

    /// Unlinks `node` if it is still queued; no-op when a racing remover got
    /// there first. O(n).
    pub fn remove(&self, _key: IrqKey<'_>, node: Pin<&QueueNode>) {
        if !node.linked.get() {
            return;
        }
        let node_ptr = NonNull::from(node.get_ref());

        let mut prev: Option<NonNull<QueueNode>> = None;
        let mut cursor = self.head.get();
        while let Some(current) = cursor {
            if current == node_ptr {
                let next = unsafe { current.as_ref() }.next.get();
                match prev {
                    Some(prev) => unsafe { prev.as_ref() }.next.set(next),
                    None => self.head.set(next),
                }
                node.next.set(None);
                node.linked.set(false);
                return;
            }
            prev = cursor;
            cursor = unsafe { current.as_ref() }.next.get();
        }
    }
}

#[cfg(test)]
mod test {
    use super::{PriorityQueue, QueueNode};
    use crate::sync::IrqKey;
    use core::pin::pin;
    use skein_kernel::{Priority, ThreadId};

    fn key() -> IrqKey<'static> {
        // Unit tests are single-threaded; no critical section needed.
        unsafe { IrqKey::assume() }
    }

    fn node(level: u8, id: u32) -> QueueNode {
        QueueNode::new(Priority::new(level), ThreadId::from_raw(id))
    }

    #[test]
    fn serves_most_urgent_first() {
        let queue = PriorityQueue::new();
        let low = pin!(node(9, 1));
        let high = pin!(node(2, 2));
        let mid = pin!(node(5, 3));
        queue.insert(key(), low.as_ref());
        queue.insert(key(), high.as_ref());
        queue.insert(key(), mid.as_ref());

        assert_eq!(
            queue.remove_head(key()),
            Some((Priority::new(2), ThreadId::from_raw(2)))
        );
        assert_eq!(
            queue.remove_head(key()),
            Some((Priority::new(5), ThreadId::from_raw(3)))
        );
        assert_eq!(
            queue.remove_head(key()),
            Some((Priority::new(9), ThreadId::from_raw(1)))
        );
        assert_eq!(queue.remove_head(key()), None);
    }

    #[test]
    fn fifo_among_equal_priorities() {
        let queue = PriorityQueue::new();
        let first = pin!(node(4, 1));
        let second = pin!(node(4, 2));
        let third = pin!(node(4, 3));
        queue.insert(key(), first.as_ref());
        queue.insert(key(), second.as_ref());
        queue.insert(key(), third.as_ref());

        let order: Vec<u32> = core::iter::from_fn(|| queue.remove_head(key()))
            .map(|(_, id)| id.as_raw())
            .collect();
        assert_eq!(order, [1, 2, 3]);
    }

    #[test]
    fn remove_is_idempotent() {
        let queue = PriorityQueue::new();
        let a = pin!(node(3, 1));
        let b = pin!(node(6, 2));
        queue.insert(key(), a.as_ref());
        queue.insert(key(), b.as_ref());

        queue.remove(key(), a.as_ref());
        queue.remove(key(), a.as_ref());

        assert_eq!(
            queue.remove_head(key()),
            Some((Priority::new(6), ThreadId::from_raw(2)))
        );
        assert!(queue.is_empty(key()));
    }

    #[test]
    fn remove_interior_node_relinks() {
        let queue = PriorityQueue::new();
        let a = pin!(node(1, 1));
        let b = pin!(node(2, 2));
        let c = pin!(node(3, 3));
        queue.insert(key(), a.as_ref());
        queue.insert(key(), b.as_ref());
        queue.insert(key(), c.as_ref());

        queue.remove(key(), b.as_ref());

        let order: Vec<u32> = core::iter::from_fn(|| queue.remove_head(key()))
            .map(|(_, id)| id.as_raw())
            .collect();
        assert_eq!(order, [1, 3]);
    }

    #[test]
    fn remove_head_claims_payload() {
        let queue = PriorityQueue::new();
        let a = pin!(node(3, 7));
        queue.insert(key(), a.as_ref());

        assert!(!a.is_claimed(key()));
        queue.remove_head(key());
        assert!(a.is_claimed(key()));
    }
}
