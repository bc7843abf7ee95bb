use std::ptr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

/*
Treiber Stack
=============

A single atomic head pointer plus a compare-and-swap retry loop gives a
stack that many threads can push to and pop from without locks. Both
operations complete in a bounded number of retries under contention and
never block, which is what lets the audio thread touch it at all.

The node pointers are NOT tagged or versioned. That is only sound because
every node comes from a closed pool owned by the enclosing channel: nodes
circulate between the channel's two stacks forever and are freed only when
the channel itself is dropped, after all handles are gone. Reusing this
stack anywhere with general deallocation would require hazard pointers or
an epoch scheme. Do not promote it to a general-purpose primitive.
*/

/// Intrusive node: a fixed byte buffer plus the link used while the node
/// sits on a stack. The buffer pointer and length never change after
/// construction; `next` is only written by the thread that currently owns
/// the node (just before push) or read during pop.
pub(crate) struct ChunkNode {
    pub(crate) next: AtomicPtr<ChunkNode>,
    pub(crate) data: *mut u8,
    pub(crate) len: usize,
}

/// Many-writer many-reader lock-free stack of [`ChunkNode`]s.
pub(crate) struct LockFreeStack {
    head: AtomicPtr<ChunkNode>,
}

impl LockFreeStack {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Push a node. The caller must exclusively own `node` (it must not be
    /// reachable from any stack) and `node` must stay valid for the life
    /// of the stack.
    pub(crate) fn push(&self, node: NonNull<ChunkNode>) {
        loop {
            let old = self.head.load(Ordering::Relaxed);
            unsafe { node.as_ref().next.store(old, Ordering::Relaxed) };
            // Release so the payload written before push is visible to
            // whichever thread pops this node.
            if self
                .head
                .compare_exchange(old, node.as_ptr(), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pop a node, transferring exclusive ownership to the caller.
    /// `None` means the stack is empty; that is the normal idle/full
    /// signal, not an error.
    pub(crate) fn pop(&self) -> Option<NonNull<ChunkNode>> {
        loop {
            let cur = NonNull::new(self.head.load(Ordering::Acquire))?;
            // Reading `next` of a node another thread may concurrently pop
            // is fine here: the node memory itself is never freed while
            // the channel exists, and a stale read only makes the CAS
            // below fail and retry.
            let next = unsafe { cur.as_ref().next.load(Ordering::Relaxed) };
            if self
                .head
                .compare_exchange(cur.as_ptr(), next, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(cur);
            }
        }
    }
}
