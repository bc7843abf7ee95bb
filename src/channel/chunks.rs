use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr;
use std::ptr::NonNull;
use std::sync::atomic::AtomicPtr;

use super::stack::{ChunkNode, LockFreeStack};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Capacity of a [`ChunkChannel`], fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChannelConfig {
    /// Number of chunks circulating in the channel.
    pub chunks: usize,
    /// Payload size of each chunk in bytes.
    pub chunk_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        // 32 instances of 2KiB memory chunks
        Self {
            chunks: 32,
            chunk_bytes: 2048,
        }
    }
}

/// Fixed-capacity, lock-free, many-writer/many-reader message channel.
///
/// Two [`LockFreeStack`]s share a closed pool of chunks: `free` holds the
/// unused ones, `msgs` holds in-flight messages. [`alloc`](Self::alloc)
/// and [`recv`](Self::recv) returning `None` is the expected empty/full
/// state, a backpressure signal the caller handles by dropping,
/// deferring, or spinning, never a fatal condition.
///
/// Ordering is LIFO, not FIFO. That is a deliberate trade for
/// lock-freedom and simplicity: messages that must be ordered need a
/// sequence number in the payload.
pub struct ChunkChannel {
    free: LockFreeStack,
    msgs: LockFreeStack,
    nodes: NonNull<ChunkNode>,
    storage: NonNull<u8>,
    node_layout: Layout,
    storage_layout: Layout,
    config: ChannelConfig,
}

// The raw pointers are into allocations owned by the channel itself, and
// every shared access goes through the atomic stacks.
unsafe impl Send for ChunkChannel {}
unsafe impl Sync for ChunkChannel {}

impl ChunkChannel {
    pub fn new(config: ChannelConfig) -> Self {
        assert!(config.chunks > 0 && config.chunk_bytes > 0);

        let storage_layout = Layout::array::<u8>(config.chunks * config.chunk_bytes)
            .expect("channel storage size overflows");
        let node_layout =
            Layout::array::<ChunkNode>(config.chunks).expect("channel node count overflows");

        let storage = unsafe { alloc_zeroed(storage_layout) };
        let Some(storage) = NonNull::new(storage) else {
            handle_alloc_error(storage_layout)
        };
        let nodes = unsafe { alloc_zeroed(node_layout) }.cast::<ChunkNode>();
        let Some(nodes) = NonNull::new(nodes) else {
            handle_alloc_error(node_layout)
        };

        let channel = Self {
            free: LockFreeStack::new(),
            msgs: LockFreeStack::new(),
            nodes,
            storage,
            node_layout,
            storage_layout,
            config,
        };

        for i in 0..config.chunks {
            unsafe {
                let node = nodes.as_ptr().add(i);
                node.write(ChunkNode {
                    next: AtomicPtr::new(ptr::null_mut()),
                    data: storage.as_ptr().add(i * config.chunk_bytes),
                    len: config.chunk_bytes,
                });
                channel.free.push(NonNull::new_unchecked(node));
            }
        }

        channel
    }

    /// Take an unused chunk from the free list. `None` means every chunk
    /// is currently allocated or in flight.
    pub fn alloc(&self) -> Option<Chunk<'_>> {
        self.free.pop().map(|node| Chunk {
            node,
            channel: self,
        })
    }

    /// Return a chunk to the free list. Dropping the chunk does the same
    /// thing; this spelling exists for symmetry with [`alloc`](Self::alloc).
    pub fn release(&self, chunk: Chunk<'_>) {
        debug_assert!(ptr::eq(chunk.channel, self));
        drop(chunk);
    }

    /// Publish a chunk as an in-flight message.
    pub fn send(&self, chunk: Chunk<'_>) {
        debug_assert!(ptr::eq(chunk.channel, self));
        self.msgs.push(chunk.into_node());
    }

    /// Take the most recently sent message (LIFO). `None` means no
    /// message is pending.
    pub fn recv(&self) -> Option<Chunk<'_>> {
        self.msgs.pop().map(|node| Chunk {
            node,
            channel: self,
        })
    }

    pub fn capacity(&self) -> usize {
        self.config.chunks
    }

    pub fn chunk_bytes(&self) -> usize {
        self.config.chunk_bytes
    }
}

impl Default for ChunkChannel {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

impl Drop for ChunkChannel {
    fn drop(&mut self) {
        // All chunk handles borrow the channel, so by the time we get
        // here every node is back in one of the two stacks (or was leaked
        // into them via `send`); either way the backing allocations can go.
        unsafe {
            dealloc(self.nodes.as_ptr().cast(), self.node_layout);
            dealloc(self.storage.as_ptr(), self.storage_layout);
        }
    }
}

/// Exclusive handle to one chunk of channel memory.
///
/// Exclusivity transfers atomically on pop: whichever thread holds the
/// `Chunk` owns the bytes. Dropping the handle returns the chunk to the
/// channel's free list.
pub struct Chunk<'a> {
    node: NonNull<ChunkNode>,
    channel: &'a ChunkChannel,
}

// A chunk is plain bytes plus a node pointer whose ownership moves with
// the handle.
unsafe impl Send for Chunk<'_> {}

impl Chunk<'_> {
    pub fn len(&self) -> usize {
        unsafe { self.node.as_ref().len }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        let node = unsafe { self.node.as_ref() };
        unsafe { std::slice::from_raw_parts(node.data, node.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let node = unsafe { self.node.as_ref() };
        unsafe { std::slice::from_raw_parts_mut(node.data, node.len) }
    }

    /// Detach the node without returning it to the free list.
    fn into_node(self) -> NonNull<ChunkNode> {
        let node = self.node;
        std::mem::forget(self);
        node
    }
}

impl Drop for Chunk<'_> {
    fn drop(&mut self) {
        self.channel.free.push(self.node);
    }
}
