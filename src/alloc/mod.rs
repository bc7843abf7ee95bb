// Purpose: serve typed alloc/free requests from the audio thread with
// bounded worst-case latency and zero calls into the platform allocator
// on the hot path.

mod handle;

pub use handle::Handle;

use std::alloc::{handle_alloc_error, Layout};
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use thiserror::Error;

/*
Pool Allocator
==============

Memory comes from a growable list of large pre-reserved pools. A
segregated-fit structure (power-of-two bins of intrusive free lists)
serves allocations out of those pools: first fit within a bin, larger
bins consulted in order, blocks split when the remainder is worth
keeping. Freed blocks go straight back to their size bin; they are not
coalesced, which keeps free O(1) and is harmless for the
fixed-vocabulary allocation patterns of note construction.

Concurrency: the allocator is deliberately `!Sync` (its free structure
lives in `Cell`s). The single-writer discipline (only the audio thread
mutates the pool during playback, structural growth happens in idle
windows) therefore cannot be violated across threads at all;
within the audio thread, alloc/free/grow may interleave freely.

Failure is a value: every allocating call returns `Option`/`Result` and
never panics across the realtime boundary.
*/

/// Default size of the pool reserved at construction.
pub const DEFAULT_POOL_BYTES: usize = 16 * 1024 * 1024;

/// Alignment of every block and payload the allocator hands out.
/// Types with stricter alignment are not supported.
pub const BLOCK_ALIGN: usize = 16;

const HEADER: usize = 16; // usize size tag, padded to BLOCK_ALIGN
const MIN_BLOCK: usize = 32; // must hold a FreeBlock when freed
const BIN_COUNT: usize = 40;
const TXN_LOG_CAP: usize = 256;
const PROBE_SCRATCH: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The pools cannot satisfy the request (or reserving a new pool
    /// failed).
    #[error("memory pools exhausted")]
    OutOfMemory,
    /// `begin_transaction` while a transaction is already active. Only
    /// one transaction may run at a time; nesting is rejected, never
    /// silently truncated.
    #[error("a transaction is already active")]
    NestedTransaction,
    /// `end_transaction`/`rollback_transaction` without an active
    /// transaction.
    #[error("no transaction is active")]
    NoActiveTransaction,
}

/// Link stored inside a free block's own bytes.
#[repr(C)]
struct FreeBlock {
    size: usize,
    next: *mut FreeBlock,
}

struct MemoryPool {
    base: NonNull<u8>,
    layout: Layout,
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

struct TxnLog {
    active: bool,
    ptrs: Vec<*mut u8>,
}

/// Realtime-safe heap over a growable list of pre-reserved pools.
pub struct RtAllocator {
    bins: [Cell<*mut FreeBlock>; BIN_COUNT],
    pools: RefCell<Vec<MemoryPool>>,
    txn: RefCell<TxnLog>,
}

// No thread affinity; the interior mutability is what makes it !Sync,
// and !Sync is the whole single-writer story.
unsafe impl Send for RtAllocator {}

impl RtAllocator {
    /// Reserve the default 16MiB pool.
    pub fn new() -> Self {
        Self::with_pool_size(DEFAULT_POOL_BYTES)
    }

    /// Reserve a single pool of `bytes`. Construction is the one place
    /// that may touch the platform allocator; it aborts on reservation
    /// failure like any other startup allocation.
    pub fn with_pool_size(bytes: usize) -> Self {
        let allocator = Self {
            bins: std::array::from_fn(|_| Cell::new(std::ptr::null_mut())),
            pools: RefCell::new(Vec::new()),
            txn: RefCell::new(TxnLog {
                active: false,
                ptrs: Vec::with_capacity(TXN_LOG_CAP),
            }),
        };
        if allocator.grow(bytes).is_err() {
            handle_alloc_error(Layout::from_size_align(bytes.max(MIN_BLOCK), BLOCK_ALIGN).unwrap());
        }
        allocator
    }

    /// Append a new pool to the pool list. Pools are appended, never
    /// removed. Not realtime-safe; call it from idle/non-playback
    /// windows when headroom probing says the pools are running low.
    pub fn grow(&self, bytes: usize) -> Result<(), AllocError> {
        let bytes = round_up(bytes.max(MIN_BLOCK)).ok_or(AllocError::OutOfMemory)?;
        let layout =
            Layout::from_size_align(bytes, BLOCK_ALIGN).map_err(|_| AllocError::OutOfMemory)?;
        let base =
            NonNull::new(unsafe { std::alloc::alloc(layout) }).ok_or(AllocError::OutOfMemory)?;
        self.pools.borrow_mut().push(MemoryPool { base, layout });
        self.push_free(base.as_ptr(), bytes);
        Ok(())
    }

    /// Raw allocation. `None` means the pools are exhausted; callers on
    /// the audio thread convert that into "could not allocate this
    /// note", they do not panic.
    pub fn alloc_mem(&self, size: usize) -> Option<NonNull<u8>> {
        // A request near usize::MAX must fail like any other exhaustion,
        // not wrap around to a tiny block.
        let need = size
            .max(1)
            .checked_add(HEADER)
            .and_then(round_up)?
            .max(MIN_BLOCK);
        let (block, block_size) = self.take_block(need)?;
        unsafe { block.cast::<usize>().write(block_size) };
        let payload = unsafe { NonNull::new_unchecked(block.add(HEADER)) };
        if !self.txn_record(payload) {
            // Transaction log full: treat as exhaustion so the caller's
            // rollback still covers everything it attempted.
            self.push_free(block, block_size);
            return None;
        }
        Some(payload)
    }

    /// Raw free.
    ///
    /// # Safety
    /// `ptr` must come from `alloc_mem` (or a typed wrapper) on this
    /// allocator and must not be used afterwards.
    pub unsafe fn dealloc_mem(&self, ptr: NonNull<u8>) {
        let block = unsafe { ptr.as_ptr().sub(HEADER) };
        let size = unsafe { block.cast::<usize>().read() };
        self.txn_unrecord(ptr);
        self.push_free(block, size);
    }

    /// Allocate and placement-construct a `T`.
    pub fn construct<T>(&self, value: T) -> Option<NonNull<T>> {
        debug_assert!(std::mem::align_of::<T>() <= BLOCK_ALIGN);
        let raw = self.alloc_mem(std::mem::size_of::<T>())?;
        let ptr = raw.cast::<T>();
        unsafe { ptr.as_ptr().write(value) };
        Some(ptr)
    }

    /// Drop a constructed value in place and free its memory.
    ///
    /// # Safety
    /// `ptr` must come from `construct`/`construct_array` on this
    /// allocator, point to a live value, and must not be used afterwards.
    pub unsafe fn destroy<T: ?Sized>(&self, ptr: NonNull<T>) {
        unsafe {
            std::ptr::drop_in_place(ptr.as_ptr());
            self.dealloc_mem(ptr.cast::<u8>());
        }
    }

    /// Allocate and construct `n` elements, initializing each with
    /// `init(index)`. Returns the base pointer.
    pub fn construct_array<T>(
        &self,
        n: usize,
        mut init: impl FnMut(usize) -> T,
    ) -> Option<NonNull<T>> {
        debug_assert!(std::mem::align_of::<T>() <= BLOCK_ALIGN);
        let raw = self.alloc_mem(std::mem::size_of::<T>().checked_mul(n)?)?;
        let base = raw.cast::<T>();
        for i in 0..n {
            unsafe { base.as_ptr().add(i).write(init(i)) };
        }
        Some(base)
    }

    /// Drop `n` elements and free the array.
    ///
    /// # Safety
    /// `ptr` must come from `construct_array(n, ..)` on this allocator
    /// and must not be used afterwards.
    pub unsafe fn destroy_array<T>(&self, ptr: NonNull<T>, n: usize) {
        unsafe {
            for i in 0..n {
                std::ptr::drop_in_place(ptr.as_ptr().add(i));
            }
            self.dealloc_mem(ptr.cast::<u8>());
        }
    }

    /// Free without running any destructor (the `devalloc` path for raw
    /// buffers).
    ///
    /// # Safety
    /// Same contract as [`dealloc_mem`](Self::dealloc_mem).
    pub unsafe fn release_raw(&self, ptr: NonNull<u8>) {
        unsafe { self.dealloc_mem(ptr) };
    }

    /// Speculatively perform `n` allocations of `chunk_size`, free them
    /// all, and report whether every one succeeded. Never leaves
    /// allocations outstanding. The caller uses this to decide when to
    /// [`grow`](Self::grow) before the audio thread would actually starve.
    ///
    /// The probe holds at most 4096 allocations at once; a larger `n` is
    /// capped to that, so the answer only demonstrates headroom up to
    /// the cap.
    pub fn probe_headroom(&self, n: usize, chunk_size: usize) -> bool {
        let mut scratch = [std::ptr::null_mut::<u8>(); PROBE_SCRATCH];
        let n = n.min(PROBE_SCRATCH);
        let mut got = 0;
        let mut ok = true;
        for slot in scratch.iter_mut().take(n) {
            match self.alloc_mem(chunk_size) {
                Some(p) => {
                    *slot = p.as_ptr();
                    got += 1;
                }
                None => {
                    ok = false;
                    break;
                }
            }
        }
        for p in &scratch[..got] {
            unsafe { self.dealloc_mem(NonNull::new_unchecked(*p)) };
        }
        ok
    }

    /// Start recording raw allocations so a failed multi-step operation
    /// can be undone atomically. Only one transaction may be active at a
    /// time.
    pub fn begin_transaction(&self) -> Result<(), AllocError> {
        let mut txn = self.txn.borrow_mut();
        if txn.active {
            return Err(AllocError::NestedTransaction);
        }
        txn.active = true;
        txn.ptrs.clear();
        Ok(())
    }

    /// Commit: stop recording, keep every allocation.
    pub fn end_transaction(&self) -> Result<(), AllocError> {
        let mut txn = self.txn.borrow_mut();
        if !txn.active {
            return Err(AllocError::NoActiveTransaction);
        }
        txn.active = false;
        txn.ptrs.clear();
        Ok(())
    }

    /// Abort: free every allocation recorded since `begin_transaction`,
    /// restoring the pre-transaction free-space state.
    ///
    /// This frees raw memory only; destructors do not run. Values the
    /// caller constructed inside the transaction must not be touched (or
    /// wrapped in a [`Handle`]) after rollback.
    pub fn rollback_transaction(&self) -> Result<(), AllocError> {
        {
            let mut txn = self.txn.borrow_mut();
            if !txn.active {
                return Err(AllocError::NoActiveTransaction);
            }
            txn.active = false;
        }
        loop {
            let ptr = self.txn.borrow_mut().ptrs.pop();
            match ptr {
                Some(p) => unsafe { self.dealloc_mem(NonNull::new_unchecked(p)) },
                None => return Ok(()),
            }
        }
    }

    /// Number of pools currently backing the allocator.
    pub fn pool_count(&self) -> usize {
        self.pools.borrow().len()
    }

    /// Total bytes sitting on the free lists. Diagnostic only; walks
    /// every free block.
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        for bin in &self.bins {
            let mut cur = bin.get();
            while !cur.is_null() {
                unsafe {
                    total += (*cur).size;
                    cur = (*cur).next;
                }
            }
        }
        total
    }

    fn take_block(&self, need: usize) -> Option<(*mut u8, usize)> {
        for bin in self.bins.iter().skip(bin_of(need)) {
            let mut prev: *mut FreeBlock = std::ptr::null_mut();
            let mut cur = bin.get();
            while !cur.is_null() {
                let size = unsafe { (*cur).size };
                if size >= need {
                    let next = unsafe { (*cur).next };
                    if prev.is_null() {
                        bin.set(next);
                    } else {
                        unsafe { (*prev).next = next };
                    }
                    let mut taken = size;
                    if size - need >= MIN_BLOCK {
                        self.push_free(unsafe { cur.cast::<u8>().add(need) }, size - need);
                        taken = need;
                    }
                    return Some((cur.cast::<u8>(), taken));
                }
                prev = cur;
                cur = unsafe { (*cur).next };
            }
        }
        None
    }

    fn push_free(&self, block: *mut u8, size: usize) {
        debug_assert!(size >= MIN_BLOCK);
        let bin = &self.bins[bin_of(size)];
        let free = block.cast::<FreeBlock>();
        unsafe {
            free.write(FreeBlock {
                size,
                next: bin.get(),
            });
        }
        bin.set(free);
    }

    fn txn_record(&self, ptr: NonNull<u8>) -> bool {
        let mut txn = self.txn.borrow_mut();
        if !txn.active {
            return true;
        }
        if txn.ptrs.len() == TXN_LOG_CAP {
            return false;
        }
        txn.ptrs.push(ptr.as_ptr());
        true
    }

    fn txn_unrecord(&self, ptr: NonNull<u8>) {
        let mut txn = self.txn.borrow_mut();
        if !txn.active {
            return;
        }
        if let Some(pos) = txn.ptrs.iter().position(|&p| p == ptr.as_ptr()) {
            txn.ptrs.swap_remove(pos);
        }
    }
}

impl Default for RtAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Round up to the block alignment; `None` when that overflows.
#[inline]
fn round_up(size: usize) -> Option<usize> {
    Some(size.checked_add(BLOCK_ALIGN - 1)? & !(BLOCK_ALIGN - 1))
}

#[inline]
fn bin_of(size: usize) -> usize {
    debug_assert!(size > 0);
    ((usize::BITS - 1 - size.leading_zeros()) as usize).min(BIN_COUNT - 1)
}
