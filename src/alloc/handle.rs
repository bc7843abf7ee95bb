use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use super::RtAllocator;

/// Owned handle into an [`RtAllocator`] arena.
///
/// The arena equivalent of `Box<T>`: dropping the handle runs `T`'s
/// destructor and returns the memory to the arena's free lists, so
/// arena-owned objects cannot leak or double-free by construction.
/// `into_raw_parts`/`from_raw_parts` open an escape hatch for code that
/// assembles objects inside an allocator transaction and must defer
/// ownership until the transaction commits.
pub struct Handle<'a, T: ?Sized> {
    ptr: NonNull<T>,
    arena: &'a RtAllocator,
}

impl<'a, T> Handle<'a, T> {
    /// Construct a `T` in the arena. `None` means the pools are
    /// exhausted.
    pub fn new(arena: &'a RtAllocator, value: T) -> Option<Self> {
        let ptr = arena.construct(value)?;
        Some(Self { ptr, arena })
    }
}

impl<'a, T: ?Sized> Handle<'a, T> {
    /// Disassemble the handle without dropping the value.
    pub fn into_raw_parts(self) -> (NonNull<T>, &'a RtAllocator) {
        let parts = (self.ptr, self.arena);
        std::mem::forget(self);
        parts
    }

    /// Reassemble a handle from [`into_raw_parts`](Self::into_raw_parts)
    /// output (or an equivalent `construct` call).
    ///
    /// # Safety
    /// `ptr` must point to a live value constructed in `arena`, and no
    /// other handle may own it.
    pub unsafe fn from_raw_parts(ptr: NonNull<T>, arena: &'a RtAllocator) -> Self {
        Self { ptr, arena }
    }

    /// The arena this handle frees into.
    pub fn arena(&self) -> &'a RtAllocator {
        self.arena
    }
}

impl<T: ?Sized> Deref for Handle<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: ?Sized> DerefMut for Handle<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T: ?Sized> Drop for Handle<'_, T> {
    fn drop(&mut self) {
        unsafe { self.arena.destroy(self.ptr) };
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Handle<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Probe<'a>(&'a Cell<u32>);
    impl Drop for Probe<'_> {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn drop_frees_through_the_arena() {
        let drops = Cell::new(0);
        let mem = RtAllocator::new();
        let before = mem.free_bytes();

        let handle = Handle::new(&mem, Probe(&drops)).unwrap();
        assert!(mem.free_bytes() < before);
        drop(handle);

        assert_eq!(drops.get(), 1);
        assert_eq!(mem.free_bytes(), before);
    }

    #[test]
    fn raw_parts_round_trip_defers_ownership() {
        let drops = Cell::new(0);
        let mem = RtAllocator::new();

        let handle = Handle::new(&mem, Probe(&drops)).unwrap();
        let (ptr, arena) = handle.into_raw_parts();
        assert_eq!(drops.get(), 0);

        let handle = unsafe { Handle::from_raw_parts(ptr, arena) };
        drop(handle);
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn deref_reaches_the_value() {
        let mem = RtAllocator::new();
        let mut handle = Handle::new(&mem, 41u32).unwrap();
        *handle += 1;
        assert_eq!(*handle, 42);
    }
}
