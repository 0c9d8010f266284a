//! The page-provider contract consumed by [`super::bud`] and [`super::rm`].
//!
//! A provider hands out fixed-size, `PAGE_SIZE`-aligned page frames and takes
//! them back by handle. This module only describes the contract and a couple
//! of concrete providers; it carries no allocation policy of its own.

use core::ptr::NonNull;

/// Page size shared by both allocator strategies, in bytes.
///
/// `LEVELS = 9` and `BLOCKBITS = 4` in [`super::bud`] are chosen so that the
/// largest buddy level is exactly one page: `2^(BLOCKBITS + LEVELS) == PAGE_SIZE`.
pub const PAGE_SIZE: usize = 8192;

const _: () = assert!(1usize << (4 + 9) == PAGE_SIZE);

/// A handle to a page obtained from a [`PageProvider`].
///
/// `id` is the provider's own stable identifier for the page, used to
/// recognize a page it previously handed out; `base` is the page's starting
/// address, guaranteed aligned to [`PAGE_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHandle {
    pub id: u64,
    pub base: NonNull<u8>,
}

/// External collaborator supplying and reclaiming whole pages.
///
/// No ordering relation between successive [`PageProvider::get_page`] results
/// is assumed by this trait. [`super::rm`]'s internal page-index arithmetic
/// additionally requires pages obtained from a single provider instance to be
/// laid out at ascending, contiguous `PAGE_SIZE` strides; that stronger
/// requirement is documented on [`super::rm::ResourceMapAllocator`] rather
/// than encoded here, since [`super::bud`] has no such need.
pub trait PageProvider {
    /// Obtains a fresh page, or `None` if the provider is exhausted.
    fn get_page(&mut self) -> Option<PageHandle>;

    /// Returns a previously obtained page to the provider.
    fn free_page(&mut self, handle: PageHandle);
}

/// Writes `id` into the first machine word of the page based at `base`.
///
/// # Safety
/// `base` must be the start of a writable, `PAGE_SIZE`-aligned page.
pub unsafe fn stamp_handle_id(base: NonNull<u8>, id: u64) {
    debug_assert_eq!(base.as_ptr() as usize % PAGE_SIZE, 0, "page base must be PAGE_SIZE-aligned");
    unsafe {
        (base.as_ptr() as *mut u64).write(id);
    }
}

/// Recovers the handle stamped into the page containing `addr`, by rounding
/// `addr` down to `PAGE_SIZE` alignment and reading back the stored id.
///
/// # Safety
/// `addr` must point inside a page previously initialized with [`stamp_handle_id`].
pub unsafe fn recover_handle(addr: NonNull<u8>) -> PageHandle {
    let aligned = (addr.as_ptr() as usize) & !(PAGE_SIZE - 1);
    let base = unsafe { NonNull::new_unchecked(aligned as *mut u8) };
    let id = unsafe { *(base.as_ptr() as *const u64) };
    PageHandle { id, base }
}

/// Size, in bytes, of the handle word every page reserves at offset 0.
pub const HANDLE_WORD_SIZE: usize = core::mem::size_of::<u64>();

#[cfg(any(test, feature = "std"))]
pub mod test_support {
    //! In-memory page providers for host-side unit tests.
    //!
    //! Not part of the crate's public surface in a real kernel build; only
    //! compiled under `std`/`test`, the same way other host-testable
    //! allocator cores in this ecosystem keep their test fixtures alongside
    //! the code they exercise.

    extern crate std;

    use super::{PAGE_SIZE, PageHandle, PageProvider};
    use core::ptr::NonNull;
    use std::alloc::{Layout, alloc, dealloc};
    use std::vec::Vec;

    /// Hands out independently-allocated pages with no ordering guarantee
    /// between them. Suitable for BUD, which never assumes page contiguity.
    pub struct ArbitraryPageProvider {
        next_id: u64,
        live: Vec<(u64, NonNull<u8>)>,
    }

    impl ArbitraryPageProvider {
        pub fn new() -> Self {
            Self { next_id: 0, live: Vec::new() }
        }

        fn layout() -> Layout {
            Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
        }
    }

    impl Default for ArbitraryPageProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    impl PageProvider for ArbitraryPageProvider {
        fn get_page(&mut self) -> Option<PageHandle> {
            let ptr = unsafe { alloc(Self::layout()) };
            let base = NonNull::new(ptr)?;
            let id = self.next_id;
            self.next_id += 1;
            self.live.push((id, base));
            Some(PageHandle { id, base })
        }

        fn free_page(&mut self, handle: PageHandle) {
            let pos = self
                .live
                .iter()
                .position(|&(id, base)| id == handle.id && base == handle.base)
                .expect("free_page called with a handle this provider never issued");
            self.live.remove(pos);
            unsafe { dealloc(handle.base.as_ptr(), Self::layout()) };
        }
    }

    impl Drop for ArbitraryPageProvider {
        fn drop(&mut self) {
            for (_, base) in self.live.drain(..) {
                unsafe { dealloc(base.as_ptr(), Self::layout()) };
            }
        }
    }

    /// Hands out pages sliced from one contiguous, pre-reserved arena, in
    /// ascending address order. Required by [`super::super::rm`], which
    /// derives a block's owning page header by dividing its offset from the
    /// first page header by [`PAGE_SIZE`].
    pub struct ContiguousPageProvider {
        arena: NonNull<u8>,
        capacity_pages: usize,
        next_index: usize,
        free_indices: Vec<usize>,
    }

    impl ContiguousPageProvider {
        pub fn new(capacity_pages: usize) -> Self {
            let layout = Layout::from_size_align(capacity_pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            let ptr = unsafe { alloc(layout) };
            let arena = NonNull::new(ptr).expect("host allocation for test arena failed");
            Self { arena, capacity_pages, next_index: 0, free_indices: Vec::new() }
        }

        fn layout(&self) -> Layout {
            Layout::from_size_align(self.capacity_pages * PAGE_SIZE, PAGE_SIZE).unwrap()
        }

        fn base_of(&self, index: usize) -> NonNull<u8> {
            unsafe { NonNull::new_unchecked(self.arena.as_ptr().add(index * PAGE_SIZE)) }
        }
    }

    impl PageProvider for ContiguousPageProvider {
        fn get_page(&mut self) -> Option<PageHandle> {
            let index = if let Some(reused) = self.free_indices.pop() {
                reused
            } else if self.next_index < self.capacity_pages {
                let i = self.next_index;
                self.next_index += 1;
                i
            } else {
                return None;
            };
            Some(PageHandle { id: index as u64, base: self.base_of(index) })
        }

        fn free_page(&mut self, handle: PageHandle) {
            self.free_indices.push(handle.id as usize);
        }
    }

    impl Drop for ContiguousPageProvider {
        fn drop(&mut self) {
            unsafe { dealloc(self.arena.as_ptr(), self.layout()) };
        }
    }
}
