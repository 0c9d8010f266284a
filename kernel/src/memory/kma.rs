//! Top-level dispatch for the page-granularity kernel memory allocator.
//!
//! Exactly one strategy — [`super::bud`] or [`super::rm`] — is linked in,
//! selected by the mutually exclusive `kma-bud`/`kma-rm` Cargo features.
//! There is no runtime switch.

#[cfg(all(feature = "kma-bud", feature = "kma-rm"))]
compile_error!("enable exactly one of the `kma-bud` or `kma-rm` features, not both");
#[cfg(not(any(feature = "kma-bud", feature = "kma-rm")))]
compile_error!("enable exactly one of the `kma-bud` or `kma-rm` features");

use core::ptr::NonNull;

/// Uniform surface both strategies implement, so call sites and test helpers
/// can treat either backend identically.
pub trait Allocator {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;
    fn release(&mut self, addr: NonNull<u8>, size: usize);
}

#[cfg(feature = "kma-bud")]
pub type Strategy<P> = super::bud::BuddyAllocator<P>;
#[cfg(feature = "kma-rm")]
pub type Strategy<P> = super::rm::ResourceMapAllocator<P>;

#[cfg(not(feature = "std"))]
mod kernel_instance {
    use super::Strategy;
    use crate::memory::paging::KernelPageProvider;
    use core::ptr::NonNull;
    use spin::Mutex;

    /// Lock wrapper mirroring the one already used by [`crate::memory::alloc`]
    /// for the kernel's global heap allocator state.
    pub struct Locked<A> {
        inner: Mutex<Option<A>>,
    }

    impl<A> Locked<A> {
        pub const fn new() -> Self {
            Self { inner: Mutex::new(None) }
        }
    }

    /// Process-global instance of the selected strategy, backed by the real
    /// frame allocator. Constructed lazily on first use, exactly like
    /// [`super::super::bud::BuddyAllocator`] initializes its own first page
    /// lazily.
    static KMA: Locked<Strategy<KernelPageProvider>> = Locked::new();

    /// Allocates `size` bytes from the process-global kernel memory allocator.
    pub fn allocate(size: usize) -> Option<NonNull<u8>> {
        use super::Allocator;
        let mut guard = KMA.inner.lock();
        if guard.is_none() {
            match KernelPageProvider::new() {
                Some(provider) => {
                    *guard = Some(Strategy::new(provider));
                    crate::info!("kernel memory allocator initialized");
                }
                None => {
                    crate::error!("kernel memory allocator: page provider unavailable");
                    return None;
                }
            }
        }
        let result = guard.as_mut().unwrap().allocate(size);
        if result.is_none() {
            crate::warn!("kernel memory allocator: request for {} bytes failed", size);
        }
        result
    }

    /// Releases a payload address previously returned by [`allocate`].
    pub fn release(addr: NonNull<u8>, size: usize) {
        use super::Allocator;
        let mut guard = KMA.inner.lock();
        if let Some(kma) = guard.as_mut() {
            kma.release(addr, size);
        }
    }
}

#[cfg(not(feature = "std"))]
pub use kernel_instance::{allocate, release};
