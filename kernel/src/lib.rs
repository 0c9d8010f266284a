#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(all(not(feature = "std"), test), no_main)]
#![cfg_attr(not(feature = "std"), feature(custom_test_frameworks))]
#![cfg_attr(not(feature = "std"), test_runner(crate::testing::test_runner))]
#![cfg_attr(not(feature = "std"), reexport_test_harness_main = "test_main")]
#![cfg_attr(test, allow(dead_code))]

//! locOS kernel library.
//!
//! Split out of the `kernel` binary so that the memory subsystem — in
//! particular the page-granularity allocator in [`memory::kma`] — can be
//! exercised two ways: `#[test_case]`-driven QEMU integration tests built
//! straight from this lib crate (mirroring `kernel`'s own boot sequence, see
//! `test_kernel_main` below), and host-side `#[cfg(test)]` unit tests under
//! the `std` feature for fast iteration off real hardware.

extern crate alloc;

#[macro_use]
pub mod serial;
#[macro_use]
pub mod output;

pub mod memory;
pub mod testing;

/// Boot entry point used only when this crate is itself compiled as the
/// `#[test_case]` QEMU test binary (`cargo test --lib`, no `std` feature).
/// The real kernel binary has its own entry point in `main.rs`; this one
/// exists solely so `reexport_test_harness_main`'s `test_main` has somewhere
/// to be called from when there is no separate `main.rs` linked in.
#[cfg(all(test, not(feature = "std")))]
mod test_harness {
    use bootloader_api::{BootInfo, entry_point};

    entry_point!(test_kernel_main);

    fn test_kernel_main(_boot_info: &'static mut BootInfo) -> ! {
        super::test_main();
        loop {
            x86_64::instructions::hlt();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        crate::serial_println!("PANIC: {}", info);
        crate::testing::exit_qemu(crate::testing::QemuExitCode::Failed);
        loop {
            x86_64::instructions::hlt();
        }
    }
}
