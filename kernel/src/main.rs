/*
Copyright © 2024 Mako and JayAndJef

This file is part of locOS.

locOS is free software: you can redistribute it and/or modify it under the terms of the GNU General
Public License as published by the Free Software Foundation, either version 3 of the License, or (at
your option) any later version.

locOS is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the
implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public
License for more details.

You should have received a copy of the GNU General Public License along with locOS. If not, see
<https://www.gnu.org/licenses/>.
*/

#![no_std]
#![no_main]
#![cfg_attr(test, allow(dead_code, unused_imports))]

extern crate alloc;

use core::panic::PanicInfo;

use bootloader_api::{BootInfo, entry_point};
use kernel::{error, info, memory, serial_println};
use x86_64::VirtAddr;

fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
    info!("locOS booting");

    let physical_memory_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("bootloader did not provide a physical memory offset mapping");
    let memory_regions = &boot_info.memory_regions;

    unsafe {
        memory::paging::init_frame_allocator(memory_regions, VirtAddr::new(physical_memory_offset));
    }

    unsafe {
        memory::init_heap().expect("heap initialization failed");
    }

    demo_kernel_memory_allocator();

    info!("locOS idle");
    loop {
        x86_64::instructions::hlt();
    }
}

/// Exercises the page-granularity allocator once during boot, so a serial
/// log confirms the linked-in strategy (`kma-bud` or `kma-rm`) is wired up
/// end to end before the kernel goes idle.
fn demo_kernel_memory_allocator() {
    match memory::allocate(256) {
        Some(addr) => {
            info!("kernel memory allocator: demo allocation at {:p}", addr.as_ptr());
            memory::release(addr, 256);
        }
        None => error!("kernel memory allocator: demo allocation failed"),
    }
}

entry_point!(kernel_main);

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    serial_println!("PANIC: {}", info);
    loop {
        x86_64::instructions::hlt();
    }
}
