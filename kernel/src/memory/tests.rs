use alloc::{boxed::Box, vec::Vec};

use super::kma;

#[test_case]
fn test_simple_alloc() {
    let _x = Box::new(42);
}

#[test_case]
fn test_kma_allocate_and_release_round_trip() {
    let addr = kma::allocate(128).expect("kernel memory allocator should satisfy a 128-byte request");
    unsafe {
        addr.as_ptr().write_bytes(0xAB, 128);
    }
    kma::release(addr, 128);
}

#[test_case]
fn test_lots_of_pointers() {
    for i in 0..1000000 {
        let _x = Box::new(i);
    }
}

#[test_case]
fn test_big_heap_type() {
    let _x = Box::new([0u8; 1000000]);
}

#[test_case]
fn test_growing_vec() {
    let mut v = Vec::new();
    for i in 0..1000000 {
        v.push(i);
    }
}


