extern crate alloc;

use alloc::vec::Vec;
use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use core::ptr::NonNull;
use spin::Mutex;
use x86_64::{
    VirtAddr,
    structures::paging::{
        FrameAllocator, FrameDeallocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags,
        PhysFrame, Size4KiB,
    },
};

use super::page_provider::{PAGE_SIZE, PageHandle, PageProvider};

/// Global frame allocator, populated once by [`init_frame_allocator`].
pub static FRAME_ALLOCATOR: Mutex<Option<BootInfoFrameAllocator>> = Mutex::new(None);
/// Global page table mapper, populated once by [`init_frame_allocator`].
pub static PAGE_TABLE: Mutex<Option<OffsetPageTable<'static>>> = Mutex::new(None);

/// A frame allocator that returns frames from the memory regions provided by the bootloader.
pub struct BootInfoFrameAllocator {
    memory_map: &'static MemoryRegions,
    next: usize,
}

impl BootInfoFrameAllocator {
    /// Initializes a new frame allocator with the given memory map.
    /// 
    /// # Safety
    /// 
    /// The caller must ensure that the memory map is valid.
    pub unsafe fn init(memory_map: &'static MemoryRegions) -> Self {
        Self { memory_map, next: 0 }
    }

    /// Returns an iterator over the usable frames specified in the memory map.
    fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> {
        let usable_reigons = self.memory_map.iter().filter(
            |reigon|
            matches!(reigon.kind, MemoryRegionKind::Usable)
        );
    
        usable_reigons
            .map(|reigon| reigon.start..reigon.end)
            .flat_map(|reigon_range| reigon_range.step_by(4096))
            .map(|frame| PhysFrame::containing_address(x86_64::PhysAddr::new(frame)))
    }
}

/// Implement the FrameAllocator from `x86_64`` trait for BootInfoFrameAllocator.
unsafe impl FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }
}

/// Initializes a new OffsetPageTable with the given memory offset.
///
/// # Safety
/// This function is unsafe because the caller must ensure that the memory offset is valid and that the virtual memory is mapped correctly.
pub unsafe fn init(memory_offset: VirtAddr) -> OffsetPageTable<'static> {
    let level_4_table = unsafe { get_level_4_table(memory_offset) };
    unsafe { OffsetPageTable::new(level_4_table, memory_offset) }
}

/// Get a reference to the start of the level 4 page table in virtual memory.
///
/// # Safety
/// This function is unsafe because the caller must make sure there is a valid level 4 page table and the virtual memory is mapped correctly.
/// This function may only be called once to avoid multiple &mut references to the same data.
unsafe fn get_level_4_table(memory_offset: VirtAddr) -> &'static mut PageTable {
    let (level_4_table_frame, _) = x86_64::registers::control::Cr3::read();
    let phys = level_4_table_frame.start_address();
    let virt = (phys.as_u64() + memory_offset.as_u64()) as *mut PageTable;
    unsafe { &mut *virt } // Waow, unsafe code!
}

/// Populates [`FRAME_ALLOCATOR`] and [`PAGE_TABLE`] from bootloader-supplied info.
/// Must be called exactly once during kernel setup, before anything that maps
/// or unmaps pages (the heap, the page allocator, [`KernelPageProvider`]).
///
/// # Safety
/// `memory_regions` and `physical_memory_offset` must be the genuine values
/// handed to the kernel by the bootloader.
pub unsafe fn init_frame_allocator(memory_regions: &'static MemoryRegions, physical_memory_offset: VirtAddr) {
    let frame_allocator = unsafe { BootInfoFrameAllocator::init(memory_regions) };
    let mapper = unsafe { init(physical_memory_offset) };
    *FRAME_ALLOCATOR.lock() = Some(frame_allocator);
    *PAGE_TABLE.lock() = Some(mapper);
}

/// Bump-mapped virtual region backing [`KernelPageProvider`], distinct from
/// the heap (`HEAP_START`) and the virtual-page allocator (`PAGEALLOC_START`)
/// regions in [`super::alloc`].
const KMA_VIRT_START: u64 = 0xFFFF_9800_0000_0000;
const KMA_VIRT_SIZE: u64 = 64 * 1024 * 1024;

/// The page-provider backing the kernel's process-global [`super::kma`]
/// instance: each logical page is [`PAGE_SIZE`] bytes of freshly mapped
/// virtual memory, reusing the same `map_to`/`unmap` + [`FRAME_ALLOCATOR`]/
/// [`PAGE_TABLE`] technique [`super::alloc::PageAllocator`] already uses for
/// its own virtual-page regions.
pub struct KernelPageProvider {
    next: VirtAddr,
    end: VirtAddr,
    next_id: u64,
    freed: Vec<(u64, VirtAddr)>,
}

impl KernelPageProvider {
    /// Constructs a provider over a fresh bump region, or `None` if the
    /// global frame allocator / page table have not been initialized yet.
    pub fn new() -> Option<Self> {
        if FRAME_ALLOCATOR.lock().is_none() || PAGE_TABLE.lock().is_none() {
            return None;
        }
        Some(Self {
            next: VirtAddr::new(KMA_VIRT_START),
            end: VirtAddr::new(KMA_VIRT_START + KMA_VIRT_SIZE),
            next_id: 0,
            freed: Vec::new(),
        })
    }

    fn map_page(&mut self, virt: VirtAddr) -> Option<()> {
        let mut frame_lock = FRAME_ALLOCATOR.lock();
        let frame_alloc = frame_lock.as_mut()?;
        let mut table_lock = PAGE_TABLE.lock();
        let table = table_lock.as_mut()?;
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        for offset in (0..PAGE_SIZE as u64).step_by(4096) {
            let page = Page::<Size4KiB>::containing_address(virt + offset);
            let frame = frame_alloc.allocate_frame()?;
            unsafe {
                table.map_to(page, frame, flags, frame_alloc).ok()?.flush();
            }
        }
        Some(())
    }

    fn unmap_page(&mut self, virt: VirtAddr) {
        let mut frame_lock = FRAME_ALLOCATOR.lock();
        let frame_alloc = frame_lock.as_mut().expect("frame allocator not initialized");
        let mut table_lock = PAGE_TABLE.lock();
        let table = table_lock.as_mut().expect("page table not initialized");
        for offset in (0..PAGE_SIZE as u64).step_by(4096) {
            let page = Page::<Size4KiB>::containing_address(virt + offset);
            if let Ok((frame, flusher)) = table.unmap(page) {
                unsafe { frame_alloc.deallocate_frame(frame) };
                flusher.flush();
            }
        }
    }
}

impl PageProvider for KernelPageProvider {
    fn get_page(&mut self) -> Option<PageHandle> {
        let (id, virt) = match self.freed.pop() {
            Some(reused) => reused,
            None => {
                if self.next >= self.end {
                    return None;
                }
                let virt = self.next;
                self.next += PAGE_SIZE as u64;
                let id = self.next_id;
                self.next_id += 1;
                (id, virt)
            }
        };
        self.map_page(virt)?;
        let base = NonNull::new(virt.as_u64() as *mut u8)?;
        Some(PageHandle { id, base })
    }

    fn free_page(&mut self, handle: PageHandle) {
        let virt = VirtAddr::new(handle.base.as_ptr() as u64);
        self.unmap_page(virt);
        self.freed.push((handle.id, virt));
    }
}