//! Memory management: the frame pool, page tables, the fault handler and
//! kernel access to user pages.

pub mod fault;
pub mod frame_allocator;
pub mod paging;
pub mod uaccess;

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;

use frame_allocator::FramePool;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Default frame pool size: 15 MiB of pages.
pub const PAGING_PAGES: usize = (15 * 1024 * 1024) / PAGE_SIZE;

/// The frame pool (or a process slot, or a pid) ran dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "out of memory")
    }
}

lazy_static! {
    pub static ref FRAME_POOL: Mutex<FramePool> = Mutex::new(FramePool::new(PAGING_PAGES));
}

/// Size the frame pool from the multiboot memory map.
///
/// The bootloader hands over the map; the largest usable area decides how
/// many frames the pool manages, capped at [`PAGING_PAGES`].
#[cfg(not(test))]
pub fn init(multiboot_info_addr: usize) {
    let boot_info = unsafe {
        multiboot2::BootInformation::load(multiboot_info_addr as *const _)
            .expect("failed to load the multiboot2 info")
    };
    let memory_map = boot_info.memory_map_tag().expect("memory map tag required");

    let mut largest = 0usize;
    for area in memory_map.memory_areas() {
        let size = (area.end_address() - area.start_address()) as usize;
        if size > largest {
            largest = size;
        }
    }

    let frames = core::cmp::min(largest / PAGE_SIZE, PAGING_PAGES);
    *FRAME_POOL.lock() = FramePool::new(frames);
    crate::log_info!("Frame pool initialized with {} frames.", frames);
}

/// Page fault entry, called from the trap stub with the faulting linear
/// address and the decoded fault kind.
///
/// Frame exhaustion while resolving a fault is fatal to the faulting
/// process: it is terminated with a segmentation-violation status.
pub fn handle_page_fault(addr: usize, kind: fault::FaultKind) {
    let mut table = crate::process::PROCESS_TABLE.lock();
    let mut pool = FRAME_POOL.lock();

    let resolved = match kind {
        fault::FaultKind::NotPresent => fault::resolve_missing_page(&mut table, &mut pool, addr),
        fault::FaultKind::Protection => {
            let process = table.current_mut();
            fault::resolve_write_fault(&mut process.space, &mut pool, addr)
        }
    };

    if resolved.is_err() {
        crate::log_error!(
            "out of memory resolving a fault at {:#x}, killing pid {}",
            addr,
            table.current().pid.0
        );
        table.do_exit(&mut pool, crate::process::signal::SIGSEGV);
    }
}
