//! Page fault resolution: copy-on-write, executable page sharing and demand
//! loading.
//!
//! A write to a read-only page duplicates the frame only when somebody else
//! still shares it; the last holder just gets the writable bit back. A fault
//! on a missing page either takes a zero page (heap, stack, anything past
//! the executable-backed region), adopts another process's clean page of the
//! same program image, or reads the four blocks covering the page out of the
//! executable.

use alloc::sync::Arc;

use crate::fs::{FileNode, BLOCK_SIZE};
use crate::memory::frame_allocator::FramePool;
use crate::memory::paging::{
    entry_flags, entry_frame, invalidate, make_entry, AddressSpace, EntryFlags,
};
use crate::memory::{OutOfMemory, PAGE_SIZE};
use crate::process::ProcessTable;

/// What the hardware reported about the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The page is not mapped at all.
    NotPresent,
    /// The page is mapped read-only and was written.
    Protection,
}

/// Resolve a write to a read-only page at linear `addr`.
///
/// Exclusively owned frames are flipped writable in place; shared frames are
/// duplicated, the old frame dropping one reference.
pub fn resolve_write_fault(
    space: &mut AddressSpace,
    pool: &mut FramePool,
    addr: usize,
) -> Result<(), OutOfMemory> {
    let entry = space.entry(pool, addr);
    let flags = entry_flags(entry);
    if !flags.contains(EntryFlags::PRESENT) {
        panic!("write fault on an unmapped page at {:#x}", addr);
    }
    let old = entry_frame(entry);

    if pool.refcount(old) == 1 {
        space.set_entry(
            pool,
            addr,
            entry | (EntryFlags::WRITABLE | EntryFlags::DIRTY).bits(),
        );
        invalidate();
        return Ok(());
    }

    let fresh = pool.allocate().ok_or(OutOfMemory)?;
    pool.copy_frame(old, fresh);
    pool.release(old);
    space.set_entry(
        pool,
        addr,
        make_entry(fresh, flags | EntryFlags::WRITABLE | EntryFlags::DIRTY),
    );
    invalidate();
    Ok(())
}

/// Map a zero-filled writable page at linear `addr`.
pub fn get_empty_page(
    space: &mut AddressSpace,
    pool: &mut FramePool,
    addr: usize,
) -> Result<(), OutOfMemory> {
    let frame = pool.allocate().ok_or(OutOfMemory)?;
    if space
        .map(pool, addr, frame, EntryFlags::WRITABLE | EntryFlags::USER)
        .is_err()
    {
        pool.release(frame);
        return Err(OutOfMemory);
    }
    Ok(())
}

/// Resolve a fault on a missing page at linear `addr` for the current
/// process.
pub fn resolve_missing_page(
    table: &mut ProcessTable,
    pool: &mut FramePool,
    addr: usize,
) -> Result<(), OutOfMemory> {
    let addr = addr & !(PAGE_SIZE - 1);
    let (offset, end_data, executable) = {
        let process = table.current();
        (
            addr.wrapping_sub(process.start_code),
            process.end_data,
            process.executable.clone(),
        )
    };

    // Nothing backs this page: the heap/stack growth area gets zeros.
    let node = match executable {
        Some(node) if offset < end_data => node,
        _ => {
            let process = table.current_mut();
            return get_empty_page(&mut process.space, pool, addr);
        }
    };

    // Another process running the same image may already hold a clean copy.
    if share_page(table, pool, offset) {
        return Ok(());
    }

    let frame = pool.allocate().ok_or(OutOfMemory)?;
    read_exec_page(pool, frame, &node, offset, end_data);

    let process = table.current_mut();
    if process
        .space
        .map(pool, addr, frame, EntryFlags::USER)
        .is_err()
    {
        pool.release(frame);
        return Err(OutOfMemory);
    }
    Ok(())
}

/// Fill `frame` with the executable bytes backing window offset `offset`,
/// zero past the end of the image. One block is reserved for the header, so
/// file offset F lives in logical block `1 + F / BLOCK_SIZE`.
fn read_exec_page(
    pool: &mut FramePool,
    frame: crate::memory::frame_allocator::FrameId,
    node: &Arc<dyn FileNode>,
    offset: usize,
    end_data: usize,
) {
    let first_block = 1 + offset / BLOCK_SIZE;
    for i in 0..PAGE_SIZE / BLOCK_SIZE {
        if let Some(block) = node.resolve_block(first_block + i, false) {
            let mut data = [0u8; BLOCK_SIZE];
            if node.read_block(block, &mut data) {
                pool.frame_bytes_mut(frame)[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE]
                    .copy_from_slice(&data);
            }
        }
    }
    if offset + PAGE_SIZE > end_data {
        let keep = end_data.saturating_sub(offset);
        pool.frame_bytes_mut(frame)[keep..].fill(0);
    }
}

/// Look for another process running the same executable that holds a clean
/// copy of the page at image offset `offset`, and adopt it read-only.
///
/// First match in table order wins; any deterministic pick is as good as
/// another.
fn share_page(table: &mut ProcessTable, pool: &mut FramePool, offset: usize) -> bool {
    let current = table.current_index();
    let executable = match table.current().executable.clone() {
        Some(node) => node,
        None => return false,
    };

    for slot in 0..crate::process::NR_TASKS {
        if slot == current {
            continue;
        }
        let same_image = table
            .process(slot)
            .and_then(|p| p.executable.as_ref())
            .map_or(false, |other| Arc::ptr_eq(other, &executable));
        if !same_image {
            continue;
        }
        let (this, other) = table.pair_mut(current, slot);
        if try_to_share(pool, this, other, offset) {
            return true;
        }
    }
    false
}

/// Share `other`'s page at image offset `offset` into `this`, if `other`
/// holds it present and clean. Both mappings end up read-only.
fn try_to_share(
    pool: &mut FramePool,
    this: &mut crate::process::Process,
    other: &mut crate::process::Process,
    offset: usize,
) -> bool {
    let from_addr = other.start_code + offset;
    let to_addr = this.start_code + offset;

    let from = other.space.entry(pool, from_addr);
    let flags = entry_flags(from);
    // Only a present page nobody has written is safe to hand out: a
    // writer's copy-on-write page must never reach a second process.
    if !flags.contains(EntryFlags::PRESENT)
        || flags.intersects(EntryFlags::WRITABLE | EntryFlags::DIRTY)
    {
        return false;
    }

    if entry_flags(this.space.entry(pool, to_addr)).contains(EntryFlags::PRESENT) {
        panic!("try_to_share: page already present at {:#x}", to_addr);
    }

    let frame = entry_frame(from);
    if this
        .space
        .map(pool, to_addr, frame, EntryFlags::USER)
        .is_err()
    {
        // No table frame left; fall back to the demand-load path, which
        // will surface the exhaustion properly.
        return false;
    }
    other.space.set_entry(pool, from_addr, from & !EntryFlags::WRITABLE.bits());
    pool.share(frame);
    invalidate();
    true
}
