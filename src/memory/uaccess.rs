//! Kernel access to user memory.
//!
//! User code sees window-relative addresses; the kernel reaches the same
//! bytes by walking the process's tables. Before storing through a user
//! range (signal frames, the exec argument vectors) the range is pre-faulted
//! writable with [`verify_area`], which takes the same paths a user write
//! fault would: copy-on-write for shared pages, a zero page for holes.

use crate::memory::fault;
use crate::memory::frame_allocator::FramePool;
use crate::memory::paging::{entry_flags, AddressSpace, EntryFlags};
use crate::memory::{OutOfMemory, PAGE_SIZE};

/// Make `[addr, addr + size)` of the user window present and writable.
pub fn verify_area(
    space: &mut AddressSpace,
    pool: &mut FramePool,
    addr: usize,
    size: usize,
) -> Result<(), OutOfMemory> {
    let mut page = addr & !(PAGE_SIZE - 1);
    while page < addr + size {
        let linear = space.base() + page;
        let flags = entry_flags(space.entry(pool, linear));
        if !flags.contains(EntryFlags::PRESENT) {
            fault::get_empty_page(space, pool, linear)?;
        } else if !flags.contains(EntryFlags::WRITABLE) {
            fault::resolve_write_fault(space, pool, linear)?;
        }
        page += PAGE_SIZE;
    }
    Ok(())
}

/// Store `bytes` at user address `addr`. Every touched page must already be
/// present (run [`verify_area`] first); a hole here is a kernel bug.
pub fn put_bytes(space: &AddressSpace, pool: &mut FramePool, addr: usize, bytes: &[u8]) {
    let mut addr = addr;
    let mut rest = bytes;
    while !rest.is_empty() {
        let (frame, offset) = space
            .translate(pool, space.base() + addr)
            .unwrap_or_else(|| panic!("uaccess: store through a hole at {:#x}", addr));
        let chunk = core::cmp::min(PAGE_SIZE - offset, rest.len());
        pool.frame_bytes_mut(frame)[offset..offset + chunk].copy_from_slice(&rest[..chunk]);
        addr += chunk;
        rest = &rest[chunk..];
    }
}

/// Fetch `out.len()` bytes from user address `addr`.
pub fn get_bytes(space: &AddressSpace, pool: &FramePool, addr: usize, out: &mut [u8]) {
    let total = out.len();
    let mut done = 0;
    while done < total {
        let (frame, offset) = space
            .translate(pool, space.base() + addr + done)
            .unwrap_or_else(|| panic!("uaccess: load through a hole at {:#x}", addr + done));
        let chunk = core::cmp::min(PAGE_SIZE - offset, total - done);
        out[done..done + chunk].copy_from_slice(&pool.frame_bytes(frame)[offset..offset + chunk]);
        done += chunk;
    }
}

/// Store one little-endian 32-bit word at user address `addr`.
pub fn put_u32(space: &AddressSpace, pool: &mut FramePool, addr: usize, value: u32) {
    put_bytes(space, pool, addr, &value.to_le_bytes());
}

/// Fetch one little-endian 32-bit word from user address `addr`.
pub fn get_u32(space: &AddressSpace, pool: &FramePool, addr: usize) -> u32 {
    let mut bytes = [0u8; 4];
    get_bytes(space, pool, addr, &mut bytes);
    u32::from_le_bytes(bytes)
}

/// Fetch one byte from user address `addr`.
pub fn get_u8(space: &AddressSpace, pool: &FramePool, addr: usize) -> u8 {
    let mut byte = [0u8; 1];
    get_bytes(space, pool, addr, &mut byte);
    byte[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::WINDOW_SPAN;

    #[test]
    fn verify_area_faults_holes_in_writable() {
        let mut pool = FramePool::new(16);
        let mut space = AddressSpace::new(WINDOW_SPAN, WINDOW_SPAN);

        verify_area(&mut space, &mut pool, 0x1ffc, 8).unwrap();

        // Both touched pages are now present and writable.
        for addr in [0x1000, 0x2000] {
            let flags = entry_flags(space.entry(&pool, WINDOW_SPAN + addr));
            assert!(flags.contains(EntryFlags::PRESENT | EntryFlags::WRITABLE));
        }
    }

    #[test]
    fn stores_and_loads_cross_page_boundaries() {
        let mut pool = FramePool::new(16);
        let mut space = AddressSpace::new(WINDOW_SPAN, WINDOW_SPAN);
        verify_area(&mut space, &mut pool, 0x0, 2 * PAGE_SIZE).unwrap();

        let msg = b"straddles the page boundary";
        let addr = PAGE_SIZE - 10;
        put_bytes(&space, &mut pool, addr, msg);

        let mut back = [0u8; 27];
        get_bytes(&space, &pool, addr, &mut back);
        assert_eq!(&back, msg);

        put_u32(&space, &mut pool, 0x40, 0xDEAD_BEEF);
        assert_eq!(get_u32(&space, &pool, 0x40), 0xDEAD_BEEF);
    }
}
