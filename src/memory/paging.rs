//! Two-level page tables.
//!
//! Every process owns an [`AddressSpace`]: a 1024-entry directory whose
//! present entries point at page tables, each table a pool frame holding
//! 1024 little-endian 32-bit leaf entries. A leaf maps one 4 KiB page of the
//! process's linear window onto a pool frame. Windows are disjoint by
//! construction (slot index times [`crate::process::WINDOW_SPAN`]), so bulk
//! copy and bulk unmap work on directory-entry granularity.
//!
//! `copy_range` is the fork mechanism: it duplicates the table structure,
//! write-protects every copied leaf in both spaces and raises the frame
//! share counts; private copies are made later, one write fault at a time.

use alloc::boxed::Box;
use bit_field::BitField;
use bitflags::bitflags;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::memory::frame_allocator::{FrameId, FramePool};
use crate::memory::{OutOfMemory, PAGE_SIZE};

/// Entries per directory / per table.
pub const DIR_ENTRIES: usize = 1024;
pub const TABLE_ENTRIES: usize = 1024;

/// Linear span covered by one directory entry (4 MiB).
pub const TABLE_SPAN: usize = TABLE_ENTRIES * PAGE_SIZE;

/// When duplicating from the kernel's low window only this many leaf
/// entries are copied — the kernel image is shared, not cloned.
pub const KERNEL_INIT_ENTRIES: usize = 160;

bitflags! {
    /// Leaf / directory entry flag bits (low 12 bits of an entry).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        const DIRTY    = 1 << 6;
    }
}

/// Pack a frame index and flag bits into a 32-bit entry.
pub fn make_entry(frame: FrameId, flags: EntryFlags) -> u32 {
    ((frame.0 as u32) << 12) | (flags | EntryFlags::PRESENT).bits()
}

/// Frame index held in an entry (bits 12..32).
pub fn entry_frame(entry: u32) -> FrameId {
    FrameId(entry.get_bits(12..32) as usize)
}

pub fn entry_flags(entry: u32) -> EntryFlags {
    EntryFlags::from_bits_truncate(entry)
}

fn table_entry(pool: &FramePool, table: FrameId, index: usize) -> u32 {
    let bytes = pool.frame_bytes(table);
    u32::from_le_bytes(bytes[index * 4..index * 4 + 4].try_into().unwrap())
}

fn set_table_entry(pool: &mut FramePool, table: FrameId, index: usize, value: u32) {
    let bytes = pool.frame_bytes_mut(table);
    bytes[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
}

static TLB_FLUSHES: AtomicUsize = AtomicUsize::new(0);

/// Flush cached translations after a bulk table edit.
///
/// Required after any structural change; a single brand-new leaf mapping
/// needs no flush because nothing stale can be cached for it.
pub fn invalidate() {
    TLB_FLUSHES.fetch_add(1, Ordering::Relaxed);
    #[cfg(not(test))]
    x86_64::instructions::tlb::flush_all();
}

/// Number of translation-cache flushes so far (observable in tests).
pub fn invalidation_count() -> usize {
    TLB_FLUSHES.load(Ordering::Relaxed)
}

pub struct AddressSpace {
    /// First linear address of this process's window.
    base: usize,
    /// Window length in bytes; user addresses run 0..limit.
    limit: usize,
    directory: Box<[u32; DIR_ENTRIES]>,
}

impl AddressSpace {
    pub fn new(base: usize, limit: usize) -> Self {
        AddressSpace {
            base,
            limit,
            directory: Box::new([0u32; DIR_ENTRIES]),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Grow the window limit (exec installs the full data limit).
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    fn dir_index(addr: usize) -> usize {
        (addr / TABLE_SPAN) % DIR_ENTRIES
    }

    fn table_index(addr: usize) -> usize {
        (addr / PAGE_SIZE) % TABLE_ENTRIES
    }

    /// Install or update the leaf mapping for the page containing `addr`,
    /// allocating the intermediate table on demand.
    ///
    /// The frame's share count is not touched: the caller transfers (or has
    /// already added) the reference the new mapping holds.
    pub fn map(
        &mut self,
        pool: &mut FramePool,
        addr: usize,
        frame: FrameId,
        flags: EntryFlags,
    ) -> Result<(), OutOfMemory> {
        let di = Self::dir_index(addr);
        let dir = self.directory[di];
        let table = if entry_flags(dir).contains(EntryFlags::PRESENT) {
            entry_frame(dir)
        } else {
            let table = pool.allocate().ok_or(OutOfMemory)?;
            self.directory[di] = make_entry(
                table,
                EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
            );
            table
        };
        set_table_entry(pool, table, Self::table_index(addr), make_entry(frame, flags));
        Ok(())
    }

    /// Raw leaf entry for the page containing `addr`; 0 when the directory
    /// entry or the leaf is absent.
    pub fn entry(&self, pool: &FramePool, addr: usize) -> u32 {
        let dir = self.directory[Self::dir_index(addr)];
        if !entry_flags(dir).contains(EntryFlags::PRESENT) {
            return 0;
        }
        table_entry(pool, entry_frame(dir), Self::table_index(addr))
    }

    /// Overwrite the leaf entry for `addr`. The table must exist.
    pub fn set_entry(&mut self, pool: &mut FramePool, addr: usize, value: u32) {
        let dir = self.directory[Self::dir_index(addr)];
        if !entry_flags(dir).contains(EntryFlags::PRESENT) {
            panic!("set_entry on a hole at {:#x}", addr);
        }
        set_table_entry(pool, entry_frame(dir), Self::table_index(addr), value);
    }

    /// Resolve `addr` to its backing frame and the offset within it.
    pub fn translate(&self, pool: &FramePool, addr: usize) -> Option<(FrameId, usize)> {
        let entry = self.entry(pool, addr);
        if !entry_flags(entry).contains(EntryFlags::PRESENT) {
            return None;
        }
        Some((entry_frame(entry), addr % PAGE_SIZE))
    }

    /// Release every present leaf in `[base, base+size)`, the frames they
    /// reference and the now-empty tables.
    ///
    /// `base` must sit on a directory-entry boundary — anything else is a
    /// programming error in the caller, not a user mistake. Unmapping the
    /// kernel's low window is likewise fatal.
    pub fn unmap_range(&mut self, pool: &mut FramePool, base: usize, size: usize) {
        if base % TABLE_SPAN != 0 {
            panic!("unmap_range called with unaligned base {:#x}", base);
        }
        if base == 0 {
            panic!("trying to unmap the kernel low window");
        }
        let count = (size + TABLE_SPAN - 1) / TABLE_SPAN;
        for n in 0..count {
            let di = Self::dir_index(base) + n;
            let dir = self.directory[di];
            if !entry_flags(dir).contains(EntryFlags::PRESENT) {
                continue;
            }
            let table = entry_frame(dir);
            for ti in 0..TABLE_ENTRIES {
                let leaf = table_entry(pool, table, ti);
                if entry_flags(leaf).contains(EntryFlags::PRESENT) {
                    pool.release(entry_frame(leaf));
                }
            }
            pool.release(table);
            self.directory[di] = 0;
        }
        invalidate();
    }
}

/// Duplicate `size` bytes of `src`'s window into the previously-empty same
/// range of `dst`, sharing frames copy-on-write.
///
/// Every copied leaf ends up read-only in both spaces with its frame's share
/// count raised by one. When the source is the kernel's low window only the
/// first [`KERNEL_INIT_ENTRIES`] leaves are duplicated (the kernel image is
/// shared rather than cloned). On table-allocation failure the partially
/// built destination is fully unmapped before the error returns, so no frame
/// leaks.
pub fn copy_range(
    pool: &mut FramePool,
    src: &mut AddressSpace,
    dst: &mut AddressSpace,
    size: usize,
) -> Result<(), OutOfMemory> {
    if src.base % TABLE_SPAN != 0 || dst.base % TABLE_SPAN != 0 {
        panic!("copy_range called with wrong alignment");
    }
    let count = (size + TABLE_SPAN - 1) / TABLE_SPAN;
    for n in 0..count {
        let sdi = AddressSpace::dir_index(src.base) + n;
        let ddi = AddressSpace::dir_index(dst.base) + n;
        if entry_flags(dst.directory[ddi]).contains(EntryFlags::PRESENT) {
            panic!("copy_range: destination already mapped");
        }
        if !entry_flags(src.directory[sdi]).contains(EntryFlags::PRESENT) {
            continue;
        }
        let from_table = entry_frame(src.directory[sdi]);
        let to_table = match pool.allocate() {
            Some(frame) => frame,
            None => {
                dst.unmap_range(pool, dst.base, n * TABLE_SPAN);
                return Err(OutOfMemory);
            }
        };
        dst.directory[ddi] = make_entry(
            to_table,
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
        );
        let leaves = if src.base == 0 {
            KERNEL_INIT_ENTRIES
        } else {
            TABLE_ENTRIES
        };
        for ti in 0..leaves {
            let mut leaf = table_entry(pool, from_table, ti);
            if !entry_flags(leaf).contains(EntryFlags::PRESENT) {
                continue;
            }
            leaf &= !EntryFlags::WRITABLE.bits();
            set_table_entry(pool, to_table, ti, leaf);
            set_table_entry(pool, from_table, ti, leaf);
            pool.share(entry_frame(leaf));
        }
    }
    invalidate();
    Ok(())
}
