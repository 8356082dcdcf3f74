//! Seam to the filesystem collaborator.
//!
//! The inode cache, the on-disk layout and path walking live outside this
//! core. What the core needs from a file is narrow: its metadata, its
//! logical-to-physical block map and the bytes of a block — enough for exec
//! to validate a binary and for the fault handler to demand-load pages. A
//! shared file reference is an `Arc<dyn FileNode>`; the executable-image
//! share counting the page-sharing scan relies on falls out of pointer
//! identity between those Arcs.

pub mod buffer;

use alloc::sync::Arc;

/// Filesystem block size. A page is four blocks.
pub const BLOCK_SIZE: usize = 1024;

/// Physical block number on a device.
pub type BlockNr = u32;

/// Mode bits, classic Unix encoding.
pub mod mode {
    pub const S_IFMT: u16 = 0o170000;
    pub const S_IFREG: u16 = 0o100000;
    pub const S_ISUID: u16 = 0o4000;
    pub const S_ISGID: u16 = 0o2000;

    pub fn is_regular(mode: u16) -> bool {
        mode & S_IFMT == S_IFREG
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FileMeta {
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: usize,
}

/// One file as the core sees it: metadata plus a block-indexed window onto
/// its contents.
pub trait FileNode: Send + Sync {
    fn meta(&self) -> FileMeta;

    /// Map a logical block index to a physical block. `create` is false for
    /// demand paging — the resolver never allocates there. `None` means a
    /// hole (readers see zeros).
    fn resolve_block(&self, logical: usize, create: bool) -> Option<BlockNr>;

    /// Read one physical block through the buffer cache. Returns false on
    /// I/O failure, in which case `buf` is untouched.
    fn read_block(&self, block: BlockNr, buf: &mut [u8; BLOCK_SIZE]) -> bool;
}

/// Path lookup, the only naming operation the core consumes.
pub trait Filesystem {
    fn lookup(&self, path: &str) -> Option<Arc<dyn FileNode>>;
}

/// In-memory filesystem double used by the unit tests: each file's bytes
/// live in a flat image, logical block `n` resolving to a per-file physical
/// block range.
#[cfg(test)]
pub mod testfs {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::string::String;
    use alloc::string::ToString;
    use alloc::vec::Vec;

    pub struct MemFile {
        meta: FileMeta,
        /// Fake physical block numbers start here; block i of the file is
        /// `base + i`.
        base: BlockNr,
        data: Vec<u8>,
    }

    impl MemFile {
        pub fn new(mode: u16, uid: u16, gid: u16, base: BlockNr, data: Vec<u8>) -> Self {
            MemFile {
                meta: FileMeta {
                    mode,
                    uid,
                    gid,
                    size: data.len(),
                },
                base,
                data,
            }
        }
    }

    impl FileNode for MemFile {
        fn meta(&self) -> FileMeta {
            self.meta
        }

        fn resolve_block(&self, logical: usize, _create: bool) -> Option<BlockNr> {
            if logical * BLOCK_SIZE >= self.data.len() {
                return None;
            }
            Some(self.base + logical as BlockNr)
        }

        fn read_block(&self, block: BlockNr, buf: &mut [u8; BLOCK_SIZE]) -> bool {
            let logical = (block - self.base) as usize;
            let start = logical * BLOCK_SIZE;
            if start >= self.data.len() {
                return false;
            }
            let end = core::cmp::min(start + BLOCK_SIZE, self.data.len());
            buf.fill(0);
            buf[..end - start].copy_from_slice(&self.data[start..end]);
            true
        }
    }

    #[derive(Default)]
    pub struct MemFs {
        files: BTreeMap<String, Arc<dyn FileNode>>,
    }

    impl MemFs {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&mut self, path: &str, file: MemFile) {
            self.files.insert(path.to_string(), Arc::new(file));
        }
    }

    impl Filesystem for MemFs {
        fn lookup(&self, path: &str) -> Option<Arc<dyn FileNode>> {
            self.files.get(path).cloned()
        }
    }
}
