//! exec: replace the calling process's image with a new program.
//!
//! The order of operations is load-bearing. Arguments and environment are
//! staged into a bounded scratch area and the binary header is validated in
//! full while the old image is still intact; only then comes the point of no
//! return, after which the old address space is gone and the staged pages
//! are rewired to the top of the new one. A failure before the commit leaves
//! the caller exactly as it was.
//!
//! `#!` scripts re-target the exec at their interpreter, splicing argv as
//! `[interpreter-name, directive-arg?, script-path, original-argv[1..]]`.

use alloc::string::String;
use alloc::sync::Arc;
use bit_field::BitField;
use core::fmt;

use crate::fs::{mode, FileNode, Filesystem, BLOCK_SIZE};
use crate::memory::frame_allocator::{FrameId, FramePool};
use crate::memory::paging::EntryFlags;
use crate::memory::uaccess;
use crate::memory::PAGE_SIZE;
use crate::process::{ProcessTable, SigAction, NR_OPEN, NSIG, WINDOW_SPAN};

/// Pages of argument/environment scratch: 128 KiB of argv+envp budget.
pub const MAX_ARG_PAGES: usize = 32;
const STAGE_SIZE: usize = MAX_ARG_PAGES * PAGE_SIZE;

/// Recognized executable magic.
pub const AOUT_MAGIC: u32 = 0x010B;

/// The header occupies the image's first block; text starts at block 1.
pub const TEXT_OFFSET: usize = BLOCK_SIZE;

/// Ceiling on text+data+bss, leaving window room for stack and arguments.
const MAX_IMAGE: u32 = 0x300_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    FileNotFound,
    AccessDenied,
    /// Unrecognized or inconsistent binary header, or a malformed `#!` line.
    BadFormat,
    /// argv+envp exceed the staging budget.
    ArgListTooLong,
    OutOfMemory,
    IoError,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::FileNotFound => write!(f, "no such file"),
            ExecError::AccessDenied => write!(f, "permission denied"),
            ExecError::BadFormat => write!(f, "exec format error"),
            ExecError::ArgListTooLong => write!(f, "argument list too long"),
            ExecError::OutOfMemory => write!(f, "out of memory"),
            ExecError::IoError => write!(f, "I/O error"),
        }
    }
}

pub type ExecResult<T> = Result<T, ExecError>;

/// a.out-style header: eight little-endian 32-bit words at the top of the
/// image's first block.
#[derive(Debug, Clone, Copy)]
pub struct BinHeader {
    pub magic: u32,
    pub text: u32,
    pub data: u32,
    pub bss: u32,
    pub syms: u32,
    pub entry: u32,
    pub trsize: u32,
    pub drsize: u32,
}

impl BinHeader {
    fn parse(block: &[u8]) -> ExecResult<Self> {
        if block.len() < 32 {
            return Err(ExecError::BadFormat);
        }
        let word = |i: usize| u32::from_le_bytes(block[i * 4..i * 4 + 4].try_into().unwrap());
        let header = BinHeader {
            magic: word(0),
            text: word(1),
            data: word(2),
            bss: word(3),
            syms: word(4),
            entry: word(5),
            trsize: word(6),
            drsize: word(7),
        };
        if header.magic != AOUT_MAGIC {
            return Err(ExecError::BadFormat);
        }
        Ok(header)
    }

    /// Full structural validation — a hard precondition of the commit.
    fn validate(&self, file_size: usize) -> ExecResult<()> {
        if self.trsize != 0 || self.drsize != 0 {
            return Err(ExecError::BadFormat); // relocations unsupported
        }
        let image = self.text as u64 + self.data as u64 + self.bss as u64;
        if image > MAX_IMAGE as u64 {
            return Err(ExecError::BadFormat);
        }
        let need = TEXT_OFFSET as u64 + self.text as u64 + self.data as u64 + self.syms as u64;
        if (file_size as u64) < need {
            return Err(ExecError::BadFormat);
        }
        Ok(())
    }
}

/// The bounded scratch area argv/envp are staged into, filled top-down.
struct ArgStage {
    pages: [Option<FrameId>; MAX_ARG_PAGES],
    /// Offset of the lowest staged byte within the area.
    p: usize,
}

impl ArgStage {
    fn new() -> Self {
        ArgStage {
            pages: [None; MAX_ARG_PAGES],
            p: STAGE_SIZE - 4,
        }
    }

    /// Stage the strings back-to-front, each NUL-terminated, allocating
    /// scratch pages as the cursor crosses into them.
    fn copy_strings(&mut self, pool: &mut FramePool, strings: &[&str]) -> ExecResult<()> {
        for s in strings.iter().rev() {
            let bytes = s.as_bytes();
            for i in (0..=bytes.len()).rev() {
                if self.p == 0 {
                    return Err(ExecError::ArgListTooLong);
                }
                self.p -= 1;
                let page = self.p / PAGE_SIZE;
                let offset = self.p % PAGE_SIZE;
                let frame = match self.pages[page] {
                    Some(frame) => frame,
                    None => {
                        let frame = pool.allocate().ok_or(ExecError::OutOfMemory)?;
                        self.pages[page] = Some(frame);
                        frame
                    }
                };
                pool.frame_bytes_mut(frame)[offset] =
                    if i == bytes.len() { 0 } else { bytes[i] };
            }
        }
        Ok(())
    }

    /// Give the scratch pages back (error paths before the commit).
    fn release(&mut self, pool: &mut FramePool) {
        for slot in self.pages.iter_mut() {
            if let Some(frame) = slot.take() {
                pool.release(frame);
            }
        }
    }
}

/// A parsed `#!` directive.
struct Interpreter {
    path: String,
    name: String,
    arg: Option<String>,
}

/// Parse the first line of a `#!` file: trimmed, split on the first
/// whitespace run, bounded by the block that holds it.
fn parse_interp(block: &[u8]) -> ExecResult<Interpreter> {
    let line = &block[2..];
    let end = line.iter().position(|&b| b == b'\n').unwrap_or(line.len() - 1);
    let line = &line[..end];

    let start = line
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .ok_or(ExecError::BadFormat)?;
    let line = &line[start..];

    let token_end = line
        .iter()
        .position(|&b| b == b' ' || b == b'\t')
        .unwrap_or(line.len());
    let token = &line[..token_end];
    if token.is_empty() {
        return Err(ExecError::BadFormat); // no interpreter name
    }

    let rest = &line[token_end..];
    let arg_start = rest.iter().position(|&b| b != b' ' && b != b'\t');
    let arg = arg_start.map(|i| String::from_utf8_lossy(&rest[i..]).into_owned());

    let path = String::from_utf8_lossy(token).into_owned();
    let name = path.rsplit('/').next().unwrap_or(&path).into();
    Ok(Interpreter { path, name, arg })
}

/// Read a file's first block.
fn read_first_block(node: &Arc<dyn FileNode>) -> ExecResult<[u8; BLOCK_SIZE]> {
    let block = node.resolve_block(0, false).ok_or(ExecError::BadFormat)?;
    let mut data = [0u8; BLOCK_SIZE];
    if !node.read_block(block, &mut data) {
        return Err(ExecError::IoError);
    }
    Ok(data)
}

impl ProcessTable {
    /// Execute the program at `path` in place of the current process.
    ///
    /// On success the caller's saved context points at the new program's
    /// entry with the argument vectors laid out on its stack; on error the
    /// original image, descriptors and handlers are untouched.
    pub fn execve(
        &mut self,
        pool: &mut FramePool,
        fs: &dyn Filesystem,
        path: &str,
        argv: &[&str],
        envp: &[&str],
    ) -> ExecResult<()> {
        let mut stage = ArgStage::new();
        match self.prepare(pool, fs, path, argv, envp, &mut stage) {
            Ok(prepared) => self.commit(pool, prepared, stage),
            Err(err) => {
                stage.release(pool);
                Err(err)
            }
        }
    }

    /// Everything that can fail: lookup, permission, `#!` resolution,
    /// header validation and argument staging. The caller's image is not
    /// touched here.
    fn prepare(
        &mut self,
        pool: &mut FramePool,
        fs: &dyn Filesystem,
        path: &str,
        argv: &[&str],
        envp: &[&str],
        stage: &mut ArgStage,
    ) -> ExecResult<Prepared> {
        let mut node = fs.lookup(path).ok_or(ExecError::FileNotFound)?;
        let mut argc = argv.len();
        let envc = envp.len();
        let mut sh_bang = false;

        loop {
            let meta = node.meta();
            if !mode::is_regular(meta.mode) {
                return Err(ExecError::AccessDenied);
            }
            let (e_uid, e_gid) = {
                let current = self.current();
                let e_uid = if meta.mode & mode::S_ISUID != 0 {
                    meta.uid
                } else {
                    current.euid
                };
                let e_gid = if meta.mode & mode::S_ISGID != 0 {
                    meta.gid
                } else {
                    current.egid
                };
                let mut perms = meta.mode;
                if current.euid == meta.uid {
                    perms >>= 6;
                } else if current.egid == meta.gid {
                    perms >>= 3;
                }
                if perms & 1 == 0 && !(meta.mode & 0o111 != 0 && current.is_superuser()) {
                    return Err(ExecError::AccessDenied);
                }
                (e_uid, e_gid)
            };

            let first = read_first_block(&node)?;

            if !sh_bang && first[0] == b'#' && first[1] == b'!' {
                let interp = parse_interp(&first)?;
                // The original argv (minus argv[0]) and envp are staged
                // once, before the splice pushes the replacement head.
                stage.copy_strings(pool, envp)?;
                stage.copy_strings(pool, argv.get(1..).unwrap_or(&[]))?;
                argc = argc.saturating_sub(1);

                stage.copy_strings(pool, &[path])?;
                argc += 1;
                if let Some(ref arg) = interp.arg {
                    stage.copy_strings(pool, &[arg.as_str()])?;
                    argc += 1;
                }
                stage.copy_strings(pool, &[interp.name.as_str()])?;
                argc += 1;

                sh_bang = true;
                node = fs.lookup(&interp.path).ok_or(ExecError::FileNotFound)?;
                continue;
            }

            let header = BinHeader::parse(&first)?;
            header.validate(meta.size)?;

            if !sh_bang {
                stage.copy_strings(pool, envp)?;
                stage.copy_strings(pool, argv)?;
            }

            return Ok(Prepared {
                node,
                header,
                argc,
                envc,
                e_uid,
                e_gid,
            });
        }
    }

    /// The point of no return: tear down the old image, install the new
    /// limits, wire the staged pages to the top of the window and build the
    /// argument vectors.
    fn commit(
        &mut self,
        pool: &mut FramePool,
        prepared: Prepared,
        mut stage: ArgStage,
    ) -> ExecResult<()> {
        let Prepared {
            node,
            header,
            argc,
            envc,
            e_uid,
            e_gid,
        } = prepared;

        let current = self.current_mut();

        current.executable = Some(node);
        current.actions = [SigAction::default(); NSIG];
        for fd in 0..NR_OPEN {
            if current.close_on_exec.get_bit(fd) {
                current.files[fd] = None;
            }
        }
        current.close_on_exec = 0;

        let base = current.space.base();
        let old_limit = current.space.limit();
        current.space.unmap_range(pool, base, old_limit);
        current.space.set_limit(WINDOW_SPAN);

        current.end_code = header.text as usize;
        current.end_data = (header.text + header.data) as usize;
        current.brk = (header.text + header.data + header.bss) as usize;

        for (i, slot) in stage.pages.iter_mut().enumerate() {
            if let Some(frame) = slot.take() {
                let uaddr = WINDOW_SPAN - STAGE_SIZE + i * PAGE_SIZE;
                if current
                    .space
                    .map(pool, base + uaddr, frame, EntryFlags::WRITABLE | EntryFlags::USER)
                    .is_err()
                {
                    // Past the commit there is no image to fall back to;
                    // the caller terminates the process. Return the
                    // unmapped scratch so nothing leaks from the pool.
                    pool.release(frame);
                    stage.release(pool);
                    return Err(ExecError::OutOfMemory);
                }
            }
        }

        let strings = WINDOW_SPAN - STAGE_SIZE + stage.p;
        let sp = create_tables(current, pool, strings, argc, envc)?;

        current.start_stack = sp & !(PAGE_SIZE - 1);
        current.euid = e_uid;
        current.egid = e_gid;
        current.context.pc = header.entry as usize;
        current.context.sp = sp;

        crate::log_info!(
            "exec: pid {} entry {:#x} sp {:#x}",
            current.pid.0,
            current.context.pc,
            current.context.sp
        );
        Ok(())
    }
}

struct Prepared {
    node: Arc<dyn FileNode>,
    header: BinHeader,
    argc: usize,
    envc: usize,
    e_uid: u16,
    e_gid: u16,
}

/// Build the startup vectors below the staged strings at user address
/// `strings`: argc, the null-terminated argv pointer array, the
/// null-terminated envp pointer array, then the string bytes — exactly the
/// layout a C runtime's start routine walks.
fn create_tables(
    current: &mut crate::process::Process,
    pool: &mut FramePool,
    strings: usize,
    argc: usize,
    envc: usize,
) -> ExecResult<usize> {
    let top = strings & !3;
    let envp_array = top - 4 * (envc + 1);
    let argv_array = envp_array - 4 * (argc + 1);
    let sp = argv_array - 12;

    uaccess::verify_area(&mut current.space, pool, sp, strings - sp)
        .map_err(|_| ExecError::OutOfMemory)?;

    let space = &current.space;
    uaccess::put_u32(space, pool, sp, argc as u32);
    uaccess::put_u32(space, pool, sp + 4, argv_array as u32);
    uaccess::put_u32(space, pool, sp + 8, envp_array as u32);

    let mut cursor = strings;
    for i in 0..argc {
        uaccess::put_u32(space, pool, argv_array + 4 * i, cursor as u32);
        while uaccess::get_u8(space, pool, cursor) != 0 {
            cursor += 1;
        }
        cursor += 1;
    }
    uaccess::put_u32(space, pool, argv_array + 4 * argc, 0);

    for i in 0..envc {
        uaccess::put_u32(space, pool, envp_array + 4 * i, cursor as u32);
        while uaccess::get_u8(space, pool, cursor) != 0 {
            cursor += 1;
        }
        cursor += 1;
    }
    uaccess::put_u32(space, pool, envp_array + 4 * envc, 0);

    Ok(sp)
}
