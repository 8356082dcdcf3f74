//! Process control blocks and the global process table.
//!
//! A fixed table of [`NR_TASKS`] slots, each either empty or one
//! [`Process`]. Slot index fixes the process's linear window
//! (`slot * WINDOW_SPAN`), so address spaces are disjoint by construction.
//! Pids are probed monotonically, wrap, and are reused only after the owning
//! slot is released by `wait`.
//!
//! The lifecycle operations live in their own files: `fork`, `exec`, `exit`
//! (with `wait`) and `signal`, all as methods on [`ProcessTable`] so the
//! logic is testable without the global singletons.

pub mod exec;
pub mod exit;
pub mod fork;
pub mod signal;

use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::fs::{FileNode, Filesystem};
use crate::memory::paging::{AddressSpace, KERNEL_INIT_ENTRIES};
use crate::memory::{OutOfMemory, FRAME_POOL, PAGE_SIZE};
use crate::sched;

pub use exec::ExecError;
pub use exit::{WaitError, WaitFilter, WaitOptions};
pub use signal::{SigAction, SignalError, SignalTarget, NSIG};

/// Process table size; also bounds the number of 64 MiB linear windows.
pub const NR_TASKS: usize = 64;

/// Open descriptors per process.
pub const NR_OPEN: usize = 20;

/// Linear window per process slot (64 MiB).
pub const WINDOW_SPAN: usize = 0x400_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Asleep, wakeable by a signal.
    Interruptible,
    /// Asleep until the awaited event, signals queue up.
    Uninterruptible,
    Stopped,
    /// Dead; only the slot and the exit code remain for the parent.
    Zombie,
}

/// The registers the core cares about across kernel entries: enough to
/// resume the process, to hand fork's child its zero return and to splice a
/// signal frame. The remaining register file is carried by the trap stubs
/// outside this core.
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    /// User program counter (window-relative).
    pub pc: usize,
    /// User stack pointer (window-relative).
    pub sp: usize,
    pub flags: u32,
    pub ax: u32,
    pub cx: u32,
    pub dx: u32,
}

/// An open-file table entry, shared between processes by fork.
pub struct File {
    pub readable: bool,
    pub writable: bool,
    pub offset: u64,
}

pub type FileRef = Arc<Mutex<File>>;

pub struct Process {
    pub pid: Pid,
    pub parent: Pid,
    pub pgrp: u32,
    pub session: u32,
    pub leader: bool,
    pub state: ProcessState,
    pub exit_code: u32,
    pub uid: u16,
    pub euid: u16,
    pub gid: u16,
    pub egid: u16,
    pub utime: u64,
    pub stime: u64,
    /// Accumulated times of reaped children.
    pub cutime: u64,
    pub cstime: u64,
    pub pending: u32,
    pub blocked: u32,
    pub actions: [SigAction; NSIG],
    pub space: AddressSpace,
    pub start_code: usize,
    /// Length of the text image (window-relative end of code).
    pub end_code: usize,
    /// End of the executable-backed region; faults past it get zero pages.
    pub end_data: usize,
    pub brk: usize,
    pub start_stack: usize,
    pub executable: Option<Arc<dyn FileNode>>,
    pub pwd: Option<Arc<dyn FileNode>>,
    pub root: Option<Arc<dyn FileNode>>,
    pub files: [Option<FileRef>; NR_OPEN],
    /// Bit n set: descriptor n closes across exec.
    pub close_on_exec: u32,
    pub context: Context,
    /// A Stopped child is reported to wait once per stop.
    pub stop_reported: bool,
}

impl Process {
    /// The hand-built process 0: the kernel's own thread of control, living
    /// in the low window so the first fork shares the kernel image.
    pub(crate) fn bootstrap() -> Process {
        Process {
            pid: Pid(0),
            parent: Pid(0),
            pgrp: 0,
            session: 0,
            leader: false,
            state: ProcessState::Running,
            exit_code: 0,
            uid: 0,
            euid: 0,
            gid: 0,
            egid: 0,
            utime: 0,
            stime: 0,
            cutime: 0,
            cstime: 0,
            pending: 0,
            blocked: 0,
            actions: [SigAction::default(); NSIG],
            space: AddressSpace::new(0, KERNEL_INIT_ENTRIES * PAGE_SIZE),
            start_code: 0,
            end_code: 0,
            end_data: 0,
            brk: 0,
            start_stack: 0,
            executable: None,
            pwd: None,
            root: None,
            files: core::array::from_fn(|_| None),
            close_on_exec: 0,
            context: Context::default(),
            stop_reported: false,
        }
    }

    pub fn is_superuser(&self) -> bool {
        self.euid == 0
    }

    /// A blank process parked in `slot`'s window (test scaffolding for the
    /// lifecycle and fault paths).
    #[cfg(test)]
    pub(crate) fn at_slot(pid: Pid, slot: usize) -> Process {
        let mut process = Process::bootstrap();
        process.pid = pid;
        process.space = AddressSpace::new(slot * WINDOW_SPAN, WINDOW_SPAN);
        process.start_code = slot * WINDOW_SPAN;
        process
    }
}

pub struct ProcessTable {
    slots: Vec<Option<Process>>,
    current: usize,
    last_pid: u32,
}

impl ProcessTable {
    pub fn new() -> Self {
        let mut slots: Vec<Option<Process>> = (0..NR_TASKS).map(|_| None).collect();
        slots[0] = Some(Process::bootstrap());
        ProcessTable {
            slots,
            current: 0,
            last_pid: 0,
        }
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> &Process {
        self.slots[self.current]
            .as_ref()
            .expect("current slot is empty")
    }

    pub fn current_mut(&mut self) -> &mut Process {
        self.slots[self.current]
            .as_mut()
            .expect("current slot is empty")
    }

    /// Make `slot` the running process. The context switch itself belongs
    /// to the scheduler; the table only tracks whose kernel entry this is.
    pub fn set_current(&mut self, slot: usize) {
        assert!(self.slots[slot].is_some(), "switching to an empty slot");
        self.current = slot;
    }

    pub fn process(&self, slot: usize) -> Option<&Process> {
        self.slots.get(slot).and_then(|p| p.as_ref())
    }

    pub fn process_mut(&mut self, slot: usize) -> Option<&mut Process> {
        self.slots.get_mut(slot).and_then(|p| p.as_mut())
    }

    pub fn slot_by_pid(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|p| p.as_ref().map_or(false, |p| p.pid == pid))
    }

    pub(crate) fn pid_in_use(&self, pid: u32) -> bool {
        self.slots
            .iter()
            .any(|p| p.as_ref().map_or(false, |p| p.pid.0 == pid))
    }

    /// Probe the next unused pid, wrapping past zero.
    pub(crate) fn alloc_pid(&mut self) -> Pid {
        loop {
            self.last_pid = self.last_pid.wrapping_add(1);
            if self.last_pid == 0 {
                self.last_pid = 1;
            }
            if !self.pid_in_use(self.last_pid) {
                return Pid(self.last_pid);
            }
        }
    }

    /// First empty slot; slot 0 stays with the bootstrap process.
    pub(crate) fn free_slot(&self) -> Option<usize> {
        (1..NR_TASKS).find(|&i| self.slots[i].is_none())
    }

    pub(crate) fn insert(&mut self, slot: usize, process: Process) {
        debug_assert!(self.slots[slot].is_none());
        self.slots[slot] = Some(process);
    }

    pub(crate) fn take(&mut self, slot: usize) -> Option<Process> {
        self.slots[slot].take()
    }

    /// Mutable access to two distinct slots at once (the sharing scan needs
    /// the current process and a candidate side by side).
    pub(crate) fn pair_mut(&mut self, a: usize, b: usize) -> (&mut Process, &mut Process) {
        assert!(a != b, "pair_mut needs two distinct slots");
        if a < b {
            let (lo, hi) = self.slots.split_at_mut(b);
            (
                lo[a].as_mut().expect("slot is empty"),
                hi[0].as_mut().expect("slot is empty"),
            )
        } else {
            let (lo, hi) = self.slots.split_at_mut(a);
            let second = hi[0].as_mut().expect("slot is empty");
            (second, lo[b].as_mut().expect("slot is empty"))
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    pub static ref PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());
}

/// Duplicate the calling process. The child's saved accumulator reads zero.
pub fn fork() -> Result<Pid, OutOfMemory> {
    let mut table = PROCESS_TABLE.lock();
    let mut pool = FRAME_POOL.lock();
    table.fork(&mut pool)
}

/// Replace the calling process's image with the program at `path`.
///
/// On success the caller's saved context has been rewritten; returning to
/// user space resumes the new program at its entry point.
pub fn execve(
    fs: &dyn Filesystem,
    path: &str,
    argv: &[&str],
    envp: &[&str],
) -> Result<(), ExecError> {
    let mut table = PROCESS_TABLE.lock();
    let mut pool = FRAME_POOL.lock();
    table.execve(&mut pool, fs, path, argv, envp)
}

/// Terminate the calling process. Never returns.
pub fn exit(code: u32) -> ! {
    {
        let mut table = PROCESS_TABLE.lock();
        let mut pool = FRAME_POOL.lock();
        table.do_exit(&mut pool, (code & 0xff) << 8);
    }
    sched::yield_now();
    unreachable!("a dead process came back from the scheduler");
}

/// Reap a child matching `filter`. See [`ProcessTable::waitpid`].
pub fn waitpid(filter: WaitFilter, options: WaitOptions) -> Result<(Pid, u32), WaitError> {
    let mut table = PROCESS_TABLE.lock();
    table.waitpid(filter, options)
}

/// Send `sig` to the processes selected by `target`.
pub fn kill(target: SignalTarget, sig: u32) -> Result<(), SignalError> {
    let mut table = PROCESS_TABLE.lock();
    table.kill(target, sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_occupies_slot_zero() {
        let table = ProcessTable::new();
        assert_eq!(table.current_index(), 0);
        assert_eq!(table.current().pid, Pid(0));
        assert_eq!(table.current().space.base(), 0);
    }

    #[test]
    fn pid_probe_skips_live_pids_and_wraps() {
        let mut table = ProcessTable::new();
        // Bootstrap holds pid 0; force the counter near the wrap point.
        table.last_pid = u32::MAX - 1;
        assert_eq!(table.alloc_pid(), Pid(u32::MAX));
        // Wraps past 0 (pid 0 is live) straight to 1.
        assert_eq!(table.alloc_pid(), Pid(1));
    }

    #[test]
    fn pair_mut_hands_out_both_orders() {
        let mut table = ProcessTable::new();
        let mut second = Process::bootstrap();
        second.pid = Pid(9);
        table.insert(3, second);

        let (a, b) = table.pair_mut(0, 3);
        assert_eq!(a.pid, Pid(0));
        assert_eq!(b.pid, Pid(9));
        let (a, b) = table.pair_mut(3, 0);
        assert_eq!(a.pid, Pid(9));
        assert_eq!(b.pid, Pid(0));
    }
}
