//! exit and wait: tearing a process down and reaping it.
//!
//! Death happens in two halves. `do_exit` releases everything the process
//! holds — its window, its descriptors, its directory and image references —
//! reparents its children to init, hangs up its session if it led one, and
//! leaves a zombie: the bare slot with the exit code. The second half is the
//! parent's `waitpid`, which folds the child's accounting into its own,
//! frees the slot and returns the status.

use bitflags::bitflags;
use core::fmt;

use crate::memory::frame_allocator::FramePool;
use crate::process::signal::{SIGCHLD, SIGHUP};
use crate::process::{Pid, ProcessState, ProcessTable, NR_TASKS};
use crate::sched;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitOptions: u32 {
        /// Don't block; report nothing-yet instead.
        const NOHANG = 1 << 0;
        /// Also report stopped children (once per stop).
        const UNTRACED = 1 << 1;
    }
}

/// Which children a wait matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFilter {
    Any,
    Pid(Pid),
    Group(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// No child matches the filter at all.
    NoChildren,
    /// A signal other than child-notification arrived while waiting.
    Interrupted,
    /// Non-blocking wait and nothing is reportable yet.
    WouldBlock,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WaitError::NoChildren => write!(f, "no child processes"),
            WaitError::Interrupted => write!(f, "interrupted system call"),
            WaitError::WouldBlock => write!(f, "no state change yet"),
        }
    }
}

impl ProcessTable {
    /// Free a dead process's slot for good.
    pub(crate) fn release(&mut self, slot: usize) {
        if self.take(slot).is_none() {
            panic!("trying to release a non-existent task");
        }
    }

    /// Terminate the current process with `code` as its wait status.
    ///
    /// Everything but the control block is released here; the slot itself
    /// survives as a zombie until the parent reaps it. The caller is
    /// expected to yield to the scheduler afterwards and never run this
    /// process again.
    pub fn do_exit(&mut self, pool: &mut FramePool, code: u32) {
        let me = self.current_index();
        let (my_pid, parent_pid, leader, session) = {
            let p = self.current();
            (p.pid, p.parent, p.leader, p.session)
        };

        // The whole window goes; the control block is all that remains.
        {
            let p = self.current_mut();
            let base = p.space.base();
            let limit = p.space.limit();
            p.space.unmap_range(pool, base, limit);
        }

        // Orphans go to init. A child that is already a zombie will never
        // be reaped by its dead parent, so init is told to collect it.
        let init_slot = self.slot_by_pid(Pid(1)).filter(|&s| s != me);
        let mut orphaned_zombies = false;
        for slot in 0..NR_TASKS {
            if slot == me {
                continue;
            }
            if let Some(child) = self.process_mut(slot) {
                if child.parent == my_pid {
                    child.parent = Pid(1);
                    if child.state == ProcessState::Zombie {
                        orphaned_zombies = true;
                    }
                }
            }
        }
        if orphaned_zombies {
            if let Some(init) = init_slot {
                self.post_signal(init, SIGCHLD);
            }
        }

        {
            let p = self.current_mut();
            for file in p.files.iter_mut() {
                *file = None;
            }
            p.close_on_exec = 0;
            p.pwd = None;
            p.root = None;
            p.executable = None;
        }

        // A dying session leader hangs up the whole session.
        if leader {
            for slot in 0..NR_TASKS {
                if slot == me {
                    continue;
                }
                if self.process(slot).map_or(false, |p| p.session == session) {
                    self.post_signal(slot, SIGHUP);
                }
            }
        }

        {
            let p = self.current_mut();
            p.state = ProcessState::Zombie;
            p.exit_code = code;
        }

        // Tell the parent. A process with no live parent is an
        // inconsistency nobody will ever reap; it buries itself.
        match self.slot_by_pid(parent_pid).filter(|&s| s != me) {
            Some(parent) => self.post_signal(parent, SIGCHLD),
            None => {
                crate::log_error!("exit: no parent for pid {}, releasing myself", my_pid.0);
                self.release(me);
            }
        }
    }

    /// Reap one child matching `filter`.
    ///
    /// A zombie child is folded into the caller's child-time accounting,
    /// its slot freed and its pid and status returned. A stopped child is
    /// reported once if `UNTRACED` asked for it. With matching children
    /// but nothing reportable the caller sleeps interruptibly until a
    /// child-notification signal, unless `NOHANG` said not to.
    pub fn waitpid(
        &mut self,
        filter: WaitFilter,
        options: WaitOptions,
    ) -> Result<(Pid, u32), WaitError> {
        loop {
            let me = self.current_index();
            let my_pid = self.current().pid;

            let mut found_live = false;
            let mut zombie: Option<usize> = None;
            let mut stopped: Option<usize> = None;

            for slot in 0..NR_TASKS {
                if slot == me {
                    continue;
                }
                let p = match self.process(slot) {
                    Some(p) => p,
                    None => continue,
                };
                if p.parent != my_pid {
                    continue;
                }
                let matches = match filter {
                    WaitFilter::Any => true,
                    WaitFilter::Pid(pid) => p.pid == pid,
                    WaitFilter::Group(group) => p.pgrp == group,
                };
                if !matches {
                    continue;
                }
                match p.state {
                    ProcessState::Zombie => {
                        zombie = Some(slot);
                        break;
                    }
                    ProcessState::Stopped => {
                        if options.contains(WaitOptions::UNTRACED) {
                            if p.stop_reported {
                                found_live = true;
                            } else {
                                stopped = Some(slot);
                                break;
                            }
                        }
                        // Not opted in: a stopped child is invisible here.
                    }
                    _ => found_live = true,
                }
            }

            if let Some(slot) = zombie {
                let child = self.take(slot).expect("zombie vanished");
                let parent = self.current_mut();
                parent.cutime += child.utime;
                parent.cstime += child.stime;
                crate::log_info!("wait: pid {} reaped pid {}", my_pid.0, child.pid.0);
                return Ok((child.pid, child.exit_code));
            }
            if let Some(slot) = stopped {
                let child = self.process_mut(slot).expect("stopped child vanished");
                child.stop_reported = true;
                return Ok((child.pid, 0x7f));
            }
            if !found_live {
                return Err(WaitError::NoChildren);
            }
            if options.contains(WaitOptions::NOHANG) {
                return Err(WaitError::WouldBlock);
            }

            // Sleep until a signal arrives, then re-examine the children.
            // Any signal other than the child notification interrupts the
            // wait.
            self.current_mut().state = ProcessState::Interruptible;
            sched::yield_now();
            let p = self.current_mut();
            p.state = ProcessState::Running;
            p.pending &= !(1 << (SIGCHLD - 1));
            if p.pending != 0 {
                return Err(WaitError::Interrupted);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testfs::MemFile;
    use crate::fs::FileNode;
    use crate::memory::uaccess;
    use crate::process::signal::{SIGINT, SIGUSR1};
    use crate::process::{File, Process};
    use alloc::sync::Arc;
    use alloc::vec;
    use spin::Mutex;

    fn sig_bit(sig: u32) -> u32 {
        1 << (sig - 1)
    }

    fn family() -> ProcessTable {
        // init (pid 1), a parent (pid 10) and its child (pid 11).
        let mut table = ProcessTable::new();
        table.insert(1, Process::at_slot(Pid(1), 1));
        let mut parent = Process::at_slot(Pid(10), 2);
        parent.parent = Pid(1);
        table.insert(2, parent);
        let mut child = Process::at_slot(Pid(11), 3);
        child.parent = Pid(10);
        table.insert(3, child);
        table
    }

    #[test]
    fn exit_releases_resources_and_leaves_a_zombie() {
        let mut table = family();
        let mut pool = FramePool::new(32);
        let node: Arc<dyn FileNode> =
            Arc::new(MemFile::new(0o100755, 0, 0, 500, vec![0u8; 2048]));

        table.set_current(3);
        {
            let p = table.current_mut();
            p.executable = Some(node.clone());
            p.utime = 5;
            p.stime = 7;
            p.files[0] = Some(Arc::new(Mutex::new(File {
                readable: true,
                writable: true,
                offset: 0,
            })));
        }
        uaccess::verify_area(&mut table.current_mut().space, &mut pool, 0x1000, 4).unwrap();
        assert!(pool.free_frames() < pool.total());

        table.do_exit(&mut pool, (3 & 0xff) << 8);

        let child = table.process(3).unwrap();
        assert_eq!(child.state, ProcessState::Zombie);
        assert_eq!(child.exit_code, 0x300);
        assert!(child.executable.is_none());
        assert!(child.files[0].is_none());
        assert_eq!(Arc::strong_count(&node), 1); // image reference dropped
        assert_eq!(pool.free_frames(), pool.total()); // window freed

        // The parent was told.
        let parent = table.process(2).unwrap();
        assert_ne!(parent.pending & sig_bit(SIGCHLD), 0);
    }

    #[test]
    fn exit_reparents_children_and_flags_orphaned_zombies_to_init() {
        let mut table = family();
        let mut pool = FramePool::new(16);
        // Give the dying parent a second, already-dead child.
        let mut dead = Process::at_slot(Pid(12), 4);
        dead.parent = Pid(10);
        dead.state = ProcessState::Zombie;
        table.insert(4, dead);

        table.set_current(2);
        table.do_exit(&mut pool, 0);

        assert_eq!(table.process(3).unwrap().parent, Pid(1));
        assert_eq!(table.process(4).unwrap().parent, Pid(1));
        // init is asked to reap the zombie it just inherited.
        assert_ne!(table.process(1).unwrap().pending & sig_bit(SIGCHLD), 0);
    }

    #[test]
    fn a_dying_session_leader_hangs_up_its_session() {
        let mut table = family();
        let mut pool = FramePool::new(16);
        table.process_mut(2).unwrap().leader = true;
        table.process_mut(2).unwrap().session = 9;
        table.process_mut(3).unwrap().session = 9;
        table.process_mut(1).unwrap().session = 1;

        table.set_current(2);
        table.do_exit(&mut pool, 0);

        assert_ne!(table.process(3).unwrap().pending & sig_bit(SIGHUP), 0);
        assert_eq!(table.process(1).unwrap().pending & sig_bit(SIGHUP), 0);
    }

    #[test]
    fn a_process_with_no_parent_buries_itself() {
        let mut table = ProcessTable::new();
        let mut orphan = Process::at_slot(Pid(50), 5);
        orphan.parent = Pid(99); // nobody
        table.insert(5, orphan);
        table.set_current(5);
        let mut pool = FramePool::new(16);

        table.do_exit(&mut pool, 0);
        assert!(table.process(5).is_none());
    }

    #[test]
    fn wait_reaps_a_zombie_and_folds_its_accounting() {
        let mut table = family();
        let mut pool = FramePool::new(32);
        table.set_current(3);
        table.current_mut().utime = 5;
        table.current_mut().stime = 7;
        table.do_exit(&mut pool, 0x300);

        table.set_current(2);
        let (pid, status) = table.waitpid(WaitFilter::Any, WaitOptions::empty()).unwrap();
        assert_eq!(pid, Pid(11));
        assert_eq!(status, 0x300);
        assert!(table.process(3).is_none()); // slot released
        assert_eq!(table.current().cutime, 5);
        assert_eq!(table.current().cstime, 7);
    }

    #[test]
    fn wait_with_no_children_fails_immediately() {
        let mut table = family();
        table.set_current(3); // the leaf of the family has no children
        assert_eq!(
            table.waitpid(WaitFilter::Any, WaitOptions::empty()),
            Err(WaitError::NoChildren)
        );
    }

    #[test]
    fn wait_never_matches_a_process_that_is_not_a_child() {
        let mut table = family();
        let mut pool = FramePool::new(16);
        // Pid 11 is pid 10's child; pid 1 waits on it by pid and must not
        // match, whatever its state.
        table.set_current(3);
        table.do_exit(&mut pool, 0);
        table.set_current(1);
        assert_eq!(
            table.waitpid(WaitFilter::Pid(Pid(11)), WaitOptions::empty()),
            Err(WaitError::NoChildren)
        );
    }

    #[test]
    fn nonblocking_wait_reports_nothing_yet() {
        let mut table = family();
        table.set_current(2); // child 11 is alive and running
        assert_eq!(
            table.waitpid(WaitFilter::Any, WaitOptions::NOHANG),
            Err(WaitError::WouldBlock)
        );
    }

    #[test]
    fn a_stopped_child_is_reported_once_when_asked() {
        let mut table = family();
        table.process_mut(3).unwrap().state = ProcessState::Stopped;
        table.set_current(2);

        // Not opted in: the stopped child is invisible.
        assert_eq!(
            table.waitpid(WaitFilter::Any, WaitOptions::NOHANG),
            Err(WaitError::NoChildren)
        );

        let (pid, status) = table
            .waitpid(WaitFilter::Any, WaitOptions::UNTRACED)
            .unwrap();
        assert_eq!(pid, Pid(11));
        assert_eq!(status, 0x7f);

        // Second wait doesn't re-report the same stop.
        assert_eq!(
            table.waitpid(
                WaitFilter::Any,
                WaitOptions::UNTRACED | WaitOptions::NOHANG
            ),
            Err(WaitError::WouldBlock)
        );
    }

    #[test]
    fn a_foreign_signal_interrupts_a_blocking_wait() {
        let mut table = family();
        table.set_current(2); // child alive, nothing reportable
        table.current_mut().pending = sig_bit(SIGINT) | sig_bit(SIGUSR1);

        assert_eq!(
            table.waitpid(WaitFilter::Any, WaitOptions::empty()),
            Err(WaitError::Interrupted)
        );
    }

    #[test]
    fn group_filter_matches_only_that_group() {
        let mut table = family();
        let mut pool = FramePool::new(16);
        table.process_mut(3).unwrap().pgrp = 44;
        table.set_current(3);
        table.do_exit(&mut pool, 0);

        table.set_current(2);
        assert_eq!(
            table.waitpid(WaitFilter::Group(55), WaitOptions::empty()),
            Err(WaitError::NoChildren)
        );
        let (pid, _) = table
            .waitpid(WaitFilter::Group(44), WaitOptions::empty())
            .unwrap();
        assert_eq!(pid, Pid(11));
    }
}
