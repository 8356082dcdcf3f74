//! fork: duplicate the calling process.
//!
//! The child gets a fresh slot, a fresh pid and a copy-on-write duplicate of
//! the parent's window; everything refcounted — open files, the working and
//! root directories, the executable — is shared, one reference added per
//! resource. The child's saved accumulator is zeroed so fork returns 0 in
//! the child.

use crate::memory::frame_allocator::FramePool;
use crate::memory::paging::{copy_range, AddressSpace};
use crate::memory::OutOfMemory;
use crate::process::{Pid, Process, ProcessState, ProcessTable, WINDOW_SPAN};

impl ProcessTable {
    /// Create a child of the current process. Returns the child's pid; the
    /// parent keeps running.
    ///
    /// On exhaustion — no free slot, or the frame pool running dry midway
    /// through the table copy — the half-built child is torn down, nothing
    /// leaks, and the parent sees the error.
    pub fn fork(&mut self, pool: &mut FramePool) -> Result<Pid, OutOfMemory> {
        let slot = self.free_slot().ok_or(OutOfMemory)?;
        let pid = self.alloc_pid();

        let child = {
            let parent = self.current();
            let mut context = parent.context;
            context.ax = 0; // fork's return value in the child

            Process {
                pid,
                parent: parent.pid,
                pgrp: parent.pgrp,
                session: parent.session,
                leader: false, // leadership does not inherit
                state: ProcessState::Uninterruptible,
                exit_code: 0,
                uid: parent.uid,
                euid: parent.euid,
                gid: parent.gid,
                egid: parent.egid,
                utime: 0,
                stime: 0,
                cutime: 0,
                cstime: 0,
                pending: 0,
                blocked: parent.blocked,
                actions: parent.actions,
                space: AddressSpace::new(slot * WINDOW_SPAN, parent.space.limit()),
                start_code: slot * WINDOW_SPAN,
                end_code: parent.end_code,
                end_data: parent.end_data,
                brk: parent.brk,
                start_stack: parent.start_stack,
                executable: parent.executable.clone(),
                pwd: parent.pwd.clone(),
                root: parent.root.clone(),
                files: core::array::from_fn(|i| parent.files[i].clone()),
                close_on_exec: parent.close_on_exec,
                context,
                stop_reported: false,
            }
        };

        let limit = child.space.limit();
        self.insert(slot, child);

        let current = self.current_index();
        let (parent, child) = self.pair_mut(current, slot);
        if copy_range(pool, &mut parent.space, &mut child.space, limit).is_err() {
            // copy_range already unmapped the partial child window; dropping
            // the slot returns the shared references too.
            self.take(slot);
            return Err(OutOfMemory);
        }

        self.process_mut(slot).expect("child vanished").state = ProcessState::Running;
        crate::log_info!("fork: pid {} -> child pid {}", self.current().pid.0, pid.0);
        Ok(pid)
    }
}
