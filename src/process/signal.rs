//! Signal state and delivery.
//!
//! Each process carries a 32-bit pending and a 32-bit blocked bitmap plus a
//! 32-slot action table. Delivery happens at a safe return-to-user point:
//! the lowest pending unblocked signal is taken, and either ignored, given
//! the default treatment (nothing for the child-notification signal, death
//! for the rest), or dispatched to a handler by splicing a return frame onto
//! the user stack and pointing the saved program counter at the handler.

use bitflags::bitflags;
use core::fmt;

use crate::memory::frame_allocator::FramePool;
use crate::memory::uaccess;
use crate::process::{Pid, ProcessState, ProcessTable, NR_TASKS};

pub const NSIG: usize = 32;

pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGSEGV: u32 = 11;
pub const SIGCHLD: u32 = 17;

fn sig_bit(sig: u32) -> u32 {
    1 << (sig - 1)
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SigFlags: u32 {
        /// Reset the handler to default after one delivery.
        const ONESHOT = 1 << 0;
        /// Don't block further signals (and push no mask word) during the
        /// handler.
        const NOMASK = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Default,
    Ignore,
    /// User-space handler entry point.
    Address(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct SigAction {
    pub handler: Handler,
    /// Extra signals blocked while the handler runs.
    pub mask: u32,
    pub flags: SigFlags,
    /// Return trampoline the handler's `ret` lands on.
    pub restorer: usize,
}

impl Default for SigAction {
    fn default() -> Self {
        SigAction {
            handler: Handler::Default,
            mask: 0,
            flags: SigFlags::empty(),
            restorer: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    Permission,
    BadSignal,
    NoSuchProcess,
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SignalError::Permission => write!(f, "operation not permitted"),
            SignalError::BadSignal => write!(f, "invalid signal"),
            SignalError::NoSuchProcess => write!(f, "no such process"),
        }
    }
}

/// Addressee of a kill: one pid, one group, the caller's own group, or
/// everything.
#[derive(Debug, Clone, Copy)]
pub enum SignalTarget {
    Pid(Pid),
    Group(u32),
    CallerGroup,
    All,
}

/// What `deliver_pending` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivered {
    /// No pending unblocked signal.
    Nothing,
    Ignored(u32),
    /// Control was redirected to a handler.
    Caught(u32),
    /// Default action was death; the process is a zombie now.
    Terminated(u32),
}

impl ProcessTable {
    /// Raw delivery: set the pending bit and wake the target if it sleeps
    /// interruptibly.
    pub(crate) fn post_signal(&mut self, slot: usize, sig: u32) {
        if let Some(target) = self.process_mut(slot) {
            target.pending |= sig_bit(sig);
            if target.state == ProcessState::Interruptible {
                target.state = ProcessState::Running;
            }
        }
    }

    /// Permission-checked send to one slot. `privileged` bypasses the
    /// identity check (kernel-originated signals).
    fn send_sig(&mut self, slot: usize, sig: u32, privileged: bool) -> Result<(), SignalError> {
        if sig < 1 || sig > NSIG as u32 {
            return Err(SignalError::BadSignal);
        }
        let allowed = {
            let sender = self.current();
            let target = match self.process(slot) {
                Some(p) => p,
                None => return Err(SignalError::NoSuchProcess),
            };
            privileged || sender.euid == target.euid || sender.is_superuser()
        };
        if !allowed {
            return Err(SignalError::Permission);
        }
        self.post_signal(slot, sig);
        Ok(())
    }

    /// Send `sig` to everything `target` selects.
    ///
    /// Broadcast forms keep going past per-target permission failures; the
    /// last failure is reported after the sweep.
    pub fn kill(&mut self, target: SignalTarget, sig: u32) -> Result<(), SignalError> {
        match target {
            SignalTarget::Pid(pid) => {
                let slot = self
                    .slot_by_pid(pid)
                    .ok_or(SignalError::NoSuchProcess)?;
                self.send_sig(slot, sig, false)
            }
            SignalTarget::CallerGroup => {
                let group = self.current().pgrp;
                self.kill_group(group, sig, true)
            }
            SignalTarget::Group(group) => self.kill_group(group, sig, false),
            SignalTarget::All => {
                let mut result = Ok(());
                for slot in 1..NR_TASKS {
                    if self.process(slot).is_some() {
                        if let Err(err) = self.send_sig(slot, sig, false) {
                            result = Err(err);
                        }
                    }
                }
                result
            }
        }
    }

    fn kill_group(&mut self, group: u32, sig: u32, privileged: bool) -> Result<(), SignalError> {
        let mut result = Ok(());
        for slot in 1..NR_TASKS {
            if self.process(slot).map_or(false, |p| p.pgrp == group) {
                if let Err(err) = self.send_sig(slot, sig, privileged) {
                    result = Err(err);
                }
            }
        }
        result
    }

    /// Install a full action for `sig`, returning the old one. The kill
    /// signal cannot be caught, ignored or blocked.
    pub fn sigaction(&mut self, sig: u32, action: SigAction) -> Result<SigAction, SignalError> {
        if sig < 1 || sig > NSIG as u32 || sig == SIGKILL {
            return Err(SignalError::BadSignal);
        }
        let mut action = action;
        if action.flags.contains(SigFlags::NOMASK) {
            action.mask = 0;
        } else {
            action.mask |= sig_bit(sig);
        }
        let current = self.current_mut();
        let old = current.actions[sig as usize - 1];
        current.actions[sig as usize - 1] = action;
        Ok(old)
    }

    /// The old-style registration: one-shot, no masking, returning the
    /// previous handler.
    pub fn register_handler(
        &mut self,
        sig: u32,
        handler: Handler,
        restorer: usize,
    ) -> Result<Handler, SignalError> {
        if sig < 1 || sig > NSIG as u32 || sig == SIGKILL {
            return Err(SignalError::BadSignal);
        }
        let current = self.current_mut();
        let old = current.actions[sig as usize - 1].handler;
        current.actions[sig as usize - 1] = SigAction {
            handler,
            mask: 0,
            flags: SigFlags::ONESHOT | SigFlags::NOMASK,
            restorer,
        };
        Ok(old)
    }

    /// Replace the blocked mask, returning the old one. The kill signal's
    /// bit is stripped, it can never be held off.
    pub fn set_blocked_mask(&mut self, mask: u32) -> u32 {
        let current = self.current_mut();
        let old = current.blocked;
        current.blocked = mask & !sig_bit(SIGKILL);
        old
    }

    /// Deliver the lowest pending unblocked signal of the current process,
    /// if any. Called on the way back to user space.
    pub fn deliver_pending(&mut self, pool: &mut FramePool) -> Delivered {
        let (sig, action, old_blocked) = {
            let current = self.current_mut();
            let ready = current.pending & !current.blocked;
            if ready == 0 {
                return Delivered::Nothing;
            }
            let sig = ready.trailing_zeros() + 1;
            current.pending &= !sig_bit(sig);
            (sig, current.actions[sig as usize - 1], current.blocked)
        };

        let handler = match action.handler {
            Handler::Ignore => return Delivered::Ignored(sig),
            Handler::Default => {
                if sig == SIGCHLD {
                    return Delivered::Ignored(sig);
                }
                self.do_exit(pool, sig);
                return Delivered::Terminated(sig);
            }
            Handler::Address(handler) => handler,
        };

        if action.flags.contains(SigFlags::ONESHOT) {
            self.current_mut().actions[sig as usize - 1].handler = Handler::Default;
        }

        // Splice the return frame: trampoline, signal number, the previous
        // blocked mask (unless NOMASK), then the saved registers the
        // trampoline restores.
        let words = if action.flags.contains(SigFlags::NOMASK) { 7 } else { 8 };
        let current = self.current_mut();
        let frame = current.context.sp - 4 * words;
        if uaccess::verify_area(&mut current.space, pool, frame, 4 * words).is_err() {
            // No room to even build the frame; the process is beyond help.
            self.do_exit(pool, SIGSEGV);
            return Delivered::Terminated(SIGSEGV);
        }

        let current = self.current_mut();
        let ctx = current.context;
        let space = &current.space;
        let mut at = frame;
        let mut push = |pool: &mut FramePool, value: u32| {
            uaccess::put_u32(space, pool, at, value);
            at += 4;
        };
        push(pool, action.restorer as u32);
        push(pool, sig);
        if !action.flags.contains(SigFlags::NOMASK) {
            push(pool, old_blocked);
        }
        push(pool, ctx.ax);
        push(pool, ctx.cx);
        push(pool, ctx.dx);
        push(pool, ctx.flags);
        push(pool, ctx.pc as u32);

        let current = self.current_mut();
        current.context.sp = frame;
        current.context.pc = handler;
        current.blocked |= action.mask;
        Delivered::Caught(sig)
    }
}
