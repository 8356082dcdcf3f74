//! Seam to the external scheduler.
//!
//! The ready queue and the context switch live outside this core; the
//! subsystems here only ever need three operations: park the current process
//! on a wait channel, wake a channel's sleepers, and give up the CPU. The
//! check-and-register step must be atomic with respect to the interrupt that
//! would deliver the wakeup, so callers wrap the check and the
//! `block_current_on` call in one `interrupts::critical` section and the
//! channel is a single combined register-and-yield operation, never two
//! separately preemptable steps.

use core::sync::atomic::{AtomicUsize, Ordering};

/// A rendezvous point between a sleeping process and the completion path
/// that will wake it (buffer unlock, request-slot release, child exit).
///
/// The channel records sleeper and wakeup counts; moving a sleeper back to
/// the ready queue is the scheduler's business.
#[derive(Debug, Default)]
pub struct WaitChannel {
    sleepers: AtomicUsize,
    wakeups: AtomicUsize,
}

impl WaitChannel {
    pub const fn new() -> Self {
        WaitChannel {
            sleepers: AtomicUsize::new(0),
            wakeups: AtomicUsize::new(0),
        }
    }

    /// Number of processes currently parked on this channel.
    pub fn sleepers(&self) -> usize {
        self.sleepers.load(Ordering::Relaxed)
    }

    /// Total wakeups ever posted to this channel.
    pub fn wakeups(&self) -> usize {
        self.wakeups.load(Ordering::Relaxed)
    }
}

/// Park the caller on `chan` until somebody posts a wakeup.
///
/// Registration and the yield are one operation; the caller must re-check
/// its condition on return, wakeups can be spurious or stolen.
pub fn block_current_on(chan: &WaitChannel, _interruptible: bool) {
    chan.sleepers.fetch_add(1, Ordering::Relaxed);
    yield_now();
    chan.sleepers.fetch_sub(1, Ordering::Relaxed);
}

/// Post a wakeup to every process parked on `chan`.
pub fn wake_up(chan: &WaitChannel) {
    chan.wakeups.fetch_add(1, Ordering::Relaxed);
}

/// Hand the CPU to the scheduler. Returns when the caller is picked again.
pub fn yield_now() {}
