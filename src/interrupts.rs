//! Interrupt masking and the disk IRQ entry.
//!
//! This core runs on one CPU; the only concurrency is a device interrupt
//! preempting process context. Every critical section that touches state
//! shared with an interrupt handler (the request queue, buffer lock words,
//! wait channels) is a `critical` region — interrupts off, check-and-mutate,
//! interrupts back on. There are no multi-core locks to take.

/// Run `f` with device interrupts masked.
///
/// Masking is the sole mutual-exclusion primitive of this core. Under
/// `cfg(test)` there is no interrupt controller and the closure runs as-is.
#[cfg(not(test))]
pub fn critical<R>(f: impl FnOnce() -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(f)
}

#[cfg(test)]
pub fn critical<R>(f: impl FnOnce() -> R) -> R {
    f()
}

#[cfg(not(test))]
mod pic {
    use lazy_static::lazy_static;
    use pic8259::ChainedPics;
    use spin::Mutex;

    pub const PIC_1_OFFSET: u8 = 0x20;
    pub const PIC_2_OFFSET: u8 = 0x28;

    /// Vector of the disk controller interrupt (IRQ 14 on the slave PIC).
    pub const HD_VECTOR: u8 = 0x2E;

    lazy_static! {
        pub static ref PICS: Mutex<ChainedPics> =
            Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });
    }
}

#[cfg(not(test))]
pub use pic::HD_VECTOR;

/// Remap the interrupt controllers. The IDT gates themselves are installed
/// by the platform setup code outside this core.
#[cfg(not(test))]
pub fn init() {
    unsafe { pic::PICS.lock().initialize() };
    crate::log_info!("Interrupt controllers remapped.");
}

/// Disk controller interrupt entry. Called from the IDT stub for
/// [`HD_VECTOR`]; exactly one of these runs at a time because the request
/// queue never has more than one command outstanding per controller.
#[cfg(not(test))]
pub fn hd_interrupt() {
    {
        let mut queue = crate::drivers::blkdev::REQUEST_QUEUE.lock();
        let mut driver = crate::drivers::ata::HD_DRIVER.lock();
        driver.on_interrupt(&mut queue);
    }
    unsafe { pic::PICS.lock().notify_end_of_interrupt(pic::HD_VECTOR) };
}
