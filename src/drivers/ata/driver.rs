//! The disk driver's interrupt-chained state machine.
//!
//! Only one controller command is ever outstanding: the request queue
//! starts the next request strictly after the previous one completes, so
//! each controller interrupt dispatches to exactly one pending completion
//! routine — read, write or recalibrate — and the routines never nest.
//!
//! Errors escalate in stages: a failed transfer bumps the request's error
//! count and retries; past half of [`MAX_ERRORS`] the next attempt goes
//! through a controller reset and recalibration; at [`MAX_ERRORS`] the
//! request is failed and the queue moves on, the device staying usable.

use crate::drivers::blkdev::{BlockDriver, IoOp, RequestQueue, DEV_HD};

/// Retries per request before it is failed outright.
pub const MAX_ERRORS: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdCommand {
    /// Recalibrate: seek the heads to cylinder zero.
    Restore,
    Read,
    Write,
    /// Program drive parameters after a reset.
    Specify,
}

/// A cylinder/head/sector address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chs {
    pub cyl: u32,
    pub head: u32,
    pub sec: u32,
}

/// The controller as the state machine drives it. The port-level
/// implementation lives in [`super::pio`]; tests substitute a simulated
/// disk.
pub trait HdController {
    /// Program a command. Implementations poll for controller readiness
    /// with a bounded retry and treat exhaustion as fatal.
    fn issue(&mut self, drive: usize, cmd: HdCommand, chs: Chs, count: usize);
    /// Did the last command finish clean?
    fn status_ok(&mut self) -> bool;
    /// Bounded wait for the controller to ask for write data.
    fn await_drq(&mut self) -> bool;
    fn read_sector(&mut self, buf: &mut [u8; 512]);
    fn write_sector(&mut self, buf: &[u8; 512]);
    /// Hard controller reset; false when the controller stays wedged.
    fn reset(&mut self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct HdGeometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors: u32,
}

impl HdGeometry {
    pub fn capacity(&self) -> u64 {
        self.cylinders as u64 * self.heads as u64 * self.sectors as u64
    }

    fn chs(&self, sector: u64) -> Chs {
        let sec = (sector % self.sectors as u64) as u32 + 1;
        let track = sector / self.sectors as u64;
        Chs {
            sec,
            head: (track % self.heads as u64) as u32,
            cyl: (track / self.heads as u64) as u32,
        }
    }
}

/// Which completion routine the next interrupt runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingIntr {
    Read,
    Write,
    Recalibrate,
}

pub struct HdDriver<C: HdController> {
    ctrl: C,
    geometry: HdGeometry,
    pending: Option<PendingIntr>,
    needs_reset: bool,
    needs_recalibrate: bool,
}

impl<C: HdController> BlockDriver for HdDriver<C> {
    fn start(&mut self, queue: &mut RequestQueue) {
        self.do_request(queue);
    }
}

impl<C: HdController> HdDriver<C> {
    /// A fresh driver starts with a reset+recalibrate cycle, the same as
    /// after an error storm.
    pub fn new(ctrl: C, geometry: HdGeometry) -> Self {
        HdDriver {
            ctrl,
            geometry,
            pending: None,
            needs_reset: true,
            needs_recalibrate: true,
        }
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.ctrl
    }

    /// Controller interrupt: run whichever completion routine the last
    /// command armed.
    pub fn on_interrupt(&mut self, queue: &mut RequestQueue) {
        match self.pending.take() {
            None => crate::log_warn!("unexpected disk interrupt"),
            Some(PendingIntr::Read) => self.read_intr(queue),
            Some(PendingIntr::Write) => self.write_intr(queue),
            Some(PendingIntr::Recalibrate) => self.recal_intr(queue),
        }
    }

    /// Issue the controller command for the device's current request, or
    /// return with nothing armed when the queue is idle.
    fn do_request(&mut self, queue: &mut RequestQueue) {
        loop {
            let index = match queue.current_request(DEV_HD) {
                Some(index) => index,
                None => return,
            };
            let (sector, count, cmd) = {
                let request = queue.request(index);
                (request.sector, request.nr_sectors, request.cmd)
            };

            if sector + count as u64 > self.geometry.capacity() {
                crate::log_warn!("request past the end of the disk, sector {}", sector);
                queue.end_request(DEV_HD, false);
                continue;
            }

            if self.needs_reset {
                self.needs_reset = false;
                self.needs_recalibrate = true;
                if !self.ctrl.reset() {
                    crate::log_error!("disk controller reset failed");
                }
                // Re-program the drive parameters; the completion falls
                // through recalibration.
                let params = Chs {
                    cyl: self.geometry.cylinders,
                    head: self.geometry.heads - 1,
                    sec: self.geometry.sectors,
                };
                self.ctrl
                    .issue(0, HdCommand::Specify, params, self.geometry.sectors as usize);
                self.pending = Some(PendingIntr::Recalibrate);
                return;
            }

            if self.needs_recalibrate {
                self.needs_recalibrate = false;
                self.ctrl.issue(
                    0,
                    HdCommand::Restore,
                    Chs { cyl: 0, head: 0, sec: 0 },
                    0,
                );
                self.pending = Some(PendingIntr::Recalibrate);
                return;
            }

            let chs = self.geometry.chs(sector);
            match cmd {
                IoOp::Read => {
                    self.ctrl.issue(0, HdCommand::Read, chs, count);
                    self.pending = Some(PendingIntr::Read);
                    return;
                }
                IoOp::Write => {
                    self.ctrl.issue(0, HdCommand::Write, chs, count);
                    if !self.ctrl.await_drq() {
                        self.bad_rw(queue);
                        continue;
                    }
                    // First sector goes out now; the interrupt chain
                    // pushes the rest.
                    let data = copy_out(queue, index);
                    self.ctrl.write_sector(&data);
                    self.pending = Some(PendingIntr::Write);
                    return;
                }
                _ => panic!("unknown hd command"),
            }
        }
    }

    fn read_intr(&mut self, queue: &mut RequestQueue) {
        if !self.ctrl.status_ok() {
            self.bad_rw(queue);
            self.do_request(queue);
            return;
        }
        let index = queue
            .current_request(DEV_HD)
            .expect("read completion with no request");

        let mut data = [0u8; 512];
        self.ctrl.read_sector(&mut data);
        let done = {
            let request = queue.request_mut(index);
            request.buffer.lock().data[request.offset..request.offset + 512]
                .copy_from_slice(&data);
            request.errors = 0;
            request.offset += 512;
            request.sector += 1;
            request.nr_sectors -= 1;
            request.nr_sectors == 0
        };
        if !done {
            self.pending = Some(PendingIntr::Read);
            return;
        }
        queue.end_request(DEV_HD, true);
        self.do_request(queue);
    }

    fn write_intr(&mut self, queue: &mut RequestQueue) {
        if !self.ctrl.status_ok() {
            self.bad_rw(queue);
            self.do_request(queue);
            return;
        }
        let index = queue
            .current_request(DEV_HD)
            .expect("write completion with no request");

        let more = {
            let request = queue.request_mut(index);
            request.errors = 0;
            request.nr_sectors -= 1;
            if request.nr_sectors > 0 {
                request.offset += 512;
                request.sector += 1;
                true
            } else {
                false
            }
        };
        if more {
            let data = copy_out(queue, index);
            self.ctrl.write_sector(&data);
            self.pending = Some(PendingIntr::Write);
            return;
        }
        queue.end_request(DEV_HD, true);
        self.do_request(queue);
    }

    fn recal_intr(&mut self, queue: &mut RequestQueue) {
        if !self.ctrl.status_ok() {
            self.bad_rw(queue);
        }
        self.do_request(queue);
    }

    /// Count a transfer error against the current request. Too many fail
    /// the request; more than half the budget forces a controller reset
    /// before the next command.
    fn bad_rw(&mut self, queue: &mut RequestQueue) {
        let index = match queue.current_request(DEV_HD) {
            Some(index) => index,
            None => return,
        };
        let errors = {
            let request = queue.request_mut(index);
            request.errors += 1;
            request.errors
        };
        if errors >= MAX_ERRORS {
            queue.end_request(DEV_HD, false);
        }
        if errors > MAX_ERRORS / 2 {
            self.needs_reset = true;
        }
    }
}

/// Snapshot the current 512 bytes of the request's buffer.
fn copy_out(queue: &RequestQueue, index: usize) -> [u8; 512] {
    let request = queue.request(index);
    let buf = request.buffer.lock();
    let mut data = [0u8; 512];
    data.copy_from_slice(&buf.data[request.offset..request.offset + 512]);
    data
}

/// Simulated controller over an in-memory disk image.
#[cfg(test)]
pub mod mock {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    pub struct MockController {
        geometry: HdGeometry,
        pub disk: Vec<u8>,
        /// LBA of the next sector transferred.
        cursor: u64,
        /// Fail this many upcoming status checks.
        pub fail_status: usize,
        pub resets: usize,
    }

    impl MockController {
        pub fn new(geometry: HdGeometry) -> Self {
            let bytes = geometry.capacity() as usize * 512;
            MockController {
                geometry,
                disk: vec![0u8; bytes],
                cursor: 0,
                fail_status: 0,
                resets: 0,
            }
        }
    }

    impl HdController for MockController {
        fn issue(&mut self, _drive: usize, cmd: HdCommand, chs: Chs, _count: usize) {
            if matches!(cmd, HdCommand::Read | HdCommand::Write) {
                let track = chs.cyl as u64 * self.geometry.heads as u64 + chs.head as u64;
                self.cursor = track * self.geometry.sectors as u64 + (chs.sec as u64 - 1);
            }
        }

        fn status_ok(&mut self) -> bool {
            if self.fail_status > 0 {
                self.fail_status -= 1;
                return false;
            }
            true
        }

        fn await_drq(&mut self) -> bool {
            true
        }

        fn read_sector(&mut self, buf: &mut [u8; 512]) {
            let start = self.cursor as usize * 512;
            buf.copy_from_slice(&self.disk[start..start + 512]);
            self.cursor += 1;
        }

        fn write_sector(&mut self, buf: &[u8; 512]) {
            let start = self.cursor as usize * 512;
            self.disk[start..start + 512].copy_from_slice(buf);
            self.cursor += 1;
        }

        fn reset(&mut self) -> bool {
            self.resets += 1;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockController;
    use super::*;
    use crate::drivers::blkdev::SECTORS_PER_BLOCK;
    use crate::fs::buffer::{BufferHead, BufferRef};

    const GEOMETRY: HdGeometry = HdGeometry {
        cylinders: 4,
        heads: 2,
        sectors: 16,
    };

    fn driver_with_pattern() -> HdDriver<MockController> {
        let mut ctrl = MockController::new(GEOMETRY);
        for (i, byte) in ctrl.disk.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        HdDriver::new(ctrl, GEOMETRY)
    }

    /// Pump interrupts until the device queue drains (bounded).
    fn pump(driver: &mut HdDriver<MockController>, queue: &mut RequestQueue) {
        for _ in 0..64 {
            if queue.current_request(DEV_HD).is_none() {
                return;
            }
            driver.on_interrupt(queue);
        }
        panic!("request never completed");
    }

    fn read_block(
        driver: &mut HdDriver<MockController>,
        queue: &mut RequestQueue,
        block: u64,
    ) -> BufferRef {
        let buffer = BufferHead::new(DEV_HD, block);
        queue.ll_rw(driver, IoOp::Read, &buffer);
        pump(driver, queue);
        buffer
    }

    #[test]
    fn a_read_walks_reset_recalibrate_transfer_completion() {
        let mut driver = driver_with_pattern();
        let mut queue = RequestQueue::new();

        let buffer = read_block(&mut driver, &mut queue, 5);

        let buf = buffer.lock();
        assert!(buf.uptodate);
        assert!(!buf.locked);
        // Block 5 is sectors 10 and 11 of the image.
        let start = 5 * SECTORS_PER_BLOCK * 512;
        for (i, &byte) in buf.data.iter().enumerate() {
            assert_eq!(byte, ((start + i) % 251) as u8);
        }
        assert_eq!(driver.controller_mut().resets, 1); // the power-on reset
    }

    #[test]
    fn a_write_lands_on_the_disk_image() {
        let mut driver = driver_with_pattern();
        let mut queue = RequestQueue::new();

        let buffer = BufferHead::new(DEV_HD, 3);
        {
            let mut buf = buffer.lock();
            buf.data.fill(0xA5);
            buf.dirty = true;
        }
        queue.ll_rw(&mut driver, IoOp::Write, &buffer);
        pump(&mut driver, &mut queue);

        assert!(buffer.lock().uptodate);
        assert!(!buffer.lock().locked);
        let start = 3 * SECTORS_PER_BLOCK * 512;
        assert!(driver.controller_mut().disk[start..start + 1024]
            .iter()
            .all(|&b| b == 0xA5));
    }

    #[test]
    fn transient_errors_are_retried_until_the_transfer_sticks() {
        let mut driver = driver_with_pattern();
        let mut queue = RequestQueue::new();
        driver.controller_mut().fail_status = 2;

        let buffer = read_block(&mut driver, &mut queue, 5);

        assert!(buffer.lock().uptodate); // survived the retries
        let head = queue.current_request(DEV_HD);
        assert_eq!(head, None);
    }

    #[test]
    fn error_storms_force_a_reset_then_fail_only_that_request() {
        let mut driver = driver_with_pattern();
        let mut queue = RequestQueue::new();
        driver.controller_mut().fail_status = 64;

        let doomed = BufferHead::new(DEV_HD, 2);
        queue.ll_rw(&mut driver, IoOp::Read, &doomed);
        pump(&mut driver, &mut queue);

        assert!(!doomed.lock().uptodate); // failed for good
        assert!(!doomed.lock().locked); // but released
        assert!(driver.controller_mut().resets > 1); // escalated to reset

        // The device is still usable for the next request.
        driver.controller_mut().fail_status = 0;
        let fine = read_block(&mut driver, &mut queue, 5);
        assert!(fine.lock().uptodate);
    }

    #[test]
    fn requests_past_the_disk_end_fail_immediately() {
        let mut driver = driver_with_pattern();
        let mut queue = RequestQueue::new();

        // Capacity is 128 sectors = 64 blocks; block 64 starts past it.
        let buffer = BufferHead::new(DEV_HD, 64);
        queue.ll_rw(&mut driver, IoOp::Read, &buffer);

        assert!(queue.current_request(DEV_HD).is_none());
        assert!(!buffer.lock().uptodate);
        assert!(!buffer.lock().locked);
    }

    #[test]
    fn back_to_back_requests_chain_through_completions() {
        let mut driver = driver_with_pattern();
        let mut queue = RequestQueue::new();

        let first = BufferHead::new(DEV_HD, 1);
        let second = BufferHead::new(DEV_HD, 9);
        queue.ll_rw(&mut driver, IoOp::Read, &first);
        queue.ll_rw(&mut driver, IoOp::Read, &second);
        pump(&mut driver, &mut queue);

        assert!(first.lock().uptodate);
        assert!(second.lock().uptodate);
        assert_eq!(queue.pending_requests(), 0);
    }
}
