//! Device-independent block request queue.
//!
//! A fixed pool of request slots feeds per-device chains ordered to
//! minimize seeking. Writes may only take the bottom two thirds of the pool
//! so reads always find room — reads have somebody waiting on them. A
//! best-effort (ahead) request is dropped rather than waited for: if its
//! buffer is busy or no slot is free, nobody will miss it.
//!
//! The buffer is locked for the whole life of a request — taken here in
//! process context, dropped by the driver's completion path in interrupt
//! context — so the queue mutations themselves run with interrupts masked.

use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::fs::buffer::BufferRef;
use crate::fs::BLOCK_SIZE;
use crate::interrupts;
use crate::sched;
use crate::sched::WaitChannel;

/// Request slots shared by all devices.
pub const NR_REQUEST: usize = 32;

/// Known block-device majors.
pub const NR_BLK_DEV: usize = 4;

/// The hard disk's device number.
pub const DEV_HD: usize = 3;

/// Sectors per filesystem block.
pub const SECTORS_PER_BLOCK: usize = BLOCK_SIZE / 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
    /// Best-effort read: dropped instead of queued when resources are
    /// tight.
    ReadAhead,
    /// Best-effort write.
    WriteAhead,
}

impl IoOp {
    fn is_ahead(self) -> bool {
        matches!(self, IoOp::ReadAhead | IoOp::WriteAhead)
    }

    /// The real transfer behind an ahead variant.
    fn demoted(self) -> IoOp {
        match self {
            IoOp::ReadAhead => IoOp::Read,
            IoOp::WriteAhead => IoOp::Write,
            other => other,
        }
    }
}

/// One pending transfer. Device and command never change once enqueued;
/// the sector/offset cursor advances as the driver moves data.
pub struct Request {
    pub dev: usize,
    pub cmd: IoOp,
    pub errors: u32,
    pub sector: u64,
    pub nr_sectors: usize,
    /// Byte cursor into the buffer.
    pub offset: usize,
    pub buffer: BufferRef,
    /// Woken when the request completes.
    pub waiting: WaitChannel,
    pub next: Option<usize>,
}

/// A device driver's request-start entry point, invoked (queue lock held)
/// the moment a request lands on an idle device.
pub trait BlockDriver {
    fn start(&mut self, queue: &mut RequestQueue);
}

/// Ordering predicate over (device, sector): `true` when `a` should be
/// served before `b`.
pub type OrderPredicate = fn((usize, u64), (usize, u64)) -> bool;

/// The default seek-minimizing order: by device, then ascending sector.
pub fn elevator_order(a: (usize, u64), b: (usize, u64)) -> bool {
    a.0 < b.0 || (a.0 == b.0 && a.1 < b.1)
}

pub struct RequestQueue {
    slots: Vec<Option<Request>>,
    /// Head of each device's chain; the head is the in-flight request.
    current: [Option<usize>; NR_BLK_DEV],
    order: OrderPredicate,
    /// Sleepers waiting for any slot to free up.
    pub wait_for_request: WaitChannel,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::with_order(elevator_order)
    }

    pub fn with_order(order: OrderPredicate) -> Self {
        RequestQueue {
            slots: (0..NR_REQUEST).map(|_| None).collect(),
            current: [None; NR_BLK_DEV],
            order,
            wait_for_request: WaitChannel::new(),
        }
    }

    /// The in-flight request of `dev`, if any.
    pub fn current_request(&self, dev: usize) -> Option<usize> {
        self.current[dev]
    }

    pub fn request(&self, index: usize) -> &Request {
        self.slots[index].as_ref().expect("empty request slot")
    }

    pub fn request_mut(&mut self, index: usize) -> &mut Request {
        self.slots[index].as_mut().expect("empty request slot")
    }

    /// Occupied slots (diagnostics and tests).
    pub fn pending_requests(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Queue a transfer for `buffer` on its device.
    ///
    /// Ahead requests are silently dropped when the buffer is already busy
    /// or the slot pool is full. A buffer whose state already satisfies the
    /// command — clean for a write, up-to-date for a read — is not queued
    /// at all. Enqueueing onto an idle device starts the driver before this
    /// returns.
    pub fn ll_rw(&mut self, driver: &mut dyn BlockDriver, op: IoOp, buffer: &BufferRef) {
        let dev = buffer.lock().dev;
        if dev >= NR_BLK_DEV {
            crate::log_warn!("ll_rw: request for nonexistent device {}", dev);
            return;
        }

        let ahead = op.is_ahead();
        if ahead && buffer.lock().locked {
            return; // nobody will miss it
        }
        let op = op.demoted();

        lock_buffer(buffer);
        {
            let buf = buffer.lock();
            if (op == IoOp::Write && !buf.dirty) || (op == IoOp::Read && buf.uptodate) {
                drop(buf);
                unlock_buffer(buffer);
                return;
            }
        }

        // Writes keep their hands off the top third of the pool.
        let ceiling = if op == IoOp::Read {
            NR_REQUEST
        } else {
            NR_REQUEST * 2 / 3
        };
        let slot = loop {
            match (0..ceiling).rev().find(|&i| self.slots[i].is_none()) {
                Some(slot) => break slot,
                None => {
                    if ahead {
                        unlock_buffer(buffer);
                        return;
                    }
                    sched::block_current_on(&self.wait_for_request, false);
                }
            }
        };

        let request = {
            let mut buf = buffer.lock();
            if op == IoOp::Write {
                // The request owns flushing this buffer now.
                buf.dirty = false;
            }
            Request {
                dev,
                cmd: op,
                errors: 0,
                sector: buf.block * SECTORS_PER_BLOCK as u64,
                nr_sectors: SECTORS_PER_BLOCK,
                offset: 0,
                buffer: buffer.clone(),
                waiting: WaitChannel::new(),
                next: None,
            }
        };
        self.add_request(driver, slot, request);
    }

    /// Link `request` into its device's chain, or start the device if it
    /// was idle.
    fn add_request(&mut self, driver: &mut dyn BlockDriver, slot: usize, request: Request) {
        let dev = request.dev;
        let key = (request.dev, request.sector);

        let started_idle = interrupts::critical(|| {
            self.slots[slot] = Some(request);
            let head = match self.current[dev] {
                None => {
                    self.current[dev] = Some(slot);
                    return true;
                }
                Some(head) => head,
            };

            // Walk the chain for the first position that keeps the
            // seek-minimizing order, and splice in after it.
            let order = self.order;
            let mut at = head;
            loop {
                let at_key = {
                    let r = self.request(at);
                    (r.dev, r.sector)
                };
                match self.request(at).next {
                    None => {
                        self.request_mut(at).next = Some(slot);
                        break;
                    }
                    Some(next) => {
                        let next_key = {
                            let r = self.request(next);
                            (r.dev, r.sector)
                        };
                        if (order(at_key, key) || !order(at_key, next_key))
                            && order(key, next_key)
                        {
                            self.request_mut(slot).next = Some(next);
                            self.request_mut(at).next = Some(slot);
                            break;
                        }
                        at = next;
                    }
                }
            }
            false
        });

        if started_idle {
            driver.start(self);
        }
    }

    /// Retire `dev`'s in-flight request: mark the buffer, drop its lock,
    /// wake everyone concerned and advance the chain.
    pub fn end_request(&mut self, dev: usize, uptodate: bool) {
        let index = self.current[dev].expect("end_request on an idle device");
        let request = self.slots[index].take().expect("current slot is empty");
        {
            let mut buf = request.buffer.lock();
            buf.uptodate = uptodate;
            if !uptodate {
                crate::log_warn!("I/O error on dev {}, block {}", dev, buf.block);
            }
            buf.locked = false;
            sched::wake_up(&buf.wait);
        }
        sched::wake_up(&request.waiting);
        self.current[dev] = request.next;
        sched::wake_up(&self.wait_for_request);
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Pin `buffer` for an I/O request, sleeping while somebody else holds it.
/// The check and the sleep registration run with interrupts masked so the
/// unlocking interrupt cannot slip between them.
fn lock_buffer(buffer: &BufferRef) {
    interrupts::critical(|| loop {
        let wait = {
            let mut buf = buffer.lock();
            if !buf.locked {
                buf.locked = true;
                return;
            }
            buf.wait.clone()
        };
        sched::block_current_on(&wait, false);
    })
}

fn unlock_buffer(buffer: &BufferRef) {
    let mut buf = buffer.lock();
    if !buf.locked {
        crate::log_warn!("unlock_buffer: buffer not locked");
    }
    buf.locked = false;
    sched::wake_up(&buf.wait);
}

lazy_static! {
    pub static ref REQUEST_QUEUE: Mutex<RequestQueue> = Mutex::new(RequestQueue::new());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::buffer::BufferHead;

    /// Driver double: counts starts, never completes anything on its own.
    #[derive(Default)]
    struct RecordingDriver {
        starts: usize,
    }

    impl BlockDriver for RecordingDriver {
        fn start(&mut self, _queue: &mut RequestQueue) {
            self.starts += 1;
        }
    }

    fn dirty_buffer(block: u64) -> BufferRef {
        let buffer = BufferHead::new(DEV_HD, block);
        buffer.lock().dirty = true;
        buffer
    }

    #[test]
    fn idle_device_starts_synchronously_busy_device_queues() {
        let mut queue = RequestQueue::new();
        let mut driver = RecordingDriver::default();

        let first = dirty_buffer(10);
        queue.ll_rw(&mut driver, IoOp::Write, &first);
        assert_eq!(driver.starts, 1); // started inside the call
        let head = queue.current_request(DEV_HD).unwrap();

        let second = dirty_buffer(20);
        queue.ll_rw(&mut driver, IoOp::Write, &second);
        assert_eq!(driver.starts, 1); // linked, not started
        assert_eq!(queue.current_request(DEV_HD), Some(head));
        assert!(queue.request(head).next.is_some());
    }

    #[test]
    fn chain_after_the_head_is_kept_in_sector_order() {
        let mut queue = RequestQueue::new();
        let mut driver = RecordingDriver::default();

        for block in [50, 30, 40, 10] {
            queue.ll_rw(&mut driver, IoOp::Write, &dirty_buffer(block));
        }

        // Head is whatever arrived first (in flight); the rest sorted.
        let mut sectors = alloc::vec::Vec::new();
        let mut at = queue.current_request(DEV_HD);
        while let Some(index) = at {
            let r = queue.request(index);
            sectors.push(r.sector);
            at = r.next;
        }
        assert_eq!(sectors[0], 100); // block 50, first in
        let tail = &sectors[1..];
        assert_eq!(tail, &[20, 60, 80]); // blocks 10, 30, 40 in seek order
    }

    #[test]
    fn writes_clear_dirty_and_satisfied_requests_never_queue() {
        let mut queue = RequestQueue::new();
        let mut driver = RecordingDriver::default();

        let dirty = dirty_buffer(5);
        queue.ll_rw(&mut driver, IoOp::Write, &dirty);
        assert!(!dirty.lock().dirty); // the request owns the flush now

        // Clean buffer: write has nothing to do.
        let clean = BufferHead::new(DEV_HD, 6);
        queue.ll_rw(&mut driver, IoOp::Write, &clean);
        assert!(!clean.lock().locked);

        // Up-to-date buffer: read has nothing to do.
        let fresh = BufferHead::new(DEV_HD, 7);
        fresh.lock().uptodate = true;
        queue.ll_rw(&mut driver, IoOp::Read, &fresh);
        assert!(!fresh.lock().locked);

        assert_eq!(queue.pending_requests(), 1);
    }

    #[test]
    fn ahead_requests_drop_on_a_locked_buffer() {
        let mut queue = RequestQueue::new();
        let mut driver = RecordingDriver::default();

        let buffer = dirty_buffer(5);
        buffer.lock().locked = true;
        queue.ll_rw(&mut driver, IoOp::WriteAhead, &buffer);
        assert_eq!(queue.pending_requests(), 0);
        assert_eq!(driver.starts, 0);
    }

    #[test]
    fn writes_are_capped_to_two_thirds_of_the_pool() {
        let mut queue = RequestQueue::new();
        let mut driver = RecordingDriver::default();

        // Fill every write-eligible slot.
        for block in 0..(NR_REQUEST * 2 / 3) as u64 {
            queue.ll_rw(&mut driver, IoOp::Write, &dirty_buffer(block));
        }
        assert_eq!(queue.pending_requests(), NR_REQUEST * 2 / 3);

        // One more best-effort write finds no slot and gives up.
        let spilled = dirty_buffer(99);
        queue.ll_rw(&mut driver, IoOp::WriteAhead, &spilled);
        assert_eq!(queue.pending_requests(), NR_REQUEST * 2 / 3);
        assert!(!spilled.lock().locked); // released on the way out

        // A read still fits: the top third is reserved for it.
        let read = BufferHead::new(DEV_HD, 100);
        queue.ll_rw(&mut driver, IoOp::ReadAhead, &read);
        assert_eq!(queue.pending_requests(), NR_REQUEST * 2 / 3 + 1);
    }

    #[test]
    fn end_request_releases_wakes_and_advances() {
        let mut queue = RequestQueue::new();
        let mut driver = RecordingDriver::default();

        let first = dirty_buffer(10);
        let second = dirty_buffer(20);
        queue.ll_rw(&mut driver, IoOp::Write, &first);
        queue.ll_rw(&mut driver, IoOp::Write, &second);
        let slot_waiters_before = queue.wait_for_request.wakeups();

        queue.end_request(DEV_HD, true);

        let buf = first.lock();
        assert!(buf.uptodate);
        assert!(!buf.locked);
        assert_eq!(buf.wait.wakeups(), 1);
        drop(buf);

        // The chain advanced to the second request, the slot pool was
        // signalled.
        let head = queue.current_request(DEV_HD).unwrap();
        assert_eq!(queue.request(head).sector, 40);
        assert_eq!(queue.wait_for_request.wakeups(), slot_waiters_before + 1);
        assert!(second.lock().locked); // still pinned by its request
    }
}
