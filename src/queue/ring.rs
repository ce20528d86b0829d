//! Fixed-capacity single-producer single-consumer report ring.
//!
//! The producer side is the multiplexer, which serializes writers per
//! client; the consumer side is the client's drain handle. Capacity is
//! fixed at creation; entries are POD [`AccessReport`] values copied in
//! and out whole.

use crate::types::{monotonic_ns, AccessReport, REPORT_WIRE_SIZE};
use crossbeam_channel::Sender;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Entries a queue of `mib` MiB holds: `floor(mib * 1 MiB / report size)`.
pub fn queue_capacity_for_mib(mib: u32) -> usize {
    (mib as usize * (1 << 20)) / REPORT_WIRE_SIZE
}

pub struct ReportRing {
    slots: Box<[UnsafeCell<MaybeUninit<AccessReport>>]>,
    capacity: usize,
    /// Next slot the consumer reads; only the consumer advances it.
    head: AtomicUsize,
    /// Next slot the producer writes; only the producer advances it.
    tail: AtomicUsize,
}

unsafe impl Sync for ReportRing {}

impl ReportRing {
    pub fn with_capacity(capacity: usize) -> ReportRing {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));
        ReportRing {
            slots: slots.into_boxed_slice(),
            capacity,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Producer side. Returns false when the ring is full.
    pub fn try_push(&self, report: &AccessReport) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.capacity {
            return false;
        }
        let slot = &self.slots[tail % self.capacity];
        unsafe { (*slot.get()).write(*report) };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer side. Returns a copy of the oldest entry, if any.
    pub fn try_pop(&self) -> Option<AccessReport> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let slot = &self.slots[head % self.capacity];
        let report = unsafe { (*slot.get()).assume_init_read() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(report)
    }
}

/// One shared report queue: the ring, its notification port, the dequeue
/// clock the starvation watchdog reads, and the unrecoverable-failure
/// latch.
pub struct SharedReportQueue {
    ring: ReportRing,
    notify: Mutex<Option<Sender<()>>>,
    /// Monotonic time of the last successful dequeue (creation time until
    /// then).
    last_dequeue_ns: AtomicU64,
    /// Set when the queue is taken out of service (client starvation or
    /// teardown); enqueues fail afterwards.
    failed: AtomicBool,
}

impl SharedReportQueue {
    pub fn with_capacity(capacity: usize) -> SharedReportQueue {
        SharedReportQueue {
            ring: ReportRing::with_capacity(capacity),
            notify: Mutex::new(None),
            last_dequeue_ns: AtomicU64::new(monotonic_ns()),
            failed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn set_notification_port(&self, port: Sender<()>) {
        if let Ok(mut notify) = self.notify.lock() {
            *notify = Some(port);
        }
    }

    pub fn has_notification_port(&self) -> bool {
        self.notify.lock().map(|n| n.is_some()).unwrap_or(false)
    }

    /// Producer side; stamps nothing. Fails when full or failed.
    pub fn enqueue(&self, report: &AccessReport) -> bool {
        if self.failed.load(Ordering::Acquire) {
            return false;
        }
        if !self.ring.try_push(report) {
            return false;
        }
        if let Ok(notify) = self.notify.lock() {
            if let Some(port) = notify.as_ref() {
                // Wake the consumer; a full wakeup channel already has a
                // pending wakeup, which is all the consumer needs.
                let _ = port.try_send(());
            }
        }
        true
    }

    /// Consumer side; stamps `dequeue_ns` and feeds the dequeue clock.
    pub fn dequeue(&self) -> Option<AccessReport> {
        let mut report = self.ring.try_pop()?;
        let now = monotonic_ns();
        report.dequeue_ns = now;
        self.last_dequeue_ns.store(now, Ordering::Release);
        Some(report)
    }

    pub fn last_dequeue_ns(&self) -> u64 {
        self.last_dequeue_ns.load(Ordering::Acquire)
    }

    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccessStatus, Operation, ReasonCode, RequestedAccess};
    use libc::pid_t;

    fn report(pid: pid_t) -> AccessReport {
        AccessReport::new(
            Operation::Read,
            RequestedAccess::READ,
            AccessStatus::Allowed,
            ReasonCode::AllowedByScope,
            1,
            10,
            20,
            pid,
            b"/tmp/file",
        )
    }

    #[test]
    fn test_capacity_formula() {
        assert_eq!(queue_capacity_for_mib(1), (1 << 20) / REPORT_WIRE_SIZE);
        assert_eq!(queue_capacity_for_mib(16), 16 * (1 << 20) / REPORT_WIRE_SIZE);
    }

    #[test]
    fn test_ring_is_fifo() {
        let ring = ReportRing::with_capacity(8);
        for pid in 0..5 {
            assert!(ring.try_push(&report(pid)));
        }
        for pid in 0..5 {
            assert_eq!(ring.try_pop().unwrap().pid, pid);
        }
        assert!(ring.try_pop().is_none());
    }

    #[test]
    fn test_ring_rejects_when_full() {
        let ring = ReportRing::with_capacity(2);
        assert!(ring.try_push(&report(1)));
        assert!(ring.try_push(&report(2)));
        assert!(!ring.try_push(&report(3)));
        assert!(ring.try_pop().is_some());
        assert!(ring.try_push(&report(3)));
    }

    #[test]
    fn test_ring_wraps_around() {
        let ring = ReportRing::with_capacity(3);
        for round in 0..10 {
            assert!(ring.try_push(&report(round)));
            assert_eq!(ring.try_pop().unwrap().pid, round);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_dequeue_stamps_time_and_clock() {
        let queue = SharedReportQueue::with_capacity(4);
        let before = queue.last_dequeue_ns();
        assert!(queue.enqueue(&report(1)));
        let popped = queue.dequeue().unwrap();
        assert!(popped.dequeue_ns >= before);
        assert!(queue.last_dequeue_ns() >= before);
    }

    #[test]
    fn test_failed_queue_rejects_enqueues() {
        let queue = SharedReportQueue::with_capacity(4);
        queue.mark_failed();
        assert!(!queue.enqueue(&report(1)));
    }

    #[test]
    fn test_notification_port_signaled_on_enqueue() {
        let queue = SharedReportQueue::with_capacity(4);
        let (tx, rx) = crossbeam_channel::bounded(1);
        queue.set_notification_port(tx);
        assert!(queue.enqueue(&report(1)));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_spsc_transfer_across_threads() {
        use std::sync::Arc;
        let queue = Arc::new(SharedReportQueue::with_capacity(64));
        let producer_queue = Arc::clone(&queue);
        let producer = std::thread::spawn(move || {
            let mut sent = 0;
            while sent < 1000 {
                if producer_queue.enqueue(&report(sent)) {
                    sent += 1;
                }
            }
        });
        let mut received = 0;
        while received < 1000 {
            if let Some(popped) = queue.dequeue() {
                assert_eq!(popped.pid, received);
                received += 1;
            }
        }
        producer.join().unwrap();
    }
}
