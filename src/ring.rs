//! Bounded lock-free ring from the measurement engine to the consumer.
//!
//! Single producer (the tracer, on the measured CPU), single consumer
//! (user space). Publication is release/acquire so a consumer never
//! observes a partially written record. The producer never blocks: when
//! the ring is full the record is dropped, a warn is logged and a drop
//! counter incremented — drops are expected under pressure and must not
//! disturb the engine state machine. An eventfd doorbell lets the
//! consumer block instead of spinning.

use std::cell::UnsafeCell;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use plain::Plain;
use tracing::warn;

use crate::cstates::MAX_CSTATES;

/// Driver-specific u64 fields a record can carry.
pub const MAX_DRV_FIELDS: usize = 8;

/// Default ring capacity in records.
pub const DEFAULT_RING_SLOTS: usize = 4096;

/// Record types.
pub const REC_DATA: u32 = 1;
/// Zero-data marker: tells the consumer to wake the measured CPU out of
/// the POLL state.
pub const REC_PING: u32 = 2;

/// One datapoint as it crosses the ring. Fixed size, linear field layout;
/// the same bytes are the synthetic-event wire encoding. C-state and
/// driver field names are run constants kept in the field schema, not
/// here.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub rec_type: u32,
    pub req_cstate: u32,
    pub silent_time: u64,
    pub wake_latency: u64,
    pub intr_latency: u64,
    pub ldist: u64,
    pub tsc_cycles: u64,
    pub mperf_cycles: u64,
    pub smi_wake: u64,
    pub nmi_wake: u64,
    pub smi_intr: u64,
    pub nmi_intr: u64,
    pub nr_cstates: u32,
    pub nr_drv: u32,
    pub cc_cyc: [u64; MAX_CSTATES],
    pub drv_vals: [u64; MAX_DRV_FIELDS],
}

unsafe impl Plain for Record {}

impl Default for Record {
    fn default() -> Self {
        Record {
            rec_type: REC_DATA,
            req_cstate: 0,
            silent_time: 0,
            wake_latency: 0,
            intr_latency: 0,
            ldist: 0,
            tsc_cycles: 0,
            mperf_cycles: 0,
            smi_wake: 0,
            nmi_wake: 0,
            smi_intr: 0,
            nmi_intr: 0,
            nr_cstates: 0,
            nr_drv: 0,
            cc_cyc: [0; MAX_CSTATES],
            drv_vals: [0; MAX_DRV_FIELDS],
        }
    }
}

impl Record {
    pub fn ping() -> Record {
        Record {
            rec_type: REC_PING,
            ..Default::default()
        }
    }

    pub fn is_ping(&self) -> bool {
        self.rec_type == REC_PING
    }
}

/// Padding against false sharing between the producer- and
/// consumer-written indices.
#[repr(C, align(128))]
struct CachePadded<T> {
    value: T,
}

struct RingShared {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    mask: usize,
    capacity: usize,
    slots: Box<[UnsafeCell<Record>]>,
    dropped: AtomicU64,
    doorbell: OwnedFd,
}

// One thread writes slots through head, one reads through tail; the
// indices carry the synchronization.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

fn eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Create a ring of at least `capacity` records (rounded up to a power of
/// two).
pub fn datapoint_ring(capacity: usize) -> io::Result<(RingProducer, RingConsumer)> {
    let capacity = capacity.max(2).next_power_of_two();
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(Record::default()))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let shared = Arc::new(RingShared {
        head: CachePadded {
            value: AtomicUsize::new(0),
        },
        tail: CachePadded {
            value: AtomicUsize::new(0),
        },
        mask: capacity - 1,
        capacity,
        slots,
        dropped: AtomicU64::new(0),
        doorbell: eventfd()?,
    });

    Ok((
        RingProducer {
            shared: shared.clone(),
            cached_tail: 0,
        },
        RingConsumer {
            shared,
            cached_head: 0,
        },
    ))
}

/// Producer half. Lives inside the tracer.
pub struct RingProducer {
    shared: Arc<RingShared>,
    cached_tail: usize,
}

impl RingProducer {
    /// Reserve-and-publish one record. Returns false (and counts a drop)
    /// when the ring is full. Never blocks.
    pub fn try_push(&mut self, rec: &Record) -> bool {
        let head = self.shared.head.value.load(Ordering::Relaxed);
        if head.wrapping_sub(self.cached_tail) >= self.shared.capacity {
            self.cached_tail = self.shared.tail.value.load(Ordering::Acquire);
            if head.wrapping_sub(self.cached_tail) >= self.shared.capacity {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("event ring overflow, record dropped");
                return false;
            }
        }

        unsafe {
            *self.shared.slots[head & self.shared.mask].get() = *rec;
        }
        self.shared.head.value.store(head.wrapping_add(1), Ordering::Release);
        self.ring_doorbell();
        true
    }

    /// Total records dropped due to overflow.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    fn ring_doorbell(&self) {
        let val: u64 = 1;
        let _ = unsafe {
            libc::write(
                self.shared.doorbell.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            )
        };
    }
}

/// Consumer half. Lives in user space, may block.
pub struct RingConsumer {
    shared: Arc<RingShared>,
    cached_head: usize,
}

impl RingConsumer {
    /// Non-blocking pop.
    pub fn try_pop(&mut self) -> Option<Record> {
        let tail = self.shared.tail.value.load(Ordering::Relaxed);
        if self.cached_head == tail {
            self.cached_head = self.shared.head.value.load(Ordering::Acquire);
            if self.cached_head == tail {
                return None;
            }
        }

        let rec = unsafe { *self.shared.slots[tail & self.shared.mask].get() };
        self.shared.tail.value.store(tail.wrapping_add(1), Ordering::Release);
        Some(rec)
    }

    /// Blocking pop with a timeout.
    pub fn pop_wait(&mut self, timeout: Duration) -> Option<Record> {
        if let Some(rec) = self.try_pop() {
            return Some(rec);
        }

        let mut pfd = libc::pollfd {
            fd: self.shared.doorbell.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
        if ret > 0 {
            self.drain_doorbell();
        }
        self.try_pop()
    }

    /// Drain whatever is buffered, without blocking.
    pub fn drain(&mut self) -> Vec<Record> {
        let mut out = Vec::new();
        while let Some(rec) = self.try_pop() {
            out.push(rec);
        }
        out
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn doorbell_fd(&self) -> RawFd {
        self.shared.doorbell.as_raw_fd()
    }

    fn drain_doorbell(&self) {
        let mut val: u64 = 0;
        let _ = unsafe {
            libc::read(
                self.shared.doorbell.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                8,
            )
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(ldist: u64) -> Record {
        Record {
            ldist,
            ..Default::default()
        }
    }

    #[test]
    fn test_fifo_order() {
        let (mut prod, mut cons) = datapoint_ring(8).unwrap();
        for i in 0..5 {
            assert!(prod.try_push(&rec(i)));
        }
        for i in 0..5 {
            assert_eq!(cons.try_pop().unwrap().ldist, i);
        }
        assert!(cons.try_pop().is_none());
    }

    #[test]
    fn test_overflow_drops_and_recovers() {
        let (mut prod, mut cons) = datapoint_ring(4).unwrap();
        for i in 0..4 {
            assert!(prod.try_push(&rec(i)));
        }
        // Full: further pushes are dropped, counted, and harmless.
        assert!(!prod.try_push(&rec(100)));
        assert!(!prod.try_push(&rec(101)));
        assert_eq!(prod.dropped(), 2);

        // Drain, then the ring works again and order is intact.
        let drained = cons.drain();
        assert_eq!(drained.len(), 4);
        assert_eq!(drained[0].ldist, 0);
        assert_eq!(drained[3].ldist, 3);

        assert!(prod.try_push(&rec(200)));
        assert_eq!(cons.try_pop().unwrap().ldist, 200);
        assert_eq!(cons.dropped(), 2);
    }

    #[test]
    fn test_pop_wait_times_out() {
        let (_prod, mut cons) = datapoint_ring(4).unwrap();
        let start = std::time::Instant::now();
        assert!(cons.pop_wait(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_pop_wait_wakes_on_push() {
        let (mut prod, mut cons) = datapoint_ring(4).unwrap();
        let handle = std::thread::spawn(move || cons.pop_wait(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(10));
        assert!(prod.try_push(&rec(42)));
        let got = handle.join().unwrap();
        assert_eq!(got.unwrap().ldist, 42);
    }

    #[test]
    fn test_threaded_stream() {
        let (mut prod, mut cons) = datapoint_ring(64).unwrap();
        let producer = std::thread::spawn(move || {
            let mut sent = 0u64;
            for i in 0..10_000 {
                if prod.try_push(&rec(i)) {
                    sent += 1;
                }
            }
            (prod, sent)
        });

        let mut got = Vec::new();
        loop {
            match cons.pop_wait(Duration::from_millis(200)) {
                Some(r) => got.push(r.ldist),
                None => break,
            }
        }
        let (prod, sent) = producer.join().unwrap();
        // Everything that was accepted arrives, in order.
        assert_eq!(got.len() as u64, sent);
        assert!(got.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(sent + prod.dropped(), 10_000);
    }

    #[test]
    fn test_ping_record() {
        let ping = Record::ping();
        assert!(ping.is_ping());
        assert_eq!(ping.silent_time, 0);
        assert_eq!(ping.nr_cstates, 0);
    }
}
