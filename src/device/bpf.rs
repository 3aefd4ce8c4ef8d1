//! Sandbox-style timer delayed-event source.
//!
//! User-space rendition of the in-kernel sandboxed timer program. The
//! structure of that program carries over: a fixed-size perf counter
//! array (slot 0 TSC, slot 1 MPERF), a timer callback that runs on an
//! absolute deadline, bounded loops over the counter slots, and a warn
//! channel for non-fatal conditions. The record layout the tracer emits
//! is unchanged from the sandbox one: linear fields plus the counter
//! array tail.
//!
//! The timer callback runs on a dedicated thread pinned to the measured
//! CPU, sleeping until the armed deadline. Extra counters beyond the two
//! fixed slots surface as driver-specific datapoint fields.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::{pin_thread_to_cpu, DelayedEvent, DeviceKind, LDIST_MAX};
use crate::clock::{self, check_count};
use crate::cstates::CycleSource;
use crate::engine::IrqDispatch;
use crate::perf::PerfCounterArray;
use crate::ring::MAX_DRV_FIELDS;

struct BpfShared {
    /// Absolute deadline in boot ns; 0 when idle.
    deadline: AtomicU64,
    armed: AtomicBool,
    fired: AtomicBool,
    shutdown: AtomicBool,
    /// Wakes the timer thread when a deadline is set or shutdown begins.
    kick: Mutex<()>,
    kick_cv: Condvar,
}

pub struct BpfTimer {
    cpu: u32,
    perf: Arc<PerfCounterArray>,
    sh: Arc<BpfShared>,
    ltime: u64,
    /// Before-idle snapshot of the extra counter slots (2..), and the
    /// deltas computed on idle exit. Bounded by the fixed array size.
    extra_before: Vec<u64>,
    extra_delta: Vec<u64>,
}

impl BpfTimer {
    pub fn new(cpu: u32) -> Result<BpfTimer> {
        let perf = PerfCounterArray::open(cpu)
            .with_context(|| format!("failed to open perf counter array on cpu {}", cpu))?;
        let extras = perf.len().saturating_sub(2).min(MAX_DRV_FIELDS);
        Ok(BpfTimer {
            cpu,
            perf: Arc::new(perf),
            sh: Arc::new(BpfShared {
                deadline: AtomicU64::new(0),
                armed: AtomicBool::new(false),
                fired: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                kick: Mutex::new(()),
                kick_cv: Condvar::new(),
            }),
            ltime: 0,
            extra_before: vec![0; extras],
            extra_delta: vec![0; extras],
        })
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }
}

fn sleep_until(deadline: u64) {
    loop {
        let now = clock::now_ns();
        if now >= deadline {
            return;
        }
        let remaining = deadline - now;
        let ts = libc::timespec {
            tv_sec: (remaining / 1_000_000_000) as libc::time_t,
            tv_nsec: (remaining % 1_000_000_000) as libc::c_long,
        };
        unsafe { libc::nanosleep(&ts, std::ptr::null_mut()) };
    }
}

/// The timer callback loop, the analog of the sandbox timer entry point.
fn timer_loop(sh: Arc<BpfShared>, irq: IrqDispatch<BpfTimer>, cpu: u32) {
    if let Err(err) = pin_thread_to_cpu(cpu) {
        warn!("failed to pin bpf timer thread to cpu {}: {}", cpu, err);
    }

    loop {
        {
            let mut guard = sh.kick.lock().unwrap();
            while !sh.armed.load(Ordering::Acquire) && !sh.shutdown.load(Ordering::Acquire) {
                let (g, _) = sh
                    .kick_cv
                    .wait_timeout(guard, Duration::from_millis(100))
                    .unwrap();
                guard = g;
            }
        }
        if sh.shutdown.load(Ordering::Acquire) {
            break;
        }

        let deadline = sh.deadline.load(Ordering::Acquire);
        sleep_until(deadline);

        // The arm may have been cancelled while we slept.
        if sh.shutdown.load(Ordering::Acquire) {
            break;
        }
        if !sh.armed.swap(false, Ordering::AcqRel) {
            continue;
        }

        sh.fired.store(true, Ordering::Release);
        irq.interrupt();
    }
    debug!("bpf timer thread exiting");
}

impl DelayedEvent for BpfTimer {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Bpf
    }

    fn init(&mut self, irq: IrqDispatch<BpfTimer>) -> Result<Option<JoinHandle<()>>> {
        // A previous disable leaves the shutdown flag set.
        self.sh.shutdown.store(false, Ordering::Release);
        let sh = self.sh.clone();
        let cpu = self.cpu;
        let handle = std::thread::Builder::new()
            .name("wult-bpf-timer".into())
            .spawn(move || timer_loop(sh, irq, cpu))
            .context("failed to spawn bpf timer thread")?;
        Ok(Some(handle))
    }

    fn cancel(&mut self) {
        self.sh.armed.store(false, Ordering::Release);
        self.sh.shutdown.store(true, Ordering::Release);
        let _guard = self.sh.kick.lock().unwrap();
        self.sh.kick_cv.notify_all();
    }

    fn exit(&mut self) {
        // The perf fds disable and close on drop.
    }

    fn arm(&mut self, ldist: u64) -> Result<u64> {
        self.sh.fired.store(false, Ordering::Release);
        let deadline = clock::now_ns() + ldist;
        self.sh.deadline.store(deadline, Ordering::Release);
        self.sh.armed.store(true, Ordering::Release);
        {
            let _guard = self.sh.kick.lock().unwrap();
            self.sh.kick_cv.notify_all();
        }
        self.ltime = deadline;
        Ok(deadline)
    }

    fn event_has_happened(&self) -> bool {
        self.sh.fired.load(Ordering::Acquire)
    }

    fn launch_time(&self) -> u64 {
        self.ltime
    }

    fn time_before_idle(&mut self) -> u64 {
        // Snapshot the extra counter slots; the fixed TSC/MPERF slots are
        // read by the counter bank through the same array.
        for (i, slot) in self.extra_before.iter_mut().enumerate() {
            *slot = check_count(self.perf.read_slot(i + 2));
        }
        clock::now_ns()
    }

    fn time_after_idle(&mut self) -> u64 {
        for (i, delta) in self.extra_delta.iter_mut().enumerate() {
            let now = check_count(self.perf.read_slot(i + 2));
            let before = self.extra_before[i];
            *delta = if now == 0 || before == 0 || now < before {
                0
            } else {
                now - before
            };
        }
        clock::now_ns()
    }

    fn trace_field_names(&self) -> Vec<String> {
        self.perf
            .names()
            .iter()
            .skip(2)
            .take(MAX_DRV_FIELDS)
            .map(|name| {
                let mut upper = name.to_uppercase();
                upper.push_str("Cyc");
                upper
            })
            .collect()
    }

    fn trace_data(&mut self) -> Vec<u64> {
        self.extra_delta.clone()
    }

    fn cycle_source(&self) -> CycleSource {
        CycleSource::Perf(self.perf.clone())
    }

    fn ldist_max(&self) -> u64 {
        LDIST_MAX
    }

    fn ldist_gran(&self) -> u64 {
        clock::monotonic_resolution_ns()
    }
}
