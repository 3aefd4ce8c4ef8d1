//! Delayed-event sources.
//!
//! A delayed-event source can arm a wake event a requested number of
//! nanoseconds in the future, report whether the armed event has fired,
//! and hand out the timestamps the tracer correlates. The engine is
//! generic over the concrete source so the per-datapoint path is
//! monomorphized; the variant is picked once, at enable time.

pub mod bpf;
pub mod hrt;

use std::io;
use std::mem;
use std::thread::JoinHandle;

use anyhow::Result;

use crate::clock;
use crate::cstates::CycleSource;
use crate::engine::IrqDispatch;

pub use bpf::BpfTimer;
pub use hrt::HrtTimer;

/// Hard ceiling on the launch distance, 20 ms.
pub const LDIST_MAX: u64 = 20_000_000;

/// Tagged device variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// High-resolution timer device. Idle cycles are strictly paired and
    /// the POLL state is not measured.
    Hrt,
    /// Sandbox-style timer device with perf-event counter reads. Handles
    /// POLL via the ping path.
    Bpf,
}

impl DeviceKind {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceKind::Hrt => "wult_hrt",
            DeviceKind::Bpf => "wult_bpf",
        }
    }
}

/// Capability set every delayed-event source implements.
///
/// `arm` must stamp the launch time together with arming and never block.
/// `event_has_happened` may return a false negative only while the launch
/// time is still in the future.
pub trait DelayedEvent: Send + 'static {
    fn kind(&self) -> DeviceKind;

    /// Acquire resources and spawn the interrupt thread, if the device
    /// has one. The returned handle is joined by the engine at disable,
    /// after `cancel`.
    fn init(&mut self, irq: IrqDispatch<Self>) -> Result<Option<JoinHandle<()>>>
    where
        Self: Sized;

    /// Disarm and tell the interrupt thread to exit. Non-blocking; the
    /// engine joins the thread afterwards, outside its lock.
    fn cancel(&mut self);

    /// Release resources. Called after the interrupt thread is joined.
    fn exit(&mut self);

    /// Arm a wake event `ldist` nanoseconds from now. Returns the
    /// absolute launch time stamped atomically with the arming.
    fn arm(&mut self, ldist: u64) -> Result<u64>;

    /// Whether the most recently armed event has fired.
    fn event_has_happened(&self) -> bool;

    /// Launch time stamped by the most recent successful `arm`.
    fn launch_time(&self) -> u64;

    fn time_before_idle(&mut self) -> u64 {
        clock::now_ns()
    }

    fn time_after_idle(&mut self) -> u64 {
        clock::now_ns()
    }

    /// Convert a device-native duration to nanoseconds. Identity for
    /// devices whose timestamps are already nanoseconds.
    fn time_to_ns(&self, t: u64) -> u64 {
        t
    }

    /// Names of the driver-specific datapoint fields, in emission order.
    fn trace_field_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Values of the driver-specific fields for the current datapoint,
    /// index-aligned with `trace_field_names`.
    fn trace_data(&mut self) -> Vec<u64> {
        Vec::new()
    }

    /// Which source the counter bank should use for TSC/MPERF totals.
    fn cycle_source(&self) -> CycleSource {
        CycleSource::Rdtsc
    }

    fn ldist_min(&self) -> u64 {
        1
    }

    fn ldist_max(&self) -> u64 {
        LDIST_MAX
    }

    /// Launch distance granularity in nanoseconds.
    fn ldist_gran(&self) -> u64 {
        1
    }
}

/// Pin the calling thread to one CPU. The measure loop and every device
/// interrupt thread run pinned to the measured CPU so all sample points
/// execute there.
pub fn pin_thread_to_cpu(cpu: u32) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_SET(cpu as usize, &mut set);
        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
