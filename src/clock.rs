//! Time sources for the measurement engine.
//!
//! Two time bases are in play: the boot-stable nanosecond clock
//! (`CLOCK_BOOTTIME`), which is the primary timebase for all launch-time
//! arithmetic, and the TSC, which is used for cycle accounting and for
//! self-profiling the `after_idle` overhead. The TSC read path may fail
//! transiently; see [`check_count`] for the failure convention.

use tracing::warn;

/// Largest magnitude of the transient-error sentinel range. A raw counter
/// value which, reinterpreted as `i64`, falls in `[-TSC_ERR_MAX, -1)` is a
/// failed read, not a count.
pub const TSC_ERR_MAX: i64 = 512;

/// Read a clock via `clock_gettime` and return nanoseconds, 0 on failure.
pub fn clock_value(clock_id: libc::c_int) -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(clock_id, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64 * 1_000_000_000) + ts.tv_nsec as u64
}

/// Monotonic boot-time nanosecond count. Primary timebase for `ltime`,
/// `tbi`, `tai` and `tintr`.
#[inline]
pub fn now_ns() -> u64 {
    clock_value(libc::CLOCK_BOOTTIME)
}

/// Resolution of the monotonic clock in nanoseconds. Used as the launch
/// distance granularity of timerfd-backed devices.
pub fn monotonic_resolution_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_getres(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 1;
    }
    ((ts.tv_sec as u64 * 1_000_000_000) + ts.tv_nsec as u64).max(1)
}

/// Read the time stamp counter.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn read_tsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub fn read_tsc() -> u64 {
    // No architectural cycle counter we can read from user-space without
    // kernel help; fall back to the nanosecond clock so deltas stay
    // meaningful.
    now_ns()
}

/// Apply the transient-failure convention to a raw counter read.
///
/// Counter reads that go through the perf-event layer report errors by
/// returning the negated errno as an unsigned value. Treat anything in the
/// sentinel range as "no data": warn once per occurrence and return 0.
/// Callers keep the datapoint; a zero delta is visible downstream.
pub fn check_count(raw: u64) -> u64 {
    let signed = raw as i64;
    if signed >= -TSC_ERR_MAX && signed < 0 {
        warn!("transient counter read error: {}", signed);
        return 0;
    }
    raw
}

/// TSC frequency estimate for cycles-to-nanoseconds conversion.
///
/// The engine only needs this for the `ai_overhead` self-profiling term,
/// so a one-shot calibration against the nanosecond clock is plenty.
#[derive(Debug, Clone, Copy)]
pub struct TscRate {
    khz: u64,
}

impl TscRate {
    /// Calibrate by sampling TSC against the boot clock over `window_us`
    /// microseconds.
    pub fn calibrate(window_us: u64) -> TscRate {
        let t0 = now_ns();
        let c0 = read_tsc();
        let ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: (window_us * 1000) as libc::c_long,
        };
        unsafe { libc::nanosleep(&ts, std::ptr::null_mut()) };
        let t1 = now_ns();
        let c1 = read_tsc();

        let ns = t1.saturating_sub(t0).max(1);
        let cyc = c1.wrapping_sub(c0);
        // cycles per millisecond == kHz
        TscRate {
            khz: (cyc.saturating_mul(1_000_000) / ns).max(1),
        }
    }

    /// Construct from a known frequency, for tests and for devices that
    /// report their own rate.
    pub fn from_khz(khz: u64) -> TscRate {
        TscRate { khz: khz.max(1) }
    }

    pub fn khz(&self) -> u64 {
        self.khz
    }

    /// Convert a TSC cycle count to nanoseconds.
    pub fn cyc_to_ns(&self, cyc: u64) -> u64 {
        // cyc / khz gives microseconds at kHz; scale first to keep
        // precision for the small deltas this is used on.
        cyc.saturating_mul(1_000_000) / self.khz
    }
}
