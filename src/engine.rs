//! Engine loop: coordinates the delayed-event source, the idle tracer and
//! the event ring.
//!
//! The measure thread is pinned to the target CPU and plays the idle
//! loop: it arms an event, runs the idle-entry sample point, blocks on the
//! idle gate ("enters idle") and runs the idle-exit sample point when the
//! gate wakes it. The device's interrupt thread stamps the interrupt time
//! the moment the event fires, wakes the gate, and for non-POLL states
//! defers the rest of the interrupt stage until the idle-exit path has
//! finished, mirroring the masked-interrupt window of a real idle exit.
//!
//! Re-arming happens after every emission; the launch distance is drawn
//! uniformly from the configured range on every kick.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::clock::{self, TscRate};
use crate::cstates::CstateBank;
use crate::device::{pin_thread_to_cpu, DelayedEvent, DeviceKind};
use crate::encode::FieldSchema;
use crate::ring::{datapoint_ring, Record, RingConsumer, DEFAULT_RING_SLOTS};
use crate::tracer::{IdleTracer, TracerStats, REQ_CSTATE_NONE};

/// How long the deferred interrupt stage waits for the idle-exit path.
const IRQ_DEFER_TIMEOUT: Duration = Duration::from_millis(50);

/// Idle-gate wait per loop iteration; bounds the reaction time to
/// disable and to lost wakeups.
const IDLE_WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Back-off after a failed arm before the engine re-kicks.
const ARM_RETRY_TICK: Duration = Duration::from_micros(200);

/// Measurement run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target CPU id.
    pub cpu: u32,
    /// Lower bound of the launch distance range, nanoseconds.
    pub ldist_from: u64,
    /// Upper bound (exclusive) of the launch distance range, nanoseconds.
    pub ldist_to: u64,
    /// C-state index requested on idle entry. 0 is POLL and only valid
    /// for the BPF variant.
    pub req_cstate: u32,
    /// Event ring capacity in records.
    pub ring_slots: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cpu: 0,
            ldist_from: 1_000,
            ldist_to: 4_000_000,
            req_cstate: 2,
            ring_slots: DEFAULT_RING_SLOTS,
        }
    }
}

impl Config {
    /// Check the launch distance range against a device's limits.
    pub fn validate<D: DelayedEvent>(&self, dev: &D) -> Result<()> {
        if self.ldist_from < dev.ldist_min() {
            bail!(
                "launch distance lower bound {} below device minimum {}",
                self.ldist_from,
                dev.ldist_min()
            );
        }
        if self.ldist_to > dev.ldist_max() {
            bail!(
                "launch distance upper bound {} above device maximum {}",
                self.ldist_to,
                dev.ldist_max()
            );
        }
        if self.ldist_from >= self.ldist_to {
            bail!(
                "empty launch distance range [{}, {})",
                self.ldist_from,
                self.ldist_to
            );
        }
        if self.req_cstate == 0 && dev.kind() == DeviceKind::Hrt {
            bail!("the POLL state is not measurable with the hrt device");
        }
        Ok(())
    }
}

/// Draw a launch distance uniformly from `[from, to)`.
pub fn draw_ldist(from: u64, to: u64) -> u64 {
    fastrand::u64(from..to)
}

/// A sequenced condvar: waiters block until the sequence advances past a
/// snapshot they took earlier, so wakeups can never be lost.
struct SeqGate {
    seq: Mutex<u64>,
    cv: Condvar,
}

impl SeqGate {
    fn new() -> SeqGate {
        SeqGate {
            seq: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn current(&self) -> u64 {
        *self.seq.lock().unwrap()
    }

    fn advance(&self) {
        let mut seq = self.seq.lock().unwrap();
        *seq += 1;
        self.cv.notify_all();
    }

    /// Wait until the sequence exceeds `target`. Returns false on
    /// timeout.
    fn wait_past(&self, target: u64, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut seq = self.seq.lock().unwrap();
        while *seq <= target {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cv.wait_timeout(seq, deadline - now).unwrap();
            seq = guard;
        }
        true
    }
}

/// State shared between the measure thread, the interrupt thread and the
/// consumer, outside the engine mutex.
pub struct EngineShared {
    pub enabled: AtomicBool,
    /// Events armed since enable.
    pub events_armed: AtomicU64,
    /// Events whose interrupt stage completed since enable.
    pub events_happened: AtomicU64,
    /// Requested C-state of the cycle in flight; REQ_CSTATE_NONE when
    /// idle.
    pub cur_req_cstate: AtomicU32,
    /// Wakes the measure thread out of "idle".
    wake: SeqGate,
    /// Signals completion of the idle-exit path to the deferred
    /// interrupt stage.
    ai: SeqGate,
}

impl EngineShared {
    pub fn new() -> EngineShared {
        EngineShared {
            enabled: AtomicBool::new(false),
            events_armed: AtomicU64::new(0),
            events_happened: AtomicU64::new(0),
            cur_req_cstate: AtomicU32::new(REQ_CSTATE_NONE),
            wake: SeqGate::new(),
            ai: SeqGate::new(),
        }
    }
}

impl Default for EngineShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle the device's interrupt context uses to drive the interrupt
/// stage of the pipeline.
pub struct IrqDispatch<D: DelayedEvent> {
    inner: Weak<Mutex<EngineInner<D>>>,
    shared: Arc<EngineShared>,
}

impl<D: DelayedEvent> IrqDispatch<D> {
    /// The armed event fired. Stamp the interrupt time, wake the idle
    /// loop and run the interrupt sample point.
    pub fn interrupt(&self) {
        let tintr = clock::now_ns();
        let intr_tsc1 = clock::read_tsc();

        let ai_target = self.shared.ai.current();
        self.shared.wake.advance();

        let req = self.shared.cur_req_cstate.load(Ordering::Acquire);
        if req != 0 && req != REQ_CSTATE_NONE {
            // Interrupts stay masked across a real idle exit; hold the
            // handler until after_idle has run (or give up after a
            // bounded wait if the measure thread stalled).
            if !self.shared.ai.wait_past(ai_target, IRQ_DEFER_TIMEOUT)
                && self.shared.enabled.load(Ordering::Acquire)
            {
                debug!("idle-exit path did not complete before the interrupt stage");
            }
        }

        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut inner = inner.lock().unwrap();
        inner.interrupt(tintr, intr_tsc1);
    }
}

/// Aggregate run statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineStats {
    pub tracer: TracerStats,
    pub arm_failures: u64,
    pub ring_dropped: u64,
    pub events_armed: u64,
    pub events_happened: u64,
}

struct EngineInner<D: DelayedEvent> {
    device: D,
    tracer: IdleTracer,
    shared: Arc<EngineShared>,
    armed: bool,
    ldist_from: u64,
    ldist_to: u64,
    arm_failures: u64,
}

impl<D: DelayedEvent> EngineInner<D> {
    /// Draw a fresh launch distance and arm, unless an event is already
    /// outstanding or a measurement is mid-flight.
    fn kick_timer(&mut self) {
        if self.armed || self.tracer.state().tbi != 0 {
            return;
        }
        if !self.shared.enabled.load(Ordering::Acquire) {
            return;
        }

        let ldist = draw_ldist(self.ldist_from, self.ldist_to);
        match self.device.arm(ldist) {
            Ok(_ltime) => {
                self.tracer.arm_recorded(ldist);
                self.armed = true;
                self.shared.events_armed.fetch_add(1, Ordering::AcqRel);
            }
            Err(err) => {
                self.arm_failures += 1;
                warn!("failed to arm a delayed event {} ns away: {}", ldist, err);
            }
        }
    }

    fn before_idle(&mut self, req_cstate: u32) {
        self.tracer
            .before_idle(&mut self.device, &self.shared, req_cstate);
    }

    fn after_idle(&mut self) {
        let shared = self.shared.clone();
        self.tracer.after_idle(&mut self.device, &shared);
    }

    fn interrupt(&mut self, tintr: u64, intr_tsc1: u64) {
        let shared = self.shared.clone();
        self.tracer
            .interrupt(&mut self.device, &shared, tintr, intr_tsc1);
        // The outstanding event has been served.
        self.armed = false;
        self.shared.events_happened.fetch_add(1, Ordering::AcqRel);
        self.kick_timer();
    }
}

/// The measurement engine, generic over the delayed-event source so the
/// per-datapoint path is monomorphized.
pub struct Engine<D: DelayedEvent> {
    inner: Arc<Mutex<EngineInner<D>>>,
    shared: Arc<EngineShared>,
    consumer: RingConsumer,
    schema: FieldSchema,
    threads: Vec<JoinHandle<()>>,
    cfg: Config,
    enabled: bool,
}

impl<D: DelayedEvent> Engine<D> {
    /// Build an engine around a device and an opened counter bank. Setup
    /// failures surface here; data-level errors later never do.
    pub fn new(device: D, bank: CstateBank, cfg: Config) -> Result<Engine<D>> {
        cfg.validate(&device)?;
        let cpus = crate::perf::possible_cpus().context("failed to enumerate CPUs")?;
        if !cpus.contains(&cfg.cpu) {
            bail!("cpu {} does not exist on this system", cfg.cpu);
        }

        let (producer, consumer) =
            datapoint_ring(cfg.ring_slots).context("failed to create the event ring")?;
        let schema = FieldSchema::new(
            bank.names().iter().map(|s| s.to_string()).collect(),
            device.trace_field_names(),
        );

        let tsc_rate = TscRate::calibrate(2_000);
        let kind = device.kind();
        let shared = Arc::new(EngineShared::new());
        let tracer = IdleTracer::new(bank, producer, tsc_rate, kind);

        let inner = Arc::new(Mutex::new(EngineInner {
            device,
            tracer,
            shared: shared.clone(),
            armed: false,
            ldist_from: cfg.ldist_from,
            ldist_to: cfg.ldist_to,
            arm_failures: 0,
        }));

        Ok(Engine {
            inner,
            shared,
            consumer,
            schema,
            threads: Vec::new(),
            cfg,
            enabled: false,
        })
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Start measuring: init the device, spawn the measure thread, prime
    /// the first arm.
    pub fn enable(&mut self) -> Result<()> {
        if self.enabled {
            return Ok(());
        }
        self.shared.enabled.store(true, Ordering::Release);

        {
            let mut inner = self.inner.lock().unwrap();
            let irq = IrqDispatch {
                inner: Arc::downgrade(&self.inner),
                shared: self.shared.clone(),
            };
            if let Some(handle) = inner.device.init(irq)? {
                self.threads.push(handle);
            }
            inner.kick_timer();
        }

        let inner = self.inner.clone();
        let shared = self.shared.clone();
        let cpu = self.cfg.cpu;
        let req_cstate = self.cfg.req_cstate;
        let handle = std::thread::Builder::new()
            .name("wult-measure".into())
            .spawn(move || measure_loop(inner, shared, cpu, req_cstate))
            .context("failed to spawn the measure thread")?;
        self.threads.push(handle);

        self.enabled = true;
        Ok(())
    }

    /// Stop measuring and wait for quiescence. No arm survives disable.
    pub fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        self.shared.enabled.store(false, Ordering::Release);
        self.shared.wake.advance();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.device.cancel();
        }
        self.shared.ai.advance();

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.device.exit();
            let shared = inner.shared.clone();
            inner.tracer.clear_state(&shared);
            inner.armed = false;
        }
        // A cancelled arm never fires; start the accounting fresh so the
        // next enable's first datapoint is not discarded as nested.
        self.shared.events_armed.store(0, Ordering::Release);
        self.shared.events_happened.store(0, Ordering::Release);
        self.enabled = false;
    }

    /// Pop the next record, blocking up to `timeout`.
    pub fn next_record(&mut self, timeout: Duration) -> Option<Record> {
        self.consumer.pop_wait(timeout)
    }

    /// Consumer response to a ping record: force the measured CPU out of
    /// the POLL loop.
    pub fn kick_cpu(&self) {
        self.shared.wake.advance();
    }

    pub fn stats(&self) -> EngineStats {
        let inner = self.inner.lock().unwrap();
        EngineStats {
            tracer: inner.tracer.stats(),
            arm_failures: inner.arm_failures,
            ring_dropped: self.consumer.dropped(),
            events_armed: self.shared.events_armed.load(Ordering::Relaxed),
            events_happened: self.shared.events_happened.load(Ordering::Relaxed),
        }
    }
}

impl<D: DelayedEvent> Drop for Engine<D> {
    fn drop(&mut self) {
        self.disable();
    }
}

/// The simulated idle loop, pinned to the measured CPU.
fn measure_loop<D: DelayedEvent>(
    inner: Arc<Mutex<EngineInner<D>>>,
    shared: Arc<EngineShared>,
    cpu: u32,
    req_cstate: u32,
) {
    if let Err(err) = pin_thread_to_cpu(cpu) {
        warn!("failed to pin the measure thread to cpu {}: {}", cpu, err);
    }

    while shared.enabled.load(Ordering::Acquire) {
        // Snapshot the wake sequence first so a fire between arming and
        // waiting is never lost.
        let wake_target = shared.wake.current();

        let armed = {
            let mut guard = inner.lock().unwrap();
            if !guard.armed {
                guard.kick_timer();
            }
            if guard.armed && guard.tracer.state().tbi == 0 {
                guard.before_idle(req_cstate);
            }
            guard.armed
        };
        if !armed {
            std::thread::sleep(ARM_RETRY_TICK);
            continue;
        }

        // "Enter idle": block until the interrupt thread wakes us (or
        // time out and re-check).
        shared.wake.wait_past(wake_target, IDLE_WAIT_TIMEOUT);

        {
            let mut guard = inner.lock().unwrap();
            let st = *guard.tracer.state();
            if st.tbi != 0 && st.tai == 0 {
                guard.after_idle();
            }
        }
        // Release the deferred interrupt stage.
        shared.ai.advance();
    }
    debug!("measure thread exiting");
}
