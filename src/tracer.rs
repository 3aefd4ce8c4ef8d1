//! Idle tracer: the three sample points and the emission state machine.
//!
//! One measurement cycle runs `before_idle` on idle entry, `after_idle`
//! on idle exit and `interrupt` when the armed event's handler runs. The
//! launch-window invariant (`tbi < ltime < tai`) and the arm accounting
//! decide whether the wake we observed was the event we armed; anything
//! else is discarded without disturbing the next cycle. A record is
//! emitted once both the idle-exit measurements and the interrupt
//! timestamp exist, in whichever order the two stages completed.

use std::sync::atomic::Ordering;

use crate::clock::{self, TscRate};
use crate::cstates::CstateBank;
use crate::device::{DelayedEvent, DeviceKind};
use crate::engine::EngineShared;
use crate::ring::{Record, RingProducer, MAX_DRV_FIELDS};

/// "No cycle in flight" marker for the requested C-state.
pub const REQ_CSTATE_NONE: u32 = u32::MAX;

/// Per-cycle engine state, reset between datapoints. A zero in `tbi`,
/// `tai` or `tintr` means "not set this cycle".
#[derive(Debug, Default, Clone, Copy)]
pub struct TracerState {
    pub tbi: u64,
    pub tai: u64,
    pub tintr: u64,
    pub ltime: u64,
    pub ldist: u64,
    pub req_cstate: u32,
    pub got_measurements: bool,
    /// Nanosecond cost of the after_idle accounting work, subtracted from
    /// the interrupt latency.
    pub ai_overhead: u64,
    pub ai_tsc1: u64,
    pub ai_tsc2: u64,
    pub intr_tsc1: u64,
    pub intr_tsc2: u64,
    pub smi_bi: u64,
    pub nmi_bi: u64,
    pub smi_ai: u64,
    pub nmi_ai: u64,
    pub smi_intr: u64,
    pub nmi_intr: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracerStats {
    /// Records pushed to the ring.
    pub emitted: u64,
    /// Ping records pushed for POLL wakes.
    pub pings: u64,
    /// Idle exits that were not our event.
    pub spurious_wakes: u64,
    /// Launch-window invariant violations.
    pub discarded_window: u64,
    /// Arm-accounting mismatches (wake already served or nested).
    pub discarded_nested: u64,
    /// Negative interrupt latency after overhead subtraction.
    pub discarded_intr: u64,
    /// Missing before-idle counter snapshot (first cycle after enable).
    pub discarded_snapshot: u64,
}

pub struct IdleTracer {
    state: TracerState,
    bank: CstateBank,
    producer: RingProducer,
    tsc_rate: TscRate,
    stats: TracerStats,
    /// HRT pairing discipline: a second before_idle without an
    /// intervening after_idle is a programming error.
    strict: bool,
    /// Whether POLL wakes produce ping records (BPF variant).
    poll_ping: bool,
}

impl IdleTracer {
    pub fn new(
        bank: CstateBank,
        producer: RingProducer,
        tsc_rate: TscRate,
        kind: DeviceKind,
    ) -> IdleTracer {
        IdleTracer {
            state: TracerState {
                req_cstate: REQ_CSTATE_NONE,
                ..Default::default()
            },
            bank,
            producer,
            tsc_rate,
            stats: TracerStats::default(),
            strict: kind == DeviceKind::Hrt,
            poll_ping: kind == DeviceKind::Bpf,
        }
    }

    pub fn stats(&self) -> TracerStats {
        self.stats
    }

    pub fn state(&self) -> &TracerState {
        &self.state
    }

    pub fn bank(&self) -> &CstateBank {
        &self.bank
    }

    /// Record the launch distance of a successful arm.
    pub fn arm_recorded(&mut self, ldist: u64) {
        self.state.ldist = ldist;
    }

    /// Idle-entry sample point.
    pub fn before_idle<D: DelayedEvent>(
        &mut self,
        dev: &mut D,
        shared: &EngineShared,
        req_cstate: u32,
    ) {
        if self.strict {
            debug_assert!(
                self.state.tbi == 0,
                "before_idle without an intervening after_idle"
            );
        }

        self.state.got_measurements = false;
        self.state.req_cstate = req_cstate;
        shared.cur_req_cstate.store(req_cstate, Ordering::Release);

        self.state.smi_bi = self.bank.smi_count();
        self.state.nmi_bi = self.bank.nmi_count();

        self.bank.read_before();
        self.state.tbi = dev.time_before_idle();
        self.state.tai = 0;
        self.state.tintr = 0;
    }

    /// Idle-exit sample point.
    pub fn after_idle<D: DelayedEvent>(&mut self, dev: &mut D, shared: &EngineShared) {
        self.state.tai = dev.time_after_idle();

        self.state.ai_tsc1 = clock::read_tsc();
        if !dev.event_has_happened() {
            // Not the event we armed. Keep tbi, forget tai, wait for the
            // next idle exit.
            self.state.tai = 0;
            self.stats.spurious_wakes += 1;
            return;
        }

        if self.state.req_cstate == 0 {
            // POLL exit; the interrupt stage already pinged. Not a
            // datapoint.
            self.clear_state(shared);
            return;
        }

        self.bank.read_after();
        self.state.ltime = dev.launch_time();

        // The programmed launch must fall inside the sleep window,
        // otherwise the wake was not from our event.
        if self.state.ltime <= self.state.tbi || self.state.ltime >= self.state.tai {
            self.stats.discarded_window += 1;
            self.clear_state(shared);
            return;
        }

        let armed = shared.events_armed.load(Ordering::Acquire);
        let happened = shared.events_happened.load(Ordering::Acquire);
        if armed.wrapping_sub(happened) != 1 {
            // The delayed event has already been served.
            self.stats.discarded_nested += 1;
            self.clear_state(shared);
            return;
        }

        self.state.smi_ai = self.bank.smi_count();
        self.state.nmi_ai = self.bank.nmi_count();

        if !self.bank.calc() {
            self.stats.discarded_snapshot += 1;
            self.clear_state(shared);
            return;
        }
        self.state.got_measurements = true;

        self.state.ai_tsc2 = clock::read_tsc();
        self.state.ai_overhead = self
            .tsc_rate
            .cyc_to_ns(self.state.ai_tsc2.wrapping_sub(self.state.ai_tsc1));

        self.maybe_send(dev);
    }

    /// Interrupt-handler sample point. No deltas are computed here; the
    /// stamps are folded in at emission.
    pub fn interrupt<D: DelayedEvent>(
        &mut self,
        dev: &mut D,
        shared: &EngineShared,
        tintr: u64,
        intr_tsc1: u64,
    ) {
        self.state.intr_tsc1 = intr_tsc1;
        self.state.tintr = tintr;
        self.state.smi_intr = self.bank.smi_count();
        self.state.nmi_intr = self.bank.nmi_count();

        if self.poll_ping
            && self.state.req_cstate == 0
            && self.state.tbi != 0
            && self.state.tai == 0
        {
            // POLL does not disable interrupts, so the timer fires while
            // the CPU is still polling. Ping user space so it wakes the
            // CPU; the cycle itself carries no data.
            self.send_ping();
            self.clear_state(shared);
            return;
        }

        self.state.intr_tsc2 = clock::read_tsc();
        self.maybe_send(dev);
    }

    /// Emit the datapoint once both stages have contributed.
    pub fn maybe_send<D: DelayedEvent>(&mut self, dev: &mut D) -> bool {
        if !self.state.got_measurements || self.state.tintr == 0 {
            return false;
        }
        self.state.got_measurements = false;

        let silent_time = dev.time_to_ns(self.state.ltime - self.state.tbi);
        let wake_latency = dev.time_to_ns(self.state.tai - self.state.ltime);
        let intr_raw = dev.time_to_ns(self.state.tintr.saturating_sub(self.state.ltime));

        // The interrupt latency must stay non-negative after the
        // after_idle accounting cost is taken out.
        if intr_raw < self.state.ai_overhead {
            self.stats.discarded_intr += 1;
            self.clear_only_state();
            return false;
        }
        let intr_latency = intr_raw - self.state.ai_overhead;

        let mut rec = Record {
            req_cstate: self.state.req_cstate,
            silent_time,
            wake_latency,
            intr_latency,
            ldist: self.state.ldist,
            tsc_cycles: self.bank.tsc_cycles(),
            mperf_cycles: self.bank.mperf_cycles(),
            smi_wake: self.state.smi_ai.wrapping_sub(self.state.smi_bi),
            nmi_wake: self.state.nmi_ai.wrapping_sub(self.state.nmi_bi),
            smi_intr: self.state.smi_intr.wrapping_sub(self.state.smi_bi),
            nmi_intr: self.state.nmi_intr.wrapping_sub(self.state.nmi_bi),
            ..Default::default()
        };
        for (i, (_, cyc)) in self.bank.cstate_cycles().enumerate() {
            if i >= rec.cc_cyc.len() {
                break;
            }
            rec.cc_cyc[i] = cyc;
            rec.nr_cstates += 1;
        }
        for (i, val) in dev.trace_data().into_iter().enumerate() {
            if i >= MAX_DRV_FIELDS {
                break;
            }
            rec.drv_vals[i] = val;
            rec.nr_drv += 1;
        }

        if self.producer.try_push(&rec) {
            self.stats.emitted += 1;
        }
        self.clear_only_state();
        true
    }

    fn send_ping(&mut self) {
        if self.producer.try_push(&Record::ping()) {
            self.stats.pings += 1;
        }
    }

    /// Reset the per-cycle state and mark no cycle in flight.
    pub fn clear_state(&mut self, shared: &EngineShared) {
        self.clear_only_state();
        shared
            .cur_req_cstate
            .store(REQ_CSTATE_NONE, Ordering::Release);
    }

    fn clear_only_state(&mut self) {
        let ldist = self.state.ldist;
        self.state = TracerState {
            req_cstate: REQ_CSTATE_NONE,
            ldist,
            ..Default::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cstates::CstateBank;
    use crate::engine::IrqDispatch;
    use crate::ring::{datapoint_ring, RingConsumer, REC_PING};
    use anyhow::Result;
    use std::thread::JoinHandle;

    /// Scriptable device for exercising the tracer in isolation.
    struct TestDev {
        t_bi: u64,
        t_ai: u64,
        lt: u64,
        happened: bool,
        drv_names: Vec<String>,
        drv_vals: Vec<u64>,
        kind: DeviceKind,
    }

    impl Default for TestDev {
        fn default() -> Self {
            TestDev {
                t_bi: 0,
                t_ai: 0,
                lt: 0,
                happened: true,
                drv_names: Vec::new(),
                drv_vals: Vec::new(),
                kind: DeviceKind::Bpf,
            }
        }
    }

    impl DelayedEvent for TestDev {
        fn kind(&self) -> DeviceKind {
            self.kind
        }
        fn init(&mut self, _irq: IrqDispatch<Self>) -> Result<Option<JoinHandle<()>>> {
            Ok(None)
        }
        fn cancel(&mut self) {}
        fn exit(&mut self) {}
        fn arm(&mut self, ldist: u64) -> Result<u64> {
            self.lt = self.t_bi + ldist;
            Ok(self.lt)
        }
        fn event_has_happened(&self) -> bool {
            self.happened
        }
        fn launch_time(&self) -> u64 {
            self.lt
        }
        fn time_before_idle(&mut self) -> u64 {
            self.t_bi
        }
        fn time_after_idle(&mut self) -> u64 {
            self.t_ai
        }
        fn trace_field_names(&self) -> Vec<String> {
            self.drv_names.clone()
        }
        fn trace_data(&mut self) -> Vec<u64> {
            self.drv_vals.clone()
        }
    }

    fn tracer_pair(kind: DeviceKind) -> (IdleTracer, RingConsumer, EngineShared) {
        let (producer, consumer) = datapoint_ring(64).unwrap();
        let bank = CstateBank::synthetic(&["CC6", "PC6"]);
        // A huge rate folds the self-profiling overhead to zero so the
        // latency assertions below are exact.
        let rate = TscRate::from_khz(u64::MAX / 1_000_000);
        let tracer = IdleTracer::new(bank, producer, rate, kind);
        (tracer, consumer, EngineShared::new())
    }

    /// Drive one full cycle with the given timestamps; the arm accounting
    /// is kept consistent with a single outstanding event.
    fn run_cycle(
        tracer: &mut IdleTracer,
        dev: &mut TestDev,
        shared: &EngineShared,
        tbi: u64,
        ltime: u64,
        tai: u64,
        tintr: u64,
    ) {
        dev.t_bi = tbi;
        dev.t_ai = tai;
        dev.lt = ltime;
        shared.events_armed.fetch_add(1, Ordering::Relaxed);
        tracer.arm_recorded(ltime.saturating_sub(tbi));
        tracer.before_idle(dev, shared, 2);
        tracer.after_idle(dev, shared);
        tracer.interrupt(dev, shared, tintr, clock::read_tsc());
        shared.events_happened.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn test_normal_cycle_emits_record() {
        let (mut tracer, mut consumer, shared) = tracer_pair(DeviceKind::Bpf);
        let mut dev = TestDev::default();

        run_cycle(
            &mut tracer,
            &mut dev,
            &shared,
            1_000_000,
            2_200_000,
            2_250_000,
            2_210_000,
        );

        let rec = consumer.try_pop().expect("no record emitted");
        assert_eq!(rec.rec_type, crate::ring::REC_DATA);
        assert_eq!(rec.silent_time, 1_200_000);
        assert_eq!(rec.wake_latency, 50_000);
        assert_eq!(rec.silent_time + rec.wake_latency, 2_250_000 - 1_000_000);
        assert_eq!(rec.intr_latency, 10_000);
        assert_eq!(rec.req_cstate, 2);
        assert_eq!(rec.nr_cstates, 2);
        assert_eq!(tracer.stats().emitted, 1);
    }

    #[test]
    fn test_interrupt_before_after_idle_also_emits() {
        let (mut tracer, mut consumer, shared) = tracer_pair(DeviceKind::Bpf);
        let mut dev = TestDev {
            t_bi: 1_000,
            t_ai: 9_000,
            lt: 5_000,
            ..Default::default()
        };
        shared.events_armed.fetch_add(1, Ordering::Relaxed);
        tracer.arm_recorded(4_000);
        tracer.before_idle(&mut dev, &shared, 3);
        // POLL-like ordering: interrupt first, then idle exit.
        tracer.interrupt(&mut dev, &shared, 5_500, clock::read_tsc());
        assert!(consumer.try_pop().is_none());
        tracer.after_idle(&mut dev, &shared);

        let rec = consumer.try_pop().expect("no record emitted");
        assert_eq!(rec.silent_time, 4_000);
        assert_eq!(rec.wake_latency, 4_000);
        assert_eq!(rec.req_cstate, 3);
    }

    #[test]
    fn test_window_violation_discards() {
        let (mut tracer, mut consumer, shared) = tracer_pair(DeviceKind::Bpf);
        let mut dev = TestDev::default();

        // Launch time after the observed wake: not our event.
        run_cycle(
            &mut tracer,
            &mut dev,
            &shared,
            1_000_000,
            2_200_000,
            1_000_500,
            1_000_400,
        );
        assert!(consumer.try_pop().is_none());
        assert_eq!(tracer.stats().discarded_window, 1);
        assert_eq!(tracer.stats().emitted, 0);

        // Launch time before idle entry: same verdict.
        run_cycle(
            &mut tracer,
            &mut dev,
            &shared,
            1_000_000,
            900_000,
            1_500_000,
            1_400_000,
        );
        assert_eq!(tracer.stats().discarded_window, 2);

        // And the state machine survives: a good cycle still emits.
        run_cycle(
            &mut tracer,
            &mut dev,
            &shared,
            3_000_000,
            3_500_000,
            3_600_000,
            3_510_000,
        );
        let rec = consumer.try_pop().expect("engine state corrupted");
        assert_eq!(rec.silent_time, 500_000);
    }

    #[test]
    fn test_nested_wake_discards() {
        let (mut tracer, mut consumer, shared) = tracer_pair(DeviceKind::Bpf);
        let mut dev = TestDev {
            t_bi: 1_000,
            t_ai: 9_000,
            lt: 5_000,
            ..Default::default()
        };
        // Two arms outstanding: accounting delta is 2, not 1.
        shared.events_armed.fetch_add(2, Ordering::Relaxed);
        tracer.before_idle(&mut dev, &shared, 2);
        tracer.after_idle(&mut dev, &shared);
        tracer.interrupt(&mut dev, &shared, 5_500, clock::read_tsc());

        assert!(consumer.try_pop().is_none());
        assert_eq!(tracer.stats().discarded_nested, 1);
    }

    #[test]
    fn test_spurious_wake_keeps_tbi() {
        let (mut tracer, mut consumer, shared) = tracer_pair(DeviceKind::Bpf);
        let mut dev = TestDev {
            t_bi: 1_000,
            t_ai: 3_000,
            lt: 5_000,
            happened: false,
            ..Default::default()
        };
        shared.events_armed.fetch_add(1, Ordering::Relaxed);
        tracer.before_idle(&mut dev, &shared, 2);
        tracer.after_idle(&mut dev, &shared);

        // tai cleared, tbi retained; no discard counted, just a spurious
        // wake.
        assert_eq!(tracer.state().tbi, 1_000);
        assert_eq!(tracer.state().tai, 0);
        assert_eq!(tracer.stats().spurious_wakes, 1);

        // The real event arrives on the next idle exit.
        dev.happened = true;
        dev.t_ai = 9_000;
        tracer.after_idle(&mut dev, &shared);
        tracer.interrupt(&mut dev, &shared, 5_500, clock::read_tsc());
        let rec = consumer.try_pop().expect("no record after spurious wake");
        assert_eq!(rec.silent_time, 4_000);
        assert_eq!(rec.wake_latency, 4_000);
    }

    #[test]
    fn test_poll_ping_path() {
        let (mut tracer, mut consumer, shared) = tracer_pair(DeviceKind::Bpf);
        let mut dev = TestDev {
            t_bi: 1_000,
            lt: 501_000,
            ..Default::default()
        };
        shared.events_armed.fetch_add(1, Ordering::Relaxed);
        tracer.arm_recorded(500_000);
        tracer.before_idle(&mut dev, &shared, 0);
        // Timer fires while the CPU is polling; no idle exit yet.
        tracer.interrupt(&mut dev, &shared, 501_100, clock::read_tsc());

        let rec = consumer.try_pop().expect("no ping emitted");
        assert_eq!(rec.rec_type, REC_PING);
        assert_eq!(tracer.stats().pings, 1);

        // The later idle exit contributes nothing.
        dev.t_ai = 502_000;
        tracer.after_idle(&mut dev, &shared);
        assert!(consumer.try_pop().is_none());
        assert_eq!(tracer.stats().emitted, 0);
    }

    #[test]
    fn test_hrt_has_no_ping_path() {
        let (mut tracer, mut consumer, shared) = tracer_pair(DeviceKind::Hrt);
        let mut dev = TestDev {
            t_bi: 1_000,
            lt: 501_000,
            kind: DeviceKind::Hrt,
            ..Default::default()
        };
        shared.events_armed.fetch_add(1, Ordering::Relaxed);
        tracer.before_idle(&mut dev, &shared, 0);
        tracer.interrupt(&mut dev, &shared, 501_100, clock::read_tsc());
        assert!(consumer.try_pop().is_none());
        assert_eq!(tracer.stats().pings, 0);
    }

    #[test]
    fn test_negative_intr_latency_discards() {
        let (mut tracer, mut consumer, shared) = tracer_pair(DeviceKind::Bpf);
        let mut dev = TestDev {
            t_bi: 1_000_000,
            t_ai: 2_300_000,
            lt: 2_200_000,
            ..Default::default()
        };
        shared.events_armed.fetch_add(1, Ordering::Relaxed);
        tracer.before_idle(&mut dev, &shared, 2);
        tracer.after_idle(&mut dev, &shared);
        // Force the overhead above the raw interrupt latency.
        tracer.state.ai_overhead = 1_000_000;
        tracer.interrupt(&mut dev, &shared, 2_210_000, clock::read_tsc());

        assert!(consumer.try_pop().is_none());
        assert_eq!(tracer.stats().discarded_intr, 1);
    }

    #[test]
    fn test_first_cycle_without_before_snapshot_discards() {
        let (mut tracer, mut consumer, shared) = tracer_pair(DeviceKind::Bpf);
        let mut dev = TestDev {
            t_bi: 1_000,
            t_ai: 9_000,
            lt: 5_000,
            ..Default::default()
        };
        shared.events_armed.fetch_add(1, Ordering::Relaxed);
        // No before_idle: fake a half-observed cycle by clearing only the
        // bank pairing. after_idle must reject it.
        tracer.state.tbi = 1_000;
        tracer.state.req_cstate = 2;
        tracer.after_idle(&mut dev, &shared);
        tracer.interrupt(&mut dev, &shared, 5_500, clock::read_tsc());

        assert!(consumer.try_pop().is_none());
        assert_eq!(tracer.stats().discarded_snapshot, 1);
    }

    #[test]
    fn test_driver_fields_carried() {
        let (mut tracer, mut consumer, shared) = tracer_pair(DeviceKind::Bpf);
        let mut dev = TestDev {
            drv_names: vec!["APERFCyc".to_string()],
            drv_vals: vec![777],
            ..Default::default()
        };
        run_cycle(
            &mut tracer,
            &mut dev,
            &shared,
            1_000_000,
            2_000_000,
            2_100_000,
            2_010_000,
        );
        let rec = consumer.try_pop().unwrap();
        assert_eq!(rec.nr_drv, 1);
        assert_eq!(rec.drv_vals[0], 777);
    }
}
