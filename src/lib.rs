//! Wake-up latency tracer.
//!
//! Measures how long a CPU takes to leave a hardware idle C-state after a
//! programmed wake event. The engine arms a delayed event, lets the
//! target CPU go idle, and correlates the timestamps and hardware
//! counters collected on idle entry, idle exit and in the interrupt
//! handler into one datapoint: silent time, wake latency, interrupt
//! latency, TSC/MPERF totals, per-C-state residency cycles and SMI/NMI
//! counts. Datapoints stream to the consumer through a bounded lock-free
//! ring.
//!
//! # Modules
//!
//! - [`clock`] - boot-time clock, TSC, cycles-to-ns conversion
//! - [`cstates`] - C-state residency counter bank
//! - [`device`] - delayed-event sources (hrt timer, sandbox-style timer)
//! - [`tracer`] - the idle tracer sample points and emission rules
//! - [`engine`] - the measurement loop tying it all together
//! - [`ring`] - the datapoint ring
//! - [`encode`] - record stream encodings
//! - [`defs`] - metric definitions and the turbostat boundary schema

pub mod clock;
pub mod cstates;
pub mod defs;
pub mod device;
pub mod encode;
pub mod engine;
pub mod msr;
pub mod perf;
pub mod ring;
pub mod tracer;

pub use cstates::{CstateBank, CycleSource};
pub use device::{BpfTimer, DelayedEvent, DeviceKind, HrtTimer};
pub use encode::{Encoding, FieldSchema};
pub use engine::{Config, Engine, EngineShared, EngineStats, IrqDispatch};
pub use ring::{Record, REC_DATA, REC_PING};
