//! C-state counter bank.
//!
//! Enumerates the residency counters the detected CPU model supports,
//! snapshots them around the idle period and computes the per-datapoint
//! deltas. TSC and MPERF are always present; depending on the device
//! variant they are read directly (`rdtsc` + MSR) or through the fixed
//! slots of the perf counter array. The enumeration order is established
//! once at detection and never changes for the run, so every datapoint
//! carries its C-state cycles in the same order.

use std::collections::VecDeque;
use std::fs;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tracing::debug;

use crate::clock::{self, check_count};
use crate::msr::{self, Msr};
use crate::perf::{PerfCounterArray, SLOT_MPERF, SLOT_TSC};

/// Upper bound on per-model C-state counters; sizes the ring record.
pub const MAX_CSTATES: usize = 10;

/// One supported C-state: its conventional name and residency MSR.
#[derive(Debug, Clone, Copy)]
pub struct CstateDef {
    pub name: &'static str,
    pub msr: u32,
}

/// Client parts: full core + package residency coverage.
static CLIENT_CSTATES: &[CstateDef] = &[
    CstateDef { name: "CC3", msr: msr::MSR_CORE_C3_RESIDENCY },
    CstateDef { name: "CC6", msr: msr::MSR_CORE_C6_RESIDENCY },
    CstateDef { name: "CC7", msr: msr::MSR_CORE_C7_RESIDENCY },
    CstateDef { name: "PC2", msr: msr::MSR_PKG_C2_RESIDENCY },
    CstateDef { name: "PC3", msr: msr::MSR_PKG_C3_RESIDENCY },
    CstateDef { name: "PC6", msr: msr::MSR_PKG_C6_RESIDENCY },
    CstateDef { name: "PC7", msr: msr::MSR_PKG_C7_RESIDENCY },
    CstateDef { name: "PC8", msr: msr::MSR_PKG_C8_RESIDENCY },
    CstateDef { name: "PC9", msr: msr::MSR_PKG_C9_RESIDENCY },
    CstateDef { name: "PC10", msr: msr::MSR_PKG_C10_RESIDENCY },
];

/// Server parts expose a reduced set.
static SERVER_CSTATES: &[CstateDef] = &[
    CstateDef { name: "CC3", msr: msr::MSR_CORE_C3_RESIDENCY },
    CstateDef { name: "CC6", msr: msr::MSR_CORE_C6_RESIDENCY },
    CstateDef { name: "PC2", msr: msr::MSR_PKG_C2_RESIDENCY },
    CstateDef { name: "PC6", msr: msr::MSR_PKG_C6_RESIDENCY },
];

/// Atom parts count C1 and module C6 instead of the deep core states.
static ATOM_CSTATES: &[CstateDef] = &[
    CstateDef { name: "CC1", msr: msr::MSR_CORE_C1_RES },
    CstateDef { name: "CC6", msr: msr::MSR_CORE_C6_RESIDENCY },
    CstateDef { name: "MC6", msr: msr::MSR_MODULE_C6_RES_MS },
    CstateDef { name: "PC6", msr: msr::MSR_PKG_C6_RESIDENCY },
];

/// Anything we do not recognize: the counters present since Nehalem.
static FALLBACK_CSTATES: &[CstateDef] = &[
    CstateDef { name: "CC3", msr: msr::MSR_CORE_C3_RESIDENCY },
    CstateDef { name: "CC6", msr: msr::MSR_CORE_C6_RESIDENCY },
];

/// Server models (family 6): Skylake-X, Ice Lake-X, Sapphire Rapids.
static SERVER_MODELS: &[u32] = &[0x55, 0x6a, 0x6c, 0x8f];

/// Atom models (family 6): Goldmont, Goldmont Plus, Tremont.
static ATOM_MODELS: &[u32] = &[0x5c, 0x5f, 0x7a, 0x86, 0x96, 0x9c];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuId {
    pub vendor_intel: bool,
    pub family: u32,
    pub model: u32,
}

/// Identify the CPU from `/proc/cpuinfo`.
pub fn detect_cpu() -> Result<CpuId> {
    let buf = fs::read_to_string("/proc/cpuinfo").context("failed to read /proc/cpuinfo")?;
    parse_cpuinfo(&buf)
}

fn parse_cpuinfo(buf: &str) -> Result<CpuId> {
    let vendor_re = Regex::new(r"vendor_id\s*:\s*(\S+)").unwrap();
    let family_re = Regex::new(r"cpu family\s*:\s*(\d+)").unwrap();
    let model_re = Regex::new(r"\nmodel\s*:\s*(\d+)").unwrap();

    let vendor = vendor_re
        .captures(buf)
        .map(|c| c[1].to_string())
        .unwrap_or_default();
    let family = match family_re.captures(buf) {
        Some(c) => c[1].parse()?,
        None => bail!("no 'cpu family' line in /proc/cpuinfo"),
    };
    let model = match model_re.captures(buf) {
        Some(c) => c[1].parse()?,
        None => bail!("no 'model' line in /proc/cpuinfo"),
    };

    Ok(CpuId {
        vendor_intel: vendor == "GenuineIntel",
        family,
        model,
    })
}

/// Pick the C-state table for a CPU model.
pub fn cstate_table(id: &CpuId) -> Result<&'static [CstateDef]> {
    if !id.vendor_intel {
        bail!("unsupported CPU vendor, residency counters require Intel");
    }
    if id.family != 6 {
        bail!("unsupported Intel CPU family {}, need family 6", id.family);
    }
    if ATOM_MODELS.contains(&id.model) {
        return Ok(ATOM_CSTATES);
    }
    if SERVER_MODELS.contains(&id.model) {
        return Ok(SERVER_CSTATES);
    }
    // Client models are the long tail; probe-and-drop at open time trims
    // the table down to what the part really implements.
    if id.model >= 0x3c {
        return Ok(CLIENT_CSTATES);
    }
    Ok(FALLBACK_CSTATES)
}

/// Where TSC and MPERF totals come from.
pub enum CycleSource {
    /// `rdtsc` plus a direct MPERF MSR read. Used by the HRT device.
    Rdtsc,
    /// Fixed slots of the perf counter array. Used by the BPF device.
    Perf(Arc<PerfCounterArray>),
}

#[derive(Debug)]
struct CstateSlot {
    def: CstateDef,
    before: u64,
    after: u64,
    cyc: u64,
}

enum Backend {
    Hw {
        msr: Msr,
        cycles: CycleSource,
        have_smi: bool,
    },
    /// Fabricated counters for tests: deterministic, invariant-respecting,
    /// with an optional script of raw TSC reads to exercise the transient
    /// failure convention.
    Synthetic {
        tsc_script: VecDeque<u64>,
        t_before: u64,
    },
}

/// The per-run counter bank.
pub struct CstateBank {
    backend: Backend,
    states: Vec<CstateSlot>,
    cpu: u32,
    tsc_before: u64,
    tsc_after: u64,
    tsc: u64,
    mperf_before: u64,
    mperf_after: u64,
    mperf: u64,
    have_before: bool,
}

impl CstateBank {
    /// Detect and open the counter bank for `cpu`. Probes every counter in
    /// the model table once and drops the ones this part does not
    /// implement; the surviving order is the run's enumeration order.
    pub fn detect(cpu: u32, cycles: CycleSource) -> Result<CstateBank> {
        let id = detect_cpu()?;
        let table = cstate_table(&id)?;
        let msr = Msr::open(cpu).with_context(|| format!("no MSR access for cpu {}", cpu))?;

        let mut states = Vec::new();
        for def in table {
            match msr.read(def.msr) {
                Ok(_) => states.push(CstateSlot {
                    def: *def,
                    before: 0,
                    after: 0,
                    cyc: 0,
                }),
                Err(_) => debug!("dropping {}: MSR {:#x} not readable", def.name, def.msr),
            }
        }
        if states.is_empty() {
            bail!("no C-state residency counters readable on cpu {}", cpu);
        }

        let have_smi = id.vendor_intel && msr.read(msr::MSR_SMI_COUNT).is_ok();

        Ok(CstateBank {
            backend: Backend::Hw {
                msr,
                cycles,
                have_smi,
            },
            states,
            cpu,
            tsc_before: 0,
            tsc_after: 0,
            tsc: 0,
            mperf_before: 0,
            mperf_after: 0,
            mperf: 0,
            have_before: false,
        })
    }

    /// A bank with fabricated counters, for tests and dry runs.
    pub fn synthetic(names: &[&'static str]) -> CstateBank {
        Self::synthetic_with_tsc_script(names, &[])
    }

    /// Synthetic bank whose next raw TSC reads are taken from `script`
    /// before falling back to the fabricated clock. Values in the
    /// transient-error sentinel range exercise the zero-fold path.
    pub fn synthetic_with_tsc_script(names: &[&'static str], script: &[u64]) -> CstateBank {
        let states = names
            .iter()
            .map(|&name| CstateSlot {
                def: CstateDef { name, msr: 0 },
                before: 0,
                after: 0,
                cyc: 0,
            })
            .collect();
        CstateBank {
            backend: Backend::Synthetic {
                tsc_script: script.iter().copied().collect(),
                t_before: 0,
            },
            states,
            cpu: 0,
            tsc_before: 0,
            tsc_after: 0,
            tsc: 0,
            mperf_before: 0,
            mperf_after: 0,
            mperf: 0,
            have_before: false,
        }
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// C-state names in the run's enumeration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.states.iter().map(|s| s.def.name).collect()
    }

    fn read_cycle_counters(&mut self) -> (u64, u64) {
        match &mut self.backend {
            Backend::Hw { msr, cycles, .. } => match cycles {
                CycleSource::Rdtsc => (clock::read_tsc(), msr.read_or_zero(msr::MSR_MPERF)),
                CycleSource::Perf(array) => (
                    check_count(array.read_slot(SLOT_TSC)),
                    check_count(array.read_slot(SLOT_MPERF)),
                ),
            },
            Backend::Synthetic {
                tsc_script,
                t_before: _,
            } => {
                // 2 "cycles" per nanosecond, MPERF at half rate. Scripted
                // raw reads go through the same sentinel fold the perf
                // path uses.
                let now = clock::now_ns();
                let tsc = match tsc_script.pop_front() {
                    Some(raw) => check_count(raw),
                    None => now.wrapping_mul(2),
                };
                (tsc, now)
            }
        }
    }

    /// Snapshot all counters on the idle-entry path.
    pub fn read_before(&mut self) {
        let (tsc, mperf) = self.read_cycle_counters();
        self.tsc_before = tsc;
        self.mperf_before = mperf;
        match &mut self.backend {
            Backend::Hw { msr, .. } => {
                for slot in &mut self.states {
                    slot.before = msr.read_or_zero(slot.def.msr);
                }
            }
            Backend::Synthetic { t_before, .. } => {
                *t_before = clock::now_ns();
                for slot in &mut self.states {
                    slot.before = 0;
                }
            }
        }
        self.have_before = true;
    }

    /// Snapshot all counters on the idle-exit path.
    pub fn read_after(&mut self) {
        let (tsc, mperf) = self.read_cycle_counters();
        self.tsc_after = tsc;
        self.mperf_after = mperf;
        match &mut self.backend {
            Backend::Hw { msr, .. } => {
                for slot in &mut self.states {
                    slot.after = msr.read_or_zero(slot.def.msr);
                }
            }
            Backend::Synthetic { t_before, .. } => {
                let idle_ns = clock::now_ns().saturating_sub(*t_before);
                // Attribute half the fabricated cycles to the C-states,
                // split evenly, so the per-state sum stays below the TSC
                // total.
                let n = self.states.len().max(1) as u64;
                for slot in &mut self.states {
                    slot.after = slot.before + idle_ns / n;
                }
            }
        }
    }

    /// Compute the deltas for this datapoint. Returns false when the
    /// before-idle snapshot is missing (first partial cycle after enable);
    /// such datapoints are discarded.
    pub fn calc(&mut self) -> bool {
        if !self.have_before {
            return false;
        }
        self.have_before = false;

        self.tsc = delta_or_zero(self.tsc_before, self.tsc_after);
        self.mperf = delta_or_zero(self.mperf_before, self.mperf_after);
        for slot in &mut self.states {
            slot.cyc = delta_or_zero(slot.before, slot.after);
        }
        true
    }

    /// TSC cycles between the before and after snapshots.
    pub fn tsc_cycles(&self) -> u64 {
        self.tsc
    }

    /// MPERF cycles between the before and after snapshots.
    pub fn mperf_cycles(&self) -> u64 {
        self.mperf
    }

    /// Per-C-state cycle deltas, enumeration order.
    pub fn cstate_cycles(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.states.iter().map(|s| (s.def.name, s.cyc))
    }

    /// Current SMI count; 0 when the platform has no SMI counter.
    pub fn smi_count(&self) -> u64 {
        match &self.backend {
            Backend::Hw { msr, have_smi, .. } => {
                if *have_smi {
                    msr.read_or_zero(msr::MSR_SMI_COUNT) & 0xffff_ffff
                } else {
                    0
                }
            }
            Backend::Synthetic { .. } => 7,
        }
    }

    /// Current NMI count for the measured CPU from `/proc/interrupts`.
    pub fn nmi_count(&self) -> u64 {
        match &self.backend {
            Backend::Hw { .. } => fs::read_to_string("/proc/interrupts")
                .ok()
                .and_then(|buf| parse_nmi_count(&buf, self.cpu))
                .unwrap_or(0),
            Backend::Synthetic { .. } => 3,
        }
    }
}

fn delta_or_zero(before: u64, after: u64) -> u64 {
    // A zero on either side means a failed read; report no cycles rather
    // than a wrapped garbage delta.
    if before == 0 || after == 0 || after < before {
        return 0;
    }
    after - before
}

/// Pull the NMI count for `cpu` out of `/proc/interrupts` text.
fn parse_nmi_count(buf: &str, cpu: u32) -> Option<u64> {
    let mut lines = buf.lines();
    let header = lines.next()?;
    let col = header
        .split_whitespace()
        .position(|tok| tok == format!("CPU{}", cpu))?;
    for line in lines {
        let mut toks = line.split_whitespace();
        if toks.next() != Some("NMI:") {
            continue;
        }
        return toks.nth(col).and_then(|t| t.parse().ok());
    }
    None
}
