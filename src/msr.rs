//! Model-specific register access through `/dev/cpu/<cpu>/msr`.
//!
//! Requires the `msr` kernel module (or built-in) and enough privilege to
//! open the per-CPU device node. All reads are 8-byte preads at the
//! register offset, which the msr driver turns into `rdmsr` on the right
//! CPU regardless of where the caller runs.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

/// SMI counter, architectural on modern Intel.
pub const MSR_SMI_COUNT: u32 = 0x34;
/// Maximum-performance frequency clock count.
pub const MSR_MPERF: u32 = 0xe7;
/// Actual-performance frequency clock count.
pub const MSR_APERF: u32 = 0xe8;

/// Core C-state residency counters.
pub const MSR_CORE_C1_RES: u32 = 0x660;
pub const MSR_CORE_C3_RESIDENCY: u32 = 0x3fc;
pub const MSR_CORE_C6_RESIDENCY: u32 = 0x3fd;
pub const MSR_CORE_C7_RESIDENCY: u32 = 0x3fe;

/// Package C-state residency counters.
pub const MSR_PKG_C2_RESIDENCY: u32 = 0x60d;
pub const MSR_PKG_C3_RESIDENCY: u32 = 0x3f8;
pub const MSR_PKG_C6_RESIDENCY: u32 = 0x3f9;
pub const MSR_PKG_C7_RESIDENCY: u32 = 0x3fa;
pub const MSR_PKG_C8_RESIDENCY: u32 = 0x630;
pub const MSR_PKG_C9_RESIDENCY: u32 = 0x631;
pub const MSR_PKG_C10_RESIDENCY: u32 = 0x632;

/// Module C-state residency (Atom).
pub const MSR_MODULE_C6_RES_MS: u32 = 0x664;

/// An open per-CPU MSR device handle.
#[derive(Debug)]
pub struct Msr {
    file: File,
    cpu: u32,
}

impl Msr {
    /// Open the MSR device for `cpu`.
    pub fn open(cpu: u32) -> io::Result<Msr> {
        let path = PathBuf::from(format!("/dev/cpu/{}/msr", cpu));
        let file = File::open(&path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!(
                    "failed to open {}: {} (is the msr module loaded?)",
                    path.display(),
                    e
                ),
            )
        })?;
        Ok(Msr { file, cpu })
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    /// Read a 64-bit MSR.
    pub fn read(&self, reg: u32) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.file.read_exact_at(&mut buf, reg as u64)?;
        Ok(u64::from_ne_bytes(buf))
    }

    /// Read a 64-bit MSR, treating failure as "counter unavailable".
    /// Used for counters where a zero delta is preferable to aborting the
    /// datapoint.
    pub fn read_or_zero(&self, reg: u32) -> u64 {
        self.read(reg).unwrap_or(0)
    }
}
