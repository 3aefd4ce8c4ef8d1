//! Perf-event backed counter array.
//!
//! The BPF-style delayed-event source does not read MSRs directly; it goes
//! through a fixed-size array of perf events, one per counter, all opened
//! on the measured CPU. Slot 0 is always TSC and slot 1 is always MPERF;
//! any further counters the `msr` PMU advertises are appended and become
//! driver-specific datapoint fields.
//!
//! Counter reads never fail the datapoint: an error is reported in-band by
//! returning the negated errno as an unsigned value, which callers fold to
//! zero through [`crate::clock::check_count`].

use std::collections::HashMap;
use std::fs;
use std::io::{Error, ErrorKind};
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use anyhow::Result;
use bitfield::bitfield;
use nix::errno::Errno;
use nix::ioctl_none;
use regex::Regex;

/// Fixed perf array slots. The record layout and the counter array are
/// sized together; keep in sync with `ring::MAX_DRV_FIELDS`.
pub const SLOT_TSC: usize = 0;
pub const SLOT_MPERF: usize = 1;
pub const NUM_PERF_COUNTERS: usize = 16;

#[repr(C)]
pub union sample_un {
    pub sample_period: u64,
    pub sample_freq: u64,
}

#[repr(C)]
pub union wakeup_un {
    pub wakeup_events: u32,
    pub wakeup_watermark: u32,
}

#[repr(C)]
pub union bp_1_un {
    pub bp_addr: u64,
    pub kprobe_func: u64,
    pub uprobe_path: u64,
    pub config1: u64,
}

#[repr(C)]
pub union bp_2_un {
    pub bp_len: u64,
    pub kprobe_addr: u64,
    pub probe_offset: u64,
    pub config2: u64,
}

bitfield! {
    #[allow(non_camel_case_types)]
    pub struct perf_event_attr_flags(u64);
    impl Debug;
    pub disabled, set_disabled: 0, 0;
    pub inherit, set_inherit: 1, 1;
    pub pinned, set_pinned: 2, 2;
    pub exclusive, set_exclusive: 3, 3;
    pub exclude_user, set_exclude_user: 4, 4;
    pub exclude_kernel, set_exclude_kernel: 5, 5;
    pub exclude_hv, set_exclude_hv: 6, 6;
    pub exclude_idle, set_exclude_idle: 7, 7;
    pub mmap, set_mmap: 8, 8;
    pub comm, set_comm: 9, 9;
    pub freq, set_freq: 10, 10;
    pub inherit_stat, set_inherit_stat: 11, 11;
    pub enable_on_exec, set_enable_on_exec: 12, 12;
    pub task, set_task: 13, 13;
    pub watermark, set_watermark: 14, 14;
    pub precise_ip, set_precise_ip: 16, 15;
    pub mmap_data, set_mmap_data: 17, 17;
    pub sample_id_all, set_sample_id_all: 18, 18;
    pub exclude_host, set_exclude_host: 19, 19;
    pub exclude_guest, set_exclude_guest: 20, 20;
    pub exclude_callchain_kernel, set_exclude_callchain_kernel: 21, 21;
    pub exclude_callchain_user, set_exclude_callchain_user: 22, 22;
    pub mmap2, set_mmap2: 23, 23;
    pub comm_exec, set_comm_exec: 24, 24;
    pub use_clockid, set_use_clockid: 25, 25;
    pub context_switch, set_context_switch: 26, 26;
    pub write_backward, set_write_backward: 27, 27;
    pub namespaces, set_namespaces: 28, 28;
    pub __reserved_1, _: 63, 29;
}

#[repr(C)]
#[allow(non_camel_case_types)]
pub struct perf_event_attr {
    pub _type: u32,
    pub size: u32,
    pub config: u64,
    pub sample: sample_un,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: perf_event_attr_flags,
    pub wakeup: wakeup_un,
    pub bp_type: u32,
    pub bp_1: bp_1_un,
    pub bp_2: bp_2_un,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
}

extern "C" {
    fn syscall(number: libc::c_long, ...) -> libc::c_long;
}

pub fn perf_event_open(
    hw_event: &perf_event_attr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> Result<PerfEventFile, Error> {
    let fd = unsafe {
        syscall(
            libc::SYS_perf_event_open,
            hw_event as *const perf_event_attr,
            pid,
            cpu,
            group_fd,
            flags,
        )
    } as i32;

    if fd < 0 {
        return Err(Error::last_os_error());
    }

    Ok(PerfEventFile {
        fd,
        need_disable: false,
    })
}

const PERF_EVENT_MAGIC: u8 = b'$';
const PERF_EVENT_IOC_ENABLE: u8 = 0;
const PERF_EVENT_IOC_DISABLE: u8 = 1;
ioctl_none!(
    perf_event_ioc_enable,
    PERF_EVENT_MAGIC,
    PERF_EVENT_IOC_ENABLE
);
ioctl_none!(
    perf_event_ioc_disable,
    PERF_EVENT_MAGIC,
    PERF_EVENT_IOC_DISABLE
);

#[derive(Debug)]
pub struct PerfEventFile {
    fd: RawFd,
    need_disable: bool,
}

impl PerfEventFile {
    pub fn enable(&mut self) -> Result<(), Error> {
        match unsafe { perf_event_ioc_enable(self.fd) } {
            Ok(_) => {
                self.need_disable = true;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn disable(&self) -> Result<(), Error> {
        match unsafe { perf_event_ioc_disable(self.fd) } {
            Ok(_) => Ok(()),
            Err(e) => {
                if e == Errno::ENOTTY {
                    return Ok(());
                }
                Err(e.into())
            }
        }
    }

    /// Read the current counter value. Errors are reported in-band: the
    /// negated errno as u64, so the value lands in the transient-error
    /// sentinel range and `clock::check_count` folds it to zero.
    pub fn read_count(&self) -> u64 {
        let mut count: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut count as *mut u64 as *mut libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        if ret != mem::size_of::<u64>() as isize {
            let errno = Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
            return (-(errno as i64)) as u64;
        }
        count
    }
}

impl AsRawFd for PerfEventFile {
    fn as_raw_fd(&self) -> i32 {
        self.fd
    }
}

impl Drop for PerfEventFile {
    fn drop(&mut self) {
        if self.need_disable {
            let _ = self.disable();
        }
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// One counter the `msr` PMU advertises.
#[derive(Default, Debug, Clone)]
pub struct MsrPmuEvent {
    pub name: String,
    pub event_config: u64,
}

/// Discovered `msr` PMU: its perf event type plus the counters it offers.
#[derive(Default, Debug)]
pub struct MsrPmu {
    pub event_type: u32,
    events: HashMap<String, MsrPmuEvent>,
}

impl MsrPmu {
    /// Discover the `msr` PMU from sysfs. Fails when the kernel does not
    /// expose it, which the BPF-style device treats as a setup error.
    pub fn discover() -> Result<MsrPmu, Error> {
        let root = Path::new("/sys/bus/event_source/devices/msr");
        let mut pmu = MsrPmu::default();

        let type_buf = fs::read_to_string(root.join("type"))?;
        pmu.event_type = type_buf
            .trim()
            .parse()
            .map_err(|_| Error::new(ErrorKind::InvalidData, "malformed msr PMU type"))?;

        let event_re = Regex::new(r"event=0x([0-9a-fA-F]+)").unwrap();
        for entry in fs::read_dir(root.join("events"))? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            // Skip the ".unit"/".scale" companions.
            if name.contains('.') {
                continue;
            }
            let buf = fs::read_to_string(&path)?;
            if let Some(cap) = event_re.captures(&buf) {
                let config = u64::from_str_radix(&cap[1], 16).unwrap_or(0);
                pmu.events.insert(
                    name.clone(),
                    MsrPmuEvent {
                        name,
                        event_config: config,
                    },
                );
            }
        }
        Ok(pmu)
    }

    pub fn event(&self, name: &str) -> Option<&MsrPmuEvent> {
        self.events.get(name)
    }

    /// Counters other than TSC and MPERF, in a stable order.
    pub fn extra_events(&self) -> Vec<MsrPmuEvent> {
        let mut extras: Vec<MsrPmuEvent> = self
            .events
            .values()
            .filter(|e| e.name != "tsc" && e.name != "mperf")
            .cloned()
            .collect();
        extras.sort_by(|a, b| a.name.cmp(&b.name));
        extras
    }
}

/// The fixed-slot counter array for one CPU.
///
/// Slot 0 is TSC, slot 1 is MPERF; extra `msr` PMU counters follow. The
/// array size is fixed so the ring record layout never changes mid-run.
#[derive(Debug)]
pub struct PerfCounterArray {
    cpu: u32,
    files: Vec<PerfEventFile>,
    names: Vec<String>,
}

impl PerfCounterArray {
    /// Open the counter array on `cpu`. TSC and MPERF are mandatory;
    /// extra counters are best-effort and capped at `NUM_PERF_COUNTERS`.
    pub fn open(cpu: u32) -> Result<PerfCounterArray, Error> {
        let pmu = MsrPmu::discover()?;

        let mut wanted: Vec<MsrPmuEvent> = Vec::new();
        for name in ["tsc", "mperf"] {
            match pmu.event(name) {
                Some(ev) => wanted.push(ev.clone()),
                None => {
                    return Err(Error::new(
                        ErrorKind::NotFound,
                        format!("msr PMU does not advertise the '{}' counter", name),
                    ));
                }
            }
        }
        for ev in pmu.extra_events() {
            if wanted.len() >= NUM_PERF_COUNTERS {
                break;
            }
            wanted.push(ev);
        }

        let mut files = Vec::with_capacity(wanted.len());
        let mut names = Vec::with_capacity(wanted.len());
        for ev in &wanted {
            let buf: Vec<u8> = vec![0; mem::size_of::<perf_event_attr>()];
            let mut attr = unsafe {
                Box::<perf_event_attr>::from_raw(buf.leak().as_mut_ptr() as *mut perf_event_attr)
            };
            attr._type = pmu.event_type;
            attr.size = mem::size_of::<perf_event_attr>() as u32;
            attr.config = ev.event_config;

            let mut file = perf_event_open(attr.as_ref(), -1, cpu as i32, -1, 0).map_err(|e| {
                Error::new(
                    e.kind(),
                    format!(
                        "failed to open msr counter '{}' on cpu {}: {}",
                        ev.name, cpu, e
                    ),
                )
            })?;
            file.enable()?;
            files.push(file);
            names.push(ev.name.clone());
        }

        Ok(PerfCounterArray { cpu, files, names })
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Names of all slots, index-aligned with `read_slot`.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Raw slot read; errors come back as the in-band sentinel.
    pub fn read_slot(&self, slot: usize) -> u64 {
        match self.files.get(slot) {
            Some(file) => file.read_count(),
            None => (-(libc::ENOENT as i64)) as u64,
        }
    }
}

/// Enumerate possible CPU ids from sysfs ("0-63" or "0").
pub fn possible_cpus() -> Result<Vec<u32>> {
    let buf = fs::read_to_string("/sys/devices/system/cpu/possible")?;
    let mut cpus = Vec::new();
    let range_re = Regex::new(r"(\d+)(?:-(\d+))?").unwrap();
    for cap in range_re.captures_iter(&buf) {
        let start: u32 = cap[1].parse()?;
        let end: u32 = match cap.get(2) {
            Some(m) => m.as_str().parse()?,
            None => start,
        };
        for cpu in start..=end {
            cpus.push(cpu);
        }
    }
    Ok(cpus)
}
