//! Datapoint record encodings.
//!
//! Two wire encodings coexist, selected once at init:
//!
//! * the trace-printk fallback: one `key=value` text line per record,
//!   built in a bounded buffer the way the legacy kernel path did it;
//! * the synthetic event: the fixed-layout record bytes themselves,
//!   decoded zero-copy on the consumer side.
//!
//! Field names after the common prefix are run constants: the C-state
//! names in bank enumeration order followed by the driver-specific
//! fields. Consumers treat the list as ordered but driver-dependent.

use std::fmt::{self, Write as _};
use std::io::{self, Write};
use std::mem;

use regex::Regex;

use crate::ring::Record;

/// Size of the bounded text encoding buffer.
pub const OUTBUF_SIZE: usize = 1024;

/// Common field names of the text encoding, in emission order.
pub const PRINTK_COMMON_FIELDS: &[&str] = &[
    "SilentTime",
    "WakeLatency",
    "IntrLatency",
    "LDist",
    "ReqCState",
    "TSC",
    "MPERF",
    "SMIWake",
    "NMIWake",
    "SMIIntr",
    "NMIIntr",
];

/// Common field names of the synthetic-event encoding. TotCyc is the TSC
/// total and CC0Cyc the busy (MPERF) cycles.
pub const SYNTH_COMMON_FIELDS: &[&str] = &[
    "SilentTime",
    "WakeLatency",
    "IntrLatency",
    "LDist",
    "ReqCState",
    "TotCyc",
    "CC0Cyc",
    "SMIWake",
    "NMIWake",
    "SMIIntr",
    "NMIIntr",
];

/// Per-run field name schema: the C-state and driver-specific tails of
/// the record.
#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    cstates: Vec<String>,
    drv: Vec<String>,
}

impl FieldSchema {
    pub fn new(cstate_names: Vec<String>, drv_names: Vec<String>) -> FieldSchema {
        FieldSchema {
            cstates: cstate_names,
            drv: drv_names,
        }
    }

    pub fn cstate_names(&self) -> &[String] {
        &self.cstates
    }

    pub fn drv_names(&self) -> &[String] {
        &self.drv
    }

    /// All synthetic-event field names in order: the common prefix, then
    /// `<Cx>Cyc` per C-state, then the driver fields.
    pub fn synth_field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = SYNTH_COMMON_FIELDS.iter().map(|s| s.to_string()).collect();
        for cs in &self.cstates {
            names.push(format!("{}Cyc", cs));
        }
        names.extend(self.drv.iter().cloned());
        names
    }
}

/// Which encoding the consumer asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    TracePrintk,
    Synth,
}

/// fmt::Write into a fixed-size byte buffer; overflow is an error rather
/// than a reallocation, mirroring the bounded kernel-side path.
struct BoundedWriter<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl fmt::Write for BoundedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        if self.pos + bytes.len() > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }
}

fn buffer_too_small() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        "the measurement data buffer is too small",
    )
}

/// Encode a DATA record as a `key=value` line into `buf`; returns the
/// used length. Fails with `InvalidInput` when the buffer cannot hold the
/// line or the record carries no data.
pub fn encode_printk_into(rec: &Record, schema: &FieldSchema, buf: &mut [u8]) -> io::Result<usize> {
    if rec.is_ping() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "ping records carry no fields",
        ));
    }

    let mut w = BoundedWriter { buf, pos: 0 };
    write!(
        w,
        "SilentTime={} WakeLatency={} IntrLatency={} LDist={} ReqCState={} \
         TSC={} MPERF={} SMIWake={} NMIWake={} SMIIntr={} NMIIntr={}",
        rec.silent_time,
        rec.wake_latency,
        rec.intr_latency,
        rec.ldist,
        rec.req_cstate,
        rec.tsc_cycles,
        rec.mperf_cycles,
        rec.smi_wake,
        rec.nmi_wake,
        rec.smi_intr,
        rec.nmi_intr,
    )
    .map_err(|_| buffer_too_small())?;

    for (i, name) in schema.cstate_names().iter().enumerate() {
        if i >= rec.nr_cstates as usize {
            break;
        }
        write!(w, " {}Cyc={}", name, rec.cc_cyc[i]).map_err(|_| buffer_too_small())?;
    }
    for (i, name) in schema.drv_names().iter().enumerate() {
        if i >= rec.nr_drv as usize {
            break;
        }
        write!(w, " {}={}", name, rec.drv_vals[i]).map_err(|_| buffer_too_small())?;
    }

    Ok(w.pos)
}

/// Encode a DATA record as a `key=value` line.
pub fn encode_printk(rec: &Record, schema: &FieldSchema) -> io::Result<String> {
    let mut buf = [0u8; OUTBUF_SIZE];
    let len = encode_printk_into(rec, schema, &mut buf)?;
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}

/// Parse a `key=value` line back into ordered (name, value) pairs.
pub fn parse_printk(line: &str) -> Vec<(String, u64)> {
    let re = Regex::new(r"(\w+)=(\d+)").unwrap();
    re.captures_iter(line)
        .filter_map(|cap| {
            let val = cap[2].parse().ok()?;
            Some((cap[1].to_string(), val))
        })
        .collect()
}

/// The synthetic-event wire form: the record's own bytes, linear layout.
pub fn encode_synth(rec: &Record) -> Vec<u8> {
    let bytes = unsafe {
        std::slice::from_raw_parts(rec as *const Record as *const u8, mem::size_of::<Record>())
    };
    bytes.to_vec()
}

/// Decode a synthetic-event frame. The frame must be exactly one record.
pub fn decode_synth(bytes: &[u8]) -> io::Result<Record> {
    if bytes.len() != mem::size_of::<Record>() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "synthetic event frame is {} bytes, expected {}",
                bytes.len(),
                mem::size_of::<Record>()
            ),
        ));
    }
    let mut rec = Record::default();
    plain::copy_from_bytes(&mut rec, bytes)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "truncated record frame"))?;
    Ok(rec)
}

/// Write records in the chosen encoding.
pub struct RecordWriter<'w> {
    encoding: Encoding,
    schema: FieldSchema,
    out: &'w mut dyn Write,
}

impl<'w> RecordWriter<'w> {
    pub fn new(encoding: Encoding, schema: FieldSchema, out: &'w mut dyn Write) -> Self {
        RecordWriter {
            encoding,
            schema,
            out,
        }
    }

    pub fn write_record(&mut self, rec: &Record) -> io::Result<()> {
        match self.encoding {
            Encoding::TracePrintk => {
                let line = encode_printk(rec, &self.schema)?;
                writeln!(self.out, "{}", line)
            }
            Encoding::Synth => self.out.write_all(&encode_synth(rec)),
        }
    }
}
