use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use wult::cstates::{self, CstateBank};
use wult::defs;
use wult::device::{BpfTimer, DelayedEvent, HrtTimer};
use wult::encode::{Encoding, RecordWriter};
use wult::engine::{Config, Engine};

#[derive(Debug, Parser)]
#[command(name = "wult", about = "Measure CPU wake-up latency out of idle C-states")]
struct Command {
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Run a measurement and stream datapoints.
    #[clap(name = "start")]
    Start(StartOpts),
    /// Report detected devices and C-state counters.
    #[clap(name = "scan")]
    Scan(ScanOpts),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DeviceOpt {
    /// timerfd-backed high resolution timer
    Hrt,
    /// sandbox-style timer with perf-event counter reads
    Bpf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatOpt {
    /// key=value text lines
    Printk,
    /// fixed-layout binary records
    Synth,
}

#[derive(Debug, Args)]
struct StartOpts {
    /// Verbosity level (0 = warn, 1 = info, 2 = debug, 3+ = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// CPU to measure
    #[arg(short, long, default_value = "0")]
    cpu: u32,
    /// Launch distance range lower bound, nanoseconds
    #[arg(long, default_value = "1000")]
    ldist_from: u64,
    /// Launch distance range upper bound (exclusive), nanoseconds
    #[arg(long, default_value = "4000000")]
    ldist_to: u64,
    /// Number of datapoints to collect
    #[arg(short, long, default_value = "10000")]
    datapoints: u64,
    /// Delayed-event device
    #[arg(long, value_enum, default_value_t = DeviceOpt::Hrt)]
    device: DeviceOpt,
    /// Output encoding
    #[arg(long, value_enum, default_value_t = FormatOpt::Printk)]
    format: FormatOpt,
    /// Write records to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// C-state index to request on idle entry (0 = POLL, bpf only)
    #[arg(long, default_value = "2")]
    cstate: u32,
    /// Event ring capacity in records
    #[arg(long, default_value = "4096")]
    ring_slots: usize,
}

#[derive(Debug, Args)]
struct ScanOpts {
    /// Verbosity level (0 = warn, 1 = info, 2 = debug, 3+ = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// CPU to probe
    #[arg(short, long, default_value = "0")]
    cpu: u32,
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn start(opts: StartOpts) -> Result<()> {
    init_logging(opts.verbose);

    let cfg = Config {
        cpu: opts.cpu,
        ldist_from: opts.ldist_from,
        ldist_to: opts.ldist_to,
        req_cstate: opts.cstate,
        ring_slots: opts.ring_slots,
    };

    match opts.device {
        DeviceOpt::Hrt => {
            let dev = HrtTimer::new(opts.cpu)?;
            let bank = CstateBank::detect(opts.cpu, dev.cycle_source())?;
            run_measurement(dev, bank, cfg, &opts)
        }
        DeviceOpt::Bpf => {
            let dev = BpfTimer::new(opts.cpu)?;
            let bank = CstateBank::detect(opts.cpu, dev.cycle_source())?;
            run_measurement(dev, bank, cfg, &opts)
        }
    }
}

fn run_measurement<D: DelayedEvent>(
    dev: D,
    bank: CstateBank,
    cfg: Config,
    opts: &StartOpts,
) -> Result<()> {
    let mut engine = Engine::new(dev, bank, cfg)?;
    let schema = engine.schema().clone();

    let mut file;
    let mut stdout;
    let out: &mut dyn Write = match &opts.output {
        Some(path) => {
            file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            &mut file
        }
        None => {
            stdout = std::io::stdout();
            &mut stdout
        }
    };
    let encoding = match opts.format {
        FormatOpt::Printk => Encoding::TracePrintk,
        FormatOpt::Synth => Encoding::Synth,
    };
    let mut writer = RecordWriter::new(encoding, schema, out);

    engine.enable()?;
    info!(
        "measuring cpu {}, ldist [{}, {}) ns, {} datapoints",
        opts.cpu, opts.ldist_from, opts.ldist_to, opts.datapoints
    );

    let mut collected = 0u64;
    let mut idle_polls = 0u32;
    while collected < opts.datapoints {
        match engine.next_record(Duration::from_secs(1)) {
            Some(rec) if rec.is_ping() => {
                engine.kick_cpu();
            }
            Some(rec) => {
                writer.write_record(&rec)?;
                collected += 1;
                idle_polls = 0;
            }
            None => {
                idle_polls += 1;
                if idle_polls >= 30 {
                    let stats = engine.stats();
                    anyhow::bail!(
                        "no datapoints for 30 seconds; {} armed, {} happened, stats {:?}",
                        stats.events_armed,
                        stats.events_happened,
                        stats
                    );
                }
            }
        }
    }

    engine.disable();
    let stats = engine.stats();
    info!(
        "collected {} datapoints ({} pings, {} spurious wakes, {} window discards, \
         {} nested discards, {} ring drops, {} arm failures)",
        collected,
        stats.tracer.pings,
        stats.tracer.spurious_wakes,
        stats.tracer.discarded_window,
        stats.tracer.discarded_nested,
        stats.ring_dropped,
        stats.arm_failures,
    );
    Ok(())
}

fn scan(opts: ScanOpts) -> Result<()> {
    init_logging(opts.verbose);

    let id = cstates::detect_cpu()?;
    println!(
        "cpu: {} family {} model {:#x}",
        if id.vendor_intel {
            "GenuineIntel"
        } else {
            "non-Intel"
        },
        id.family,
        id.model
    );

    match cstates::cstate_table(&id) {
        Ok(table) => {
            let metrics: Vec<_> = table.iter().map(|d| defs::cscyc_metric(d.name)).collect();
            println!("c-state cycle metrics: {}", metrics.join(" "));
        }
        Err(err) => println!("c-state counters: unsupported ({})", err),
    }

    println!("datapoint metrics:");
    for def in defs::WULT_METRICS {
        match def.short_unit {
            Some(unit) => println!("  {:<12} {} [{}]", def.name, def.title, unit),
            None => println!("  {:<12} {}", def.name, def.title),
        }
    }

    match HrtTimer::new(opts.cpu) {
        Ok(dev) => println!(
            "device wult_hrt: ldist [{}, {}] ns, granularity {} ns",
            dev.ldist_min(),
            dev.ldist_max(),
            dev.ldist_gran()
        ),
        Err(err) => println!("device wult_hrt: unavailable ({})", err),
    }

    match BpfTimer::new(opts.cpu) {
        Ok(dev) => {
            let extras = dev.trace_field_names();
            println!(
                "device wult_bpf: ldist [{}, {}] ns, extra counters: {}",
                dev.ldist_min(),
                dev.ldist_max(),
                if extras.is_empty() {
                    "none".to_string()
                } else {
                    extras.join(" ")
                }
            );
        }
        Err(err) => println!("device wult_bpf: unavailable ({})", err),
    }

    match CstateBank::detect(opts.cpu, wult::CycleSource::Rdtsc) {
        Ok(bank) => println!(
            "cpu {} bank: {}",
            opts.cpu,
            bank.names().join(" ")
        ),
        Err(err) => println!("cpu {} bank: unavailable ({})", opts.cpu, err),
    }

    Ok(())
}

fn main() -> Result<()> {
    let opts = Command::parse();
    match opts.subcmd {
        SubCommand::Start(opts) => start(opts),
        SubCommand::Scan(opts) => scan(opts),
    }
}
