//! Metric definitions.
//!
//! A typed catalog of the wult datapoint metrics (names, titles, units)
//! plus helpers for the C-state metric naming convention, and the
//! turbostat input schema the statistics collector consumes. The
//! turbostat part is boundary documentation: nothing in the measurement
//! engine reads it, it fixes the interface for the external collector.

/// How a metric's values behave; drives formatting and downstream
/// aggregation choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Nanosecond interval.
    Time,
    /// Cycle count delta.
    Cycles,
    /// Monotone event count delta.
    Count,
    /// Small integer identifier.
    Index,
}

/// One metric definition.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub name: &'static str,
    pub title: &'static str,
    pub descr: &'static str,
    pub unit: Option<&'static str>,
    pub short_unit: Option<&'static str>,
    pub kind: MetricKind,
}

/// The fixed wult metrics, in record order.
pub static WULT_METRICS: &[MetricDef] = &[
    MetricDef {
        name: "SilentTime",
        title: "Silent time",
        descr: "Time the CPU spent sleeping before the wake event fired",
        unit: Some("nanosecond"),
        short_unit: Some("ns"),
        kind: MetricKind::Time,
    },
    MetricDef {
        name: "WakeLatency",
        title: "Wake latency",
        descr: "Time from the programmed launch until the CPU resumed execution",
        unit: Some("nanosecond"),
        short_unit: Some("ns"),
        kind: MetricKind::Time,
    },
    MetricDef {
        name: "IntrLatency",
        title: "Interrupt latency",
        descr: "Time from the programmed launch until the interrupt handler ran",
        unit: Some("nanosecond"),
        short_unit: Some("ns"),
        kind: MetricKind::Time,
    },
    MetricDef {
        name: "LDist",
        title: "Launch distance",
        descr: "Requested delay between arming and the wake event",
        unit: Some("nanosecond"),
        short_unit: Some("ns"),
        kind: MetricKind::Time,
    },
    MetricDef {
        name: "ReqCState",
        title: "Requested C-state",
        descr: "C-state index the OS requested on idle entry",
        unit: None,
        short_unit: None,
        kind: MetricKind::Index,
    },
    MetricDef {
        name: "TotCyc",
        title: "Total cycles",
        descr: "TSC cycles between the before-idle and after-idle points",
        unit: Some("cycle"),
        short_unit: Some("cyc"),
        kind: MetricKind::Cycles,
    },
    MetricDef {
        name: "CC0Cyc",
        title: "Busy cycles",
        descr: "MPERF cycles, counting only while the CPU was not idle",
        unit: Some("cycle"),
        short_unit: Some("cyc"),
        kind: MetricKind::Cycles,
    },
    MetricDef {
        name: "SMIWake",
        title: "SMIs while sleeping",
        descr: "SMI count delta between idle entry and idle exit",
        unit: None,
        short_unit: None,
        kind: MetricKind::Count,
    },
    MetricDef {
        name: "NMIWake",
        title: "NMIs while sleeping",
        descr: "NMI count delta between idle entry and idle exit",
        unit: None,
        short_unit: None,
        kind: MetricKind::Count,
    },
    MetricDef {
        name: "SMIIntr",
        title: "SMIs until interrupt",
        descr: "SMI count delta between idle entry and the interrupt handler",
        unit: None,
        short_unit: None,
        kind: MetricKind::Count,
    },
    MetricDef {
        name: "NMIIntr",
        title: "NMIs until interrupt",
        descr: "NMI count delta between idle entry and the interrupt handler",
        unit: None,
        short_unit: None,
        kind: MetricKind::Count,
    },
];

/// Look up a fixed wult metric by name.
pub fn wult_metric(name: &str) -> Option<&'static MetricDef> {
    WULT_METRICS.iter().find(|def| def.name == name)
}

/// True for C-state cycle count metrics like "CC6Cyc" or "PC10Cyc".
pub fn is_cscyc_metric(metric: &str) -> bool {
    (metric.starts_with("CC") || metric.starts_with("PC") || metric.starts_with("MC"))
        && metric.ends_with("Cyc")
        && metric.len() > 5
}

/// True for C-state residency metrics like "CC6%".
pub fn is_csres_metric(metric: &str) -> bool {
    (metric.starts_with("CC") || metric.starts_with("PC") || metric.starts_with("MC"))
        && metric.ends_with('%')
        && metric.len() > 3
}

/// Extract the C-state name out of a C-state metric, e.g. "CC6Cyc" ->
/// "CC6".
pub fn csname_of(metric: &str) -> Option<&str> {
    if is_cscyc_metric(metric) {
        return metric.strip_suffix("Cyc");
    }
    if is_csres_metric(metric) {
        return metric.strip_suffix('%');
    }
    None
}

/// Cycle count metric name for a C-state.
pub fn cscyc_metric(csname: &str) -> String {
    format!("{}Cyc", csname)
}

/// Residency metric name for a C-state.
pub fn csres_metric(csname: &str) -> String {
    format!("{}%", csname)
}

/// One turbostat column the statistics collector recognizes.
#[derive(Debug, Clone, Copy)]
pub struct TurbostatColDef {
    pub name: &'static str,
    pub title: &'static str,
    pub descr: &'static str,
    pub unit: Option<&'static str>,
    pub short_unit: Option<&'static str>,
    pub kind: MetricKind,
    /// Whether rows with an empty value in this column are dropped.
    pub drop_empty: bool,
}

/// Scalar turbostat columns. The C-state residency column families
/// ("C1%", "CPU%c6", "Pkg%pc6", ...) are matched by the predicates below
/// instead of being enumerated.
pub static TURBOSTAT_COLS: &[TurbostatColDef] = &[
    TurbostatColDef {
        name: "Busy%",
        title: "Busy percent",
        descr: "Percentage of time the CPU was not idle",
        unit: Some("percent"),
        short_unit: Some("%"),
        kind: MetricKind::Index,
        drop_empty: false,
    },
    TurbostatColDef {
        name: "Bzy_MHz",
        title: "Busy frequency",
        descr: "Average frequency while busy",
        unit: Some("megahertz"),
        short_unit: Some("MHz"),
        kind: MetricKind::Count,
        drop_empty: false,
    },
    TurbostatColDef {
        name: "Avg_MHz",
        title: "Average frequency",
        descr: "Average frequency over the measurement interval",
        unit: Some("megahertz"),
        short_unit: Some("MHz"),
        kind: MetricKind::Count,
        drop_empty: false,
    },
    TurbostatColDef {
        name: "UncMHz",
        title: "Uncore frequency",
        descr: "Uncore clock frequency",
        unit: Some("megahertz"),
        short_unit: Some("MHz"),
        kind: MetricKind::Count,
        drop_empty: true,
    },
    TurbostatColDef {
        name: "CorWatt",
        title: "Core power",
        descr: "RAPL core domain power",
        unit: Some("watt"),
        short_unit: Some("W"),
        kind: MetricKind::Count,
        drop_empty: true,
    },
    TurbostatColDef {
        name: "PkgWatt",
        title: "Package power",
        descr: "RAPL package domain power",
        unit: Some("watt"),
        short_unit: Some("W"),
        kind: MetricKind::Count,
        drop_empty: true,
    },
    TurbostatColDef {
        name: "GFXWatt",
        title: "Graphics power",
        descr: "RAPL graphics domain power",
        unit: Some("watt"),
        short_unit: Some("W"),
        kind: MetricKind::Count,
        drop_empty: true,
    },
    TurbostatColDef {
        name: "CoreTmp",
        title: "Core temperature",
        descr: "Per-core temperature",
        unit: Some("degree Celsius"),
        short_unit: Some("C"),
        kind: MetricKind::Count,
        drop_empty: true,
    },
    TurbostatColDef {
        name: "PkgTmp",
        title: "Package temperature",
        descr: "Package temperature",
        unit: Some("degree Celsius"),
        short_unit: Some("C"),
        kind: MetricKind::Count,
        drop_empty: true,
    },
    TurbostatColDef {
        name: "IRQ",
        title: "Interrupts",
        descr: "Interrupts serviced during the interval",
        unit: None,
        short_unit: None,
        kind: MetricKind::Count,
        drop_empty: false,
    },
    TurbostatColDef {
        name: "SMI",
        title: "System management interrupts",
        descr: "SMIs during the interval",
        unit: None,
        short_unit: None,
        kind: MetricKind::Count,
        drop_empty: false,
    },
    TurbostatColDef {
        name: "IPC",
        title: "Instructions per cycle",
        descr: "Retired instructions per core cycle",
        unit: None,
        short_unit: None,
        kind: MetricKind::Count,
        drop_empty: true,
    },
    TurbostatColDef {
        name: "Time_Of_Day_Seconds",
        title: "Time of day",
        descr: "Wall clock at the end of the interval",
        unit: Some("second"),
        short_unit: Some("s"),
        kind: MetricKind::Time,
        drop_empty: false,
    },
];

/// True for requestable C-state residency columns like "C1%" or "C6E%".
pub fn is_turbostat_reqcs(col: &str) -> bool {
    let mut chars = col.chars();
    chars.next() == Some('C')
        && chars.next().is_some_and(|c| c.is_ascii_digit())
        && col.ends_with('%')
}

/// True for hardware core C-state columns like "CPU%c6".
pub fn is_turbostat_hwcs(col: &str) -> bool {
    col.starts_with("CPU%")
}

/// True for hardware package C-state columns like "Pkg%pc6".
pub fn is_turbostat_pkgcs(col: &str) -> bool {
    col.starts_with("Pkg%")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wult_metric_lookup() {
        let def = wult_metric("WakeLatency").unwrap();
        assert_eq!(def.short_unit, Some("ns"));
        assert_eq!(def.kind, MetricKind::Time);
        assert!(wult_metric("NoSuchMetric").is_none());
    }

    #[test]
    fn test_cstate_metric_helpers() {
        assert!(is_cscyc_metric("CC6Cyc"));
        assert!(is_cscyc_metric("PC10Cyc"));
        assert!(is_cscyc_metric("MC6Cyc"));
        assert!(!is_cscyc_metric("TotCyc"));
        assert!(!is_cscyc_metric("CCCyc"));

        assert!(is_csres_metric("CC6%"));
        assert!(!is_csres_metric("Busy%"));

        assert_eq!(csname_of("CC6Cyc"), Some("CC6"));
        assert_eq!(csname_of("PC10%"), Some("PC10"));
        assert_eq!(csname_of("SilentTime"), None);

        assert_eq!(cscyc_metric("CC6"), "CC6Cyc");
        assert_eq!(csres_metric("PC6"), "PC6%");
    }

    #[test]
    fn test_turbostat_predicates() {
        assert!(is_turbostat_reqcs("C1%"));
        assert!(is_turbostat_reqcs("C6E%"));
        assert!(!is_turbostat_reqcs("CPU%c6"));

        assert!(is_turbostat_hwcs("CPU%c1"));
        assert!(is_turbostat_pkgcs("Pkg%pc6"));
        assert!(!is_turbostat_pkgcs("PkgWatt"));
    }

    #[test]
    fn test_turbostat_catalog() {
        assert!(TURBOSTAT_COLS.iter().any(|c| c.name == "Bzy_MHz"));
        let unc = TURBOSTAT_COLS.iter().find(|c| c.name == "UncMHz").unwrap();
        assert!(unc.drop_empty);
    }
}
