// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

// Allow expect() in this module: used for fallback metric creation where
// the fallback name is guaranteed to be valid (e.g., "{name}_invalid").
#![allow(clippy::expect_used)]

//! Safe Prometheus metric registration helpers.
//!
//! The router crates are libraries used in multiple binaries. When multiple
//! components register the same metric name, the default Prometheus registry
//! returns an error, and the upstream `register_*` macros panic on that
//! error. These helpers instead log and continue, returning the previously
//! registered collector (or an unregistered fallback when the name itself is
//! invalid).

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use prometheus::{Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts};
use std::sync::LazyLock;
use tracing::{debug, warn};

#[derive(Clone)]
struct CounterEntry {
    help: String,
    metric: Counter,
}

#[derive(Clone)]
struct GaugeEntry {
    help: String,
    metric: Gauge,
}

#[derive(Clone)]
struct HistogramEntry {
    help: String,
    buckets: Vec<f64>,
    metric: Histogram,
}

#[derive(Clone)]
struct CounterVecEntry {
    help: String,
    labels: Vec<String>,
    metric: CounterVec,
}

#[derive(Clone)]
struct GaugeVecEntry {
    help: String,
    labels: Vec<String>,
    metric: GaugeVec,
}

#[derive(Clone)]
struct HistogramVecEntry {
    help: String,
    labels: Vec<String>,
    metric: HistogramVec,
}

static COUNTERS: LazyLock<DashMap<String, CounterEntry>> = LazyLock::new(DashMap::new);
static GAUGES: LazyLock<DashMap<String, GaugeEntry>> = LazyLock::new(DashMap::new);
static HISTOGRAMS: LazyLock<DashMap<String, HistogramEntry>> = LazyLock::new(DashMap::new);
static COUNTER_VECS: LazyLock<DashMap<String, CounterVecEntry>> = LazyLock::new(DashMap::new);
static GAUGE_VECS: LazyLock<DashMap<String, GaugeVecEntry>> = LazyLock::new(DashMap::new);
static HISTOGRAM_VECS: LazyLock<DashMap<String, HistogramVecEntry>> = LazyLock::new(DashMap::new);

fn label_signature(labels: &[&str]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    labels.hash(&mut hasher);
    hasher.finish()
}

fn warn_invalid_counter_name(name: &str) {
    if !name.ends_with("_total") {
        warn!(
            metric = name,
            "Counter name does not end with _total; violates naming convention"
        );
    }
}

fn register(collector: Box<dyn prometheus::core::Collector>, name: &str, kind: &str) {
    if let Err(e) = prometheus::default_registry().register(collector) {
        match e {
            prometheus::Error::AlreadyReg => {
                debug!(metric = name, "{kind} already registered; continuing");
            }
            other => {
                warn!(
                    metric = name,
                    error = %other,
                    "{kind} registration failed; continuing without global registration"
                );
            }
        }
    }
}

/// Get or create a monotonic counter.
pub fn counter(name: &str, help: &str) -> Counter {
    warn_invalid_counter_name(name);

    match COUNTERS.entry(name.to_string()) {
        Entry::Occupied(entry) => {
            if entry.get().help != help {
                warn!(
                    metric = name,
                    existing_help = entry.get().help.as_str(),
                    requested_help = help,
                    "Counter help mismatch; reusing existing metric"
                );
            }
            entry.get().metric.clone()
        }
        Entry::Vacant(entry) => {
            let metric = Counter::new(name, help).unwrap_or_else(|e| {
                warn!(metric = name, error = %e, "Failed to create Counter");
                Counter::new(format!("{name}_invalid"), help)
                    .expect("fallback counter name should be valid")
            });
            register(Box::new(metric.clone()), name, "Counter");
            entry.insert(CounterEntry {
                help: help.to_string(),
                metric: metric.clone(),
            });
            metric
        }
    }
}

/// Get or create a settable gauge.
pub fn gauge(name: &str, help: &str) -> Gauge {
    match GAUGES.entry(name.to_string()) {
        Entry::Occupied(entry) => {
            if entry.get().help != help {
                warn!(
                    metric = name,
                    existing_help = entry.get().help.as_str(),
                    requested_help = help,
                    "Gauge help mismatch; reusing existing metric"
                );
            }
            entry.get().metric.clone()
        }
        Entry::Vacant(entry) => {
            let metric = Gauge::new(name, help).unwrap_or_else(|e| {
                warn!(metric = name, error = %e, "Failed to create Gauge");
                Gauge::new(format!("{name}_invalid"), help)
                    .expect("fallback gauge name should be valid")
            });
            register(Box::new(metric.clone()), name, "Gauge");
            entry.insert(GaugeEntry {
                help: help.to_string(),
                metric: metric.clone(),
            });
            metric
        }
    }
}

/// Get or create a histogram with fixed buckets.
pub fn histogram(opts: HistogramOpts) -> Histogram {
    let name = opts.common_opts.name.clone();
    let help = opts.common_opts.help.clone();
    let buckets = opts.buckets.clone();

    match HISTOGRAMS.entry(name.clone()) {
        Entry::Occupied(entry) => {
            if entry.get().help != help {
                warn!(
                    metric = %name,
                    existing_help = entry.get().help.as_str(),
                    requested_help = help,
                    "Histogram help mismatch; reusing existing metric"
                );
            }
            if entry.get().buckets != buckets {
                warn!(metric = %name, "Histogram bucket mismatch; reusing existing metric");
            }
            entry.get().metric.clone()
        }
        Entry::Vacant(entry) => {
            let metric = Histogram::with_opts(opts).unwrap_or_else(|e| {
                warn!(metric = %name, error = %e, "Failed to create Histogram");
                Histogram::with_opts(HistogramOpts::new(
                    format!("{name}_invalid"),
                    "invalid histogram",
                ))
                .expect("fallback histogram should be valid")
            });
            register(Box::new(metric.clone()), &name, "Histogram");
            entry.insert(HistogramEntry {
                help,
                buckets,
                metric: metric.clone(),
            });
            metric
        }
    }
}

/// Get or create a labelled counter family.
pub fn counter_vec(opts: Opts, labels: &[&str]) -> CounterVec {
    let name = opts.name.clone();
    let help = opts.help.clone();
    let requested_labels: Vec<String> = labels.iter().map(|s| (*s).to_string()).collect();

    warn_invalid_counter_name(&name);

    match COUNTER_VECS.entry(name.clone()) {
        Entry::Occupied(entry) => {
            if entry.get().labels != requested_labels {
                let sig = label_signature(labels);
                warn!(
                    metric = %name,
                    signature = format!("{sig:016x}"),
                    "CounterVec label names mismatch; using a fallback metric"
                );
                let fallback_name = format!("{name}_invalid_{sig:016x}");
                let metric =
                    CounterVec::new(Opts::new(fallback_name.clone(), "invalid counter vec"), labels)
                        .expect("fallback counter vec should be valid");
                register(Box::new(metric.clone()), &fallback_name, "CounterVec");
                return metric;
            }
            if entry.get().help != help {
                warn!(
                    metric = %name,
                    existing_help = entry.get().help.as_str(),
                    requested_help = help.as_str(),
                    "CounterVec help mismatch; reusing existing metric"
                );
            }
            entry.get().metric.clone()
        }
        Entry::Vacant(entry) => {
            let metric = CounterVec::new(opts, labels).unwrap_or_else(|e| {
                warn!(metric = %name, error = %e, "Failed to create CounterVec");
                CounterVec::new(
                    Opts::new(format!("{name}_invalid"), "invalid counter vec"),
                    labels,
                )
                .expect("fallback counter vec should be valid")
            });
            register(Box::new(metric.clone()), &name, "CounterVec");
            entry.insert(CounterVecEntry {
                help,
                labels: requested_labels,
                metric: metric.clone(),
            });
            metric
        }
    }
}

/// Get or create a labelled gauge family.
pub fn gauge_vec(opts: Opts, labels: &[&str]) -> GaugeVec {
    let name = opts.name.clone();
    let help = opts.help.clone();
    let requested_labels: Vec<String> = labels.iter().map(|s| (*s).to_string()).collect();

    match GAUGE_VECS.entry(name.clone()) {
        Entry::Occupied(entry) => {
            if entry.get().labels != requested_labels {
                let sig = label_signature(labels);
                warn!(
                    metric = %name,
                    signature = format!("{sig:016x}"),
                    "GaugeVec label names mismatch; using a fallback metric"
                );
                let fallback_name = format!("{name}_invalid_{sig:016x}");
                let metric =
                    GaugeVec::new(Opts::new(fallback_name.clone(), "invalid gauge vec"), labels)
                        .expect("fallback gauge vec should be valid");
                register(Box::new(metric.clone()), &fallback_name, "GaugeVec");
                return metric;
            }
            if entry.get().help != help {
                warn!(
                    metric = %name,
                    existing_help = entry.get().help.as_str(),
                    requested_help = help.as_str(),
                    "GaugeVec help mismatch; reusing existing metric"
                );
            }
            entry.get().metric.clone()
        }
        Entry::Vacant(entry) => {
            let metric = GaugeVec::new(opts, labels).unwrap_or_else(|e| {
                warn!(metric = %name, error = %e, "Failed to create GaugeVec");
                GaugeVec::new(
                    Opts::new(format!("{name}_invalid"), "invalid gauge vec"),
                    labels,
                )
                .expect("fallback gauge vec should be valid")
            });
            register(Box::new(metric.clone()), &name, "GaugeVec");
            entry.insert(GaugeVecEntry {
                help,
                labels: requested_labels,
                metric: metric.clone(),
            });
            metric
        }
    }
}

/// Get or create a labelled histogram family.
pub fn histogram_vec(opts: HistogramOpts, labels: &[&str]) -> HistogramVec {
    let name = opts.common_opts.name.clone();
    let help = opts.common_opts.help.clone();
    let requested_labels: Vec<String> = labels.iter().map(|s| (*s).to_string()).collect();

    match HISTOGRAM_VECS.entry(name.clone()) {
        Entry::Occupied(entry) => {
            if entry.get().labels != requested_labels {
                let sig = label_signature(labels);
                warn!(
                    metric = %name,
                    signature = format!("{sig:016x}"),
                    "HistogramVec label names mismatch; using a fallback metric"
                );
                let fallback_name = format!("{name}_invalid_{sig:016x}");
                let metric = HistogramVec::new(
                    HistogramOpts::new(fallback_name.clone(), "invalid histogram vec"),
                    labels,
                )
                .expect("fallback histogram vec should be valid");
                register(Box::new(metric.clone()), &fallback_name, "HistogramVec");
                return metric;
            }
            if entry.get().help != help {
                warn!(
                    metric = %name,
                    existing_help = entry.get().help.as_str(),
                    requested_help = help.as_str(),
                    "HistogramVec help mismatch; reusing existing metric"
                );
            }
            entry.get().metric.clone()
        }
        Entry::Vacant(entry) => {
            let metric = HistogramVec::new(opts, labels).unwrap_or_else(|e| {
                warn!(metric = %name, error = %e, "Failed to create HistogramVec");
                HistogramVec::new(
                    HistogramOpts::new(format!("{name}_invalid"), "invalid histogram vec"),
                    labels,
                )
                .expect("fallback histogram vec should be valid")
            });
            register(Box::new(metric.clone()), &name, "HistogramVec");
            entry.insert(HistogramVecEntry {
                help,
                labels: requested_labels,
                metric: metric.clone(),
            });
            metric
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_reuse_same_name() {
        let a = counter("atp_metrics_test_reuse_total", "test counter");
        let b = counter("atp_metrics_test_reuse_total", "test counter");
        a.inc();
        b.inc();
        assert_eq!(a.get(), 2.0);
    }

    #[test]
    fn test_counter_help_mismatch_reuses_existing() {
        let a = counter("atp_metrics_test_help_total", "original help");
        let b = counter("atp_metrics_test_help_total", "different help");
        a.inc();
        assert_eq!(b.get(), 1.0);
    }

    #[test]
    fn test_gauge_set_and_get() {
        let g = gauge("atp_metrics_test_gauge", "test gauge");
        g.set(42.0);
        assert_eq!(g.get(), 42.0);
        g.dec();
        assert_eq!(g.get(), 41.0);
    }

    #[test]
    fn test_histogram_observation() {
        let h = histogram(
            HistogramOpts::new("atp_metrics_test_hist_seconds", "test histogram")
                .buckets(vec![0.1, 1.0, 10.0]),
        );
        h.observe(0.5);
        h.observe(5.0);
        assert_eq!(h.get_sample_count(), 2);
    }

    #[test]
    fn test_counter_vec_label_mismatch_falls_back() {
        let a = counter_vec(
            Opts::new("atp_metrics_test_vec_total", "test vec"),
            &["tenant"],
        );
        a.with_label_values(&["t1"]).inc();

        // Same name, different labels: must not panic, must not alias.
        let b = counter_vec(
            Opts::new("atp_metrics_test_vec_total", "test vec"),
            &["other"],
        );
        b.with_label_values(&["x"]).inc();
        assert_eq!(a.with_label_values(&["t1"]).get(), 1.0);
    }

    #[test]
    fn test_histogram_vec_reuse() {
        let opts = HistogramOpts::new("atp_metrics_test_histvec_seconds", "test")
            .buckets(vec![1.0, 2.0]);
        let a = histogram_vec(opts.clone(), &["stage"]);
        let b = histogram_vec(opts, &["stage"]);
        a.with_label_values(&["s1"]).observe(1.5);
        assert_eq!(b.with_label_values(&["s1"]).get_sample_count(), 1);
    }
}
