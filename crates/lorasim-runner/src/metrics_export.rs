//! In-memory metrics recorder and end-of-run export.
//!
//! The recorder is installed as the global `metrics` recorder for the run.
//! A [`MetricsSnapshot`] aggregates every series by metric name, by node
//! and by node type; Prometheus export writes each labelled series as is.

use lorasim_metrics::metric_defs;
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Snapshot Types
// ============================================================================

/// Metric values of one node or node type.
#[derive(Debug, Default, Clone, Serialize)]
pub struct NodeMetrics {
    /// Counters.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
    /// Gauges.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub gauges: BTreeMap<String, f64>,
    /// Histograms.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Collected metric data for export.
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    /// Wall-clock time the snapshot was taken.
    pub timestamp: String,
    /// Counters summed over every series.
    pub counters: BTreeMap<String, u64>,
    /// Gauges summed over every series.
    pub gauges: BTreeMap<String, f64>,
    /// Histograms merged over every series.
    pub histograms: BTreeMap<String, HistogramSummary>,
    /// Breakdown by `node_type` label.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub node_types: BTreeMap<String, NodeMetrics>,
    /// Breakdown by `node` label.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, NodeMetrics>,
}

/// Summary statistics of a histogram.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    /// Samples recorded.
    pub count: u64,
    /// Sum of all samples.
    pub sum: f64,
    /// Smallest sample.
    pub min: f64,
    /// Largest sample.
    pub max: f64,
    /// Mean.
    pub mean: f64,
    /// Median.
    pub p50: f64,
    /// 90th percentile.
    pub p90: f64,
    /// 99th percentile.
    pub p99: f64,
}

// ============================================================================
// Export Functions
// ============================================================================

/// Export a snapshot as pretty JSON.
pub fn export_json<W: Write>(snapshot: &MetricsSnapshot, writer: &mut W) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *writer, snapshot)?;
    writeln!(writer)?;
    Ok(())
}

/// Export every recorded series in Prometheus text exposition format.
pub fn export_prometheus<W: Write>(recorder: &InMemoryRecorder, writer: &mut W) -> std::io::Result<()> {
    let state = &recorder.state;
    let metadata = state.key_metadata.read();

    let counters = state.counters.read();
    let mut last_name = "";
    for (key, counter) in counters.iter() {
        let Some(meta) = metadata.get(key) else { continue };
        if meta.name != last_name {
            write_header(writer, &meta.name, "counter")?;
            last_name = &meta.name;
        }
        writeln!(writer, "{}{} {}", prom_name(&meta.name), meta.prom_labels(None), counter.get())?;
    }

    let gauges = state.gauges.read();
    let mut last_name = "";
    for (key, gauge) in gauges.iter() {
        let Some(meta) = metadata.get(key) else { continue };
        if meta.name != last_name {
            write_header(writer, &meta.name, "gauge")?;
            last_name = &meta.name;
        }
        writeln!(
            writer,
            "{}{} {}",
            prom_name(&meta.name),
            meta.prom_labels(None),
            format_float(gauge.get())
        )?;
    }

    let histograms = state.histograms.read();
    let mut last_name = "";
    for (key, histogram) in histograms.iter() {
        let Some(meta) = metadata.get(key) else { continue };
        if meta.name != last_name {
            write_header(writer, &meta.name, "summary")?;
            last_name = &meta.name;
        }
        let name = prom_name(&meta.name);
        let summary = histogram.summary();
        for (q, v) in [("0.5", summary.p50), ("0.9", summary.p90), ("0.99", summary.p99)] {
            writeln!(writer, "{}{} {}", name, meta.prom_labels(Some(q)), format_float(v))?;
        }
        writeln!(writer, "{}_sum{} {}", name, meta.prom_labels(None), format_float(summary.sum))?;
        writeln!(writer, "{}_count{} {}", name, meta.prom_labels(None), summary.count)?;
    }

    Ok(())
}

fn write_header<W: Write>(writer: &mut W, name: &str, kind: &str) -> std::io::Result<()> {
    let prom = prom_name(name);
    if let Some(def) = metric_defs::find(name) {
        writeln!(writer, "# HELP {} {}", prom, def.description)?;
    }
    writeln!(writer, "# TYPE {} {}", prom, kind)
}

fn prom_name(name: &str) -> String {
    name.replace('.', "_")
}

fn format_float(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Default)]
struct CounterState {
    value: AtomicU64,
}

impl CounterState {
    fn increment(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// f64 bits in an atomic.
#[derive(Debug, Default)]
struct GaugeState {
    value: AtomicU64,
}

impl GaugeState {
    fn set(&self, value: f64) {
        self.value.store(value.to_bits(), Ordering::Relaxed);
    }

    fn increment(&self, value: f64) {
        let _ = self.value.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
            Some((f64::from_bits(bits) + value).to_bits())
        });
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

/// Samples kept per histogram for percentiles.
const HISTOGRAM_RESERVOIR_SIZE: usize = 10_000;

/// Histogram with exact count/sum/min/max and a reservoir sample
/// (Vitter's algorithm R) for percentiles.
#[derive(Debug)]
struct HistogramState {
    inner: Mutex<HistogramInner>,
}

#[derive(Debug)]
struct HistogramInner {
    reservoir: Vec<f64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    rng: ChaCha8Rng,
}

impl Default for HistogramState {
    fn default() -> Self {
        HistogramState {
            inner: Mutex::new(HistogramInner {
                reservoir: Vec::new(),
                count: 0,
                sum: 0.0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                rng: ChaCha8Rng::seed_from_u64(0x5eed),
            }),
        }
    }
}

impl HistogramState {
    fn record(&self, value: f64) {
        let mut h = self.inner.lock();
        h.count += 1;
        h.sum += value;
        h.min = h.min.min(value);
        h.max = h.max.max(value);
        if h.reservoir.len() < HISTOGRAM_RESERVOIR_SIZE {
            h.reservoir.push(value);
        } else {
            let n = h.count;
            let j = h.rng.gen_range(0..n) as usize;
            if j < HISTOGRAM_RESERVOIR_SIZE {
                h.reservoir[j] = value;
            }
        }
    }

    fn summary(&self) -> HistogramSummary {
        let h = self.inner.lock();
        if h.count == 0 {
            return HistogramSummary::default();
        }
        let mut sorted = h.reservoir.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        HistogramSummary {
            count: h.count,
            sum: h.sum,
            min: h.min,
            max: h.max,
            mean: h.sum / h.count as f64,
            p50: percentile(&sorted, 50.0),
            p90: percentile(&sorted, 90.0),
            p99: percentile(&sorted, 99.0),
        }
    }

    fn samples(&self) -> Vec<f64> {
        self.inner.lock().reservoir.clone()
    }
}

/// Nearest-rank percentile of sorted samples.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn summarize(samples: &[f64]) -> HistogramSummary {
    if samples.is_empty() {
        return HistogramSummary::default();
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let sum: f64 = sorted.iter().sum();
    HistogramSummary {
        count: sorted.len() as u64,
        sum,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        mean: sum / sorted.len() as f64,
        p50: percentile(&sorted, 50.0),
        p90: percentile(&sorted, 90.0),
        p99: percentile(&sorted, 99.0),
    }
}

/// Name and labels of a series.
#[derive(Debug, Clone)]
struct KeyMetadata {
    name: String,
    labels: Vec<(String, String)>,
}

impl KeyMetadata {
    fn from_key(key: &Key) -> Self {
        KeyMetadata {
            name: key.name().to_string(),
            labels: key
                .labels()
                .map(|l| (l.key().to_string(), l.value().to_string()))
                .collect(),
        }
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    fn prom_labels(&self, quantile: Option<&str>) -> String {
        let mut parts: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        if let Some(q) = quantile {
            parts.push(format!("quantile=\"{}\"", q));
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", parts.join(","))
        }
    }
}

/// Unique string of a key, labels included.
fn key_to_string(key: &Key) -> String {
    let labels: Vec<String> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
    if labels.is_empty() {
        key.name().to_string()
    } else {
        format!("{}|{}", key.name(), labels.join(","))
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    counters: RwLock<BTreeMap<String, Arc<CounterState>>>,
    gauges: RwLock<BTreeMap<String, Arc<GaugeState>>>,
    histograms: RwLock<BTreeMap<String, Arc<HistogramState>>>,
    key_metadata: RwLock<BTreeMap<String, KeyMetadata>>,
}

impl RecorderState {
    fn remember(&self, key_str: &str, key: &Key) {
        let mut metadata = self.key_metadata.write();
        if !metadata.contains_key(key_str) {
            metadata.insert(key_str.to_string(), KeyMetadata::from_key(key));
        }
    }

    fn get_or_create_counter(&self, key: &Key) -> Arc<CounterState> {
        let key_str = key_to_string(key);
        if let Some(counter) = self.counters.read().get(&key_str) {
            return counter.clone();
        }
        self.remember(&key_str, key);
        self.counters.write().entry(key_str).or_default().clone()
    }

    fn get_or_create_gauge(&self, key: &Key) -> Arc<GaugeState> {
        let key_str = key_to_string(key);
        if let Some(gauge) = self.gauges.read().get(&key_str) {
            return gauge.clone();
        }
        self.remember(&key_str, key);
        self.gauges.write().entry(key_str).or_default().clone()
    }

    fn get_or_create_histogram(&self, key: &Key) -> Arc<HistogramState> {
        let key_str = key_to_string(key);
        if let Some(histogram) = self.histograms.read().get(&key_str) {
            return histogram.clone();
        }
        self.remember(&key_str, key);
        self.histograms.write().entry(key_str).or_default().clone()
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let metadata = self.key_metadata.read();

        let mut counters: BTreeMap<String, u64> = BTreeMap::new();
        let mut gauges: BTreeMap<String, f64> = BTreeMap::new();
        let mut samples: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut node_types: BTreeMap<String, NodeMetrics> = BTreeMap::new();
        let mut type_samples: BTreeMap<(String, String), Vec<f64>> = BTreeMap::new();
        let mut nodes: BTreeMap<String, NodeMetrics> = BTreeMap::new();

        for (key_str, counter) in self.counters.read().iter() {
            let Some(meta) = metadata.get(key_str) else { continue };
            let value = counter.get();
            *counters.entry(meta.name.clone()).or_insert(0) += value;
            if let Some(node) = meta.label("node") {
                *nodes
                    .entry(node.to_string())
                    .or_default()
                    .counters
                    .entry(meta.name.clone())
                    .or_insert(0) += value;
            }
            if let Some(node_type) = meta.label("node_type") {
                *node_types
                    .entry(node_type.to_string())
                    .or_default()
                    .counters
                    .entry(meta.name.clone())
                    .or_insert(0) += value;
            }
        }

        for (key_str, gauge) in self.gauges.read().iter() {
            let Some(meta) = metadata.get(key_str) else { continue };
            let value = gauge.get();
            *gauges.entry(meta.name.clone()).or_insert(0.0) += value;
            if let Some(node) = meta.label("node") {
                *nodes
                    .entry(node.to_string())
                    .or_default()
                    .gauges
                    .entry(meta.name.clone())
                    .or_insert(0.0) += value;
            }
            if let Some(node_type) = meta.label("node_type") {
                *node_types
                    .entry(node_type.to_string())
                    .or_default()
                    .gauges
                    .entry(meta.name.clone())
                    .or_insert(0.0) += value;
            }
        }

        for (key_str, histogram) in self.histograms.read().iter() {
            let Some(meta) = metadata.get(key_str) else { continue };
            let reservoir = histogram.samples();
            samples.entry(meta.name.clone()).or_default().extend(&reservoir);
            if let Some(node_type) = meta.label("node_type") {
                type_samples
                    .entry((node_type.to_string(), meta.name.clone()))
                    .or_default()
                    .extend(&reservoir);
            }
            if let Some(node) = meta.label("node") {
                // A node with several series of one histogram (extra labels)
                // keeps the last one; the merged view is in `histograms`.
                nodes
                    .entry(node.to_string())
                    .or_default()
                    .histograms
                    .insert(meta.name.clone(), histogram.summary());
            }
        }

        for ((node_type, name), s) in type_samples {
            node_types
                .entry(node_type)
                .or_default()
                .histograms
                .insert(name, summarize(&s));
        }

        MetricsSnapshot {
            timestamp,
            counters,
            gauges,
            histograms: samples.into_iter().map(|(name, s)| (name, summarize(&s))).collect(),
            node_types,
            nodes,
        }
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// Recorder keeping every metric in memory until the end of the run.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecorder {
    state: Arc<RecorderState>,
}

impl InMemoryRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregate the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state.snapshot()
    }
}

struct InMemoryCounter {
    state: Arc<CounterState>,
}

impl metrics::CounterFn for InMemoryCounter {
    fn increment(&self, value: u64) {
        self.state.increment(value);
    }

    fn absolute(&self, value: u64) {
        self.state.value.store(value, Ordering::Relaxed);
    }
}

struct InMemoryGauge {
    state: Arc<GaugeState>,
}

impl metrics::GaugeFn for InMemoryGauge {
    fn increment(&self, value: f64) {
        self.state.increment(value);
    }

    fn decrement(&self, value: f64) {
        self.state.increment(-value);
    }

    fn set(&self, value: f64) {
        self.state.set(value);
    }
}

struct InMemoryHistogram {
    state: Arc<HistogramState>,
}

impl metrics::HistogramFn for InMemoryHistogram {
    fn record(&self, value: f64) {
        self.state.record(value);
    }
}

impl Recorder for InMemoryRecorder {
    // Units and descriptions come from `metric_defs` at export time.
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        let state = self.state.get_or_create_counter(key);
        Counter::from_arc(Arc::new(InMemoryCounter { state }))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        let state = self.state.get_or_create_gauge(key);
        Gauge::from_arc(Arc::new(InMemoryGauge { state }))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        let state = self.state.get_or_create_histogram(key);
        Histogram::from_arc(Arc::new(InMemoryHistogram { state }))
    }
}
