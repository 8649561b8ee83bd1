//! Typed metric registry with text exposition.
//!
//! Metrics are identified by `(name, label_names)` and hold either a scalar
//! cell (counter, gauge) or a histogram cell over a fixed bucket ladder.
//! Labelled metrics keep one cell per label tuple; tuple order inside braces
//! follows the registration order of the label names.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::warn;

/// Upper bounds of the histogram buckets. An implicit `+Inf` bucket always
/// equals the observation count.
pub const HISTOGRAM_BUCKETS: [f64; 12] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub name: String,
    pub kind: MetricKind,
    pub help: String,
    pub label_names: Vec<String>,
}

/// A point-in-time cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricValue {
    Scalar { value: f64 },
    Histogram {
        sum: f64,
        count: u64,
        /// Cumulative counts per ladder bucket.
        buckets: Vec<u64>,
    },
}

impl MetricValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar { value } => Some(*value),
            MetricValue::Histogram { .. } => None,
        }
    }

    fn new_histogram() -> Self {
        MetricValue::Histogram {
            sum: 0.0,
            count: 0,
            buckets: vec![0; HISTOGRAM_BUCKETS.len()],
        }
    }

    fn observe(&mut self, v: f64) {
        if let MetricValue::Histogram { sum, count, buckets } = self {
            *sum += v;
            *count += 1;
            for (i, bound) in HISTOGRAM_BUCKETS.iter().enumerate() {
                if v <= *bound {
                    buckets[i] += 1;
                }
            }
        }
    }
}

/// One label tuple and its cell, as reported by [`MetricRegistry::snapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledValue {
    pub labels: Vec<String>,
    pub value: MetricValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub name: String,
    pub kind: MetricKind,
    pub help: String,
    pub label_names: Vec<String>,
    pub values: Vec<LabeledValue>,
}

struct MetricState {
    descriptor: MetricDescriptor,
    // BTreeMap keeps tuples in a stable order for snapshots and rendering.
    cells: BTreeMap<Vec<String>, MetricValue>,
}

struct Inner {
    metrics: HashMap<String, Arc<Mutex<MetricState>>>,
    // Registration order, used when rendering the exposition.
    order: Vec<String>,
}

/// Central metric store. The registry map is read-locked on the hot path and
/// each metric carries its own mutex, so updates are atomic per metric.
pub struct MetricRegistry {
    prefix: String,
    inner: RwLock<Inner>,
}

impl MetricRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            inner: RwLock::new(Inner {
                metrics: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Register a metric. Registration is idempotent: re-registering an
    /// existing name returns the original descriptor untouched.
    pub fn register(
        &self,
        name: &str,
        kind: MetricKind,
        help: &str,
        label_names: &[&str],
    ) -> MetricDescriptor {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.metrics.get(name) {
            let descriptor = existing.lock().descriptor.clone();
            if descriptor.kind != kind {
                warn!(
                    "metric {} already registered as {}, ignoring re-registration as {}",
                    name,
                    descriptor.kind.as_str(),
                    kind.as_str()
                );
            }
            return descriptor;
        }

        let descriptor = MetricDescriptor {
            name: name.to_string(),
            kind,
            help: help.to_string(),
            label_names: label_names.iter().map(|l| l.to_string()).collect(),
        };
        let state = MetricState {
            descriptor: descriptor.clone(),
            cells: BTreeMap::new(),
        };
        inner
            .metrics
            .insert(name.to_string(), Arc::new(Mutex::new(state)));
        inner.order.push(name.to_string());
        descriptor
    }

    fn metric(&self, name: &str) -> Option<Arc<Mutex<MetricState>>> {
        self.inner.read().metrics.get(name).cloned()
    }

    /// Resolve a label map into the tuple ordered by the registered label
    /// names. Missing labels are filled with the empty string.
    fn label_tuple(descriptor: &MetricDescriptor, labels: &HashMap<String, String>) -> Vec<String> {
        descriptor
            .label_names
            .iter()
            .map(|label| match labels.get(label) {
                Some(v) => v.clone(),
                None => {
                    warn!(
                        "metric {} missing label {:?}, using empty value",
                        descriptor.name, label
                    );
                    String::new()
                }
            })
            .collect()
    }

    /// Record a value, dispatching on the metric's kind: counters add,
    /// gauges assign, histograms observe.
    pub fn record(&self, name: &str, value: f64, labels: &HashMap<String, String>) {
        let Some(metric) = self.metric(name) else {
            warn!("record on unknown metric {}", name);
            return;
        };
        let mut state = metric.lock();
        let kind = state.descriptor.kind;
        let tuple = Self::label_tuple(&state.descriptor, labels);
        match kind {
            MetricKind::Counter => Self::counter_add(&mut state, tuple, value),
            MetricKind::Gauge => {
                state
                    .cells
                    .insert(tuple, MetricValue::Scalar { value });
            }
            MetricKind::Histogram => {
                state
                    .cells
                    .entry(tuple)
                    .or_insert_with(MetricValue::new_histogram)
                    .observe(value);
            }
        }
    }

    pub fn increment_counter(&self, name: &str, delta: f64, labels: &HashMap<String, String>) {
        let Some(metric) = self.metric(name) else {
            warn!("increment on unknown metric {}", name);
            return;
        };
        let mut state = metric.lock();
        if state.descriptor.kind != MetricKind::Counter {
            warn!("increment on non-counter metric {}", name);
            return;
        }
        let tuple = Self::label_tuple(&state.descriptor, labels);
        Self::counter_add(&mut state, tuple, delta);
    }

    fn counter_add(state: &mut MetricState, tuple: Vec<String>, delta: f64) {
        if delta < 0.0 {
            warn!(
                "counter {} rejected negative delta {}",
                state.descriptor.name, delta
            );
            return;
        }
        let cell = state
            .cells
            .entry(tuple)
            .or_insert(MetricValue::Scalar { value: 0.0 });
        if let MetricValue::Scalar { value } = cell {
            *value += delta;
        }
    }

    pub fn observe_histogram(&self, name: &str, value: f64, labels: &HashMap<String, String>) {
        let Some(metric) = self.metric(name) else {
            warn!("observe on unknown metric {}", name);
            return;
        };
        let mut state = metric.lock();
        if state.descriptor.kind != MetricKind::Histogram {
            warn!("observe on non-histogram metric {}", name);
            return;
        }
        let tuple = Self::label_tuple(&state.descriptor, labels);
        state
            .cells
            .entry(tuple)
            .or_insert_with(MetricValue::new_histogram)
            .observe(value);
    }

    pub fn get(&self, name: &str, labels: &HashMap<String, String>) -> Option<MetricValue> {
        let metric = self.metric(name)?;
        let state = metric.lock();
        let tuple = Self::label_tuple(&state.descriptor, labels);
        state.cells.get(&tuple).cloned()
    }

    /// Scalar read helper for rule closures; absent cells read as 0.
    pub fn scalar(&self, name: &str, labels: &HashMap<String, String>) -> f64 {
        self.get(name, labels)
            .and_then(|v| v.as_scalar())
            .unwrap_or(0.0)
    }

    /// Sum of all scalar cells across a metric's label tuples.
    pub fn total(&self, name: &str) -> f64 {
        let Some(metric) = self.metric(name) else {
            return 0.0;
        };
        let state = metric.lock();
        state
            .cells
            .values()
            .filter_map(|v| v.as_scalar())
            .sum()
    }

    /// Add a (possibly negative) delta to a gauge cell.
    pub fn add_gauge(&self, name: &str, delta: f64, labels: &HashMap<String, String>) {
        let Some(metric) = self.metric(name) else {
            warn!("gauge add on unknown metric {}", name);
            return;
        };
        let mut state = metric.lock();
        if state.descriptor.kind != MetricKind::Gauge {
            warn!("gauge add on non-gauge metric {}", name);
            return;
        }
        let tuple = Self::label_tuple(&state.descriptor, labels);
        let cell = state
            .cells
            .entry(tuple)
            .or_insert(MetricValue::Scalar { value: 0.0 });
        if let MetricValue::Scalar { value } = cell {
            *value += delta;
        }
    }

    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|name| inner.metrics.get(name))
            .map(|metric| {
                let state = metric.lock();
                MetricSnapshot {
                    name: state.descriptor.name.clone(),
                    kind: state.descriptor.kind,
                    help: state.descriptor.help.clone(),
                    label_names: state.descriptor.label_names.clone(),
                    values: state
                        .cells
                        .iter()
                        .map(|(labels, value)| LabeledValue {
                            labels: labels.clone(),
                            value: value.clone(),
                        })
                        .collect(),
                }
            })
            .collect()
    }

    /// Render the full registry in text exposition format.
    pub fn render_text_exposition(&self) -> String {
        let mut out = String::new();
        for snapshot in self.snapshot() {
            let full_name = format!("{}{}", self.prefix, snapshot.name);
            let _ = writeln!(out, "# HELP {} {}", full_name, snapshot.help);
            let _ = writeln!(out, "# TYPE {} {}", full_name, snapshot.kind.as_str());

            for labeled in &snapshot.values {
                let label_body = render_labels(&snapshot.label_names, &labeled.labels);
                match &labeled.value {
                    MetricValue::Scalar { value } => {
                        let _ = writeln!(
                            out,
                            "{}{} {}",
                            full_name,
                            braced(&label_body),
                            fmt_value(*value)
                        );
                    }
                    MetricValue::Histogram { sum, count, buckets } => {
                        let _ = writeln!(
                            out,
                            "{}_sum{} {}",
                            full_name,
                            braced(&label_body),
                            fmt_value(*sum)
                        );
                        let _ = writeln!(out, "{}_count{} {}", full_name, braced(&label_body), count);
                        for (i, bound) in HISTOGRAM_BUCKETS.iter().enumerate() {
                            let le = append_label(&label_body, "le", &fmt_value(*bound));
                            let _ = writeln!(out, "{}_bucket{{{}}} {}", full_name, le, buckets[i]);
                        }
                        let le = append_label(&label_body, "le", "+Inf");
                        let _ = writeln!(out, "{}_bucket{{{}}} {}", full_name, le, count);
                    }
                }
            }
        }
        out
    }
}

fn render_labels(names: &[String], values: &[String]) -> String {
    names
        .iter()
        .zip(values.iter())
        .map(|(n, v)| format!("{n}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(",")
}

fn braced(label_body: &str) -> String {
    if label_body.is_empty() {
        String::new()
    } else {
        format!("{{{label_body}}}")
    }
}

fn append_label(label_body: &str, name: &str, value: &str) -> String {
    if label_body.is_empty() {
        format!("{name}=\"{value}\"")
    } else {
        format!("{label_body},{name}=\"{value}\"")
    }
}

fn fmt_value(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}
