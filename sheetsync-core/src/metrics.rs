//! Metric sink seam.
//!
//! The engine reports counters (cycle outcomes, remote calls, conflicts),
//! histograms (cycle latency) and gauges (DLQ depth). The Prometheus
//! exporter lives outside the core; `MemoryMetrics` backs tests.

use std::collections::HashMap;
use std::sync::Mutex;

pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)]);
    fn observe_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);
    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _name: &str, _labels: &[(&str, &str)]) {}
    fn observe_histogram(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
    fn set_gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

#[derive(Debug, Default)]
pub struct MemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
    gauges: Mutex<HashMap<String, f64>>,
}

fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let rendered: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

impl MemoryMetrics {
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .lock()
            .expect("metrics lock")
            .get(&series_key(name, labels))
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges
            .lock()
            .expect("metrics lock")
            .get(&series_key(name, labels))
            .copied()
    }

    pub fn histogram_count(&self, name: &str, labels: &[(&str, &str)]) -> usize {
        self.histograms
            .lock()
            .expect("metrics lock")
            .get(&series_key(name, labels))
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

impl MetricsSink for MemoryMetrics {
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)]) {
        *self
            .counters
            .lock()
            .expect("metrics lock")
            .entry(series_key(name, labels))
            .or_insert(0) += 1;
    }

    fn observe_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.histograms
            .lock()
            .expect("metrics lock")
            .entry(series_key(name, labels))
            .or_default()
            .push(value);
    }

    fn set_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.gauges
            .lock()
            .expect("metrics lock")
            .insert(series_key(name, labels), value);
    }
}
