//! Metric sinks.
//!
//! Each sink receives flat `key -> value` maps together with the iteration
//! they belong to. The trainer writes through one sink only, so several
//! destinations are combined with [`MultiSink`].

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use freematch_core::{Error, Result};
use tracing::{info, warn};

pub trait MetricsSink {
    fn update(&mut self, metrics: &BTreeMap<String, f64>, iteration: usize);

    fn flush(&mut self) {}
}

/// Writes every update as one `info!` line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn update(&mut self, metrics: &BTreeMap<String, f64>, iteration: usize) {
        let line = metrics
            .iter()
            .map(|(k, v)| format!("{k}: {v:.4}"))
            .collect::<Vec<_>>()
            .join(", ");
        info!("[iter {iteration}] {line}");
    }
}

/// Appends one JSON object per update to a `.jsonl` file
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub const FILE_NAME: &'static str = "metrics.jsonl";

    /// Open (or create) `<run_dir>/metrics.jsonl` for appending
    pub fn create(run_dir: &Path) -> Result<Self> {
        fs::create_dir_all(run_dir)?;
        let path = run_dir.join(Self::FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Other(format!("Failed to open {}: {e}", path.display())))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonlSink {
    fn update(&mut self, metrics: &BTreeMap<String, f64>, iteration: usize) {
        let mut record = serde_json::Map::new();
        record.insert("iter".to_string(), serde_json::json!(iteration));
        for (key, value) in metrics {
            // NaN and infinities have no JSON form
            let value = serde_json::Number::from_f64(*value)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null);
            record.insert(key.clone(), value);
        }

        let line = serde_json::Value::Object(record).to_string();
        if let Err(e) = writeln!(self.writer, "{line}").and_then(|_| self.writer.flush()) {
            warn!("Failed to write metrics to {}: {e}", self.path.display());
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!("Failed to flush {}: {e}", self.path.display());
        }
    }
}

/// Fans updates out to several sinks
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn push(&mut self, sink: Box<dyn MetricsSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricsSink for MultiSink {
    fn update(&mut self, metrics: &BTreeMap<String, f64>, iteration: usize) {
        for sink in &mut self.sinks {
            sink.update(metrics, iteration);
        }
    }

    fn flush(&mut self) {
        for sink in &mut self.sinks {
            sink.flush();
        }
    }
}

/// Keeps every update in memory
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub records: Vec<(usize, BTreeMap<String, f64>)>,
}

impl MetricsSink for MemorySink {
    fn update(&mut self, metrics: &BTreeMap<String, f64>, iteration: usize) {
        self.records.push((iteration, metrics.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn metrics(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_jsonl_sink_appends_lines() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let run_dir = temp_dir.path().join("run");

        let mut sink = JsonlSink::create(&run_dir)?;
        sink.update(&metrics(&[("train/lb_loss", 1.5), ("train/mask_ratio", 0.25)]), 50);
        sink.update(&metrics(&[("eval/top-1-acc", f64::NAN)]), 100);
        drop(sink);

        // reopening appends instead of truncating
        let mut sink = JsonlSink::create(&run_dir)?;
        sink.update(&metrics(&[("train/lb_loss", 1.0)]), 150);
        drop(sink);

        let content = fs::read_to_string(run_dir.join(JsonlSink::FILE_NAME))?;
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["iter"], 50);
        assert_eq!(lines[0]["train/mask_ratio"], 0.25);
        assert!(lines[1]["eval/top-1-acc"].is_null());
        assert_eq!(lines[2]["iter"], 150);
        Ok(())
    }

    #[test]
    fn test_multi_sink_fans_out() {
        #[derive(Default)]
        struct Counter(std::rc::Rc<std::cell::Cell<usize>>);

        impl MetricsSink for Counter {
            fn update(&mut self, _: &BTreeMap<String, f64>, _: usize) {
                self.0.set(self.0.get() + 1);
            }
        }

        let count = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut sink = MultiSink::new()
            .with(Counter(count.clone()))
            .with(Counter(count.clone()))
            .with(TracingSink);
        assert_eq!(sink.len(), 3);

        sink.update(&metrics(&[("train/po_loss", 0.0)]), 1);
        sink.update(&metrics(&[("train/po_loss", 0.1)]), 2);
        assert_eq!(count.get(), 4);
    }

    #[test]
    fn test_memory_sink_keeps_order() {
        let mut sink = MemorySink::default();
        sink.update(&metrics(&[("a", 1.0)]), 3);
        sink.update(&metrics(&[("b", 2.0)]), 7);
        assert_eq!(sink.records.len(), 2);
        assert_eq!(sink.records[1].0, 7);
        assert_eq!(sink.records[1].1["b"], 2.0);
    }
}
