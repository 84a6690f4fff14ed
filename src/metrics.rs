use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Histo {
    /// Values are stored as integer milliseconds.
    inner: Histogram<u64>,
}

impl Default for Histo {
    fn default() -> Self {
        Self {
            inner: Histogram::new(3).expect("histo"),
        }
    }
}

impl Histo {
    pub fn record(&mut self, v: u64) {
        let _ = self.inner.record(v.max(1));
    }

    pub fn p50(&self) -> u64 {
        self.inner.value_at_quantile(0.50)
    }

    pub fn p95(&self) -> u64 {
        self.inner.value_at_quantile(0.95)
    }

    pub fn p99(&self) -> u64 {
        self.inner.value_at_quantile(0.99)
    }

    pub fn max(&self) -> u64 {
        self.inner.max()
    }

    pub fn count(&self) -> u64 {
        self.inner.len()
    }
}

#[derive(Debug, Default)]
struct Counter(AtomicU64);

impl Counter {
    fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Process-wide counters and latency histograms shared by the scheduler,
/// the trader and the collector.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    cycles_completed: Counter,
    cycles_skipped: Counter,
    cycles_dropped: Counter,
    cycles_failed: Counter,
    deadline_overruns: Counter,
    transitions: Counter,
    execution_faults: Counter,
    reconciliation_mismatches: Counter,
    snapshots_flushed: Counter,
    snapshots_dropped: Counter,
    flush_failures: Counter,
    collector_reconnects: Counter,
    cycle_ms: Mutex<Histo>,
    inference_ms: Mutex<Histo>,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycle_completed(&self, elapsed: Duration) {
        self.cycles_completed.inc();
        self.cycle_ms.lock().record(elapsed.as_millis() as u64);
    }

    pub fn cycle_skipped(&self) {
        self.cycles_skipped.inc();
    }

    pub fn cycle_dropped(&self) {
        self.cycles_dropped.inc();
    }

    pub fn cycle_failed(&self) {
        self.cycles_failed.inc();
    }

    pub fn deadline_overrun(&self) {
        self.deadline_overruns.inc();
    }

    pub fn inference(&self, elapsed: Duration) {
        self.inference_ms.lock().record(elapsed.as_millis() as u64);
    }

    pub fn transition(&self) {
        self.transitions.inc();
    }

    pub fn execution_fault(&self) {
        self.execution_faults.inc();
    }

    pub fn reconciliation_mismatch(&self) {
        self.reconciliation_mismatches.inc();
    }

    pub fn snapshots_flushed(&self, n: usize) {
        self.snapshots_flushed.0.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshots_dropped(&self, n: usize) {
        self.snapshots_dropped.0.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn flush_failure(&self) {
        self.flush_failures.inc();
    }

    pub fn collector_reconnect(&self) {
        self.collector_reconnects.inc();
    }

    pub fn cycles_dropped(&self) -> u64 {
        self.cycles_dropped.get()
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.get()
    }

    pub fn snapshot_kv(&self) -> BTreeMap<String, String> {
        let mut kv = BTreeMap::new();
        let counters = [
            ("cycles.completed", &self.cycles_completed),
            ("cycles.skipped", &self.cycles_skipped),
            ("cycles.dropped", &self.cycles_dropped),
            ("cycles.failed", &self.cycles_failed),
            ("cycles.deadline_overruns", &self.deadline_overruns),
            ("trader.transitions", &self.transitions),
            ("trader.execution_faults", &self.execution_faults),
            ("trader.reconciliation_mismatches", &self.reconciliation_mismatches),
            ("collector.snapshots_flushed", &self.snapshots_flushed),
            ("collector.snapshots_dropped", &self.snapshots_dropped),
            ("collector.flush_failures", &self.flush_failures),
            ("collector.reconnects", &self.collector_reconnects),
        ];
        for (k, c) in counters {
            kv.insert(k.to_string(), c.get().to_string());
        }
        for (prefix, histo) in [("cycle_ms", &self.cycle_ms), ("inference_ms", &self.inference_ms)] {
            let h = histo.lock();
            if h.count() == 0 {
                continue;
            }
            kv.insert(format!("{prefix}.p50"), h.p50().to_string());
            kv.insert(format!("{prefix}.p95"), h.p95().to_string());
            kv.insert(format!("{prefix}.p99"), h.p99().to_string());
            kv.insert(format!("{prefix}.max"), h.max().to_string());
        }
        kv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histo_quantiles() {
        let mut h = Histo::default();
        for v in 1..=100 {
            h.record(v);
        }
        assert_eq!(h.count(), 100);
        assert_eq!(h.p50(), 50);
        assert_eq!(h.max(), 100);
    }

    #[test]
    fn snapshot_reports_counters_and_latency() {
        let m = RuntimeMetrics::new();
        m.cycle_completed(Duration::from_millis(12));
        m.cycle_dropped();
        m.cycle_dropped();
        let kv = m.snapshot_kv();
        assert_eq!(kv["cycles.completed"], "1");
        assert_eq!(kv["cycles.dropped"], "2");
        assert_eq!(kv["cycle_ms.max"], "12");
        assert!(!kv.contains_key("inference_ms.p50"));
    }
}
