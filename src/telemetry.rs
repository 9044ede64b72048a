//! Demo coordinator - telemetry module
//!
//! Process-wide counters, gauges and histograms, rendered in Prometheus
//! text exposition format at GET /metrics. Spans are emitted through
//! `tracing` at the call sites.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

const DURATION_BUCKETS: &[f64] = &[60.0, 300.0, 600.0, 1200.0, 1800.0, 2700.0, 3600.0, 5400.0];
const WAIT_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0];
const SPAWN_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// A fixed-bucket histogram. Guarded by the registry's mutexes; the
/// single-writer paths here do not justify anything fancier.
#[derive(Debug, Clone)]
pub struct Histogram {
    bounds: &'static [f64],
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            counts: vec![0; bounds.len()],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        for (i, bound) in self.bounds.iter().enumerate() {
            if value <= *bound {
                self.counts[i] += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }

    /// Cumulative bucket counts, sum and count, in exposition format.
    /// `labels` is either empty or a `key="value"` fragment.
    fn render(&self, name: &str, labels: &str, out: &mut String) {
        let sep = if labels.is_empty() { "" } else { "," };
        for (i, bound) in self.bounds.iter().enumerate() {
            let _ = writeln!(
                out,
                "{}_bucket{{{}{}le=\"{}\"}} {}",
                name, labels, sep, bound, self.counts[i]
            );
        }
        let _ = writeln!(
            out,
            "{}_bucket{{{}{}le=\"+Inf\"}} {}",
            name, labels, sep, self.count
        );
        if labels.is_empty() {
            let _ = writeln!(out, "{}_sum {}", name, self.sum);
            let _ = writeln!(out, "{}_count {}", name, self.count);
        } else {
            let _ = writeln!(out, "{}_sum{{{}}} {}", name, labels, self.sum);
            let _ = writeln!(out, "{}_count{{{}}} {}", name, labels, self.count);
        }
    }

    #[cfg(test)]
    pub fn total(&self) -> u64 {
        self.count
    }
}

/// Telemetry registry. One per process, shared behind an Arc.
#[derive(Debug)]
pub struct Metrics {
    queue_size: AtomicI64,
    sessions_active: AtomicI64,
    sessions_started: AtomicU64,
    sessions_ended: Mutex<BTreeMap<&'static str, u64>>,
    invites_validated: Mutex<BTreeMap<&'static str, u64>>,
    session_duration: Mutex<BTreeMap<&'static str, Histogram>>,
    queue_wait: Mutex<Histogram>,
    spawn_seconds: Mutex<Histogram>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            queue_size: AtomicI64::new(0),
            sessions_active: AtomicI64::new(0),
            sessions_started: AtomicU64::new(0),
            sessions_ended: Mutex::new(BTreeMap::new()),
            invites_validated: Mutex::new(BTreeMap::new()),
            session_duration: Mutex::new(BTreeMap::new()),
            queue_wait: Mutex::new(Histogram::new(WAIT_BUCKETS)),
            spawn_seconds: Mutex::new(Histogram::new(SPAWN_BUCKETS)),
        }
    }

    pub fn set_queue_size(&self, size: usize) {
        self.queue_size.store(size as i64, Ordering::Relaxed);
    }

    pub fn set_session_active(&self, active: bool) {
        self.sessions_active
            .store(if active { 1 } else { 0 }, Ordering::Relaxed);
    }

    pub fn inc_sessions_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_ended(&self, reason: &'static str) {
        let mut map = self.sessions_ended.lock().unwrap();
        *map.entry(reason).or_insert(0) += 1;
    }

    pub fn inc_invites_validated(&self, status: &'static str) {
        let mut map = self.invites_validated.lock().unwrap();
        *map.entry(status).or_insert(0) += 1;
    }

    pub fn observe_session_duration(&self, reason: &'static str, seconds: f64) {
        let mut map = self.session_duration.lock().unwrap();
        map.entry(reason)
            .or_insert_with(|| Histogram::new(DURATION_BUCKETS))
            .observe(seconds);
    }

    pub fn observe_queue_wait(&self, seconds: f64) {
        self.queue_wait.lock().unwrap().observe(seconds);
    }

    pub fn observe_spawn(&self, seconds: f64) {
        self.spawn_seconds.lock().unwrap().observe(seconds);
    }

    /// Render every metric in Prometheus text exposition format
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(2048);

        let _ = writeln!(out, "# HELP demo_queue_size Clients currently queued");
        let _ = writeln!(out, "# TYPE demo_queue_size gauge");
        let _ = writeln!(out, "demo_queue_size {}", self.queue_size.load(Ordering::Relaxed));

        let _ = writeln!(out, "# HELP demo_sessions_active Active sessions (0 or 1)");
        let _ = writeln!(out, "# TYPE demo_sessions_active gauge");
        let _ = writeln!(
            out,
            "demo_sessions_active {}",
            self.sessions_active.load(Ordering::Relaxed)
        );

        let _ = writeln!(out, "# HELP demo_sessions_started_total Sessions started");
        let _ = writeln!(out, "# TYPE demo_sessions_started_total counter");
        let _ = writeln!(
            out,
            "demo_sessions_started_total {}",
            self.sessions_started.load(Ordering::Relaxed)
        );

        let _ = writeln!(out, "# HELP demo_sessions_ended_total Sessions ended, by reason");
        let _ = writeln!(out, "# TYPE demo_sessions_ended_total counter");
        for (reason, count) in self.sessions_ended.lock().unwrap().iter() {
            let _ = writeln!(out, "demo_sessions_ended_total{{reason=\"{}\"}} {}", reason, count);
        }

        let _ = writeln!(
            out,
            "# HELP demo_invites_validated_total Invite validation decisions, by status"
        );
        let _ = writeln!(out, "# TYPE demo_invites_validated_total counter");
        for (status, count) in self.invites_validated.lock().unwrap().iter() {
            let _ = writeln!(
                out,
                "demo_invites_validated_total{{status=\"{}\"}} {}",
                status, count
            );
        }

        let _ = writeln!(out, "# HELP demo_session_duration_seconds Session duration, by end reason");
        let _ = writeln!(out, "# TYPE demo_session_duration_seconds histogram");
        for (reason, hist) in self.session_duration.lock().unwrap().iter() {
            hist.render(
                "demo_session_duration_seconds",
                &format!("reason=\"{}\"", reason),
                &mut out,
            );
        }

        let _ = writeln!(out, "# HELP demo_queue_wait_seconds Wait between queue entry and session start");
        let _ = writeln!(out, "# TYPE demo_queue_wait_seconds histogram");
        self.queue_wait.lock().unwrap().render("demo_queue_wait_seconds", "", &mut out);

        let _ = writeln!(out, "# HELP demo_ttyd_spawn_seconds Terminal subprocess spawn latency");
        let _ = writeln!(out, "# TYPE demo_ttyd_spawn_seconds histogram");
        self.spawn_seconds.lock().unwrap().render("demo_ttyd_spawn_seconds", "", &mut out);

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_observe_buckets_cumulative() {
        let mut h = Histogram::new(SPAWN_BUCKETS);
        h.observe(0.05);
        h.observe(0.3);
        h.observe(20.0); // above every bound, lands only in +Inf

        assert_eq!(h.total(), 3);
        assert_eq!(h.counts[0], 1); // le 0.1
        assert_eq!(h.counts[2], 2); // le 0.5
        assert!((h.sum - 20.35).abs() < 1e-9);
    }

    #[test]
    fn test_render_contains_all_metric_names() {
        let m = Metrics::new();
        m.set_queue_size(2);
        m.set_session_active(true);
        m.inc_sessions_started();
        m.inc_sessions_ended("timeout");
        m.inc_invites_validated("valid");
        m.observe_session_duration("timeout", 120.0);
        m.observe_queue_wait(30.0);
        m.observe_spawn(0.2);

        let text = m.render();

        assert!(text.contains("demo_queue_size 2"));
        assert!(text.contains("demo_sessions_active 1"));
        assert!(text.contains("demo_sessions_started_total 1"));
        assert!(text.contains("demo_sessions_ended_total{reason=\"timeout\"} 1"));
        assert!(text.contains("demo_invites_validated_total{status=\"valid\"} 1"));
        assert!(text.contains("demo_session_duration_seconds_bucket{reason=\"timeout\",le=\"300\"} 1"));
        assert!(text.contains("demo_queue_wait_seconds_count 1"));
        assert!(text.contains("demo_ttyd_spawn_seconds_sum 0.2"));
    }

    #[test]
    fn test_counter_labels_accumulate_independently() {
        let m = Metrics::new();
        m.inc_sessions_ended("timeout");
        m.inc_sessions_ended("timeout");
        m.inc_sessions_ended("disconnected");

        let text = m.render();
        assert!(text.contains("demo_sessions_ended_total{reason=\"timeout\"} 2"));
        assert!(text.contains("demo_sessions_ended_total{reason=\"disconnected\"} 1"));
    }
}
