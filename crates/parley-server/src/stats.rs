use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

use parley_protocol::types::{ChannelId, Username};

/// Rolling history length: 360 samples at one per 10 s ≈ one hour.
pub const MAX_HISTORY_SAMPLES: usize = 360;

/// Last reported quality numbers for one user. Receiver reports refresh the
/// loss/jitter half; the client's own stats report refreshes ping/buffer.
#[derive(Debug, Clone, Default)]
struct VoiceStatEntry {
    ping_ms: f32,
    loss_pct: f32,
    jitter_ms: f32,
    buffer_ms: i32,
}

/// One aggregated point in the rolling history.
#[derive(Debug, Clone, Serialize)]
pub struct AggVoiceSample {
    pub ts: i64,
    pub avg_ping_ms: f32,
    pub avg_loss_pct: f32,
    pub avg_jitter_ms: f32,
    pub avg_buffer_ms: i32,
    pub clients: usize,
}

#[derive(Serialize)]
struct SnapshotFile<'a> {
    samples: &'a VecDeque<AggVoiceSample>,
}

#[derive(Default)]
struct TelemetryInner {
    last: HashMap<Username, VoiceStatEntry>,
    history: VecDeque<AggVoiceSample>,
}

/// Voice telemetry: per-user snapshot plus the bounded aggregate ring,
/// both under one mutex. Writers are the report handlers and the 10 s timer.
pub struct Telemetry {
    inner: Mutex<TelemetryInner>,
    path: PathBuf,
}

impl Telemetry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(TelemetryInner::default()),
            path: path.into(),
        }
    }

    /// Ingest the loss/jitter half from an in-band receiver report.
    pub fn record_receiver_report(
        &self,
        user: &Username,
        cid: ChannelId,
        loss_pct: f32,
        jitter_ms: f32,
    ) {
        if cid < 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.last.entry(user.clone()).or_default();
        entry.loss_pct = loss_pct;
        entry.jitter_ms = jitter_ms;
    }

    /// Ingest a client's own stats report (carries ping and buffer depth).
    pub fn record_client_stats(
        &self,
        user: &Username,
        cid: ChannelId,
        ping_ms: f32,
        loss_pct: f32,
        jitter_ms: f32,
        buffer_ms: i32,
    ) {
        if cid < 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.last.insert(
            user.clone(),
            VoiceStatEntry {
                ping_ms,
                loss_pct,
                jitter_ms,
                buffer_ms,
            },
        );
    }

    /// Aggregate the current snapshot into one averaged sample, append it to
    /// the ring, and persist the ring. One lock scope covers all three.
    pub fn tick(&self, ts: i64) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.last.is_empty() {
            let n = inner.last.len();
            let mut sum_ping = 0.0f32;
            let mut sum_loss = 0.0f32;
            let mut sum_jitter = 0.0f32;
            let mut sum_buffer = 0i64;
            for entry in inner.last.values() {
                sum_ping += entry.ping_ms;
                sum_loss += entry.loss_pct;
                sum_jitter += entry.jitter_ms;
                sum_buffer += i64::from(entry.buffer_ms);
            }
            inner.history.push_back(AggVoiceSample {
                ts,
                avg_ping_ms: sum_ping / n as f32,
                avg_loss_pct: sum_loss / n as f32,
                avg_jitter_ms: sum_jitter / n as f32,
                avg_buffer_ms: (sum_buffer / n as i64) as i32,
                clients: n,
            });
            while inner.history.len() > MAX_HISTORY_SAMPLES {
                inner.history.pop_front();
            }
        }

        write_atomic(&self.path, &inner.history)
    }

    #[cfg(test)]
    fn latest(&self) -> Option<AggVoiceSample> {
        self.inner.lock().unwrap().history.back().cloned()
    }

    #[cfg(test)]
    fn history_len(&self) -> usize {
        self.inner.lock().unwrap().history.len()
    }
}

/// Serialize the ring to a sibling temp file, then rename it into place so
/// readers never observe a torn snapshot.
fn write_atomic(path: &Path, history: &VecDeque<AggVoiceSample>) -> io::Result<()> {
    let json = serde_json::to_vec(&SnapshotFile { samples: history })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)?;
    std::fs::rename(&tmp, path)
}

/// Timer body: every 10 s, aggregate and persist.
pub async fn run_writer(telemetry: std::sync::Arc<Telemetry>) {
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        if let Err(e) = telemetry.tick(crate::clock::unix_ts()) {
            debug!("failed to persist voice telemetry: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("parley_stats_{name}_{}.json", std::process::id()))
    }

    #[test]
    fn tick_averages_snapshot() {
        let t = Telemetry::new(temp_path("avg"));
        t.record_client_stats(&Username::new("a", 1), 1, 20.0, 0.0, 10.0, 40);
        t.record_client_stats(&Username::new("b", 1), 1, 40.0, 2.0, 30.0, 80);
        t.tick(1000).unwrap();

        let sample = t.latest().unwrap();
        assert_eq!(sample.ts, 1000);
        assert_eq!(sample.clients, 2);
        assert!((sample.avg_ping_ms - 30.0).abs() < f32::EPSILON);
        assert!((sample.avg_loss_pct - 1.0).abs() < f32::EPSILON);
        assert!((sample.avg_jitter_ms - 20.0).abs() < f32::EPSILON);
        assert_eq!(sample.avg_buffer_ms, 60);
        std::fs::remove_file(temp_path("avg")).ok();
    }

    #[test]
    fn empty_snapshot_appends_nothing() {
        let t = Telemetry::new(temp_path("empty"));
        t.tick(1).unwrap();
        assert_eq!(t.history_len(), 0);
        std::fs::remove_file(temp_path("empty")).ok();
    }

    #[test]
    fn history_is_bounded() {
        let t = Telemetry::new(temp_path("ring"));
        t.record_client_stats(&Username::new("a", 1), 1, 1.0, 0.0, 1.0, 1);
        for ts in 0..(MAX_HISTORY_SAMPLES as i64 + 25) {
            t.tick(ts).unwrap();
        }
        assert_eq!(t.history_len(), MAX_HISTORY_SAMPLES);
        let newest = t.latest().unwrap();
        assert_eq!(newest.ts, MAX_HISTORY_SAMPLES as i64 + 24);
        std::fs::remove_file(temp_path("ring")).ok();
    }

    #[test]
    fn receiver_report_merges_into_entry() {
        let t = Telemetry::new(temp_path("merge"));
        let user = Username::new("a", 1);
        t.record_client_stats(&user, 1, 25.0, 0.0, 5.0, 50);
        t.record_receiver_report(&user, 1, 12.0, 44.0);
        t.tick(7).unwrap();
        let sample = t.latest().unwrap();
        // Ping and buffer survive the receiver-report merge.
        assert!((sample.avg_ping_ms - 25.0).abs() < f32::EPSILON);
        assert_eq!(sample.avg_buffer_ms, 50);
        assert!((sample.avg_loss_pct - 12.0).abs() < f32::EPSILON);
        assert!((sample.avg_jitter_ms - 44.0).abs() < f32::EPSILON);
        std::fs::remove_file(temp_path("merge")).ok();
    }

    #[test]
    fn snapshot_file_is_written() {
        let path = temp_path("file");
        let t = Telemetry::new(&path);
        t.record_client_stats(&Username::new("a", 1), 1, 9.0, 0.5, 3.0, 10);
        t.tick(99).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["samples"][0]["ts"], 99);
        assert_eq!(parsed["samples"][0]["clients"], 1);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn stats_ignore_reports_without_channel() {
        let t = Telemetry::new(temp_path("nochan"));
        t.record_client_stats(&Username::new("a", 1), -1, 9.0, 0.5, 3.0, 10);
        t.tick(1).unwrap();
        assert_eq!(t.history_len(), 0);
        std::fs::remove_file(temp_path("nochan")).ok();
    }
}
