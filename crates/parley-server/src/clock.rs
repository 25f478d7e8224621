use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds on a process-local monotonic clock. All liveness windows,
/// token buckets and speaker timestamps use this clock, never wall time.
pub fn now_ms() -> i64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as i64
}

/// Wall-clock Unix seconds, for telemetry samples and upload identifiers.
pub fn unix_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_decreases() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }

    #[test]
    fn unix_ts_is_plausible() {
        // After 2020, before 2100.
        let ts = unix_ts();
        assert!(ts > 1_577_836_800);
        assert!(ts < 4_102_444_800);
    }
}
