//! Memory pressure probe used to pace chunk reads.

use parking_lot::Mutex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use sysinfo::{System, SystemExt};

struct Probe {
    sys: System,
    sampled_at: Instant,
    free_frac: f64,
}

static PROBE: OnceLock<Mutex<Probe>> = OnceLock::new();
const RESAMPLE_AFTER: Duration = Duration::from_millis(500);
const PAUSE: Duration = Duration::from_millis(25);

/// Available / total RAM, resampled at most every `RESAMPLE_AFTER`.
pub fn available_memory_fraction() -> f64 {
    let probe = PROBE.get_or_init(|| {
        let mut sys = System::new();
        sys.refresh_memory();
        Mutex::new(Probe {
            sys,
            sampled_at: Instant::now() - RESAMPLE_AFTER * 2,
            free_frac: 1.0,
        })
    });
    let mut p = probe.lock();
    if p.sampled_at.elapsed() >= RESAMPLE_AFTER {
        p.sys.refresh_memory();
        let total = p.sys.total_memory() as f64;
        let avail = p.sys.available_memory() as f64;
        p.free_frac = if total > 0.0 { (avail / total).clamp(0.0, 1.0) } else { 1.0 };
        p.sampled_at = Instant::now();
    }
    p.free_frac
}

pub fn is_low_memory(threshold: f64) -> bool {
    available_memory_fraction() < threshold
}

/// Pause briefly before the next chunk when free memory is below `threshold`.
pub fn maybe_throttle_low_memory(threshold: f64) {
    if is_low_memory(threshold) {
        tracing::debug!("Low memory, pausing before next chunk");
        std::thread::sleep(PAUSE);
    }
}
