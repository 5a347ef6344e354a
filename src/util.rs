use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

static INIT_ONCE: std::sync::Once = std::sync::Once::new();
pub fn init_tracing_once() {
    INIT_ONCE.call_once(|| {
        let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
    });
}

/// Linear backoff: attempt `n` (0-based) waits `delay_ms * (n + 1)`.
#[inline]
pub fn backoff_delay(delay_ms: u64, attempt: usize) -> Duration {
    Duration::from_millis(delay_ms.saturating_mul((attempt + 1) as u64))
}

/// Run `op` until it succeeds, fails with an error `retriable` rejects, or
/// `tries` attempts are spent. Returns the last error and the attempt count.
pub fn retry_with_backoff<T, E, F, R>(tries: usize, delay_ms: u64, retriable: R, mut op: F) -> (Result<T, E>, usize)
where
    F: FnMut(usize) -> Result<T, E>,
    R: Fn(&E) -> bool,
{
    let tries = tries.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Ok(v) => return (Ok(v), attempt + 1),
            Err(e) if retriable(&e) && attempt + 1 < tries => {
                sleep(backoff_delay(delay_ms, attempt));
                attempt += 1;
            }
            Err(e) => return (Err(e), attempt + 1),
        }
    }
}

/// Sharing/lock style failures that clear on their own (AV scanners, backup
/// agents, network volumes).
fn is_retriable_io_error(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
        || matches!(e.raw_os_error(), Some(5 | 21 | 32 | 33 | 1006 | 1117 | 1224))
}

fn io_backoff<T>(tries: usize, delay_ms: u64, op: impl FnMut(usize) -> io::Result<T>) -> io::Result<T> {
    retry_with_backoff(tries, delay_ms, is_retriable_io_error, op).0
}

/// Create (truncate) a file, retrying transient sharing errors.
pub fn create_with_backoff(path: &Path, tries: usize, delay_ms: u64) -> io::Result<File> {
    io_backoff(tries, delay_ms, |_| File::create(path))
}

/// Remove a file if present, retrying transient sharing errors.
pub fn remove_with_backoff(path: &Path, tries: usize, delay_ms: u64) -> Result<()> {
    io_backoff(tries, delay_ms, |_| match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    })
    .with_context(|| format!("remove {}", path.display()))
}

/// Promote `tmp` to `dest`, replacing any existing file. Falls back to
/// copy + remove when a rename is refused (cross-device, sharing).
pub fn replace_file_atomic_backoff(tmp: &Path, dest: &Path) -> Result<()> {
    let (tries, delay_ms) = (20usize, 50u64);
    if dest.exists() {
        remove_with_backoff(dest, tries, delay_ms)?;
    }
    if io_backoff(tries, delay_ms, |_| fs::rename(tmp, dest)).is_ok() {
        return Ok(());
    }
    io_backoff(tries, delay_ms, |_| fs::copy(tmp, dest))
        .with_context(|| format!("copy {} -> {}", tmp.display(), dest.display()))?;
    remove_with_backoff(tmp, tries, delay_ms)
}
