//! Run metrics: counters and per-stage timings for one pipeline run.

use serde::{Serialize, Serializer};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for the pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Total bytes read from the input series
    pub bytes_read: AtomicU64,

    /// Total bytes written to the result container
    pub bytes_written: AtomicU64,

    /// Variable slices fully processed
    pub slices_written: AtomicU64,

    /// Kernel invocations
    pub kernel_calls: AtomicU64,

    /// Number of failed operations
    pub failures: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    /// Time spent reading slices (microseconds)
    pub read_us: AtomicU64,

    /// Time spent in the kernel (microseconds)
    pub kernel_us: AtomicU64,

    /// Time spent writing slices (microseconds)
    pub write_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_slice_written(&self) {
        self.slices_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_kernel_call(&self) {
        self.kernel_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_read_time(&self, duration: Duration) {
        self.read_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_kernel_time(&self, duration: Duration) {
        self.kernel_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_write_time(&self, duration: Duration) {
        self.write_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get slices per second.
    pub fn slices_per_second(&self) -> f64 {
        let slices = self.slices_written.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            slices as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            slices_written: self.slices_written.load(Ordering::Relaxed),
            kernel_calls: self.kernel_calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            slices_per_second: self.slices_per_second(),
            read_secs: self.read_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            kernel_secs: self.kernel_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            write_secs: self.write_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }

    /// Log one progress line after a slice completes.
    pub fn log_progress(&self, total_slices: usize) {
        let snapshot = self.snapshot();
        let progress = if total_slices > 0 {
            snapshot.slices_written as f64 / total_slices as f64 * 100.0
        } else {
            0.0
        };
        tracing::info!("[{:.1}%] {}", progress, snapshot);
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub slices_written: u64,
    pub kernel_calls: u64,
    pub failures: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub slices_per_second: f64,
    /// Time spent reading input slices (seconds)
    pub read_secs: f64,
    /// Time spent in the coherence kernel (seconds)
    pub kernel_secs: f64,
    /// Time spent writing result slices (seconds)
    pub write_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        tracing::info!("Metrics saved to {}", path.as_ref().display());
        Ok(())
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        println!("\n=== Coherence Summary ===");
        println!("Total time: {:.1}s", self.elapsed.as_secs_f64());
        println!("Slices written: {}", self.slices_written);
        println!("Kernel calls: {}", self.kernel_calls);
        println!("Data read: {:.2} MB", self.bytes_read as f64 / (1024.0 * 1024.0));
        println!("Data written: {:.2} MB", self.bytes_written as f64 / (1024.0 * 1024.0));
        println!("Failures: {}", self.failures);

        let total = self.read_secs + self.kernel_secs + self.write_secs;
        if total > 0.0 {
            println!("\n--- Stage Time Breakdown ---");
            println!("Read:    {:>7.2}s ({:>5.1}%)", self.read_secs, self.read_secs / total * 100.0);
            println!("Kernel:  {:>7.2}s ({:>5.1}%)", self.kernel_secs, self.kernel_secs / total * 100.0);
            println!("Write:   {:>7.2}s ({:>5.1}%)", self.write_secs, self.write_secs / total * 100.0);
        }
        println!("=========================\n");
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total = self.read_secs + self.kernel_secs + self.write_secs;
        let (read_pct, kernel_pct, write_pct) = if total > 0.0 {
            (
                self.read_secs / total * 100.0,
                self.kernel_secs / total * 100.0,
                self.write_secs / total * 100.0,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        write!(
            f,
            "Slices: {} | Read: {:.2} MB | Write: {:.2} MB | Rate: {:.2} slices/s | \
             Failures: {} | Elapsed: {:.1}s | Time: read {:.0}% kernel {:.0}% write {:.0}%",
            self.slices_written,
            self.bytes_read as f64 / (1024.0 * 1024.0),
            self.bytes_written as f64 / (1024.0 * 1024.0),
            self.slices_per_second,
            self.failures,
            self.elapsed.as_secs_f64(),
            read_pct,
            kernel_pct,
            write_pct,
        )
    }
}
