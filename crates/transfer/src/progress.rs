use std::time::{Duration, Instant};

const UNITS: [&str; 8] = ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"];

/// Formats a byte count with binary prefixes, e.g. `1.5MiB`.
pub fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in UNITS {
        if value < 1024.0 {
            return format!("{value:.1}{unit}B");
        }
        value /= 1024.0;
    }
    format!("{value:.1}YiB")
}

/// Byte accounting for one archive transfer.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    total: u64,
    received: u64,
    started_at: Instant,
}

impl TransferProgress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            received: 0,
            started_at: Instant::now(),
        }
    }

    /// Adds `bytes` to the received count.
    pub fn record(&mut self, bytes: u64) {
        self.received += bytes;
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.received)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Average throughput since the transfer started.
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.received as f64 / secs
    }

    /// Human-readable progress, e.g. `4.0KiB/8.0KiB (4096/8192)`.
    pub fn line(&self) -> String {
        format!(
            "{}/{} ({}/{})",
            format_size(self.received),
            format_size(self.total),
            self.received,
            self.total
        )
    }
}
