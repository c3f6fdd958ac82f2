//! Transfer progress display with progress bars.

use cloudless_files::TransferProgress;
use indicatif::{ProgressBar, ProgressStyle};

const TEMPLATE: &str = "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Progress bar for one transfer
pub struct TransferBar {
    bar: ProgressBar,
}

impl TransferBar {
    /// Create a bar for `total_bytes` labelled with the file name
    #[must_use]
    pub fn new(total_bytes: u64, label: &str) -> Self {
        let bar = ProgressBar::new(total_bytes);
        match ProgressStyle::default_bar().template(TEMPLATE) {
            Ok(style) => bar.set_style(style.progress_chars("#>-")),
            Err(e) => tracing::debug!(error = %e, "falling back to default progress style"),
        }
        bar.set_message(label.to_string());
        Self { bar }
    }

    /// Apply a chunk progress report
    pub fn update(&self, progress: &TransferProgress) {
        self.bar.set_position(progress.bytes_done);
    }

    /// Finish with a message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    /// Abandon the bar (for errors)
    pub fn abandon(&self) {
        self.bar.abandon();
    }
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudless_files::TransferDirection;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.00 MB");
        assert_eq!(format_bytes(1024_u64.pow(4)), "1.00 TB");
    }

    #[test]
    fn test_bar_tracks_bytes() {
        let bar = TransferBar::new(100, "a.bin");
        bar.update(&TransferProgress {
            transfer_id: "t".into(),
            direction: TransferDirection::Send,
            chunks_done: 1,
            total_chunks: 2,
            bytes_done: 64,
        });
        assert_eq!(bar.bar.position(), 64);
        bar.finish_with_message("done".into());
    }
}
