//! Analysis progress display.

use indicatif::{ProgressBar, ProgressStyle};

/// Captures shorter than this are analyzed without a progress bar
const PROGRESS_THRESHOLD: u64 = 10_000;

/// Per-pass progress tracker
pub struct PassProgress {
    bar: ProgressBar,
}

impl PassProgress {
    /// Create a tracker for `total_frames` frames; hidden for short captures
    #[must_use]
    pub fn new(total_frames: u64, pass: &str) -> Self {
        let bar = if total_frames < PROGRESS_THRESHOLD {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(total_frames)
        };

        if let Ok(style) = ProgressStyle::default_bar().template(
            "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} frames ({per_sec}, {eta})",
        ) {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message(format!("{pass} pass"));

        Self { bar }
    }

    /// Count one processed frame
    pub fn inc(&self) {
        self.bar.inc(1);
    }

    /// Clear the bar once the pass is over
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

/// Format bytes in human-readable format
///
/// # Example
///
/// ```ignore
/// assert_eq!(format_bytes(1024), "1.00 KB");
/// assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
/// ```
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

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn test_short_capture_hides_bar() {
        let progress = PassProgress::new(10, "Authoritative");
        assert!(progress.bar.is_hidden());
        progress.inc();
        assert_eq!(progress.bar.position(), 1);
        progress.finish();
    }
}
