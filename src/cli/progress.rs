//! CLI-specific progress handling for butterfly-export
//!
//! Drives a progress bar from the exporter's events.

use std::sync::Arc;

use butterfly_export::{EventCallback, ExportEvent};
use indicatif::{ProgressBar, ProgressStyle};

/// Creates a progress bar for CLI display with enhanced information
pub fn create_progress_bar(total_size: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_size);
    if let Ok(style) = ProgressStyle::default_bar().template(
        "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({percent}%) {bytes_per_sec} ETA: {eta} {msg}",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb
}

/// Progress manager for export operations
pub struct ProgressManager {
    pub pb: ProgressBar,
}

impl ProgressManager {
    /// Create a new progress manager
    pub fn new(total_size: u64, message: &str) -> Self {
        let pb = create_progress_bar(total_size);

        // Print initial message to stderr
        eprintln!("{}", message);

        Self { pb }
    }

    /// Event callback updating this manager's bar
    pub fn callback(&self) -> EventCallback {
        let pb = self.pb.clone();
        Arc::new(move |event: &ExportEvent| match event {
            ExportEvent::Start {
                total_bytes: Some(total),
            } => pb.set_length(*total),
            ExportEvent::BytesRead { bytes, total } => {
                if *total > 0 && pb.length() != Some(*total) {
                    pb.set_length(*total);
                }
                pb.set_position(*bytes);
            }
            ExportEvent::End { .. } => pb.finish_with_message("✅ Export completed!"),
            ExportEvent::Error { .. } => pb.abandon(),
            _ => {}
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_progress_bar_template() {
        let pb = create_progress_bar(1000);
        assert_eq!(pb.length().unwrap(), 1000);
        pb.set_position(100);
        pb.finish();
    }

    #[test]
    fn test_callback_tracks_bytes_read() {
        let manager = ProgressManager::new(0, "Test export");
        let callback = manager.callback();

        callback(&ExportEvent::Start {
            total_bytes: Some(500),
        });
        callback(&ExportEvent::BytesRead {
            bytes: 200,
            total: 500,
        });
        assert_eq!(manager.pb.length(), Some(500));
        assert_eq!(manager.pb.position(), 200);

        callback(&ExportEvent::End {
            bytes_read: 500,
            bytes_written: 900,
        });
        assert!(manager.pb.is_finished());
    }
}
