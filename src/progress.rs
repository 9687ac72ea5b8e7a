//! Progress sinks.
//!
//! Purely observational: the core pushes `(message, percent)` updates and never
//! reads anything back.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tracing::debug;

/// Receiver of status updates from the work queue and long-running operations.
pub trait ProgressSink: Send + Sync {
    /// `percent` is in `0.0..=100.0`.
    fn report(&self, message: &str, percent: f32);
}

/// Sink that forwards updates to the tracing log at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn report(&self, message: &str, percent: f32) {
        debug!(percent = percent, "{}", message);
    }
}

/// Sink that drives a terminal spinner.
pub struct BarSink {
    bar: ProgressBar,
}

impl BarSink {
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% | {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for BarSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for BarSink {
    fn report(&self, message: &str, percent: f32) {
        self.bar.set_position(percent.clamp(0.0, 100.0) as u64);
        self.bar.set_message(message.to_string());
    }
}

/// Percentage of `done` out of `total`, `0` when there is nothing to do.
pub fn percent(done: usize, total: usize) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (done as f32 / total as f32) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
        assert_eq!(percent(4, 4), 100.0);
    }
}
