//! Transfer progress tracking
//!
//! Page counts, byte counts, a smoothed speed and an ETA for one chapter
//! transfer, plus the throttle that keeps `download_progress` events to a
//! bounded rate.

use std::time::{Duration, Instant};

use crate::app::models::Progress;

/// Speed calculation utilities
pub struct SpeedCalculator;

impl SpeedCalculator {
    /// Instantaneous speed between two samples
    pub fn calculate_speed(bytes: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            bytes as f64 / secs
        } else {
            0.0
        }
    }

    /// Exponentially weighted moving average for smoother speed reporting
    pub fn calculate_ewma_speed(current_speed: f64, previous_ewma: f64, alpha: f64) -> f64 {
        if previous_ewma == 0.0 {
            current_speed
        } else {
            alpha * current_speed + (1.0 - alpha) * previous_ewma
        }
    }

    /// Seconds left at `current_speed`; `None` while the speed is unknown
    pub fn calculate_eta(bytes_downloaded: u64, total_bytes: u64, current_speed: f64) -> Option<u64> {
        if total_bytes <= bytes_downloaded {
            return Some(0);
        }
        if current_speed <= 0.0 {
            return None;
        }
        let remaining = (total_bytes - bytes_downloaded) as f64;
        Some((remaining / current_speed).ceil() as u64)
    }
}

/// Mutable progress state owned by one running transfer
#[derive(Debug)]
pub struct ProgressTracker {
    progress: Progress,
    alpha: f64,
    emit_interval: Duration,
    last_sample: Instant,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(total_pages: usize, alpha: f64, emit_interval: Duration) -> Self {
        Self::resume(Progress::new(total_pages), total_pages, 0, alpha, emit_interval)
    }

    /// Continue from an earlier snapshot
    ///
    /// `completed_pages` is taken from what storage actually holds, while
    /// `bytes_downloaded` is carried over so it never goes backwards.
    pub fn resume(
        previous: Progress,
        total_pages: usize,
        completed_pages: usize,
        alpha: f64,
        emit_interval: Duration,
    ) -> Self {
        let mut progress = previous;
        progress.total_pages = total_pages;
        progress.completed_pages = completed_pages.min(total_pages);
        progress.failed_pages = 0;
        progress.update_percent();

        let mut tracker = Self {
            progress,
            alpha,
            emit_interval,
            last_sample: Instant::now(),
            last_emit: None,
        };
        tracker.refresh_estimates();
        tracker
    }

    pub fn record_page(&mut self, bytes: u64) {
        self.record_page_at(bytes, Instant::now());
    }

    pub(crate) fn record_page_at(&mut self, bytes: u64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_sample);
        let current = SpeedCalculator::calculate_speed(bytes, elapsed);
        if current > 0.0 {
            self.progress.speed_bytes_per_sec = SpeedCalculator::calculate_ewma_speed(
                current,
                self.progress.speed_bytes_per_sec,
                self.alpha,
            );
        }
        self.last_sample = now;

        self.progress.completed_pages = (self.progress.completed_pages + 1).min(self.progress.total_pages);
        self.progress.bytes_downloaded += bytes;
        self.progress.update_percent();
        self.refresh_estimates();
    }

    pub fn record_failure(&mut self) {
        self.progress.failed_pages += 1;
    }

    /// Extrapolate the chapter size from the average page seen so far
    fn refresh_estimates(&mut self) {
        let p = &mut self.progress;
        if p.completed_pages > 0 {
            let average = p.bytes_downloaded / p.completed_pages as u64;
            p.bytes_total = p
                .bytes_downloaded
                .max(average * p.total_pages as u64);
        }
        p.eta_seconds =
            SpeedCalculator::calculate_eta(p.bytes_downloaded, p.bytes_total, p.speed_bytes_per_sec);
    }

    /// Whether a progress event is due
    pub fn should_emit(&mut self) -> bool {
        self.should_emit_at(Instant::now())
    }

    pub(crate) fn should_emit_at(&mut self, now: Instant) -> bool {
        let due = match self.last_emit {
            None => true,
            Some(last) => {
                now.saturating_duration_since(last) >= self.emit_interval
                    || self.progress.is_complete()
            }
        };
        if due {
            self.last_emit = Some(now);
        }
        due
    }

    pub fn snapshot(&self) -> Progress {
        self.progress.clone()
    }

    pub fn completed_pages(&self) -> usize {
        self.progress.completed_pages
    }

    pub fn failed_pages(&self) -> usize {
        self.progress.failed_pages
    }

    pub fn is_complete(&self) -> bool {
        self.progress.is_complete()
    }
}
