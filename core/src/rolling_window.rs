//! Fixed-capacity window over the most recent values.
//!
//! Backs the two bounded histories the runtime keeps: the violation event
//! log (read newest first by monitoring) and the connection-quality
//! latency samples (reduced to mean and mean step). Recording past
//! capacity silently evicts the oldest entry; nothing here ever grows.

use std::collections::VecDeque;

pub struct RollingWindow<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> RollingWindow<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "window capacity must be > 0");
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a value, evicting the oldest entry once full.
    pub fn record(&mut self, value: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stored values, most recent first.
    pub fn newest_first(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().rev()
    }
}

impl RollingWindow<f64> {
    /// Mean of the stored samples; 0 when none are recorded.
    pub fn mean(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        self.entries.iter().sum::<f64>() / self.entries.len() as f64
    }

    /// Mean absolute step between consecutive samples — the jitter figure
    /// the connection-quality score consumes. 0 with fewer than two
    /// samples.
    pub fn mean_delta(&self) -> f64 {
        if self.entries.len() < 2 {
            return 0.0;
        }
        let mut total = 0.0;
        let mut previous: Option<f64> = None;
        for sample in &self.entries {
            if let Some(prev) = previous {
                total += (sample - prev).abs();
            }
            previous = Some(*sample);
        }
        total / (self.entries.len() - 1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::RollingWindow;

    #[test]
    #[should_panic(expected = "window capacity must be > 0")]
    fn zero_capacity_is_rejected() {
        let _ = RollingWindow::<u8>::with_capacity(0);
    }

    #[test]
    fn records_up_to_capacity_then_evicts_oldest() {
        let mut window = RollingWindow::with_capacity(3);
        for n in 1..=5 {
            window.record(n);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.capacity(), 3);
        let kept: Vec<i32> = window.newest_first().copied().collect();
        assert_eq!(kept, vec![5, 4, 3]);
    }

    #[test]
    fn newest_first_walks_back_in_time() {
        let mut window = RollingWindow::with_capacity(8);
        window.record("disconnect");
        window.record("timeout");
        let observed: Vec<&str> = window.newest_first().copied().collect();
        assert_eq!(observed, vec!["timeout", "disconnect"]);
    }

    #[test]
    fn empty_window_reports_empty() {
        let window = RollingWindow::<f64>::with_capacity(4);
        assert!(window.is_empty());
        assert_eq!(window.len(), 0);
        assert_eq!(window.newest_first().count(), 0);
    }

    #[test]
    fn mean_covers_only_retained_samples() {
        let mut window = RollingWindow::with_capacity(2);
        assert_eq!(window.mean(), 0.0);
        window.record(10.0);
        window.record(20.0);
        assert!((window.mean() - 15.0).abs() < f64::EPSILON);
        // 10.0 falls out; the mean follows the window.
        window.record(60.0);
        assert!((window.mean() - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn mean_delta_measures_sample_to_sample_swing() {
        let mut window = RollingWindow::with_capacity(8);
        assert_eq!(window.mean_delta(), 0.0);
        window.record(100.0);
        assert_eq!(window.mean_delta(), 0.0);
        window.record(140.0);
        window.record(120.0);
        // Steps are 40 and 20.
        assert!((window.mean_delta() - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn steady_samples_have_zero_delta() {
        let mut window = RollingWindow::with_capacity(4);
        for _ in 0..4 {
            window.record(75.0);
        }
        assert_eq!(window.mean_delta(), 0.0);
        assert!((window.mean() - 75.0).abs() < f64::EPSILON);
    }
}
