use std::collections::VecDeque;

/// The last `capacity` connection durations, oldest evicted first.
#[derive(Debug, Clone)]
pub struct ConnectionDurationWindow {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl ConnectionDurationWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, seconds: f64) {
        if !seconds.is_finite() || seconds < 0.0 {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(seconds);
    }

    /// Mean of the window, 0 when empty.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_average_is_zero() {
        let window = ConnectionDurationWindow::new(100);
        assert_eq!(window.average(), 0.0);
        assert!(window.is_empty());
    }

    #[test]
    fn test_evicts_oldest_beyond_capacity() {
        let mut window = ConnectionDurationWindow::new(100);
        // 50 long sessions followed by 100 one-second ones
        for _ in 0..50 {
            window.push(1000.0);
        }
        for _ in 0..100 {
            window.push(1.0);
        }
        assert_eq!(window.len(), 100);
        assert_eq!(window.average(), 1.0);
    }

    #[test]
    fn test_average_of_recent_samples() {
        let mut window = ConnectionDurationWindow::new(3);
        for v in [2.0, 4.0, 6.0, 8.0] {
            window.push(v);
        }
        assert_eq!(window.len(), window.capacity());
        assert_eq!(window.average(), 6.0);
    }

    #[test]
    fn test_rejects_invalid_samples() {
        let mut window = ConnectionDurationWindow::new(10);
        window.push(f64::NAN);
        window.push(-1.0);
        assert!(window.is_empty());
    }
}
