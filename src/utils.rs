use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A utility for tracking frames per second.
pub struct FpsCounter {
    frame_count: u32,
    last_time: Instant,
    interval: Duration,
}

impl FpsCounter {
    /// Create a new FPS counter with a one second reporting interval.
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(1))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            frame_count: 0,
            last_time: Instant::now(),
            interval,
        }
    }

    /// Update the counter with a new frame.
    /// Returns Some(fps) if the reporting interval has passed, otherwise None.
    pub fn update(&mut self) -> Option<f32> {
        self.frame_count += 1;
        let elapsed = self.last_time.elapsed();

        if elapsed >= self.interval {
            let fps = self.frame_count as f32 / elapsed.as_secs_f32();
            self.frame_count = 0;
            self.last_time = Instant::now();
            Some(fps)
        } else {
            None
        }
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Locks a mutex, recovering the data if a previous holder panicked.
///
/// The render loop must keep running after a panic in a UI callback.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fps_counter_reports_after_interval() {
        let mut counter = FpsCounter::with_interval(Duration::ZERO);
        let fps = counter.update();
        assert!(fps.is_some());
    }

    #[test]
    fn fps_counter_waits_for_interval() {
        let mut counter = FpsCounter::with_interval(Duration::from_secs(3600));
        assert_eq!(counter.update(), None);
    }

    #[test]
    fn lock_recovers_poisoned_mutex() {
        let shared = Arc::new(Mutex::new(1));
        let clone = shared.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(shared.is_poisoned());
        *lock(&shared) += 1;
        assert_eq!(*lock(&shared), 2);
    }
}
