use std::time::{Duration, Instant};

/// Monotonic time source and blocking delay.
pub trait Clock {
    /// Milliseconds since boot. Never decreases.
    fn now_ms(&self) -> u64;

    fn sleep(&self, duration: Duration);
}

impl<C: Clock + ?Sized> Clock for Box<C> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// Backed by `std`. On ESP-IDF the std timer counts from boot, on a host it
/// counts from process start.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

#[test]
fn test_system_clock_is_monotonic() {
    let clock = SystemClock::new();
    let first = clock.now_ms();
    clock.sleep(Duration::from_millis(2));
    assert!(clock.now_ms() >= first + 1);
}
