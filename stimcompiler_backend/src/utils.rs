use std::time::Instant;

/// Utility class for stage timing. Each tick reports the milliseconds elapsed since the previous one.
pub struct TickTimer {
    last: Instant,
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    /// Ticks and logs the elapsed time at debug level.
    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        log::debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ticks_are_non_negative_and_reset() {
        let mut timer = TickTimer::new();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let before = Instant::now();
        assert!(timer.tick_log("sleep") >= 5.);
        // Measured from the previous tick, not from construction
        let since_last = timer.tick();
        assert!(since_last >= 0.);
        assert!(since_last <= before.elapsed().as_secs_f64() * 1e3);
    }
}
