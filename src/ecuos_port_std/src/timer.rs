//! Simulated hardware timers
use ecuos_core::kernel::{CoreId, HardwareTimer};
use std::time::{Duration, Instant};

/// The parameters of a simulated hardware timer.
///
/// The timer with index `i` in [`System::with_timers`](crate::System::with_timers)
/// is addressed as `HwTimerId::new(i)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// The core whose kernel receives the timer's interrupts.
    pub core: CoreId,
    /// The time between two increments of the timer.
    pub period: Duration,
    /// The timer wraps around to zero after this value. Must be of the form
    /// `2^n - 1` and match the counters driven by the timer.
    pub max_value: u32,
}

/// A free-running timer derived from the host's monotonic clock.
#[derive(Debug)]
pub struct StdTimer {
    origin: Instant,
    period: Duration,
    max_value: u32,
    /// The absolute tick at which the interrupt is raised.
    deadline: Option<u64>,
}

impl StdTimer {
    pub(crate) fn new(cfg: &TimerConfig, origin: Instant) -> Self {
        Self {
            origin,
            period: cfg.period.max(Duration::from_nanos(1)),
            max_value: cfg.max_value,
            deadline: None,
        }
    }

    /// The number of ticks since the origin, without wrapping around.
    fn ticks(&self) -> u64 {
        (self.origin.elapsed().as_nanos() / self.period.as_nanos()) as u64
    }

    /// Clear and return the pending interrupt request if its deadline has
    /// passed.
    pub(crate) fn take_expired(&mut self) -> bool {
        match self.deadline {
            Some(deadline) if self.ticks() >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// The time remaining until the requested interrupt.
    pub(crate) fn time_to_deadline(&self) -> Option<Duration> {
        let deadline = self.deadline?;
        let remaining = deadline.saturating_sub(self.ticks());
        Some(self.period.saturating_mul(remaining.min(u32::MAX as u64) as u32))
    }
}

impl HardwareTimer for StdTimer {
    fn max_value(&self) -> u32 {
        self.max_value
    }

    fn init(&mut self) {
        self.deadline = None;
    }

    fn start(&mut self, old: u32, delta: u32) {
        self.deadline = Some(deadline(self.ticks(), self.max_value, old, delta));
    }

    fn stop(&mut self) {
        self.deadline = None;
    }

    fn read(&self) -> u32 {
        (self.ticks() & self.max_value as u64) as u32
    }
}

/// Find the absolute tick `delta` ticks after the most recent tick (not
/// after `now`) at which the timer read `old`.
fn deadline(now: u64, max_value: u32, old: u32, delta: u32) -> u64 {
    let mask = max_value as u64;
    let since_old = (now & mask).wrapping_sub(old as u64) & mask;
    now - since_old.min(now) + delta as u64
}
