//! CPU load measurement
//!
//! Time is divided into fixed-length *measurement intervals*. The busy time
//! (time spent in a task or an ISR) of the most recent completed intervals is
//! kept in a ring, from which the average load is calculated. The peak is the
//! highest load of a single interval since it was last reset.
use alloc::collections::VecDeque;
use ecuos_core::kernel::{cfg::CpuLoadConfig, CoreId, GetCpuLoadError, ServiceId};

use crate::{xcore, Kernel, Port, Queue};

/// Selects the figure returned by [`Kernel::get_cpu_load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CpuLoadKind {
    /// The average over the configured number of intervals.
    Average = 0,
    /// The highest single-interval load since the last call to
    /// [`Kernel::reset_peak_cpu_load`].
    Peak = 1,
}

#[derive(Debug)]
pub(crate) struct CpuLoad {
    interval: u64,
    num_intervals: usize,
    interval_start: u64,
    /// The busy time in the current interval.
    busy: u64,
    /// The busy times of the completed intervals, the oldest first.
    history: VecDeque<u64>,
    peak: u8,
}

impl CpuLoad {
    pub(crate) fn new(cfg: &CpuLoadConfig) -> Self {
        Self {
            interval: cfg.interval.max(1),
            num_intervals: cfg.num_intervals.max(1),
            interval_start: 0,
            busy: 0,
            history: VecDeque::with_capacity(cfg.num_intervals),
            peak: 0,
        }
    }

    /// Start the first interval at `now`.
    pub(crate) fn start(&mut self, now: u64) {
        self.interval_start = now;
        self.busy = 0;
        self.history.clear();
    }

    /// Account for the time slice ending at `now`, `elapsed` long.
    pub(crate) fn record(&mut self, now: u64, elapsed: u64, busy: bool) {
        let mut start = now.saturating_sub(elapsed).max(self.interval_start);
        while now >= self.interval_start + self.interval {
            let end = self.interval_start + self.interval;
            if busy {
                self.busy += end.saturating_sub(start);
            }
            self.roll();
            start = end;

            if !busy
                && self.history.len() == self.num_intervals
                && self.history.iter().all(|&x| x == 0)
            {
                // Idle intervals change nothing from here
                let skipped = (now - self.interval_start) / self.interval;
                self.interval_start += skipped * self.interval;
                start = self.interval_start;
            }
        }
        if busy {
            self.busy += now.saturating_sub(start);
        }
    }

    /// Complete the current interval.
    fn roll(&mut self) {
        let percent = percentage(self.busy, self.interval);
        self.peak = self.peak.max(percent);
        if self.history.len() == self.num_intervals {
            self.history.pop_front();
        }
        self.history.push_back(self.busy);
        self.busy = 0;
        self.interval_start += self.interval;
    }

    /// The average load of the completed intervals, in percent.
    pub(crate) fn average(&self) -> u8 {
        let total: u64 = self.history.iter().sum();
        percentage(total, self.interval * self.history.len().max(1) as u64)
    }

    pub(crate) fn peak(&self) -> u8 {
        self.peak
    }

    pub(crate) fn reset_peak(&mut self) {
        self.peak = 0;
    }
}

/// `busy / total` in percent, rounded to the nearest integer.
fn percentage(busy: u64, total: u64) -> u8 {
    ((busy.min(total) * 100 + total / 2) / total) as u8
}

impl<P: Port, Q: Queue> Kernel<P, Q> {
    /// Get the CPU load of `core` in percent (`GetCpuLoad`).
    pub fn get_cpu_load(&mut self, core: CoreId, kind: CpuLoadKind) -> Result<u8, GetCpuLoadError> {
        let result = if core.index() >= self.cfg.num_cores {
            Err(GetCpuLoadError::BadId)
        } else if core != self.core {
            self.call_remote(core, xcore::GetCpuLoad { kind })
                .map(|x| x as u8)
        } else {
            Ok(self.cpu_load_local(kind))
        };
        self.finish_service(
            ServiceId::GetCpuLoad,
            &[core.to_raw(), kind as u32],
            result,
        )
    }

    /// Reset the peak CPU load of this core (`ResetPeakCpuLoad`).
    pub fn reset_peak_cpu_load(&mut self) {
        self.cpu_load.reset_peak();
    }

    pub(crate) fn cpu_load_local(&mut self, kind: CpuLoadKind) -> u8 {
        self.account_time();
        match kind {
            CpuLoadKind::Average => self.cpu_load.average(),
            CpuLoadKind::Peak => self.cpu_load.peak(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use ecuos_core::kernel::{cfg::*, *};

    fn load(interval: u64, num_intervals: usize) -> CpuLoad {
        let mut x = CpuLoad::new(&CpuLoadConfig {
            interval,
            num_intervals,
        });
        x.start(0);
        x
    }

    #[test]
    fn intervals() {
        let mut x = load(100, 4);
        // 30% busy in the first interval
        x.record(30, 30, true);
        x.record(100, 70, false);
        assert_eq!(x.average(), 30);
        // 100% busy in the second
        x.record(200, 100, true);
        assert_eq!(x.average(), 65);
        assert_eq!(x.peak(), 100);
        x.reset_peak();
        assert_eq!(x.peak(), 0);
    }

    #[test]
    fn slice_spanning_intervals() {
        let mut x = load(100, 2);
        x.record(50, 50, false);
        // Busy from 50 to 250
        x.record(250, 200, true);
        assert_eq!(x.history, [50, 100]);
        assert_eq!(x.busy, 50);
        assert_eq!(x.average(), 75);
        assert_eq!(x.peak(), 100);
        // A long idle period drops the history
        x.record(10_000, 9_750, false);
        assert_eq!(x.average(), 0);
        assert_eq!(x.peak(), 100);
    }

    #[test]
    fn kernel_measures_task_time() {
        let mut b = CfgBuilder::new(1);
        b.cpu_load(CpuLoadConfig {
            interval: 100,
            num_intervals: 2,
        });
        let task = TaskDescriptor::build().priority(1).finish(&mut b);
        let (mut k, _hooks) = boot(b);

        k.port_mut().now = 50;
        k.activate_task(task).unwrap();
        k.port_mut().now = 125;
        k.terminate_task().unwrap();
        k.port_mut().now = 200;
        // 75 ticks busy out of 200
        assert_eq!(
            k.get_cpu_load(CoreId::new(0), CpuLoadKind::Average),
            Ok(38)
        );
        assert_eq!(k.get_cpu_load(CoreId::new(0), CpuLoadKind::Peak), Ok(50));
        assert_eq!(
            k.get_cpu_load(CoreId::new(3), CpuLoadKind::Peak),
            Err(GetCpuLoadError::BadId)
        );
    }
}
