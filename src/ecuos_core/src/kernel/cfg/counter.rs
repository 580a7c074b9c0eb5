use super::{AccessSet, CfgBuilder};
use crate::kernel::{ApplicationId, CoreId, CounterId, HwTimerId, Tick};

/// What drives a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterDriver {
    /// Advanced by `IncrementCounter` or by alarms.
    Software,
    /// Advanced by the specified hardware timer. The counter's range must
    /// match the timer's.
    Hardware(HwTimerId),
}

/// A counter descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterDescriptor {
    pub core: CoreId,
    pub app: Option<ApplicationId>,
    /// The counter wraps to zero after this value.
    pub max_allowed_value: Tick,
    pub ticks_per_base: Tick,
    /// The smallest cycle accepted for cyclic alarms.
    pub min_cycle: Tick,
    pub driver: CounterDriver,
    pub access: AccessSet,
}

impl CounterDescriptor {
    /// Construct a `CounterBuilder` to define a counter.
    pub fn build() -> CounterBuilder {
        CounterBuilder {
            inner: CounterDescriptor {
                core: CoreId::new(0),
                app: None,
                max_allowed_value: Tick::MAX,
                ticks_per_base: 1,
                min_cycle: 1,
                driver: CounterDriver::Software,
                access: AccessSet::empty(),
            },
        }
    }

    /// The number of distinct values, `max_allowed_value + 1`.
    #[inline]
    pub fn modulus(&self) -> u64 {
        self.max_allowed_value as u64 + 1
    }

    /// Add `delta` to `value`, wrapping around at [`Self::modulus`].
    #[inline]
    pub fn add(&self, value: Tick, delta: Tick) -> Tick {
        ((value as u64 + delta as u64) % self.modulus()) as Tick
    }

    /// Calculate `to - from`, wrapping around at [`Self::modulus`].
    #[inline]
    pub fn diff(&self, from: Tick, to: Tick) -> Tick {
        ((to as u64 + self.modulus() - from as u64) % self.modulus()) as Tick
    }
}

/// The builder type for counters. Created by [`CounterDescriptor::build`].
#[must_use = "must call `finish()` to complete registration"]
pub struct CounterBuilder {
    inner: CounterDescriptor,
}

impl CounterBuilder {
    pub fn core(mut self, core: CoreId) -> Self {
        self.inner.core = core;
        self
    }

    pub fn application(mut self, app: ApplicationId) -> Self {
        self.inner.app = Some(app);
        self
    }

    /// Specify `maxallowedvalue`. Defaults to `Tick::MAX`.
    pub fn max_allowed_value(mut self, value: Tick) -> Self {
        self.inner.max_allowed_value = value;
        self
    }

    pub fn ticks_per_base(mut self, value: Tick) -> Self {
        self.inner.ticks_per_base = value;
        self
    }

    pub fn min_cycle(mut self, value: Tick) -> Self {
        self.inner.min_cycle = value;
        self
    }

    /// Drive the counter by a hardware timer.
    pub fn hardware(mut self, timer: HwTimerId) -> Self {
        self.inner.driver = CounterDriver::Hardware(timer);
        self
    }

    pub fn access(mut self, access: AccessSet) -> Self {
        self.inner.access = access;
        self
    }

    /// Complete the definition of a counter, returning its identifier.
    pub fn finish(self, cfg: &mut CfgBuilder) -> CounterId {
        cfg.inner.counters.push(self.inner);
        CounterId::from_index(cfg.inner.counters.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_arithmetic() {
        let c = CounterDescriptor::build().max_allowed_value(99).inner;
        assert_eq!(c.add(95, 10), 5);
        assert_eq!(c.add(0, 100), 0);
        assert_eq!(c.diff(95, 5), 10);
        assert_eq!(c.diff(5, 5), 0);

        let c = CounterDescriptor::build().inner;
        assert_eq!(c.add(Tick::MAX, 1), 0);
        assert_eq!(c.diff(Tick::MAX, 0), 1);
    }

    #[quickcheck_macros::quickcheck]
    fn diff_inverts_add(max: Tick, value: Tick, delta: Tick) -> bool {
        let c = CounterDescriptor::build().max_allowed_value(max).inner;
        let value = ((value as u64) % c.modulus()) as Tick;
        let delta = ((delta as u64) % c.modulus()) as Tick;
        c.diff(value, c.add(value, delta)) == delta
    }
}
