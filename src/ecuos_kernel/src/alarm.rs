//! Counters and alarms
//!
//! Each counter keeps the alarms armed on it in a *delta list*: a list sorted
//! by expiry time in which every alarm stores the number of ticks between its
//! predecessor's expiry (the counter's current value for the first alarm) and
//! its own. Advancing a counter only has to look at the first alarm.
//! Alarms expiring at the same time fire in the order in which they were
//! armed.
use alloc::vec::Vec;
use ecuos_core::kernel::{
    cfg::{AlarmAction, AlarmDescriptor, AlarmStart, CounterDescriptor, CounterDriver},
    AlarmId, CancelAlarmError, CounterId, ErrorInfo, EventMask, GetAlarmBaseError, GetAlarmError,
    GetCounterValueError, GetElapsedValueError, HardwareTimer, HwTimerId, IncrementCounterError,
    ServiceId, SetAlarmError, TaskId, Tick,
};

use crate::{
    utils::intrusive_list::{InconsistentError, InsertError, ItemError, Link, ListAccessor, ListHead},
    xcore, Kernel, Port, Queue,
};

/// The static properties of the counter driving an alarm (`AlarmBaseType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlarmBase {
    pub max_allowed_value: Tick,
    pub ticks_per_base: Tick,
    pub min_cycle: Tick,
}

/// *Counter control block* - the state data of a counter.
#[derive(Debug, Default)]
pub(crate) struct CounterCb {
    pub(crate) value: Tick,
    /// The armed alarms, the earliest first.
    pub(crate) head: ListHead,
    /// The hardware timer reading the counter was last synchronized to.
    pub(crate) hw_last: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum AlarmState {
    #[default]
    Idle,
    InUse,
    /// The owning application was quarantined. The alarm can't be used until
    /// the application is restarted.
    Quarantined,
}

/// *Alarm control block* - the state data of an alarm.
#[derive(Debug, Default)]
pub(crate) struct AlarmCb {
    pub(crate) state: AlarmState,
    /// The period, `0` for a one-shot alarm.
    pub(crate) cycle: Tick,
}

/// The links and delta values of all alarms, indexed by alarm. The list heads
/// are in the counter control blocks.
///
/// <center>
///
#[doc = svgbobdoc::transform!(
/// ```svgbob
///  counter value
///      |
///      v     +3        +0        +5
///  ----*---------o---------o---------------o----> time
///             alarm 2   alarm 0         alarm 5
/// ```
)]
///
/// </center>
#[derive(Debug)]
pub(crate) struct AlarmLists {
    links: Vec<Option<Link>>,
    /// Ticks between the predecessor's expiry and this alarm's.
    deltas: Vec<u64>,
}

impl AlarmLists {
    pub(crate) fn new(num_alarms: usize) -> Self {
        Self {
            links: alloc::vec![None; num_alarms],
            deltas: alloc::vec![0; num_alarms],
        }
    }

    pub(crate) fn is_linked(&self, alarm: usize) -> bool {
        matches!(self.links.get(alarm), Some(Some(_)))
    }

    /// Insert `alarm` so that it expires `ticks` ticks from now, after any
    /// alarm expiring at the same time.
    pub(crate) fn insert(
        &mut self,
        head: &mut ListHead,
        alarm: usize,
        ticks: u64,
    ) -> Result<(), InsertError> {
        let mut accessor = ListAccessor::new(head, &mut self.links);
        if accessor.is_linked(alarm) {
            return Err(InsertError::AlreadyLinked);
        }
        let mut remaining = ticks;
        let mut cursor = accessor.front();
        while let Some(other) = cursor {
            let delta = *self.deltas.get(other).ok_or(InconsistentError)?;
            if delta > remaining {
                self.deltas[other] = delta - remaining;
                break;
            }
            remaining -= delta;
            cursor = accessor.next(other).map_err(|_| InconsistentError)?;
        }

        accessor.insert(alarm, cursor)?;
        self.deltas[alarm] = remaining;
        Ok(())
    }

    /// Unlink `alarm`, handing its delta to its successor.
    pub(crate) fn remove(&mut self, head: &mut ListHead, alarm: usize) -> Result<(), ItemError> {
        let mut accessor = ListAccessor::new(head, &mut self.links);
        if let Some(next) = accessor.next(alarm)? {
            self.deltas[next] += self.deltas[alarm];
        }
        accessor.remove(alarm)?;
        Ok(())
    }

    /// Get the number of ticks until `alarm` expires.
    pub(crate) fn remaining(&self, head: &ListHead, alarm: usize) -> Result<u64, ItemError> {
        if !self.is_linked(alarm) {
            return Err(ItemError::NotLinked);
        }
        let mut total = 0;
        let mut cursor = head.first;
        while let Some(other) = cursor {
            total += self.deltas[other];
            if other == alarm {
                return Ok(total);
            }
            let next = self.links[other].ok_or(InconsistentError)?.next;
            cursor = Some(next).filter(|&n| Some(n) != head.first);
        }
        Err(InconsistentError.into())
    }

    /// Let up to `ticks` ticks elapse. If the first alarm expires within
    /// them, it's unlinked and returned along with the number of ticks
    /// consumed. Otherwise, all `ticks` are consumed.
    pub(crate) fn advance(
        &mut self,
        head: &mut ListHead,
        ticks: u64,
    ) -> Result<Option<(usize, u64)>, InconsistentError> {
        let mut accessor = ListAccessor::new(head, &mut self.links);
        let Some(first) = accessor.front() else {
            return Ok(None);
        };
        let delta = *self.deltas.get(first).ok_or(InconsistentError)?;
        if delta > ticks {
            self.deltas[first] = delta - ticks;
            return Ok(None);
        }
        accessor.pop_front()?;
        Ok(Some((first, delta)))
    }

    /// The number of ticks until the first alarm expires.
    pub(crate) fn head_delta(&self, head: &ListHead) -> Option<u64> {
        head.first.map(|first| self.deltas[first])
    }
}

/// These methods implement the counter and alarm services.
impl<P: Port, Q: Queue> Kernel<P, Q> {
    /// Get the properties of the counter driving `alarm` (`GetAlarmBase`).
    pub fn get_alarm_base(&mut self, alarm: AlarmId) -> Result<AlarmBase, GetAlarmBaseError> {
        let result = self.get_alarm_base_inner(alarm);
        self.finish_service(ServiceId::GetAlarmBase, &[alarm.to_raw()], result)
    }

    fn get_alarm_base_inner(&self, alarm: AlarmId) -> Result<AlarmBase, GetAlarmBaseError> {
        let &AlarmDescriptor {
            counter,
            app,
            access,
            ..
        } = self.cfg.alarm(alarm).ok_or(GetAlarmBaseError::BadId)?;
        if !self.may_access(app, access) {
            return Err(GetAlarmBaseError::Access);
        }
        let counter = &self.cfg.counters[counter.index()];
        Ok(AlarmBase {
            max_allowed_value: counter.max_allowed_value,
            ticks_per_base: counter.ticks_per_base,
            min_cycle: counter.min_cycle,
        })
    }

    /// Get the number of ticks until `alarm` expires (`GetAlarm`).
    pub fn get_alarm(&mut self, alarm: AlarmId) -> Result<Tick, GetAlarmError> {
        let result = self.get_alarm_inner(alarm);
        self.finish_service(ServiceId::GetAlarm, &[alarm.to_raw()], result)
    }

    fn get_alarm_inner(&mut self, alarm: AlarmId) -> Result<Tick, GetAlarmError> {
        let &AlarmDescriptor {
            core, app, access, ..
        } = self.cfg.alarm(alarm).ok_or(GetAlarmError::BadId)?;
        if !self.may_access(app, access) {
            return Err(GetAlarmError::Access);
        }
        if core != self.core {
            return self.call_remote(core, xcore::GetAlarm { alarm });
        }
        self.get_alarm_local(alarm)
    }

    /// Arm `alarm` to expire `increment` ticks from now and then every
    /// `cycle` ticks (`SetRelAlarm`). `cycle == 0` makes a one-shot alarm.
    pub fn set_rel_alarm(
        &mut self,
        alarm: AlarmId,
        increment: Tick,
        cycle: Tick,
    ) -> Result<(), SetAlarmError> {
        let result = self.set_alarm_inner(alarm, AlarmStart::Relative, increment, cycle);
        self.finish_service(
            ServiceId::SetRelAlarm,
            &[alarm.to_raw(), increment, cycle],
            result,
        )
    }

    /// Arm `alarm` to expire when the counter reaches `start` and then every
    /// `cycle` ticks (`SetAbsAlarm`).
    ///
    /// If the counter already reads `start`, the alarm expires after a full
    /// counter revolution.
    pub fn set_abs_alarm(
        &mut self,
        alarm: AlarmId,
        start: Tick,
        cycle: Tick,
    ) -> Result<(), SetAlarmError> {
        let result = self.set_alarm_inner(alarm, AlarmStart::Absolute, start, cycle);
        self.finish_service(
            ServiceId::SetAbsAlarm,
            &[alarm.to_raw(), start, cycle],
            result,
        )
    }

    fn set_alarm_inner(
        &mut self,
        alarm: AlarmId,
        start: AlarmStart,
        value: Tick,
        cycle: Tick,
    ) -> Result<(), SetAlarmError> {
        let &AlarmDescriptor {
            core, app, access, ..
        } = self.cfg.alarm(alarm).ok_or(SetAlarmError::BadId)?;
        if !self.may_access(app, access) {
            return Err(SetAlarmError::Access);
        }
        if core != self.core {
            return self.call_remote(
                core,
                xcore::SetAlarm {
                    alarm,
                    start,
                    value,
                    cycle,
                },
            );
        }
        self.set_alarm_local(alarm, start, value, cycle)
    }

    /// Disarm `alarm` (`CancelAlarm`).
    pub fn cancel_alarm(&mut self, alarm: AlarmId) -> Result<(), CancelAlarmError> {
        let result = self.cancel_alarm_inner(alarm);
        self.finish_service(ServiceId::CancelAlarm, &[alarm.to_raw()], result)
    }

    fn cancel_alarm_inner(&mut self, alarm: AlarmId) -> Result<(), CancelAlarmError> {
        let &AlarmDescriptor {
            core, app, access, ..
        } = self.cfg.alarm(alarm).ok_or(CancelAlarmError::BadId)?;
        if !self.may_access(app, access) {
            return Err(CancelAlarmError::Access);
        }
        if core != self.core {
            return self.call_remote(core, xcore::CancelAlarm { alarm });
        }
        self.cancel_alarm_local(alarm)
    }

    /// Advance the software counter `counter` by one tick
    /// (`IncrementCounter`), processing the alarms expiring on the way.
    pub fn increment_counter(&mut self, counter: CounterId) -> Result<(), IncrementCounterError> {
        let result = self.increment_counter_inner(counter);
        self.finish_service(ServiceId::IncrementCounter, &[counter.to_raw()], result)
    }

    fn increment_counter_inner(&mut self, counter: CounterId) -> Result<(), IncrementCounterError> {
        let &CounterDescriptor {
            core,
            app,
            access,
            driver,
            ..
        } = self
            .cfg
            .counter(counter)
            .ok_or(IncrementCounterError::BadId)?;
        if driver != CounterDriver::Software {
            return Err(IncrementCounterError::BadId);
        }
        if !self.may_access(app, access) || !self.app_accessible(app) {
            return Err(IncrementCounterError::Access);
        }
        if core != self.core {
            return Err(IncrementCounterError::Core);
        }
        self.advance_counter(counter, 1);
        Ok(())
    }

    /// Get the current value of `counter` (`GetCounterValue`).
    pub fn get_counter_value(&mut self, counter: CounterId) -> Result<Tick, GetCounterValueError> {
        let result = self.get_counter_value_inner(counter);
        self.finish_service(ServiceId::GetCounterValue, &[counter.to_raw()], result)
    }

    fn get_counter_value_inner(
        &mut self,
        counter: CounterId,
    ) -> Result<Tick, GetCounterValueError> {
        let &CounterDescriptor {
            core, app, access, ..
        } = self
            .cfg
            .counter(counter)
            .ok_or(GetCounterValueError::BadId)?;
        if !self.may_access(app, access) {
            return Err(GetCounterValueError::Access);
        }
        if core != self.core {
            return self.call_remote(core, xcore::GetCounterValue { counter });
        }
        Ok(self.counter_value_local(counter))
    }

    /// Get the current value of `counter` and the number of ticks elapsed
    /// since it read `previous` (`GetElapsedValue`).
    ///
    /// Returns `(value, elapsed)`.
    pub fn get_elapsed_value(
        &mut self,
        counter: CounterId,
        previous: Tick,
    ) -> Result<(Tick, Tick), GetElapsedValueError> {
        let result = self.get_elapsed_value_inner(counter, previous);
        self.finish_service(
            ServiceId::GetElapsedValue,
            &[counter.to_raw(), previous],
            result,
        )
    }

    fn get_elapsed_value_inner(
        &mut self,
        counter: CounterId,
        previous: Tick,
    ) -> Result<(Tick, Tick), GetElapsedValueError> {
        let desc = *self
            .cfg
            .counter(counter)
            .ok_or(GetElapsedValueError::BadId)?;
        if !self.may_access(desc.app, desc.access) {
            return Err(GetElapsedValueError::Access);
        }
        if previous > desc.max_allowed_value {
            return Err(GetElapsedValueError::OutOfRange);
        }
        let value = if desc.core != self.core {
            self.call_remote(desc.core, xcore::GetCounterValue { counter })
                .map_err(|e| match e {
                    GetCounterValueError::BadId => GetElapsedValueError::BadId,
                    GetCounterValueError::Access => GetElapsedValueError::Access,
                    GetCounterValueError::Core => GetElapsedValueError::Core,
                })?
        } else {
            self.counter_value_local(counter)
        };
        Ok((value, desc.diff(previous, value)))
    }

    /// Process an interrupt from the hardware timer `timer`. Called by the
    /// port.
    ///
    /// Every hardware counter driven by the timer is advanced by the number
    /// of ticks elapsed since it was last synchronized.
    pub fn timer_interrupt(&mut self, timer: HwTimerId) {
        let cfg = self.cfg.clone();
        for (i, counter) in cfg.counters.iter().enumerate() {
            if counter.core == self.core && counter.driver == CounterDriver::Hardware(timer) {
                let counter = CounterId::from_index(i);
                self.sync_hw_counter(counter);
                self.program_hw_timer(counter);
            }
        }
        self.reschedule();
    }

    pub(crate) fn get_alarm_local(&mut self, alarm: AlarmId) -> Result<Tick, GetAlarmError> {
        let desc = self.cfg.alarms[alarm.index()];
        if !self.app_accessible(desc.app) {
            return Err(GetAlarmError::Access);
        }
        if self.alarms[alarm.index()].state != AlarmState::InUse {
            return Err(GetAlarmError::NotInUse);
        }
        self.sync_hw_counter(desc.counter);
        // Syncing may have fired it
        if self.alarms[alarm.index()].state != AlarmState::InUse {
            return Err(GetAlarmError::NotInUse);
        }
        let result = self
            .alarm_lists
            .remaining(&self.counters[desc.counter.index()].head, alarm.index());
        let remaining = self.expect_consistent(result, "alarm list corrupted");
        // A full revolution of a 32-bit counter doesn't fit
        Ok(remaining.min(Tick::MAX as u64) as Tick)
    }

    pub(crate) fn set_alarm_local(
        &mut self,
        alarm: AlarmId,
        start: AlarmStart,
        value: Tick,
        cycle: Tick,
    ) -> Result<(), SetAlarmError> {
        let desc = self.cfg.alarms[alarm.index()];
        let counter = self.cfg.counters[desc.counter.index()];
        if !self.app_accessible(desc.app) {
            return Err(SetAlarmError::Access);
        }
        match self.alarms[alarm.index()].state {
            AlarmState::InUse => return Err(SetAlarmError::InUse),
            AlarmState::Quarantined => return Err(SetAlarmError::Access),
            AlarmState::Idle => {}
        }

        let value_ok = match start {
            AlarmStart::Relative => (1..=counter.max_allowed_value).contains(&value),
            AlarmStart::Absolute => value <= counter.max_allowed_value,
        };
        let cycle_ok =
            cycle == 0 || (counter.min_cycle..=counter.max_allowed_value).contains(&cycle);
        if !value_ok || !cycle_ok {
            return Err(SetAlarmError::OutOfRange);
        }

        self.sync_hw_counter(desc.counter);
        let ticks = match start {
            AlarmStart::Relative => value as u64,
            AlarmStart::Absolute => {
                let now = self.counters[desc.counter.index()].value;
                match counter.diff(now, value) {
                    0 => counter.modulus(),
                    x => x as u64,
                }
            }
        };

        self.alarms[alarm.index()].cycle = cycle;
        self.arm_alarm(alarm, ticks);
        self.program_hw_timer(desc.counter);
        Ok(())
    }

    pub(crate) fn cancel_alarm_local(&mut self, alarm: AlarmId) -> Result<(), CancelAlarmError> {
        if !self.app_accessible(self.cfg.alarms[alarm.index()].app) {
            return Err(CancelAlarmError::Access);
        }
        if self.disarm_alarm(alarm) {
            Ok(())
        } else {
            Err(CancelAlarmError::NotInUse)
        }
    }

    pub(crate) fn counter_value_local(&mut self, counter: CounterId) -> Tick {
        self.sync_hw_counter(counter);
        self.counters[counter.index()].value
    }

    /// Link `alarm` into its counter's list, `ticks` ticks from now.
    pub(crate) fn arm_alarm(&mut self, alarm: AlarmId, ticks: u64) {
        let counter = self.cfg.alarms[alarm.index()].counter;
        let result =
            self.alarm_lists
                .insert(&mut self.counters[counter.index()].head, alarm.index(), ticks);
        self.expect_consistent(result, "alarm list corrupted");
        self.alarms[alarm.index()].state = AlarmState::InUse;
        log::trace!(
            "core {}: {alarm:?} armed, expires in {ticks} ticks",
            self.core.index()
        );
    }

    /// Unlink `alarm` if it's armed. Returns `true` if it was.
    pub(crate) fn disarm_alarm(&mut self, alarm: AlarmId) -> bool {
        if self.alarms[alarm.index()].state != AlarmState::InUse {
            return false;
        }
        let counter = self.cfg.alarms[alarm.index()].counter;
        let result = self
            .alarm_lists
            .remove(&mut self.counters[counter.index()].head, alarm.index());
        self.expect_consistent(result, "alarm list corrupted");
        self.alarms[alarm.index()].state = AlarmState::Idle;
        self.program_hw_timer(counter);
        log::trace!("core {}: {alarm:?} disarmed", self.core.index());
        true
    }

    /// Add `ticks` to the value of `counter`, firing the alarms expiring on
    /// the way in order.
    pub(crate) fn advance_counter(&mut self, counter: CounterId, ticks: u64) {
        let modulus = self.cfg.counters[counter.index()].modulus();
        let mut left = ticks;
        loop {
            let result = self
                .alarm_lists
                .advance(&mut self.counters[counter.index()].head, left);
            let step = self.expect_consistent(result, "alarm list corrupted");

            let cb = &mut self.counters[counter.index()];
            let Some((alarm, used)) = step else {
                cb.value = ((cb.value as u64 + left) % modulus) as Tick;
                break;
            };

            // The counter reads the expiry value while the alarm is processed
            cb.value = ((cb.value as u64 + used) % modulus) as Tick;
            left -= used;
            self.fire_alarm(AlarmId::from_index(alarm));
        }
    }

    fn fire_alarm(&mut self, alarm: AlarmId) {
        let desc = self.cfg.alarms[alarm.index()];
        log::trace!("core {}: {alarm:?} expired", self.core.index());

        let cycle = self.alarms[alarm.index()].cycle;
        if cycle != 0 {
            self.arm_alarm(alarm, cycle as u64);
        } else {
            self.alarms[alarm.index()].state = AlarmState::Idle;
        }

        match desc.action {
            AlarmAction::ActivateTask(task) => self.expiry_activate_task(task, alarm.to_raw()),
            AlarmAction::SetEvent(task, mask) => self.expiry_set_event(task, mask, alarm.to_raw()),
            AlarmAction::Callback(f) => f(alarm),
            AlarmAction::IncrementCounter(counter) => self.advance_counter(counter, 1),
            AlarmAction::RunSchedule(table) => self.run_schedule(table),
        }
    }

    /// Activate `task` for an expiring alarm or schedule table point
    /// identified by `source`. A task of another core is activated
    /// asynchronously; that core reports failures.
    pub(crate) fn expiry_activate_task(&mut self, task: TaskId, source: u32) {
        let core = self.cfg.tasks[task.index()].core;
        let result = if core != self.core {
            self.post_remote(core, xcore::AlarmActivateTask { task })
        } else {
            self.activate_task_local(task).map_err(Into::into)
        };
        if let Err(code) = result {
            self.report_error(ErrorInfo::new(
                ServiceId::AlarmAction,
                code,
                &[source, task.to_raw()],
            ));
        }
    }

    /// Set events for an expiring alarm or schedule table point. See
    /// [`Self::expiry_activate_task`].
    pub(crate) fn expiry_set_event(&mut self, task: TaskId, mask: EventMask, source: u32) {
        let core = self.cfg.tasks[task.index()].core;
        let result = if core != self.core {
            self.post_remote(core, xcore::AlarmSetEvent { task, mask })
        } else {
            self.set_event_local(task, mask).map_err(Into::into)
        };
        if let Err(code) = result {
            self.report_error(ErrorInfo::new(
                ServiceId::AlarmAction,
                code,
                &[source, task.to_raw(), mask],
            ));
        }
    }

    /// Catch up a hardware counter with its timer. Does nothing for a
    /// software counter.
    pub(crate) fn sync_hw_counter(&mut self, counter: CounterId) {
        let CounterDriver::Hardware(timer) = self.cfg.counters[counter.index()].driver else {
            return;
        };
        let Some(now) = self.port.timer(timer).map(|t| t.read()) else {
            self.panic_shutdown("hardware timer missing");
        };
        let desc = self.cfg.counters[counter.index()];
        let cb = &mut self.counters[counter.index()];
        let elapsed = desc.diff(cb.hw_last, now);
        cb.hw_last = now;
        if elapsed > 0 {
            self.advance_counter(counter, elapsed as u64);
        }
    }

    /// Request a timer interrupt for the first alarm of a hardware counter,
    /// or stop the timer if no alarm is armed. Does nothing for a software
    /// counter.
    pub(crate) fn program_hw_timer(&mut self, counter: CounterId) {
        let CounterDriver::Hardware(timer) = self.cfg.counters[counter.index()].driver else {
            return;
        };
        let cb = &self.counters[counter.index()];
        let (hw_last, delta) = (cb.hw_last, self.alarm_lists.head_delta(&cb.head));
        let Some(t) = self.port.timer(timer) else {
            self.panic_shutdown("hardware timer missing");
        };
        match delta {
            Some(delta) => {
                let max = t.max_value() as u64;
                t.start(hw_last, delta.clamp(1, max.max(1)) as u32);
            }
            None => t.stop(),
        }
    }
}
