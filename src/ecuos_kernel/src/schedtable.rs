//! Schedule tables
//!
//! A schedule table is a list of expiry points processed in order, one
//! *round* at a time, as its counter advances. Each table owns an internal
//! alarm on that counter (created by the configuration builder) which is
//! always armed for the next expiry point or for the *final expiry*, the end
//! of the round.
//!
//! An explicitly synchronized table measures its deviation from a global
//! time supplied by `SyncScheduleTable` and corrects it gradually by
//! lengthening or shortening the delays between expiry points, within the
//! bounds configured for each point.
use ecuos_core::kernel::{
    cfg::{ExpiryAction, ScheduleTableDescriptor, TableStart},
    ChainScheduleTableError, GetScheduleTableStatusError, ScheduleTableId, ScheduleTableStatus,
    ServiceId, SetScheduleTableAsyncError, StartScheduleTableError, StopScheduleTableError,
    SyncScheduleTableError, Tick,
};

use crate::{xcore, Kernel, Port, Queue};

/// *Schedule table control block* - the state data of a schedule table.
///
/// <center>
///
#[doc = svgbobdoc::transform!(
/// ```svgbob
///           chain    .------.  predecessor's final expiry
///       .----------->| Next |--------------------.
///       |            '------'                    |
///       |                                        v
///  .---------.          start              .---------.
///  | Stopped |---------------------------->| Running |
///  '---------'                             '---------'
///       |                                    |    ^
///       | synchron                      sync |    | async
///       v                                    v    |
///  .---------.          sync      .-----------------------.
///  | Waiting |------------------->| RunningAndSynchronous |
///  '---------'                    '-----------------------'
/// ```
)]
///
/// </center>
///
/// Every state returns to `Stopped` on `StopScheduleTable` or at the end of
/// a non-repeating round.
#[derive(Debug)]
pub(crate) struct ScheduleTableCb {
    pub(crate) status: ScheduleTableStatus,

    /// The expiry point the internal alarm is armed for. Equal to the number
    /// of points if it's armed for the final expiry.
    pub(crate) next_point: usize,

    /// The table to start at the final expiry.
    pub(crate) chained: Option<ScheduleTableId>,

    /// The deviation yet to be corrected. Positive if the table is ahead of
    /// the global time.
    pub(crate) adjust: i64,
}

impl Default for ScheduleTableCb {
    fn default() -> Self {
        Self {
            status: ScheduleTableStatus::Stopped,
            next_point: 0,
            chained: None,
            adjust: 0,
        }
    }
}

/// Fold a table position difference into `(-duration/2, duration/2]`.
fn fold_deviation(diff: i64, duration: Tick) -> i64 {
    let duration = duration as i64;
    let d = diff.rem_euclid(duration);
    if d > duration / 2 {
        d - duration
    } else {
        d
    }
}

/// These methods implement the schedule table services.
impl<P: Port, Q: Queue> Kernel<P, Q> {
    /// Start `table` `offset` ticks from now (`StartScheduleTableRel`). The
    /// first expiry point is processed after another *initial offset*.
    pub fn start_schedule_table_rel(
        &mut self,
        table: ScheduleTableId,
        offset: Tick,
    ) -> Result<(), StartScheduleTableError> {
        let result = self.start_schedule_table_inner(table, TableStart::Relative(offset));
        self.finish_service(
            ServiceId::StartScheduleTableRel,
            &[table.to_raw(), offset],
            result,
        )
    }

    /// Start `table` when its counter reaches `start`
    /// (`StartScheduleTableAbs`).
    pub fn start_schedule_table_abs(
        &mut self,
        table: ScheduleTableId,
        start: Tick,
    ) -> Result<(), StartScheduleTableError> {
        let result = self.start_schedule_table_inner(table, TableStart::Absolute(start));
        self.finish_service(
            ServiceId::StartScheduleTableAbs,
            &[table.to_raw(), start],
            result,
        )
    }

    /// Prepare the explicitly synchronized `table` to start on the first
    /// call to [`Self::sync_schedule_table`] (`StartScheduleTableSynchron`).
    pub fn start_schedule_table_synchron(
        &mut self,
        table: ScheduleTableId,
    ) -> Result<(), StartScheduleTableError> {
        let result = self.start_schedule_table_inner(table, TableStart::Synchron);
        self.finish_service(
            ServiceId::StartScheduleTableSynchron,
            &[table.to_raw()],
            result,
        )
    }

    fn start_schedule_table_inner(
        &mut self,
        table: ScheduleTableId,
        start: TableStart,
    ) -> Result<(), StartScheduleTableError> {
        let desc = self
            .cfg
            .schedule_table(table)
            .ok_or(StartScheduleTableError::BadId)?;
        let (core, app, access) = (desc.core, desc.app, desc.access);
        let max = self.cfg.counters[desc.counter.index()].max_allowed_value;

        match start {
            TableStart::Relative(_) if desc.is_implicit() => {
                return Err(StartScheduleTableError::BadId)
            }
            TableStart::Synchron if !desc.is_syncable() => {
                return Err(StartScheduleTableError::BadId)
            }
            _ => {}
        }
        if !self.may_access(app, access) {
            return Err(StartScheduleTableError::Access);
        }
        let in_range = match start {
            TableStart::Relative(offset) => {
                offset >= 1 && offset as u64 + desc.initial_offset() as u64 <= max as u64
            }
            TableStart::Absolute(start) => start <= max,
            TableStart::Synchron => true,
        };
        if !in_range {
            return Err(StartScheduleTableError::OutOfRange);
        }

        if core != self.core {
            return self.call_remote(core, xcore::StartScheduleTable { table, start });
        }
        self.start_schedule_table_local(table, start)
    }

    /// Stop `table` (`StopScheduleTable`). A table chained to it is stopped
    /// as well.
    pub fn stop_schedule_table(
        &mut self,
        table: ScheduleTableId,
    ) -> Result<(), StopScheduleTableError> {
        let result = self.stop_schedule_table_inner(table);
        self.finish_service(ServiceId::StopScheduleTable, &[table.to_raw()], result)
    }

    fn stop_schedule_table_inner(
        &mut self,
        table: ScheduleTableId,
    ) -> Result<(), StopScheduleTableError> {
        let &ScheduleTableDescriptor {
            core, app, access, ..
        } = self
            .cfg
            .schedule_table(table)
            .ok_or(StopScheduleTableError::BadId)?;
        if !self.may_access(app, access) {
            return Err(StopScheduleTableError::Access);
        }
        if core != self.core {
            return self.call_remote(core, xcore::StopScheduleTable { table });
        }
        self.stop_schedule_table_local(table)
    }

    /// Arrange for `next` to start at the final expiry of `current`
    /// (`ChainScheduleTable`, `NextScheduleTable` in AUTOSAR OS). Replaces a
    /// table chained before.
    pub fn chain_schedule_table(
        &mut self,
        current: ScheduleTableId,
        next: ScheduleTableId,
    ) -> Result<(), ChainScheduleTableError> {
        let result = self.chain_schedule_table_inner(current, next);
        self.finish_service(
            ServiceId::ChainScheduleTable,
            &[current.to_raw(), next.to_raw()],
            result,
        )
    }

    fn chain_schedule_table_inner(
        &mut self,
        current: ScheduleTableId,
        next: ScheduleTableId,
    ) -> Result<(), ChainScheduleTableError> {
        let cur_desc = self
            .cfg
            .schedule_table(current)
            .ok_or(ChainScheduleTableError::BadId)?;
        let next_desc = self
            .cfg
            .schedule_table(next)
            .ok_or(ChainScheduleTableError::BadId)?;
        if cur_desc.counter != next_desc.counter
            || cur_desc.is_syncable() != next_desc.is_syncable()
            || cur_desc.is_implicit() != next_desc.is_implicit()
        {
            return Err(ChainScheduleTableError::BadId);
        }
        let core = cur_desc.core;
        if !self.may_access(cur_desc.app, cur_desc.access)
            || !self.may_access(next_desc.app, next_desc.access)
        {
            return Err(ChainScheduleTableError::Access);
        }
        if core != self.core {
            return self.call_remote(core, xcore::ChainScheduleTable { current, next });
        }
        self.chain_schedule_table_local(current, next)
    }

    /// Synchronize `table` with the global time `value`, the position within
    /// a round the table should be at (`SyncScheduleTable`).
    pub fn sync_schedule_table(
        &mut self,
        table: ScheduleTableId,
        value: Tick,
    ) -> Result<(), SyncScheduleTableError> {
        let result = self.sync_schedule_table_inner(table, value);
        self.finish_service(
            ServiceId::SyncScheduleTable,
            &[table.to_raw(), value],
            result,
        )
    }

    fn sync_schedule_table_inner(
        &mut self,
        table: ScheduleTableId,
        value: Tick,
    ) -> Result<(), SyncScheduleTableError> {
        let desc = self
            .cfg
            .schedule_table(table)
            .ok_or(SyncScheduleTableError::BadId)?;
        if !desc.is_syncable() {
            return Err(SyncScheduleTableError::BadId);
        }
        let (core, app, access, duration) = (desc.core, desc.app, desc.access, desc.duration);
        if !self.may_access(app, access) {
            return Err(SyncScheduleTableError::Access);
        }
        if value >= duration {
            return Err(SyncScheduleTableError::OutOfRange);
        }
        if core != self.core {
            return self.call_remote(core, xcore::SyncScheduleTable { table, value });
        }
        self.sync_schedule_table_local(table, value)
    }

    /// Stop synchronizing `table` (`SetScheduleTableAsync`). A pending
    /// correction is dropped.
    pub fn set_schedule_table_async(
        &mut self,
        table: ScheduleTableId,
    ) -> Result<(), SetScheduleTableAsyncError> {
        let result = self.set_schedule_table_async_inner(table);
        self.finish_service(ServiceId::SetScheduleTableAsync, &[table.to_raw()], result)
    }

    fn set_schedule_table_async_inner(
        &mut self,
        table: ScheduleTableId,
    ) -> Result<(), SetScheduleTableAsyncError> {
        let desc = self
            .cfg
            .schedule_table(table)
            .ok_or(SetScheduleTableAsyncError::BadId)?;
        if !desc.is_syncable() {
            return Err(SetScheduleTableAsyncError::BadId);
        }
        let (core, app, access) = (desc.core, desc.app, desc.access);
        if !self.may_access(app, access) {
            return Err(SetScheduleTableAsyncError::Access);
        }
        if core != self.core {
            return self.call_remote(core, xcore::SetScheduleTableAsync { table });
        }
        self.set_schedule_table_async_local(table)
    }

    /// Get the status of `table` (`GetScheduleTableStatus`).
    pub fn get_schedule_table_status(
        &mut self,
        table: ScheduleTableId,
    ) -> Result<ScheduleTableStatus, GetScheduleTableStatusError> {
        let result = self.get_schedule_table_status_inner(table);
        self.finish_service(ServiceId::GetScheduleTableStatus, &[table.to_raw()], result)
    }

    fn get_schedule_table_status_inner(
        &mut self,
        table: ScheduleTableId,
    ) -> Result<ScheduleTableStatus, GetScheduleTableStatusError> {
        let &ScheduleTableDescriptor {
            core, app, access, ..
        } = self
            .cfg
            .schedule_table(table)
            .ok_or(GetScheduleTableStatusError::BadId)?;
        if !self.may_access(app, access) {
            return Err(GetScheduleTableStatusError::Access);
        }
        if core != self.core {
            return self.call_remote(core, xcore::GetScheduleTableStatus { table });
        }
        Ok(self.tables[table.index()].status)
    }

    pub(crate) fn start_schedule_table_local(
        &mut self,
        table: ScheduleTableId,
        start: TableStart,
    ) -> Result<(), StartScheduleTableError> {
        let cfg = self.cfg.clone();
        let desc = &cfg.schedule_tables[table.index()];
        let counter = &cfg.counters[desc.counter.index()];
        if !self.app_accessible(desc.app) {
            return Err(StartScheduleTableError::Access);
        }
        if self.tables[table.index()].status != ScheduleTableStatus::Stopped {
            return Err(StartScheduleTableError::State);
        }
        // Only one table may be started per counter
        let counter_busy = cfg
            .schedule_tables
            .iter()
            .zip(self.tables.iter())
            .any(|(d, cb)| d.counter == desc.counter && cb.status.is_started());
        if counter_busy {
            return Err(StartScheduleTableError::State);
        }

        let cb = &mut self.tables[table.index()];
        cb.next_point = 0;
        cb.chained = None;
        cb.adjust = 0;

        let ticks = match start {
            TableStart::Relative(offset) => {
                cb.status = ScheduleTableStatus::Running;
                offset as u64 + desc.initial_offset() as u64
            }
            TableStart::Absolute(start) => {
                cb.status = if desc.is_implicit() {
                    ScheduleTableStatus::RunningAndSynchronous
                } else {
                    ScheduleTableStatus::Running
                };
                self.sync_hw_counter(desc.counter);
                let now = self.counters[desc.counter.index()].value;
                match counter.diff(now, counter.add(start, desc.initial_offset())) {
                    0 => counter.modulus(),
                    x => x as u64,
                }
            }
            TableStart::Synchron => {
                cb.status = ScheduleTableStatus::Waiting;
                log::debug!("core {}: {table:?} waiting for sync", self.core.index());
                return Ok(());
            }
        };

        self.arm_alarm(desc.alarm, ticks);
        self.program_hw_timer(desc.counter);
        log::debug!("core {}: {table:?} started ({start:?})", self.core.index());
        Ok(())
    }

    pub(crate) fn stop_schedule_table_local(
        &mut self,
        table: ScheduleTableId,
    ) -> Result<(), StopScheduleTableError> {
        if !self.app_accessible(self.cfg.schedule_tables[table.index()].app) {
            return Err(StopScheduleTableError::Access);
        }
        if self.stop_table(table) {
            Ok(())
        } else {
            Err(StopScheduleTableError::NotRunning)
        }
    }

    /// Stop `table` and the table chained to it. Returns `false` if it was
    /// already stopped.
    pub(crate) fn stop_table(&mut self, table: ScheduleTableId) -> bool {
        let status = self.tables[table.index()].status;
        match status {
            ScheduleTableStatus::Stopped => return false,
            ScheduleTableStatus::Next => {
                // Unchain from the predecessor
                for cb in self.tables.iter_mut() {
                    if cb.chained == Some(table) {
                        cb.chained = None;
                    }
                }
            }
            _ => {
                let alarm = self.cfg.schedule_tables[table.index()].alarm;
                self.disarm_alarm(alarm);
                if let Some(next) = self.tables[table.index()].chained.take() {
                    self.tables[next.index()].status = ScheduleTableStatus::Stopped;
                }
            }
        }
        self.tables[table.index()].status = ScheduleTableStatus::Stopped;
        log::debug!("core {}: {table:?} stopped", self.core.index());
        true
    }

    pub(crate) fn chain_schedule_table_local(
        &mut self,
        current: ScheduleTableId,
        next: ScheduleTableId,
    ) -> Result<(), ChainScheduleTableError> {
        let cfg = self.cfg.clone();
        if !self.app_accessible(cfg.schedule_tables[current.index()].app)
            || !self.app_accessible(cfg.schedule_tables[next.index()].app)
        {
            return Err(ChainScheduleTableError::Access);
        }
        if !self.tables[current.index()].status.is_started() {
            return Err(ChainScheduleTableError::NotRunning);
        }
        if self.tables[next.index()].status != ScheduleTableStatus::Stopped {
            return Err(ChainScheduleTableError::State);
        }

        if let Some(old) = self.tables[current.index()].chained.replace(next) {
            self.tables[old.index()].status = ScheduleTableStatus::Stopped;
        }
        self.tables[next.index()].status = ScheduleTableStatus::Next;
        log::debug!(
            "core {}: {next:?} chained after {current:?}",
            self.core.index()
        );
        Ok(())
    }

    pub(crate) fn sync_schedule_table_local(
        &mut self,
        table: ScheduleTableId,
        value: Tick,
    ) -> Result<(), SyncScheduleTableError> {
        let cfg = self.cfg.clone();
        let desc = &cfg.schedule_tables[table.index()];
        if !self.app_accessible(desc.app) {
            return Err(SyncScheduleTableError::Access);
        }

        // Process the expiry points that are already due. This may stop the
        // table.
        self.sync_hw_counter(desc.counter);
        self.program_hw_timer(desc.counter);

        match self.tables[table.index()].status {
            ScheduleTableStatus::Stopped | ScheduleTableStatus::Next => {
                Err(SyncScheduleTableError::State)
            }
            ScheduleTableStatus::Waiting => {
                // The round starts when the global time wraps to zero
                let cb = &mut self.tables[table.index()];
                cb.status = ScheduleTableStatus::RunningAndSynchronous;
                cb.next_point = 0;
                let ticks = (desc.duration - value) as u64 + desc.initial_offset() as u64;
                self.arm_alarm(desc.alarm, ticks);
                self.program_hw_timer(desc.counter);
                log::debug!("core {}: {table:?} synchronized", self.core.index());
                Ok(())
            }
            ScheduleTableStatus::Running | ScheduleTableStatus::RunningAndSynchronous => {
                let alarm = desc.alarm;
                let remaining = match self.get_alarm_local(alarm) {
                    Ok(x) => x as i64,
                    Err(_) => return Err(SyncScheduleTableError::State),
                };
                let cb = &mut self.tables[table.index()];
                let target = desc
                    .points
                    .get(cb.next_point)
                    .map_or(desc.duration, |p| p.offset) as i64;
                let deviation = fold_deviation(target - remaining - value as i64, desc.duration);

                cb.adjust = deviation;
                if deviation.unsigned_abs() <= desc.precision as u64 {
                    cb.status = ScheduleTableStatus::RunningAndSynchronous;
                } else {
                    cb.status = ScheduleTableStatus::Running;
                    log::warn!(
                        "core {}: {table:?} deviates from the global time by {deviation} ticks \
                         (precision {})",
                        self.core.index(),
                        desc.precision
                    );
                }
                Ok(())
            }
        }
    }

    pub(crate) fn set_schedule_table_async_local(
        &mut self,
        table: ScheduleTableId,
    ) -> Result<(), SetScheduleTableAsyncError> {
        if !self.app_accessible(self.cfg.schedule_tables[table.index()].app) {
            return Err(SetScheduleTableAsyncError::Access);
        }
        let cb = &mut self.tables[table.index()];
        if !cb.status.is_running() {
            return Err(SetScheduleTableAsyncError::State);
        }
        cb.status = ScheduleTableStatus::Running;
        cb.adjust = 0;
        Ok(())
    }

    /// Process the expiry of `table`'s internal alarm: run the due expiry
    /// point (or the final expiry) and every one following it with no delay,
    /// then rearm the alarm.
    pub(crate) fn run_schedule(&mut self, table: ScheduleTableId) {
        let cfg = self.cfg.clone();
        let mut table = table;
        loop {
            let desc = &cfg.schedule_tables[table.index()];
            let i = self.tables[table.index()].next_point;

            let Some(point) = desc.points.get(i) else {
                // Final expiry
                let next = self.tables[table.index()].chained.take();
                if let Some(next) = next {
                    self.tables[table.index()].status = ScheduleTableStatus::Stopped;
                    let next_desc = &cfg.schedule_tables[next.index()];
                    let cb = &mut self.tables[next.index()];
                    cb.status = if next_desc.is_implicit() {
                        ScheduleTableStatus::RunningAndSynchronous
                    } else {
                        ScheduleTableStatus::Running
                    };
                    cb.next_point = 0;
                    cb.adjust = 0;
                    log::debug!(
                        "core {}: {table:?} finished, {next:?} starts",
                        self.core.index()
                    );
                    table = next;
                    match cfg.schedule_tables[next.index()].initial_offset() {
                        0 => continue,
                        delay => {
                            self.arm_alarm(next_desc.alarm, delay as u64);
                            return;
                        }
                    }
                } else if desc.is_repeating() {
                    self.tables[table.index()].next_point = 0;
                    match desc.initial_offset() {
                        0 => continue,
                        delay => {
                            self.arm_alarm(desc.alarm, delay as u64);
                            return;
                        }
                    }
                } else {
                    self.tables[table.index()].status = ScheduleTableStatus::Stopped;
                    log::debug!("core {}: {table:?} finished", self.core.index());
                    return;
                }
            };

            log::trace!(
                "core {}: {table:?} expiry point {i} (offset {})",
                self.core.index(),
                point.offset
            );
            for action in point.actions.iter() {
                match *action {
                    ExpiryAction::ActivateTask(task) => {
                        self.expiry_activate_task(task, table.to_raw())
                    }
                    ExpiryAction::SetEvent(task, mask) => {
                        self.expiry_set_event(task, mask, table.to_raw())
                    }
                }
            }

            let mut delay = desc.delay_after(i) as i64;
            let cb = &mut self.tables[table.index()];
            cb.next_point = i + 1;
            if desc.is_syncable() && cb.adjust != 0 {
                if cb.adjust > 0 {
                    let step = cb.adjust.min(point.max_lengthen as i64);
                    delay += step;
                    cb.adjust -= step;
                } else {
                    let step = (-cb.adjust).min(point.max_shorten as i64);
                    delay -= step;
                    cb.adjust += step;
                }
                if cb.status.is_running()
                    && cb.adjust.unsigned_abs() <= desc.precision as u64
                {
                    cb.status = ScheduleTableStatus::RunningAndSynchronous;
                }
            }

            if delay > 0 {
                self.arm_alarm(desc.alarm, delay as u64);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use ecuos_core::kernel::{cfg::*, *};

    #[test]
    fn deviation_folding() {
        assert_eq!(fold_deviation(3, 30), 3);
        assert_eq!(fold_deviation(-3, 30), -3);
        assert_eq!(fold_deviation(15, 30), 15);
        assert_eq!(fold_deviation(16, 30), -14);
        assert_eq!(fold_deviation(29, 30), -1);
        assert_eq!(fold_deviation(-31, 30), -1);
    }

    /// Count the activations of each task by letting the idle-priority main
    /// task terminate and the others run to completion.
    fn drain(k: &mut crate::Kernel<TestPort>) -> Vec<TaskId> {
        let mut ran = Vec::new();
        while let Some(t) = k.get_task_id() {
            ran.push(t);
            k.terminate_task().unwrap();
        }
        ran
    }

    struct Fixture {
        counter: CounterId,
        table: ScheduleTableId,
        tasks: [TaskId; 3],
    }

    fn repeating_table(b: &mut CfgBuilder) -> Fixture {
        let tasks = [10, 20, 30].map(|_| {
            TaskDescriptor::build()
                .priority(1)
                .max_activations(4)
                .finish(b)
        });
        let counter = CounterDescriptor::build().max_allowed_value(999).finish(b);
        let table = ScheduleTableDescriptor::build()
            .counter(counter)
            .duration(30)
            .repeating()
            .point(ExpiryPoint::at(10).activate_task(tasks[0]))
            .point(ExpiryPoint::at(20).activate_task(tasks[1]))
            .point(ExpiryPoint::at(30).activate_task(tasks[2]))
            .finish(b);
        Fixture {
            counter,
            table,
            tasks,
        }
    }

    #[test]
    fn repeating_table_fires_points_in_order() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut b = CfgBuilder::new(1);
        let f = repeating_table(&mut b);
        let (mut k, _hooks) = boot(b);

        k.start_schedule_table_abs(f.table, 0).unwrap();
        assert_eq!(
            k.get_schedule_table_status(f.table),
            Ok(ScheduleTableStatus::Running)
        );

        let mut fired = Vec::new();
        for now in 1..=40 {
            k.increment_counter(f.counter).unwrap();
            for t in drain(&mut k) {
                fired.push((now, t));
            }
        }
        assert_eq!(
            fired,
            [
                (10, f.tasks[0]),
                (20, f.tasks[1]),
                (30, f.tasks[2]),
                (40, f.tasks[0]),
            ]
        );
    }

    #[test]
    fn single_shot_table_stops() {
        let mut b = CfgBuilder::new(1);
        let t = TaskDescriptor::build().priority(1).finish(&mut b);
        let counter = CounterDescriptor::build().max_allowed_value(99).finish(&mut b);
        let table = ScheduleTableDescriptor::build()
            .counter(counter)
            .duration(10)
            .point(ExpiryPoint::at(0).activate_task(t))
            .finish(&mut b);
        let (mut k, _hooks) = boot(b);

        k.start_schedule_table_rel(table, 2).unwrap();
        k.increment_counter(counter).unwrap();
        assert_eq!(k.get_task_id(), None);
        k.increment_counter(counter).unwrap();
        assert_eq!(k.get_task_id(), Some(t));
        k.terminate_task().unwrap();

        // Final expiry
        for _ in 0..9 {
            k.increment_counter(counter).unwrap();
        }
        assert_eq!(
            k.get_schedule_table_status(table),
            Ok(ScheduleTableStatus::Running)
        );
        k.increment_counter(counter).unwrap();
        assert_eq!(
            k.get_schedule_table_status(table),
            Ok(ScheduleTableStatus::Stopped)
        );
        assert_eq!(k.get_task_id(), None);
    }

    #[test]
    fn start_errors() {
        let mut b = CfgBuilder::new(1);
        let f = repeating_table(&mut b);
        let other = ScheduleTableDescriptor::build()
            .counter(f.counter)
            .duration(50)
            .point(ExpiryPoint::at(5))
            .finish(&mut b);
        let (mut k, _hooks) = boot(b);

        assert_eq!(
            k.start_schedule_table_rel(f.table, 0),
            Err(StartScheduleTableError::OutOfRange)
        );
        assert_eq!(
            k.start_schedule_table_rel(f.table, 990),
            Err(StartScheduleTableError::OutOfRange)
        );
        assert_eq!(
            k.start_schedule_table_abs(f.table, 1000),
            Err(StartScheduleTableError::OutOfRange)
        );
        assert_eq!(
            k.start_schedule_table_synchron(f.table),
            Err(StartScheduleTableError::BadId)
        );

        k.start_schedule_table_rel(f.table, 5).unwrap();
        assert_eq!(
            k.start_schedule_table_rel(f.table, 5),
            Err(StartScheduleTableError::State)
        );
        // Same counter
        assert_eq!(
            k.start_schedule_table_rel(other, 5),
            Err(StartScheduleTableError::State)
        );

        k.stop_schedule_table(f.table).unwrap();
        assert_eq!(
            k.stop_schedule_table(f.table),
            Err(StopScheduleTableError::NotRunning)
        );
        k.start_schedule_table_rel(other, 5).unwrap();
    }

    #[test]
    fn chaining() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut b = CfgBuilder::new(1);
        let ta = TaskDescriptor::build().priority(1).finish(&mut b);
        let tb = TaskDescriptor::build().priority(1).finish(&mut b);
        let counter = CounterDescriptor::build().max_allowed_value(99).finish(&mut b);
        let a = ScheduleTableDescriptor::build()
            .counter(counter)
            .duration(20)
            .repeating()
            .point(ExpiryPoint::at(5).activate_task(ta))
            .finish(&mut b);
        let b_table = ScheduleTableDescriptor::build()
            .counter(counter)
            .duration(10)
            .point(ExpiryPoint::at(0).activate_task(tb))
            .finish(&mut b);
        let (mut k, _hooks) = boot(b);

        assert_eq!(
            k.chain_schedule_table(a, b_table),
            Err(ChainScheduleTableError::NotRunning)
        );
        k.start_schedule_table_abs(a, 0).unwrap();
        k.chain_schedule_table(a, b_table).unwrap();
        assert_eq!(
            k.get_schedule_table_status(b_table),
            Ok(ScheduleTableStatus::Next)
        );
        assert_eq!(
            k.chain_schedule_table(a, b_table),
            Err(ChainScheduleTableError::State)
        );

        let mut fired = Vec::new();
        for now in 1..=20 {
            k.increment_counter(counter).unwrap();
            for t in drain(&mut k) {
                fired.push((now, t));
            }
        }
        // `b_table` starts exactly at the end of `a`'s round
        assert_eq!(fired, [(5, ta), (20, tb)]);
        assert_eq!(
            k.get_schedule_table_status(a),
            Ok(ScheduleTableStatus::Stopped)
        );
        assert_eq!(
            k.get_schedule_table_status(b_table),
            Ok(ScheduleTableStatus::Running)
        );
    }

    #[test]
    fn stopping_also_stops_chained_table() {
        let mut b = CfgBuilder::new(1);
        let f = repeating_table(&mut b);
        let next = ScheduleTableDescriptor::build()
            .counter(f.counter)
            .duration(30)
            .point(ExpiryPoint::at(3))
            .finish(&mut b);
        let (mut k, _hooks) = boot(b);

        k.start_schedule_table_rel(f.table, 1).unwrap();
        k.chain_schedule_table(f.table, next).unwrap();
        k.stop_schedule_table(f.table).unwrap();
        assert_eq!(
            k.get_schedule_table_status(next),
            Ok(ScheduleTableStatus::Stopped)
        );
        let alarm = k.config().schedule_table(f.table).unwrap().alarm;
        assert_eq!(k.get_alarm(alarm), Err(GetAlarmError::NotInUse));
    }

    struct SyncFixture {
        counter: CounterId,
        table: ScheduleTableId,
        task: TaskId,
    }

    fn sync_table(b: &mut CfgBuilder) -> SyncFixture {
        let task = TaskDescriptor::build()
            .priority(1)
            .max_activations(4)
            .finish(b);
        let counter = CounterDescriptor::build().max_allowed_value(999).finish(b);
        let table = ScheduleTableDescriptor::build()
            .counter(counter)
            .duration(100)
            .repeating()
            .explicit_sync(1)
            .point(ExpiryPoint::at(0).activate_task(task).adjustment(5, 5))
            .point(ExpiryPoint::at(50).adjustment(5, 5))
            .finish(b);
        SyncFixture {
            counter,
            table,
            task,
        }
    }

    #[test]
    fn synchronous_start_and_correction() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut b = CfgBuilder::new(1);
        let f = sync_table(&mut b);
        let (mut k, _hooks) = boot(b);
        let alarm = k.config().schedule_table(f.table).unwrap().alarm;

        assert_eq!(
            k.sync_schedule_table(f.table, 10),
            Err(SyncScheduleTableError::State)
        );
        k.start_schedule_table_synchron(f.table).unwrap();
        assert_eq!(
            k.get_schedule_table_status(f.table),
            Ok(ScheduleTableStatus::Waiting)
        );
        assert_eq!(
            k.sync_schedule_table(f.table, 100),
            Err(SyncScheduleTableError::OutOfRange)
        );

        // The round starts 10 ticks later
        k.sync_schedule_table(f.table, 90).unwrap();
        assert_eq!(
            k.get_schedule_table_status(f.table),
            Ok(ScheduleTableStatus::RunningAndSynchronous)
        );
        for _ in 0..10 {
            k.increment_counter(f.counter).unwrap();
        }
        assert_eq!(k.get_task_id(), Some(f.task));
        k.terminate_task().unwrap();
        assert_eq!(k.get_alarm(alarm), Ok(50));

        // 10 ticks into the round, the global time says 7: 3 ticks ahead
        for _ in 0..10 {
            k.increment_counter(f.counter).unwrap();
        }
        k.sync_schedule_table(f.table, 7).unwrap();
        assert_eq!(
            k.get_schedule_table_status(f.table),
            Ok(ScheduleTableStatus::Running)
        );

        // The delay after the point at 50 is lengthened
        for _ in 0..40 {
            k.increment_counter(f.counter).unwrap();
        }
        assert_eq!(k.get_alarm(alarm), Ok(53));
        assert_eq!(
            k.get_schedule_table_status(f.table),
            Ok(ScheduleTableStatus::RunningAndSynchronous)
        );

        // At position 50 while the global time says 54: behind by 4
        for _ in 0..3 {
            k.increment_counter(f.counter).unwrap();
        }
        k.sync_schedule_table(f.table, 54).unwrap();
        assert_eq!(
            k.get_schedule_table_status(f.table),
            Ok(ScheduleTableStatus::Running)
        );
        for _ in 0..50 {
            k.increment_counter(f.counter).unwrap();
        }
        // The delay after the point at 0 is shortened
        assert_eq!(k.get_task_id(), Some(f.task));
        assert_eq!(k.get_alarm(alarm), Ok(46));
        assert_eq!(
            k.get_schedule_table_status(f.table),
            Ok(ScheduleTableStatus::RunningAndSynchronous)
        );

        k.set_schedule_table_async(f.table).unwrap();
        assert_eq!(
            k.get_schedule_table_status(f.table),
            Ok(ScheduleTableStatus::Running)
        );
    }

    #[test]
    fn sync_errors() {
        let mut b = CfgBuilder::new(1);
        let f = repeating_table(&mut b);
        let (mut k, _hooks) = boot(b);
        k.start_schedule_table_rel(f.table, 1).unwrap();
        assert_eq!(
            k.sync_schedule_table(f.table, 0),
            Err(SyncScheduleTableError::BadId)
        );
        assert_eq!(
            k.set_schedule_table_async(f.table),
            Err(SetScheduleTableAsyncError::BadId)
        );
        assert_eq!(
            k.get_schedule_table_status(ScheduleTableId::new(5)),
            Err(GetScheduleTableStatusError::BadId)
        );
    }

    #[test]
    fn sync_after_missed_final_expiry() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut b = CfgBuilder::new(1);
        let t = TaskDescriptor::build().priority(1).finish(&mut b);
        let timer = HwTimerId::new(0);
        let counter = CounterDescriptor::build()
            .max_allowed_value(0xff)
            .hardware(timer)
            .finish(&mut b);
        let table = ScheduleTableDescriptor::build()
            .counter(counter)
            .duration(10)
            .explicit_sync(1)
            .point(ExpiryPoint::at(5).activate_task(t))
            .finish(&mut b);
        let (mut k, _hooks) = boot_with_timers(b, 1);

        k.start_schedule_table_rel(table, 1).unwrap();
        assert!(k.port().timers[0].armed.is_some());

        // The timer passed the end of the round, but its interrupt hasn't
        // been handled yet
        k.port_mut().timers[0].value = 0x20;
        assert_eq!(
            k.sync_schedule_table(table, 3),
            Err(SyncScheduleTableError::State)
        );
        assert!(!k.is_shut_down());
        assert_eq!(
            k.get_schedule_table_status(table),
            Ok(ScheduleTableStatus::Stopped)
        );
        assert_eq!(k.get_task_id(), Some(t));
        assert_eq!(k.port().timers[0].armed, None);
    }

}
