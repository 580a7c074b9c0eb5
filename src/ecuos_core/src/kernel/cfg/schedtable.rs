use alloc::vec::Vec;

use super::{AccessSet, AlarmAction, AlarmDescriptor, AppModeSet, CfgBuilder};
use crate::kernel::{
    AlarmId, ApplicationId, CoreId, CounterId, EventMask, ScheduleTableId, TaskId, Tick,
};

bitflags::bitflags! {
    /// Schedule table properties.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ScheduleTableFlags: u8 {
        /// Start a new round after the final expiry.
        const REPEATING = 0x01;
        /// Accept `SyncScheduleTable` (explicit synchronization).
        const SYNCABLE = 0x02;
        /// The table's position is the counter's value (implicit
        /// synchronization).
        const IMPLICIT = 0x04;
    }
}

/// An action of an expiry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryAction {
    ActivateTask(TaskId),
    SetEvent(TaskId, EventMask),
}

/// An expiry point: actions taken `offset` ticks after the start of a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryPoint {
    pub offset: Tick,
    /// The largest amount explicit synchronization may subtract from the
    /// delay leading to the next point.
    pub max_shorten: Tick,
    /// The largest amount explicit synchronization may add to the delay
    /// leading to the next point.
    pub max_lengthen: Tick,
    pub actions: Vec<ExpiryAction>,
}

impl ExpiryPoint {
    /// Construct an expiry point at `offset` without actions.
    pub fn at(offset: Tick) -> Self {
        Self {
            offset,
            max_shorten: 0,
            max_lengthen: 0,
            actions: Vec::new(),
        }
    }

    pub fn activate_task(mut self, task: TaskId) -> Self {
        self.actions.push(ExpiryAction::ActivateTask(task));
        self
    }

    pub fn set_event(mut self, task: TaskId, mask: EventMask) -> Self {
        self.actions.push(ExpiryAction::SetEvent(task, mask));
        self
    }

    /// Specify the synchronization adjustment bounds.
    pub fn adjustment(mut self, max_shorten: Tick, max_lengthen: Tick) -> Self {
        self.max_shorten = max_shorten;
        self.max_lengthen = max_lengthen;
        self
    }
}

/// How an autostart schedule table is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableStart {
    /// `StartScheduleTableAbs(value)`
    Absolute(Tick),
    /// `StartScheduleTableRel(offset)`
    Relative(Tick),
    /// `StartScheduleTableSynchron()`
    Synchron,
}

/// Autostart parameters of a schedule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleTableAutostart {
    pub modes: AppModeSet,
    pub start: TableStart,
}

/// A schedule table descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleTableDescriptor {
    pub counter: CounterId,
    pub app: Option<ApplicationId>,
    /// The length of a round.
    pub duration: Tick,
    pub flags: ScheduleTableFlags,
    /// The largest deviation considered synchronous.
    pub precision: Tick,
    pub points: Vec<ExpiryPoint>,
    pub autostart: Option<ScheduleTableAutostart>,
    pub access: AccessSet,
    /// The internal alarm driving the table.
    pub alarm: AlarmId,
    /// The owning core, which is the counter's. Computed by
    /// [`CfgBuilder::finalize`].
    pub core: CoreId,
}

impl ScheduleTableDescriptor {
    /// Construct a `ScheduleTableBuilder` to define a schedule table.
    pub fn build() -> ScheduleTableBuilder {
        ScheduleTableBuilder {
            counter: None,
            duration: None,
            app: None,
            flags: ScheduleTableFlags::empty(),
            precision: 0,
            points: Vec::new(),
            autostart: None,
            access: AccessSet::empty(),
        }
    }

    /// The offset of the first expiry point.
    #[inline]
    pub fn initial_offset(&self) -> Tick {
        self.points.first().map_or(0, |p| p.offset)
    }

    /// The nominal delay between the expiry point `i` and the next expiry
    /// point, or the end of the round if `i` is the last one.
    #[inline]
    pub fn delay_after(&self, i: usize) -> Tick {
        match self.points.get(i + 1) {
            Some(next) => next.offset - self.points[i].offset,
            None => self.duration - self.points[i].offset,
        }
    }

    pub fn is_repeating(&self) -> bool {
        self.flags.contains(ScheduleTableFlags::REPEATING)
    }

    pub fn is_syncable(&self) -> bool {
        self.flags.contains(ScheduleTableFlags::SYNCABLE)
    }

    pub fn is_implicit(&self) -> bool {
        self.flags.contains(ScheduleTableFlags::IMPLICIT)
    }
}

/// The builder type for schedule tables. Created by
/// [`ScheduleTableDescriptor::build`].
#[must_use = "must call `finish()` to complete registration"]
pub struct ScheduleTableBuilder {
    counter: Option<CounterId>,
    duration: Option<Tick>,
    app: Option<ApplicationId>,
    flags: ScheduleTableFlags,
    precision: Tick,
    points: Vec<ExpiryPoint>,
    autostart: Option<ScheduleTableAutostart>,
    access: AccessSet,
}

impl ScheduleTableBuilder {
    /// \[**Required**\] Specify the counter driving the table.
    pub fn counter(mut self, counter: CounterId) -> Self {
        self.counter = Some(counter);
        self
    }

    /// \[**Required**\] Specify the length of a round.
    pub fn duration(mut self, duration: Tick) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn application(mut self, app: ApplicationId) -> Self {
        self.app = Some(app);
        self
    }

    pub fn repeating(mut self) -> Self {
        self.flags |= ScheduleTableFlags::REPEATING;
        self
    }

    /// Enable explicit synchronization. Deviations up to `precision` are
    /// considered synchronous.
    pub fn explicit_sync(mut self, precision: Tick) -> Self {
        self.flags |= ScheduleTableFlags::SYNCABLE;
        self.precision = precision;
        self
    }

    /// Enable implicit synchronization. The duration must equal the
    /// counter's modulus.
    pub fn implicit_sync(mut self) -> Self {
        self.flags |= ScheduleTableFlags::IMPLICIT;
        self
    }

    /// Add an expiry point. Points must be added in the ascending order of
    /// their offsets.
    pub fn point(mut self, point: ExpiryPoint) -> Self {
        self.points.push(point);
        self
    }

    /// Start the table at startup in the specified application modes.
    pub fn autostart(mut self, modes: AppModeSet, start: TableStart) -> Self {
        self.autostart = Some(ScheduleTableAutostart { modes, start });
        self
    }

    pub fn access(mut self, access: AccessSet) -> Self {
        self.access = access;
        self
    }

    /// Complete the definition of a schedule table, returning its
    /// identifier. This also defines the table's internal alarm.
    ///
    /// # Panics
    ///
    /// Panics if the counter or the duration is not specified.
    pub fn finish(self, cfg: &mut CfgBuilder) -> ScheduleTableId {
        let counter = self.counter.expect("`counter` must be specified");
        let id = ScheduleTableId::from_index(cfg.inner.schedule_tables.len());

        cfg.inner.alarms.push(AlarmDescriptor {
            counter,
            app: self.app,
            action: AlarmAction::RunSchedule(id),
            autostart: None,
            access: AccessSet::empty(),
            core: CoreId::new(0),
        });
        let alarm = AlarmId::from_index(cfg.inner.alarms.len() - 1);

        cfg.inner.schedule_tables.push(ScheduleTableDescriptor {
            counter,
            app: self.app,
            duration: self.duration.expect("`duration` must be specified"),
            flags: self.flags,
            precision: self.precision,
            points: self.points,
            autostart: self.autostart,
            access: self.access,
            alarm,
            core: CoreId::new(0),
        });
        id
    }
}
