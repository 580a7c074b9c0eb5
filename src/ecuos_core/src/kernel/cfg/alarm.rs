use super::{AccessSet, AppModeSet, CfgBuilder};
use crate::kernel::{
    AlarmId, ApplicationId, CoreId, CounterId, EventMask, ScheduleTableId, TaskId, Tick,
};

/// The action taken when an alarm expires.
#[derive(Debug, Clone, Copy)]
pub enum AlarmAction {
    ActivateTask(TaskId),
    SetEvent(TaskId, EventMask),
    /// Call a function in the kernel context (`ALARMCALLBACK`).
    Callback(fn(AlarmId)),
    IncrementCounter(CounterId),
    /// Process the next expiry point of a schedule table. Only used by the
    /// internal alarms [`ScheduleTableBuilder`](super::ScheduleTableBuilder)
    /// creates.
    RunSchedule(ScheduleTableId),
}

/// How an autostart alarm's first expiry is specified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmStart {
    /// `SetAbsAlarm(value, cycle)`
    Absolute,
    /// `SetRelAlarm(value, cycle)`
    Relative,
}

/// Autostart parameters of an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmAutostart {
    pub modes: AppModeSet,
    pub start: AlarmStart,
    pub value: Tick,
    pub cycle: Tick,
}

/// An alarm descriptor.
#[derive(Debug, Clone, Copy)]
pub struct AlarmDescriptor {
    pub counter: CounterId,
    pub app: Option<ApplicationId>,
    pub action: AlarmAction,
    pub autostart: Option<AlarmAutostart>,
    pub access: AccessSet,
    /// The owning core, which is the counter's. Computed by
    /// [`CfgBuilder::finalize`].
    pub core: CoreId,
}

impl AlarmDescriptor {
    /// Construct an `AlarmBuilder` to define an alarm.
    pub fn build() -> AlarmBuilder {
        AlarmBuilder {
            counter: None,
            action: None,
            app: None,
            autostart: None,
            access: AccessSet::empty(),
        }
    }
}

/// The builder type for alarms. Created by [`AlarmDescriptor::build`].
#[must_use = "must call `finish()` to complete registration"]
pub struct AlarmBuilder {
    counter: Option<CounterId>,
    action: Option<AlarmAction>,
    app: Option<ApplicationId>,
    autostart: Option<AlarmAutostart>,
    access: AccessSet,
}

impl AlarmBuilder {
    /// \[**Required**\] Specify the counter driving the alarm.
    pub fn counter(mut self, counter: CounterId) -> Self {
        self.counter = Some(counter);
        self
    }

    /// \[**Required**\] Specify the action. See also the shorthands below.
    pub fn action(mut self, action: AlarmAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn activate_task(self, task: TaskId) -> Self {
        self.action(AlarmAction::ActivateTask(task))
    }

    pub fn set_event(self, task: TaskId, mask: EventMask) -> Self {
        self.action(AlarmAction::SetEvent(task, mask))
    }

    pub fn callback(self, f: fn(AlarmId)) -> Self {
        self.action(AlarmAction::Callback(f))
    }

    pub fn increment_counter(self, counter: CounterId) -> Self {
        self.action(AlarmAction::IncrementCounter(counter))
    }

    pub fn application(mut self, app: ApplicationId) -> Self {
        self.app = Some(app);
        self
    }

    /// Arm the alarm at startup in the specified application modes.
    pub fn autostart(mut self, modes: AppModeSet, start: AlarmStart, value: Tick, cycle: Tick) -> Self {
        self.autostart = Some(AlarmAutostart {
            modes,
            start,
            value,
            cycle,
        });
        self
    }

    pub fn access(mut self, access: AccessSet) -> Self {
        self.access = access;
        self
    }

    /// Complete the definition of an alarm, returning its identifier.
    ///
    /// # Panics
    ///
    /// Panics if the counter or the action is not specified.
    pub fn finish(self, cfg: &mut CfgBuilder) -> AlarmId {
        cfg.inner.alarms.push(AlarmDescriptor {
            counter: self.counter.expect("`counter` must be specified"),
            app: self.app,
            action: self.action.expect("an action must be specified"),
            autostart: self.autostart,
            access: self.access,
            core: CoreId::new(0),
        });
        AlarmId::from_index(cfg.inner.alarms.len() - 1)
    }
}
