//! Static configuration
//!
//! A system is described by an immutable [`Config`]. It's assembled by
//! registering objects on a [`CfgBuilder`], one builder per object kind:
//!
//! ```
//! use ecuos_core::kernel::{cfg::*, CoreId};
//!
//! let mut b = CfgBuilder::new(1);
//! b.num_priority_levels(16);
//! let task = TaskDescriptor::build().priority(3).finish(&mut b);
//! let counter = CounterDescriptor::build().max_allowed_value(99).finish(&mut b);
//! let alarm = AlarmDescriptor::build()
//!     .counter(counter)
//!     .activate_task(task)
//!     .finish(&mut b);
//!
//! let cfg = b.finalize().unwrap();
//! assert_eq!(cfg.alarm(alarm).unwrap().core, CoreId::new(0));
//! ```
//!
//! [`CfgBuilder::finalize`] performs the startup checks and derives the
//! values the kernel needs (e.g., the core of each alarm and the activation
//! record layout). The kernel treats a finalized `Config` as trusted input.
use alloc::vec::Vec;
use core::fmt;

use super::{
    AlarmId, ApplicationId, CounterId, IsrId, Priority, ResourceId, ScheduleTableId, SpinlockId,
    TaskId,
};

mod alarm;
mod application;
mod check;
mod counter;
mod resource;
mod schedtable;
mod task;
pub use self::{
    alarm::*, application::*, counter::*, resource::*, schedtable::*, task::*,
};

bitflags::bitflags! {
    /// A set of application modes, used to select autostart objects.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AppModeSet: u32 {
        /// The default application mode (`OSDEFAULTAPPMODE`).
        const DEFAULT = 1;
        const ALL = !0;
    }
}

impl AppModeSet {
    /// Construct a set containing a single mode.
    pub fn single(mode: super::AppMode) -> Self {
        Self::from_bits_retain(1u32.checked_shl(mode.index() as u32).unwrap_or(0))
    }

    /// Get a flag indicating whether `mode` is a member.
    pub fn contains_mode(self, mode: super::AppMode) -> bool {
        !Self::single(mode).is_empty() && self.contains(Self::single(mode))
    }
}

bitflags::bitflags! {
    /// A set of OS-applications granted access to an object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessSet: u32 {
        const ALL = !0;
    }
}

impl AccessSet {
    /// Construct a set containing the specified applications.
    pub fn of(apps: &[ApplicationId]) -> Self {
        apps.iter()
            .fold(Self::empty(), |set, app| set | Self::single(*app))
    }

    fn single(app: ApplicationId) -> Self {
        Self::from_bits_retain(1u32.checked_shl(app.index() as u32).unwrap_or(0))
    }

    /// Get a flag indicating whether `app` is a member.
    pub fn permits(self, app: ApplicationId) -> bool {
        !Self::single(app).is_empty() && self.contains(Self::single(app))
    }
}

/// The maximum number of OS-applications. Limited by the width of
/// [`AccessSet`].
pub const MAX_APPLICATIONS: usize = 32;

/// Parameters of CPU load measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuLoadConfig {
    /// The length of a measurement interval, in port timestamp units.
    pub interval: u64,
    /// The number of intervals averaged by `GetCpuLoad`.
    pub num_intervals: usize,
}

impl Default for CpuLoadConfig {
    fn default() -> Self {
        Self {
            interval: 10_000,
            num_intervals: 8,
        }
    }
}

/// The finalized static configuration of a system.
#[derive(Debug, Clone)]
pub struct Config {
    pub num_cores: usize,
    pub num_priority_levels: usize,
    pub num_app_modes: usize,
    pub tasks: Vec<TaskDescriptor>,
    pub isrs: Vec<IsrDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
    pub counters: Vec<CounterDescriptor>,
    pub alarms: Vec<AlarmDescriptor>,
    pub schedule_tables: Vec<ScheduleTableDescriptor>,
    pub applications: Vec<ApplicationDescriptor>,
    pub spinlocks: Vec<SpinlockDescriptor>,
    pub cpu_load: CpuLoadConfig,
    /// The total number of task activation records.
    pub num_activation_records: usize,
}

macro_rules! config_getters {
    ($( $(#[$meta:meta])* fn $name:ident($id:ty) -> $field:ident: $desc:ty; )*) => {
        impl Config {$(
            $(#[$meta])*
            #[inline]
            pub fn $name(&self, id: $id) -> Option<&$desc> {
                self.$field.get(id.index())
            }
        )*}
    };
}

config_getters! {
    fn task(TaskId) -> tasks: TaskDescriptor;
    fn isr(IsrId) -> isrs: IsrDescriptor;
    fn resource(ResourceId) -> resources: ResourceDescriptor;
    fn counter(CounterId) -> counters: CounterDescriptor;
    fn alarm(AlarmId) -> alarms: AlarmDescriptor;
    fn schedule_table(ScheduleTableId) -> schedule_tables: ScheduleTableDescriptor;
    fn application(ApplicationId) -> applications: ApplicationDescriptor;
    fn spinlock(SpinlockId) -> spinlocks: SpinlockDescriptor;
}

impl Config {
    /// The highest task priority.
    pub fn highest_priority(&self) -> Priority {
        (self.num_priority_levels - 1) as Priority
    }
}

/// Accumulates object definitions. See [the module documentation](self).
#[derive(Debug, Clone)]
pub struct CfgBuilder {
    pub(super) inner: Config,
}

impl CfgBuilder {
    /// Construct a `CfgBuilder` for a system with `num_cores` cores.
    pub fn new(num_cores: usize) -> Self {
        Self {
            inner: Config {
                num_cores,
                num_priority_levels: 16,
                num_app_modes: 1,
                tasks: Vec::new(),
                isrs: Vec::new(),
                resources: Vec::new(),
                counters: Vec::new(),
                alarms: Vec::new(),
                schedule_tables: Vec::new(),
                applications: Vec::new(),
                spinlocks: Vec::new(),
                cpu_load: CpuLoadConfig::default(),
                num_activation_records: 0,
            },
        }
    }

    /// Specify the number of task priority levels. Defaults to `16`.
    pub fn num_priority_levels(&mut self, n: usize) -> &mut Self {
        self.inner.num_priority_levels = n;
        self
    }

    /// Specify the number of application modes. Defaults to `1`.
    pub fn num_app_modes(&mut self, n: usize) -> &mut Self {
        self.inner.num_app_modes = n;
        self
    }

    /// Specify the CPU load measurement parameters.
    pub fn cpu_load(&mut self, cpu_load: CpuLoadConfig) -> &mut Self {
        self.inner.cpu_load = cpu_load;
        self
    }

    /// Define a spinlock.
    pub fn spinlock(&mut self, access: AccessSet) -> SpinlockId {
        self.inner.spinlocks.push(SpinlockDescriptor { access });
        SpinlockId::from_index(self.inner.spinlocks.len() - 1)
    }

    /// Run the startup checks and produce the final configuration.
    pub fn finalize(self) -> Result<Config, ConfigError> {
        let mut cfg = self.inner;
        check::resolve(&mut cfg)?;
        check::check(&cfg)?;
        Ok(cfg)
    }
}

/// A spinlock descriptor. Spinlocks must be acquired in the ascending order
/// of their identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinlockDescriptor {
    pub access: AccessSet,
}

/// A startup check failure reported by [`CfgBuilder::finalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    NoCores,
    PriorityLevels,
    TooManyApplications,
    /// An object refers to a core that does not exist.
    BadCore { kind: ObjectKind, index: usize },
    /// An object refers to an application that does not exist or lives on
    /// another core.
    BadApplication { kind: ObjectKind, index: usize },
    TaskPriority(TaskId),
    TaskActivations(TaskId),
    ResourceCeiling(ResourceId),
    CounterLimits(CounterId),
    /// A hardware counter's range does not match its timer.
    HardwareCounter(CounterId),
    AlarmTarget(AlarmId),
    AlarmAutostart(AlarmId),
    /// Alarms incrementing counters form a cycle.
    CounterCycle(CounterId),
    ScheduleTablePoints(ScheduleTableId),
    ScheduleTableSync(ScheduleTableId),
    ScheduleTableTarget(ScheduleTableId),
    ScheduleTableAutostart(ScheduleTableId),
    RestartTask(ApplicationId),
}

/// An object kind, used in [`ConfigError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Task,
    Isr,
    Resource,
    Counter,
    Alarm,
    ScheduleTable,
    Application,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::NoCores => f.write_str("the system must have at least one core"),
            Self::PriorityLevels => {
                f.write_str("the number of priority levels must be in range `1..=65536`")
            }
            Self::TooManyApplications => write!(
                f,
                "the number of applications must not exceed {MAX_APPLICATIONS}"
            ),
            Self::BadCore { kind, index } => {
                write!(f, "{kind:?} #{index} refers to a nonexistent core")
            }
            Self::BadApplication { kind, index } => write!(
                f,
                "{kind:?} #{index} refers to a nonexistent application or to an \
                 application on another core"
            ),
            Self::TaskPriority(id) => write!(
                f,
                "{id:?}: priorities must be below the number of priority levels, \
                 and the run priority must not be lower than the priority"
            ),
            Self::TaskActivations(id) => write!(
                f,
                "{id:?}: the activation limit must be at least one, and exactly one \
                 for an extended task"
            ),
            Self::ResourceCeiling(id) => {
                write!(f, "{id:?}: the ceiling must be a valid priority")
            }
            Self::CounterLimits(id) => write!(
                f,
                "{id:?}: `ticksperbase` and `mincycle` must be nonzero, and `mincycle` \
                 must not exceed `maxallowedvalue`"
            ),
            Self::HardwareCounter(id) => write!(
                f,
                "{id:?}: a hardware counter's `maxallowedvalue` must be of the form \
                 `2^n - 1`"
            ),
            Self::AlarmTarget(id) => write!(f, "{id:?}: the alarm action's target is invalid"),
            Self::AlarmAutostart(id) => {
                write!(f, "{id:?}: the autostart offset or cycle is out of range")
            }
            Self::CounterCycle(id) => write!(
                f,
                "{id:?}: alarms incrementing counters form a cycle, or cross cores"
            ),
            Self::ScheduleTablePoints(id) => write!(
                f,
                "{id:?}: expiry points must be nonempty with strictly increasing offsets \
                 not exceeding the duration, and adjustments must fit in the delays"
            ),
            Self::ScheduleTableSync(id) => write!(
                f,
                "{id:?}: an implicitly synchronized table's duration must equal the \
                 counter's modulus"
            ),
            Self::ScheduleTableTarget(id) => {
                write!(f, "{id:?}: an expiry point action's target is invalid")
            }
            Self::ScheduleTableAutostart(id) => {
                write!(f, "{id:?}: the autostart method does not suit the table")
            }
            Self::RestartTask(id) => {
                write!(f, "{id:?}: the restart task must belong to the application")
            }
        }
    }
}
