//! The ecuos kernel: a fixed-priority, multi-core-aware scheduling core in
//! the style of OSEK/VDX and AUTOSAR OS.
//!
//! Every processor core runs its own [`Kernel`]. A `Kernel` owns the state of
//! the objects configured on its core (tasks, ISRs, resources, counters,
//! alarms, schedule tables, applications) and is only ever mutated through
//! `&mut self` by the thread that represents the core. Cores share nothing
//! but an [`Interconnect`], which carries cross-core requests and the
//! spinlock owner words.
//!
//! A service addressing an object of another core is transparently forwarded
//! to that core as a typed request (see [`xcore`]). The calling core waits for
//! the reply while serving the requests sent to itself, so two cores calling
//! each other never deadlock.
//!
//! The kernel never switches stacks. It decides which task runs and informs
//! the [`Port`] through [`Port::dispatch`]; how the port gives control to
//! that task is its own business. `ecuos_port_std` runs each task as a step
//! function on a thread per core.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use ecuos_core::kernel::{cfg::*, AppMode, CoreId, NoHooks, TaskId};
//! use ecuos_kernel::{Interconnect, Kernel, NullTimer, Port};
//!
//! struct MyPort;
//!
//! impl Port for MyPort {
//!     type Timer = NullTimer;
//!     fn dispatch(&mut self, _from: Option<TaskId>, to: Option<TaskId>) {
//!         println!("now running: {to:?}");
//!     }
//!     fn notify_core(&self, _core: CoreId) {}
//!     fn idle_wait(&mut self) {}
//!     fn timestamp(&self) -> u64 { 0 }
//! }
//!
//! let mut b = CfgBuilder::new(1);
//! let task = TaskDescriptor::build()
//!     .priority(1)
//!     .autostart(AppModeSet::DEFAULT)
//!     .finish(&mut b);
//! let cfg = Arc::new(b.finalize().unwrap());
//! let xc = Arc::new(Interconnect::new(&cfg));
//!
//! let mut kernel: Kernel<MyPort> =
//!     Kernel::new(cfg, xc, Arc::new(NoHooks), MyPort, CoreId::new(0));
//! kernel.start_os(AppMode::new(0)).unwrap();
//! assert_eq!(kernel.get_task_id(), Some(task));
//! ```
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};
use ecuos_core::kernel::{
    cfg::Config, AppMode, CoreId, Hooks, HwTimerId, IsrId, LockRef, TaskId,
};

#[cfg(test)]
mod test_utils;

mod alarm;
mod application;
mod cpuload;
mod error;
mod event;
mod isr;
mod resource;
mod schedtable;
mod spinlock;
mod startup;
mod task;
mod timing;
pub mod utils;
pub mod xcore;

pub use self::{
    alarm::AlarmBase,
    application::RestartOption,
    cpuload::CpuLoadKind,
    task::readyqueue::{BitmapQueue, ListQueue, Queue},
    xcore::Interconnect,
};

/// The interface a port provides to the kernel of one core.
///
/// The kernel calls these methods from the thread that owns the [`Kernel`].
pub trait Port {
    /// The hardware timer type driving hardware counters.
    type Timer: ecuos_core::kernel::HardwareTimer;

    /// Called when the task that should be running on this core changes.
    ///
    /// `from` is the task that was running before (it may have been
    /// preempted, started waiting, or terminated) and `to` is the task that
    /// should run from now on. `None` means the core is idle.
    fn dispatch(&mut self, from: Option<TaskId>, to: Option<TaskId>);

    /// Wake up `core`, which might be blocked in [`Self::idle_wait`], because
    /// a cross-core message was sent to it.
    fn notify_core(&self, core: CoreId);

    /// Block until [`Self::notify_core`] is called for this core or a short
    /// period of time passes. Spurious wakeups are allowed.
    fn idle_wait(&mut self);

    /// Get a monotonic timestamp. Execution budgets and CPU load intervals are
    /// measured in its units.
    fn timestamp(&self) -> u64;

    /// Get the hardware timer `id`. Only called for the timers driving the
    /// hardware counters of this core.
    fn timer(&mut self, _id: HwTimerId) -> Option<&mut Self::Timer> {
        None
    }
}

/// A [`HardwareTimer`](ecuos_core::kernel::HardwareTimer) for ports that
/// have none.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTimer;

impl ecuos_core::kernel::HardwareTimer for NullTimer {
    fn max_value(&self) -> u32 {
        0
    }
    fn init(&mut self) {}
    fn start(&mut self, _old: u32, _delta: u32) {}
    fn stop(&mut self) {}
    fn read(&self) -> u32 {
        0
    }
}

/// The lifecycle phase of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// `start_os` hasn't been called yet.
    Init,
    /// `start_os` is setting up autostart objects. Dispatching is disabled.
    Starting,
    Running,
    ShutDown,
}

/// The kernel state of one processor core.
///
/// `Q` selects the ready queue strategy.
pub struct Kernel<P: Port, Q: Queue = BitmapQueue> {
    cfg: Arc<Config>,
    xc: Arc<Interconnect>,
    hooks: Arc<dyn Hooks>,
    port: P,
    core: CoreId,
    phase: Phase,
    app_mode: Option<AppMode>,

    tasks: Vec<task::TaskCb>,
    /// Maps an activation record to the task owning it.
    record_owner: Vec<TaskId>,
    ready: Q,
    /// The task that was dispatched most recently. It's not necessarily in
    /// the Running state; it may have terminated or started waiting since.
    running: Option<TaskId>,

    isrs: Vec<isr::IsrCb>,
    /// The category 2 ISRs being executed, the innermost last.
    isr_stack: Vec<IsrId>,

    resources: Vec<resource::ResourceCb>,
    /// The lock chain links of spinlocks held by a task or ISR of this core.
    spinlock_next: Vec<Option<LockRef>>,

    counters: Vec<alarm::CounterCb>,
    alarms: Vec<alarm::AlarmCb>,
    alarm_lists: alarm::AlarmLists,
    tables: Vec<schedtable::ScheduleTableCb>,
    apps: Vec<application::ApplicationCb>,

    errors: error::ErrorState,
    timing: timing::TimingState,
    cpu_load: cpuload::CpuLoad,

    /// Non-zero while dispatching must be deferred: a cross-core request is
    /// being served or awaited.
    dispatch_lock: usize,
    /// Non-zero while a cross-core request is being served.
    serving: usize,
}

impl<P: Port, Q: Queue> Kernel<P, Q> {
    /// Construct the kernel of `core`. Nothing runs until
    /// [`start_os`](Self::start_os) is called.
    pub fn new(
        cfg: Arc<Config>,
        xc: Arc<Interconnect>,
        hooks: Arc<dyn Hooks>,
        port: P,
        core: CoreId,
    ) -> Self {
        let record_owner = cfg
            .tasks
            .iter()
            .enumerate()
            .flat_map(|(i, t)| {
                core::iter::repeat(TaskId::from_index(i)).take(t.max_activations as usize)
            })
            .collect();

        Self {
            tasks: cfg.tasks.iter().map(task::TaskCb::new).collect(),
            record_owner,
            ready: Q::new(cfg.num_activation_records, cfg.num_priority_levels),
            running: None,
            isrs: cfg.isrs.iter().map(|_| isr::IsrCb::default()).collect(),
            isr_stack: Vec::new(),
            resources: cfg.resources.iter().map(|_| resource::ResourceCb::default()).collect(),
            spinlock_next: alloc::vec![None; cfg.spinlocks.len()],
            counters: cfg.counters.iter().map(|_| alarm::CounterCb::default()).collect(),
            alarms: cfg.alarms.iter().map(|_| alarm::AlarmCb::default()).collect(),
            alarm_lists: alarm::AlarmLists::new(cfg.alarms.len()),
            tables: cfg
                .schedule_tables
                .iter()
                .map(|_| schedtable::ScheduleTableCb::default())
                .collect(),
            apps: cfg
                .applications
                .iter()
                .map(|_| application::ApplicationCb::default())
                .collect(),
            errors: error::ErrorState::default(),
            timing: timing::TimingState::default(),
            cpu_load: cpuload::CpuLoad::new(&cfg.cpu_load),
            dispatch_lock: 0,
            serving: 0,
            phase: Phase::Init,
            app_mode: None,
            cfg,
            xc,
            hooks,
            port,
            core,
        }
    }

    /// Get the static configuration.
    #[inline]
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    #[inline]
    pub fn port(&self) -> &P {
        &self.port
    }

    #[inline]
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Get the identifier of the core this kernel runs on (`GetCoreID`).
    #[inline]
    pub fn get_core_id(&self) -> CoreId {
        self.core
    }

    /// Get a flag indicating whether this core has shut down.
    #[inline]
    pub fn is_shut_down(&self) -> bool {
        self.phase == Phase::ShutDown
    }
}
