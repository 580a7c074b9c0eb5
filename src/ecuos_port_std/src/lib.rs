//! Simulation environment for running the ecuos kernel on a hosted
//! environment.
//!
//! Every core of the configured system is represented by a thread that owns
//! the core's [`Kernel`]. Cores communicate only through the shared
//! [`Interconnect`]; a core waiting for something parks its thread, and
//! [`Port::notify_core`] unparks it.
//!
//! # Tasks as step functions
//!
//! The kernel doesn't switch stacks, and neither does this port. A task body
//! is expressed as a *step function*, [`Application::task`], which the core
//! thread calls repeatedly while the task is the running task. Each call
//! should run up to the next kernel service that may dispatch another task
//! (e.g., `activate_task`, `wait_event`, `terminate_task`) and return.
//!
//!  - [`Step::Yield`] means the body hasn't finished. The step function is
//!    called again the next time the task is the running task.
//!  - [`Step::Return`] means the body returned. If the task is still running
//!    (it didn't call `terminate_task` or `chain_task`), the kernel is told
//!    so, which reports `MissingEnd` and terminates it.
//!
//! The application keeps whatever per-task state it needs between steps.
//!
//! # Interrupts
//!
//! [`SystemHandle::pend_isr`] requests the execution of a category 2 ISR,
//! which runs on its core between two task steps. Simulated hardware timers
//! ([`TimerConfig`]) drive hardware counters.
//!
//! # Logging
//!
//! The port and the kernel log through the [`log`] crate. [`System::new`]
//! installs [`env_logger`] if no logger is installed yet, so `RUST_LOG=trace`
//! reveals every dispatch.
use ecuos_core::kernel::{
    cfg::Config, AppMode, CoreId, Hooks, HwTimerId, IsrId, StartOsError, TaskId,
};
use ecuos_kernel::{Interconnect, Port};
use spin::Mutex as SpinMutex;
use std::{
    collections::VecDeque,
    sync::{Arc, OnceLock},
    thread::{self, Thread},
    time::{Duration, Instant},
};

mod timer;

pub use self::timer::{StdTimer, TimerConfig};

/// Used by applications to name the kernel type
pub type Kernel = ecuos_kernel::Kernel<StdPort>;

/// The longest time an idle core sleeps before checking for work.
const IDLE_TIMEOUT: Duration = Duration::from_millis(1);

/// The result of one step of a task body. See [the crate documentation](crate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Yield,
    Return,
}

/// The code of an application.
pub trait Application: Send + Sync + 'static {
    /// Run one step of the body of `task`, which is the running task of the
    /// core owning `k`.
    fn task(&self, k: &mut Kernel, task: TaskId) -> Step;

    /// Run the body of `isr`.
    fn isr(&self, _k: &mut Kernel, _isr: IsrId) {}
}

/// The state shared by the core threads and [`SystemHandle`]s.
#[derive(Debug)]
struct Shared {
    threads: Vec<OnceLock<Thread>>,
    pending_isrs: Vec<SpinMutex<VecDeque<IsrId>>>,
    origin: Instant,
}

impl Shared {
    fn wake(&self, core: CoreId) {
        if let Some(thread) = self.threads.get(core.index()).and_then(OnceLock::get) {
            thread.unpark();
        }
    }
}

/// The [`Port`](ecuos_kernel::Port) implementation of a core thread.
#[derive(Debug)]
pub struct StdPort {
    shared: Arc<Shared>,
    /// Indexed by `HwTimerId`. `None` for the timers of other cores.
    timers: Vec<Option<StdTimer>>,
    /// Incremented by every dispatch.
    num_dispatches: u64,
}

impl StdPort {
    fn time_to_next_timer(&self) -> Option<Duration> {
        self.timers
            .iter()
            .flatten()
            .filter_map(StdTimer::time_to_deadline)
            .min()
    }
}

impl Port for StdPort {
    type Timer = StdTimer;

    fn dispatch(&mut self, from: Option<TaskId>, to: Option<TaskId>) {
        log::trace!("dispatch {from:?} -> {to:?}");
        self.num_dispatches += 1;
    }

    fn notify_core(&self, core: CoreId) {
        self.shared.wake(core);
    }

    fn idle_wait(&mut self) {
        let timeout = self
            .time_to_next_timer()
            .map_or(IDLE_TIMEOUT, |d| d.min(IDLE_TIMEOUT));
        thread::park_timeout(timeout);
    }

    fn timestamp(&self) -> u64 {
        u64::try_from(self.shared.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn timer(&mut self, id: HwTimerId) -> Option<&mut StdTimer> {
        self.timers.get_mut(id.index()).and_then(Option::as_mut)
    }
}

/// A system ready to be started by [`System::run`].
pub struct System {
    cfg: Arc<Config>,
    xc: Arc<Interconnect>,
    shared: Arc<Shared>,
    timers: Vec<TimerConfig>,
}

impl System {
    /// Prepare a system described by `cfg`. All of its cores take part in the
    /// startup.
    pub fn new(cfg: Config) -> Self {
        let _ = env_logger::try_init();

        let cfg = Arc::new(cfg);
        let xc = Arc::new(Interconnect::new(&cfg));
        for i in 0..cfg.num_cores {
            xc.activate_core(CoreId::from_index(i));
        }
        let shared = Arc::new(Shared {
            threads: (0..cfg.num_cores).map(|_| OnceLock::new()).collect(),
            pending_isrs: (0..cfg.num_cores)
                .map(|_| SpinMutex::new(VecDeque::new()))
                .collect(),
            origin: Instant::now(),
        });
        Self {
            cfg,
            xc,
            shared,
            timers: Vec::new(),
        }
    }

    /// Specify the simulated hardware timers.
    pub fn with_timers(mut self, timers: Vec<TimerConfig>) -> Self {
        self.timers = timers;
        self
    }

    /// Get a handle for interacting with the system from other threads.
    pub fn handle(&self) -> SystemHandle {
        SystemHandle {
            cfg: self.cfg.clone(),
            xc: self.xc.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Start every core in application mode `mode` and run them until all of
    /// them shut down.
    ///
    /// Returns the first error returned by a core's `start_os`. A panic in a
    /// core thread is propagated once all the other threads have exited.
    pub fn run(
        self,
        app: Arc<dyn Application>,
        hooks: Arc<dyn Hooks>,
        mode: AppMode,
    ) -> Result<(), StartOsError> {
        let join_handles: Vec<_> = (0..self.cfg.num_cores)
            .map(|i| {
                let core = CoreId::from_index(i);
                let (cfg, xc, shared) = (self.cfg.clone(), self.xc.clone(), self.shared.clone());
                let (app, hooks) = (app.clone(), hooks.clone());
                let timers: Vec<_> = self
                    .timers
                    .iter()
                    .map(|t| (t.core == core).then(|| StdTimer::new(t, shared.origin)))
                    .collect();

                thread::Builder::new()
                    .name(format!("core{i}"))
                    .spawn(move || {
                        let _ = shared.threads[i].set(thread::current());
                        let port = StdPort {
                            shared,
                            timers,
                            num_dispatches: 0,
                        };
                        let mut k = Kernel::new(cfg, xc.clone(), hooks, port, core);
                        let result = run_core(&mut k, &*app, mode);
                        if result.is_err() {
                            // Don't let the other cores wait for this one
                            k.shutdown_os(ecuos_core::kernel::ResultCode::State);
                        }
                        result
                    })
                    .expect("failed to spawn a core thread")
            })
            .collect();

        let mut result = Ok(());
        let mut panic = None;
        for jh in join_handles {
            match jh.join() {
                Ok(Err(e)) if result.is_ok() => result = Err(e),
                Ok(_) => {}
                Err(e) => {
                    // Wake up cores waiting for the one that panicked
                    for i in 0..self.cfg.num_cores {
                        self.shared.wake(CoreId::from_index(i));
                    }
                    panic.get_or_insert(e);
                }
            }
        }
        if let Some(e) = panic {
            std::panic::resume_unwind(e);
        }
        result
    }
}

fn run_core(k: &mut Kernel, app: &dyn Application, mode: AppMode) -> Result<(), StartOsError> {
    let core = k.get_core_id();
    log::debug!("core {} thread started", core.index());
    k.start_os(mode)?;

    while !k.is_shut_down() {
        k.pump_messages();

        for i in 0..k.port().timers.len() {
            let expired = k.port_mut().timers[i]
                .as_mut()
                .is_some_and(StdTimer::take_expired);
            if expired {
                k.timer_interrupt(HwTimerId::from_index(i));
            }
        }

        loop {
            let next = k.port().shared.pending_isrs[core.index()].lock().pop_front();
            let Some(isr) = next else { break };
            k.enter_isr(isr);
            app.isr(k, isr);
            k.leave_isr();
        }

        k.check_timing();
        if k.is_shut_down() {
            break;
        }

        match k.get_task_id() {
            Some(task) => {
                let num_dispatches = k.port().num_dispatches;
                if app.task(k, task) == Step::Return
                    && k.port().num_dispatches == num_dispatches
                    && k.get_task_id() == Some(task)
                {
                    k.task_return();
                }
            }
            None => k.port_mut().idle_wait(),
        }
    }

    log::debug!("core {} thread exiting", core.index());
    Ok(())
}

/// A handle for interacting with a running [`System`] from any thread.
#[derive(Clone)]
pub struct SystemHandle {
    cfg: Arc<Config>,
    xc: Arc<Interconnect>,
    shared: Arc<Shared>,
}

impl SystemHandle {
    /// Request the execution of `isr` on its core.
    ///
    /// # Panics
    ///
    /// Panics if `isr` doesn't exist.
    pub fn pend_isr(&self, isr: IsrId) {
        let core = self
            .cfg
            .isr(isr)
            .unwrap_or_else(|| panic!("{isr:?} doesn't exist"))
            .core;
        self.shared.pending_isrs[core.index()].lock().push_back(isr);
        self.shared.wake(core);
    }

    /// Get a flag indicating whether every core that started has shut down.
    pub fn is_shut_down(&self) -> bool {
        (0..self.cfg.num_cores)
            .map(CoreId::from_index)
            .filter(|&c| self.xc.is_running(c) || self.xc.is_shut_down(c))
            .all(|c| self.xc.is_shut_down(c))
    }
}
