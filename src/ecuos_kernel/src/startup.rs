//! System startup and shutdown
//!
//! `start_os` runs on every core in parallel. The cores meet twice at
//! barriers in the [`Interconnect`](crate::Interconnect):
//!
//!  1. after the core-local kernel state is initialized, so that no core
//!     sends a request to a core that can't serve it yet;
//!  2. after the autostart objects are set up and the startup hook has run,
//!     so that no task runs before every startup hook has returned.
//!
//! Cross-core requests are served while waiting at a barrier.
use ecuos_core::kernel::{
    cfg::CounterDriver, AlarmId, AppMode, Caller, ErrorInfo, HardwareTimer, IsrId, ResultCode,
    ScheduleTableId, ServiceId, StartOsError, TaskId,
};

use crate::{Kernel, Phase, Port, Queue};

impl<P: Port, Q: Queue> Kernel<P, Q> {
    /// Start the kernel on this core in application mode `mode` (`StartOS`).
    ///
    /// Blocks until every activated core has called `start_os`. On success,
    /// the highest-priority autostart task has been dispatched when this
    /// method returns.
    pub fn start_os(&mut self, mode: AppMode) -> Result<(), StartOsError> {
        let result = self.start_os_inner(mode);
        if let Err(e) = result {
            self.report_error(ErrorInfo::new(ServiceId::StartOs, e.into(), &[mode.to_raw()]));
        }
        result
    }

    fn start_os_inner(&mut self, mode: AppMode) -> Result<(), StartOsError> {
        if mode.index() >= self.cfg.num_app_modes {
            return Err(StartOsError::BadId);
        }
        if self.phase != Phase::Init {
            return Err(StartOsError::State);
        }

        log::debug!("core {}: starting in {mode:?}", self.core.index());
        self.phase = Phase::Starting;
        self.app_mode = Some(mode);

        let cfg = self.cfg.clone();
        let core = self.core;
        for (i, counter) in cfg.counters.iter().enumerate() {
            let CounterDriver::Hardware(timer) = counter.driver else {
                continue;
            };
            if counter.core != self.core {
                continue;
            }
            let Some(t) = self.port.timer(timer) else {
                self.panic_shutdown("hardware timer missing");
            };
            if t.max_value() != counter.max_allowed_value {
                self.panic_shutdown("hardware timer range doesn't match its counter");
            }
            t.init();
            self.counters[i].hw_last = t.read();
        }

        let now = self.port.timestamp();
        self.timing.slice_start = now;
        self.cpu_load.start(now);

        self.xc.mark_started(self.core);
        self.xc.arrive(0);
        if !self.wait_barrier(0) {
            return Ok(());
        }

        for (i, _) in cfg
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.core == core && t.autostart.contains_mode(mode))
        {
            let task = TaskId::from_index(i);
            if let Err(e) = self.activate_task_local(task) {
                self.report_error(ErrorInfo::new(
                    ServiceId::StartOs,
                    e.into(),
                    &[mode.to_raw(), task.to_raw()],
                ));
            }
        }

        for (i, desc) in cfg.alarms.iter().enumerate() {
            let Some(auto) = desc.autostart.filter(|a| a.modes.contains_mode(mode)) else {
                continue;
            };
            if desc.core != self.core {
                continue;
            }
            let alarm = AlarmId::from_index(i);
            if let Err(e) = self.set_alarm_local(alarm, auto.start, auto.value, auto.cycle) {
                self.report_error(ErrorInfo::new(
                    ServiceId::StartOs,
                    e.into(),
                    &[mode.to_raw(), alarm.to_raw()],
                ));
            }
        }

        for (i, desc) in cfg.schedule_tables.iter().enumerate() {
            let Some(auto) = desc.autostart.filter(|a| a.modes.contains_mode(mode)) else {
                continue;
            };
            if desc.core != self.core {
                continue;
            }
            let table = ScheduleTableId::from_index(i);
            if let Err(e) = self.start_schedule_table_local(table, auto.start) {
                self.report_error(ErrorInfo::new(
                    ServiceId::StartOs,
                    e.into(),
                    &[mode.to_raw(), table.to_raw()],
                ));
            }
        }

        self.hooks.startup(self.core);
        self.xc.arrive(1);
        if !self.wait_barrier(1) {
            return Ok(());
        }

        log::debug!("core {}: running", self.core.index());
        self.phase = Phase::Running;
        self.reschedule();
        Ok(())
    }

    /// Wait at the startup barrier `i`. Returns `false` if a request served
    /// meanwhile shut down this core.
    fn wait_barrier(&mut self, i: usize) -> bool {
        while !self.xc.barrier_passed(i) {
            if !self.pump_messages_inner() {
                self.port.idle_wait();
            }
            if self.phase == Phase::ShutDown {
                return false;
            }
        }
        self.phase != Phase::ShutDown
    }

    /// Get the application mode passed to `start_os`
    /// (`GetActiveApplicationMode`).
    pub fn get_active_application_mode(&self) -> Option<AppMode> {
        self.app_mode
    }

    /// Get the number of cores taking part in the system
    /// (`GetNumberOfActivatedCores`).
    pub fn get_number_of_activated_cores(&self) -> usize {
        self.xc.num_activated()
    }

    /// Shut down this core (`ShutdownOS`).
    pub fn shutdown_os(&mut self, code: ResultCode) {
        self.shutdown_local(code);
    }

    /// Shut down every core (`ShutdownAllCores`).
    ///
    /// The other cores shut down when they next serve their cross-core
    /// requests.
    pub fn shutdown_all_cores(&mut self, code: ResultCode) {
        if self.phase == Phase::ShutDown {
            return;
        }
        self.broadcast_shutdown(code);
        self.shutdown_local(code);
    }

    pub(crate) fn shutdown_local(&mut self, code: ResultCode) {
        if self.phase == Phase::ShutDown {
            return;
        }
        log::debug!("core {}: shutting down ({code:?})", self.core.index());

        // Spinlocks are visible to other cores
        let cfg = self.cfg.clone();
        let core = self.core;
        for (i, _) in cfg.tasks.iter().enumerate().filter(|(_, t)| t.core == core) {
            self.release_locks(Caller::Task(TaskId::from_index(i)));
        }
        for (i, _) in cfg.isrs.iter().enumerate().filter(|(_, x)| x.core == core) {
            self.release_locks(Caller::Isr(IsrId::from_index(i)));
        }

        for counter in cfg.counters.iter().filter(|c| c.core == core) {
            if let CounterDriver::Hardware(timer) = counter.driver {
                if let Some(t) = self.port.timer(timer) {
                    t.stop();
                }
            }
        }

        self.phase = Phase::ShutDown;
        self.xc.mark_shut_down(self.core);
        self.hooks.shutdown(self.core, code);

        if let Some(task) = self.get_task_id() {
            self.hooks.post_task(self.core, task);
        }
        let prev = self.running.take();
        self.port.dispatch(prev, None);
    }
}
