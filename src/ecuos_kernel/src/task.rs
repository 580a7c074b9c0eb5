//! Tasks
use ecuos_core::kernel::{
    cfg::TaskDescriptor, ActivateTaskError, Caller, ChainTaskError, EventMask,
    GetTaskStateError, LockRef, Priority, ResultCode, ScheduleError, ServiceId, TaskId,
    TaskState, TerminateTaskError,
};

use crate::{xcore, Kernel, Phase, Port};

#[doc(hidden)]
pub mod readyqueue;
use self::readyqueue::{Queue, ScheduleDecision};

/// *Task control block* - the state data of a task.
#[derive(Debug)]
pub(crate) struct TaskCb {
    pub(crate) state: TaskState,

    /// The effective priority. Differs from the base priority while the
    /// task holds resources or runs at its run priority.
    pub(crate) priority: Priority,

    /// The activation slot of the oldest pending activation.
    pub(crate) first: u8,

    /// The number of pending activations, including the running one.
    pub(crate) n_act: u8,

    pub(crate) events: EventMask,

    /// The events `WaitEvent` is waiting for.
    pub(crate) wait_mask: EventMask,

    /// The most recently acquired lock.
    pub(crate) lock_head: Option<LockRef>,

    /// The execution time consumed by the current activation.
    pub(crate) exec_used: u64,
}

impl TaskCb {
    pub(crate) fn new(desc: &TaskDescriptor) -> Self {
        Self {
            state: TaskState::Suspended,
            priority: desc.priority,
            first: 0,
            n_act: 0,
            events: 0,
            wait_mask: 0,
            lock_head: None,
            exec_used: 0,
        }
    }
}

/// These methods implement the task management services.
impl<P: Port, Q: Queue> Kernel<P, Q> {
    /// Activate `task` (`ActivateTask`).
    ///
    /// The activation is queued if the task is already active, up to the
    /// task's activation limit.
    pub fn activate_task(&mut self, task: TaskId) -> Result<(), ActivateTaskError> {
        let result = self.activate_task_inner(task);
        self.finish_service(ServiceId::ActivateTask, &[task.to_raw()], result)
    }

    fn activate_task_inner(&mut self, task: TaskId) -> Result<(), ActivateTaskError> {
        let &TaskDescriptor {
            core, app, access, ..
        } = self.cfg.task(task).ok_or(ActivateTaskError::BadId)?;
        if !self.may_access(app, access) {
            return Err(ActivateTaskError::Access);
        }
        if core != self.core {
            return self.call_remote(core, xcore::ActivateTask { task });
        }
        self.activate_task_local(task)
    }

    /// Terminate the calling task (`TerminateTask`).
    ///
    /// Locks still held by the task are released and reported to the error
    /// hook; the task terminates anyway.
    pub fn terminate_task(&mut self) -> Result<(), TerminateTaskError> {
        let result = match self.current_task() {
            Some(task) => {
                self.terminate_current(task, ServiceId::TerminateTask);
                Ok(())
            }
            None => Err(TerminateTaskError::CallLevel),
        };
        self.finish_service(ServiceId::TerminateTask, &[], result)
    }

    /// Terminate the calling task and activate `task` (`ChainTask`).
    pub fn chain_task(&mut self, task: TaskId) -> Result<(), ChainTaskError> {
        let result = self.chain_task_inner(task);
        self.finish_service(ServiceId::ChainTask, &[task.to_raw()], result)
    }

    fn chain_task_inner(&mut self, task: TaskId) -> Result<(), ChainTaskError> {
        let current = self.current_task().ok_or(ChainTaskError::CallLevel)?;

        if task == current {
            // The running activation makes room for the new one, so
            // self-chaining never hits the limit
            self.terminate_current(current, ServiceId::ChainTask);
            return self.activate_task_local(task).map_err(chain_error);
        }

        // Activate first so that a failure leaves the caller running. Nothing
        // can observe the order because dispatching happens afterwards.
        self.activate_task_inner(task).map_err(chain_error)?;
        self.terminate_current(current, ServiceId::ChainTask);
        Ok(())
    }

    /// Let a higher-priority ready task run (`Schedule`).
    ///
    /// The caller temporarily gives up its run priority (its internal
    /// resource), so any ready task with a priority higher than the caller's
    /// base priority is dispatched.
    pub fn schedule(&mut self) -> Result<(), ScheduleError> {
        let result = self.schedule_inner();
        self.finish_service(ServiceId::Schedule, &[], result)
    }

    fn schedule_inner(&mut self) -> Result<(), ScheduleError> {
        let task = self.current_task().ok_or(ScheduleError::CallLevel)?;
        let i = task.index();
        if self.tasks[i].lock_head.is_some() {
            return Err(ScheduleError::Resource);
        }

        let desc = &self.cfg.tasks[i];
        let (base, run) = (desc.priority, desc.run_priority);
        self.tasks[i].priority = base;
        self.reschedule();

        // If the caller kept the processor, it reclaims its run priority. A
        // preempted caller gets it back when it's dispatched again.
        if self.tasks[i].state == TaskState::Running {
            self.tasks[i].priority = run;
        }
        Ok(())
    }

    /// Get the running task (`GetTaskID`). In an ISR, this is the interrupted
    /// task.
    pub fn get_task_id(&self) -> Option<TaskId> {
        self.running
            .filter(|t| self.tasks[t.index()].state == TaskState::Running)
    }

    /// Get the state of `task` (`GetTaskState`).
    pub fn get_task_state(&mut self, task: TaskId) -> Result<TaskState, GetTaskStateError> {
        let result = self.get_task_state_inner(task);
        self.finish_service(ServiceId::GetTaskState, &[task.to_raw()], result)
    }

    fn get_task_state_inner(&mut self, task: TaskId) -> Result<TaskState, GetTaskStateError> {
        let &TaskDescriptor {
            core, app, access, ..
        } = self.cfg.task(task).ok_or(GetTaskStateError::BadId)?;
        if !self.may_access(app, access) {
            return Err(GetTaskStateError::Access);
        }
        if core != self.core {
            return self.call_remote(core, xcore::GetTaskState { task });
        }
        Ok(self.task_state_local(task))
    }

    /// Terminate the running task because its body returned without calling
    /// `TerminateTask` or `ChainTask`. Called by the port.
    pub fn task_return(&mut self) {
        if let Some(task) = self.current_task() {
            self.report_error(ecuos_core::kernel::ErrorInfo::new(
                ServiceId::TaskReturn,
                ResultCode::MissingEnd,
                &[task.to_raw()],
            ));
            self.terminate_current(task, ServiceId::TaskReturn);
        }
        self.reschedule();
    }

    /// Get the entity on whose behalf services are executing: the innermost
    /// ISR or the running task.
    pub(crate) fn caller(&self) -> Option<Caller> {
        match self.isr_stack.last() {
            Some(&isr) => Some(Caller::Isr(isr)),
            None => self.get_task_id().map(Caller::Task),
        }
    }

    /// Get the running task if the caller is a task.
    pub(crate) fn current_task(&self) -> Option<TaskId> {
        if self.isr_stack.is_empty() {
            self.get_task_id()
        } else {
            None
        }
    }

    pub(crate) fn task_state_local(&self, task: TaskId) -> TaskState {
        self.tasks[task.index()].state.reported()
    }

    /// Activate a task of this core. No access checks are done.
    pub(crate) fn activate_task_local(&mut self, task: TaskId) -> Result<(), ActivateTaskError> {
        let i = task.index();
        let desc = &self.cfg.tasks[i];
        if self.tasks[i].state == TaskState::Quarantined || !self.task_activatable(task) {
            return Err(ActivateTaskError::Access);
        }

        let cb = &mut self.tasks[i];
        if cb.n_act >= desc.max_activations {
            return Err(ActivateTaskError::Limit);
        }

        let slot = (cb.first as usize + cb.n_act as usize) % desc.max_activations as usize;
        cb.n_act += 1;
        if cb.state == TaskState::Suspended {
            cb.state = TaskState::New;
            cb.events = 0;
            cb.priority = desc.priority;
        }

        log::trace!(
            "core {}: activating {task:?} ({} pending)",
            self.core.index(),
            cb.n_act
        );

        let (record, priority) = (desc.record(slot), desc.priority);
        let result = self.ready.push_back(record, priority);
        self.expect_consistent(result, "ready queue corrupted");
        Ok(())
    }

    /// The activation record of the oldest pending activation.
    fn current_record(&self, task: TaskId) -> usize {
        self.cfg.tasks[task.index()].record(self.tasks[task.index()].first as usize)
    }

    /// Terminate the current activation of the running task.
    fn terminate_current(&mut self, task: TaskId, service: ServiceId) {
        if let Some(code) = self.release_locks(Caller::Task(task)) {
            self.report_error(ecuos_core::kernel::ErrorInfo::new(
                service,
                code,
                &[task.to_raw()],
            ));
        }

        self.hooks.post_task(self.core, task);
        self.finish_activation(task);
        log::trace!("core {}: {task:?} terminated", self.core.index());
    }

    /// Retire the oldest activation of `task`, which must not be queued.
    fn finish_activation(&mut self, task: TaskId) {
        let desc = &self.cfg.tasks[task.index()];
        let cb = &mut self.tasks[task.index()];
        cb.first = ((cb.first as usize + 1) % desc.max_activations as usize) as u8;
        cb.n_act -= 1;
        cb.priority = desc.priority;
        cb.exec_used = 0;
        // The next pending activation is already queued
        cb.state = if cb.n_act > 0 {
            TaskState::New
        } else {
            TaskState::Suspended
        };
    }

    /// Forcibly terminate `task` along with all its pending activations and
    /// put it into `new_state` (`Suspended` or `Quarantined`).
    pub(crate) fn kill_task(&mut self, task: TaskId, new_state: TaskState) {
        let i = task.index();
        self.release_locks(Caller::Task(task));

        let desc = &self.cfg.tasks[i];
        let cb = &self.tasks[i];
        let queued_records: arrayvec::ArrayVec<usize, 256> = (0..cb.n_act as usize)
            .map(|k| desc.record((cb.first as usize + k) % desc.max_activations as usize))
            .collect();
        for record in queued_records {
            // The running activation is not queued
            let result = self.ready.remove(record);
            self.expect_consistent(result, "ready queue corrupted");
        }

        if self.tasks[i].state == TaskState::Running {
            self.hooks.post_task(self.core, task);
        }

        let priority = self.cfg.tasks[i].priority;
        let cb = &mut self.tasks[i];
        cb.state = new_state;
        cb.n_act = 0;
        cb.events = 0;
        cb.wait_mask = 0;
        cb.priority = priority;
        cb.exec_used = 0;
        log::debug!("core {}: {task:?} killed", self.core.index());
    }

    /// Put `task`'s oldest activation back into the ready queue.
    pub(crate) fn make_ready(&mut self, task: TaskId) {
        let record = self.current_record(task);
        let cb = &mut self.tasks[task.index()];
        cb.state = TaskState::Ready;
        let priority = cb.priority;
        let result = self.ready.push_back(record, priority);
        self.expect_consistent(result, "ready queue corrupted");
    }

    /// Make the highest-priority ready task the running task if it differs
    /// from the current one.
    ///
    /// Does nothing while dispatching is deferred (in an ISR, while a
    /// cross-core request is being served or awaited, or during startup).
    pub(crate) fn reschedule(&mut self) {
        if self.phase != Phase::Running || self.dispatch_lock > 0 || !self.isr_stack.is_empty() {
            return;
        }

        let prev = self.running;
        let prev_running = prev.filter(|t| self.tasks[t.index()].state == TaskState::Running);
        let prev_priority = prev_running.map(|t| self.tasks[t.index()].priority);

        let result = self.ready.pop_front(prev_priority);
        let next_record = match self.expect_consistent(result, "ready queue corrupted") {
            ScheduleDecision::Keep => return,
            ScheduleDecision::SwitchTo(x) => x,
        };

        if next_record.is_none() && prev.is_none() {
            // Still idle
            return;
        }

        self.account_time();

        if let Some(task) = prev_running {
            // Preempted; it's the oldest ready activation of its priority
            self.hooks.post_task(self.core, task);
            let record = self.current_record(task);
            let cb = &mut self.tasks[task.index()];
            cb.state = TaskState::Ready;
            let priority = cb.priority;
            let result = self.ready.push_front(record, priority);
            self.expect_consistent(result, "ready queue corrupted");
            log::trace!("core {}: {task:?} preempted", self.core.index());
        }

        let next = next_record.map(|record| self.record_owner[record]);
        if let Some(task) = next {
            let desc = &self.cfg.tasks[task.index()];
            let cb = &mut self.tasks[task.index()];
            if cb.state == TaskState::New {
                cb.exec_used = 0;
            }
            cb.state = TaskState::Running;
            cb.priority = cb.priority.max(desc.run_priority);
            self.hooks.pre_task(self.core, task);
        }

        log::trace!("core {}: dispatching {prev:?} -> {next:?}", self.core.index());
        self.running = next;
        self.port.dispatch(prev, next);
    }
}

fn chain_error(e: ActivateTaskError) -> ChainTaskError {
    match e {
        ActivateTaskError::BadId => ChainTaskError::BadId,
        ActivateTaskError::Access => ChainTaskError::Access,
        ActivateTaskError::Limit => ChainTaskError::Limit,
        ActivateTaskError::Core => ChainTaskError::Core,
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::*;
    use ecuos_core::kernel::{cfg::*, *};

    #[test]
    fn activation_order_by_priority() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut b = CfgBuilder::new(1);
        let main = TaskDescriptor::build()
            .priority(10)
            .non_preemptive()
            .autostart(AppModeSet::DEFAULT)
            .finish(&mut b);
        let t3a = TaskDescriptor::build().priority(3).finish(&mut b);
        let t7 = TaskDescriptor::build().priority(7).finish(&mut b);
        let t3b = TaskDescriptor::build().priority(3).finish(&mut b);
        let t9 = TaskDescriptor::build().priority(9).finish(&mut b);
        let (mut k, _hooks) = boot(b);
        assert_eq!(k.get_task_id(), Some(main));

        for t in [t3a, t7, t3b, t9] {
            k.activate_task(t).unwrap();
        }
        assert_eq!(k.get_task_id(), Some(main));

        let mut order = Vec::new();
        k.terminate_task().unwrap();
        while let Some(t) = k.get_task_id() {
            order.push(t);
            k.terminate_task().unwrap();
        }
        assert_eq!(order, [t9, t7, t3a, t3b]);
    }

    #[test]
    fn preemption_and_dispatch_log() {
        let mut b = CfgBuilder::new(1);
        let low = TaskDescriptor::build()
            .priority(1)
            .autostart(AppModeSet::DEFAULT)
            .finish(&mut b);
        let high = TaskDescriptor::build().priority(5).finish(&mut b);
        let (mut k, hooks) = boot(b);

        k.activate_task(high).unwrap();
        assert_eq!(k.get_task_id(), Some(high));
        assert_eq!(k.task_state_local(low), TaskState::Ready);

        k.terminate_task().unwrap();
        assert_eq!(k.get_task_id(), Some(low));

        assert_eq!(
            k.port().dispatches,
            [
                (None, Some(low)),
                (Some(low), Some(high)),
                (Some(high), Some(low)),
            ]
        );
        assert_eq!(
            hooks.task_events(),
            [
                HookEvent::PreTask(low),
                HookEvent::PostTask(low),
                HookEvent::PreTask(high),
                HookEvent::PostTask(high),
                HookEvent::PreTask(low),
            ]
        );
    }

    #[test]
    fn multiple_activations() {
        let mut b = CfgBuilder::new(1);
        let main = TaskDescriptor::build()
            .priority(5)
            .autostart(AppModeSet::DEFAULT)
            .finish(&mut b);
        let worker = TaskDescriptor::build()
            .priority(1)
            .max_activations(2)
            .finish(&mut b);
        let (mut k, _hooks) = boot(b);

        k.activate_task(worker).unwrap();
        k.activate_task(worker).unwrap();
        assert_eq!(k.activate_task(worker), Err(ActivateTaskError::Limit));
        assert_eq!(k.get_task_state(worker), Ok(TaskState::Ready));

        k.terminate_task().unwrap();
        assert_eq!(k.get_task_id(), Some(worker));
        k.terminate_task().unwrap();
        // The second activation runs next
        assert_eq!(k.get_task_id(), Some(worker));
        k.terminate_task().unwrap();
        assert_eq!(k.get_task_id(), None);
        assert_eq!(k.get_task_state(worker), Ok(TaskState::Suspended));
        assert_eq!(k.get_task_state(main), Ok(TaskState::Suspended));
    }

    #[test]
    fn chain_task() {
        let mut b = CfgBuilder::new(1);
        let a = TaskDescriptor::build()
            .priority(2)
            .autostart(AppModeSet::DEFAULT)
            .finish(&mut b);
        let c = TaskDescriptor::build().priority(1).finish(&mut b);
        let (mut k, _hooks) = boot(b);

        // Self-chaining never hits the limit
        k.chain_task(a).unwrap();
        assert_eq!(k.get_task_id(), Some(a));

        k.activate_task(c).unwrap();
        // `c` already has a pending activation; the caller keeps running
        assert_eq!(k.chain_task(c), Err(ChainTaskError::Limit));
        assert_eq!(k.get_task_id(), Some(a));

        assert_eq!(k.chain_task(TaskId::new(7)), Err(ChainTaskError::BadId));
        k.terminate_task().unwrap();
        assert_eq!(k.get_task_id(), Some(c));
    }

    #[test]
    fn schedule_releases_run_priority() {
        let mut b = CfgBuilder::new(1);
        let np = TaskDescriptor::build()
            .priority(1)
            .non_preemptive()
            .autostart(AppModeSet::DEFAULT)
            .finish(&mut b);
        let other = TaskDescriptor::build().priority(4).finish(&mut b);
        let (mut k, _hooks) = boot(b);

        k.activate_task(other).unwrap();
        assert_eq!(k.get_task_id(), Some(np));

        k.schedule().unwrap();
        assert_eq!(k.get_task_id(), Some(other));
        k.terminate_task().unwrap();
        assert_eq!(k.get_task_id(), Some(np));
        // Non-preemptive again
        assert_eq!(
            k.tasks[np.index()].priority,
            k.config().tasks[np.index()].run_priority
        );
        assert_eq!(
            k.config().tasks[np.index()].run_priority,
            k.config().highest_priority()
        );
    }

    #[test]
    fn task_return_reports_missing_end() {
        let mut b = CfgBuilder::new(1);
        let t = TaskDescriptor::build()
            .priority(1)
            .autostart(AppModeSet::DEFAULT)
            .finish(&mut b);
        let (mut k, hooks) = boot(b);

        k.task_return();
        assert_eq!(k.get_task_state(t), Ok(TaskState::Suspended));
        assert_eq!(hooks.errors()[0].code, ResultCode::MissingEnd);
    }

    #[test]
    fn services_from_isr() {
        let mut b = CfgBuilder::new(1);
        let t = TaskDescriptor::build()
            .priority(1)
            .autostart(AppModeSet::DEFAULT)
            .finish(&mut b);
        let high = TaskDescriptor::build().priority(3).finish(&mut b);
        let isr = IsrDescriptor::build().finish(&mut b);
        let (mut k, _hooks) = boot(b);

        k.enter_isr(isr);
        assert_eq!(k.terminate_task(), Err(TerminateTaskError::CallLevel));
        assert_eq!(k.schedule(), Err(ScheduleError::CallLevel));
        // Dispatching is deferred until the ISR returns
        k.activate_task(high).unwrap();
        assert_eq!(k.get_task_id(), Some(t));
        k.leave_isr();
        assert_eq!(k.get_task_id(), Some(high));
    }

    #[test]
    fn list_queue_kernel() {
        let mut b = CfgBuilder::new(1);
        let main = TaskDescriptor::build()
            .priority(1)
            .autostart(AppModeSet::DEFAULT)
            .finish(&mut b);
        let high = TaskDescriptor::build().priority(2).finish(&mut b);
        let (mut k, _hooks) = boot_with_queue::<crate::ListQueue>(b);

        k.activate_task(high).unwrap();
        assert_eq!(k.get_task_id(), Some(high));
        k.terminate_task().unwrap();
        assert_eq!(k.get_task_id(), Some(main));
    }
}
