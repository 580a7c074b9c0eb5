//! Events of extended tasks
use ecuos_core::kernel::{
    cfg::TaskDescriptor, ClearEventError, EventMask, GetEventError, ServiceId, SetEventError,
    TaskId, TaskState, WaitEventError,
};

use crate::{xcore, Kernel, Port, Queue};

impl<P: Port, Q: Queue> Kernel<P, Q> {
    /// Set the events `mask` of the extended task `task` (`SetEvent`). The
    /// task is released if it's waiting for any of them.
    pub fn set_event(&mut self, task: TaskId, mask: EventMask) -> Result<(), SetEventError> {
        let result = self.set_event_inner(task, mask);
        self.finish_service(ServiceId::SetEvent, &[task.to_raw(), mask], result)
    }

    fn set_event_inner(&mut self, task: TaskId, mask: EventMask) -> Result<(), SetEventError> {
        let &TaskDescriptor {
            core,
            app,
            access,
            extended,
            ..
        } = self.cfg.task(task).ok_or(SetEventError::BadId)?;
        if !extended || !self.may_access(app, access) {
            return Err(SetEventError::Access);
        }
        if core != self.core {
            return self.call_remote(core, xcore::SetEvent { task, mask });
        }
        self.set_event_local(task, mask)
    }

    /// Get the events set for `task` (`GetEvent`).
    pub fn get_event(&mut self, task: TaskId) -> Result<EventMask, GetEventError> {
        let result = self.get_event_inner(task);
        self.finish_service(ServiceId::GetEvent, &[task.to_raw()], result)
    }

    fn get_event_inner(&mut self, task: TaskId) -> Result<EventMask, GetEventError> {
        let &TaskDescriptor {
            core,
            app,
            access,
            extended,
            ..
        } = self.cfg.task(task).ok_or(GetEventError::BadId)?;
        if !extended || !self.may_access(app, access) {
            return Err(GetEventError::Access);
        }
        if core != self.core {
            return self.call_remote(core, xcore::GetEvent { task });
        }
        self.get_event_local(task)
    }

    /// Clear the events `mask` of the calling task (`ClearEvent`).
    pub fn clear_event(&mut self, mask: EventMask) -> Result<(), ClearEventError> {
        let result = match self.current_task() {
            None => Err(ClearEventError::CallLevel),
            Some(task) if !self.cfg.tasks[task.index()].extended => Err(ClearEventError::Access),
            Some(task) => {
                self.tasks[task.index()].events &= !mask;
                Ok(())
            }
        };
        self.finish_service(ServiceId::ClearEvent, &[mask], result)
    }

    /// Wait until any of the events `mask` is set for the calling task
    /// (`WaitEvent`). Returns immediately if one is already set.
    ///
    /// The caller gives up its run priority while waiting.
    pub fn wait_event(&mut self, mask: EventMask) -> Result<(), WaitEventError> {
        let result = self.wait_event_inner(mask);
        self.finish_service(ServiceId::WaitEvent, &[mask], result)
    }

    fn wait_event_inner(&mut self, mask: EventMask) -> Result<(), WaitEventError> {
        let task = self.current_task().ok_or(WaitEventError::CallLevel)?;
        let i = task.index();
        if !self.cfg.tasks[i].extended {
            return Err(WaitEventError::Access);
        }
        if self.tasks[i].lock_head.is_some() {
            return Err(WaitEventError::Resource);
        }
        if self.tasks[i].events & mask != 0 {
            return Ok(());
        }

        self.hooks.post_task(self.core, task);
        let priority = self.cfg.tasks[i].priority;
        let cb = &mut self.tasks[i];
        cb.wait_mask = mask;
        cb.state = TaskState::Waiting;
        cb.priority = priority;
        log::trace!("core {}: {task:?} waits for {mask:#x}", self.core.index());
        Ok(())
    }

    pub(crate) fn set_event_local(
        &mut self,
        task: TaskId,
        mask: EventMask,
    ) -> Result<(), SetEventError> {
        let i = task.index();
        if !self.app_accessible(self.cfg.tasks[i].app) {
            return Err(SetEventError::Access);
        }

        let cb = &mut self.tasks[i];
        match cb.state {
            TaskState::Suspended | TaskState::Quarantined => return Err(SetEventError::State),
            TaskState::Waiting => {
                cb.events |= mask;
                if cb.events & cb.wait_mask != 0 {
                    cb.wait_mask = 0;
                    log::trace!("core {}: {task:?} released", self.core.index());
                    self.make_ready(task);
                }
            }
            _ => cb.events |= mask,
        }
        Ok(())
    }

    pub(crate) fn get_event_local(&self, task: TaskId) -> Result<EventMask, GetEventError> {
        let cb = &self.tasks[task.index()];
        match cb.state {
            TaskState::Suspended | TaskState::Quarantined => Err(GetEventError::State),
            _ if !self.app_accessible(self.cfg.tasks[task.index()].app) => {
                Err(GetEventError::Access)
            }
            _ => Ok(cb.events),
        }
    }
}
