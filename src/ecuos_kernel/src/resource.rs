//! Resources (priority-ceiling mutexes) and lock chains
//!
//! Every task and category 2 ISR owns a *lock chain*: a singly linked list of
//! the resources and spinlocks it holds, the most recently acquired first.
//! The head is stored in the task or ISR control block, and each lock stores
//! the link to the one acquired before it. Locks must be released in the
//! reverse order of acquisition, so releasing always pops the head.
use ecuos_core::kernel::{
    cfg::ResourceDescriptor, Caller, GetResourceError, LockRef, Priority, ReleaseResourceError,
    ResourceId, ResultCode, ServiceId,
};

use crate::{Kernel, Port, Queue};

/// *Resource control block* - the state data of a resource.
#[derive(Debug, Default)]
pub(crate) struct ResourceCb {
    /// The task or ISR holding this resource.
    pub(crate) holder: Option<Caller>,

    /// The holder's priority before acquiring this resource. Only meaningful
    /// if the holder is a task.
    pub(crate) last_priority: Priority,

    /// The lock acquired by the holder before this one.
    pub(crate) next: Option<LockRef>,
}

impl<P: Port, Q: Queue> Kernel<P, Q> {
    /// Acquire `resource` (`GetResource`), raising the calling task's
    /// priority to the resource's ceiling.
    pub fn get_resource(&mut self, resource: ResourceId) -> Result<(), GetResourceError> {
        let result = self.get_resource_inner(resource);
        self.finish_service(ServiceId::GetResource, &[resource.to_raw()], result)
    }

    fn get_resource_inner(&mut self, resource: ResourceId) -> Result<(), GetResourceError> {
        let &ResourceDescriptor {
            core,
            app,
            ceiling,
            access,
            ..
        } = self
            .cfg
            .resource(resource)
            .ok_or(GetResourceError::BadId)?;
        let caller = self.caller().ok_or(GetResourceError::Access)?;

        if core != self.core || !self.may_access(app, access) || !self.within_ceiling(caller, ceiling)
        {
            return Err(GetResourceError::Access);
        }
        if self.resources[resource.index()].holder.is_some() {
            return Err(GetResourceError::Access);
        }
        if let Some(LockRef::Spinlock(_)) = self.lock_head(caller) {
            return Err(GetResourceError::NestingError);
        }

        let last_priority = match caller {
            Caller::Task(task) => {
                let cb = &mut self.tasks[task.index()];
                let last = cb.priority;
                cb.priority = cb.priority.max(ceiling);
                last
            }
            Caller::Isr(_) => 0,
        };

        let next = self.lock_head(caller);
        let cb = &mut self.resources[resource.index()];
        cb.holder = Some(caller);
        cb.last_priority = last_priority;
        cb.next = next;
        self.set_lock_head(caller, Some(LockRef::Resource(resource)));

        log::trace!("core {}: {caller:?} took {resource:?}", self.core.index());
        Ok(())
    }

    /// Release `resource` (`ReleaseResource`). It must be the most recently
    /// acquired lock of the caller.
    pub fn release_resource(&mut self, resource: ResourceId) -> Result<(), ReleaseResourceError> {
        let result = self.release_resource_inner(resource);
        self.finish_service(ServiceId::ReleaseResource, &[resource.to_raw()], result)
    }

    fn release_resource_inner(&mut self, resource: ResourceId) -> Result<(), ReleaseResourceError> {
        let &ResourceDescriptor {
            core,
            app,
            ceiling,
            access,
            ..
        } = self
            .cfg
            .resource(resource)
            .ok_or(ReleaseResourceError::BadId)?;
        let caller = self.caller().ok_or(ReleaseResourceError::Access)?;

        if core != self.core || !self.may_access(app, access) || !self.within_ceiling(caller, ceiling)
        {
            return Err(ReleaseResourceError::Access);
        }

        let cb = &self.resources[resource.index()];
        if cb.holder != Some(caller) || self.lock_head(caller) != Some(LockRef::Resource(resource))
        {
            return Err(ReleaseResourceError::NestingError);
        }

        let (last_priority, next) = (cb.last_priority, cb.next);
        let cb = &mut self.resources[resource.index()];
        cb.holder = None;
        cb.next = None;
        self.set_lock_head(caller, next);
        if let Caller::Task(task) = caller {
            self.tasks[task.index()].priority = last_priority;
        }

        log::trace!("core {}: {caller:?} released {resource:?}", self.core.index());
        Ok(())
    }

    /// Check the ceiling against the static priority of a calling task. ISRs
    /// outrank every task, so their ceiling is not checked.
    fn within_ceiling(&self, caller: Caller, ceiling: Priority) -> bool {
        match caller {
            Caller::Task(task) => self.cfg.tasks[task.index()].priority <= ceiling,
            Caller::Isr(_) => true,
        }
    }

    pub(crate) fn lock_head(&self, caller: Caller) -> Option<LockRef> {
        match caller {
            Caller::Task(task) => self.tasks[task.index()].lock_head,
            Caller::Isr(isr) => self.isrs[isr.index()].lock_head,
        }
    }

    pub(crate) fn set_lock_head(&mut self, caller: Caller, head: Option<LockRef>) {
        match caller {
            Caller::Task(task) => self.tasks[task.index()].lock_head = head,
            Caller::Isr(isr) => self.isrs[isr.index()].lock_head = head,
        }
    }

    /// Release every lock held by `caller`, most recent first.
    ///
    /// Returns the code to report, if anything was held: `Spinlock` if the
    /// chain contained a spinlock, `Resource` otherwise. The caller's
    /// priority is not restored; it's reset by whoever killed or terminated
    /// the caller.
    pub(crate) fn release_locks(&mut self, caller: Caller) -> Option<ResultCode> {
        let mut code = None;
        let mut cursor = self.lock_head(caller);
        while let Some(lock) = cursor {
            match lock {
                LockRef::Resource(resource) => {
                    if self.resources[resource.index()].holder != Some(caller) {
                        self.panic_shutdown("lock chain corrupted");
                    }
                    let cb = &mut self.resources[resource.index()];
                    cb.holder = None;
                    cursor = cb.next.take();
                    code.get_or_insert(ResultCode::Resource);
                }
                LockRef::Spinlock(spinlock) => {
                    let word = self.spinlock_owner_word(caller);
                    if !self.xc.release_spinlock(spinlock, word) {
                        self.panic_shutdown("lock chain corrupted");
                    }
                    cursor = self.spinlock_next[spinlock.index()].take();
                    code = Some(ResultCode::Spinlock);
                }
            }
            log::debug!(
                "core {}: released {lock:?} held by {caller:?}",
                self.core.index()
            );
        }
        self.set_lock_head(caller, None);
        code
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::*;
    use ecuos_core::kernel::{cfg::*, *};

    struct Fixture {
        low: TaskId,
        mid: TaskId,
        high: TaskId,
        r_mid: ResourceId,
        r_high: ResourceId,
    }

    fn fixture() -> (crate::Kernel<TestPort>, Fixture) {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut b = CfgBuilder::new(1);
        let r_mid = ResourceDescriptor::build().ceiling(5).finish(&mut b);
        let r_high = ResourceDescriptor::build().ceiling(8).finish(&mut b);
        let low = TaskDescriptor::build()
            .priority(1)
            .uses_resource(r_mid)
            .uses_resource(r_high)
            .autostart(AppModeSet::DEFAULT)
            .finish(&mut b);
        let mid = TaskDescriptor::build().priority(5).finish(&mut b);
        let high = TaskDescriptor::build().priority(9).finish(&mut b);
        let (k, _hooks) = boot(b);
        (
            k,
            Fixture {
                low,
                mid,
                high,
                r_mid,
                r_high,
            },
        )
    }

    #[test]
    fn ceiling_blocks_preemption() {
        let (mut k, f) = fixture();
        assert_eq!(k.get_task_id(), Some(f.low));

        k.get_resource(f.r_mid).unwrap();
        k.activate_task(f.mid).unwrap();
        assert_eq!(k.get_task_id(), Some(f.low));

        // Outranks the ceiling
        k.activate_task(f.high).unwrap();
        assert_eq!(k.get_task_id(), Some(f.high));
        k.terminate_task().unwrap();
        assert_eq!(k.get_task_id(), Some(f.low));

        k.release_resource(f.r_mid).unwrap();
        assert_eq!(k.get_task_id(), Some(f.mid));
        k.terminate_task().unwrap();
        assert_eq!(k.get_task_id(), Some(f.low));
    }

    #[test]
    fn release_in_reverse_order() {
        let (mut k, f) = fixture();
        k.get_resource(f.r_mid).unwrap();
        k.get_resource(f.r_high).unwrap();
        assert_eq!(
            k.release_resource(f.r_mid),
            Err(ReleaseResourceError::NestingError)
        );
        k.release_resource(f.r_high).unwrap();
        k.release_resource(f.r_mid).unwrap();
        assert_eq!(
            k.release_resource(f.r_mid),
            Err(ReleaseResourceError::NestingError)
        );
    }

    #[test]
    fn resource_errors() {
        let (mut k, f) = fixture();
        k.get_resource(f.r_mid).unwrap();
        assert_eq!(k.get_resource(f.r_mid), Err(GetResourceError::Access));
        assert_eq!(
            k.get_resource(ResourceId::new(7)),
            Err(GetResourceError::BadId)
        );
        k.release_resource(f.r_mid).unwrap();

        // `high`'s static priority exceeds both ceilings
        k.activate_task(f.high).unwrap();
        assert_eq!(k.get_resource(f.r_mid), Err(GetResourceError::Access));
        assert_eq!(
            k.release_resource(f.r_high),
            Err(ReleaseResourceError::Access)
        );
    }

    #[test]
    fn terminate_releases_locks() {
        let (mut k, f) = fixture();
        k.get_resource(f.r_mid).unwrap();
        k.terminate_task().unwrap();
        let info = k.last_error().unwrap();
        assert_eq!(info.service, ServiceId::TerminateTask);
        assert_eq!(info.code, ResultCode::Resource);
        assert_eq!(k.get_task_id(), None);

        // Available again
        k.activate_task(f.low).unwrap();
        k.get_resource(f.r_mid).unwrap();
    }

    #[test]
    fn isr_holding_resource() {
        let mut b = CfgBuilder::new(1);
        let res = ResourceDescriptor::build().ceiling(3).finish(&mut b);
        let isr = IsrDescriptor::build().finish(&mut b);
        TaskDescriptor::build()
            .priority(1)
            .autostart(AppModeSet::DEFAULT)
            .finish(&mut b);
        let (mut k, hooks) = boot(b);

        k.enter_isr(isr);
        k.get_resource(res).unwrap();
        k.leave_isr();

        let errors = hooks.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].service, ServiceId::IsrReturn);
        assert_eq!(errors[0].code, ResultCode::Resource);

        // The task can take it now
        k.get_resource(res).unwrap();
    }
}
