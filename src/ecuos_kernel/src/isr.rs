//! Category 2 interrupt service routines
//!
//! The port brackets the execution of an ISR with [`Kernel::enter_isr`] and
//! [`Kernel::leave_isr`]. While an ISR runs, it's the caller of the services
//! it invokes, and dispatching is deferred until the outermost ISR returns.
use ecuos_core::kernel::{Caller, ErrorInfo, IsrId, LockRef, ServiceId};

use crate::{Kernel, Port, Queue};

#[derive(Debug, Default)]
pub(crate) struct IsrCb {
    /// The most recently acquired lock held by the ISR.
    pub(crate) lock_head: Option<LockRef>,
    /// The execution time used by the current invocation.
    pub(crate) exec_used: u64,
    /// The current invocation was killed by timing protection. It keeps
    /// occupying the ISR stack until the port calls `leave_isr`.
    pub(crate) killed: bool,
}

impl<P: Port, Q: Queue> Kernel<P, Q> {
    /// Mark the start of `isr`'s execution on this core.
    ///
    /// # Panics
    ///
    /// Shuts down the core and panics if `isr` doesn't exist, belongs to
    /// another core, or is already executing.
    pub fn enter_isr(&mut self, isr: IsrId) {
        match self.cfg.isr(isr) {
            Some(desc) if desc.core == self.core => {}
            _ => self.panic_shutdown("entered an unknown ISR"),
        }
        if self.isr_stack.contains(&isr) {
            self.panic_shutdown("entered an ISR recursively");
        }

        self.account_time();
        self.isr_stack.push(isr);
        let cb = &mut self.isrs[isr.index()];
        cb.exec_used = 0;
        cb.killed = false;
        log::trace!("core {}: entered {isr:?}", self.core.index());
    }

    /// Mark the end of the innermost ISR's execution.
    ///
    /// Locks the ISR still holds are released and reported to the error hook.
    /// If this was the outermost ISR, a task preempted by the tasks the ISRs
    /// activated is dispatched.
    pub fn leave_isr(&mut self) {
        self.account_time();
        let Some(&isr) = self.isr_stack.last() else {
            self.panic_shutdown("left an ISR that wasn't entered");
        };

        if let Some(code) = self.release_locks(Caller::Isr(isr)) {
            self.report_error(ErrorInfo::new(
                ServiceId::IsrReturn,
                code,
                &[isr.to_raw()],
            ));
        }
        self.isr_stack.pop();
        log::trace!("core {}: left {isr:?}", self.core.index());
        self.reschedule();
    }

    /// Get the innermost executing ISR.
    pub fn current_isr(&self) -> Option<IsrId> {
        self.isr_stack.last().copied()
    }

    /// Get a flag indicating whether the innermost ISR was killed by
    /// timing protection. The port should abandon its execution and call
    /// [`Self::leave_isr`].
    pub fn is_isr_killed(&self) -> bool {
        self.isr_stack
            .last()
            .is_some_and(|isr| self.isrs[isr.index()].killed)
    }

    pub(crate) fn kill_isr(&mut self, isr: IsrId) {
        self.release_locks(Caller::Isr(isr));
        self.isrs[isr.index()].killed = true;
        log::debug!("core {}: {isr:?} killed", self.core.index());
    }
}
