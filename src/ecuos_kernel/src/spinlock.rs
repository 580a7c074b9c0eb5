//! Spinlocks
//!
//! A spinlock is a word in the [`Interconnect`](crate::Interconnect) holding
//! the identity of its owner (zero when free). Unlike resources, spinlocks are
//! shared by all cores and acquiring one may busy-wait. Spinlocks share the
//! lock chain of their holder with resources.
use ecuos_core::kernel::{
    Caller, GetSpinlockError, LockRef, ReleaseSpinlockError, ServiceId, SpinlockId,
};

use crate::{Kernel, Port, Queue};

/// Extract the core index from a spinlock owner word.
#[inline]
pub(crate) fn owner_core(word: u64) -> Option<usize> {
    ((word >> 32) as usize).checked_sub(1)
}

impl<P: Port, Q: Queue> Kernel<P, Q> {
    /// Acquire `spinlock` (`GetSpinlock`), busy-waiting while another core
    /// holds it.
    ///
    /// Cross-core requests sent to this core are served while waiting.
    pub fn get_spinlock(&mut self, spinlock: SpinlockId) -> Result<(), GetSpinlockError> {
        let result = self.get_spinlock_inner(spinlock, true).map(|_| ());
        self.finish_service(ServiceId::GetSpinlock, &[spinlock.to_raw()], result)
    }

    /// Try to acquire `spinlock` without waiting (`TryToGetSpinlock`).
    /// Returns `Ok(false)` if another core holds it.
    pub fn try_to_get_spinlock(&mut self, spinlock: SpinlockId) -> Result<bool, GetSpinlockError> {
        let result = self.get_spinlock_inner(spinlock, false);
        self.finish_service(ServiceId::TryToGetSpinlock, &[spinlock.to_raw()], result)
    }

    fn get_spinlock_inner(
        &mut self,
        spinlock: SpinlockId,
        wait: bool,
    ) -> Result<bool, GetSpinlockError> {
        let access = self
            .cfg
            .spinlock(spinlock)
            .ok_or(GetSpinlockError::BadId)?
            .access;
        let caller = self.caller().ok_or(GetSpinlockError::Access)?;
        if !self.may_access(None, access) {
            return Err(GetSpinlockError::Access);
        }

        // Spinlocks are taken in the ascending order of their identifiers
        let mut cursor = self.lock_head(caller);
        while let Some(lock) = cursor {
            cursor = match lock {
                LockRef::Resource(r) => self.resources[r.index()].next,
                LockRef::Spinlock(held) if held >= spinlock => {
                    return Err(GetSpinlockError::NestingDeadlock)
                }
                LockRef::Spinlock(held) => self.spinlock_next[held.index()],
            };
        }

        let word = self.spinlock_owner_word(caller);
        loop {
            match self.xc.try_lock_spinlock(spinlock, word) {
                Ok(()) => break,
                Err(owner) if owner_core(owner) == Some(self.core.index()) => {
                    return Err(GetSpinlockError::InterferenceDeadlock);
                }
                Err(_) if !wait => return Ok(false),
                Err(_) => {
                    self.dispatch_lock += 1;
                    self.pump_messages_inner();
                    self.dispatch_lock -= 1;
                    if self.caller() != Some(caller) {
                        // A served request killed the caller
                        return Err(GetSpinlockError::Access);
                    }
                    core::hint::spin_loop();
                }
            }
        }

        self.spinlock_next[spinlock.index()] = self.lock_head(caller);
        self.set_lock_head(caller, Some(LockRef::Spinlock(spinlock)));
        log::trace!("core {}: {caller:?} took {spinlock:?}", self.core.index());
        Ok(true)
    }

    /// Release `spinlock` (`ReleaseSpinlock`). It must be the most recently
    /// acquired lock of the caller.
    pub fn release_spinlock(&mut self, spinlock: SpinlockId) -> Result<(), ReleaseSpinlockError> {
        let result = self.release_spinlock_inner(spinlock);
        self.finish_service(ServiceId::ReleaseSpinlock, &[spinlock.to_raw()], result)
    }

    fn release_spinlock_inner(&mut self, spinlock: SpinlockId) -> Result<(), ReleaseSpinlockError> {
        let access = self
            .cfg
            .spinlock(spinlock)
            .ok_or(ReleaseSpinlockError::BadId)?
            .access;
        let caller = self.caller().ok_or(ReleaseSpinlockError::Access)?;
        if !self.may_access(None, access) {
            return Err(ReleaseSpinlockError::Access);
        }

        let word = self.spinlock_owner_word(caller);
        if self.xc.spinlock_owner(spinlock) != word {
            return Err(ReleaseSpinlockError::State);
        }
        if self.lock_head(caller) != Some(LockRef::Spinlock(spinlock)) {
            return Err(ReleaseSpinlockError::NestingError);
        }

        if !self.xc.release_spinlock(spinlock, word) {
            self.panic_shutdown("spinlock owner changed while held");
        }
        let next = self.spinlock_next[spinlock.index()].take();
        self.set_lock_head(caller, next);
        log::trace!("core {}: {caller:?} released {spinlock:?}", self.core.index());
        Ok(())
    }

    /// The value stored in a spinlock's owner word while `caller` (on this
    /// core) holds it.
    pub(crate) fn spinlock_owner_word(&self, caller: Caller) -> u64 {
        ((self.core.index() as u64 + 1) << 32) | caller.to_raw() as u64
    }
}
