//! Error reporting and fatal shutdown
use core::fmt;
use ecuos_core::kernel::{ErrorInfo, ResultCode, ServiceId};

use crate::{Kernel, Phase, Port, Queue};

#[derive(Debug, Default)]
pub(crate) struct ErrorState {
    last: Option<ErrorInfo>,
    /// `true` while the error hook is running.
    in_hook: bool,
}

impl<P: Port, Q: Queue> Kernel<P, Q> {
    /// Get the most recent error reported on this core.
    ///
    /// <div class="admonition-follows"></div>
    ///
    /// > **Relation to Other Specifications:** `OSErrorGetServiceId` and the
    /// > `OSError_*` parameter access macros of OSEK/VDX.
    ///
    pub fn last_error(&self) -> Option<&ErrorInfo> {
        self.errors.last.as_ref()
    }

    /// Record a failure and forward it to the error hook.
    pub(crate) fn report_error(&mut self, info: ErrorInfo) {
        log::warn!(
            "core {}: {:?}{:?} failed: {:?}",
            self.core.index(),
            info.service,
            &info.params[..],
            info.code
        );

        if !self.errors.in_hook {
            self.errors.in_hook = true;
            self.hooks.error(self.core, &info);
            self.errors.in_hook = false;
        }
        self.errors.last = Some(info);
    }

    /// The common epilogue of a kernel service: report a failure, then give
    /// the dispatcher a chance to switch tasks.
    pub(crate) fn finish_service<T, E>(
        &mut self,
        service: ServiceId,
        params: &[u32],
        result: Result<T, E>,
    ) -> Result<T, E>
    where
        E: Copy + Into<ResultCode>,
    {
        if let Err(e) = &result {
            self.report_error(ErrorInfo::new(service, (*e).into(), params));
        }
        self.reschedule();
        result
    }

    /// Shut down this core because a kernel-internal invariant was violated
    /// or a cross-core message was malformed. Never returns.
    pub(crate) fn panic_shutdown(&mut self, msg: &str) -> ! {
        log::error!("core {}: fatal: {msg}", self.core.index());
        if self.phase != Phase::ShutDown {
            self.phase = Phase::ShutDown;
            self.xc.mark_shut_down(self.core);
            self.hooks.shutdown(self.core, ResultCode::SysFatal);
        }
        panic!("{msg}");
    }

    /// Unwrap the result of an operation on an internal data structure,
    /// treating a failure as corruption.
    pub(crate) fn expect_consistent<T, E: fmt::Debug>(
        &mut self,
        result: Result<T, E>,
        what: &str,
    ) -> T {
        match result {
            Ok(x) => x,
            Err(e) => {
                log::error!("{what}: {e:?}");
                self.panic_shutdown(what)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::*;
    use ecuos_core::kernel::{cfg::*, *};

    #[test]
    fn error_is_recorded_and_hooked() {
        let mut b = CfgBuilder::new(1);
        let main = TaskDescriptor::build()
            .priority(1)
            .autostart(AppModeSet::DEFAULT)
            .finish(&mut b);
        let (mut k, hooks) = boot(b);
        assert_eq!(k.get_task_id(), Some(main));

        assert_eq!(
            k.activate_task(TaskId::new(9)),
            Err(ActivateTaskError::BadId)
        );
        let info = k.last_error().unwrap().clone();
        assert_eq!(info.service, ServiceId::ActivateTask);
        assert_eq!(info.code, ResultCode::BadId);
        assert_eq!(&info.params[..], &[9]);
        assert_eq!(hooks.errors(), vec![info]);
    }

    #[test]
    fn error_hook_is_not_reentered() {
        let mut b = CfgBuilder::new(1);
        TaskDescriptor::build()
            .priority(1)
            .autostart(AppModeSet::DEFAULT)
            .finish(&mut b);
        let (mut k, hooks) = boot(b);

        // Simulate a failure reported while the hook is running
        k.errors.in_hook = true;
        let _ = k.cancel_alarm(AlarmId::new(0));
        k.errors.in_hook = false;

        assert!(hooks.errors().is_empty());
        assert_eq!(k.last_error().unwrap().service, ServiceId::CancelAlarm);
    }

    #[test]
    #[should_panic(expected = "ready queue")]
    fn panic_shutdown_calls_shutdown_hook() {
        let mut b = CfgBuilder::new(1);
        TaskDescriptor::build().priority(1).finish(&mut b);
        let (mut k, _hooks) = boot(b);
        k.expect_consistent(Err::<(), _>("boom"), "ready queue corrupted");
    }
}
