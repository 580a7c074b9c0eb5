//! Hooks
use super::{CoreId, ErrorInfo, Caller, ResultCode, TaskId};

/// The decision returned by [`Hooks::protection`] (`ProtectionReturnType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectionAction {
    /// The faulting task or ISR has already been killed; nothing else is
    /// done (`PRO_TERMINATETASKISR`).
    Continue,
    /// Terminate the faulting application and quarantine it
    /// (`PRO_TERMINATEAPPL`).
    QuarantineApplication,
    /// Terminate the faulting application and restart it
    /// (`PRO_TERMINATEAPPL_RESTART`).
    RestartApplication,
    /// Shut down the system (`PRO_SHUTDOWN`).
    Shutdown,
}

/// The application callouts invoked by the kernel at well-defined transition
/// points.
///
/// Hooks run inside the kernel on the core identified by `core` and must not
/// call kernel services. All methods have empty default implementations, so
/// an implementor only overrides the hooks it is interested in.
///
/// <div class="admonition-follows"></div>
///
/// > **Relation to Other Specifications:** `StartupHook`, `ShutdownHook`,
/// > `ErrorHook`, `PreTaskHook`, `PostTaskHook` (OSEK/VDX), and
/// > `ProtectionHook` (AUTOSAR OS).
///
pub trait Hooks: Send + Sync {
    /// Called once per core after autostart objects were set up and before
    /// the first task is dispatched.
    fn startup(&self, _core: CoreId) {}

    /// Called when the core shuts down.
    fn shutdown(&self, _core: CoreId, _code: ResultCode) {}

    /// Called when a kernel service fails. Not called recursively: errors
    /// reported while the hook is running are recorded but not forwarded.
    fn error(&self, _core: CoreId, _info: &ErrorInfo) {}

    /// Called after a protection violation. `culprit` has already been killed
    /// and its locks released when this is called.
    fn protection(
        &self,
        _core: CoreId,
        _fatal: ResultCode,
        _culprit: Option<Caller>,
    ) -> ProtectionAction {
        ProtectionAction::QuarantineApplication
    }

    /// Called after `task` enters the Running state.
    fn pre_task(&self, _core: CoreId, _task: TaskId) {}

    /// Called before `task` leaves the Running state.
    fn post_task(&self, _core: CoreId, _task: TaskId) {}
}

/// A [`Hooks`] implementation that uses the default behavior everywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl Hooks for NoHooks {}
