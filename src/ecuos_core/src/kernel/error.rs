use arrayvec::ArrayVec;
use core::fmt;

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// All result codes in the ascending order of their values.
            pub const ALL: &'static [Self] = &[$( Self::$vname ),*];

            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use ecuos_core::kernel::ResultCode;
            /// assert_eq!(ResultCode::Limit.as_str(), "Limit");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            /// Reconstruct a result code from its numeric value (`StatusType`).
            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $(
                        x if x == Self::$vname as u8 => Some(Self::$vname),
                    )*
                    _ => None,
                }
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

define_result_code! {
    /// All status codes (including success) that a kernel service can
    /// produce.
    ///
    /// <div class="admonition-follows"></div>
    ///
    /// > **Relation to Other Specifications:** The first nine codes are the
    /// > OSEK/VDX `StatusType` values `E_OK` through `E_OS_VALUE` in their
    /// > standard order. The rest are the AUTOSAR OS extensions this kernel
    /// > reports.
    ///
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(u8)]
    pub enum ResultCode {
        /// The operation was successful (`E_OK`).
        Success = 0,
        /// The caller has no access right to the object, the object's
        /// application is not accessible, or the object is not usable in the
        /// way requested (`E_OS_ACCESS`).
        Access = 1,
        /// The service is not allowed in the current calling context, e.g.,
        /// from an interrupt service routine (`E_OS_CALLEVEL`).
        CallLevel = 2,
        /// The object identifier is invalid (`E_OS_ID`).
        BadId = 3,
        /// The activation limit of a task was reached (`E_OS_LIMIT`).
        Limit = 4,
        /// The object is not in a state the operation applies to: an alarm
        /// that is not armed, a resource that is not the most recently
        /// acquired, a schedule table that is not running (`E_OS_NOFUNC`).
        NoFunc = 5,
        /// The caller still occupies resources (`E_OS_RESOURCE`).
        Resource = 6,
        /// The object is in a state that disallows the operation
        /// (`E_OS_STATE`).
        State = 7,
        /// A value is outside of the admissible range (`E_OS_VALUE`).
        Value = 8,
        /// The service cannot be called (`E_OS_SERVICEID`).
        ServiceId = 9,
        /// A task returned without calling `TerminateTask` or `ChainTask`
        /// (`E_OS_MISSINGEND`).
        MissingEnd = 10,
        /// A service was called while interrupts are disabled
        /// (`E_OS_DISABLEDINT`).
        DisabledInt = 11,
        /// A task or ISR exceeded its execution budget
        /// (`E_OS_PROTECTION_TIME`).
        ProtectionTime = 12,
        /// A task or ISR held a lock for too long
        /// (`E_OS_PROTECTION_LOCKED`).
        ProtectionLocked = 13,
        /// The target core is not running (`E_OS_CORE`).
        Core = 14,
        /// A task terminated while holding a spinlock (`E_OS_SPINLOCK`).
        Spinlock = 15,
        /// The spinlock is held by a task or ISR of the calling core
        /// (`E_OS_INTERFERENCE_DEADLOCK`).
        InterferenceDeadlock = 16,
        /// Spinlocks were requested out of the configured order
        /// (`E_OS_NESTING_DEADLOCK`).
        NestingDeadlock = 17,
        /// A kernel-internal invariant was violated or the cross-core
        /// protocol was corrupted. Only passed to the shutdown hook.
        SysFatal = 18,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    #[inline]
    pub fn is_err(self) -> bool {
        self != Self::Success
    }

    /// Get a flag indicating whether the code represents a success.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

impl From<ResultCode> for u8 {
    #[inline]
    fn from(x: ResultCode) -> Self {
        x as u8
    }
}

/// Resolve the [`ResultCode`] that a [`define_error!`] variant maps to.
macro_rules! result_code_of {
    ($vname:ident) => {
        ResultCode::$vname
    };
    ($vname:ident $code:ident) => {
        ResultCode::$code
    };
}

/// Define a per-service error type.
///
/// Each variant shares its discriminant with the [`ResultCode`] of the same
/// name, or with the code named after `=` when the service gives the
/// condition a more specific name (e.g., `NotInUse = NoFunc`).
macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident $(= $code:ident)?
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = result_code_of!($vname $($code)?) as u8
            ),*
        }

        impl $name {
            /// Get the variant name.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                match x {
                    $(
                        $name::$vname => result_code_of!($vname $($code)?),
                    )*
                }
            }
        }

        impl TryFrom<ResultCode> for $name {
            /// The code is not a member of this error type.
            type Error = ResultCode;

            fn try_from(x: ResultCode) -> Result<Self, ResultCode> {
                $(
                    if x == result_code_of!($vname $($code)?) {
                        return Ok(Self::$vname);
                    }
                )*
                Err(x)
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        result_code_of!($vname $($code)?),
                        ResultCode::from($name::$vname),
                    );
                    assert_eq!(
                        result_code_of!($vname $($code)?) as u8,
                        $name::$vname as u8,
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        result_code_of!($vname $($code)?),
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }

            #[test]
            fn from_result_code() {
                $(
                    assert_eq!(
                        $name::try_from(result_code_of!($vname $($code)?)),
                        Ok($name::$vname),
                    );
                )*
                assert_eq!($name::try_from(ResultCode::Success), Err(ResultCode::Success));
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $(
                                $name::$vname => Self::$vname,
                            )*
                        }
                    }
                }
            };
        }
    };
}

define_error! {
    mod activate_task_error {}
    /// Error type for `ActivateTask`.
    pub enum ActivateTaskError {
        /// The task identifier is invalid.
        BadId,
        /// The caller may not access the task, or the task's application is
        /// not accessible.
        Access,
        /// The task already has the maximum number of pending activations.
        Limit,
        /// The task lives on a core that is not running.
        Core,
    }
}

define_error! {
    mod terminate_task_error {}
    /// Error type for `TerminateTask`.
    pub enum TerminateTaskError {
        /// The caller is not a task.
        CallLevel,
    }
}

define_error! {
    mod chain_task_error {}
    /// Error type for `ChainTask`.
    pub enum ChainTaskError: TerminateTaskError {
        /// The task identifier is invalid.
        BadId,
        /// The caller may not access the task.
        Access,
        /// The successor already has the maximum number of pending
        /// activations.
        Limit,
        /// The caller is not a task.
        CallLevel,
        /// The successor lives on a core that is not running.
        Core,
    }
}

define_error! {
    mod schedule_error {}
    /// Error type for `Schedule`.
    pub enum ScheduleError: TerminateTaskError {
        /// The caller is not a task.
        CallLevel,
        /// The caller occupies a resource.
        Resource,
    }
}

define_error! {
    mod get_task_state_error {}
    /// Error type for `GetTaskState`.
    pub enum GetTaskStateError {
        BadId,
        Access,
        Core,
    }
}

define_error! {
    mod get_resource_error {}
    /// Error type for `GetResource`.
    pub enum GetResourceError {
        /// The resource identifier is invalid.
        BadId,
        /// The caller may not access the resource, the resource belongs to
        /// another core, the resource is occupied, or the caller's static
        /// priority is higher than the ceiling.
        Access,
        /// The caller's most recent lock is a spinlock. Resources may not be
        /// nested inside spinlocks.
        NestingError = NoFunc,
    }
}

define_error! {
    mod release_resource_error {}
    /// Error type for `ReleaseResource`.
    pub enum ReleaseResourceError {
        /// The resource identifier is invalid.
        BadId,
        /// The caller may not access the resource, or its ceiling is lower
        /// than the caller's static priority.
        Access,
        /// The resource is not occupied by the caller, or it is not the
        /// caller's most recently acquired lock.
        NestingError = NoFunc,
    }
}

define_error! {
    mod set_event_error {}
    /// Error type for `SetEvent`.
    pub enum SetEventError {
        BadId,
        /// The caller may not access the task, or the task is a basic task.
        Access,
        /// The task is in the Suspended state.
        State,
        Core,
    }
}

define_error! {
    mod get_event_error {}
    /// Error type for `GetEvent`.
    pub enum GetEventError {
        BadId,
        /// The caller may not access the task, or the task is a basic task.
        Access,
        /// The task is in the Suspended state.
        State,
        Core,
    }
}

define_error! {
    mod clear_event_error {}
    /// Error type for `ClearEvent`.
    pub enum ClearEventError {
        /// The caller is a basic task.
        Access,
        /// The caller is not a task.
        CallLevel,
    }
}

define_error! {
    mod wait_event_error {}
    /// Error type for `WaitEvent`.
    pub enum WaitEventError {
        /// The caller is a basic task.
        Access,
        /// The caller is not a task.
        CallLevel,
        /// The caller occupies a resource or a spinlock.
        Resource,
    }
}

define_error! {
    mod increment_counter_error {}
    /// Error type for `IncrementCounter`.
    pub enum IncrementCounterError {
        /// The counter identifier is invalid, or the counter is a hardware
        /// counter.
        BadId,
        Access,
        /// The counter belongs to another core.
        Core,
    }
}

define_error! {
    mod get_counter_value_error {}
    /// Error type for `GetCounterValue`.
    pub enum GetCounterValueError {
        BadId,
        Access,
        Core,
    }
}

define_error! {
    mod get_elapsed_value_error {}
    /// Error type for `GetElapsedValue`.
    pub enum GetElapsedValueError {
        BadId,
        Access,
        /// The previous value exceeds the counter's `maxallowedvalue`.
        OutOfRange = Value,
        /// The counter belongs to another core.
        Core,
    }
}

define_error! {
    mod get_alarm_base_error {}
    /// Error type for `GetAlarmBase`.
    pub enum GetAlarmBaseError {
        BadId,
        Access,
    }
}

define_error! {
    mod get_alarm_error {}
    /// Error type for `GetAlarm`.
    pub enum GetAlarmError {
        BadId,
        Access,
        /// The alarm is not armed.
        NotInUse = NoFunc,
        Core,
    }
}

define_error! {
    mod set_alarm_error {}
    /// Error type for `SetRelAlarm` and `SetAbsAlarm`.
    pub enum SetAlarmError {
        BadId,
        Access,
        /// The alarm is already armed.
        InUse = State,
        /// The offset or the cycle is outside of the counter's limits.
        OutOfRange = Value,
        Core,
    }
}

define_error! {
    mod cancel_alarm_error {}
    /// Error type for `CancelAlarm`.
    pub enum CancelAlarmError {
        BadId,
        Access,
        /// The alarm is not armed.
        NotInUse = NoFunc,
        Core,
    }
}

define_error! {
    mod start_schedule_table_error {}
    /// Error type for `StartScheduleTableRel`, `StartScheduleTableAbs`, and
    /// `StartScheduleTableSynchron`.
    pub enum StartScheduleTableError {
        /// The identifier is invalid, or the table's synchronization
        /// strategy does not permit the requested kind of start.
        BadId,
        Access,
        /// The table is not stopped, or another table is running on the same
        /// counter.
        State,
        /// The offset is zero or beyond the counter's limit.
        OutOfRange = Value,
        Core,
    }
}

define_error! {
    mod stop_schedule_table_error {}
    /// Error type for `StopScheduleTable`.
    pub enum StopScheduleTableError {
        BadId,
        Access,
        /// The table is already stopped.
        NotRunning = NoFunc,
        Core,
    }
}

define_error! {
    mod chain_schedule_table_error {}
    /// Error type for `ChainScheduleTable`.
    pub enum ChainScheduleTableError {
        /// An identifier is invalid, or the tables are driven by different
        /// counters.
        BadId,
        Access,
        /// The current table is not running.
        NotRunning = NoFunc,
        /// The next table is not stopped.
        State,
        Core,
    }
}

define_error! {
    mod sync_schedule_table_error {}
    /// Error type for `SyncScheduleTable`.
    pub enum SyncScheduleTableError {
        /// The identifier is invalid, or the table is not explicitly
        /// synchronizable.
        BadId,
        Access,
        /// The table is stopped or chained (not yet started).
        State,
        /// The global time is not less than the table's duration.
        OutOfRange = Value,
        Core,
    }
}

define_error! {
    mod set_schedule_table_async_error {}
    /// Error type for `SetScheduleTableAsync`.
    pub enum SetScheduleTableAsyncError {
        /// The identifier is invalid, or the table is not explicitly
        /// synchronizable.
        BadId,
        Access,
        /// The table is not running.
        State,
        Core,
    }
}

define_error! {
    mod get_schedule_table_status_error {}
    /// Error type for `GetScheduleTableStatus`.
    pub enum GetScheduleTableStatusError {
        BadId,
        Access,
        Core,
    }
}

define_error! {
    mod get_spinlock_error {}
    /// Error type for `GetSpinlock` and `TryToGetSpinlock`.
    pub enum GetSpinlockError {
        BadId,
        Access,
        /// The spinlock is held by a task or ISR on the calling core.
        InterferenceDeadlock,
        /// The caller already holds a spinlock that must be taken after this
        /// one, or holds this one.
        NestingDeadlock,
    }
}

define_error! {
    mod release_spinlock_error {}
    /// Error type for `ReleaseSpinlock`.
    pub enum ReleaseSpinlockError {
        BadId,
        Access,
        /// The spinlock is not held by the caller.
        State,
        /// The spinlock is not the caller's most recently acquired lock.
        NestingError = NoFunc,
    }
}

define_error! {
    mod terminate_application_error {}
    /// Error type for `TerminateApplication`.
    pub enum TerminateApplicationError {
        BadId,
        /// The caller neither belongs to the application nor to a trusted
        /// application.
        Access,
        /// The application is already quarantined, or it is restarting and
        /// the caller is not its restart task.
        State,
        /// The application has no restart task but a restart was requested.
        Value,
        Core,
    }
}

define_error! {
    mod allow_access_error {}
    /// Error type for `AllowAccess`.
    pub enum AllowAccessError {
        /// The caller's application is not restarting.
        State,
        /// The caller does not belong to an application.
        CallLevel,
    }
}

define_error! {
    mod get_application_state_error {}
    /// Error type for `GetApplicationState`.
    pub enum GetApplicationStateError {
        BadId,
        Core,
    }
}

define_error! {
    mod get_cpu_load_error {}
    /// Error type for `GetCpuLoad`.
    pub enum GetCpuLoadError {
        /// The core identifier is invalid.
        BadId,
        Core,
    }
}

define_error! {
    mod start_os_error {}
    /// Error type for `StartOS`.
    pub enum StartOsError {
        /// The application mode is invalid.
        BadId,
        /// The core has already been started.
        State,
    }
}

/// Identifies a kernel service in [`ErrorInfo`] (`OSServiceIdType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ServiceId {
    ActivateTask,
    TerminateTask,
    ChainTask,
    Schedule,
    GetTaskState,
    GetResource,
    ReleaseResource,
    SetEvent,
    ClearEvent,
    GetEvent,
    WaitEvent,
    IncrementCounter,
    GetCounterValue,
    GetElapsedValue,
    GetAlarmBase,
    GetAlarm,
    SetRelAlarm,
    SetAbsAlarm,
    CancelAlarm,
    StartScheduleTableRel,
    StartScheduleTableAbs,
    StartScheduleTableSynchron,
    StopScheduleTable,
    ChainScheduleTable,
    SyncScheduleTable,
    SetScheduleTableAsync,
    GetScheduleTableStatus,
    GetSpinlock,
    TryToGetSpinlock,
    ReleaseSpinlock,
    TerminateApplication,
    AllowAccess,
    GetApplicationState,
    GetCpuLoad,
    StartOs,
    /// An action executed on expiry of an alarm or a schedule table point.
    AlarmAction,
    /// A kernel-initiated task termination (missing `TerminateTask`, ISR
    /// returning with locks held).
    TaskReturn,
    IsrReturn,
}

/// The details of the most recent error reported on a core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub service: ServiceId,
    pub code: ResultCode,
    /// The raw parameters of the failing call (object identifiers first).
    pub params: ArrayVec<u32, 3>,
}

impl ErrorInfo {
    pub fn new(service: ServiceId, code: ResultCode, params: &[u32]) -> Self {
        Self {
            service,
            code,
            params: params.iter().copied().take(3).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_u8_round_trip() {
        for &code in ResultCode::ALL {
            assert_eq!(ResultCode::from_u8(code as u8), Some(code));
        }
        assert_eq!(ResultCode::from_u8(200), None);
    }

    #[test]
    fn alias_shares_discriminant() {
        assert_eq!(
            ResultCode::from(CancelAlarmError::NotInUse),
            ResultCode::NoFunc
        );
        assert_eq!(SetAlarmError::InUse as u8, ResultCode::State as u8);
        assert_eq!(format!("{:?}", SetAlarmError::OutOfRange), "OutOfRange");
    }

    #[test]
    fn sub_error_conversion() {
        assert_eq!(
            ChainTaskError::from(TerminateTaskError::CallLevel),
            ChainTaskError::CallLevel
        );
        assert_eq!(
            ScheduleError::from(TerminateTaskError::CallLevel),
            ScheduleError::CallLevel
        );
    }

    #[test]
    fn error_info_truncates_params() {
        let info = ErrorInfo::new(ServiceId::SetRelAlarm, ResultCode::Value, &[1, 2, 3, 4]);
        assert_eq!(&info.params[..], &[1, 2, 3]);
    }
}
