//! Observable object states

/// The state of a task.
///
/// <center>
///
#[doc = svgbobdoc::transform!(
/// ```svgbob
///                      .-------.
///    .---------------->| Ready |<-------------------.
///    |                 '-------'                    |
///    |           dispatch | ^                       |
///    | set event          | |                       | activate
/// .---------.             | |               .-----------.
/// | Waiting |             | |               | Suspended |
/// '---------'             | |               '-----------'
///    ^                    | |                       ^
///    |                    v | preempt               |
///    |           wait .---------.                   |
///    '----------------| Running |-------------------'
///                     '---------' terminate / kill
/// ```
)]
///
/// </center>
///
/// A task of a quarantined application is `Quarantined` and cannot be
/// activated until the application is restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Suspended,
    Quarantined,
    /// Activated but not started yet. Reported as [`Self::Ready`] by
    /// `GetTaskState`.
    New,
    Ready,
    Running,
    /// Waiting for an event.
    Waiting,
}

impl TaskState {
    /// The state as reported by `GetTaskState`.
    pub fn reported(self) -> Self {
        match self {
            Self::New => Self::Ready,
            x => x,
        }
    }

    pub(crate) fn to_raw(self) -> u32 {
        self as u32
    }

    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        [
            Self::Suspended,
            Self::Quarantined,
            Self::New,
            Self::Ready,
            Self::Running,
            Self::Waiting,
        ]
        .get(raw as usize)
        .copied()
    }
}

/// The status of a schedule table (`ScheduleTableStatusType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleTableStatus {
    Stopped,
    /// Chained behind a running table; it starts when that table finishes
    /// its round.
    Next,
    /// Started with `StartScheduleTableSynchron` and waiting for the first
    /// synchronization.
    Waiting,
    Running,
    RunningAndSynchronous,
}

impl ScheduleTableStatus {
    /// Get a flag indicating whether the table is processing expiry points
    /// (or about to, in the case of `Waiting`).
    pub fn is_started(self) -> bool {
        matches!(
            self,
            Self::Waiting | Self::Running | Self::RunningAndSynchronous
        )
    }

    /// Get a flag indicating whether the table is `Running` or
    /// `RunningAndSynchronous`.
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running | Self::RunningAndSynchronous)
    }

    pub(crate) fn to_raw(self) -> u32 {
        self as u32
    }

    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        [
            Self::Stopped,
            Self::Next,
            Self::Waiting,
            Self::Running,
            Self::RunningAndSynchronous,
        ]
        .get(raw as usize)
        .copied()
    }
}

/// The state of an OS-application (`ApplicationStateType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplicationState {
    Accessible,
    /// Terminated with restart; waiting for the restart task to call
    /// `AllowAccess`.
    Restarting,
    /// Terminated without restart.
    Quarantined,
}

impl ApplicationState {
    pub(crate) fn to_raw(self) -> u32 {
        self as u32
    }

    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        [Self::Accessible, Self::Restarting, Self::Quarantined]
            .get(raw as usize)
            .copied()
    }
}

/// Conversion of state enums to and from cross-core message words.
pub trait RawState: Sized {
    fn to_raw_word(self) -> u32;
    fn from_raw_word(raw: u32) -> Option<Self>;
}

macro_rules! impl_raw_state {
    ($($ty:ty),*) => {$(
        impl RawState for $ty {
            #[inline]
            fn to_raw_word(self) -> u32 {
                self.to_raw()
            }

            #[inline]
            fn from_raw_word(raw: u32) -> Option<Self> {
                Self::from_raw(raw)
            }
        }
    )*};
}

impl_raw_state!(TaskState, ScheduleTableStatus, ApplicationState);
