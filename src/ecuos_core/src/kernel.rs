//! The kernel interface.
#[macro_use]
mod error;
pub mod cfg;
mod hook;
mod hwtimer;
mod id;
mod state;
pub use self::{error::*, hook::*, hwtimer::*, id::*, state::*};

/// The prelude module. This module re-exports the identifier types and the
/// status code types.
pub mod prelude {
    #[doc(no_inline)]
    pub use super::{
        AlarmId, ApplicationId, CoreId, CounterId, EventMask, IsrId, Priority, ResourceId,
        ResultCode, ScheduleTableId, SpinlockId, TaskId, Tick,
    };
}
