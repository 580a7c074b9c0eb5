//! Object identifiers and scalar types
use core::fmt;

/// Task priority. A larger value means a higher urgency.
pub type Priority = u16;

/// Counter value, alarm offset, or schedule table offset, measured in counter
/// ticks.
pub type Tick = u32;

/// A set of events of an extended task.
pub type EventMask = u32;

macro_rules! define_id {
    ($(
        $( #[$meta:meta] )*
        pub struct $name:ident;
    )*) => {$(
        $( #[$meta] )*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u16);

        impl $name {
            /// Construct an identifier from a zero-based index into the
            /// corresponding configuration table.
            #[inline]
            pub const fn new(index: u16) -> Self {
                Self(index)
            }

            /// Construct an identifier from a `usize` index.
            ///
            /// # Panics
            ///
            /// Panics if `index` does not fit in `u16`.
            #[inline]
            pub const fn from_index(index: usize) -> Self {
                assert!(index <= u16::MAX as usize, "identifier out of range");
                Self(index as u16)
            }

            /// Get the zero-based index into the corresponding configuration
            /// table.
            #[inline]
            pub const fn index(self) -> usize {
                self.0 as usize
            }

            /// Get the raw value for embedding in a cross-core message.
            #[inline]
            pub const fn to_raw(self) -> u32 {
                self.0 as u32
            }

            /// Reconstruct an identifier from a cross-core message word. The
            /// result is not validated against a configuration.
            #[inline]
            pub fn from_raw(raw: u32) -> Option<Self> {
                u16::try_from(raw).ok().map(Self)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    )*};
}

define_id! {
    /// Identifies a task.
    pub struct TaskId;
    /// Identifies a category 2 interrupt service routine.
    pub struct IsrId;
    /// Identifies a resource (a priority-ceiling mutex local to a core).
    pub struct ResourceId;
    /// Identifies a counter.
    pub struct CounterId;
    /// Identifies an alarm.
    pub struct AlarmId;
    /// Identifies a schedule table.
    pub struct ScheduleTableId;
    /// Identifies an OS-application.
    pub struct ApplicationId;
    /// Identifies a spinlock shared by all cores.
    pub struct SpinlockId;
    /// Identifies a processor core.
    pub struct CoreId;
    /// Identifies a hardware timer provided by a port.
    pub struct HwTimerId;
    /// Identifies an application mode.
    pub struct AppMode;
}

/// The entity on whose behalf a kernel service is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Caller {
    Task(TaskId),
    Isr(IsrId),
}

impl Caller {
    /// Pack into a single message word. Tasks and ISRs are distinguished by
    /// the top bit.
    pub const fn to_raw(self) -> u32 {
        match self {
            Self::Task(t) => t.to_raw(),
            Self::Isr(i) => i.to_raw() | 0x8000_0000,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        if raw & 0x8000_0000 != 0 {
            IsrId::from_raw(raw & 0x7fff_ffff).map(Self::Isr)
        } else {
            TaskId::from_raw(raw).map(Self::Task)
        }
    }
}

/// An element of a lock chain. A task (or ISR) owns a chain of the resources
/// and spinlocks it currently holds, the most recently acquired first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockRef {
    Resource(ResourceId),
    Spinlock(SpinlockId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_raw_round_trip() {
        for caller in [
            Caller::Task(TaskId::new(0)),
            Caller::Task(TaskId::new(65535)),
            Caller::Isr(IsrId::new(0)),
            Caller::Isr(IsrId::new(42)),
        ] {
            assert_eq!(Caller::from_raw(caller.to_raw()), Some(caller));
        }
    }

    #[test]
    fn from_raw_rejects_wide_values() {
        assert_eq!(TaskId::from_raw(0x1_0000), None);
        assert_eq!(AlarmId::from_raw(7), Some(AlarmId::new(7)));
    }

    #[test]
    fn debug_format() {
        assert_eq!(format!("{:?}", CounterId::new(3)), "CounterId(3)");
    }
}
