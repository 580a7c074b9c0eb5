//! Task ready queue implementation (internal use only).
//!
//! **This module is exempt from the API stability guarantee.**
//!
//! The queue stores *activation records* rather than tasks. Each task owns
//! `max_activations` records, and every pending activation occupies one of
//! them, so activations of different tasks at the same priority are served in
//! the order they were made.
use alloc::{vec, vec::Vec};
use core::fmt;
use ecuos_core::kernel::Priority;

use crate::utils::{
    intrusive_list::{InconsistentError, Link, ListAccessor, ListHead},
    DynPrioBitmap, PrioBitmap,
};

/// Represents a task ready queue, which tracks a list of activation records,
/// sorted by priority order.
///
/// This trait is not intended to be implemented on custom types.
pub trait Queue: fmt::Debug + Send + private::Sealed {
    /// Construct an empty queue for `num_records` activation records and
    /// `num_priority_levels` priority levels.
    fn new(num_records: usize, num_priority_levels: usize) -> Self
    where
        Self: Sized;

    /// Insert `record` as close to the back as possible without violating
    /// the priority ordering.
    fn push_back(&mut self, record: usize, priority: Priority) -> Result<(), InconsistentError>;

    /// Insert `record` as close to the front as possible without violating
    /// the priority ordering. Used for a preempted task, which is the oldest
    /// ready task of its priority.
    fn push_front(&mut self, record: usize, priority: Priority) -> Result<(), InconsistentError>;

    /// Choose the next record to schedule based on `prev_task_priority`, the
    /// priority of the running task, or `None` if there's no running task
    /// that can continue.
    ///
    /// | `prev_task_priority` | Highest queued priority |        Returns      |
    /// | -------------------- | ----------------------- | ------------------- |
    /// |        `None`        |          none           |  `SwitchTo(None)`   |
    /// |        `None`        |          `n`            | `SwitchTo(Some(_))` |
    /// |       `Some(p)`      |          none           |       `Keep`        |
    /// |       `Some(p)`      |        `n <= p`         |       `Keep`        |
    /// |       `Some(p)`      |        `n > p`          | `SwitchTo(Some(_))` |
    ///
    /// If this method returns `SwitchTo(Some(record))`, `record` is removed
    /// from the queue.
    fn pop_front(
        &mut self,
        prev_task_priority: Option<Priority>,
    ) -> Result<ScheduleDecision<usize>, InconsistentError>;

    /// Remove `record` from anywhere in the queue. Returns `false` if it's not
    /// in the queue.
    fn remove(&mut self, record: usize) -> Result<bool, InconsistentError>;

    /// Get the highest priority among the queued records.
    fn highest_priority(&self) -> Option<Priority>;

    /// Return a flag indicating whether there's a ready record whose
    /// priority is higher than `priority`.
    #[inline]
    fn has_ready_task_above(&self, priority: Priority) -> bool {
        self.highest_priority().is_some_and(|p| p > priority)
    }
}

/// Implements [the sealed trait pattern], which prevents [`Queue`] against
/// downstream implementations.
///
/// [the sealed trait pattern]: https://rust-lang.github.io/api-guidelines/future-proofing.html
mod private {
    pub trait Sealed {}
}

/// The result type of [`Queue::pop_front`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision<T> {
    /// The kernel should not perform context switch and should continue to
    /// schedule the current task.
    Keep,
    /// The kernel should perform context switch to the specified task.
    SwitchTo(Option<T>),
}

/// The ready queue implementation that uses a set of queues segregated by the
/// priorities of contained records.
pub struct BitmapQueue {
    /// The set of segregated ready queues, in which each queue stores the
    /// list of ready records at the corresponding priority.
    ///
    /// Invariant: `queues[i].first.is_some() == bitmap.get(i)`
    queues: Vec<ListHead>,

    /// The links of every activation record.
    links: Vec<Option<Link>>,

    /// The priority each linked record was inserted with.
    priorities: Vec<Priority>,

    /// The ready bitmap, in which each bit indicates whether the segregated
    /// queue corresponding to that bit contains a record or not.
    bitmap: DynPrioBitmap,
}

impl BitmapQueue {
    fn accessor(&mut self, priority: Priority) -> ListAccessor<'_> {
        ListAccessor::new(&mut self.queues[priority as usize], &mut self.links)
    }
}

impl Queue for BitmapQueue {
    fn new(num_records: usize, num_priority_levels: usize) -> Self {
        Self {
            queues: vec![ListHead::new(); num_priority_levels],
            links: vec![None; num_records],
            priorities: vec![0; num_records],
            bitmap: DynPrioBitmap::new(num_priority_levels),
        }
    }

    fn push_back(&mut self, record: usize, priority: Priority) -> Result<(), InconsistentError> {
        self.accessor(priority)
            .push_back(record)
            .map_err(|_| InconsistentError)?;
        self.priorities[record] = priority;

        // Update `bitmap` accordingly
        self.bitmap.set(priority as usize);
        Ok(())
    }

    fn push_front(&mut self, record: usize, priority: Priority) -> Result<(), InconsistentError> {
        self.accessor(priority)
            .push_front(record)
            .map_err(|_| InconsistentError)?;
        self.priorities[record] = priority;
        self.bitmap.set(priority as usize);
        Ok(())
    }

    fn pop_front(
        &mut self,
        prev_task_priority: Option<Priority>,
    ) -> Result<ScheduleDecision<usize>, InconsistentError> {
        let Some(next_priority) = self.bitmap.find_set() else {
            return Ok(if prev_task_priority.is_some() {
                ScheduleDecision::Keep
            } else {
                ScheduleDecision::SwitchTo(None)
            });
        };
        let next_priority = next_priority as Priority;

        if prev_task_priority.is_some_and(|p| p >= next_priority) {
            // Return if there's no record willing to take over the current
            // task, and the current one can still run.
            return Ok(ScheduleDecision::Keep);
        }

        let mut accessor = self.accessor(next_priority);
        // There must be at least one element, because the bitmap indicated so
        let record = accessor.pop_front()?.ok_or(InconsistentError)?;

        // Update `bitmap` accordingly
        if accessor.is_empty() {
            self.bitmap.clear(next_priority as usize);
        }

        Ok(ScheduleDecision::SwitchTo(Some(record)))
    }

    fn remove(&mut self, record: usize) -> Result<bool, InconsistentError> {
        if !matches!(self.links.get(record), Some(Some(_))) {
            return Ok(false);
        }

        let priority = self.priorities[record];
        let mut accessor = self.accessor(priority);
        accessor.remove(record).map_err(|_| InconsistentError)?;
        if accessor.is_empty() {
            self.bitmap.clear(priority as usize);
        }
        Ok(true)
    }

    #[inline]
    fn highest_priority(&self) -> Option<Priority> {
        self.bitmap.find_set().map(|p| p as Priority)
    }
}

impl private::Sealed for BitmapQueue {}

impl fmt::Debug for BitmapQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        struct Records<'a>(&'a BitmapQueue, ListHead);

        impl fmt::Debug for Records<'_> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                let mut list = f.debug_list();
                let mut next = self.1.first;
                while let Some(i) = next {
                    list.entry(&i);
                    next = self.0.links[i]
                        .map(|l| l.next)
                        .filter(|&n| Some(n) != self.1.first);
                }
                list.finish()
            }
        }

        f.write_str("BitmapQueue ")?;
        f.debug_map()
            .entries(
                self.queues
                    .iter()
                    .enumerate()
                    .filter(|(_, head)| !head.is_empty())
                    .map(|(i, &head)| (i, Records(self, head))),
            )
            .finish()
    }
}

/// The ready queue implementation that keeps all ready records in a single
/// list sorted by priority. Insertion is linear in the number of ready
/// records; everything else is constant-time.
pub struct ListQueue {
    head: ListHead,
    links: Vec<Option<Link>>,
    priorities: Vec<Priority>,
}

impl ListQueue {
    fn accessor(&mut self) -> ListAccessor<'_> {
        ListAccessor::new(&mut self.head, &mut self.links)
    }

    /// Find the first record satisfying `pred`.
    fn find(&self, pred: impl Fn(Priority) -> bool) -> Option<usize> {
        let mut next = self.head.first;
        while let Some(i) = next {
            if pred(self.priorities[i]) {
                return Some(i);
            }
            next = self.links[i]
                .map(|l| l.next)
                .filter(|&n| Some(n) != self.head.first);
        }
        None
    }
}

impl Queue for ListQueue {
    fn new(num_records: usize, _num_priority_levels: usize) -> Self {
        Self {
            head: ListHead::new(),
            links: vec![None; num_records],
            priorities: vec![0; num_records],
        }
    }

    fn push_back(&mut self, record: usize, priority: Priority) -> Result<(), InconsistentError> {
        let at = self.find(|p| p < priority);
        self.priorities[record] = priority;
        self.accessor()
            .insert(record, at)
            .map_err(|_| InconsistentError)
    }

    fn push_front(&mut self, record: usize, priority: Priority) -> Result<(), InconsistentError> {
        let at = self.find(|p| p <= priority);
        self.priorities[record] = priority;
        self.accessor()
            .insert(record, at)
            .map_err(|_| InconsistentError)
    }

    fn pop_front(
        &mut self,
        prev_task_priority: Option<Priority>,
    ) -> Result<ScheduleDecision<usize>, InconsistentError> {
        match (self.highest_priority(), prev_task_priority) {
            (None, None) => Ok(ScheduleDecision::SwitchTo(None)),
            (None, Some(_)) => Ok(ScheduleDecision::Keep),
            (Some(next), Some(prev)) if prev >= next => Ok(ScheduleDecision::Keep),
            (Some(_), _) => {
                let record = self.accessor().pop_front()?.ok_or(InconsistentError)?;
                Ok(ScheduleDecision::SwitchTo(Some(record)))
            }
        }
    }

    fn remove(&mut self, record: usize) -> Result<bool, InconsistentError> {
        if !matches!(self.links.get(record), Some(Some(_))) {
            return Ok(false);
        }
        self.accessor()
            .remove(record)
            .map_err(|_| InconsistentError)?;
        Ok(true)
    }

    #[inline]
    fn highest_priority(&self) -> Option<Priority> {
        self.head.first.map(|i| self.priorities[i])
    }
}

impl private::Sealed for ListQueue {}

impl fmt::Debug for ListQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut list = f.debug_list();
        let mut next = self.head.first;
        while let Some(i) = next {
            list.entry(&(i, self.priorities[i]));
            next = self.links[i]
                .map(|l| l.next)
                .filter(|&n| Some(n) != self.head.first);
        }
        list.finish()
    }
}
