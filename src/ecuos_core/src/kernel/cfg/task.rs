use alloc::vec::Vec;

use super::{AccessSet, AppModeSet, CfgBuilder};
use crate::kernel::{ApplicationId, CoreId, IsrId, Priority, ResourceId, TaskId};

/// A task descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    pub core: CoreId,
    pub app: Option<ApplicationId>,
    /// The base priority. Higher values are more urgent.
    pub priority: Priority,
    /// The priority the task runs at once dispatched. Raised above
    /// `priority` by an internal resource or by being non-preemptive.
    pub run_priority: Priority,
    pub max_activations: u8,
    /// Extended tasks can wait for events.
    pub extended: bool,
    pub autostart: AppModeSet,
    /// The execution-time budget per activation, in port timestamp units.
    pub execution_budget: Option<u64>,
    pub access: AccessSet,
    /// The resources the task may take. Used by the ceiling checks.
    pub resources: Vec<ResourceId>,
    /// The index of the task's first activation record. Computed by
    /// [`CfgBuilder::finalize`].
    pub record_base: usize,
    pub(super) non_preemptive: bool,
}

impl TaskDescriptor {
    /// Construct a `TaskBuilder` to define a task.
    pub fn build() -> TaskBuilder {
        TaskBuilder {
            inner: TaskDescriptor {
                core: CoreId::new(0),
                app: None,
                priority: 0,
                run_priority: 0,
                max_activations: 1,
                extended: false,
                autostart: AppModeSet::empty(),
                execution_budget: None,
                access: AccessSet::empty(),
                resources: Vec::new(),
                record_base: 0,
                non_preemptive: false,
            },
            priority: None,
            run_priority: None,
        }
    }

    /// Get the `i`-th activation record's index.
    #[inline]
    pub fn record(&self, i: usize) -> usize {
        debug_assert!(i < self.max_activations as usize);
        self.record_base + i
    }
}

/// The builder type for tasks. Created by [`TaskDescriptor::build`].
#[must_use = "must call `finish()` to complete registration"]
pub struct TaskBuilder {
    inner: TaskDescriptor,
    priority: Option<Priority>,
    run_priority: Option<Priority>,
}

impl TaskBuilder {
    /// Specify the core the task runs on. Defaults to core 0.
    pub fn core(mut self, core: CoreId) -> Self {
        self.inner.core = core;
        self
    }

    /// Specify the owning application.
    pub fn application(mut self, app: ApplicationId) -> Self {
        self.inner.app = Some(app);
        self
    }

    /// \[**Required**\] Specify the task's base priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Assign an internal resource: the task runs at `priority` once it's
    /// dispatched.
    pub fn run_priority(mut self, priority: Priority) -> Self {
        self.run_priority = Some(priority);
        self
    }

    /// Make the task non-preemptive. Equivalent to `run_priority` with the
    /// highest priority.
    pub fn non_preemptive(mut self) -> Self {
        self.inner.non_preemptive = true;
        self
    }

    /// Specify the activation limit. Defaults to `1`.
    pub fn max_activations(mut self, n: u8) -> Self {
        self.inner.max_activations = n;
        self
    }

    /// Make the task an extended task.
    pub fn extended(mut self) -> Self {
        self.inner.extended = true;
        self
    }

    /// Activate the task at startup in the specified application modes.
    pub fn autostart(mut self, modes: AppModeSet) -> Self {
        self.inner.autostart = modes;
        self
    }

    /// Specify the execution-time budget.
    pub fn execution_budget(mut self, budget: u64) -> Self {
        self.inner.execution_budget = Some(budget);
        self
    }

    /// Grant access to the specified applications. The owning application
    /// always has access.
    pub fn access(mut self, access: AccessSet) -> Self {
        self.inner.access = access;
        self
    }

    /// Declare that the task takes `resource`.
    pub fn uses_resource(mut self, resource: ResourceId) -> Self {
        self.inner.resources.push(resource);
        self
    }

    /// Complete the definition of a task, returning its identifier.
    ///
    /// # Panics
    ///
    /// Panics if the priority is not specified.
    pub fn finish(self, cfg: &mut CfgBuilder) -> TaskId {
        let mut inner = self.inner;
        inner.priority = self.priority.expect("`priority` must be specified");
        inner.run_priority = self.run_priority.unwrap_or(inner.priority);
        cfg.inner.tasks.push(inner);
        TaskId::from_index(cfg.inner.tasks.len() - 1)
    }
}

/// A category 2 ISR descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsrDescriptor {
    pub core: CoreId,
    pub app: Option<ApplicationId>,
    pub execution_budget: Option<u64>,
    pub access: AccessSet,
}

impl IsrDescriptor {
    /// Construct an `IsrBuilder` to define an ISR.
    pub fn build() -> IsrBuilder {
        IsrBuilder {
            inner: IsrDescriptor {
                core: CoreId::new(0),
                app: None,
                execution_budget: None,
                access: AccessSet::empty(),
            },
        }
    }
}

/// The builder type for ISRs. Created by [`IsrDescriptor::build`].
#[must_use = "must call `finish()` to complete registration"]
pub struct IsrBuilder {
    inner: IsrDescriptor,
}

impl IsrBuilder {
    pub fn core(mut self, core: CoreId) -> Self {
        self.inner.core = core;
        self
    }

    pub fn application(mut self, app: ApplicationId) -> Self {
        self.inner.app = Some(app);
        self
    }

    pub fn execution_budget(mut self, budget: u64) -> Self {
        self.inner.execution_budget = Some(budget);
        self
    }

    pub fn access(mut self, access: AccessSet) -> Self {
        self.inner.access = access;
        self
    }

    /// Complete the definition of an ISR, returning its identifier.
    pub fn finish(self, cfg: &mut CfgBuilder) -> IsrId {
        cfg.inner.isrs.push(self.inner);
        IsrId::from_index(cfg.inner.isrs.len() - 1)
    }
}
