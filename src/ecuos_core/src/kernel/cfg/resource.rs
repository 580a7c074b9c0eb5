use super::{AccessSet, CfgBuilder};
use crate::kernel::{ApplicationId, CoreId, Priority, ResourceId};

/// A resource descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub core: CoreId,
    pub app: Option<ApplicationId>,
    /// The ceiling priority. Resolved by [`CfgBuilder::finalize`] for
    /// [`ResourceBuilder::scheduler`].
    pub ceiling: Priority,
    pub access: AccessSet,
    pub(super) is_scheduler: bool,
}

impl ResourceDescriptor {
    /// Construct a `ResourceBuilder` to define a resource.
    pub fn build() -> ResourceBuilder {
        ResourceBuilder {
            inner: ResourceDescriptor {
                core: CoreId::new(0),
                app: None,
                ceiling: 0,
                access: AccessSet::empty(),
                is_scheduler: false,
            },
            ceiling_set: false,
        }
    }
}

/// The builder type for resources. Created by [`ResourceDescriptor::build`].
#[must_use = "must call `finish()` to complete registration"]
pub struct ResourceBuilder {
    inner: ResourceDescriptor,
    ceiling_set: bool,
}

impl ResourceBuilder {
    pub fn core(mut self, core: CoreId) -> Self {
        self.inner.core = core;
        self
    }

    pub fn application(mut self, app: ApplicationId) -> Self {
        self.inner.app = Some(app);
        self
    }

    /// \[**Required**\] Specify the ceiling priority. Mutually exclusive
    /// with [`Self::scheduler`].
    pub fn ceiling(mut self, ceiling: Priority) -> Self {
        self.inner.ceiling = ceiling;
        self.ceiling_set = true;
        self
    }

    /// Use the highest task priority as the ceiling (`RES_SCHEDULER`).
    pub fn scheduler(mut self) -> Self {
        self.inner.is_scheduler = true;
        self.ceiling_set = true;
        self
    }

    pub fn access(mut self, access: AccessSet) -> Self {
        self.inner.access = access;
        self
    }

    /// Complete the definition of a resource, returning its identifier.
    ///
    /// # Panics
    ///
    /// Panics if the ceiling is not specified.
    pub fn finish(self, cfg: &mut CfgBuilder) -> ResourceId {
        assert!(self.ceiling_set, "`ceiling` must be specified");
        cfg.inner.resources.push(self.inner);
        ResourceId::from_index(cfg.inner.resources.len() - 1)
    }
}
