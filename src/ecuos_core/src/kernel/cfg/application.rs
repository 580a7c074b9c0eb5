use super::CfgBuilder;
use crate::kernel::{ApplicationId, CoreId, TaskId};

/// An OS-application descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplicationDescriptor {
    pub core: CoreId,
    pub trusted: bool,
    /// Activated when the application is restarted.
    pub restart_task: Option<TaskId>,
}

impl ApplicationDescriptor {
    /// Construct an `ApplicationBuilder` to define an application.
    pub fn build() -> ApplicationBuilder {
        ApplicationBuilder {
            inner: ApplicationDescriptor {
                core: CoreId::new(0),
                trusted: false,
                restart_task: None,
            },
        }
    }
}

/// The builder type for applications. Created by
/// [`ApplicationDescriptor::build`].
#[must_use = "must call `finish()` to complete registration"]
pub struct ApplicationBuilder {
    inner: ApplicationDescriptor,
}

impl ApplicationBuilder {
    pub fn core(mut self, core: CoreId) -> Self {
        self.inner.core = core;
        self
    }

    pub fn trusted(mut self) -> Self {
        self.inner.trusted = true;
        self
    }

    /// Complete the definition of an application, returning its identifier.
    ///
    /// The restart task usually belongs to the application, so it's
    /// specified afterwards by [`CfgBuilder::restart_task`].
    pub fn finish(self, cfg: &mut CfgBuilder) -> ApplicationId {
        cfg.inner.applications.push(self.inner);
        ApplicationId::from_index(cfg.inner.applications.len() - 1)
    }
}

impl CfgBuilder {
    /// Specify the restart task of `app`.
    ///
    /// # Panics
    ///
    /// Panics if `app` is not defined yet.
    pub fn restart_task(&mut self, app: ApplicationId, task: TaskId) -> &mut Self {
        self.inner.applications[app.index()].restart_task = Some(task);
        self
    }
}
