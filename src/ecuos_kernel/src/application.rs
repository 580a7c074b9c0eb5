//! OS-applications and access rights
use ecuos_core::kernel::{
    cfg::{AccessSet, ApplicationDescriptor},
    AllowAccessError, AlarmId, ApplicationId, ApplicationState, Caller,
    GetApplicationStateError, IsrId, ScheduleTableId, ServiceId, TaskId, TaskState,
    TerminateApplicationError,
};

use crate::{alarm::AlarmState, xcore, Kernel, Port, Queue};

/// Specifies whether [`Kernel::terminate_application`] restarts the
/// application (`RestartType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestartOption {
    NoRestart,
    Restart,
}

#[derive(Debug)]
pub(crate) struct ApplicationCb {
    pub(crate) state: ApplicationState,
}

impl Default for ApplicationCb {
    fn default() -> Self {
        Self {
            state: ApplicationState::Accessible,
        }
    }
}

impl<P: Port, Q: Queue> Kernel<P, Q> {
    /// Get the application the caller belongs to (`GetApplicationID`).
    pub fn get_application_id(&self) -> Option<ApplicationId> {
        self.caller_app()
    }

    /// Get the state of `app` (`GetApplicationState`).
    pub fn get_application_state(
        &mut self,
        app: ApplicationId,
    ) -> Result<ApplicationState, GetApplicationStateError> {
        let result = match self.cfg.application(app) {
            None => Err(GetApplicationStateError::BadId),
            Some(desc) if desc.core != self.core => {
                let core = desc.core;
                self.call_remote(core, xcore::GetApplicationState { app })
            }
            Some(_) => Ok(self.apps[app.index()].state),
        };
        self.finish_service(ServiceId::GetApplicationState, &[app.to_raw()], result)
    }

    /// Terminate all tasks, ISRs, alarms, and schedule tables of `app` and
    /// release the locks they hold (`TerminateApplication`).
    ///
    /// With [`RestartOption::Restart`], the application goes into the
    /// `Restarting` state and its restart task is activated. The restart task
    /// calls [`allow_access`](Self::allow_access) when it's done.
    pub fn terminate_application(
        &mut self,
        app: ApplicationId,
        restart: RestartOption,
    ) -> Result<(), TerminateApplicationError> {
        let result = self.terminate_application_inner(app, restart);
        self.finish_service(
            ServiceId::TerminateApplication,
            &[app.to_raw(), restart as u32],
            result,
        )
    }

    fn terminate_application_inner(
        &mut self,
        app: ApplicationId,
        restart: RestartOption,
    ) -> Result<(), TerminateApplicationError> {
        let &ApplicationDescriptor {
            core, restart_task, ..
        } = self
            .cfg
            .application(app)
            .ok_or(TerminateApplicationError::BadId)?;

        let caller_app = self.caller_app();
        if let Some(caller_app) = caller_app {
            if caller_app != app && !self.cfg.applications[caller_app.index()].trusted {
                return Err(TerminateApplicationError::Access);
            }
        }
        if restart == RestartOption::Restart && restart_task.is_none() {
            return Err(TerminateApplicationError::Value);
        }

        let caller_in_app = caller_app == Some(app);
        if core != self.core {
            return self.call_remote(
                core,
                xcore::TerminateApplication {
                    app,
                    restart,
                    caller_in_app,
                },
            );
        }
        self.terminate_application_local(app, restart, caller_in_app)
    }

    /// Complete the restart of the caller's application (`AllowAccess`).
    pub fn allow_access(&mut self) -> Result<(), AllowAccessError> {
        let result = match self.caller_app() {
            None => Err(AllowAccessError::CallLevel),
            Some(app) if self.apps[app.index()].state != ApplicationState::Restarting => {
                Err(AllowAccessError::State)
            }
            Some(app) => {
                self.apps[app.index()].state = ApplicationState::Accessible;
                log::debug!("core {}: {app:?} is accessible again", self.core.index());
                Ok(())
            }
        };
        self.finish_service(ServiceId::AllowAccess, &[], result)
    }

    /// Get the application of the task or ISR on whose behalf services are
    /// executing.
    pub(crate) fn caller_app(&self) -> Option<ApplicationId> {
        match self.caller()? {
            Caller::Task(task) => self.cfg.tasks[task.index()].app,
            Caller::Isr(isr) => self.cfg.isrs[isr.index()].app,
        }
    }

    /// Check the caller's right to access an object owned by `owner`.
    ///
    /// A caller outside any application (including the kernel itself) may
    /// access everything.
    pub(crate) fn may_access(&self, owner: Option<ApplicationId>, access: AccessSet) -> bool {
        match self.caller_app() {
            None => true,
            Some(app) => owner == Some(app) || access.permits(app),
        }
    }

    /// Get a flag indicating whether objects of `app` can be used.
    pub(crate) fn app_accessible(&self, app: Option<ApplicationId>) -> bool {
        app.map_or(true, |app| {
            self.apps[app.index()].state == ApplicationState::Accessible
        })
    }

    /// Get a flag indicating whether `task` can be activated. The restart
    /// task of a restarting application can.
    pub(crate) fn task_activatable(&self, task: TaskId) -> bool {
        let Some(app) = self.cfg.tasks[task.index()].app else {
            return true;
        };
        match self.apps[app.index()].state {
            ApplicationState::Accessible => true,
            ApplicationState::Restarting => {
                self.cfg.applications[app.index()].restart_task == Some(task)
            }
            ApplicationState::Quarantined => false,
        }
    }

    pub(crate) fn terminate_application_local(
        &mut self,
        app: ApplicationId,
        restart: RestartOption,
        caller_in_app: bool,
    ) -> Result<(), TerminateApplicationError> {
        match self.apps[app.index()].state {
            ApplicationState::Quarantined => return Err(TerminateApplicationError::State),
            ApplicationState::Restarting if !caller_in_app => {
                return Err(TerminateApplicationError::State)
            }
            _ => {}
        }
        self.quarantine_application(app, restart);
        Ok(())
    }

    /// Kill every object of `app`, then either quarantine it or start the
    /// restart.
    pub(crate) fn quarantine_application(&mut self, app: ApplicationId, restart: RestartOption) {
        let (app_state, task_state, alarm_state) = match restart {
            RestartOption::NoRestart => (
                ApplicationState::Quarantined,
                TaskState::Quarantined,
                AlarmState::Quarantined,
            ),
            RestartOption::Restart => (
                ApplicationState::Restarting,
                TaskState::Suspended,
                AlarmState::Idle,
            ),
        };
        log::debug!(
            "core {}: terminating {app:?} ({restart:?})",
            self.core.index()
        );
        self.apps[app.index()].state = app_state;

        let cfg = self.cfg.clone();
        for (i, _) in cfg.tasks.iter().enumerate().filter(|(_, t)| t.app == Some(app)) {
            self.kill_task(TaskId::from_index(i), task_state);
        }
        for (i, _) in cfg.isrs.iter().enumerate().filter(|(_, x)| x.app == Some(app)) {
            self.release_locks(Caller::Isr(IsrId::from_index(i)));
        }
        for (i, _) in cfg
            .schedule_tables
            .iter()
            .enumerate()
            .filter(|(_, st)| st.app == Some(app))
        {
            self.stop_table(ScheduleTableId::from_index(i));
        }
        for (i, _) in cfg.alarms.iter().enumerate().filter(|(_, a)| a.app == Some(app)) {
            let alarm = AlarmId::from_index(i);
            self.disarm_alarm(alarm);
            self.alarms[i].state = alarm_state;
        }

        if let (RestartOption::Restart, Some(task)) =
            (restart, cfg.applications[app.index()].restart_task)
        {
            if let Err(e) = self.activate_task_local(task) {
                self.report_error(ecuos_core::kernel::ErrorInfo::new(
                    ServiceId::TerminateApplication,
                    e.into(),
                    &[app.to_raw(), task.to_raw()],
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{test_utils::*, RestartOption};
    use ecuos_core::kernel::{cfg::*, *};

    struct Fixture {
        app: ApplicationId,
        main: TaskId,
        worker: TaskId,
        restart: TaskId,
        alarm: AlarmId,
    }

    fn fixture(trusted_main: bool) -> (CfgBuilder, Fixture) {
        let mut b = CfgBuilder::new(1);
        let app = ApplicationDescriptor::build().finish(&mut b);
        let mut sys = ApplicationDescriptor::build();
        if trusted_main {
            sys = sys.trusted();
        }
        let sys = sys.finish(&mut b);
        let main = TaskDescriptor::build()
            .priority(1)
            .application(sys)
            .autostart(AppModeSet::DEFAULT)
            .finish(&mut b);
        let worker = TaskDescriptor::build()
            .priority(2)
            .application(app)
            .access(AccessSet::ALL)
            .finish(&mut b);
        let restart = TaskDescriptor::build()
            .priority(3)
            .application(app)
            .finish(&mut b);
        b.restart_task(app, restart);
        let counter = CounterDescriptor::build()
            .application(app)
            .access(AccessSet::ALL)
            .finish(&mut b);
        let alarm = AlarmDescriptor::build()
            .counter(counter)
            .application(app)
            .access(AccessSet::ALL)
            .activate_task(worker)
            .finish(&mut b);
        (
            b,
            Fixture {
                app,
                main,
                worker,
                restart,
                alarm,
            },
        )
    }

    #[test]
    fn access_rights() {
        let (b, f) = fixture(false);
        let (mut k, _hooks) = boot(b);
        assert_eq!(k.get_task_id(), Some(f.main));
        assert_eq!(k.get_application_id(), Some(ApplicationId::new(1)));

        // `worker` grants access to everyone, `restart` doesn't
        assert_eq!(k.activate_task(f.restart), Err(ActivateTaskError::Access));
        // Untrusted applications may only terminate themselves
        assert_eq!(
            k.terminate_application(f.app, RestartOption::NoRestart),
            Err(TerminateApplicationError::Access)
        );
        k.activate_task(f.worker).unwrap();
        assert_eq!(k.get_task_id(), Some(f.worker));
        // Now the caller belongs to `app`
        k.activate_task(f.restart).unwrap();
        assert_eq!(k.get_task_id(), Some(f.restart));
    }

    #[test]
    fn quarantine() {
        let (b, f) = fixture(true);
        let (mut k, _hooks) = boot(b);

        k.set_rel_alarm(f.alarm, 10, 10).unwrap();
        k.activate_task(f.worker).unwrap();
        assert_eq!(k.get_task_id(), Some(f.worker));

        // Let `main` run again
        k.terminate_task().unwrap();
        assert_eq!(k.get_task_id(), Some(f.main));

        k.terminate_application(f.app, RestartOption::NoRestart)
            .unwrap();
        assert_eq!(
            k.get_application_state(f.app),
            Ok(ApplicationState::Quarantined)
        );
        assert_eq!(k.get_task_state(f.worker), Ok(TaskState::Quarantined));
        assert_eq!(k.activate_task(f.worker), Err(ActivateTaskError::Access));
        assert_eq!(k.get_alarm(f.alarm), Err(GetAlarmError::Access));
        assert_eq!(
            k.terminate_application(f.app, RestartOption::NoRestart),
            Err(TerminateApplicationError::State)
        );
    }

    #[test]
    fn restart() {
        let (b, f) = fixture(true);
        let (mut k, _hooks) = boot(b);

        k.terminate_application(f.app, RestartOption::Restart)
            .unwrap();
        assert_eq!(
            k.get_application_state(f.app),
            Ok(ApplicationState::Restarting)
        );
        // The restart task preempts `main`
        assert_eq!(k.get_task_id(), Some(f.restart));
        assert_eq!(k.get_application_id(), Some(f.app));
        assert_eq!(k.get_task_state(f.worker), Ok(TaskState::Suspended));

        k.allow_access().unwrap();
        assert_eq!(k.allow_access(), Err(AllowAccessError::State));
        assert_eq!(
            k.get_application_state(f.app),
            Ok(ApplicationState::Accessible)
        );
        k.terminate_task().unwrap();
        assert_eq!(k.get_task_id(), Some(f.main));
        k.activate_task(f.worker).unwrap();
    }

    #[test]
    fn restart_requires_restart_task() {
        let mut b = CfgBuilder::new(1);
        let app = ApplicationDescriptor::build().finish(&mut b);
        TaskDescriptor::build()
            .priority(1)
            .autostart(AppModeSet::DEFAULT)
            .finish(&mut b);
        let (mut k, _hooks) = boot(b);
        assert_eq!(
            k.terminate_application(app, RestartOption::Restart),
            Err(TerminateApplicationError::Value)
        );
        assert_eq!(
            k.terminate_application(ApplicationId::new(5), RestartOption::Restart),
            Err(TerminateApplicationError::BadId)
        );
        assert_eq!(k.allow_access(), Err(AllowAccessError::CallLevel));
    }
}
