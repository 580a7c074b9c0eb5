//! Execution time accounting and timing protection
use ecuos_core::kernel::{Caller, ProtectionAction, ResultCode, TaskState};

use crate::{Kernel, Phase, Port, Queue, RestartOption};

#[derive(Debug, Default)]
pub(crate) struct TimingState {
    /// The timestamp at which the current time slice started.
    pub(crate) slice_start: u64,
}

impl<P: Port, Q: Queue> Kernel<P, Q> {
    /// Charge the time elapsed since the last call to whoever was executing:
    /// the innermost ISR, or else the most recently dispatched task. Time
    /// spent idle is only recorded for the CPU load.
    ///
    /// Called whenever the executing entity is about to change.
    pub(crate) fn account_time(&mut self) {
        let now = self.port.timestamp();
        let elapsed = now.saturating_sub(self.timing.slice_start);
        self.timing.slice_start = now;

        let busy = if let Some(&isr) = self.isr_stack.last() {
            self.isrs[isr.index()].exec_used += elapsed;
            true
        } else if let Some(task) = self.running {
            self.tasks[task.index()].exec_used += elapsed;
            true
        } else {
            false
        };
        self.cpu_load.record(now, elapsed, busy);
    }

    /// Check the execution budget of the executing task or ISR.
    ///
    /// The port calls this periodically (e.g., from a timer interrupt). If the
    /// budget is exhausted, the culprit is killed and the protection hook
    /// decides what happens next.
    pub fn check_timing(&mut self) {
        if self.phase != Phase::Running {
            return;
        }
        self.account_time();

        let culprit = if let Some(&isr) = self.isr_stack.last() {
            let budget = self.cfg.isrs[isr.index()].execution_budget;
            let cb = &self.isrs[isr.index()];
            (!cb.killed && budget.is_some_and(|b| cb.exec_used > b))
                .then_some(Caller::Isr(isr))
        } else {
            self.get_task_id()
                .filter(|t| {
                    let budget = self.cfg.tasks[t.index()].execution_budget;
                    budget.is_some_and(|b| self.tasks[t.index()].exec_used > b)
                })
                .map(Caller::Task)
        };

        if let Some(culprit) = culprit {
            self.protection_violation(culprit, ResultCode::ProtectionTime);
        }
        self.reschedule();
    }

    /// Kill `culprit`, then carry out the action chosen by the protection
    /// hook.
    pub(crate) fn protection_violation(&mut self, culprit: Caller, fatal: ResultCode) {
        log::warn!(
            "core {}: protection violation by {culprit:?} ({fatal:?})",
            self.core.index()
        );

        let app = match culprit {
            Caller::Task(task) => {
                self.kill_task(task, TaskState::Suspended);
                self.cfg.tasks[task.index()].app
            }
            Caller::Isr(isr) => {
                self.kill_isr(isr);
                self.cfg.isrs[isr.index()].app
            }
        };

        let action = self.hooks.protection(self.core, fatal, Some(culprit));
        log::debug!("core {}: protection hook chose {action:?}", self.core.index());

        match (action, app) {
            (ProtectionAction::Continue, _) => {}
            (ProtectionAction::QuarantineApplication, Some(app)) => {
                self.quarantine_application(app, RestartOption::NoRestart);
            }
            (ProtectionAction::RestartApplication, Some(app)) => {
                let restart = if self.cfg.applications[app.index()].restart_task.is_some() {
                    RestartOption::Restart
                } else {
                    RestartOption::NoRestart
                };
                self.quarantine_application(app, restart);
            }
            // There's no application to terminate
            (ProtectionAction::QuarantineApplication | ProtectionAction::RestartApplication, None)
            | (ProtectionAction::Shutdown, _) => self.shutdown_local(fatal),
        }
    }
}
