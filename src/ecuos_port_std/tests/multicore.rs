//! Runs small multi-core systems on the hosted port.
use ecuos_core::kernel::{
    cfg::*, ActivateTaskError, AlarmId, AppMode, CancelAlarmError, CoreId, ErrorInfo,
    GetAlarmError, Hooks, HwTimerId, IsrId, ResultCode, ScheduleTableId, ScheduleTableStatus,
    ServiceId, SetEventError, StopScheduleTableError, TaskId, TaskState,
};
use ecuos_port_std::{Application, Kernel, Step, System, TimerConfig};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

#[derive(Default)]
struct ErrorLog(Mutex<Vec<ErrorInfo>>);

impl Hooks for ErrorLog {
    fn error(&self, _core: CoreId, info: &ErrorInfo) {
        self.0.lock().unwrap().push(info.clone());
    }
}

fn run(sys: System, app: Arc<dyn Application>) -> Arc<ErrorLog> {
    let hooks = Arc::new(ErrorLog::default());
    sys.run(app, hooks.clone(), AppMode::new(0)).unwrap();
    hooks
}

/// `ActivateTask` returns the same results for a task on another core as
/// for a task on the calling core.
#[test]
fn remote_activation_matches_local() {
    struct App {
        main: TaskId,
        local: TaskId,
        remote: TaskId,
        results: Mutex<Vec<Result<(), ActivateTaskError>>>,
        release: AtomicBool,
    }

    impl Application for App {
        fn task(&self, k: &mut Kernel, task: TaskId) -> Step {
            if task == self.main {
                let mut results = self.results.lock().unwrap();
                results.push(k.activate_task(self.local));
                results.push(k.activate_task(self.local));
                results.push(k.activate_task(self.remote));
                results.push(k.activate_task(self.remote));
                drop(results);
                self.release.store(true, Ordering::Release);
                k.terminate_task().unwrap();
                Step::Return
            } else if task == self.local {
                k.terminate_task().unwrap();
                Step::Return
            } else if self.release.load(Ordering::Acquire) {
                k.shutdown_all_cores(ResultCode::Success);
                Step::Return
            } else {
                Step::Yield
            }
        }
    }

    let mut b = CfgBuilder::new(2);
    let main = TaskDescriptor::build()
        .priority(2)
        .autostart(AppModeSet::DEFAULT)
        .finish(&mut b);
    let local = TaskDescriptor::build().priority(1).finish(&mut b);
    let remote = TaskDescriptor::build()
        .priority(1)
        .core(CoreId::new(1))
        .finish(&mut b);
    let sys = System::new(b.finalize().unwrap());

    let app = Arc::new(App {
        main,
        local,
        remote,
        results: Mutex::new(Vec::new()),
        release: AtomicBool::new(false),
    });
    let errors = run(sys, app.clone());

    assert_eq!(
        *app.results.lock().unwrap(),
        [
            Ok(()),
            Err(ActivateTaskError::Limit),
            Ok(()),
            Err(ActivateTaskError::Limit),
        ]
    );
    let codes: Vec<_> = errors.0.lock().unwrap().iter().map(|e| e.code).collect();
    assert_eq!(codes, [ResultCode::Limit, ResultCode::Limit]);
}

/// An alarm driven by a hardware timer activates a task on another core.
#[test]
fn remote_alarm_action() {
    struct App {
        ran: AtomicBool,
    }

    impl Application for App {
        fn task(&self, k: &mut Kernel, _task: TaskId) -> Step {
            self.ran.store(true, Ordering::Relaxed);
            k.shutdown_all_cores(ResultCode::Success);
            Step::Return
        }
    }

    let mut b = CfgBuilder::new(2);
    let remote = TaskDescriptor::build()
        .priority(1)
        .core(CoreId::new(1))
        .finish(&mut b);
    let counter = CounterDescriptor::build()
        .max_allowed_value(0xffff)
        .hardware(HwTimerId::new(0))
        .finish(&mut b);
    AlarmDescriptor::build()
        .counter(counter)
        .activate_task(remote)
        .autostart(AppModeSet::DEFAULT, AlarmStart::Relative, 20, 0)
        .finish(&mut b);
    let sys = System::new(b.finalize().unwrap()).with_timers(vec![TimerConfig {
        core: CoreId::new(0),
        period: Duration::from_micros(100),
        max_value: 0xffff,
    }]);

    let app = Arc::new(App {
        ran: AtomicBool::new(false),
    });
    let errors = run(sys, app.clone());
    assert!(app.ran.load(Ordering::Relaxed));
    assert!(errors.0.lock().unwrap().is_empty());
}

/// An ISR pended from outside activates a task on another core.
#[test]
fn isr_activates_remote_task() {
    struct App {
        target: TaskId,
        result: Mutex<Option<Result<(), ActivateTaskError>>>,
    }

    impl Application for App {
        fn task(&self, k: &mut Kernel, _task: TaskId) -> Step {
            k.shutdown_all_cores(ResultCode::Success);
            Step::Return
        }

        fn isr(&self, k: &mut Kernel, _isr: IsrId) {
            *self.result.lock().unwrap() = Some(k.activate_task(self.target));
        }
    }

    let mut b = CfgBuilder::new(2);
    let target = TaskDescriptor::build().priority(1).finish(&mut b);
    let isr = IsrDescriptor::build().core(CoreId::new(1)).finish(&mut b);
    let sys = System::new(b.finalize().unwrap());
    sys.handle().pend_isr(isr);

    let app = Arc::new(App {
        target,
        result: Mutex::new(None),
    });
    run(sys, app.clone());
    assert_eq!(*app.result.lock().unwrap(), Some(Ok(())));
}

/// A task body that returns without terminating is terminated by the port.
#[test]
fn missing_end() {
    struct App {
        steps: Mutex<u32>,
    }

    impl Application for App {
        fn task(&self, k: &mut Kernel, task: TaskId) -> Step {
            let mut steps = self.steps.lock().unwrap();
            *steps += 1;
            if *steps == 1 {
                k.activate_task(task).unwrap();
            } else {
                k.shutdown_os(ResultCode::Success);
            }
            Step::Return
        }
    }

    let mut b = CfgBuilder::new(1);
    TaskDescriptor::build()
        .priority(1)
        .max_activations(2)
        .autostart(AppModeSet::DEFAULT)
        .finish(&mut b);
    let sys = System::new(b.finalize().unwrap());
    let handle = sys.handle();

    let app = Arc::new(App {
        steps: Mutex::new(0),
    });
    let errors = run(sys, app.clone());
    assert!(handle.is_shut_down());
    assert_eq!(*app.steps.lock().unwrap(), 2);

    let errors = errors.0.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].service, ServiceId::TaskReturn);
    assert_eq!(errors[0].code, ResultCode::MissingEnd);
}

/// Alarm, schedule table and event services addressing another core take
/// effect before they return.
#[test]
fn remote_services_are_synchronous() {
    #[derive(Default)]
    struct Observed {
        alarm: Vec<Result<u32, GetAlarmError>>,
        cancel: Vec<Result<(), CancelAlarmError>>,
        table: Vec<ScheduleTableStatus>,
        stop: Vec<Result<(), StopScheduleTableError>>,
        set_event: Vec<Result<(), SetEventError>>,
        task_state: Vec<TaskState>,
        events: Vec<u32>,
    }

    struct App {
        main: TaskId,
        waiter: TaskId,
        alarm: AlarmId,
        table: ScheduleTableId,
        observed: Mutex<Observed>,
        release: AtomicBool,
    }

    impl Application for App {
        fn task(&self, k: &mut Kernel, task: TaskId) -> Step {
            if task != self.main {
                if self.release.load(Ordering::Acquire) {
                    k.shutdown_all_cores(ResultCode::Success);
                    return Step::Return;
                }
                return Step::Yield;
            }

            let mut o = self.observed.lock().unwrap();
            k.set_rel_alarm(self.alarm, 50, 0).unwrap();
            o.alarm.push(k.get_alarm(self.alarm));
            o.cancel.push(k.cancel_alarm(self.alarm));
            o.alarm.push(k.get_alarm(self.alarm));
            o.cancel.push(k.cancel_alarm(self.alarm));

            k.start_schedule_table_rel(self.table, 5).unwrap();
            o.table.extend(k.get_schedule_table_status(self.table).ok());
            o.stop.push(k.stop_schedule_table(self.table));
            o.table.extend(k.get_schedule_table_status(self.table).ok());
            o.stop.push(k.stop_schedule_table(self.table));

            o.task_state.extend(k.get_task_state(self.waiter).ok());
            o.set_event.push(k.set_event(self.waiter, 0b10));
            k.activate_task(self.waiter).unwrap();
            o.set_event.push(k.set_event(self.waiter, 0b10));
            o.events.extend(k.get_event(self.waiter).ok());
            o.task_state.extend(k.get_task_state(self.waiter).ok());
            drop(o);

            self.release.store(true, Ordering::Release);
            k.terminate_task().unwrap();
            Step::Return
        }
    }

    let mut b = CfgBuilder::new(2);
    let main = TaskDescriptor::build()
        .priority(1)
        .autostart(AppModeSet::DEFAULT)
        .finish(&mut b);
    let waiter = TaskDescriptor::build()
        .priority(1)
        .extended()
        .core(CoreId::new(1))
        .finish(&mut b);
    let counter = CounterDescriptor::build()
        .max_allowed_value(999)
        .core(CoreId::new(1))
        .finish(&mut b);
    let alarm = AlarmDescriptor::build()
        .counter(counter)
        .activate_task(waiter)
        .finish(&mut b);
    let table = ScheduleTableDescriptor::build()
        .counter(counter)
        .duration(20)
        .point(ExpiryPoint::at(10).set_event(waiter, 0b1))
        .finish(&mut b);
    let sys = System::new(b.finalize().unwrap());

    let app = Arc::new(App {
        main,
        waiter,
        alarm,
        table,
        observed: Mutex::new(Observed::default()),
        release: AtomicBool::new(false),
    });
    run(sys, app.clone());

    let o = app.observed.lock().unwrap();
    assert_eq!(o.alarm, [Ok(50), Err(GetAlarmError::NotInUse)]);
    assert_eq!(o.cancel, [Ok(()), Err(CancelAlarmError::NotInUse)]);
    assert_eq!(
        o.table,
        [ScheduleTableStatus::Running, ScheduleTableStatus::Stopped]
    );
    assert_eq!(o.stop, [Ok(()), Err(StopScheduleTableError::NotRunning)]);
    assert_eq!(o.set_event, [Err(SetEventError::State), Ok(())]);
    assert_eq!(o.events, [0b10]);
    assert_eq!(o.task_state[0], TaskState::Suspended);
    assert!(matches!(
        o.task_state[1],
        TaskState::Ready | TaskState::Running
    ));
}
