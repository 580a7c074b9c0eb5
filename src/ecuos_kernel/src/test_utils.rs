//! Kernel test fixtures: a recording port and recording hooks.
use ecuos_core::kernel::{
    cfg::{CfgBuilder, Config},
    AppMode, Caller, CoreId, ErrorInfo, HardwareTimer, Hooks, HwTimerId, ProtectionAction,
    ResultCode, TaskId,
};
use std::sync::{Arc, Mutex};

use crate::{Interconnect, Kernel, Port, Queue};

/// A [`Port`] that records dispatches and exposes its clock and timers to
/// the test.
#[derive(Debug, Default)]
pub(crate) struct TestPort {
    pub(crate) dispatches: Vec<(Option<TaskId>, Option<TaskId>)>,
    pub(crate) now: u64,
    pub(crate) timers: Vec<FakeTimer>,
}

impl Port for TestPort {
    type Timer = FakeTimer;

    fn dispatch(&mut self, from: Option<TaskId>, to: Option<TaskId>) {
        self.dispatches.push((from, to));
    }

    fn notify_core(&self, _core: CoreId) {}

    fn idle_wait(&mut self) {
        std::thread::yield_now();
    }

    fn timestamp(&self) -> u64 {
        self.now
    }

    fn timer(&mut self, id: HwTimerId) -> Option<&mut FakeTimer> {
        self.timers.get_mut(id.index())
    }
}

/// A hardware timer whose reading is set by the test.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeTimer {
    pub(crate) max: u32,
    pub(crate) value: u32,
    /// The arguments of the last `start` since the last `stop`.
    pub(crate) armed: Option<(u32, u32)>,
    pub(crate) initialized: bool,
}

impl HardwareTimer for FakeTimer {
    fn max_value(&self) -> u32 {
        self.max
    }

    fn init(&mut self) {
        self.initialized = true;
    }

    fn start(&mut self, old: u32, delta: u32) {
        self.armed = Some((old, delta));
    }

    fn stop(&mut self) {
        self.armed = None;
    }

    fn read(&self) -> u32 {
        self.value
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HookEvent {
    Startup,
    Shutdown(ResultCode),
    Error(ErrorInfo),
    Protection(ResultCode, Option<Caller>),
    PreTask(TaskId),
    PostTask(TaskId),
}

/// [`Hooks`] that log every call.
#[derive(Debug)]
pub(crate) struct RecordingHooks {
    log: Mutex<Vec<HookEvent>>,
    protection_action: Mutex<ProtectionAction>,
}

impl Default for RecordingHooks {
    fn default() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            protection_action: Mutex::new(ProtectionAction::QuarantineApplication),
        }
    }
}

impl RecordingHooks {
    pub(crate) fn events(&self) -> Vec<HookEvent> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn errors(&self) -> Vec<ErrorInfo> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                HookEvent::Error(info) => Some(info),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn task_events(&self) -> Vec<HookEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, HookEvent::PreTask(_) | HookEvent::PostTask(_)))
            .collect()
    }

    pub(crate) fn protection_events(&self) -> Vec<(ResultCode, Option<Caller>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                HookEvent::Protection(code, culprit) => Some((code, culprit)),
                _ => None,
            })
            .collect()
    }

    /// Set the value returned by `protection`.
    pub(crate) fn set_protection_action(&self, action: ProtectionAction) {
        *self.protection_action.lock().unwrap() = action;
    }

    fn push(&self, e: HookEvent) {
        self.log.lock().unwrap().push(e);
    }
}

impl Hooks for RecordingHooks {
    fn startup(&self, _core: CoreId) {
        self.push(HookEvent::Startup);
    }

    fn shutdown(&self, _core: CoreId, code: ResultCode) {
        self.push(HookEvent::Shutdown(code));
    }

    fn error(&self, _core: CoreId, info: &ErrorInfo) {
        self.push(HookEvent::Error(info.clone()));
    }

    fn protection(
        &self,
        _core: CoreId,
        fatal: ResultCode,
        culprit: Option<Caller>,
    ) -> ProtectionAction {
        self.push(HookEvent::Protection(fatal, culprit));
        *self.protection_action.lock().unwrap()
    }

    fn pre_task(&self, _core: CoreId, task: TaskId) {
        self.push(HookEvent::PreTask(task));
    }

    fn post_task(&self, _core: CoreId, task: TaskId) {
        self.push(HookEvent::PostTask(task));
    }
}

/// Construct the kernel of core 0 without starting it.
pub(crate) fn kernel_with_queue<Q: Queue>(
    cfg: Arc<Config>,
    port: TestPort,
) -> (Kernel<TestPort, Q>, Arc<RecordingHooks>) {
    let xc = Arc::new(Interconnect::new(&cfg));
    let hooks = Arc::new(RecordingHooks::default());
    let k = Kernel::new(cfg, xc, hooks.clone(), port, CoreId::new(0));
    (k, hooks)
}

pub(crate) fn kernel(cfg: Arc<Config>) -> (Kernel<TestPort>, Arc<RecordingHooks>) {
    kernel_with_queue(cfg, TestPort::default())
}

fn boot_inner<Q: Queue>(b: CfgBuilder, port: TestPort) -> (Kernel<TestPort, Q>, Arc<RecordingHooks>) {
    let cfg = Arc::new(b.finalize().unwrap());
    let (mut k, hooks) = kernel_with_queue(cfg, port);
    k.start_os(AppMode::new(0)).unwrap();
    (k, hooks)
}

/// Finalize `b` and start a single-core kernel in the default mode.
pub(crate) fn boot(b: CfgBuilder) -> (Kernel<TestPort>, Arc<RecordingHooks>) {
    boot_inner(b, TestPort::default())
}

pub(crate) fn boot_with_queue<Q: Queue>(b: CfgBuilder) -> (Kernel<TestPort, Q>, Arc<RecordingHooks>) {
    boot_inner(b, TestPort::default())
}

/// Like [`boot`], but the port provides `n` 8-bit hardware timers.
pub(crate) fn boot_with_timers(b: CfgBuilder, n: usize) -> (Kernel<TestPort>, Arc<RecordingHooks>) {
    let port = TestPort {
        timers: vec![
            FakeTimer {
                max: 0xff,
                ..FakeTimer::default()
            };
            n
        ],
        ..TestPort::default()
    };
    boot_inner(b, port)
}
