//! Cross-core messaging
//!
//! Cores communicate through an [`Interconnect`] shared by all of them. A
//! service addressing an object owned by another core is turned into a
//! *request*, a fixed-size message consisting of an opcode and up to four
//! parameter words, and appended to the target core's mailbox. Each pair of
//! cores has its own FIFO mailbox, so requests from one core to another are
//! served in the order they were sent.
//!
//! A synchronous request carries a *reply slot*. The sender waits until the
//! target writes the result into it, serving the requests sent to itself in
//! the meantime. An asynchronous request (an alarm action targeting a task of
//! another core) has no reply slot; the target reports a failure to its own
//! error hook.
//!
//! The target validates every request before serving it. A request naming an
//! object the target doesn't own means the protocol is corrupted, which is a
//! fatal error.
use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use ecuos_core::kernel::{
    cfg::{AlarmStart, Config, TableStart},
    ActivateTaskError, AlarmId, ApplicationId, ApplicationState, CancelAlarmError,
    ChainScheduleTableError, CoreId, CounterId, ErrorInfo, EventMask, GetAlarmError,
    GetApplicationStateError, GetCounterValueError, GetCpuLoadError, GetEventError,
    GetScheduleTableStatusError, GetTaskStateError, RawState, ResultCode, ScheduleTableId,
    ScheduleTableStatus, ServiceId, SetAlarmError, SetEventError, SetScheduleTableAsyncError,
    SpinlockId, StartScheduleTableError, StopScheduleTableError, SyncScheduleTableError, TaskId,
    TaskState, TerminateApplicationError, Tick,
};

use crate::{cpuload::CpuLoadKind, Kernel, Port, Queue, RestartOption};

/// The state shared by all cores of a system.
pub struct Interconnect {
    num_cores: usize,
    /// Indexed by `to * num_cores + from`.
    mailboxes: Vec<spin::Mutex<VecDeque<XcMessage>>>,
    /// Cores that were activated with [`Interconnect::activate_core`].
    activated: Vec<AtomicBool>,
    started: Vec<AtomicBool>,
    shut_down: Vec<AtomicBool>,
    /// Spinlock owner words. Zero means free.
    spinlocks: Vec<AtomicU64>,
    /// The arrival counters of the two startup barriers.
    barriers: [AtomicUsize; 2],
}

impl Interconnect {
    /// Construct an `Interconnect` for the system described by `cfg`.
    pub fn new(cfg: &Config) -> Self {
        let n = cfg.num_cores;
        Self {
            num_cores: n,
            mailboxes: (0..n * n)
                .map(|_| spin::Mutex::new(VecDeque::new()))
                .collect(),
            activated: (0..n).map(|_| AtomicBool::new(false)).collect(),
            started: (0..n).map(|_| AtomicBool::new(false)).collect(),
            shut_down: (0..n).map(|_| AtomicBool::new(false)).collect(),
            spinlocks: cfg.spinlocks.iter().map(|_| AtomicU64::new(0)).collect(),
            barriers: [AtomicUsize::new(0), AtomicUsize::new(0)],
        }
    }

    /// Get the number of cores.
    #[inline]
    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    /// Get a flag indicating whether `core` has started and not shut down.
    pub fn is_running(&self, core: CoreId) -> bool {
        self.started[core.index()].load(Ordering::Acquire)
            && !self.shut_down[core.index()].load(Ordering::Acquire)
    }

    /// Get a flag indicating whether `core` has shut down.
    pub fn is_shut_down(&self, core: CoreId) -> bool {
        self.shut_down[core.index()].load(Ordering::Acquire)
    }

    /// Get the number of cores that have called `start_os`.
    pub fn num_started(&self) -> usize {
        self.started
            .iter()
            .filter(|x| x.load(Ordering::Acquire))
            .count()
    }

    /// Mark `core` as a participant of the system startup (`StartCore`).
    ///
    /// `start_os` doesn't let the first task run before every activated core
    /// has called `start_os` too. Cores that were never activated still join
    /// the startup by calling `start_os`, but nobody waits for them. Call this
    /// for every core before spawning the core threads.
    pub fn activate_core(&self, core: CoreId) {
        self.activated[core.index()].store(true, Ordering::Release);
    }

    /// Get the number of cores that were activated or have called
    /// `start_os` (`GetNumberOfActivatedCores`).
    pub fn num_activated(&self) -> usize {
        self.activated
            .iter()
            .zip(&self.started)
            .filter(|(a, s)| a.load(Ordering::Acquire) || s.load(Ordering::Acquire))
            .count()
    }

    pub(crate) fn mark_started(&self, core: CoreId) {
        self.started[core.index()].store(true, Ordering::Release);
    }

    pub(crate) fn mark_shut_down(&self, core: CoreId) {
        self.shut_down[core.index()].store(true, Ordering::Release);
    }

    /// Get a flag indicating whether `core` has pending messages.
    pub fn has_messages(&self, core: CoreId) -> bool {
        let n = self.num_cores;
        self.mailboxes[core.index() * n..][..n]
            .iter()
            .any(|mb| !mb.lock().is_empty())
    }

    fn post(&self, to: CoreId, msg: XcMessage) {
        let n = self.num_cores;
        self.mailboxes[to.index() * n + msg.from.index()]
            .lock()
            .push_back(msg);
    }

    /// Take the next message sent to `to`.
    fn take(&self, to: CoreId) -> Option<XcMessage> {
        let n = self.num_cores;
        self.mailboxes[to.index() * n..][..n]
            .iter()
            .find_map(|mb| mb.lock().pop_front())
    }

    /// Try to set the owner word of `spinlock` to `word`. Returns the current
    /// owner word on failure.
    pub(crate) fn try_lock_spinlock(
        &self,
        spinlock: SpinlockId,
        word: u64,
    ) -> Result<(), u64> {
        self.spinlocks[spinlock.index()]
            .compare_exchange(0, word, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| ())
    }

    /// Clear the owner word of `spinlock` if it's `word`.
    pub(crate) fn release_spinlock(&self, spinlock: SpinlockId, word: u64) -> bool {
        self.spinlocks[spinlock.index()]
            .compare_exchange(word, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn spinlock_owner(&self, spinlock: SpinlockId) -> u64 {
        self.spinlocks[spinlock.index()].load(Ordering::Relaxed)
    }

    /// Register the arrival of a core at the startup barrier `i`.
    pub(crate) fn arrive(&self, i: usize) {
        self.barriers[i].fetch_add(1, Ordering::AcqRel);
    }

    /// Get a flag indicating whether every participating core has arrived at
    /// the startup barrier `i`. Cores that shut down are not waited for.
    pub(crate) fn barrier_passed(&self, i: usize) -> bool {
        let pending = (0..self.num_cores)
            .filter(|&c| {
                let participates = self.activated[c].load(Ordering::Acquire)
                    || self.started[c].load(Ordering::Acquire);
                participates && !self.shut_down[c].load(Ordering::Acquire)
            })
            .count();
        self.barriers[i].load(Ordering::Acquire) >= pending
    }
}

/// A message in a mailbox.
struct XcMessage {
    from: CoreId,
    opcode: u8,
    params: [u32; 4],
    reply: Option<Arc<ReplySlot>>,
}

/// The location a synchronous request's result is written to.
struct ReplySlot {
    /// A [`ResultCode`] or [`ReplySlot::WAITING`]. Written last.
    code: AtomicU32,
    payload: [AtomicU32; 2],
}

impl ReplySlot {
    const WAITING: u32 = u32::MAX;

    fn new() -> Self {
        Self {
            code: AtomicU32::new(Self::WAITING),
            payload: [AtomicU32::new(0), AtomicU32::new(0)],
        }
    }

    fn complete(&self, code: ResultCode, payload: [u32; 2]) {
        for (slot, x) in self.payload.iter().zip(payload) {
            slot.store(x, Ordering::Relaxed);
        }
        self.code.store(code as u32, Ordering::Release);
    }

    fn poll(&self) -> Option<(u32, [u32; 2])> {
        match self.code.load(Ordering::Acquire) {
            Self::WAITING => None,
            code => Some((
                code,
                [
                    self.payload[0].load(Ordering::Relaxed),
                    self.payload[1].load(Ordering::Relaxed),
                ],
            )),
        }
    }
}

/// A value transported in a [`ReplySlot`].
pub(crate) trait XcReply: Sized {
    fn encode(self) -> [u32; 2];
    fn decode(raw: [u32; 2]) -> Option<Self>;
}

impl XcReply for () {
    fn encode(self) -> [u32; 2] {
        [0; 2]
    }
    fn decode(_: [u32; 2]) -> Option<Self> {
        Some(())
    }
}

impl XcReply for u32 {
    fn encode(self) -> [u32; 2] {
        [self, 0]
    }
    fn decode(raw: [u32; 2]) -> Option<Self> {
        Some(raw[0])
    }
}

macro_rules! impl_state_reply {
    ($($ty:ty),*) => {$(
        impl XcReply for $ty {
            fn encode(self) -> [u32; 2] {
                [self.to_raw_word(), 0]
            }
            fn decode(raw: [u32; 2]) -> Option<Self> {
                Self::from_raw_word(raw[0])
            }
        }
    )*};
}

impl_state_reply!(TaskState, ScheduleTableStatus, ApplicationState);

/// The error type of requests that can't fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Infallible {}

impl From<Infallible> for ResultCode {
    fn from(x: Infallible) -> Self {
        match x {}
    }
}

impl TryFrom<ResultCode> for Infallible {
    type Error = ResultCode;
    fn try_from(x: ResultCode) -> Result<Self, ResultCode> {
        Err(x)
    }
}

/// A request type.
pub(crate) trait XcRequest: Sized {
    const OPCODE: Opcode;
    /// `false` if the request is sent without a reply slot.
    const SYNC: bool = true;
    type Reply: XcReply;
    type Error: Copy + Into<ResultCode> + TryFrom<ResultCode>;

    fn encode(&self) -> [u32; 4];

    /// Reconstruct and validate a request received by `core`.
    fn decode(params: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self>;

    fn handle<P: Port, Q: Queue>(self, k: &mut Kernel<P, Q>)
        -> Result<Self::Reply, Self::Error>;
}

macro_rules! define_opcodes {
    ($( $name:ident ),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub(crate) enum Opcode {
            $( $name ),*
        }

        impl Opcode {
            fn from_u8(x: u8) -> Option<Self> {
                $(
                    if x == Self::$name as u8 {
                        return Some(Self::$name);
                    }
                )*
                None
            }
        }

        impl<P: Port, Q: Queue> Kernel<P, Q> {
            fn serve_opcode(&mut self, opcode: Opcode, msg: XcMessage) {
                match opcode {
                    $( Opcode::$name => self.serve::<$name>(msg), )*
                }
            }
        }
    };
}

define_opcodes! {
    ActivateTask,
    AlarmActivateTask,
    SetEvent,
    AlarmSetEvent,
    GetEvent,
    GetTaskState,
    GetAlarm,
    SetAlarm,
    CancelAlarm,
    GetCounterValue,
    StartScheduleTable,
    StopScheduleTable,
    ChainScheduleTable,
    SyncScheduleTable,
    SetScheduleTableAsync,
    GetScheduleTableStatus,
    TerminateApplication,
    GetApplicationState,
    GetCpuLoad,
    Shutdown,
}

// Identifier validation: the object must exist and belong to the receiving
// core
fn own_task(cfg: &Config, core: CoreId, raw: u32) -> Option<TaskId> {
    let id = TaskId::from_raw(raw)?;
    (cfg.task(id)?.core == core).then_some(id)
}

fn own_alarm(cfg: &Config, core: CoreId, raw: u32) -> Option<AlarmId> {
    let id = AlarmId::from_raw(raw)?;
    (cfg.alarm(id)?.core == core).then_some(id)
}

fn own_counter(cfg: &Config, core: CoreId, raw: u32) -> Option<CounterId> {
    let id = CounterId::from_raw(raw)?;
    (cfg.counter(id)?.core == core).then_some(id)
}

fn own_table(cfg: &Config, core: CoreId, raw: u32) -> Option<ScheduleTableId> {
    let id = ScheduleTableId::from_raw(raw)?;
    (cfg.schedule_table(id)?.core == core).then_some(id)
}

fn own_app(cfg: &Config, core: CoreId, raw: u32) -> Option<ApplicationId> {
    let id = ApplicationId::from_raw(raw)?;
    (cfg.application(id)?.core == core).then_some(id)
}

/// `ActivateTask`
pub(crate) struct ActivateTask {
    pub task: TaskId,
}

impl XcRequest for ActivateTask {
    const OPCODE: Opcode = Opcode::ActivateTask;
    type Reply = ();
    type Error = ActivateTaskError;

    fn encode(&self) -> [u32; 4] {
        [self.task.to_raw(), 0, 0, 0]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        Some(Self {
            task: own_task(cfg, core, p[0])?,
        })
    }

    fn handle<P: Port, Q: Queue>(self, k: &mut Kernel<P, Q>) -> Result<(), ActivateTaskError> {
        k.activate_task_local(self.task)
    }
}

/// The `ActivateTask` action of an expiring alarm or expiry point.
pub(crate) struct AlarmActivateTask {
    pub task: TaskId,
}

impl XcRequest for AlarmActivateTask {
    const OPCODE: Opcode = Opcode::AlarmActivateTask;
    const SYNC: bool = false;
    type Reply = ();
    type Error = ActivateTaskError;

    fn encode(&self) -> [u32; 4] {
        [self.task.to_raw(), 0, 0, 0]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        Some(Self {
            task: own_task(cfg, core, p[0])?,
        })
    }

    fn handle<P: Port, Q: Queue>(self, k: &mut Kernel<P, Q>) -> Result<(), ActivateTaskError> {
        k.activate_task_local(self.task)
    }
}

/// `SetEvent`
pub(crate) struct SetEvent {
    pub task: TaskId,
    pub mask: EventMask,
}

impl XcRequest for SetEvent {
    const OPCODE: Opcode = Opcode::SetEvent;
    type Reply = ();
    type Error = SetEventError;

    fn encode(&self) -> [u32; 4] {
        [self.task.to_raw(), self.mask, 0, 0]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        Some(Self {
            task: own_task(cfg, core, p[0])?,
            mask: p[1],
        })
    }

    fn handle<P: Port, Q: Queue>(self, k: &mut Kernel<P, Q>) -> Result<(), SetEventError> {
        k.set_event_local(self.task, self.mask)
    }
}

/// The `SetEvent` action of an expiring alarm or expiry point.
pub(crate) struct AlarmSetEvent {
    pub task: TaskId,
    pub mask: EventMask,
}

impl XcRequest for AlarmSetEvent {
    const OPCODE: Opcode = Opcode::AlarmSetEvent;
    const SYNC: bool = false;
    type Reply = ();
    type Error = SetEventError;

    fn encode(&self) -> [u32; 4] {
        [self.task.to_raw(), self.mask, 0, 0]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        Some(Self {
            task: own_task(cfg, core, p[0])?,
            mask: p[1],
        })
    }

    fn handle<P: Port, Q: Queue>(self, k: &mut Kernel<P, Q>) -> Result<(), SetEventError> {
        k.set_event_local(self.task, self.mask)
    }
}

/// `GetEvent`
pub(crate) struct GetEvent {
    pub task: TaskId,
}

impl XcRequest for GetEvent {
    const OPCODE: Opcode = Opcode::GetEvent;
    type Reply = EventMask;
    type Error = GetEventError;

    fn encode(&self) -> [u32; 4] {
        [self.task.to_raw(), 0, 0, 0]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        Some(Self {
            task: own_task(cfg, core, p[0])?,
        })
    }

    fn handle<P: Port, Q: Queue>(self, k: &mut Kernel<P, Q>) -> Result<EventMask, GetEventError> {
        k.get_event_local(self.task)
    }
}

/// `GetTaskState`
pub(crate) struct GetTaskState {
    pub task: TaskId,
}

impl XcRequest for GetTaskState {
    const OPCODE: Opcode = Opcode::GetTaskState;
    type Reply = TaskState;
    type Error = GetTaskStateError;

    fn encode(&self) -> [u32; 4] {
        [self.task.to_raw(), 0, 0, 0]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        Some(Self {
            task: own_task(cfg, core, p[0])?,
        })
    }

    fn handle<P: Port, Q: Queue>(
        self,
        k: &mut Kernel<P, Q>,
    ) -> Result<TaskState, GetTaskStateError> {
        Ok(k.task_state_local(self.task))
    }
}

/// `GetAlarm`
pub(crate) struct GetAlarm {
    pub alarm: AlarmId,
}

impl XcRequest for GetAlarm {
    const OPCODE: Opcode = Opcode::GetAlarm;
    type Reply = Tick;
    type Error = GetAlarmError;

    fn encode(&self) -> [u32; 4] {
        [self.alarm.to_raw(), 0, 0, 0]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        Some(Self {
            alarm: own_alarm(cfg, core, p[0])?,
        })
    }

    fn handle<P: Port, Q: Queue>(self, k: &mut Kernel<P, Q>) -> Result<Tick, GetAlarmError> {
        k.get_alarm_local(self.alarm)
    }
}

/// `SetRelAlarm` and `SetAbsAlarm`
pub(crate) struct SetAlarm {
    pub alarm: AlarmId,
    pub start: AlarmStart,
    pub value: Tick,
    pub cycle: Tick,
}

impl XcRequest for SetAlarm {
    const OPCODE: Opcode = Opcode::SetAlarm;
    type Reply = ();
    type Error = SetAlarmError;

    fn encode(&self) -> [u32; 4] {
        let start = match self.start {
            AlarmStart::Relative => 0,
            AlarmStart::Absolute => 1,
        };
        [self.alarm.to_raw(), start, self.value, self.cycle]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        let start = match p[1] {
            0 => AlarmStart::Relative,
            1 => AlarmStart::Absolute,
            _ => return None,
        };
        Some(Self {
            alarm: own_alarm(cfg, core, p[0])?,
            start,
            value: p[2],
            cycle: p[3],
        })
    }

    fn handle<P: Port, Q: Queue>(self, k: &mut Kernel<P, Q>) -> Result<(), SetAlarmError> {
        k.set_alarm_local(self.alarm, self.start, self.value, self.cycle)
    }
}

/// `CancelAlarm`
pub(crate) struct CancelAlarm {
    pub alarm: AlarmId,
}

impl XcRequest for CancelAlarm {
    const OPCODE: Opcode = Opcode::CancelAlarm;
    type Reply = ();
    type Error = CancelAlarmError;

    fn encode(&self) -> [u32; 4] {
        [self.alarm.to_raw(), 0, 0, 0]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        Some(Self {
            alarm: own_alarm(cfg, core, p[0])?,
        })
    }

    fn handle<P: Port, Q: Queue>(self, k: &mut Kernel<P, Q>) -> Result<(), CancelAlarmError> {
        k.cancel_alarm_local(self.alarm)
    }
}

/// `GetCounterValue`, also used by `GetElapsedValue`
pub(crate) struct GetCounterValue {
    pub counter: CounterId,
}

impl XcRequest for GetCounterValue {
    const OPCODE: Opcode = Opcode::GetCounterValue;
    type Reply = Tick;
    type Error = GetCounterValueError;

    fn encode(&self) -> [u32; 4] {
        [self.counter.to_raw(), 0, 0, 0]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        Some(Self {
            counter: own_counter(cfg, core, p[0])?,
        })
    }

    fn handle<P: Port, Q: Queue>(
        self,
        k: &mut Kernel<P, Q>,
    ) -> Result<Tick, GetCounterValueError> {
        Ok(k.counter_value_local(self.counter))
    }
}

/// `StartScheduleTableRel`, `StartScheduleTableAbs`, and
/// `StartScheduleTableSynchron`
pub(crate) struct StartScheduleTable {
    pub table: ScheduleTableId,
    pub start: TableStart,
}

impl XcRequest for StartScheduleTable {
    const OPCODE: Opcode = Opcode::StartScheduleTable;
    type Reply = ();
    type Error = StartScheduleTableError;

    fn encode(&self) -> [u32; 4] {
        let (kind, value) = match self.start {
            TableStart::Relative(x) => (0, x),
            TableStart::Absolute(x) => (1, x),
            TableStart::Synchron => (2, 0),
        };
        [self.table.to_raw(), kind, value, 0]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        let start = match p[1] {
            0 => TableStart::Relative(p[2]),
            1 => TableStart::Absolute(p[2]),
            2 => TableStart::Synchron,
            _ => return None,
        };
        Some(Self {
            table: own_table(cfg, core, p[0])?,
            start,
        })
    }

    fn handle<P: Port, Q: Queue>(
        self,
        k: &mut Kernel<P, Q>,
    ) -> Result<(), StartScheduleTableError> {
        k.start_schedule_table_local(self.table, self.start)
    }
}

/// `StopScheduleTable`
pub(crate) struct StopScheduleTable {
    pub table: ScheduleTableId,
}

impl XcRequest for StopScheduleTable {
    const OPCODE: Opcode = Opcode::StopScheduleTable;
    type Reply = ();
    type Error = StopScheduleTableError;

    fn encode(&self) -> [u32; 4] {
        [self.table.to_raw(), 0, 0, 0]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        Some(Self {
            table: own_table(cfg, core, p[0])?,
        })
    }

    fn handle<P: Port, Q: Queue>(
        self,
        k: &mut Kernel<P, Q>,
    ) -> Result<(), StopScheduleTableError> {
        k.stop_schedule_table_local(self.table)
    }
}

/// `ChainScheduleTable`
pub(crate) struct ChainScheduleTable {
    pub current: ScheduleTableId,
    pub next: ScheduleTableId,
}

impl XcRequest for ChainScheduleTable {
    const OPCODE: Opcode = Opcode::ChainScheduleTable;
    type Reply = ();
    type Error = ChainScheduleTableError;

    fn encode(&self) -> [u32; 4] {
        [self.current.to_raw(), self.next.to_raw(), 0, 0]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        Some(Self {
            current: own_table(cfg, core, p[0])?,
            next: own_table(cfg, core, p[1])?,
        })
    }

    fn handle<P: Port, Q: Queue>(
        self,
        k: &mut Kernel<P, Q>,
    ) -> Result<(), ChainScheduleTableError> {
        k.chain_schedule_table_local(self.current, self.next)
    }
}

/// `SyncScheduleTable`
pub(crate) struct SyncScheduleTable {
    pub table: ScheduleTableId,
    pub value: Tick,
}

impl XcRequest for SyncScheduleTable {
    const OPCODE: Opcode = Opcode::SyncScheduleTable;
    type Reply = ();
    type Error = SyncScheduleTableError;

    fn encode(&self) -> [u32; 4] {
        [self.table.to_raw(), self.value, 0, 0]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        Some(Self {
            table: own_table(cfg, core, p[0])?,
            value: p[1],
        })
    }

    fn handle<P: Port, Q: Queue>(
        self,
        k: &mut Kernel<P, Q>,
    ) -> Result<(), SyncScheduleTableError> {
        k.sync_schedule_table_local(self.table, self.value)
    }
}

/// `SetScheduleTableAsync`
pub(crate) struct SetScheduleTableAsync {
    pub table: ScheduleTableId,
}

impl XcRequest for SetScheduleTableAsync {
    const OPCODE: Opcode = Opcode::SetScheduleTableAsync;
    type Reply = ();
    type Error = SetScheduleTableAsyncError;

    fn encode(&self) -> [u32; 4] {
        [self.table.to_raw(), 0, 0, 0]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        Some(Self {
            table: own_table(cfg, core, p[0])?,
        })
    }

    fn handle<P: Port, Q: Queue>(
        self,
        k: &mut Kernel<P, Q>,
    ) -> Result<(), SetScheduleTableAsyncError> {
        k.set_schedule_table_async_local(self.table)
    }
}

/// `GetScheduleTableStatus`
pub(crate) struct GetScheduleTableStatus {
    pub table: ScheduleTableId,
}

impl XcRequest for GetScheduleTableStatus {
    const OPCODE: Opcode = Opcode::GetScheduleTableStatus;
    type Reply = ScheduleTableStatus;
    type Error = GetScheduleTableStatusError;

    fn encode(&self) -> [u32; 4] {
        [self.table.to_raw(), 0, 0, 0]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        Some(Self {
            table: own_table(cfg, core, p[0])?,
        })
    }

    fn handle<P: Port, Q: Queue>(
        self,
        k: &mut Kernel<P, Q>,
    ) -> Result<ScheduleTableStatus, GetScheduleTableStatusError> {
        Ok(k.tables[self.table.index()].status)
    }
}

/// `TerminateApplication`. The sender has already checked the caller's
/// rights.
pub(crate) struct TerminateApplication {
    pub app: ApplicationId,
    pub restart: RestartOption,
    /// The caller belongs to `app`.
    pub caller_in_app: bool,
}

impl XcRequest for TerminateApplication {
    const OPCODE: Opcode = Opcode::TerminateApplication;
    type Reply = ();
    type Error = TerminateApplicationError;

    fn encode(&self) -> [u32; 4] {
        [
            self.app.to_raw(),
            (self.restart == RestartOption::Restart) as u32,
            self.caller_in_app as u32,
            0,
        ]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        let restart = match p[1] {
            0 => RestartOption::NoRestart,
            1 => RestartOption::Restart,
            _ => return None,
        };
        Some(Self {
            app: own_app(cfg, core, p[0])?,
            restart,
            caller_in_app: p[2] != 0,
        })
    }

    fn handle<P: Port, Q: Queue>(
        self,
        k: &mut Kernel<P, Q>,
    ) -> Result<(), TerminateApplicationError> {
        k.terminate_application_local(self.app, self.restart, self.caller_in_app)
    }
}

/// `GetApplicationState`
pub(crate) struct GetApplicationState {
    pub app: ApplicationId,
}

impl XcRequest for GetApplicationState {
    const OPCODE: Opcode = Opcode::GetApplicationState;
    type Reply = ApplicationState;
    type Error = GetApplicationStateError;

    fn encode(&self) -> [u32; 4] {
        [self.app.to_raw(), 0, 0, 0]
    }

    fn decode(p: [u32; 4], cfg: &Config, core: CoreId) -> Option<Self> {
        Some(Self {
            app: own_app(cfg, core, p[0])?,
        })
    }

    fn handle<P: Port, Q: Queue>(
        self,
        k: &mut Kernel<P, Q>,
    ) -> Result<ApplicationState, GetApplicationStateError> {
        Ok(k.apps[self.app.index()].state)
    }
}

/// `GetCpuLoad` for another core
pub(crate) struct GetCpuLoad {
    pub kind: CpuLoadKind,
}

impl XcRequest for GetCpuLoad {
    const OPCODE: Opcode = Opcode::GetCpuLoad;
    type Reply = u32;
    type Error = GetCpuLoadError;

    fn encode(&self) -> [u32; 4] {
        [self.kind as u32, 0, 0, 0]
    }

    fn decode(p: [u32; 4], _: &Config, _: CoreId) -> Option<Self> {
        let kind = match p[0] {
            0 => CpuLoadKind::Average,
            1 => CpuLoadKind::Peak,
            _ => return None,
        };
        Some(Self { kind })
    }

    fn handle<P: Port, Q: Queue>(self, k: &mut Kernel<P, Q>) -> Result<u32, GetCpuLoadError> {
        Ok(k.cpu_load_local(self.kind) as u32)
    }
}

/// Shut down the receiving core (`ShutdownAllCores`).
pub(crate) struct Shutdown {
    pub code: ResultCode,
}

impl XcRequest for Shutdown {
    const OPCODE: Opcode = Opcode::Shutdown;
    const SYNC: bool = false;
    type Reply = ();
    type Error = Infallible;

    fn encode(&self) -> [u32; 4] {
        [self.code as u32, 0, 0, 0]
    }

    fn decode(p: [u32; 4], _: &Config, _: CoreId) -> Option<Self> {
        Some(Self {
            code: ResultCode::from_u8(u8::try_from(p[0]).ok()?)?,
        })
    }

    fn handle<P: Port, Q: Queue>(self, k: &mut Kernel<P, Q>) -> Result<(), Infallible> {
        k.shutdown_local(self.code);
        Ok(())
    }
}

/// These methods implement the sending and serving of requests.
impl<P: Port, Q: Queue> Kernel<P, Q> {
    /// Send a synchronous request to `core` and wait for the reply.
    ///
    /// Requests sent to this core are served while waiting. Returns `Core`
    /// if the target is not running or shuts down before replying.
    pub(crate) fn call_remote<R: XcRequest>(
        &mut self,
        core: CoreId,
        req: R,
    ) -> Result<R::Reply, R::Error> {
        debug_assert!(R::SYNC);
        if self.serving > 0 {
            // Serving a request never forwards another one
            self.panic_shutdown("cross-core call while serving a request");
        }
        if !self.xc.is_running(core) {
            return Err(self.error_from_code(ResultCode::Core));
        }

        log::trace!(
            "core {}: calling {:?} on core {}",
            self.core.index(),
            R::OPCODE,
            core.index()
        );
        let slot = Arc::new(ReplySlot::new());
        self.xc.post(
            core,
            XcMessage {
                from: self.core,
                opcode: R::OPCODE as u8,
                params: req.encode(),
                reply: Some(Arc::clone(&slot)),
            },
        );
        self.port.notify_core(core);

        self.dispatch_lock += 1;
        let reply = loop {
            if let Some(reply) = slot.poll() {
                break Some(reply);
            }
            if !self.xc.is_running(core) || self.phase == crate::Phase::ShutDown {
                break None;
            }
            if !self.pump_messages_inner() {
                self.port.idle_wait();
            }
        };
        self.dispatch_lock -= 1;

        let Some((code, payload)) = reply else {
            log::debug!(
                "core {}: core {} stopped before replying",
                self.core.index(),
                core.index()
            );
            return Err(self.error_from_code(ResultCode::Core));
        };
        match u8::try_from(code).ok().and_then(ResultCode::from_u8) {
            Some(ResultCode::Success) => match R::Reply::decode(payload) {
                Some(x) => Ok(x),
                None => self.panic_shutdown("malformed cross-core reply"),
            },
            Some(code) => Err(self.error_from_code(code)),
            None => self.panic_shutdown("malformed cross-core reply"),
        }
    }

    /// Send an asynchronous request to `core`.
    pub(crate) fn post_remote<R: XcRequest>(
        &mut self,
        core: CoreId,
        req: R,
    ) -> Result<(), ResultCode> {
        debug_assert!(!R::SYNC);
        if !self.xc.is_running(core) {
            return Err(ResultCode::Core);
        }
        log::trace!(
            "core {}: posting {:?} to core {}",
            self.core.index(),
            R::OPCODE,
            core.index()
        );
        self.xc.post(
            core,
            XcMessage {
                from: self.core,
                opcode: R::OPCODE as u8,
                params: req.encode(),
                reply: None,
            },
        );
        self.port.notify_core(core);
        Ok(())
    }

    /// Send `ShutdownAllCores` to every other running core.
    pub(crate) fn broadcast_shutdown(&mut self, code: ResultCode) {
        let this = self.core.index();
        for i in (0..self.xc.num_cores()).filter(|&i| i != this) {
            // A core that is not running has nothing to shut down
            let _ = self.post_remote(CoreId::from_index(i), Shutdown { code });
        }
    }

    fn error_from_code<E: TryFrom<ResultCode>>(&mut self, code: ResultCode) -> E {
        match E::try_from(code) {
            Ok(e) => e,
            Err(_) => self.panic_shutdown("unexpected cross-core result code"),
        }
    }

    /// Serve every request sent to this core, then dispatch the task that
    /// should run. Called by the port when [`Port::notify_core`] wakes this
    /// core up.
    pub fn pump_messages(&mut self) {
        self.pump_messages_inner();
        self.reschedule();
    }

    /// Serve every request sent to this core. Returns `true` if there was
    /// any.
    pub(crate) fn pump_messages_inner(&mut self) -> bool {
        let mut served = false;
        while let Some(msg) = self.xc.take(self.core) {
            served = true;
            let Some(opcode) = Opcode::from_u8(msg.opcode) else {
                self.panic_shutdown("unknown cross-core opcode");
            };
            self.serving += 1;
            self.dispatch_lock += 1;
            self.serve_opcode(opcode, msg);
            self.dispatch_lock -= 1;
            self.serving -= 1;
        }
        served
    }

    fn serve<R: XcRequest>(&mut self, msg: XcMessage) {
        if R::SYNC != msg.reply.is_some() {
            self.panic_shutdown("cross-core request with a wrong reply slot");
        }
        let Some(req) = R::decode(msg.params, &self.cfg, self.core) else {
            self.panic_shutdown("invalid cross-core request");
        };
        log::trace!(
            "core {}: serving {:?}{:?} from core {}",
            self.core.index(),
            R::OPCODE,
            &msg.params[..],
            msg.from.index()
        );

        let result = req.handle(self);
        match (msg.reply, result) {
            (Some(slot), result) => {
                match result {
                    Ok(x) => slot.complete(ResultCode::Success, x.encode()),
                    Err(e) => slot.complete(e.into(), [0; 2]),
                }
                self.port.notify_core(msg.from);
            }
            (None, Ok(_)) => {}
            (None, Err(e)) => {
                self.report_error(ErrorInfo::new(
                    ServiceId::AlarmAction,
                    e.into(),
                    &msg.params[..2],
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use ecuos_core::kernel::{cfg::*, SpinlockId};

    fn two_cores() -> (Config, TaskId, SpinlockId) {
        let mut b = CfgBuilder::new(2);
        let task = TaskDescriptor::build()
            .priority(1)
            .core(CoreId::new(1))
            .finish(&mut b);
        let s = b.spinlock(AccessSet::ALL);
        (b.finalize().unwrap(), task, s)
    }

    #[test]
    fn mailboxes_are_fifo_per_sender() {
        let (cfg, task, _) = two_cores();
        let xc = Interconnect::new(&cfg);
        for i in 0..3 {
            xc.post(
                CoreId::new(1),
                XcMessage {
                    from: CoreId::new(0),
                    opcode: Opcode::ActivateTask as u8,
                    params: [task.to_raw(), i, 0, 0],
                    reply: None,
                },
            );
        }
        assert!(xc.has_messages(CoreId::new(1)));
        assert!(!xc.has_messages(CoreId::new(0)));
        let order: Vec<u32> = core::iter::from_fn(|| xc.take(CoreId::new(1)))
            .map(|m| m.params[1])
            .collect();
        assert_eq!(order, [0, 1, 2]);
    }

    #[test]
    fn request_validation() {
        let (cfg, task, _) = two_cores();
        let req = ActivateTask { task };
        assert!(ActivateTask::decode(req.encode(), &cfg, CoreId::new(1)).is_some());
        // Not owned by core 0
        assert!(ActivateTask::decode(req.encode(), &cfg, CoreId::new(0)).is_none());
        assert!(ActivateTask::decode([99, 0, 0, 0], &cfg, CoreId::new(1)).is_none());
        assert!(SetAlarm::decode([0, 5, 0, 0], &cfg, CoreId::new(0)).is_none());
        assert_eq!(Opcode::from_u8(Opcode::Shutdown as u8), Some(Opcode::Shutdown));
        assert_eq!(Opcode::from_u8(200), None);
    }

    #[test]
    fn reply_slot() {
        let slot = ReplySlot::new();
        assert_eq!(slot.poll(), None);
        slot.complete(ResultCode::Limit, [7, 8]);
        assert_eq!(slot.poll(), Some((ResultCode::Limit as u32, [7, 8])));
    }

    #[test]
    fn spinlock_words() {
        let (cfg, _, s) = two_cores();
        let xc = Interconnect::new(&cfg);
        assert_eq!(xc.try_lock_spinlock(s, 0x1_0000_0003), Ok(()));
        assert_eq!(xc.try_lock_spinlock(s, 0x2_0000_0001), Err(0x1_0000_0003));
        assert!(!xc.release_spinlock(s, 0x2_0000_0001));
        assert!(xc.release_spinlock(s, 0x1_0000_0003));
        assert_eq!(xc.spinlock_owner(s), 0);
    }

    #[test]
    fn state_replies() {
        for st in [TaskState::Suspended, TaskState::Waiting] {
            assert_eq!(TaskState::decode(st.encode()), Some(st));
        }
        assert_eq!(ScheduleTableStatus::decode([77, 0]), None);
    }

    /// Construct the kernel of core 1 and deliver `msg` to it from core 0.
    fn serve_on_core1(cfg: Config, opcode: u8, params: [u32; 4], reply: bool) {
        let cfg = Arc::new(cfg);
        let xc = Arc::new(Interconnect::new(&cfg));
        let mut k: Kernel<TestPort> = Kernel::new(
            cfg,
            xc.clone(),
            Arc::new(RecordingHooks::default()),
            TestPort::default(),
            CoreId::new(1),
        );
        xc.post(
            CoreId::new(1),
            XcMessage {
                from: CoreId::new(0),
                opcode,
                params,
                reply: reply.then(|| Arc::new(ReplySlot::new())),
            },
        );
        k.pump_messages();
    }

    #[test]
    #[should_panic(expected = "unknown cross-core opcode")]
    fn unknown_opcode_is_fatal() {
        let (cfg, task, _) = two_cores();
        serve_on_core1(cfg, 200, [task.to_raw(), 0, 0, 0], true);
    }

    #[test]
    #[should_panic(expected = "invalid cross-core request")]
    fn foreign_id_is_fatal() {
        let (cfg, _, _) = two_cores();
        serve_on_core1(cfg, Opcode::ActivateTask as u8, [999, 0, 0, 0], true);
    }

    #[test]
    #[should_panic(expected = "wrong reply slot")]
    fn missing_reply_slot_is_fatal() {
        let (cfg, task, _) = two_cores();
        serve_on_core1(cfg, Opcode::ActivateTask as u8, [task.to_raw(), 0, 0, 0], false);
    }

}
