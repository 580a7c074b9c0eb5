//! Startup checks
use alloc::{vec, vec::Vec};

use super::{
    AlarmAction, AlarmStart, Config, ConfigError, CounterDriver, ExpiryAction, ObjectKind,
    TableStart, MAX_APPLICATIONS,
};
use crate::kernel::{AlarmId, ApplicationId, CoreId, CounterId, ResourceId, ScheduleTableId, TaskId};

/// Compute the derived fields.
pub(super) fn resolve(cfg: &mut Config) -> Result<(), ConfigError> {
    if cfg.num_cores == 0 || cfg.num_cores > u16::MAX as usize {
        return Err(ConfigError::NoCores);
    }
    if cfg.num_priority_levels == 0 || cfg.num_priority_levels > 1 << 16 {
        return Err(ConfigError::PriorityLevels);
    }
    let highest = cfg.highest_priority();

    let mut next_record = 0;
    for task in cfg.tasks.iter_mut() {
        if task.non_preemptive {
            task.run_priority = highest;
        }
        task.record_base = next_record;
        next_record += task.max_activations as usize;
    }
    cfg.num_activation_records = next_record;

    for res in cfg.resources.iter_mut() {
        if res.is_scheduler {
            res.ceiling = highest;
        }
    }

    for (i, alarm) in cfg.alarms.iter_mut().enumerate() {
        let counter = cfg
            .counters
            .get(alarm.counter.index())
            .ok_or(ConfigError::AlarmTarget(AlarmId::from_index(i)))?;
        alarm.core = counter.core;
    }

    for (i, st) in cfg.schedule_tables.iter_mut().enumerate() {
        let counter = cfg
            .counters
            .get(st.counter.index())
            .ok_or(ConfigError::ScheduleTableTarget(ScheduleTableId::from_index(i)))?;
        st.core = counter.core;
    }

    Ok(())
}

pub(super) fn check(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.applications.len() > MAX_APPLICATIONS {
        return Err(ConfigError::TooManyApplications);
    }
    for (i, app) in cfg.applications.iter().enumerate() {
        check_owner(cfg, ObjectKind::Application, i, app.core, None)?;
    }

    check_tasks(cfg)?;

    for (i, isr) in cfg.isrs.iter().enumerate() {
        check_owner(cfg, ObjectKind::Isr, i, isr.core, isr.app)?;
    }

    for (i, res) in cfg.resources.iter().enumerate() {
        check_owner(cfg, ObjectKind::Resource, i, res.core, res.app)?;
        if res.ceiling as usize >= cfg.num_priority_levels {
            return Err(ConfigError::ResourceCeiling(ResourceId::from_index(i)));
        }
    }

    for (i, counter) in cfg.counters.iter().enumerate() {
        let id = CounterId::from_index(i);
        check_owner(cfg, ObjectKind::Counter, i, counter.core, counter.app)?;
        if counter.ticks_per_base == 0
            || counter.min_cycle == 0
            || counter.min_cycle > counter.max_allowed_value
        {
            return Err(ConfigError::CounterLimits(id));
        }
        if let CounterDriver::Hardware(_) = counter.driver {
            if counter.max_allowed_value & counter.max_allowed_value.wrapping_add(1) != 0 {
                return Err(ConfigError::HardwareCounter(id));
            }
        }
    }

    check_alarms(cfg)?;
    check_counter_graph(cfg)?;
    check_schedule_tables(cfg)?;

    for (i, app) in cfg.applications.iter().enumerate() {
        let id = ApplicationId::from_index(i);
        if let Some(task) = app.restart_task {
            if cfg.task(task).map(|t| t.app) != Some(Some(id)) {
                return Err(ConfigError::RestartTask(id));
            }
        }
    }

    Ok(())
}

fn check_owner(
    cfg: &Config,
    kind: ObjectKind,
    index: usize,
    core: CoreId,
    app: Option<ApplicationId>,
) -> Result<(), ConfigError> {
    if core.index() >= cfg.num_cores {
        return Err(ConfigError::BadCore { kind, index });
    }
    if let Some(app) = app {
        match cfg.application(app) {
            Some(app) if app.core == core => {}
            _ => return Err(ConfigError::BadApplication { kind, index }),
        }
    }
    Ok(())
}

fn check_tasks(cfg: &Config) -> Result<(), ConfigError> {
    for (i, task) in cfg.tasks.iter().enumerate() {
        let id = TaskId::from_index(i);
        check_owner(cfg, ObjectKind::Task, i, task.core, task.app)?;

        if task.priority as usize >= cfg.num_priority_levels
            || task.run_priority as usize >= cfg.num_priority_levels
            || task.run_priority < task.priority
        {
            return Err(ConfigError::TaskPriority(id));
        }

        if task.max_activations == 0 || (task.extended && task.max_activations != 1) {
            return Err(ConfigError::TaskActivations(id));
        }

        for &res_id in task.resources.iter() {
            match cfg.resource(res_id) {
                Some(res) if res.ceiling >= task.priority && res.core == task.core => {}
                _ => return Err(ConfigError::ResourceCeiling(res_id)),
            }
        }
    }
    Ok(())
}

fn check_alarms(cfg: &Config) -> Result<(), ConfigError> {
    for (i, alarm) in cfg.alarms.iter().enumerate() {
        let id = AlarmId::from_index(i);
        check_owner(cfg, ObjectKind::Alarm, i, alarm.core, alarm.app)?;
        let counter = &cfg.counters[alarm.counter.index()];

        let target_ok = match alarm.action {
            AlarmAction::ActivateTask(task) => cfg.task(task).is_some(),
            AlarmAction::SetEvent(task, _) => cfg.task(task).is_some_and(|t| t.extended),
            AlarmAction::Callback(_) => true,
            AlarmAction::IncrementCounter(target) => cfg.counter(target).is_some_and(|c| {
                c.driver == CounterDriver::Software
                    && c.core == alarm.core
                    && target != alarm.counter
            }),
            AlarmAction::RunSchedule(st) => cfg.schedule_table(st).is_some_and(|st| st.alarm == id),
        };
        if !target_ok {
            return Err(ConfigError::AlarmTarget(id));
        }

        if let Some(auto) = alarm.autostart {
            let value_ok = match auto.start {
                AlarmStart::Absolute => auto.value <= counter.max_allowed_value,
                AlarmStart::Relative => {
                    auto.value >= 1 && auto.value <= counter.max_allowed_value
                }
            };
            let cycle_ok = auto.cycle == 0
                || (counter.min_cycle..=counter.max_allowed_value).contains(&auto.cycle);
            if !value_ok || !cycle_ok {
                return Err(ConfigError::AlarmAutostart(id));
            }
        }
    }
    Ok(())
}

/// Alarms with `IncrementCounter` actions form edges between counters. A
/// cycle would make a single tick recurse forever.
fn check_counter_graph(cfg: &Config) -> Result<(), ConfigError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Visiting,
        Done,
    }

    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); cfg.counters.len()];
    for alarm in cfg.alarms.iter() {
        if let AlarmAction::IncrementCounter(target) = alarm.action {
            edges[alarm.counter.index()].push(target.index());
        }
    }

    let mut marks = vec![Mark::Unvisited; cfg.counters.len()];
    for root in 0..cfg.counters.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        // Iterative DFS; the stack holds (node, next edge index)
        let mut stack = vec![(root, 0)];
        marks[root] = Mark::Visiting;
        while let Some((node, edge_i)) = stack.pop() {
            if let Some(&next) = edges[node].get(edge_i) {
                stack.push((node, edge_i + 1));
                match marks[next] {
                    Mark::Visiting => {
                        return Err(ConfigError::CounterCycle(CounterId::from_index(next)))
                    }
                    Mark::Unvisited => {
                        marks[next] = Mark::Visiting;
                        stack.push((next, 0));
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node] = Mark::Done;
            }
        }
    }
    Ok(())
}

fn check_schedule_tables(cfg: &Config) -> Result<(), ConfigError> {
    for (i, st) in cfg.schedule_tables.iter().enumerate() {
        let id = ScheduleTableId::from_index(i);
        check_owner(cfg, ObjectKind::ScheduleTable, i, st.core, st.app)?;
        let counter = &cfg.counters[st.counter.index()];

        if st.points.is_empty()
            || st.duration == 0
            || st.duration as u64 > counter.modulus()
            || st.points.windows(2).any(|w| w[0].offset >= w[1].offset)
            || st.points.last().is_some_and(|p| p.offset > st.duration)
        {
            return Err(ConfigError::ScheduleTablePoints(id));
        }

        for (point_i, point) in st.points.iter().enumerate() {
            let delay = st.delay_after(point_i) as u64;
            if (point.max_shorten > 0 && point.max_shorten as u64 >= delay)
                || delay + point.max_lengthen as u64 > counter.max_allowed_value as u64
            {
                return Err(ConfigError::ScheduleTablePoints(id));
            }

            for action in point.actions.iter() {
                let ok = match *action {
                    ExpiryAction::ActivateTask(task) => cfg.task(task).is_some(),
                    ExpiryAction::SetEvent(task, _) => cfg.task(task).is_some_and(|t| t.extended),
                };
                if !ok {
                    return Err(ConfigError::ScheduleTableTarget(id));
                }
            }
        }

        if st.is_implicit() && (st.is_syncable() || st.duration as u64 != counter.modulus()) {
            return Err(ConfigError::ScheduleTableSync(id));
        }

        if let Some(auto) = st.autostart {
            let ok = match auto.start {
                TableStart::Absolute(value) => value <= counter.max_allowed_value,
                TableStart::Relative(offset) => {
                    !st.is_implicit()
                        && offset >= 1
                        && offset as u64 + st.initial_offset() as u64
                            <= counter.max_allowed_value as u64
                }
                TableStart::Synchron => st.is_syncable(),
            };
            if !ok {
                return Err(ConfigError::ScheduleTableAutostart(id));
            }
        }
    }
    Ok(())
}
