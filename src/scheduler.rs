use std::collections::BTreeMap;

use crate::agent::AgentId;
use crate::world::RobotId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Task {
    Control(AgentId),
    Noise(RobotId),
}

#[derive(Clone, Debug)]
struct Registration {
    interval: f64,
    next_due: f64,
    task: Task,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    now: f64,
    next_id: u64,
    registrations: BTreeMap<TaskId, Registration>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.registrations.contains_key(&id)
    }

    pub fn every(&mut self, interval: f32, task: Task) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        let interval = f64::from(interval.max(f32::EPSILON));
        self.registrations.insert(
            id,
            Registration {
                interval,
                next_due: self.now + interval,
                task,
            },
        );
        id
    }

    pub fn cancel(&mut self, id: TaskId) -> bool {
        self.registrations.remove(&id).is_some()
    }

    /// Moves the clock forward by `dt` and returns the tasks that came due.
    ///
    /// A registration fires at most once per call; missed periods are skipped.
    /// Results are ordered by due time, then by registration order.
    pub fn advance(&mut self, dt: f32) -> Vec<Task> {
        self.now += f64::from(dt);
        let now = self.now;
        let mut due: Vec<(f64, TaskId, Task)> = Vec::new();
        for (id, registration) in &mut self.registrations {
            if registration.next_due > now {
                continue;
            }
            due.push((registration.next_due, *id, registration.task));
            while registration.next_due <= now {
                registration.next_due += registration.interval;
            }
        }
        due.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        due.into_iter().map(|(_, _, task)| task).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_per_interval() {
        let mut scheduler = Scheduler::new();
        scheduler.every(0.5, Task::Control(AgentId(1)));
        let mut fired = 0;
        for _ in 0..16 {
            fired += scheduler.advance(0.125).len();
        }
        assert_eq!(fired, 4);
    }

    #[test]
    fn cancelled_registration_never_fires() {
        let mut scheduler = Scheduler::new();
        let control = scheduler.every(0.1, Task::Control(AgentId(1)));
        scheduler.every(0.1, Task::Noise(RobotId(2)));
        assert!(scheduler.cancel(control));
        assert!(!scheduler.cancel(control));
        let fired = scheduler.advance(0.25);
        assert_eq!(fired, vec![Task::Noise(RobotId(2))]);
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn due_tasks_are_ordered_by_due_time_then_registration() {
        let mut scheduler = Scheduler::new();
        scheduler.every(0.3, Task::Control(AgentId(1)));
        scheduler.every(0.2, Task::Control(AgentId(2)));
        scheduler.every(0.3, Task::Control(AgentId(3)));
        let fired = scheduler.advance(0.35);
        assert_eq!(
            fired,
            vec![
                Task::Control(AgentId(2)),
                Task::Control(AgentId(1)),
                Task::Control(AgentId(3)),
            ]
        );
    }

    #[test]
    fn large_step_does_not_replay_missed_periods() {
        let mut scheduler = Scheduler::new();
        scheduler.every(0.25, Task::Control(AgentId(1)));
        assert_eq!(scheduler.advance(1.0).len(), 1);
        assert!(scheduler.advance(0.125).is_empty());
        assert_eq!(scheduler.advance(0.125).len(), 1);
    }

    #[test]
    fn clock_keeps_step_resolution_after_long_runs() {
        let mut scheduler = Scheduler::new();
        let dt = 1.0 / 120.0;
        for offset in [8_192.0, 65_536.0, 262_144.0, 4_194_304.0] {
            scheduler.advance(offset);
            let before = scheduler.now();
            scheduler.advance(dt);
            let moved = scheduler.now() - before;
            assert!((moved - f64::from(dt)).abs() < 1e-6, "moved {moved} at t={before}");
        }

        scheduler.every(0.02, Task::Control(AgentId(1)));
        let mut fired = 0;
        for _ in 0..1_200 {
            fired += scheduler.advance(dt).len();
        }
        assert!((495..=505).contains(&fired), "fired {fired} times");
    }
}
