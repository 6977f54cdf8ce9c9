// Cooperative task scheduler.
//
// Tasks are periodic callbacks dispatched from the main tick,
// highest priority first, slot order within a priority. A task
// whose interval is zero is a one-shot: it runs on its first due
// tick and is then deleted. Callbacks run to completion; there is
// no preemption anywhere in the runtime.

pub type TaskId = u32;
pub type TaskFn = Box<dyn FnMut()>;


#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

const PRIORITIES: [Priority; 4] = [
    Priority::Critical,
    Priority::High,
    Priority::Normal,
    Priority::Low,
];


#[derive(Clone, Debug, PartialEq)]
pub enum SchedError {
    CapacityExhausted,
    NotFound,
}

pub type Result<T> = core::result::Result<T, SchedError>;


struct Task {
    id: TaskId,
    function: TaskFn,
    interval_ms: u64,
    last_run: u64,
    priority: Priority,
    enabled: bool,
}


pub struct Scheduler {
    tasks: Vec<Option<Task>>,
    count: usize,
    next_id: TaskId,
}

impl Scheduler {
    pub fn new(max_tasks: usize) -> Scheduler {
        let mut tasks = Vec::with_capacity(max_tasks);
        tasks.resize_with(max_tasks, || None);
        Scheduler {
            tasks,
            count: 0,
            next_id: 1,
        }
    }

    pub fn create(
        &mut self,
        function: TaskFn,
        interval_ms: u64,
        priority: Priority
    ) -> Result<TaskId> {
        let slot = self.tasks
            .iter()
            .position(Option::is_none)
            .ok_or(SchedError::CapacityExhausted)?;

        let id = self.next_id;
        self.next_id += 1;

        self.tasks[slot] = Some(Task {
            id,
            function,
            interval_ms,
            last_run: 0,
            priority,
            enabled: true,
        });
        self.count += 1;

        Ok(id)
    }

    pub fn set_enabled(&mut self, id: TaskId, enabled: bool) -> Result<()> {
        let task = self.tasks
            .iter_mut()
            .flatten()
            .find(|t| t.id == id)
            .ok_or(SchedError::NotFound)?;
        task.enabled = enabled;
        Ok(())
    }

    pub fn delete(&mut self, id: TaskId) -> Result<()> {
        let slot = self.tasks
            .iter()
            .position(|t| t.as_ref().map_or(false, |t| t.id == id))
            .ok_or(SchedError::NotFound)?;
        self.tasks[slot] = None;
        self.count -= 1;
        Ok(())
    }

    pub fn task_count(&self) -> usize {
        self.count
    }

    // Run every task that is due at `now`, priority-major, slot
    // order minor. Returns the number of callbacks invoked.
    pub fn process(&mut self, now: u64) -> usize {
        let mut executed = 0;

        for &priority in &PRIORITIES {
            for slot in 0..self.tasks.len() {
                let due = match &self.tasks[slot] {
                    Some(t) => {
                        t.priority == priority
                            && t.enabled
                            && (t.last_run == 0
                                || now.saturating_sub(t.last_run)
                                    >= t.interval_ms)
                    },
                    None => false,
                };
                if !due {
                    continue;
                }

                let one_shot = {
                    let task = self.tasks[slot].as_mut().unwrap();
                    (task.function)();
                    task.last_run = now;
                    task.interval_ms == 0
                };
                executed += 1;

                if one_shot {
                    self.tasks[slot] = None;
                    self.count -= 1;
                }
            }
        }

        executed
    }
}
