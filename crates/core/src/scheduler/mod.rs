use std::{
    cell::{Cell, RefCell},
    cmp::Ordering,
    collections::BinaryHeap,
    fmt,
    rc::Rc,
};

/// Logical time in abstract units. Only the scheduler advances it.
pub type Time = f64;

type Callback = Box<dyn FnMut(Time)>;

struct TaskCell {
    canceled: Cell<bool>,
    period: Option<Time>,
    callback: RefCell<Callback>,
}

struct QueueEntry {
    time: Time,
    seq: u64,
    task: Rc<TaskCell>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // BinaryHeap is a max-heap; earliest (time, seq) must surface first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct SchedulerState {
    now: Time,
    seq: u64,
    queue: BinaryHeap<QueueEntry>,
}

impl SchedulerState {
    fn push(&mut self, time: Time, task: Rc<TaskCell>) {
        let seq = self.seq;
        self.seq += 1;
        self.queue.push(QueueEntry { time, seq, task });
    }
}

/// Virtual-time scheduler shared by every live execution of a session.
///
/// Cloning the handle shares the same timeline. Callbacks are dispatched one
/// at a time from [`Scheduler::advance_to`]; the internal state is never
/// borrowed while a callback runs, so callbacks are free to schedule or
/// cancel further work.
#[derive(Clone, Default)]
pub struct Scheduler {
    state: Rc<RefCell<SchedulerState>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current logical time. Never decreases.
    pub fn current_time(&self) -> Time {
        self.state.borrow().now
    }

    /// Runs `task` once at `time`, or at the current time if `time` has
    /// already passed.
    pub fn schedule_at(&self, time: Time, task: impl FnMut(Time) + 'static) -> ScheduledTask {
        self.enqueue(time, None, Box::new(task))
    }

    pub fn schedule_after(&self, delay: Time, task: impl FnMut(Time) + 'static) -> ScheduledTask {
        let now = self.current_time();
        self.enqueue(now + delay.max(0.0), None, Box::new(task))
    }

    pub fn schedule_now(&self, task: impl FnMut(Time) + 'static) -> ScheduledTask {
        let now = self.current_time();
        self.enqueue(now, None, Box::new(task))
    }

    /// Runs `task` at the current time and then every `period` units until
    /// the returned handle is canceled. `period` must be positive.
    pub fn schedule_periodic(
        &self,
        period: Time,
        task: impl FnMut(Time) + 'static,
    ) -> ScheduledTask {
        let now = self.current_time();
        self.enqueue(now, Some(period.max(Time::EPSILON)), Box::new(task))
    }

    /// Dispatches every task due at or before `target` and moves the clock to
    /// `target`. Returns the number of callbacks that ran.
    pub fn advance_to(&self, target: Time) -> usize {
        let mut dispatched = 0;

        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                let due = state.queue.peek().map(|e| e.time <= target).unwrap_or(false);
                if due {
                    let entry = state.queue.pop();
                    if let Some(entry) = &entry {
                        state.now = state.now.max(entry.time);
                    }
                    entry
                } else {
                    None
                }
            };

            let Some(entry) = next else { break };
            if entry.task.canceled.get() {
                continue;
            }

            {
                let mut callback = entry.task.callback.borrow_mut();
                (*callback)(entry.time);
            }
            dispatched += 1;

            if let Some(period) = entry.task.period {
                if !entry.task.canceled.get() {
                    self.state
                        .borrow_mut()
                        .push(entry.time + period, entry.task.clone());
                }
            }
        }

        let mut state = self.state.borrow_mut();
        state.now = state.now.max(target);
        dispatched
    }

    pub fn advance_by(&self, delta: Time) -> usize {
        let target = self.current_time() + delta.max(0.0);
        self.advance_to(target)
    }

    /// Dispatches whatever is due at the current time without moving the clock.
    pub fn flush(&self) -> usize {
        self.advance_to(self.current_time())
    }

    /// Time of the earliest live task, if any.
    pub fn next_due(&self) -> Option<Time> {
        let mut state = self.state.borrow_mut();
        while let Some(entry) = state.queue.peek() {
            if entry.task.canceled.get() {
                state.queue.pop();
            } else {
                return Some(entry.time);
            }
        }
        None
    }

    /// Number of scheduled tasks that have not been canceled.
    pub fn pending(&self) -> usize {
        self.state
            .borrow()
            .queue
            .iter()
            .filter(|entry| !entry.task.canceled.get())
            .count()
    }

    fn enqueue(&self, time: Time, period: Option<Time>, callback: Callback) -> ScheduledTask {
        let task = Rc::new(TaskCell {
            canceled: Cell::new(false),
            period,
            callback: RefCell::new(callback),
        });
        let mut state = self.state.borrow_mut();
        let time = time.max(state.now);
        state.push(time, task.clone());
        ScheduledTask { task }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Scheduler")
            .field("now", &state.now)
            .field("queued", &state.queue.len())
            .finish()
    }
}

/// Handle to a scheduled callback.
#[derive(Clone)]
pub struct ScheduledTask {
    task: Rc<TaskCell>,
}

impl ScheduledTask {
    /// Prevents any further dispatch. Idempotent.
    pub fn cancel(&self) {
        self.task.canceled.set(true);
    }

    pub fn is_canceled(&self) -> bool {
        self.task.canceled.get()
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("periodic", &self.task.period.is_some())
            .field("canceled", &self.task.canceled.get())
            .finish()
    }
}
