//! Turns an external `stop()` call into a terminal event inside a gated
//! stream, without polling.

use std::{cell::RefCell, fmt, rc::Rc};

use serde_json::Value;

use crate::{
    attributes::{Attributes, TYPE},
    Disposable, Result, Scheduler, SinkRef, Source, Stream,
};

type Fire = Rc<dyn Fn()>;

enum SlotState {
    /// No execution has armed the slot yet.
    Empty,
    Armed(Fire),
    /// `cancel()` arrived before the canceller ran.
    Requested,
    Spent,
}

/// Registry slot holding the `cancel` callback of one live binding.
///
/// The canceller stream arms the slot when it runs; the first `cancel()`
/// afterwards fires exactly once.
#[derive(Clone)]
pub struct CancelSlot {
    state: Rc<RefCell<SlotState>>,
}

impl CancelSlot {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SlotState::Empty)),
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(*self.state.borrow(), SlotState::Armed(_))
    }

    /// Requests termination. Returns `true` when this call injected the
    /// terminal event.
    pub fn cancel(&self) -> bool {
        let fire = {
            let mut state = self.state.borrow_mut();
            match std::mem::replace(&mut *state, SlotState::Spent) {
                SlotState::Armed(fire) => Some(fire),
                SlotState::Empty | SlotState::Requested => {
                    *state = SlotState::Requested;
                    None
                }
                SlotState::Spent => None,
            }
        };

        match fire {
            Some(fire) => {
                fire();
                true
            }
            None => false,
        }
    }

    /// Installs `fire`. Returns `true` if a cancel was already requested, in
    /// which case the slot is spent and the caller must fire on its own.
    fn arm(&self, fire: Fire) -> bool {
        let mut state = self.state.borrow_mut();
        match *state {
            SlotState::Requested => {
                *state = SlotState::Spent;
                true
            }
            SlotState::Spent => false,
            SlotState::Empty | SlotState::Armed(_) => {
                *state = SlotState::Armed(fire);
                false
            }
        }
    }

    fn disarm(&self) {
        let mut state = self.state.borrow_mut();
        if matches!(*state, SlotState::Armed(_)) {
            *state = SlotState::Spent;
        }
    }
}

impl Default for CancelSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.state.borrow() {
            SlotState::Empty => "empty",
            SlotState::Armed(_) => "armed",
            SlotState::Requested => "requested",
            SlotState::Spent => "spent",
        };
        f.debug_tuple("CancelSlot").field(&state).finish()
    }
}

/// Control stream that never emits on its own. Running it arms `slot`;
/// cancelling the slot then emits one `null` event at the current time.
pub fn canceller(slot: CancelSlot) -> Stream {
    Stream::new(Attributes::any().with(TYPE, "canceller"), Canceller { slot })
}

struct Canceller {
    slot: CancelSlot,
}

impl Source for Canceller {
    fn run(&self, sink: SinkRef, scheduler: &Scheduler) -> Result<Disposable> {
        let clock = scheduler.clone();
        let target = sink.clone();
        let fire: Fire = Rc::new(move || target.event(clock.current_time(), Value::Null));

        if self.slot.arm(fire.clone()) {
            // Emitting during setup would reach a gate that is not wired yet.
            let task = scheduler.schedule_now(move |_| fire());
            return Ok(Disposable::new(move || task.cancel()));
        }

        let slot = self.slot.clone();
        Ok(Disposable::new(move || slot.disarm()))
    }
}
