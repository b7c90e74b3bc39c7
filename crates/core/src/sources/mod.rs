//! Basic producers. Device-backed sources (motion, EMG, position) live
//! outside the core and only need to implement [`Source`].

use std::{cell::Cell, rc::Rc};

use serde_json::Value;

use crate::{
    attributes::{Attributes, SAMPLERATE, TYPE},
    Disposable, PropagationError, Result, Scheduler, Sink, SinkRef, Source, Stream, Time,
    ValidationError,
};

/// Emits the tick index (0, 1, 2, ...) at the current time and then every
/// `period` units.
pub fn periodic(period: Time) -> std::result::Result<Stream, ValidationError> {
    if !(period > 0.0 && period.is_finite()) {
        return Err(ValidationError::new(
            "periodic",
            "period",
            format!("is {period}, expected a positive number"),
        ));
    }

    let attributes = Attributes::scalar()
        .with(SAMPLERATE, 1.0 / period)
        .with(TYPE, "periodic");
    Ok(Stream::new(attributes, Periodic { period }))
}

/// Emits `value` once at the current time, then ends.
pub fn now(value: Value) -> Stream {
    from_values(Attributes::any(), vec![value])
}

/// Emits `value` at `time` (or immediately if it has passed), then ends.
pub fn at(time: Time, value: Value) -> Stream {
    Stream::new(Attributes::any(), At { time, value })
}

/// Emits every value at the current time, then ends.
pub fn from_values(attributes: Attributes, values: Vec<Value>) -> Stream {
    Stream::new(attributes, Values { values: values.into() })
}

/// Ends at the current time without emitting.
pub fn empty() -> Stream {
    from_values(Attributes::any(), Vec::new())
}

/// Never emits and never ends.
pub fn never(attributes: Attributes) -> Stream {
    Stream::new(attributes, Never)
}

/// Fails at the current time.
pub fn failing(message: impl AsRef<str>) -> Stream {
    Stream::new(
        Attributes::any(),
        Failing {
            error: PropagationError::new(message),
        },
    )
}

struct Periodic {
    period: Time,
}

impl Source for Periodic {
    fn run(&self, sink: SinkRef, scheduler: &Scheduler) -> Result<Disposable> {
        let tick = Cell::new(0_u64);
        let task = scheduler.schedule_periodic(self.period, move |time| {
            let index = tick.get();
            tick.set(index + 1);
            sink.event(time, Value::from(index));
        });
        Ok(Disposable::new(move || task.cancel()))
    }
}

struct At {
    time: Time,
    value: Value,
}

impl Source for At {
    fn run(&self, sink: SinkRef, scheduler: &Scheduler) -> Result<Disposable> {
        let value = self.value.clone();
        let task = scheduler.schedule_at(self.time, move |time| {
            sink.event(time, value.clone());
            sink.end(time);
        });
        Ok(Disposable::new(move || task.cancel()))
    }
}

struct Values {
    values: Rc<[Value]>,
}

impl Source for Values {
    fn run(&self, sink: SinkRef, scheduler: &Scheduler) -> Result<Disposable> {
        let values = self.values.clone();
        let task = scheduler.schedule_now(move |time| {
            for value in values.iter() {
                sink.event(time, value.clone());
            }
            sink.end(time);
        });
        Ok(Disposable::new(move || task.cancel()))
    }
}

struct Never;

impl Source for Never {
    fn run(&self, _sink: SinkRef, _scheduler: &Scheduler) -> Result<Disposable> {
        Ok(Disposable::empty())
    }
}

struct Failing {
    error: PropagationError,
}

impl Source for Failing {
    fn run(&self, sink: SinkRef, scheduler: &Scheduler) -> Result<Disposable> {
        let error = self.error.clone();
        let task = scheduler.schedule_now(move |time| sink.error(time, error.clone()));
        Ok(Disposable::new(move || task.cancel()))
    }
}
