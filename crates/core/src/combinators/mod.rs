//! Stream operators.
//!
//! [`Stream::multicast`] and [`Stream::until`] carry the live-reload
//! machinery: the first shares one upstream execution between any number of
//! consumers, the second ends an execution as soon as a control stream
//! emits. The remaining operators are thin per-event transforms; the
//! validated ones check the upstream descriptor when they are composed.

use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

use serde_json::Value;

use crate::{
    attributes::{Format, Rule, Size, Specification, FORMAT, SIZE},
    Disposable, Guarded, PropagationError, Result, Scheduler, Sink, SinkRef, Source, Stream, Time,
    ValidationError,
};

impl Stream {
    /// Shares a single upstream execution between every concurrent `run`.
    pub fn multicast(&self) -> Stream {
        Stream::new(
            self.attributes().clone(),
            Multicast {
                source: self.clone(),
                state: Rc::new(RefCell::new(MulticastState::default())),
            },
        )
    }

    /// Forwards this stream until `control` emits its first event, then ends
    /// and disposes both executions.
    pub fn until(&self, control: Stream) -> Stream {
        Stream::new(
            self.attributes().clone(),
            Until {
                source: self.clone(),
                control,
            },
        )
    }

    pub fn map<F>(&self, f: F) -> Stream
    where
        F: Fn(&Value) -> Value + 'static,
    {
        self.map_described(self.attributes().clone(), f)
    }

    /// Maps every event after validating the upstream descriptor against
    /// `spec`; the derived descriptor describes the output.
    pub fn map_with<F>(
        &self,
        label: &str,
        spec: &Specification,
        f: F,
    ) -> std::result::Result<Stream, ValidationError>
    where
        F: Fn(&Value) -> Value + 'static,
    {
        let described = self.with_attributes(label, spec)?;
        Ok(self.map_described(described.attributes().clone(), f))
    }

    /// Calls `f` for every event and forwards it unchanged.
    pub fn tap<F>(&self, f: F) -> Stream
    where
        F: Fn(Time, &Value) + 'static,
    {
        let f = Rc::new(f);
        operator(self, self.attributes().clone(), move |sink: SinkRef| {
            let f = f.clone();
            Box::new(move |time: Time, value: Value| {
                (*f)(time, &value);
                sink.event(time, value);
            })
        })
    }

    pub fn filter<F>(&self, predicate: F) -> Stream
    where
        F: Fn(&Value) -> bool + 'static,
    {
        let predicate = Rc::new(predicate);
        operator(self, self.attributes().clone(), move |sink: SinkRef| {
            let predicate = predicate.clone();
            Box::new(move |time: Time, value: Value| {
                if (*predicate)(&value) {
                    sink.event(time, value);
                }
            })
        })
    }

    /// Forwards the first `count` events, then ends.
    pub fn take(&self, count: usize) -> Stream {
        Stream::new(
            self.attributes().clone(),
            Take {
                source: self.clone(),
                count,
            },
        )
    }

    /// Picks one component of a vector stream.
    pub fn select(&self, index: usize) -> std::result::Result<Stream, ValidationError> {
        let spec = Specification::new()
            .rule(
                FORMAT,
                Rule::required().one_of([Format::Vector]).derive(Format::Scalar),
            )
            .rule(
                SIZE,
                Rule::required()
                    .min(index as f64 + 1.0)
                    .derive(Size::Fixed(1)),
            );
        self.map_with("select", &spec, move |value| {
            value.get(index).cloned().unwrap_or(Value::Null)
        })
    }

    /// Euclidean norm of a vector stream.
    pub fn magnitude(&self) -> std::result::Result<Stream, ValidationError> {
        let spec = Specification::new()
            .rule(
                FORMAT,
                Rule::required().one_of([Format::Vector]).derive(Format::Scalar),
            )
            .rule(SIZE, Rule::optional().derive(Size::Fixed(1)));
        self.map_with("magnitude", &spec, |value| {
            let squares: f64 = value
                .as_array()
                .map(|items| items.iter().filter_map(Value::as_f64).map(|x| x * x).sum())
                .unwrap_or(0.0);
            Value::from(squares.sqrt())
        })
    }

    fn map_described<F>(&self, attributes: crate::Attributes, f: F) -> Stream
    where
        F: Fn(&Value) -> Value + 'static,
    {
        let f = Rc::new(f);
        operator(self, attributes, move |sink: SinkRef| {
            let f = f.clone();
            Box::new(move |time: Time, value: Value| sink.event(time, (*f)(&value)))
        })
    }
}

fn operator<M>(source: &Stream, attributes: crate::Attributes, make: M) -> Stream
where
    M: Fn(SinkRef) -> OnEvent + 'static,
{
    Stream::new(
        attributes,
        Operator {
            source: source.clone(),
            make: Rc::new(make),
        },
    )
}

type OnEvent = Box<dyn Fn(Time, Value)>;
type MakeOnEvent = Rc<dyn Fn(SinkRef) -> OnEvent>;

/// Per-event transform; `end` and `error` pass straight through.
struct Operator {
    source: Stream,
    make: MakeOnEvent,
}

impl Source for Operator {
    fn run(&self, sink: SinkRef, scheduler: &Scheduler) -> Result<Disposable> {
        let on_event = (*self.make)(sink.clone());
        self.source
            .run(Rc::new(OperatorSink { on_event, sink }), scheduler)
    }
}

struct OperatorSink {
    on_event: OnEvent,
    sink: SinkRef,
}

impl Sink for OperatorSink {
    fn event(&self, time: Time, value: Value) {
        (self.on_event)(time, value);
    }

    fn end(&self, time: Time) {
        self.sink.end(time);
    }

    fn error(&self, time: Time, error: PropagationError) {
        self.sink.error(time, error);
    }
}

struct Take {
    source: Stream,
    count: usize,
}

impl Source for Take {
    fn run(&self, sink: SinkRef, scheduler: &Scheduler) -> Result<Disposable> {
        if self.count == 0 {
            let task = scheduler.schedule_now(move |time| sink.end(time));
            return Ok(Disposable::new(move || task.cancel()));
        }

        let state = Rc::new(TakeSink {
            sink: Guarded::new(sink),
            remaining: Cell::new(self.count),
            upstream: RefCell::new(None),
        });
        let upstream = self.source.run(state.clone(), scheduler)?;
        if state.sink.is_closed() {
            upstream.dispose();
        } else {
            *state.upstream.borrow_mut() = Some(upstream.clone());
        }
        Ok(upstream)
    }
}

struct TakeSink {
    sink: Rc<Guarded>,
    remaining: Cell<usize>,
    upstream: RefCell<Option<Disposable>>,
}

impl Sink for TakeSink {
    fn event(&self, time: Time, value: Value) {
        let remaining = self.remaining.get();
        if remaining == 0 || self.sink.is_closed() {
            return;
        }
        self.remaining.set(remaining - 1);
        self.sink.event(time, value);
        if remaining == 1 {
            self.sink.end(time);
            let upstream = self.upstream.borrow_mut().take();
            if let Some(upstream) = upstream {
                upstream.dispose();
            }
        }
    }

    fn end(&self, time: Time) {
        self.sink.end(time);
    }

    fn error(&self, time: Time, error: PropagationError) {
        self.sink.error(time, error);
    }
}

#[derive(Default)]
struct MulticastState {
    sinks: Vec<(u64, Rc<Guarded>)>,
    next_id: u64,
    active: bool,
    ended: bool,
    upstream: Option<Disposable>,
}

struct Multicast {
    source: Stream,
    state: Rc<RefCell<MulticastState>>,
}

impl Source for Multicast {
    fn run(&self, sink: SinkRef, scheduler: &Scheduler) -> Result<Disposable> {
        let (id, first) = {
            let mut state = self.state.borrow_mut();
            if state.ended {
                drop(state);
                sink.end(scheduler.current_time());
                return Ok(Disposable::empty());
            }
            let id = state.next_id;
            state.next_id += 1;
            state.sinks.push((id, Guarded::new(sink)));
            let first = !state.active;
            state.active = true;
            (id, first)
        };

        if first {
            let fan_out = Rc::new(FanOut {
                state: Rc::downgrade(&self.state),
            });
            match self.source.run(fan_out, scheduler) {
                Ok(upstream) => {
                    let finished = self.state.borrow().ended || !self.state.borrow().active;
                    if finished {
                        upstream.dispose();
                    } else {
                        self.state.borrow_mut().upstream = Some(upstream);
                    }
                }
                Err(err) => {
                    let mut state = self.state.borrow_mut();
                    state.sinks.clear();
                    state.active = false;
                    return Err(err);
                }
            }
        }

        let state = Rc::downgrade(&self.state);
        Ok(Disposable::new(move || detach(&state, id)))
    }
}

/// Removes one consumer; the last one out disposes the shared upstream.
///
/// The consumer is closed first, so a dispatch already in flight skips it.
fn detach(state: &Weak<RefCell<MulticastState>>, id: u64) {
    let Some(state) = state.upgrade() else { return };
    let upstream = {
        let mut state = state.borrow_mut();
        state.sinks.retain(|(sink_id, sink)| {
            if *sink_id == id {
                sink.close();
            }
            *sink_id != id
        });
        if state.sinks.is_empty() && state.active && !state.ended {
            state.active = false;
            state.upstream.take()
        } else {
            None
        }
    };
    if let Some(upstream) = upstream {
        upstream.dispose();
    }
}

struct FanOut {
    state: Weak<RefCell<MulticastState>>,
}

impl FanOut {
    fn snapshot(&self) -> Vec<Rc<Guarded>> {
        self.state
            .upgrade()
            .map(|state| {
                let state = state.borrow();
                if state.ended {
                    Vec::new()
                } else {
                    state.sinks.iter().map(|(_, sink)| sink.clone()).collect()
                }
            })
            .unwrap_or_default()
    }

    /// Marks the upstream finished and hands back the consumers to notify.
    fn finish(&self) -> Vec<Rc<Guarded>> {
        let Some(state) = self.state.upgrade() else {
            return Vec::new();
        };
        let (sinks, upstream) = {
            let mut state = state.borrow_mut();
            if state.ended {
                return Vec::new();
            }
            state.ended = true;
            let sinks = state.sinks.drain(..).map(|(_, sink)| sink).collect();
            (sinks, state.upstream.take())
        };
        if let Some(upstream) = upstream {
            upstream.dispose();
        }
        sinks
    }
}

impl Sink for FanOut {
    fn event(&self, time: Time, value: Value) {
        for sink in self.snapshot() {
            sink.event(time, value.clone());
        }
    }

    fn end(&self, time: Time) {
        for sink in self.finish() {
            sink.end(time);
        }
    }

    fn error(&self, time: Time, error: PropagationError) {
        for sink in self.finish() {
            sink.error(time, error.clone());
        }
    }
}

struct Until {
    source: Stream,
    control: Stream,
}

impl Source for Until {
    fn run(&self, sink: SinkRef, scheduler: &Scheduler) -> Result<Disposable> {
        let gate = Rc::new(Gate {
            sink: Guarded::new(sink),
            disposables: RefCell::new(Vec::new()),
        });

        let control = self.control.run(
            Rc::new(ControlSink { gate: gate.clone() }),
            scheduler,
        )?;
        gate.hold(control.clone());
        if gate.is_closed() {
            return Ok(control);
        }

        let primary = match self
            .source
            .run(Rc::new(PrimarySink { gate: gate.clone() }), scheduler)
        {
            Ok(primary) => primary,
            Err(err) => {
                gate.sink.close();
                gate.release();
                return Err(err);
            }
        };
        gate.hold(primary);

        let handle = gate.clone();
        Ok(Disposable::new(move || {
            handle.sink.close();
            handle.release();
        }))
    }
}

/// Shared state of one gated execution. Once closed it stays closed, so the
/// terminal notification is delivered at most once.
struct Gate {
    sink: Rc<Guarded>,
    disposables: RefCell<Vec<Disposable>>,
}

impl Gate {
    fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }

    fn hold(&self, disposable: Disposable) {
        if self.is_closed() {
            disposable.dispose();
        } else {
            self.disposables.borrow_mut().push(disposable);
        }
    }

    fn release(&self) {
        let disposables = std::mem::take(&mut *self.disposables.borrow_mut());
        for disposable in disposables {
            disposable.dispose();
        }
    }

    fn end(&self, time: Time) {
        if !self.is_closed() {
            self.sink.end(time);
            self.release();
        }
    }

    fn fail(&self, time: Time, error: PropagationError) {
        if !self.is_closed() {
            self.sink.error(time, error);
            self.release();
        }
    }
}

struct ControlSink {
    gate: Rc<Gate>,
}

impl Sink for ControlSink {
    fn event(&self, time: Time, _value: Value) {
        self.gate.end(time);
    }

    fn end(&self, _time: Time) {}

    fn error(&self, time: Time, error: PropagationError) {
        self.gate.fail(time, error);
    }
}

struct PrimarySink {
    gate: Rc<Gate>,
}

impl Sink for PrimarySink {
    fn event(&self, time: Time, value: Value) {
        self.gate.sink.event(time, value);
    }

    fn end(&self, time: Time) {
        self.gate.end(time);
    }

    fn error(&self, time: Time, error: PropagationError) {
        self.gate.fail(time, error);
    }
}
