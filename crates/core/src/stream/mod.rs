//! The run contract shared by every stream.
//!
//! A [`Stream`] is a blueprint: it pairs an immutable attribute descriptor
//! with a [`Source`] that knows how to start one live execution. Each call to
//! [`Stream::run`] starts an independent execution that pushes notifications
//! into a [`Sink`] until it ends, fails, or its [`Disposable`] is disposed.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use serde_json::Value;

use crate::{
    attributes::{self, Attributes, Specification},
    PropagationError, Result, Scheduler, Time, ValidationError, WiringError,
};

/// Consumer of a live execution.
///
/// Producers must not call a sink again once it has received `end` or
/// `error`, or once the execution has been disposed.
pub trait Sink {
    fn event(&self, time: Time, value: Value);
    fn end(&self, time: Time);
    fn error(&self, time: Time, error: PropagationError);
}

pub type SinkRef = Rc<dyn Sink>;

/// The `run` capability behind a stream.
pub trait Source {
    /// Performs the synchronous setup of one execution. Setup failures are
    /// returned, never delivered through the sink.
    fn run(&self, sink: SinkRef, scheduler: &Scheduler) -> Result<Disposable>;
}

/// Stateless stream blueprint.
#[derive(Clone)]
pub struct Stream {
    attributes: Rc<Attributes>,
    source: Rc<dyn Source>,
}

impl Stream {
    pub fn new(attributes: Attributes, source: impl Source + 'static) -> Self {
        Self {
            attributes: Rc::new(attributes),
            source: Rc::new(source),
        }
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn run(&self, sink: SinkRef, scheduler: &Scheduler) -> Result<Disposable> {
        self.source.run(sink, scheduler)
    }

    /// Whether both values share the same underlying blueprint.
    pub fn same(&self, other: &Stream) -> bool {
        Rc::ptr_eq(&self.source, &other.source)
    }

    /// Re-describes this stream after checking its descriptor against `spec`.
    /// The returned stream runs the same source.
    pub fn with_attributes(
        &self,
        label: &str,
        spec: &Specification,
    ) -> std::result::Result<Stream, ValidationError> {
        let derived = attributes::validate(label, spec, &self.attributes)?;
        Ok(Stream {
            attributes: Rc::new(derived),
            source: self.source.clone(),
        })
    }

    /// Fails when this stream, used as an argument of `label`, does not carry
    /// the `type` tag the operator depends on.
    pub fn require_type(&self, label: &str, tag: &str) -> std::result::Result<(), WiringError> {
        match self.attributes.type_tag() {
            Some(found) if found == tag => Ok(()),
            Some(found) => Err(WiringError::new(
                label,
                format!("expected a `{tag}` stream, found `{found}`"),
            )),
            None => Err(WiringError::new(
                label,
                format!("expected a `{tag}` stream, found an untagged stream"),
            )),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("attributes", &self.attributes)
            .finish()
    }
}

type DisposeAction = Box<dyn FnOnce()>;

/// Releases whatever a `run` call acquired.
///
/// Clones share the same action, and the action runs at most once no matter
/// how many clones call [`Disposable::dispose`].
#[derive(Clone)]
pub struct Disposable {
    action: Rc<RefCell<Option<DisposeAction>>>,
}

impl Disposable {
    pub fn new(action: impl FnOnce() + 'static) -> Self {
        Self {
            action: Rc::new(RefCell::new(Some(Box::new(action)))),
        }
    }

    /// A disposable with nothing to release.
    pub fn empty() -> Self {
        Self {
            action: Rc::new(RefCell::new(None)),
        }
    }

    pub fn dispose(&self) {
        let action = self.action.borrow_mut().take();
        if let Some(action) = action {
            action();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.action.borrow().is_none()
    }
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposable")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Wraps a sink so that nothing reaches it after `end` or `error`.
pub struct Guarded {
    inner: SinkRef,
    closed: Cell<bool>,
}

impl Guarded {
    pub fn new(inner: SinkRef) -> Rc<Self> {
        Rc::new(Self {
            inner,
            closed: Cell::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Marks the sink closed without notifying it.
    pub fn close(&self) {
        self.closed.set(true);
    }
}

impl Sink for Guarded {
    fn event(&self, time: Time, value: Value) {
        if !self.closed.get() {
            self.inner.event(time, value);
        }
    }

    fn end(&self, time: Time) {
        if !self.closed.replace(true) {
            self.inner.end(time);
        }
    }

    fn error(&self, time: Time, error: PropagationError) {
        if !self.closed.replace(true) {
            self.inner.error(time, error);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Sinks and sources shared by the unit tests of several modules.

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Note {
        Event(Time, Value),
        End(Time),
        Error(Time, String),
    }

    /// Sink that records every notification it receives.
    #[derive(Default)]
    pub struct Recorder {
        notes: RefCell<Vec<Note>>,
    }

    impl Recorder {
        pub fn new() -> Rc<Self> {
            Rc::new(Self::default())
        }

        pub fn notes(&self) -> Vec<Note> {
            self.notes.borrow().clone()
        }

        pub fn events(&self) -> Vec<(Time, Value)> {
            self.notes
                .borrow()
                .iter()
                .filter_map(|note| match note {
                    Note::Event(t, v) => Some((*t, v.clone())),
                    _ => None,
                })
                .collect()
        }

        pub fn ended(&self) -> bool {
            self.notes
                .borrow()
                .iter()
                .any(|note| matches!(note, Note::End(_) | Note::Error(..)))
        }
    }

    impl Sink for Recorder {
        fn event(&self, time: Time, value: Value) {
            self.notes.borrow_mut().push(Note::Event(time, value));
        }

        fn end(&self, time: Time) {
            self.notes.borrow_mut().push(Note::End(time));
        }

        fn error(&self, time: Time, error: PropagationError) {
            self.notes
                .borrow_mut()
                .push(Note::Error(time, error.message().to_string()));
        }
    }

    /// Shared journal of probe activity, used to assert ordering.
    pub type Journal = Rc<RefCell<Vec<String>>>;

    /// Wraps a stream and tracks how many of its executions are live.
    pub struct Probe {
        label: &'static str,
        inner: Stream,
        pub runs: Rc<Cell<usize>>,
        pub live: Rc<Cell<i64>>,
        pub journal: Journal,
    }

    impl Probe {
        pub fn new(label: &'static str, inner: Stream, journal: Journal) -> Rc<Self> {
            Rc::new(Self {
                label,
                inner,
                runs: Rc::new(Cell::new(0)),
                live: Rc::new(Cell::new(0)),
                journal,
            })
        }

        pub fn stream(probe: &Rc<Self>) -> Stream {
            Stream::new(probe.inner.attributes().clone(), ProbeSource(probe.clone()))
        }
    }

    struct ProbeSource(Rc<Probe>);

    impl Source for ProbeSource {
        fn run(&self, sink: SinkRef, scheduler: &Scheduler) -> Result<Disposable> {
            let probe = self.0.clone();
            probe.runs.set(probe.runs.get() + 1);
            probe.live.set(probe.live.get() + 1);
            probe.journal.borrow_mut().push(format!("run:{}", probe.label));
            let inner = probe.inner.run(sink, scheduler)?;
            Ok(Disposable::new(move || {
                inner.dispose();
                probe.live.set(probe.live.get() - 1);
                probe.journal.borrow_mut().push(format!("dispose:{}", probe.label));
            }))
        }
    }

    /// Source whose setup always fails.
    pub struct Broken;

    impl Source for Broken {
        fn run(&self, _sink: SinkRef, _scheduler: &Scheduler) -> Result<Disposable> {
            Err(crate::KineticError::msg("device unavailable"))
        }
    }
}
