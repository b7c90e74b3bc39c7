//! Disposal tokens: one-shot signals that resolve once a live execution has
//! released everything it acquired.

use std::{
    cell::Cell,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

use futures::{
    channel::oneshot,
    future::{self, LocalBoxFuture, Shared},
    FutureExt,
};

/// Awaitable completion of a teardown. Clones observe the same completion.
#[derive(Clone)]
pub struct Teardown {
    kind: Kind,
    future: Shared<LocalBoxFuture<'static, ()>>,
}

#[derive(Clone)]
enum Kind {
    Signal(Rc<Cell<bool>>),
    All(Rc<[Teardown]>),
}

/// Resolving side of a [`Teardown`]. Resolves on [`TeardownSignal::resolve`]
/// or, failing that, when dropped.
pub struct TeardownSignal {
    resolved: Rc<Cell<bool>>,
    sender: Option<oneshot::Sender<()>>,
}

/// Creates a pending token and the signal that resolves it.
pub fn pending() -> (TeardownSignal, Teardown) {
    let (sender, receiver) = oneshot::channel();
    let resolved = Rc::new(Cell::new(false));
    let signal = TeardownSignal {
        resolved: resolved.clone(),
        sender: Some(sender),
    };
    let teardown = Teardown {
        kind: Kind::Signal(resolved),
        future: receiver.map(|_| ()).boxed_local().shared(),
    };
    (signal, teardown)
}

impl Teardown {
    /// A token that is already resolved.
    pub fn ready() -> Self {
        Self {
            kind: Kind::Signal(Rc::new(Cell::new(true))),
            future: future::ready(()).boxed_local().shared(),
        }
    }

    /// Resolves once every token in `parts` has resolved.
    pub fn all(parts: impl IntoIterator<Item = Teardown>) -> Self {
        let parts: Rc<[Teardown]> = parts.into_iter().collect();
        let joined = future::join_all(parts.iter().cloned().collect::<Vec<_>>());
        Self {
            kind: Kind::All(parts),
            future: joined.map(|_| ()).boxed_local().shared(),
        }
    }

    pub fn is_complete(&self) -> bool {
        match &self.kind {
            Kind::Signal(resolved) => resolved.get(),
            Kind::All(parts) => parts.iter().all(Teardown::is_complete),
        }
    }
}

impl Future for Teardown {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.future).poll(cx)
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown")
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl TeardownSignal {
    pub fn resolve(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some(sender) = self.sender.take() {
            self.resolved.set(true);
            let _ = sender.send(());
        }
    }
}

impl Drop for TeardownSignal {
    fn drop(&mut self) {
        self.fire();
    }
}
