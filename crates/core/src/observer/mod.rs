use std::{cell::RefCell, rc::Rc};

use crate::{PropagationError, Result};

/// UI-side collaborator told about bindings as they come and go.
///
/// Notifications are best effort: a failing observer is logged and ignored,
/// it never interrupts start or stop.
pub trait BindingObserver {
    fn on_binding_started(&self, id: &str) -> Result<()>;

    fn on_binding_ended(&self, id: &str) -> Result<()>;

    fn on_binding_error(&self, _id: &str, _error: &PropagationError) -> Result<()> {
        Ok(())
    }
}

/// Observer that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl BindingObserver for NullObserver {
    fn on_binding_started(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    fn on_binding_ended(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

/// Keeps the list of currently running binding ids, in start order, along
/// with the runtime errors reported so far.
#[derive(Debug, Default, Clone)]
pub struct RunningList {
    running: Rc<RefCell<Vec<String>>>,
    errors: Rc<RefCell<Vec<(String, String)>>>,
}

impl RunningList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running(&self) -> Vec<String> {
        self.running.borrow().clone()
    }

    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.borrow().clone()
    }
}

impl BindingObserver for RunningList {
    fn on_binding_started(&self, id: &str) -> Result<()> {
        let mut running = self.running.borrow_mut();
        if !running.iter().any(|name| name == id) {
            running.push(id.to_string());
        }
        Ok(())
    }

    fn on_binding_ended(&self, id: &str) -> Result<()> {
        self.running.borrow_mut().retain(|name| name != id);
        Ok(())
    }

    fn on_binding_error(&self, id: &str, error: &PropagationError) -> Result<()> {
        self.errors
            .borrow_mut()
            .push((id.to_string(), error.message().to_string()));
        Ok(())
    }
}

/// Shared, swappable observer handle used by both lifecycle managers.
#[derive(Clone)]
pub(crate) struct ObserverSlot {
    observer: Rc<RefCell<Rc<dyn BindingObserver>>>,
}

impl ObserverSlot {
    pub(crate) fn new(observer: Rc<dyn BindingObserver>) -> Self {
        Self {
            observer: Rc::new(RefCell::new(observer)),
        }
    }

    pub(crate) fn replace(&self, observer: Rc<dyn BindingObserver>) {
        *self.observer.borrow_mut() = observer;
    }

    fn current(&self) -> Rc<dyn BindingObserver> {
        self.observer.borrow().clone()
    }

    pub(crate) fn started(&self, id: &str) {
        if let Err(err) = self.current().on_binding_started(id) {
            tracing::warn!(id, %err, "observer failed on binding start");
        }
    }

    pub(crate) fn ended(&self, id: &str) {
        if let Err(err) = self.current().on_binding_ended(id) {
            tracing::warn!(id, %err, "observer failed on binding end");
        }
    }

    pub(crate) fn failed(&self, id: &str, error: &PropagationError) {
        if let Err(err) = self.current().on_binding_error(id, error) {
            tracing::warn!(id, %err, "observer failed on binding error");
        }
    }
}

impl Default for ObserverSlot {
    fn default() -> Self {
        Self::new(Rc::new(NullObserver))
    }
}
