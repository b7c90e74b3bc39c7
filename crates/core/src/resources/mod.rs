//! Lifecycle of non-stream live objects such as synthesizers. Disposal is
//! synchronous: replacing or stopping a resource releases it before the call
//! returns.

use std::{cell::RefCell, collections::BTreeMap, rc::Rc};

use crate::{observer::ObserverSlot, BindingValue};

/// A live object that owns something external (an audio node, a voice).
pub trait Resource {
    /// Releases the object. Called at most once by the lifecycle manager.
    fn dispose(&self);

    fn kind(&self) -> &str {
        "resource"
    }
}

pub type ResourceRef = Rc<dyn Resource>;

pub struct ResourceLifecycle {
    live: RefCell<BTreeMap<String, ResourceRef>>,
    groups: RefCell<BTreeMap<String, Vec<String>>>,
    observer: ObserverSlot,
    separator: char,
}

impl ResourceLifecycle {
    pub(crate) fn new(observer: ObserverSlot, separator: char) -> Self {
        Self {
            live: RefCell::new(BTreeMap::new()),
            groups: RefCell::new(BTreeMap::new()),
            observer,
            separator,
        }
    }

    /// Starts whatever resources `value` holds under `name`, expanding arrays
    /// and records into member ids. Returns the started members; anything
    /// that holds no resource is a no-op.
    pub fn start(&self, name: &str, value: &BindingValue) -> Vec<(String, ResourceRef)> {
        let members = value.resource_members(name, self.separator);
        if members.is_empty() {
            return members;
        }

        let previous = self.groups.borrow_mut().remove(name);
        let mut stale = previous.unwrap_or_default();
        stale.push(name.to_string());
        for id in stale {
            if !members.iter().any(|(member, _)| *member == id) {
                self.stop_one(&id);
            }
        }

        if value.is_group() {
            let ids = members.iter().map(|(id, _)| id.clone()).collect();
            self.groups.borrow_mut().insert(name.to_string(), ids);
        }

        for (id, resource) in &members {
            self.start_one(id, resource.clone());
        }
        members
    }

    /// Registers `resource` under `id`, disposing whatever was there before.
    pub fn start_one(&self, id: &str, resource: ResourceRef) {
        let previous = self.live.borrow_mut().remove(id);
        if let Some(previous) = previous {
            if Rc::ptr_eq(&previous, &resource) {
                self.live.borrow_mut().insert(id.to_string(), previous);
                return;
            }
            tracing::debug!(id, kind = previous.kind(), "replacing resource");
            previous.dispose();
            self.observer.ended(id);
        }

        self.live.borrow_mut().insert(id.to_string(), resource);
        self.observer.started(id);
    }

    /// Disposes the resource or resource group bound to `name`. Returns
    /// whether anything was disposed.
    pub fn stop(&self, name: &str) -> bool {
        let group = self.groups.borrow_mut().remove(name);
        match group {
            Some(ids) => ids
                .iter()
                .fold(false, |stopped, id| self.stop_one(id) || stopped),
            None => self.stop_one(name),
        }
    }

    pub fn stop_one(&self, id: &str) -> bool {
        let removed = self.live.borrow_mut().remove(id);
        match removed {
            Some(resource) => {
                tracing::debug!(id, kind = resource.kind(), "disposing resource");
                resource.dispose();
                self.observer.ended(id);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.groups.borrow_mut().clear();
        for id in self.ids() {
            self.stop_one(&id);
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        if self.live.borrow().contains_key(name) {
            return true;
        }
        let groups = self.groups.borrow();
        let live = self.live.borrow();
        groups
            .get(name)
            .map(|ids| ids.iter().any(|id| live.contains_key(id)))
            .unwrap_or(false)
    }

    /// Whether `resource` is currently registered under any id.
    pub fn holds(&self, resource: &ResourceRef) -> bool {
        self.live
            .borrow()
            .values()
            .any(|live| Rc::ptr_eq(live, resource))
    }

    /// Member ids of the resource group bound to `name`; empty when `name`
    /// is not a group.
    pub fn group(&self, name: &str) -> Vec<String> {
        self.groups.borrow().get(name).cloned().unwrap_or_default()
    }

    /// Member ids of every live resource group.
    pub fn group_members(&self) -> Vec<String> {
        self.groups.borrow().values().flatten().cloned().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.live.borrow().keys().cloned().collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::Cell;

    use super::*;

    /// Synth stand-in that counts disposals.
    pub(crate) struct Voice {
        pub disposed: Cell<usize>,
    }

    impl Voice {
        pub(crate) fn new() -> Rc<Self> {
            Rc::new(Self {
                disposed: Cell::new(0),
            })
        }
    }

    impl Resource for Voice {
        fn dispose(&self) {
            self.disposed.set(self.disposed.get() + 1);
        }

        fn kind(&self) -> &str {
            "voice"
        }
    }

    fn lifecycle() -> ResourceLifecycle {
        ResourceLifecycle::new(ObserverSlot::default(), '.')
    }

    #[test]
    fn replacing_disposes_previous_synchronously() {
        let resources = lifecycle();
        let first = Voice::new();
        let second = Voice::new();

        resources.start("synth", &BindingValue::Resource(first.clone()));
        resources.start("synth", &BindingValue::Resource(second.clone()));

        assert_eq!(first.disposed.get(), 1);
        assert_eq!(second.disposed.get(), 0);
        assert_eq!(resources.ids(), vec!["synth".to_string()]);
    }

    #[test]
    fn restarting_the_same_instance_keeps_it_alive() {
        let resources = lifecycle();
        let voice = Voice::new();
        let value = BindingValue::Resource(voice.clone());

        resources.start("synth", &value);
        resources.start("synth", &value);
        assert_eq!(voice.disposed.get(), 0);
    }

    #[test]
    fn groups_stop_as_a_unit() {
        let resources = lifecycle();
        let voices = [Voice::new(), Voice::new(), Voice::new()];
        let value = BindingValue::Array(
            voices
                .iter()
                .map(|voice| BindingValue::Resource(voice.clone()))
                .collect(),
        );

        let started = resources.start("pad", &value);
        assert_eq!(started.len(), 3);
        assert!(resources.exists("pad"));
        assert!(resources.exists("pad.1"));

        assert!(resources.stop("pad"));
        assert!(voices.iter().all(|voice| voice.disposed.get() == 1));
        assert!(!resources.exists("pad"));
        assert!(!resources.stop("pad"));
    }

    #[test]
    fn shrinking_a_group_disposes_dropped_members() {
        let resources = lifecycle();
        let kept = Voice::new();
        let dropped = Voice::new();
        resources.start(
            "pad",
            &BindingValue::Array(vec![
                BindingValue::Resource(kept.clone()),
                BindingValue::Resource(dropped.clone()),
            ]),
        );
        resources.start(
            "pad",
            &BindingValue::Array(vec![BindingValue::Resource(kept.clone())]),
        );

        assert_eq!(kept.disposed.get(), 0);
        assert_eq!(dropped.disposed.get(), 1);
        assert_eq!(resources.ids(), vec!["pad.0".to_string()]);
    }

    #[test]
    fn stopping_unknown_names_is_a_no_op() {
        let resources = lifecycle();
        assert!(!resources.stop("missing"));
        resources.clear();
    }
}
