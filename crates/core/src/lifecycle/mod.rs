//! Start, stop and restart of stream bindings.
//!
//! Every started stream is wrapped as `stream.until(canceller).multicast()`
//! and run against the session scheduler, with a terminal [`Drain`] sink
//! that owns the binding's disposal signal. Stopping a binding fires its
//! canceller; the gate ends the execution, the drain disposes it, removes the
//! registry entry and resolves the [`Teardown`] token. Restarting a name
//! awaits the previous token before the replacement is run, so two instances
//! of one binding never overlap.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    future::Future,
    rc::{Rc, Weak},
};

use serde_json::Value;

use crate::{
    binding::validate_name,
    canceller::canceller,
    observer::ObserverSlot,
    registry::{Registry, RegistryEntry},
    teardown::{self, TeardownSignal},
    BindingValue, CancelSlot, Disposable, PropagationError, Result, Scheduler, Sink, Stream,
    Teardown, Time,
};

struct Shared {
    scheduler: Scheduler,
    registry: RefCell<Registry>,
    groups: RefCell<BTreeMap<String, Vec<String>>>,
    observer: ObserverSlot,
    separator: char,
}

impl Shared {
    /// Forgets the groups containing `id` once none of their members is
    /// live any more.
    fn prune_groups(&self, id: &str) {
        let registry = self.registry.borrow();
        self.groups.borrow_mut().retain(|_, ids| {
            !ids.iter().any(|member| member == id)
                || ids.iter().any(|member| registry.contains(member))
        });
    }
}

/// Lifecycle manager for stream bindings. Cloning shares the same registry.
#[derive(Clone)]
pub struct StreamLifecycle {
    shared: Rc<Shared>,
}

impl StreamLifecycle {
    pub(crate) fn new(scheduler: Scheduler, observer: ObserverSlot, separator: char) -> Self {
        Self {
            shared: Rc::new(Shared {
                scheduler,
                registry: RefCell::new(Registry::new()),
                groups: RefCell::new(BTreeMap::new()),
                observer,
                separator,
            }),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    /// Starts the stream, or the streams of an array or record, bound to
    /// `name`. Group members run as `name.<index>` / `name.<key>`. Values that
    /// hold no stream are ignored.
    ///
    /// Whatever the previous binding of `name` left running and the new value
    /// does not replace is stopped first. If a member fails to set up, the
    /// members already started by this call are stopped again and the error
    /// is returned.
    pub fn start(
        &self,
        name: impl Into<String>,
        value: &BindingValue,
    ) -> impl Future<Output = Result<()>> + 'static {
        let name = name.into();
        let this = self.clone();
        let members = value.stream_members(&name, self.shared.separator);
        let is_group = value.is_group();

        async move {
            validate_name(&name)?;
            if members.is_empty() {
                tracing::trace!(name = %name, "binding holds no stream");
                return Ok(());
            }

            let ids: Vec<String> = members.iter().map(|(id, _)| id.clone()).collect();
            let previous = this.shared.groups.borrow_mut().remove(&name);
            let mut stale = previous.unwrap_or_default();
            stale.push(name.clone());
            stale.retain(|id| !ids.contains(id));
            this.stop_many(&stale).await;

            if is_group {
                this.shared
                    .groups
                    .borrow_mut()
                    .insert(name.clone(), ids.clone());
            }

            let mut started: Vec<String> = Vec::new();
            for (id, stream) in members {
                if let Err(err) = this.start_one(id.clone(), stream).await {
                    tracing::warn!(name = %name, id = %id, %err, "group start failed, rolling back");
                    this.shared.groups.borrow_mut().remove(&name);
                    this.stop_many(&started).await;
                    return Err(err);
                }
                started.push(id);
            }

            // Members that ended during setup may have pruned the group.
            if is_group {
                let live = {
                    let registry = this.shared.registry.borrow();
                    ids.iter().any(|id| registry.contains(id))
                };
                let mut groups = this.shared.groups.borrow_mut();
                if live {
                    groups.insert(name, ids);
                } else {
                    groups.remove(&name);
                }
            }
            Ok(())
        }
    }

    /// Starts a single stream under `id`, retiring any live instance first.
    pub fn start_one(
        &self,
        id: impl Into<String>,
        stream: Stream,
    ) -> impl Future<Output = Result<()>> + 'static {
        let id = id.into();
        let this = self.clone();

        async move {
            validate_name(&id)?;
            loop {
                let live = this.shared.registry.borrow().contains(&id);
                if !live {
                    break;
                }
                tracing::debug!(id = %id, "retiring previous instance");
                this.stop_one(&id).await;
            }
            this.launch(&id, stream)
        }
    }

    /// Stops `name` (a single binding or a whole group). Unknown names are a
    /// no-op and yield a resolved token.
    pub fn stop(&self, name: &str) -> Result<Teardown> {
        validate_name(name)?;
        let group = self.shared.groups.borrow_mut().remove(name);
        Ok(match group {
            Some(ids) => self.stop_many(&ids),
            None => self.stop_one(name),
        })
    }

    /// Fires the canceller of `id` and returns its pending disposal token.
    pub fn stop_one(&self, id: &str) -> Teardown {
        let found = self
            .shared
            .registry
            .borrow()
            .get(id)
            .map(|entry| (entry.cancel.clone(), entry.teardown.clone(), entry.generation));

        let Some((cancel, teardown, generation)) = found else {
            return Teardown::ready();
        };

        if teardown.is_complete() {
            // The execution is gone without having cleaned up after itself.
            self.shared
                .registry
                .borrow_mut()
                .remove_if_current(id, generation);
            return teardown;
        }

        tracing::debug!(id, "stopping binding");
        cancel.cancel();
        teardown
    }

    pub fn stop_many(&self, ids: &[String]) -> Teardown {
        Teardown::all(ids.iter().map(|id| self.stop_one(id)))
    }

    /// Stops every live binding.
    pub fn clear(&self) -> Teardown {
        self.shared.groups.borrow_mut().clear();
        let ids = self.shared.registry.borrow().ids();
        self.stop_many(&ids)
    }

    /// Whether `name` is live, either as a single binding or as a group with
    /// at least one live member.
    pub fn exists(&self, name: &str) -> bool {
        let registry = self.shared.registry.borrow();
        if registry.contains(name) {
            return true;
        }
        self.shared
            .groups
            .borrow()
            .get(name)
            .map(|ids| ids.iter().any(|id| registry.contains(id)))
            .unwrap_or(false)
    }

    pub fn find(&self, stream: &Stream) -> Option<String> {
        self.shared.registry.borrow().find(stream).map(str::to_string)
    }

    pub fn ids(&self) -> Vec<String> {
        self.shared.registry.borrow().ids()
    }

    /// Pending disposal token of a live binding.
    pub fn teardown(&self, id: &str) -> Option<Teardown> {
        self.shared
            .registry
            .borrow()
            .get(id)
            .map(|entry| entry.teardown.clone())
    }

    fn launch(&self, id: &str, stream: Stream) -> Result<()> {
        let slot = CancelSlot::new();
        let live = stream.until(canceller(slot.clone())).multicast();
        let (signal, teardown) = teardown::pending();

        let generation = {
            let mut registry = self.shared.registry.borrow_mut();
            let generation = registry.next_generation();
            registry.insert(RegistryEntry {
                id: id.to_string(),
                generation,
                source: stream,
                live: live.clone(),
                cancel: slot,
                teardown,
            })?;
            generation
        };

        let drain = Rc::new(Drain {
            id: id.to_string(),
            generation,
            owner: Rc::downgrade(&self.shared),
            signal: RefCell::new(Some(signal)),
            execution: RefCell::new(None),
            finished: Cell::new(false),
            announced: Cell::new(false),
        });

        match live.run(drain.clone(), &self.shared.scheduler) {
            Ok(execution) => drain.attach(execution),
            Err(err) => {
                self.shared
                    .registry
                    .borrow_mut()
                    .remove_if_current(id, generation);
                drain.abandon();
                tracing::warn!(id, %err, "binding failed to start");
                return Err(err);
            }
        }

        if !drain.finished.get() {
            drain.announced.set(true);
            self.shared.observer.started(id);
        }
        tracing::debug!(id, generation, "binding started");
        Ok(())
    }
}

/// Terminal sink of a live binding.
struct Drain {
    id: String,
    generation: u64,
    owner: Weak<Shared>,
    signal: RefCell<Option<TeardownSignal>>,
    execution: RefCell<Option<Disposable>>,
    finished: Cell<bool>,
    announced: Cell<bool>,
}

impl Drain {
    fn attach(&self, execution: Disposable) {
        if self.finished.get() {
            execution.dispose();
        } else {
            *self.execution.borrow_mut() = Some(execution);
        }
    }

    fn abandon(&self) {
        self.finished.set(true);
        let signal = self.signal.borrow_mut().take();
        drop(signal);
    }

    fn finish(&self, time: Time) {
        if self.finished.replace(true) {
            return;
        }

        let execution = self.execution.borrow_mut().take();
        if let Some(execution) = execution {
            execution.dispose();
        }

        if let Some(owner) = self.owner.upgrade() {
            owner
                .registry
                .borrow_mut()
                .remove_if_current(&self.id, self.generation);
            owner.prune_groups(&self.id);
            if self.announced.get() {
                owner.observer.ended(&self.id);
            }
        }

        tracing::debug!(id = %self.id, time, "binding ended");
        let signal = self.signal.borrow_mut().take();
        if let Some(signal) = signal {
            signal.resolve();
        }
    }
}

impl Sink for Drain {
    fn event(&self, time: Time, _value: Value) {
        tracing::trace!(id = %self.id, time, "event");
    }

    fn end(&self, time: Time) {
        self.finish(time);
    }

    fn error(&self, time: Time, error: PropagationError) {
        tracing::error!(id = %self.id, time, %error, "binding failed");
        if let Some(owner) = self.owner.upgrade() {
            owner.observer.failed(&self.id, &error);
        }
        self.finish(time);
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use futures::executor::block_on;
    use serde_json::json;

    use super::*;
    use crate::{
        sources,
        stream::testing::{Broken, Journal, Probe},
        Attributes, KineticError, LifecycleError, RunningList,
    };

    struct Harness {
        scheduler: Scheduler,
        streams: StreamLifecycle,
        running: RunningList,
        journal: Journal,
    }

    fn harness() -> Harness {
        let scheduler = Scheduler::new();
        let running = RunningList::new();
        let observer = ObserverSlot::new(Rc::new(running.clone()));
        Harness {
            streams: StreamLifecycle::new(scheduler.clone(), observer, '.'),
            scheduler,
            running,
            journal: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn ticking(h: &Harness, label: &'static str) -> Rc<Probe> {
        Probe::new(label, sources::periodic(10.0).unwrap(), h.journal.clone())
    }

    #[test]
    fn periodic_binding_emits_on_schedule() {
        let h = harness();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let stream = sources::periodic(10.0)
            .unwrap()
            .tap(move |t, _| sink.borrow_mut().push(t));

        block_on(h.streams.start("a", &BindingValue::Stream(stream))).unwrap();
        h.scheduler.advance_to(20.0);

        assert_eq!(*seen.borrow(), vec![0.0, 10.0, 20.0]);
        assert_eq!(h.running.running(), vec!["a".to_string()]);
    }

    #[test]
    fn restart_tears_down_before_setup() {
        let h = harness();
        let first = ticking(&h, "A");
        let second = ticking(&h, "B");

        block_on(h.streams.start_one("a", Probe::stream(&first))).unwrap();
        h.scheduler.advance_to(15.0);
        block_on(h.streams.start_one("a", Probe::stream(&second))).unwrap();

        assert_eq!(
            *h.journal.borrow(),
            vec!["run:A".to_string(), "dispose:A".to_string(), "run:B".to_string()]
        );
        assert_eq!(first.live.get() + second.live.get(), 1);
        assert_eq!(h.streams.ids(), vec!["a".to_string()]);
    }

    #[test]
    fn restarting_the_same_stream_keeps_one_execution() {
        let h = harness();
        let probe = ticking(&h, "A");
        let stream = Probe::stream(&probe);

        block_on(h.streams.start_one("a", stream.clone())).unwrap();
        block_on(h.streams.start_one("a", stream)).unwrap();

        assert_eq!(probe.runs.get(), 2);
        assert_eq!(probe.live.get(), 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let h = harness();
        assert!(h.streams.stop("missing").unwrap().is_complete());

        block_on(h.streams.start_one("x", sources::never(Attributes::any()))).unwrap();
        let teardown = h.streams.stop("x").unwrap();
        assert!(teardown.is_complete());
        block_on(teardown);

        assert!(h.streams.stop("x").unwrap().is_complete());
        assert!(!h.streams.exists("x"));
        assert!(h.running.running().is_empty());
    }

    #[test]
    fn invalid_names_are_rejected() {
        let h = harness();
        let err = h.streams.stop("").unwrap_err();
        assert!(matches!(
            err,
            KineticError::Lifecycle(LifecycleError::InvalidName(_))
        ));
    }

    #[test]
    fn array_group_starts_and_stops_as_a_unit() {
        let h = harness();
        let probes: Vec<Rc<Probe>> = ["p0", "p1", "p2"].into_iter().map(|l| ticking(&h, l)).collect();
        let value = BindingValue::from(probes.iter().map(Probe::stream).collect::<Vec<_>>());

        block_on(h.streams.start("name", &value)).unwrap();
        assert_eq!(h.streams.ids(), vec!["name.0", "name.1", "name.2"]);
        assert!(h.streams.exists("name"));

        let teardown = h.streams.stop("name").unwrap();
        block_on(teardown.clone());
        assert!(teardown.is_complete());
        assert!(h.streams.ids().is_empty());
        assert!(probes.iter().all(|probe| probe.live.get() == 0));
    }

    #[test]
    fn record_group_members_are_keyed() {
        let h = harness();
        let x = ticking(&h, "x");
        let y = ticking(&h, "y");
        let value = BindingValue::record([
            ("x", BindingValue::Stream(Probe::stream(&x))),
            ("y", BindingValue::Stream(Probe::stream(&y))),
            ("gain", BindingValue::Opaque(json!(0.5))),
        ]);

        block_on(h.streams.start("b", &value)).unwrap();
        assert_eq!(h.streams.ids(), vec!["b.x", "b.y"]);

        block_on(h.streams.stop("b").unwrap());
        assert_eq!(x.live.get() + y.live.get(), 0);
        assert!(!h.streams.exists("b"));
    }

    #[test]
    fn regrouping_stops_members_that_disappear() {
        let h = harness();
        let a = ticking(&h, "a");
        let b = ticking(&h, "b");
        let c = ticking(&h, "c");

        let two = BindingValue::from(vec![Probe::stream(&a), Probe::stream(&b)]);
        block_on(h.streams.start("g", &two)).unwrap();
        block_on(h.streams.start("g", &BindingValue::Stream(Probe::stream(&c)))).unwrap();

        assert_eq!(h.streams.ids(), vec!["g"]);
        assert_eq!(a.live.get() + b.live.get(), 0);
        assert_eq!(c.live.get(), 1);
    }

    #[test]
    fn natural_end_removes_the_entry() {
        let h = harness();
        let stream = sources::from_values(Attributes::scalar(), vec![json!(1)]);
        block_on(h.streams.start_one("once", stream)).unwrap();
        let teardown = h.streams.teardown("once").unwrap();
        assert!(h.streams.exists("once"));

        h.scheduler.flush();
        assert!(teardown.is_complete());
        assert!(!h.streams.exists("once"));
        assert!(h.running.running().is_empty());
    }

    #[test]
    fn group_is_forgotten_once_every_member_ends() {
        let h = harness();
        let value = BindingValue::from(vec![
            sources::from_values(Attributes::scalar(), vec![json!(1)]),
            sources::from_values(Attributes::scalar(), vec![json!(2), json!(3)]),
        ]);

        block_on(h.streams.start("burst", &value)).unwrap();
        assert!(h.streams.shared.groups.borrow().contains_key("burst"));

        h.scheduler.flush();
        assert!(h.streams.ids().is_empty());
        assert!(!h.streams.exists("burst"));
        assert!(h.streams.shared.groups.borrow().is_empty());
    }

    #[test]
    fn restarting_a_group_keeps_it_registered() {
        let h = harness();
        let probe = ticking(&h, "solo");
        let value = BindingValue::from(vec![Probe::stream(&probe)]);

        block_on(h.streams.start("g", &value)).unwrap();
        block_on(h.streams.start("g", &value)).unwrap();

        assert_eq!(probe.live.get(), 1);
        assert_eq!(
            h.streams.shared.groups.borrow().get("g"),
            Some(&vec!["g.0".to_string()])
        );
    }

    #[test]
    fn runtime_error_only_stops_the_failing_binding() {
        let h = harness();
        block_on(h.streams.start_one("bad", sources::failing("emg dropout"))).unwrap();
        block_on(h.streams.start_one("good", sources::periodic(1.0).unwrap())).unwrap();

        h.scheduler.advance_to(3.0);
        assert_eq!(h.streams.ids(), vec!["good"]);
        assert_eq!(
            h.running.errors(),
            vec![("bad".to_string(), "emg dropout".to_string())]
        );
    }

    #[test]
    fn setup_failure_rolls_back_registration() {
        let h = harness();
        let err = block_on(h.streams.start_one("dev", Stream::new(Attributes::any(), Broken)));

        assert!(err.is_err());
        assert!(!h.streams.exists("dev"));
        assert!(h.running.running().is_empty());
    }

    #[test]
    fn failing_group_member_rolls_back_siblings() {
        let h = harness();
        let ok = ticking(&h, "ok");
        let value = BindingValue::Array(vec![
            BindingValue::Stream(Probe::stream(&ok)),
            BindingValue::Stream(Stream::new(Attributes::any(), Broken)),
        ]);

        assert!(block_on(h.streams.start("g", &value)).is_err());
        assert!(h.streams.ids().is_empty());
        assert_eq!(ok.live.get(), 0);
    }

    #[test]
    fn clear_stops_everything_and_find_locates_streams() {
        let h = harness();
        let motion = sources::periodic(5.0).unwrap();
        block_on(h.streams.start_one("motion", motion.clone())).unwrap();
        block_on(h.streams.start_one("other", sources::never(Attributes::any()))).unwrap();

        assert_eq!(h.streams.find(&motion), Some("motion".to_string()));

        let teardown = h.streams.clear();
        block_on(teardown);
        assert!(h.streams.ids().is_empty());
        assert_eq!(h.streams.find(&motion), None);
        assert_eq!(h.scheduler.pending(), 0);
    }
}
