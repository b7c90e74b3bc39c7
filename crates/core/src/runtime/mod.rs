//! Session façade that the code-execution layer talks to. Owns the live
//! context and dispatches every start and stop to the stream or resource
//! lifecycle depending on what the bound value holds.

use std::{cell::RefCell, future::Future, rc::Rc};

use crate::{
    binding::validate_name, observer::ObserverSlot, BindingObserver, BindingValue, Context,
    ResourceLifecycle, Result, RuntimeConfig, Scheduler, Stream, StreamLifecycle, Teardown,
};

struct Inner {
    config: RuntimeConfig,
    scheduler: Scheduler,
    context: RefCell<Context>,
    streams: StreamLifecycle,
    resources: ResourceLifecycle,
    observer: ObserverSlot,
}

/// One live coding session. Cloning yields another handle to the same
/// session.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<Inner>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig, scheduler: Scheduler) -> Self {
        let observer = ObserverSlot::default();
        let separator = config.group_separator;
        Self {
            inner: Rc::new(Inner {
                streams: StreamLifecycle::new(scheduler.clone(), observer.clone(), separator),
                resources: ResourceLifecycle::new(observer.clone(), separator),
                context: RefCell::new(Context::new()),
                observer,
                scheduler,
                config,
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn streams(&self) -> &StreamLifecycle {
        &self.inner.streams
    }

    pub fn resources(&self) -> &ResourceLifecycle {
        &self.inner.resources
    }

    /// Routes binding notifications to `observer` from now on.
    pub fn set_observer(&self, observer: Rc<dyn BindingObserver>) {
        self.inner.observer.replace(observer);
    }

    /// Assigns `value` to `name` without starting anything.
    pub fn bind(
        &self,
        name: impl Into<String>,
        value: impl Into<BindingValue>,
    ) -> Result<Option<BindingValue>> {
        let name = name.into();
        validate_name(&name)?;
        Ok(self.inner.context.borrow_mut().bind(name, value.into()))
    }

    pub fn value(&self, name: &str) -> Option<BindingValue> {
        self.inner.context.borrow().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .context
            .borrow()
            .names()
            .map(str::to_string)
            .collect()
    }

    pub(crate) fn context(&self) -> &RefCell<Context> {
        &self.inner.context
    }

    /// Starts whatever is bound to `name`. Unbound names and plain values are
    /// a no-op.
    ///
    /// When a name that used to hold streams now holds only resources (or
    /// the other way round), the binding left on the other side is retired
    /// before the new one starts.
    pub fn start(&self, name: impl Into<String>) -> impl Future<Output = Result<()>> + 'static {
        let name = name.into();
        let this = self.clone();

        async move {
            validate_name(&name)?;
            let Some(value) = this.value(&name) else {
                tracing::trace!(name = %name, "nothing bound");
                return Ok(());
            };

            let separator = this.inner.config.group_separator;
            let has_streams = !value.stream_members(&name, separator).is_empty();
            let has_resources = !value.resource_members(&name, separator).is_empty();

            if has_resources {
                if !has_streams {
                    this.inner.streams.stop(&name)?.await;
                }
                let previous = this.inner.resources.group(&name);
                let started = this.inner.resources.start(&name, &value);
                let mut context = this.inner.context.borrow_mut();
                for id in previous {
                    if id != name && !started.iter().any(|(member, _)| *member == id) {
                        context.remove(&id);
                    }
                }
                for (id, resource) in started {
                    if id != name {
                        context.bind(id, BindingValue::Resource(resource));
                    }
                }
            }

            if has_streams {
                if !has_resources {
                    this.stop_resources(&name);
                }
                if let Err(err) = this.inner.streams.start(name.clone(), &value).await {
                    if has_resources {
                        tracing::warn!(name = %name, %err, "stream setup failed, releasing resources");
                        this.stop_resources(&name);
                    }
                    return Err(err);
                }
            }
            Ok(())
        }
    }

    /// Disposes the resources bound to `name` and forgets the member entries
    /// that starting them wrote into the context.
    fn stop_resources(&self, name: &str) {
        let members = self.inner.resources.group(name);
        self.inner.resources.stop(name);
        self.forget(members, name);
    }

    fn forget(&self, members: Vec<String>, name: &str) {
        let mut context = self.inner.context.borrow_mut();
        for id in members {
            if id != name {
                context.remove(&id);
            }
        }
    }

    /// Stops `name`. Resources are released before this returns; the token
    /// resolves once every stream execution under `name` has been disposed.
    pub fn stop(&self, name: &str) -> Result<Teardown> {
        validate_name(name)?;
        self.stop_resources(name);
        self.inner.streams.stop(name)
    }

    /// Stops every name in `names`. Nothing is stopped unless all of them are
    /// valid.
    pub fn stop_many(&self, names: &[String]) -> Result<Teardown> {
        for name in names {
            validate_name(name)?;
        }
        let tokens = names
            .iter()
            .map(|name| self.stop(name))
            .collect::<Result<Vec<_>>>()?;
        Ok(Teardown::all(tokens))
    }

    /// Stops every live binding, resources first.
    pub fn clear(&self) -> Teardown {
        tracing::debug!("clearing session");
        let members = self.inner.resources.group_members();
        self.inner.resources.clear();
        self.forget(members, "");
        self.inner.streams.clear()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.inner.streams.exists(name) || self.inner.resources.exists(name)
    }

    /// Name under which `stream` is currently running.
    pub fn find(&self, stream: &Stream) -> Option<String> {
        self.inner.streams.find(stream)
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids = self.inner.streams.ids();
        ids.extend(self.inner.resources.ids());
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use futures::executor::block_on;
    use serde_json::json;

    use super::*;
    use crate::{
        resources::tests::Voice,
        sources,
        stream::testing::{Broken, Journal, Probe},
        KineticError, LifecycleError, ResourceRef, RunningList,
    };

    fn session() -> (Runtime, RunningList) {
        let runtime = Runtime::new(RuntimeConfig::default(), Scheduler::new());
        let running = RunningList::new();
        runtime.set_observer(Rc::new(running.clone()));
        (runtime, running)
    }

    fn journal() -> Journal {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn periodic_binding_reports_evenly_spaced_events() {
        let (runtime, running) = session();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let ticks = sources::periodic(10.0)
            .unwrap()
            .tap(move |time, _| sink.borrow_mut().push(time));

        runtime.bind("a", ticks).unwrap();
        block_on(runtime.start("a")).unwrap();
        runtime.scheduler().advance_to(25.0);

        assert_eq!(&seen.borrow()[..3], &[0.0, 10.0, 20.0]);
        assert_eq!(running.running(), vec!["a".to_string()]);
        assert!(runtime.exists("a"));
    }

    #[test]
    fn stopping_a_record_waits_for_every_member() {
        let (runtime, running) = session();
        let journal = journal();
        let x = Probe::new("x", sources::periodic(10.0).unwrap(), journal.clone());
        let y = Probe::new("y", sources::periodic(10.0).unwrap(), journal.clone());

        runtime
            .bind(
                "b",
                BindingValue::record([
                    ("x", Probe::stream(&x).into()),
                    ("y", Probe::stream(&y).into()),
                ]),
            )
            .unwrap();
        block_on(runtime.start("b")).unwrap();
        assert_eq!(runtime.active_ids(), vec!["b.x".to_string(), "b.y".to_string()]);

        let teardown = runtime.stop("b").unwrap();
        block_on(teardown.clone());

        assert!(teardown.is_complete());
        assert_eq!(x.live.get(), 0);
        assert_eq!(y.live.get(), 0);
        assert!(!runtime.exists("b"));
        assert!(running.running().is_empty());
    }

    #[test]
    fn multicast_consumers_see_the_same_values() {
        let (runtime, _) = session();
        let journal = journal();
        let probe = Probe::new(
            "src",
            sources::from_values(
                crate::Attributes::scalar(),
                vec![json!(1), json!(2), json!(3)],
            ),
            journal,
        );
        let shared = Probe::stream(&probe).multicast();
        let first = Rc::new(RefCell::new(Vec::new()));
        let second = Rc::new(RefCell::new(Vec::new()));
        let (f1, f2) = (first.clone(), second.clone());

        runtime
            .bind(
                "taps",
                vec![
                    shared.tap(move |time, value| f1.borrow_mut().push((time, value.clone()))),
                    shared.tap(move |time, value| f2.borrow_mut().push((time, value.clone()))),
                ],
            )
            .unwrap();
        block_on(runtime.start("taps")).unwrap();
        runtime.scheduler().flush();

        assert_eq!(first.borrow().len(), 3);
        assert_eq!(*first.borrow(), *second.borrow());
        assert_eq!(probe.runs.get(), 1);
    }

    #[test]
    fn resources_are_released_synchronously() {
        let (runtime, running) = session();
        let first = Voice::new();
        let second = Voice::new();

        runtime.bind("synth", first.clone() as ResourceRef).unwrap();
        block_on(runtime.start("synth")).unwrap();
        runtime.bind("synth", second.clone() as ResourceRef).unwrap();
        block_on(runtime.start("synth")).unwrap();

        assert_eq!(first.disposed.get(), 1);
        assert_eq!(second.disposed.get(), 0);

        let teardown = runtime.stop("synth").unwrap();
        assert!(teardown.is_complete());
        assert_eq!(second.disposed.get(), 1);
        assert!(running.running().is_empty());
    }

    #[test]
    fn resource_group_members_land_in_the_context() {
        let (runtime, _) = session();
        let voices = [Voice::new(), Voice::new()];

        runtime
            .bind(
                "chord",
                BindingValue::Array(
                    voices
                        .iter()
                        .map(|voice| BindingValue::Resource(voice.clone()))
                        .collect(),
                ),
            )
            .unwrap();
        block_on(runtime.start("chord")).unwrap();

        assert!(runtime.value("chord.0").is_some());
        assert!(runtime.value("chord.1").is_some());
        assert!(runtime.exists("chord"));

        block_on(runtime.clear());
        assert!(voices.iter().all(|voice| voice.disposed.get() == 1));
        assert!(runtime.active_ids().is_empty());
    }

    #[test]
    fn switching_a_name_from_stream_to_resource_stops_the_stream() {
        let (runtime, _) = session();
        let journal = journal();
        let probe = Probe::new("a", sources::periodic(10.0).unwrap(), journal);
        let voice = Voice::new();

        runtime.bind("a", Probe::stream(&probe)).unwrap();
        block_on(runtime.start("a")).unwrap();
        runtime.bind("a", voice.clone() as ResourceRef).unwrap();
        block_on(runtime.start("a")).unwrap();

        assert_eq!(probe.live.get(), 0);
        assert_eq!(runtime.active_ids(), vec!["a".to_string()]);
    }

    #[test]
    fn unbound_and_plain_values_do_not_start() {
        let (runtime, running) = session();
        block_on(runtime.start("ghost")).unwrap();
        runtime.bind("n", json!(4)).unwrap();
        block_on(runtime.start("n")).unwrap();

        assert!(running.running().is_empty());
        assert!(runtime.stop("ghost").unwrap().is_complete());
    }

    #[test]
    fn failed_stream_member_releases_resources_of_the_same_group() {
        let (runtime, running) = session();
        let voice = Voice::new();

        runtime
            .bind(
                "m",
                BindingValue::record([
                    ("v", BindingValue::Resource(voice.clone())),
                    ("s", Stream::new(crate::Attributes::any(), Broken).into()),
                ]),
            )
            .unwrap();
        let result = block_on(runtime.start("m"));

        assert!(result.is_err());
        assert_eq!(voice.disposed.get(), 1);
        assert!(!runtime.exists("m"));
        assert!(runtime.active_ids().is_empty());
        assert!(runtime.value("m.v").is_none());
        assert!(running.running().is_empty());
    }

    #[test]
    fn shrinking_a_resource_group_forgets_dropped_members() {
        let (runtime, _) = session();
        let voices = [Voice::new(), Voice::new()];
        let group = |count: usize| {
            BindingValue::Array(
                voices[..count]
                    .iter()
                    .map(|voice| BindingValue::Resource(voice.clone()))
                    .collect(),
            )
        };

        runtime.bind("pad", group(2)).unwrap();
        block_on(runtime.start("pad")).unwrap();
        assert!(runtime.value("pad.1").is_some());

        runtime.bind("pad", group(1)).unwrap();
        block_on(runtime.start("pad")).unwrap();
        assert_eq!(voices[1].disposed.get(), 1);
        assert!(runtime.value("pad.1").is_none());
        assert!(runtime.value("pad.0").is_some());

        block_on(runtime.start("pad.1")).unwrap();
        assert_eq!(runtime.active_ids(), vec!["pad.0".to_string()]);

        assert!(runtime.stop("pad").unwrap().is_complete());
        assert!(runtime.value("pad.0").is_none());
        assert!(runtime.value("pad").is_some());
    }

    #[test]
    fn stop_many_validates_every_name_before_stopping() {
        let (runtime, _) = session();
        let journal = journal();
        let probe = Probe::new("live", sources::periodic(10.0).unwrap(), journal);
        runtime.bind("live", Probe::stream(&probe)).unwrap();
        block_on(runtime.start("live")).unwrap();

        let result = runtime.stop_many(&["live".to_string(), String::new()]);

        assert!(matches!(
            result,
            Err(KineticError::Lifecycle(LifecycleError::InvalidName(_)))
        ));
        assert!(runtime.exists("live"));
        assert_eq!(probe.live.get(), 1);
    }

    #[test]
    fn misuse_is_reported_synchronously() {
        let (runtime, _) = session();
        assert!(matches!(
            runtime.stop(" "),
            Err(KineticError::Lifecycle(LifecycleError::InvalidName(_)))
        ));
        assert!(runtime.bind("", json!(null)).is_err());
        assert!(runtime
            .stop_many(&["ok".to_string(), String::new()])
            .is_err());
    }

    #[test]
    fn find_locates_running_streams() {
        let (runtime, _) = session();
        let ticks = sources::periodic(5.0).unwrap();
        runtime.bind("clock", ticks.clone()).unwrap();
        block_on(runtime.start("clock")).unwrap();

        assert_eq!(runtime.find(&ticks).as_deref(), Some("clock"));
        assert_eq!(runtime.find(&sources::empty()), None);
    }
}
