//! Core library for the Kinetic live stream runtime.
//!
//! User code composes streams (timers, sensor feeds, features derived from
//! them) into named bindings; the runtime starts, restarts and stops those
//! bindings while code is being edited. Each module owns one concern:
//! attribute descriptors and their validation, the virtual-time scheduler,
//! the stream contract and its combinators, and the lifecycle managers that
//! keep at most one live execution per binding name.

pub mod analysis;
pub mod attributes;
pub mod binding;
pub mod canceller;
pub mod combinators;
pub mod config;
pub mod driver;
pub mod error;
pub mod lifecycle;
pub mod observer;
pub mod registry;
pub mod resources;
pub mod runtime;
pub mod scheduler;
pub mod sources;
pub mod stream;
pub mod teardown;

pub use attributes::{validate, Attributes, Format, Rule, Size, Specification};
pub use binding::{BindingKind, BindingValue, Context};
pub use canceller::{canceller, CancelSlot};
pub use config::{AppConfig, RuntimeConfig, SessionConfig};
pub use driver::{Batch, ExecutionReport};
pub use error::{
    KineticError, LifecycleError, PropagationError, Result, ValidationError, WiringError,
};
pub use lifecycle::StreamLifecycle;
pub use observer::{BindingObserver, NullObserver, RunningList};
pub use registry::{Registry, RegistryEntry};
pub use resources::{Resource, ResourceLifecycle, ResourceRef};
pub use runtime::Runtime;
pub use scheduler::{ScheduledTask, Scheduler, Time};
pub use stream::{Disposable, Guarded, Sink, SinkRef, Source, Stream};
pub use teardown::{Teardown, TeardownSignal};
