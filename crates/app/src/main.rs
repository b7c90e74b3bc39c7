use std::{cell::Cell, path::PathBuf, rc::Rc};

use clap::{Parser, Subcommand};
use futures::executor::block_on;
use kinetic_core::{
    analysis, sources, validate, AppConfig, Attributes, Batch, BindingValue, Context, Resource,
    ResourceRef, Runtime, RunningList, Scheduler, Specification,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

fn main() -> kinetic_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Session { config } => run_session(config.as_deref()),
        Commands::Validate { spec, attributes } => run_validate(&spec, &attributes),
    }
}

fn run_session(config: Option<&std::path::Path>) -> kinetic_core::Result<()> {
    let config = match config {
        Some(path) => AppConfig::from_path(path)?,
        None => AppConfig::live_defaults(),
    };
    let tick = config.session.tick;
    let duration = config.session.duration;
    tracing::info!(tick, duration, "starting live session");

    let scheduler = Scheduler::new();
    let runtime = Runtime::new(config.runtime.clone(), scheduler.clone());
    let running = RunningList::new();
    runtime.set_observer(Rc::new(running.clone()));

    let clock = sources::periodic(tick)?;
    let wave = clock.map(|value| {
        let index = value.as_f64().unwrap_or_default();
        Value::from((index * 0.5).sin())
    });
    let level = analysis::rms(&wave, 4)?;

    let first = Batch::new()
        .assign("clock", {
            let clock = clock.clone();
            move |_: &Context| {
                Ok(clock
                    .tap(|time, value| tracing::info!(time, %value, "clock"))
                    .into())
            }
        })
        .assign("level", move |_| {
            Ok(level
                .tap(|time, value| tracing::info!(time, %value, "level"))
                .into())
        })
        .assign("pair", {
            let wave = wave.clone();
            move |_: &Context| {
                let halved = wave.map(|value| Value::from(value.as_f64().unwrap_or_default() / 2.0));
                Ok(BindingValue::record([
                    ("raw", wave.into()),
                    ("halved", halved.into()),
                ]))
            }
        })
        .assign("synth", |_| Ok((Tone::new(220.0) as ResourceRef).into()))
        .assign("synth", |_| Ok((Tone::new(440.0) as ResourceRef).into()));

    let report = block_on(runtime.execute(first))?;
    tracing::info!(started = ?report.started, collapsed = report.collapsed, "batch applied");
    tracing::info!(running = ?running.running(), "live bindings");

    scheduler.advance_to(duration / 2.0);

    let faster = sources::periodic(tick / 2.0)?;
    let second = Batch::new().assign("clock", move |_| {
        Ok(faster
            .tap(|time, value| tracing::info!(time, %value, "clock (fast)"))
            .into())
    });
    block_on(runtime.execute(second))?;

    scheduler.advance_to(duration);

    block_on(runtime.stop("pair")?);
    tracing::info!(pair = runtime.exists("pair"), "stopped pair");

    block_on(runtime.clear());
    tracing::info!(running = ?running.running(), errors = ?running.errors(), "session cleared");
    Ok(())
}

fn run_validate(spec: &PathBuf, attributes: &PathBuf) -> kinetic_core::Result<()> {
    tracing::info!(?spec, ?attributes, "validating descriptor");

    let spec: Value = serde_json::from_str(&std::fs::read_to_string(spec)?)?;
    let spec = Specification::from_json(&spec)?;
    let input: Value = serde_json::from_str(&std::fs::read_to_string(attributes)?)?;
    let input = Attributes::from_json(input)?;

    match validate("validate", &spec, &input) {
        Ok(derived) => {
            println!("{}", serde_json::to_string_pretty(&derived)?);
            Ok(())
        }
        Err(err) => {
            tracing::error!(%err, "descriptor rejected");
            Err(err.into())
        }
    }
}

/// Stand-in synthesizer voice that only logs its lifetime.
struct Tone {
    frequency: f64,
    released: Cell<bool>,
}

impl Tone {
    fn new(frequency: f64) -> Rc<Self> {
        tracing::info!(frequency, "tone allocated");
        Rc::new(Self {
            frequency,
            released: Cell::new(false),
        })
    }
}

impl Resource for Tone {
    fn dispose(&self) {
        if !self.released.replace(true) {
            tracing::info!(frequency = self.frequency, "tone released");
        }
    }

    fn kind(&self) -> &str {
        "tone"
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Live stream runtime for code-driven sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scripted session on the virtual clock.
    Session {
        /// Optional JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Check an attribute descriptor against a specification and print the
    /// derived descriptor.
    Validate {
        /// JSON specification, one rule object per property.
        #[arg(long)]
        spec: PathBuf,
        /// JSON attribute descriptor.
        #[arg(long)]
        attributes: PathBuf,
    },
}
