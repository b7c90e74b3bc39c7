//! Windowed feature operators over scalar sample streams: RMS level and FFT
//! magnitude spectrum. Both buffer `window` samples and emit one value per
//! full, non-overlapping window, so the output sample rate is the input rate
//! divided by `window`.

use std::{
    cell::RefCell,
    f32::consts::PI,
    fmt,
    rc::Rc,
    sync::Arc,
};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde_json::Value;

use crate::{
    attributes::{Format, Rule, Size, Specification, FORMAT, SAMPLERATE, SIZE, TYPE},
    Disposable, Guarded, PropagationError, Result, Scheduler, Sink, SinkRef, Source, Stream, Time,
    ValidationError,
};

type Reducer = Box<dyn FnMut(&[f32]) -> std::result::Result<Value, PropagationError>>;
type MakeReducer = Rc<dyn Fn() -> Reducer>;

/// Magnitude spectrum of each window, `window / 2 + 1` bins, Hann windowed.
pub fn spectrum(stream: &Stream, window: usize) -> std::result::Result<Stream, ValidationError> {
    let spec = windowed_spec("spectrum", window)?
        .rule(
            FORMAT,
            Rule::required().one_of([Format::Scalar]).derive(Format::Vector),
        )
        .rule(SIZE, Rule::optional().derive(Size::Fixed(window as u64 / 2 + 1)))
        .rule(TYPE, Rule::optional().derive("spectrum"));
    let described = stream.with_attributes("spectrum", &spec)?;

    Ok(Stream::new(
        described.attributes().clone(),
        Windowed {
            source: stream.clone(),
            window,
            make: Rc::new(move || {
                let mut fft = FftResources::new(window);
                Box::new(move |samples: &[f32]| fft.magnitudes(samples)) as Reducer
            }),
        },
    ))
}

/// Root-mean-square level of each window.
pub fn rms(stream: &Stream, window: usize) -> std::result::Result<Stream, ValidationError> {
    let spec = windowed_spec("rms", window)?
        .rule(FORMAT, Rule::required().one_of([Format::Scalar]))
        .rule(SIZE, Rule::optional().derive(Size::Fixed(1)))
        .rule(TYPE, Rule::optional().derive("rms"));
    let described = stream.with_attributes("rms", &spec)?;

    Ok(Stream::new(
        described.attributes().clone(),
        Windowed {
            source: stream.clone(),
            window,
            make: Rc::new(|| {
                Box::new(|samples: &[f32]| {
                    Ok::<_, PropagationError>(Value::from(compute_rms(samples) as f64))
                }) as Reducer
            }),
        },
    ))
}

fn windowed_spec(label: &str, window: usize) -> std::result::Result<Specification, ValidationError> {
    if window < 2 {
        return Err(ValidationError::new(
            label,
            "window",
            format!("is {window}, expected at least 2"),
        ));
    }

    Ok(Specification::new().rule(
        SAMPLERATE,
        Rule::required()
            .min(f64::MIN_POSITIVE)
            .transform(move |input| match input.samplerate() {
                Some(rate) => Value::from(rate / window as f64),
                None => Value::Null,
            }),
    ))
}

struct Windowed {
    source: Stream,
    window: usize,
    make: MakeReducer,
}

impl Source for Windowed {
    fn run(&self, sink: SinkRef, scheduler: &Scheduler) -> Result<Disposable> {
        let windowed = Rc::new(WindowSink {
            sink: Guarded::new(sink),
            window: self.window,
            buffer: RefCell::new(Vec::with_capacity(self.window)),
            reducer: RefCell::new((*self.make)()),
        });
        self.source.run(windowed, scheduler)
    }
}

struct WindowSink {
    sink: Rc<Guarded>,
    window: usize,
    buffer: RefCell<Vec<f32>>,
    reducer: RefCell<Reducer>,
}

impl Sink for WindowSink {
    fn event(&self, time: Time, value: Value) {
        let Some(sample) = value.as_f64() else {
            tracing::warn!(%value, "skipping non-numeric sample");
            return;
        };

        let frame = {
            let mut buffer = self.buffer.borrow_mut();
            buffer.push(sample as f32);
            if buffer.len() < self.window {
                return;
            }
            std::mem::replace(&mut *buffer, Vec::with_capacity(self.window))
        };

        let reduced = {
            let mut reducer = self.reducer.borrow_mut();
            (*reducer)(&frame)
        };
        match reduced {
            Ok(value) => self.sink.event(time, value),
            Err(error) => self.sink.error(time, error),
        }
    }

    fn end(&self, time: Time) {
        self.sink.end(time);
    }

    fn error(&self, time: Time, error: PropagationError) {
        self.sink.error(time, error);
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn new(size: usize) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(size);
        Self {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        }
    }

    fn magnitudes(&mut self, samples: &[f32]) -> std::result::Result<Value, PropagationError> {
        let len = samples.len().min(self.size);
        for (index, value) in samples.iter().take(len).enumerate() {
            self.input[index] = *value * hann_value(index, len);
        }

        self.plan
            .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
            .map_err(|err| PropagationError::new(format!("spectrum: {err}")))?;

        let scale = 1.0 / self.size as f32;
        Ok(Value::Array(
            self.spectrum
                .iter()
                .map(|bin| Value::from((bin.norm() * scale) as f64))
                .collect(),
        ))
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

fn compute_rms(samples: &[f32]) -> f32 {
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}
