//! `cadence latency`: probe dispatch latency, timer overshoot, and idle
//! wake-up spacing of a single worker.

use crate::output::{format_duration, StyledOutput};
use anyhow::{bail, Context};
use cadence_core::{CadenceConfig, CompletionSignal, Deadline, SyncLoop, Worker};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use termcolor::ColorChoice;
use tracing::info;

/// Latency distribution summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Percentiles {
    p50: Duration,
    p90: Duration,
    p99: Duration,
    max: Duration,
}

impl Percentiles {
    fn from_samples(mut samples: Vec<Duration>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let at = |q: f64| samples[((samples.len() - 1) as f64 * q).round() as usize];
        Some(Self {
            p50: at(0.50),
            p90: at(0.90),
            p99: at(0.99),
            max: samples[samples.len() - 1],
        })
    }

    fn render(&self) -> String {
        format!(
            "p50 {}  p90 {}  p99 {}  max {}",
            format_duration(self.p50),
            format_duration(self.p90),
            format_duration(self.p99),
            format_duration(self.max)
        )
    }
}

/// Time from `call_threadsafe` returning to the thunk starting
fn measure_dispatch(worker: &Worker, samples: usize) -> anyhow::Result<Vec<Duration>> {
    let results = Arc::new(Mutex::new(Vec::with_capacity(samples)));
    for _ in 0..samples {
        let done = CompletionSignal::new();
        let signal = done.clone();
        let results = Arc::clone(&results);
        let sent = Instant::now();
        worker.call_threadsafe(move || {
            results.lock().push(sent.elapsed());
            signal.set();
        });
        done.wait_timeout(Duration::from_secs(5))
            .context("worker stopped responding")?
            .map_err(|status| anyhow::anyhow!("dispatch failed: {}", status))?;
    }
    let samples = std::mem::take(&mut *results.lock());
    Ok(samples)
}

/// How late `delay_call` fires after a 1ms deadline
fn measure_timer_overshoot(worker: &Worker, samples: usize) -> anyhow::Result<Vec<Duration>> {
    let results = Arc::new(Mutex::new(Vec::with_capacity(samples)));
    for _ in 0..samples {
        let done = CompletionSignal::new();
        let signal = done.clone();
        let results = Arc::clone(&results);
        worker.call_threadsafe_with(move |lp| {
            let deadline = Deadline::after(Duration::from_millis(1));
            let fallback = signal.clone();
            let registered = lp.delay_call(deadline, move |lp| {
                let late = lp.now().saturating_sub(deadline.as_nanos());
                results.lock().push(Duration::from_nanos(late));
                signal.set();
            });
            if let Err(err) = registered {
                fallback.fail(err.into());
            }
        });
        done.wait_timeout(Duration::from_secs(5))
            .context("worker stopped responding")?
            .map_err(|status| anyhow::anyhow!("timer failed: {}", status))?;
    }
    let samples = std::mem::take(&mut *results.lock());
    Ok(samples)
}

pub fn execute(config: CadenceConfig, samples: usize, color: ColorChoice) -> anyhow::Result<()> {
    if samples == 0 {
        bail!("--samples must be at least 1");
    }

    let options = config.worker.to_options().with_owned_thread(true);
    let quantum = options.quantum;
    let worker = Worker::with_engine(options, SyncLoop::factory(config.engine.to_limits()));
    worker.start()?;
    info!(worker = %worker.name(), samples, "measuring");

    let dispatch = measure_dispatch(&worker, samples)?;
    let timers = measure_timer_overshoot(&worker, samples.min(200))?;

    // Idle: nothing queued, so steps should come once per quantum.
    let idle_window = (quantum * 4).min(Duration::from_secs(5));
    let before = worker.stats().steps;
    std::thread::sleep(idle_window);
    let idle_steps = worker.stats().steps - before;
    let expected = idle_window.as_secs_f64() / quantum.as_secs_f64();

    worker.kill();
    worker.wait_for_shutdown()?;

    let mut out = StyledOutput::new(color);
    out.heading(&format!("{} (quantum {})", worker, format_duration(quantum)));
    if let Some(p) = Percentiles::from_samples(dispatch) {
        out.row("dispatch", &p.render());
    }
    if let Some(p) = Percentiles::from_samples(timers) {
        out.row("timer overshoot", &p.render());
    }
    out.row(
        "idle steps",
        &format!(
            "{} in {} (expected ~{:.1})",
            idle_steps,
            format_duration(idle_window),
            expected
        ),
    );
    out.flush();
    Ok(())
}
