//! `cadence run`: launch a tree of demo processes across a worker pool.
//!
//! Each process is pinned to one worker. It sleeps for a random slice of
//! simulated work via `delay_call`, launches its children on other workers
//! through `call_threadsafe`, and completes once every child's completion
//! signal has fired. The roots are awaited from a "main" worker that runs on
//! the calling thread.

use crate::output::{format_duration, StyledOutput};
use anyhow::{bail, Context};
use cadence_core::{
    CadenceConfig, CompletionSignal, Loop, Status, StatusCode, SyncLoop, Worker, WorkerFactory,
    WorkerHandle, WorkerHooks,
};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use termcolor::ColorChoice;
use tracing::{debug, info};

/// Children launched by every non-leaf process
const FANOUT: usize = 2;

/// Deepest tree accepted
const MAX_DEPTH: u32 = 12;

/// Parameters for `cadence run`
pub struct RunArgs {
    pub config: CadenceConfig,
    pub workers: usize,
    pub processes: usize,
    pub depth: u32,
    pub delay_ms: u64,
}

/// Logs loop thread entry and exit
struct LoggingHooks;

impl WorkerHooks for LoggingHooks {
    fn on_thread_start(&self, worker: &WorkerHandle) {
        debug!(worker = %worker.name(), "attached to loop thread");
    }

    fn on_thread_stop(&self, worker: &WorkerHandle) {
        debug!(worker = %worker.name(), "detached from loop thread");
    }
}

/// Shared state for placing and counting processes
struct ProcessTree {
    workers: Vec<WorkerHandle>,
    next_worker: AtomicUsize,
    next_pid: AtomicU64,
    max_delay: Duration,
    completed: Mutex<BTreeMap<String, u64>>,
}

impl ProcessTree {
    fn pick_worker(&self) -> &WorkerHandle {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[index]
    }

    /// Launch a process of the given depth on the next worker
    fn launch(self: &Arc<Self>, depth: u32) -> CompletionSignal {
        let done = CompletionSignal::new();
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed) + 1;
        let tree = Arc::clone(self);
        let signal = done.clone();
        self.pick_worker()
            .call_threadsafe_with(move |lp| tree.start_process(lp, pid, depth, signal));
        done
    }

    fn start_process(self: Arc<Self>, lp: &mut Loop<'_>, pid: u64, depth: u32, done: CompletionSignal) {
        debug!(pid, depth, worker = %lp.worker().name(), "process started");
        let work = rand::thread_rng().gen_range(Duration::ZERO..=self.max_delay);
        let deadline = lp.worker().delay_to_deadline(work.as_secs_f64());

        let on_error = done.clone();
        let registered = lp.delay_call(deadline, move |lp| self.after_work(lp, pid, depth, done));
        if let Err(err) = registered {
            on_error.fail(err.into());
        }
    }

    fn after_work(self: Arc<Self>, lp: &mut Loop<'_>, pid: u64, depth: u32, done: CompletionSignal) {
        *self
            .completed
            .lock()
            .entry(lp.worker().name().to_string())
            .or_default() += 1;

        if depth == 0 {
            debug!(pid, "process finished");
            done.set();
            return;
        }

        let children: Vec<CompletionSignal> = (0..FANOUT).map(|_| self.launch(depth - 1)).collect();
        await_all(lp, children, done);
    }

    fn total_completed(&self) -> u64 {
        self.completed.lock().values().sum()
    }
}

/// Signal `done` once every signal in `pending` has succeeded, or with the
/// first failure
fn await_all(lp: &mut Loop<'_>, mut pending: Vec<CompletionSignal>, done: CompletionSignal) {
    let Some(next) = pending.pop() else {
        done.set();
        return;
    };

    let on_error = done.clone();
    let registered = lp.await_completion(&next, move |lp, result| match result {
        Ok(()) => await_all(lp, pending, done),
        Err(status) => {
            done.fail(status);
        }
    });
    if let Err(err) = registered {
        on_error.fail(err.into());
    }
}

/// Processes in one tree of the given depth
fn tree_size(depth: u32) -> u64 {
    (0..=depth).map(|level| (FANOUT as u64).pow(level)).sum()
}

pub fn execute(args: RunArgs, color: ColorChoice) -> anyhow::Result<()> {
    if args.workers == 0 {
        bail!("--workers must be at least 1");
    }
    if args.depth > MAX_DEPTH {
        bail!("--depth must be at most {}", MAX_DEPTH);
    }

    let limits = args.config.engine.to_limits();
    let factory: WorkerFactory = Box::new(move |options| {
        Worker::with_parts(options, Arc::new(LoggingHooks), SyncLoop::factory(limits))
    });

    let base = args.config.worker.to_options();
    let pool: Vec<Worker> = (0..args.workers)
        .map(|i| {
            let mut options = base.clone().with_owned_thread(true);
            options.name = format!("{}-{}", base.name, i);
            factory(options)
        })
        .collect();
    for worker in &pool {
        worker.start().with_context(|| format!("starting {}", worker))?;
    }

    let mut main_options = base.clone().with_owned_thread(false);
    main_options.name = "main".to_string();
    let main = factory(main_options);

    let tree = Arc::new(ProcessTree {
        workers: pool.iter().map(Worker::handle).collect(),
        next_worker: AtomicUsize::new(0),
        next_pid: AtomicU64::new(0),
        max_delay: Duration::from_millis(args.delay_ms),
        completed: Mutex::new(BTreeMap::new()),
    });

    info!(
        workers = args.workers,
        processes = args.processes,
        depth = args.depth,
        "launching process trees"
    );

    let outcome: Arc<Mutex<Option<Result<(), Status>>>> = Arc::new(Mutex::new(None));
    let started = Instant::now();
    {
        let tree = Arc::clone(&tree);
        let outcome = Arc::clone(&outcome);
        let processes = args.processes;
        main.call_threadsafe_with(move |lp| {
            let roots: Vec<CompletionSignal> = (0..processes).map(|_| tree.launch(args.depth)).collect();
            let all_done = CompletionSignal::new();
            await_all(lp, roots, all_done.clone());

            let outcome_cb = Arc::clone(&outcome);
            let registered = lp.await_completion(&all_done, move |lp, result| {
                *outcome_cb.lock() = Some(result);
                lp.kill();
            });
            if let Err(err) = registered {
                *outcome.lock() = Some(Err(err.into()));
                lp.kill();
            }
        });
    }

    main.run_on_current_thread().context("main worker failed")?;
    let elapsed = started.elapsed();

    for worker in &pool {
        worker.kill();
    }
    for worker in &pool {
        worker.wait_for_shutdown().with_context(|| format!("{} failed", worker))?;
    }

    let result = outcome
        .lock()
        .take()
        .unwrap_or_else(|| Err(Status::new(StatusCode::Aborted, "main worker exited early")));

    let mut out = StyledOutput::new(color);
    out.heading("Process trees");
    out.row("roots", &args.processes.to_string());
    out.row("depth", &args.depth.to_string());
    out.row(
        "expected",
        &(args.processes as u64 * tree_size(args.depth)).to_string(),
    );
    out.row("completed", &tree.total_completed().to_string());
    out.row("elapsed", &format_duration(elapsed));
    out.newline();

    out.heading("Workers");
    let completed = tree.completed.lock().clone();
    for worker in &pool {
        let stats = worker.stats();
        let count = completed.get(worker.name()).copied().unwrap_or(0);
        out.row(
            worker.name(),
            &format!(
                "{} processes, {} calls, {} steps",
                count, stats.thunks_executed, stats.steps
            ),
        );
    }
    out.newline();

    match result {
        Ok(()) => {
            out.success("All processes completed");
            out.newline();
            out.flush();
            Ok(())
        }
        Err(status) => {
            out.error(&format!("Process tree failed: {}", status));
            out.newline();
            out.flush();
            bail!("process tree failed: {}", status)
        }
    }
}
