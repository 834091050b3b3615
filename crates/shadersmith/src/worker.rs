/* BEGIN LICENSE
  ShaderSmith, a multi-threaded shader compiling and packing tool.
  Copyright (C) 2025 ShaderSmith contributors
  SPDX-License-Identifier: MIT OR Apache-2.0
END LICENSE */

//! The worker pool: a fixed set of threads draining the task queue, and the
//! shared state they are allowed to touch while doing so.
//!
//! Workers mutate only the queue (pop, plus push on retry), the retry
//! budget, the two counters and the terminate flag; the plan itself is
//! frozen before the pool starts.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use colored::Colorize;

use crate::options::Options;
use crate::plan::Task;
use crate::process;

/// LIFO task stack plus the transient-failure retry budget, guarded by one
/// mutex since retries touch both together.
pub struct TaskQueue {
    pub tasks: Vec<Task>,
    pub retries_left: u32,
}

pub struct BuildState<'a> {
    pub options: &'a Options,
    pub queue: Mutex<TaskQueue>,
    pub processed: AtomicU32,
    pub failed: AtomicU32,
    pub terminate: Arc<AtomicBool>,
    /// Task count at pool start, the denominator of the progress percentage.
    pub total: u32,
}

impl<'a> BuildState<'a> {
    pub fn new(options: &'a Options, tasks: Vec<Task>, terminate: Arc<AtomicBool>) -> Self {
        let total = tasks.len() as u32;
        Self {
            options,
            queue: Mutex::new(TaskQueue { tasks, retries_left: options.retry_count }),
            processed: AtomicU32::new(0),
            failed: AtomicU32::new(0),
            terminate,
            total,
        }
    }

    pub fn terminated(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }

    /// Pops the next task, or `None` when the queue is drained or the run
    /// was cancelled.
    pub fn next_task(&self) -> Option<Task> {
        if self.terminated() {
            return None;
        }
        self.queue.lock().unwrap().tasks.pop()
    }

    /// Re-queues a task after a transient failure. Returns false when the
    /// retry budget is exhausted, turning the failure into a hard one.
    pub fn requeue_for_retry(&self, task: &Task) -> bool {
        let mut queue = self.queue.lock().unwrap();
        if queue.retries_left == 0 {
            return false;
        }
        queue.retries_left -= 1;
        queue.tasks.push(task.clone());
        true
    }
}

/// How a backend finished one task.
pub enum TaskOutcome<'a> {
    /// Compiled and written; `warnings` carries any non-fatal compiler
    /// output.
    Success { warnings: Option<&'a str> },
    /// Transient failure, task already pushed back onto the queue.
    Requeued,
    Failed { diagnostics: &'a str },
}

/// Emits the one console line a task terminates with. Each update is a
/// single `println!` so concurrent workers cannot interleave fragments.
pub fn update_progress(state: &BuildState, task: &Task, outcome: TaskOutcome) {
    let platform = state.options.platform.name();
    match outcome {
        TaskOutcome::Success { warnings } => {
            let processed = state.processed.fetch_add(1, Ordering::Relaxed) + 1;
            let progress = 100.0 * processed as f32 / state.total as f32;
            match warnings {
                Some(message) => println!(
                    "{}",
                    format!(
                        "[{:5.1}%] {} {} {{{}}} {{{}}}\n{}",
                        progress,
                        platform,
                        task.source.display(),
                        task.entry_point,
                        task.combined_defines,
                        message
                    )
                    .yellow()
                ),
                None => println!(
                    "{} {} {} {} {}",
                    format!("[{:5.1}%]", progress).green(),
                    platform.bright_black(),
                    task.source.display(),
                    format!("{{{}}}", task.entry_point).bright_black(),
                    format!("{{{}}}", task.combined_defines)
                ),
            }
        }
        TaskOutcome::Requeued => println!(
            "{}",
            format!(
                "[RETRY ] {} {} {{{}}} {{{}}}",
                platform,
                task.source.display(),
                task.entry_point,
                task.combined_defines
            )
            .yellow()
        ),
        TaskOutcome::Failed { diagnostics } => {
            println!(
                "{}",
                format!(
                    "[ FAIL ] {} {} {{{}}} {{{}}}\n{}",
                    platform,
                    task.source.display(),
                    task.entry_point,
                    task.combined_defines,
                    if diagnostics.is_empty() { "<no message text>" } else { diagnostics }
                )
                .red()
            );
            if !state.options.continue_on_error {
                state.terminate.store(true, Ordering::Relaxed);
            }
            state.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// The compilation strategy every worker of a run uses, fixed at startup
/// from the options and the host platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    /// Spawn the configured compiler as a child process.
    Process,
    /// d3dcompiler API, in process.
    #[cfg(windows)]
    FxcApi,
    /// dxcompiler API, in process.
    #[cfg(windows)]
    DxcApi,
}

pub fn select_backend(options: &Options) -> Backend {
    #[cfg(windows)]
    if options.use_api {
        return if options.platform == crate::options::Platform::Dxbc {
            Backend::FxcApi
        } else {
            Backend::DxcApi
        };
    }
    let _ = options;
    Backend::Process
}

/// Spawns the worker pool and blocks until the queue drains or the run is
/// cancelled. Worker count is the hardware parallelism, or 1 under
/// `--serial`.
pub fn run_pool(state: &BuildState, backend: Backend) {
    let workers = if state.options.serial {
        1
    } else {
        thread::available_parallelism().map_or(1, |n| n.get())
    };

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| match backend {
                Backend::Process => process::run_worker(state),
                #[cfg(windows)]
                Backend::FxcApi => crate::fxc::run_worker(state),
                #[cfg(windows)]
                Backend::DxcApi => crate::dxc::run_worker(state),
            });
        }
    });
}
