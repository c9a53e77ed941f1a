//! Concurrent directory tree replication.
//!
//! The engine copies a source directory tree into a destination in two phases: first every
//! directory is created, then a pool of workers copies the files while the tree is walked a
//! second time. Single files can also be copied as a stream of per-chunk progress values.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), common::replicate::Error> {
//! let summary = common::replicate_tree(
//!     std::path::Path::new("/data/src"),
//!     std::path::Path::new("/data/dst"),
//!     8,
//! )
//! .await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```
//!
//! Command line tools wrap their async entry point with [`run`], which sets up logging, the
//! tokio runtime, throttling and progress reporting.

use std::io::IsTerminal;

use anyhow::Context;
use tracing::instrument;

pub mod config;
pub mod error;
pub mod fsops;
pub mod pool;
pub mod progress;
pub mod replicate;
pub mod throttle;
pub mod transfer;
pub mod walk;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, ReplicateSettings, RuntimeConfig, ThrottleConfig};
pub use error::{Error, Side};
pub use replicate::{Summary, replicate};
pub use transfer::stream_copy;

/// Counters shared by every operation in this process
pub static PROGRESS: std::sync::LazyLock<progress::Progress> =
    std::sync::LazyLock::new(progress::Progress::new);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    #[default]
    Auto,
    ProgressBar,
    TextUpdates,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Human readable delay between updates, e.g. "200ms"
    pub progress_delay: Option<String>,
}

/// Replicate `src` into `dst` with `workers` concurrent copies and default settings for
/// everything else.
#[instrument]
pub async fn replicate_tree(
    src: &std::path::Path,
    dst: &std::path::Path,
    workers: usize,
) -> Result<Summary, replicate::Error> {
    let settings = ReplicateSettings {
        workers,
        ..Default::default()
    };
    replicate(
        &PROGRESS,
        src,
        dst,
        &settings,
        &tokio_util::sync::CancellationToken::new(),
    )
    .await
}

struct ProgressTracker {
    lock_cvar: std::sync::Arc<(std::sync::Mutex<bool>, std::sync::Condvar)>,
    pbar_thread: Option<std::thread::JoinHandle<()>>,
}

impl ProgressTracker {
    fn new(progress_type: ProgressType, delay: std::time::Duration) -> Self {
        let lock_cvar =
            std::sync::Arc::new((std::sync::Mutex::new(false), std::sync::Condvar::new()));
        let lock_cvar_clone = lock_cvar.clone();
        let interactive = is_interactive(progress_type);
        let pbar_thread = std::thread::spawn(move || {
            let pbar = interactive.then(|| {
                let pbar = indicatif::ProgressBar::new_spinner();
                pbar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                pbar
            });
            let mut printer = progress::ProgressPrinter::new(&PROGRESS);
            let (lock, cvar) = &*lock_cvar_clone;
            let mut is_done = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            loop {
                match &pbar {
                    Some(pbar) => {
                        pbar.set_message(printer.print());
                        pbar.tick();
                    }
                    None => eprintln!("{}", printer.print()),
                }
                let result = cvar
                    .wait_timeout(is_done, delay)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                is_done = result.0;
                if *is_done {
                    break;
                }
            }
            if let Some(pbar) = pbar {
                pbar.finish_and_clear();
            }
        });
        Self {
            lock_cvar,
            pbar_thread: Some(pbar_thread),
        }
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.lock_cvar;
        let mut is_done = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *is_done = true;
        cvar.notify_one();
        drop(is_done);
        if let Some(pbar_thread) = self.pbar_thread.take() {
            if pbar_thread.join().is_err() {
                eprintln!("progress thread panicked");
            }
        }
    }
}

fn is_interactive(progress_type: ProgressType) -> bool {
    match progress_type {
        ProgressType::Auto => std::io::stderr().is_terminal(),
        ProgressType::ProgressBar => true,
        ProgressType::TextUpdates => false,
    }
}

fn default_progress_delay(progress_type: ProgressType) -> std::time::Duration {
    if is_interactive(progress_type) {
        std::time::Duration::from_millis(200)
    } else {
        std::time::Duration::from_secs(10)
    }
}

fn init_tracing(output: &OutputConfig) -> anyhow::Result<()> {
    let level = if output.quiet {
        "off"
    } else {
        match output.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    // RUST_LOG overrides the command line verbosity
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed installing tracing subscriber: {err}"))
}

fn build_runtime(runtime: &RuntimeConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder.build().context("failed building tokio runtime")
}

/// Run `func` on a freshly configured runtime.
///
/// Installs logging, applies the throttling limits, shows progress if requested and prints
/// the result summary or error. Returns `None` if anything failed.
pub fn run<Fut, T, F>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle_config: ThrottleConfig,
    func: F,
) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
    T: std::fmt::Display,
{
    if let Err(error) = init_tracing(&output) {
        if !output.quiet {
            eprintln!("{error:#}");
        }
        return None;
    }
    if let Err(error) = throttle_config.validate() {
        if !output.quiet {
            eprintln!("invalid throttle settings: {error}");
        }
        return None;
    }
    let delay = match progress.as_ref() {
        Some(ProgressSettings {
            progress_delay: Some(delay),
            ..
        }) => match humantime::parse_duration(delay) {
            Ok(delay) => Some(delay),
            Err(error) => {
                if !output.quiet {
                    eprintln!("invalid progress delay {delay:?}: {error}");
                }
                return None;
            }
        },
        _ => None,
    };
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            return None;
        }
    };
    let res = {
        let _progress = progress.map(|settings| {
            let delay = delay.unwrap_or_else(|| default_progress_delay(settings.progress_type));
            ProgressTracker::new(settings.progress_type, delay)
        });
        runtime.block_on(async move {
            if let Some(max_open_files) = throttle_config.max_open_files {
                throttle::set_max_open_files(max_open_files);
            }
            if throttle_config.ops_throttle > 0 {
                let tokens = throttle::tokens_per_interval(throttle_config.ops_throttle);
                throttle::init_ops_tokens(tokens);
                tokio::spawn(throttle::run_ops_replenish_thread(tokens));
            }
            if throttle_config.iops_throttle > 0 {
                let tokens = throttle::tokens_per_interval(throttle_config.iops_throttle);
                throttle::init_iops_tokens(tokens);
                tokio::spawn(throttle::run_iops_replenish_thread(tokens));
            }
            func().await
        })
    };
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
