use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "treecp",
    version,
    about = "Replicate a directory tree using a pool of parallel copy workers",
    long_about = "`treecp` copies the contents of SRC into DST.

All destination directories are created first, then the files are copied by a pool of workers.
If creating the directory structure fails, directories created by this run are removed again.

EXAMPLE:
    # Copy with 16 workers and show progress
    treecp /data/src /data/dst --workers 16 --progress --summary"
)]
struct Args {
    // Copy options
    /// Number of concurrent copy workers
    #[arg(
        long,
        default_value_t = common::config::DEFAULT_WORKERS,
        value_name = "N",
        help_heading = "Copy options"
    )]
    workers: usize,

    /// Number of copy jobs that may wait for a free worker
    #[arg(
        long,
        default_value_t = common::config::DEFAULT_QUEUE_CAPACITY,
        value_name = "N",
        help_heading = "Copy options"
    )]
    queue_capacity: usize,

    /// Size of each read/write, e.g. "128KiB", "1MB"
    #[arg(
        long,
        default_value = "128KiB",
        value_name = "SIZE",
        help_heading = "Copy options"
    )]
    chunk_size: bytesize::ByteSize,

    /// Copy one file at a time without the worker pool
    #[arg(long, help_heading = "Copy options")]
    sequential: bool,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for logging), Auto (default, will
    /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Sets the delay between progress updates
    ///
    /// - For the interactive (--progress-type=ProgressBar), the default is 200ms.
    /// - For the non-interactive (--progress-type=TextUpdates), the default is 10s.
    ///
    /// If specified, --progress flag is implied.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Maximum number of open files, 0 or unspecified means no limit
    #[arg(long, value_name = "N", help_heading = "Performance & throttling")]
    max_open_files: Option<usize>,

    /// Throttle the number of walked entries per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    ops_throttle: usize,

    /// Throttle the number of chunks copied per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    iops_throttle: usize,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source directory
    #[arg()]
    src: std::path::PathBuf,

    /// Destination directory, created if missing
    #[arg()]
    dst: std::path::PathBuf,
}

enum Outcome {
    Parallel(common::Summary),
    Sequential,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Outcome::Parallel(summary) => write!(f, "{summary}"),
            Outcome::Sequential => write!(f, "sequential copy complete"),
        }
    }
}

#[instrument]
async fn async_main(args: Args) -> Result<Outcome> {
    if args.sequential {
        common::fsops::copy_dir(&args.src, &args.dst)
            .await
            .with_context(|| format!("failed copying {:?} to {:?}", &args.src, &args.dst))?;
        return Ok(Outcome::Sequential);
    }
    let settings = common::ReplicateSettings {
        workers: args.workers,
        queue_capacity: args.queue_capacity,
        chunk_size: usize::try_from(args.chunk_size.as_u64())
            .context("chunk size does not fit in memory")?,
    };
    let cancel = tokio_util::sync::CancellationToken::new();
    let signal_cancel = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping");
            signal_cancel.cancel();
        }
    });
    let result = common::replicate(
        &common::PROGRESS,
        &args.src,
        &args.dst,
        &settings,
        &cancel,
    )
    .await;
    signal_task.abort();
    match result {
        Ok(summary) => Ok(Outcome::Parallel(summary)),
        Err(error) => {
            for failure in &error.other_failures {
                tracing::error!("{:#}", failure);
            }
            if let Some(cleanup) = &error.cleanup {
                tracing::error!("cleanup failed: {:#}", cleanup);
            }
            if args.summary {
                return Err(anyhow!(
                    "{:#}\n\n{}",
                    anyhow::Error::new(error.source),
                    &error.summary
                ));
            }
            Err(anyhow::Error::new(error.source))
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        max_open_files: args.max_open_files,
        ops_throttle: args.ops_throttle,
        iops_throttle: args.iops_throttle,
    };
    let res = common::run(
        if args.progress || args.progress_type.is_some() || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        output,
        runtime,
        throttle,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
