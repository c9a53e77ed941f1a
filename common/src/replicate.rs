//! Two-phase tree replication.
//!
//! Phase 1 walks the source and creates every destination directory, one at a time. Only
//! after it completes does Phase 2 start the worker pool and walk the source again, submitting
//! one job per file. Every job therefore targets a directory that already exists, and workers
//! need no coordination beyond the job queue.

use std::os::unix::fs::PermissionsExt;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::ReplicateSettings;
use crate::error::{self, Fallback, Side};
use crate::fsops;
use crate::pool::{ChunkedCopier, CopyJob, Copier, WorkerPool};
use crate::progress;
use crate::walk::TreeWalker;

/// Mode of directories created below the destination root
const DIR_MODE: u32 = 0o755;

/// Replication failure that preserves the operation summary.
///
/// `source` is the primary cause: a validation or walk failure if there was one, otherwise
/// the first failure a worker reported.
#[derive(Debug, thiserror::Error)]
#[error("replication failed")]
pub struct Error {
    #[source]
    pub source: error::Error,
    pub summary: Summary,
    /// Worker failures reported besides the primary one
    pub other_failures: Vec<error::Error>,
    /// Failure to remove directories created before a failed directory pass
    pub cleanup: Option<error::Error>,
}

impl Error {
    #[must_use]
    pub fn new(source: error::Error, summary: Summary) -> Self {
        Error {
            source,
            summary,
            other_failures: Vec::new(),
            cleanup: None,
        }
    }
}

impl From<error::Error> for Error {
    fn from(source: error::Error) -> Self {
        Error::new(source, Summary::default())
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub bytes_copied: u64,
    pub files_copied: usize,
    pub files_failed: usize,
    pub directories_created: usize,
    pub directories_unchanged: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            files_copied: self.files_copied + other.files_copied,
            files_failed: self.files_failed + other.files_failed,
            directories_created: self.directories_created + other.directories_created,
            directories_unchanged: self.directories_unchanged + other.directories_unchanged,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            files copied: {}\n\
            files failed: {}\n\
            directories created: {}\n\
            directories unchanged: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.files_copied,
            self.files_failed,
            self.directories_created,
            self.directories_unchanged,
        )
    }
}

/// Replicate the tree under `src` into `dst` using [`ChunkedCopier`] workers.
pub async fn replicate(
    prog_track: &'static progress::Progress,
    src: &std::path::Path,
    dst: &std::path::Path,
    settings: &ReplicateSettings,
    cancel: &CancellationToken,
) -> Result<Summary, Error> {
    let copier = ChunkedCopier {
        chunk_size: settings.chunk_size,
    };
    replicate_with(prog_track, src, dst, settings, copier, cancel).await
}

/// Same as [`replicate`] with a caller-provided copy step.
#[instrument(skip(prog_track, copier, cancel))]
pub async fn replicate_with<C: Copier>(
    prog_track: &'static progress::Progress,
    src: &std::path::Path,
    dst: &std::path::Path,
    settings: &ReplicateSettings,
    copier: C,
    cancel: &CancellationToken,
) -> Result<Summary, Error> {
    settings.validate()?;
    tracing::debug!("reading source metadata");
    let src_metadata = tokio::fs::metadata(src)
        .await
        .map_err(|err| error::Error::from_io(Side::Source, src, err, Fallback::Read))?;
    if !src_metadata.is_dir() {
        return Err(error::Error::NotADirectory {
            side: Side::Source,
            path: src.to_path_buf(),
        }
        .into());
    }
    let mut summary = Summary::default();
    let created_root = prepare_root(dst, src_metadata.permissions().mode() & 0o7777).await?;
    if created_root.is_some() {
        prog_track.directories_created.inc();
        summary.directories_created += 1;
    } else {
        prog_track.directories_unchanged.inc();
        summary.directories_unchanged += 1;
    }
    tracing::debug!("creating directory structure");
    let mut created = Vec::new();
    if let Err(error) =
        create_directories(prog_track, src, dst, cancel, &mut created, &mut summary).await
    {
        return Err(abort_directory_pass(error, created_root.as_deref(), &created, summary).await);
    }
    tracing::debug!("copying files with {} workers", settings.workers);
    let pool = WorkerPool::start(
        settings.workers,
        settings.queue_capacity,
        copier,
        prog_track,
        cancel,
    )
    .map_err(|err| Error::new(err, summary))?;
    let walk_result = submit_files(&pool, src, dst, cancel).await;
    let outcome = pool.finish().await;
    summary = summary + outcome.summary;
    let mut failures = outcome.failures.into_iter();
    match walk_result {
        // a broken walk means the job set itself was incomplete
        Err(error)
            if !matches!(
                error,
                error::Error::QueueClosedPrematurely | error::Error::Cancelled
            ) =>
        {
            tracing::error!("failed walking {:?}: {:#}", src, &error);
            Err(Error {
                source: error,
                summary,
                other_failures: failures.collect(),
                cleanup: None,
            })
        }
        walk_result => {
            if let Some(first) = failures.next() {
                return Err(Error {
                    source: first,
                    summary,
                    other_failures: failures.collect(),
                    cleanup: None,
                });
            }
            walk_result.map_err(|err| Error::new(err, summary))?;
            if cancel.is_cancelled() {
                // workers may have left jobs in the queue
                return Err(Error::new(error::Error::Cancelled, summary));
            }
            Ok(summary)
        }
    }
}

/// Make sure `dst` is a directory, creating it and any missing parents with `mode` if it
/// does not exist.
///
/// Returns the topmost directory this call created, `None` if `dst` already existed.
async fn prepare_root(
    dst: &std::path::Path,
    mode: u32,
) -> Result<Option<std::path::PathBuf>, error::Error> {
    match tokio::fs::metadata(dst).await {
        Ok(metadata) if metadata.is_dir() => {
            tracing::debug!("destination {:?} exists", dst);
            Ok(None)
        }
        Ok(_) => Err(error::Error::NotADirectory {
            side: Side::Destination,
            path: dst.to_path_buf(),
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("destination {:?} does not exist, creating", dst);
            let top = topmost_missing(dst).await;
            tokio::fs::DirBuilder::new()
                .recursive(true)
                .mode(mode)
                .create(dst)
                .await
                .map_err(|err| {
                    error::Error::from_io(Side::Destination, dst, err, Fallback::CreateDir)
                })?;
            Ok(Some(top))
        }
        // anything but "missing" is a failure, not a reason to create
        Err(err) => Err(error::Error::from_io(
            Side::Destination,
            dst,
            err,
            Fallback::Read,
        )),
    }
}

/// First path, walking up from `path`, whose parent exists.
async fn topmost_missing(path: &std::path::Path) -> std::path::PathBuf {
    let mut top = path.to_path_buf();
    for ancestor in path.ancestors().skip(1) {
        if ancestor.as_os_str().is_empty() {
            break;
        }
        match tokio::fs::symlink_metadata(ancestor).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                top = ancestor.to_path_buf();
            }
            _ => break,
        }
    }
    top
}

#[instrument(skip(prog_track, cancel, created, summary))]
async fn create_directories(
    prog_track: &'static progress::Progress,
    src: &std::path::Path,
    dst: &std::path::Path,
    cancel: &CancellationToken,
    created: &mut Vec<std::path::PathBuf>,
    summary: &mut Summary,
) -> Result<(), error::Error> {
    let mut walker = TreeWalker::new(src, cancel.clone());
    while let Some(entry) = walker.next_entry().await {
        let entry = entry?;
        if !entry.is_dir {
            continue;
        }
        let dst_path = dst.join(&entry.relative);
        match tokio::fs::metadata(&dst_path).await {
            Ok(metadata) if metadata.is_dir() => {
                prog_track.directories_unchanged.inc();
                summary.directories_unchanged += 1;
            }
            Ok(_) => {
                return Err(error::Error::NotADirectory {
                    side: Side::Destination,
                    path: dst_path,
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(DIR_MODE)
                    .create(&dst_path)
                    .await
                    .map_err(|err| {
                        error::Error::from_io(Side::Destination, &dst_path, err, Fallback::CreateDir)
                    })?;
                tracing::trace!("created {:?}", &dst_path);
                created.push(dst_path);
                prog_track.directories_created.inc();
                summary.directories_created += 1;
            }
            Err(err) => {
                return Err(error::Error::from_io(
                    Side::Destination,
                    &dst_path,
                    err,
                    Fallback::Read,
                ));
            }
        }
    }
    Ok(())
}

/// Undo a failed directory pass and wrap its failure. A failed cleanup is reported next to
/// the original cause, never in its place.
async fn abort_directory_pass(
    error: error::Error,
    created_root: Option<&std::path::Path>,
    created: &[std::path::PathBuf],
    summary: Summary,
) -> Error {
    tracing::error!("failed creating directory structure: {:#}", &error);
    let cleanup = rollback(created_root, created).await.err();
    if let Some(cleanup_error) = &cleanup {
        tracing::error!("failed cleaning up: {:#}", cleanup_error);
    }
    Error {
        source: error,
        summary,
        other_failures: Vec::new(),
        cleanup,
    }
}

/// Remove what a failed directory pass created: everything from the topmost created
/// directory down if the root was created, otherwise each created directory, deepest first.
/// Keeps going after a failure and returns the first.
async fn rollback(
    created_root: Option<&std::path::Path>,
    created: &[std::path::PathBuf],
) -> Result<(), error::Error> {
    if let Some(root) = created_root {
        return fsops::remove_tree(root).await;
    }
    let mut first_error = None;
    for path in created.iter().rev() {
        if let Err(error) = fsops::remove_tree(path).await {
            tracing::warn!("failed removing {:?}: {:#}", path, &error);
            first_error.get_or_insert(error);
        }
    }
    first_error.map_or(Ok(()), Err)
}

#[instrument(skip(pool, cancel))]
async fn submit_files(
    pool: &WorkerPool,
    src: &std::path::Path,
    dst: &std::path::Path,
    cancel: &CancellationToken,
) -> Result<(), error::Error> {
    let mut walker = TreeWalker::new(src, cancel.clone());
    let mut submitted = 0usize;
    while let Some(entry) = walker.next_entry().await {
        let entry = entry?;
        if entry.is_dir {
            continue;
        }
        let job = CopyJob {
            src: src.join(&entry.relative),
            dst: dst.join(&entry.relative),
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(error::Error::Cancelled),
            res = pool.submit(job) => res?,
        }
        submitted += 1;
    }
    tracing::debug!("submitted {} jobs", submitted);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;
    use std::sync::Arc;
    use tracing_test::traced_test;

    static PROGRESS: std::sync::LazyLock<progress::Progress> =
        std::sync::LazyLock::new(progress::Progress::new);

    fn settings(workers: usize) -> ReplicateSettings {
        ReplicateSettings {
            workers,
            queue_capacity: 4,
            chunk_size: 7,
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn two_files_two_workers() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let src = tmp_dir.path().join("src");
        let dst = tmp_dir.path().join("dst");
        tokio::fs::create_dir_all(src.join("sub")).await?;
        tokio::fs::write(src.join("a.txt"), "hi").await?;
        tokio::fs::write(src.join("sub").join("b.txt"), "bye").await?;
        let summary = replicate(&PROGRESS, &src, &dst, &settings(2), &CancellationToken::new())
            .await?;
        assert_eq!(tokio::fs::read_to_string(dst.join("a.txt")).await?, "hi");
        assert_eq!(
            tokio::fs::read_to_string(dst.join("sub").join("b.txt")).await?,
            "bye"
        );
        assert_eq!(summary.files_copied, 2);
        assert_eq!(summary.bytes_copied, 5);
        assert_eq!(summary.directories_created, 2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn check_basic_replicate() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.path();
        let summary = replicate(
            &PROGRESS,
            &test_path.join("foo"),
            &test_path.join("bar"),
            &settings(3),
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!(summary.files_copied, 6);
        assert_eq!(summary.files_failed, 0);
        // root + bar, baz, baz/qux
        assert_eq!(summary.directories_created, 4);
        testutils::check_dirs_identical(&test_path.join("foo"), &test_path.join("bar")).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[traced_test]
    async fn worker_count_does_not_change_result() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.path();
        let big: Vec<u8> = (0..100_000u32).map(|i| (i % 13) as u8).collect();
        tokio::fs::write(test_path.join("foo").join("baz").join("big.bin"), &big).await?;
        for workers in [1, 2, 8] {
            let dst = test_path.join(format!("copy-{workers}"));
            replicate(
                &PROGRESS,
                &test_path.join("foo"),
                &dst,
                &settings(workers),
                &CancellationToken::new(),
            )
            .await?;
            testutils::check_dirs_identical(&test_path.join("foo"), &dst).await?;
        }
        testutils::check_dirs_identical(&test_path.join("copy-1"), &test_path.join("copy-8"))
            .await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn empty_source_creates_destination() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let src = tmp_dir.path().join("empty");
        let dst = tmp_dir.path().join("out");
        tokio::fs::create_dir(&src).await?;
        let summary =
            replicate(&PROGRESS, &src, &dst, &settings(2), &CancellationToken::new()).await?;
        assert!(tokio::fs::metadata(&dst).await?.is_dir());
        assert_eq!(summary.files_copied, 0);
        assert_eq!(summary.directories_created, 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn root_inherits_source_mode() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let src = tmp_dir.path().join("src");
        let dst = tmp_dir.path().join("dst");
        tokio::fs::create_dir(&src).await?;
        tokio::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o700)).await?;
        replicate(&PROGRESS, &src, &dst, &settings(1), &CancellationToken::new()).await?;
        let mode = tokio::fs::metadata(&dst).await?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn existing_destination_is_reused() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.path();
        let dst = test_path.join("out");
        tokio::fs::create_dir_all(dst.join("bar")).await?;
        let summary = replicate(
            &PROGRESS,
            &test_path.join("foo"),
            &dst,
            &settings(2),
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!(summary.directories_unchanged, 2);
        assert_eq!(summary.directories_created, 2);
        testutils::check_dirs_identical(&test_path.join("foo"), &dst).await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn source_must_be_directory() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let file = tmp_dir.path().join("file.txt");
        tokio::fs::write(&file, "data").await?;
        let dst = tmp_dir.path().join("dst");
        let error = replicate(&PROGRESS, &file, &dst, &settings(2), &CancellationToken::new())
            .await
            .expect_err("file source must be rejected");
        assert!(matches!(
            error.source,
            error::Error::NotADirectory {
                side: Side::Source,
                ..
            }
        ));
        assert!(!dst.exists());
        let missing = tmp_dir.path().join("missing");
        let error = replicate(&PROGRESS, &missing, &dst, &settings(2), &CancellationToken::new())
            .await
            .expect_err("missing source must be rejected");
        assert!(matches!(
            error.source,
            error::Error::NotFound {
                side: Side::Source,
                ..
            }
        ));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn destination_must_be_directory() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let dst = tmp_dir.path().join("dst.txt");
        tokio::fs::write(&dst, "not a directory").await?;
        let error = replicate(
            &PROGRESS,
            &tmp_dir.path().join("foo"),
            &dst,
            &settings(2),
            &CancellationToken::new(),
        )
        .await
        .expect_err("file destination must be rejected");
        assert!(matches!(
            error.source,
            error::Error::NotADirectory {
                side: Side::Destination,
                ..
            }
        ));
        assert_eq!(tokio::fs::read_to_string(&dst).await?, "not a directory");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn zero_workers_rejected_before_touching_destination() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let dst = tmp_dir.path().join("dst");
        let error = replicate(
            &PROGRESS,
            &tmp_dir.path().join("foo"),
            &dst,
            &settings(0),
            &CancellationToken::new(),
        )
        .await
        .expect_err("zero workers must be rejected");
        assert!(matches!(
            error.source,
            error::Error::InvalidConfiguration(_)
        ));
        assert!(!dst.exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn unreadable_file_does_not_stop_others() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.path();
        // a dangling symlink cannot be opened for reading
        let broken = test_path.join("foo").join("bar").join("broken");
        tokio::fs::symlink(test_path.join("nowhere"), &broken).await?;
        let error = replicate(
            &PROGRESS,
            &test_path.join("foo"),
            &test_path.join("out"),
            &settings(4),
            &CancellationToken::new(),
        )
        .await
        .expect_err("dangling symlink must fail the replication");
        assert!(matches!(
            &error.source,
            error::Error::NotFound {
                side: Side::Source,
                path,
                ..
            } if path == &broken
        ));
        assert!(error.other_failures.is_empty());
        assert_eq!(error.summary.files_copied, 6);
        assert_eq!(error.summary.files_failed, 1);
        // every other file made it
        tokio::fs::remove_file(&broken).await?;
        testutils::check_dirs_identical(&test_path.join("foo"), &test_path.join("out")).await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_directory_pass_is_rolled_back() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.path();
        let dst = test_path.join("out");
        tokio::fs::create_dir(&dst).await?;
        // a file where the source has the "baz" directory
        tokio::fs::write(dst.join("baz"), "keep me").await?;
        let error = replicate(
            &PROGRESS,
            &test_path.join("foo"),
            &dst,
            &settings(2),
            &CancellationToken::new(),
        )
        .await
        .expect_err("conflicting destination must fail");
        match &error.source {
            error::Error::NotADirectory { side, path } => {
                assert_eq!(*side, Side::Destination);
                assert_eq!(path, &dst.join("baz"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(error.cleanup.is_none());
        // "bar" was created before the failure and must be gone again
        assert!(!dst.join("bar").exists());
        assert!(dst.is_dir());
        assert_eq!(tokio::fs::read_to_string(dst.join("baz")).await?, "keep me");
        assert_eq!(error.summary.files_copied, 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn rollback_removes_created_root() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let dst = tmp_dir.path().join("dst");
        tokio::fs::create_dir_all(dst.join("a").join("b")).await?;
        rollback(Some(&dst), &[dst.join("a"), dst.join("a").join("b")]).await?;
        assert!(!dst.exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn rollback_continues_past_failures() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let dst = tmp_dir.path().join("dst");
        tokio::fs::create_dir_all(dst.join("a")).await?;
        tokio::fs::write(dst.join("file.txt"), "data").await?;
        // cannot be removed: its parent is a file
        let blocked = dst.join("file.txt").join("x");
        let result = rollback(None, &[dst.join("a"), blocked.clone()]).await;
        assert!(matches!(
            result,
            Err(error::Error::NotADirectory { path, .. }) if path == blocked
        ));
        assert!(!dst.join("a").exists());
        assert!(dst.is_dir());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_cleanup_keeps_original_cause() -> Result<(), anyhow::Error> {
        let tmp_dir = tempfile::tempdir()?;
        let dst = tmp_dir.path().join("dst");
        tokio::fs::create_dir_all(dst.join("a")).await?;
        tokio::fs::write(dst.join("file.txt"), "data").await?;
        let summary = Summary {
            directories_created: 2,
            ..Default::default()
        };
        let error = abort_directory_pass(
            error::Error::Cancelled,
            None,
            &[dst.join("a"), dst.join("file.txt").join("x")],
            summary,
        )
        .await;
        assert!(matches!(error.source, error::Error::Cancelled));
        assert!(matches!(
            error.cleanup,
            Some(error::Error::NotADirectory { .. })
        ));
        assert!(error.other_failures.is_empty());
        assert_eq!(error.summary, summary);
        assert!(!dst.join("a").exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn rollback_removes_created_parents() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let parent = tmp_dir.path().join("a");
        let dst = parent.join("b").join("out");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = replicate(&PROGRESS, &tmp_dir.path().join("foo"), &dst, &settings(2), &cancel)
            .await
            .expect_err("cancelled replication must fail");
        assert!(matches!(error.source, error::Error::Cancelled));
        assert!(error.cleanup.is_none());
        assert!(!parent.exists());
        assert!(tmp_dir.path().join("foo").is_dir());
        Ok(())
    }

    /// Holds every copy until the one for `trigger` has removed `remove` from the source and
    /// then failed.
    struct GatedCopier {
        trigger: std::path::PathBuf,
        remove: std::path::PathBuf,
        gate: tokio::sync::Semaphore,
    }

    impl Copier for Arc<GatedCopier> {
        async fn copy(&self, job: &CopyJob, cancel: &CancellationToken) -> Result<u64, error::Error> {
            if job.src == self.trigger {
                let removed = tokio::fs::remove_dir_all(&self.remove).await;
                self.gate.add_permits(100);
                removed.map_err(|err| {
                    error::Error::from_io(Side::Source, &self.remove, err, Fallback::Write)
                })?;
                return Err(error::Error::from_io(
                    Side::Source,
                    &job.src,
                    std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                    Fallback::Read,
                ));
            }
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| error::Error::Cancelled)?;
            crate::transfer::copy_chunked(&job.src, &job.dst, 3, cancel, None).await
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn walk_failure_takes_priority_over_worker_failures() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.path().join("foo");
        let dst = tmp_dir.path().join("out");
        // "baz" is walked only after a worker is free again, which needs the gate open
        let copier = Arc::new(GatedCopier {
            trigger: src.join("0.txt"),
            remove: src.join("baz"),
            gate: tokio::sync::Semaphore::new(0),
        });
        let settings = ReplicateSettings {
            workers: 2,
            queue_capacity: 1,
            chunk_size: 7,
        };
        let error = replicate_with(
            &PROGRESS,
            &src,
            &dst,
            &settings,
            copier,
            &CancellationToken::new(),
        )
        .await
        .expect_err("vanished directory must fail the replication");
        match &error.source {
            error::Error::NotFound { side, path, .. } => {
                assert_eq!(*side, Side::Source);
                assert_eq!(path, &src.join("baz"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(error.other_failures.len(), 1);
        assert!(matches!(
            &error.other_failures[0],
            error::Error::PermissionDenied { path, .. } if path == &src.join("0.txt")
        ));
        assert_eq!(error.summary.files_failed, 1);
        assert_eq!(error.summary.files_copied, 3);
        Ok(())
    }

    /// Checks that every destination directory already exists whenever a copy starts.
    struct OrderingCopier {
        expected_dirs: Vec<std::path::PathBuf>,
        violations: std::sync::atomic::AtomicUsize,
        copies: std::sync::atomic::AtomicUsize,
    }

    impl Copier for Arc<OrderingCopier> {
        async fn copy(&self, job: &CopyJob, cancel: &CancellationToken) -> Result<u64, error::Error> {
            for dir in &self.expected_dirs {
                if !dir.is_dir() {
                    self.violations
                        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            }
            self.copies.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            crate::transfer::copy_chunked(&job.src, &job.dst, 3, cancel, None).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[traced_test]
    async fn directories_exist_before_any_copy() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let test_path = tmp_dir.path();
        let dst = test_path.join("out");
        let copier = Arc::new(OrderingCopier {
            expected_dirs: vec![
                dst.clone(),
                dst.join("bar"),
                dst.join("baz"),
                dst.join("baz").join("qux"),
            ],
            violations: Default::default(),
            copies: Default::default(),
        });
        replicate_with(
            &PROGRESS,
            &test_path.join("foo"),
            &dst,
            &settings(4),
            copier.clone(),
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!(copier.copies.load(std::sync::atomic::Ordering::SeqCst), 6);
        assert_eq!(copier.violations.load(std::sync::atomic::Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn cancelled_replication_fails() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = replicate(
            &PROGRESS,
            &tmp_dir.path().join("foo"),
            &tmp_dir.path().join("out"),
            &settings(2),
            &cancel,
        )
        .await
        .expect_err("cancelled replication must fail");
        assert!(matches!(error.source, error::Error::Cancelled));
        // the directory pass was cut short and rolled back
        assert!(!tmp_dir.path().join("out").exists());
        Ok(())
    }

    mod equivalence {
        use super::*;
        use proptest::prelude::*;

        fn build_tree(
            root: &std::path::Path,
            files: &[(Vec<String>, Vec<u8>)],
            dirs: &[Vec<String>],
        ) -> std::io::Result<()> {
            std::fs::create_dir_all(root)?;
            for components in dirs {
                let mut path = root.to_path_buf();
                for name in components {
                    path.push(format!("d{name}"));
                }
                std::fs::create_dir_all(&path)?;
            }
            for (components, contents) in files {
                let mut path = root.to_path_buf();
                let (file_name, parents) = components.split_last().expect("non-empty path");
                for name in parents {
                    path.push(format!("d{name}"));
                }
                std::fs::create_dir_all(&path)?;
                std::fs::write(path.join(format!("f{file_name}")), contents)?;
            }
            Ok(())
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(16))]

            #[test]
            fn parallel_matches_sequential(
                files in prop::collection::vec(
                    (prop::collection::vec("[a-c]", 1..4), prop::collection::vec(any::<u8>(), 0..64)),
                    0..12,
                ),
                dirs in prop::collection::vec(prop::collection::vec("[a-c]", 1..4), 0..4),
                workers in 1usize..8,
            ) {
                let runtime = tokio::runtime::Runtime::new().unwrap();
                runtime.block_on(async {
                    let tmp_dir = tempfile::tempdir().unwrap();
                    let src = tmp_dir.path().join("src");
                    build_tree(&src, &files, &dirs).unwrap();
                    let sequential = tmp_dir.path().join("sequential");
                    let parallel = tmp_dir.path().join("parallel");
                    fsops::copy_dir(&src, &sequential).await.unwrap();
                    replicate(
                        &PROGRESS,
                        &src,
                        &parallel,
                        &settings(workers),
                        &CancellationToken::new(),
                    )
                    .await
                    .unwrap();
                    testutils::check_dirs_identical(&src, &parallel).await.unwrap();
                    testutils::check_dirs_identical(&sequential, &parallel).await.unwrap();
                });
            }
        }
    }
}
