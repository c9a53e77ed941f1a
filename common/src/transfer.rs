//! Single-file transfer in fixed-size chunks, optionally publishing per-chunk byte counts.
//!
//! [`stream_copy`] returns right away with a [`ProgressStream`] and a [`CopyHandle`]; the
//! copy itself runs on a spawned task. The progress channel is bounded, so a consumer that
//! stops reading the stream holds the copy back instead of losing values. Dropping the
//! stream lets the copy finish without publishing.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::{Error, Fallback, Side};
use crate::throttle;

/// Number of progress values that may be buffered ahead of the consumer
pub const PROGRESS_CAPACITY: usize = 16;

pub type ProgressSender = tokio::sync::mpsc::Sender<Result<u64, Error>>;

/// Copy `src` to `dst` (created or truncated) one chunk at a time.
///
/// Returns the number of bytes copied. On failure the destination keeps whatever the last
/// successful write produced.
#[instrument(skip(cancel, progress))]
pub async fn copy_chunked(
    src: &std::path::Path,
    dst: &std::path::Path,
    chunk_size: usize,
    cancel: &CancellationToken,
    mut progress: Option<&ProgressSender>,
) -> Result<u64, Error> {
    if chunk_size == 0 {
        return Err(Error::InvalidConfiguration(
            "chunk size must be greater than 0".to_string(),
        ));
    }
    let _open_file_guard = throttle::open_file_permit().await;
    tracing::debug!("opening 'src' for reading and 'dst' for writing");
    let mut reader = tokio::fs::File::open(src)
        .await
        .map_err(|err| Error::from_io(Side::Source, src, err, Fallback::Read))?;
    let mut writer = tokio::fs::File::create(dst)
        .await
        .map_err(|err| Error::from_io(Side::Destination, dst, err, Fallback::Write))?;
    let mut buffer = vec![0u8; chunk_size];
    let mut total = 0u64;
    loop {
        let read = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            res = reader.read(&mut buffer) => {
                res.map_err(|err| Error::from_io(Side::Source, src, err, Fallback::Read))?
            }
        };
        if read == 0 {
            break;
        }
        throttle::get_iops_token().await;
        writer
            .write_all(&buffer[..read])
            .await
            .map_err(|err| Error::from_io(Side::Destination, dst, err, Fallback::Write))?;
        total += read as u64;
        if let Some(sender) = progress {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                res = sender.send(Ok(read as u64)) => {
                    if res.is_err() {
                        tracing::debug!("progress receiver dropped, continuing without progress");
                        progress = None;
                    }
                }
            }
        }
    }
    writer
        .flush()
        .await
        .map_err(|err| Error::from_io(Side::Destination, dst, err, Fallback::Write))?;
    tracing::debug!("copied {} bytes", total);
    Ok(total)
}

/// Per-chunk byte counts of one transfer, in order.
///
/// Yields `Ok(n)` for every chunk written. A failed or cancelled transfer ends the stream with
/// a single `Err`; a successful one simply ends.
pub struct ProgressStream {
    receiver: tokio::sync::mpsc::Receiver<Result<u64, Error>>,
}

impl futures::Stream for ProgressStream {
    type Item = Result<u64, Error>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

/// Completion side of [`stream_copy`].
pub struct CopyHandle {
    join: tokio::task::JoinHandle<Result<u64, Error>>,
    cancel: CancellationToken,
}

impl CopyHandle {
    /// Ask the transfer to stop at its next read or progress publish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Resolve to the total number of bytes copied, or the terminal failure.
    pub async fn wait(self) -> Result<u64, Error> {
        self.join.await?
    }
}

/// Start a streamed copy of `src` to `dst`. Must be called from within a tokio runtime.
///
/// Only `chunk_size` is validated up front; open and I/O failures are reported through the
/// returned stream and handle.
pub fn stream_copy(
    src: impl Into<std::path::PathBuf>,
    dst: impl Into<std::path::PathBuf>,
    chunk_size: usize,
) -> Result<(ProgressStream, CopyHandle), Error> {
    stream_copy_with_cancel(src, dst, chunk_size, CancellationToken::new())
}

pub fn stream_copy_with_cancel(
    src: impl Into<std::path::PathBuf>,
    dst: impl Into<std::path::PathBuf>,
    chunk_size: usize,
    cancel: CancellationToken,
) -> Result<(ProgressStream, CopyHandle), Error> {
    if chunk_size == 0 {
        return Err(Error::InvalidConfiguration(
            "chunk size must be greater than 0".to_string(),
        ));
    }
    let src = src.into();
    let dst = dst.into();
    // one extra slot is held back for the terminal error
    let (sender, receiver) = tokio::sync::mpsc::channel(PROGRESS_CAPACITY + 1);
    let task_cancel = cancel.clone();
    let join = tokio::spawn(async move {
        // fails only if the stream is already gone
        let terminal = sender.clone().reserve_owned().await.ok();
        let result = copy_chunked(&src, &dst, chunk_size, &task_cancel, Some(&sender)).await;
        if let (Err(error), Some(terminal)) = (&result, terminal) {
            terminal.send(Err(error.clone()));
        }
        result
    });
    Ok((ProgressStream { receiver }, CopyHandle { join, cancel }))
}
