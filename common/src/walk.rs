//! Lazy depth-first, pre-order traversal of a directory tree.
//!
//! Each directory is read only when the walk reaches it, and its entries are yielded in
//! name order, so walking an unchanged tree twice produces the same sequence. The root itself
//! is not yielded. Entries are classified without following symbolic links.

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::{Error, Fallback, Side};
use crate::throttle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Path relative to the walk root
    pub relative: std::path::PathBuf,
    pub is_dir: bool,
}

#[derive(Debug)]
pub struct TreeWalker {
    root: std::path::PathBuf,
    cancel: CancellationToken,
    // entries still to be yielded, next one at the end
    pending: Vec<WalkEntry>,
    // directory yielded last whose children have not been read yet
    expand: Option<std::path::PathBuf>,
    done: bool,
}

impl TreeWalker {
    pub fn new(root: impl Into<std::path::PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            root: root.into(),
            cancel,
            pending: Vec::new(),
            expand: Some(std::path::PathBuf::new()),
            done: false,
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Next entry of the walk, `None` once the tree is exhausted.
    ///
    /// A failure to read a directory is returned once and ends the walk; entries yielded
    /// before it stay valid.
    pub async fn next_entry(&mut self) -> Option<Result<WalkEntry, Error>> {
        if self.done {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.done = true;
            return Some(Err(Error::Cancelled));
        }
        if let Some(dir) = self.expand.take() {
            if let Err(error) = self.read_children(&dir).await {
                self.done = true;
                return Some(Err(error));
            }
        }
        let Some(entry) = self.pending.pop() else {
            self.done = true;
            return None;
        };
        throttle::get_ops_token().await;
        if entry.is_dir {
            self.expand = Some(entry.relative.clone());
        }
        Some(Ok(entry))
    }

    #[instrument(skip(self))]
    async fn read_children(&mut self, relative: &std::path::Path) -> Result<(), Error> {
        let path = self.root.join(relative);
        let mut entries = tokio::fs::read_dir(&path)
            .await
            .map_err(|err| Error::from_io(Side::Source, &path, err, Fallback::Read))?;
        let mut children = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(Error::Cancelled),
                res = entries.next_entry() => {
                    res.map_err(|err| Error::from_io(Side::Source, &path, err, Fallback::Read))?
                }
            };
            let Some(entry) = next else {
                break;
            };
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| Error::from_io(Side::Source, &entry.path(), err, Fallback::Read))?;
            children.push(WalkEntry {
                relative: relative.join(entry.file_name()),
                is_dir: file_type.is_dir(),
            });
        }
        // reverse order so that popping yields names in ascending order
        children.sort_by(|a, b| b.relative.cmp(&a.relative));
        tracing::trace!("read {} entries", children.len());
        self.pending.extend(children);
        Ok(())
    }

    pub fn into_stream(self) -> impl futures::Stream<Item = Result<WalkEntry, Error>> {
        futures::stream::unfold(self, |mut walker| async move {
            walker.next_entry().await.map(|item| (item, walker))
        })
    }
}
