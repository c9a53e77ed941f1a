//! Single-shot file system operations.
//!
//! Each operation maps its I/O failures onto [`Error`] with the side and path involved.
//! Paths being created, written or removed are reported as the destination; paths that are
//! only read are reported as the source.

use std::os::unix::fs::PermissionsExt;

use async_recursion::async_recursion;
use sha2::Digest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

use crate::error::{Error, Fallback, Side};
use crate::throttle;

/// Mode used for directories created on behalf of callers
const DIR_MODE: u32 = 0o755;

/// Read buffer used when copying and hashing
const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: std::ffi::OsString,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathInfo {
    pub is_dir: bool,
    /// Permission bits
    pub mode: u32,
    pub len: u64,
}

fn source_error(path: &std::path::Path, fallback: Fallback) -> impl FnOnce(std::io::Error) -> Error {
    move |err| Error::from_io(Side::Source, path, err, fallback)
}

fn destination_error(
    path: &std::path::Path,
    fallback: Fallback,
) -> impl FnOnce(std::io::Error) -> Error {
    move |err| Error::from_io(Side::Destination, path, err, fallback)
}

/// Copy a regular file, creating or truncating `dst`. Returns the number of bytes copied.
#[instrument]
pub async fn copy_file(src: &std::path::Path, dst: &std::path::Path) -> Result<u64, Error> {
    let _open_file_guard = throttle::open_file_permit().await;
    throttle::get_ops_token().await;
    let mut reader = tokio::fs::File::open(src)
        .await
        .map_err(source_error(src, Fallback::Read))?;
    let metadata = reader
        .metadata()
        .await
        .map_err(source_error(src, Fallback::Read))?;
    if metadata.is_dir() {
        return Err(Error::IsADirectory {
            side: Side::Source,
            path: src.to_path_buf(),
        });
    }
    let mut writer = tokio::fs::File::create(dst)
        .await
        .map_err(destination_error(dst, Fallback::Write))?;
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let read = reader
            .read(&mut buffer)
            .await
            .map_err(source_error(src, Fallback::Read))?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .await
            .map_err(destination_error(dst, Fallback::Write))?;
        copied += read as u64;
    }
    writer
        .flush()
        .await
        .map_err(destination_error(dst, Fallback::Write))?;
    tracing::debug!("copied {} bytes", copied);
    Ok(copied)
}

/// Move `src` to `dst`. Fails when the two are on different file systems.
#[instrument]
pub async fn move_file(src: &std::path::Path, dst: &std::path::Path) -> Result<(), Error> {
    throttle::get_ops_token().await;
    tokio::fs::symlink_metadata(src)
        .await
        .map_err(source_error(src, Fallback::Read))?;
    tokio::fs::rename(src, dst)
        .await
        .map_err(destination_error(dst, Fallback::Write))
}

/// Remove a file. Removing a file that does not exist succeeds.
#[instrument]
pub async fn remove_file(path: &std::path::Path) -> Result<(), Error> {
    throttle::get_ops_token().await;
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => {
            return Err(Error::IsADirectory {
                side: Side::Destination,
                path: path.to_path_buf(),
            });
        }
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("already gone");
            return Ok(());
        }
        Err(err) => return Err(Error::from_io(Side::Destination, path, err, Fallback::Write)),
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        // lost a race with someone else removing it
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::from_io(Side::Destination, path, err, Fallback::Write)),
    }
}

#[instrument]
pub async fn read_file(path: &std::path::Path) -> Result<Vec<u8>, Error> {
    let _open_file_guard = throttle::open_file_permit().await;
    throttle::get_ops_token().await;
    tokio::fs::read(path)
        .await
        .map_err(source_error(path, Fallback::Read))
}

/// Write `contents` to `path`, creating missing parent directories first.
#[instrument(skip(contents))]
pub async fn write_file(path: &std::path::Path, contents: &[u8]) -> Result<(), Error> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        create_dir(parent, true).await?;
    }
    let _open_file_guard = throttle::open_file_permit().await;
    throttle::get_ops_token().await;
    tokio::fs::write(path, contents)
        .await
        .map_err(destination_error(path, Fallback::Write))
}

/// Entries directly inside `path`, sorted by name.
#[instrument]
pub async fn list_dir(path: &std::path::Path) -> Result<Vec<DirEntryInfo>, Error> {
    throttle::get_ops_token().await;
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(source_error(path, Fallback::Read))?;
    let mut infos = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(source_error(path, Fallback::Read))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(source_error(&entry.path(), Fallback::Read))?;
        infos.push(DirEntryInfo {
            name: entry.file_name(),
            is_dir: file_type.is_dir(),
        });
    }
    infos.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(infos)
}

/// Type, permissions and size of `path`, following symbolic links.
pub async fn stat(path: &std::path::Path) -> Result<PathInfo, Error> {
    throttle::get_ops_token().await;
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(source_error(path, Fallback::Read))?;
    Ok(PathInfo {
        is_dir: metadata.is_dir(),
        mode: metadata.permissions().mode() & 0o7777,
        len: metadata.len(),
    })
}

/// Create a directory with mode 0755. With `recursive`, missing parents are created too and
/// an existing directory is not an error.
#[instrument]
pub async fn create_dir(path: &std::path::Path, recursive: bool) -> Result<(), Error> {
    make_dir(path, recursive, DIR_MODE).await
}

async fn make_dir(path: &std::path::Path, recursive: bool, mode: u32) -> Result<(), Error> {
    throttle::get_ops_token().await;
    let result = tokio::fs::DirBuilder::new()
        .recursive(recursive)
        .mode(mode)
        .create(path)
        .await;
    match result {
        Ok(()) => Ok(()),
        Err(err) if recursive && err.kind() == std::io::ErrorKind::AlreadyExists => {
            // recursive creation only gets here if something other than a directory is in the way
            Err(Error::NotADirectory {
                side: Side::Destination,
                path: path.to_path_buf(),
            })
        }
        Err(err) => Err(Error::from_io(
            Side::Destination,
            path,
            err,
            Fallback::CreateDir,
        )),
    }
}

/// Remove an empty directory.
#[instrument]
pub async fn remove_dir(path: &std::path::Path) -> Result<(), Error> {
    throttle::get_ops_token().await;
    tokio::fs::remove_dir(path)
        .await
        .map_err(destination_error(path, Fallback::Write))
}

/// Remove `path` and everything below it. A missing path is not an error.
#[instrument]
pub async fn remove_tree(path: &std::path::Path) -> Result<(), Error> {
    throttle::get_ops_token().await;
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::from_io(Side::Destination, path, err, Fallback::Write)),
    }
}

/// Whether `path` exists. Failures other than "not found" are reported, not folded into `false`.
pub async fn file_exists(path: &std::path::Path) -> Result<bool, Error> {
    match tokio::fs::try_exists(path).await {
        Ok(exists) => Ok(exists),
        Err(err) => Err(Error::from_io(Side::Source, path, err, Fallback::Read)),
    }
}

pub async fn file_size(path: &std::path::Path) -> Result<u64, Error> {
    Ok(stat(path).await?.len)
}

/// Lowercase hex SHA-256 of the file contents.
#[instrument]
pub async fn file_digest(path: &std::path::Path) -> Result<String, Error> {
    hash_file::<sha2::Sha256>(path).await
}

/// Lowercase hex MD5 of the file contents, for comparing against published checksums.
#[instrument]
pub async fn file_md5(path: &std::path::Path) -> Result<String, Error> {
    hash_file::<md5::Md5>(path).await
}

async fn hash_file<D: Digest>(path: &std::path::Path) -> Result<String, Error> {
    let _open_file_guard = throttle::open_file_permit().await;
    throttle::get_ops_token().await;
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(source_error(path, Fallback::Read))?;
    let mut hasher = D::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(source_error(path, Fallback::Read))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Sequential recursive copy of `src` into `dst`.
///
/// Creates `dst` and its subdirectories with the permission bits of their source directory
/// and copies every other entry as a regular file. Stops at the first failure.
#[async_recursion]
pub async fn copy_dir(src: &std::path::Path, dst: &std::path::Path) -> Result<(), Error> {
    let metadata = tokio::fs::metadata(src)
        .await
        .map_err(source_error(src, Fallback::Read))?;
    if !metadata.is_dir() {
        return Err(Error::NotADirectory {
            side: Side::Source,
            path: src.to_path_buf(),
        });
    }
    make_dir(dst, true, metadata.permissions().mode() & 0o7777).await?;
    let mut entries = tokio::fs::read_dir(src)
        .await
        .map_err(source_error(src, Fallback::Read))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(source_error(src, Fallback::Read))?
    {
        let entry_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .await
            .map_err(source_error(&entry_path, Fallback::Read))?;
        if file_type.is_dir() {
            copy_dir(&entry_path, &dst_path).await?;
        } else {
            copy_file(&entry_path, &dst_path).await?;
        }
    }
    Ok(())
}
