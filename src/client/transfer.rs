use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::sftp_channel::SftpChannel;
use crate::utils::error::{Result, SftpError};

/// Transfer chunk size in both directions, keeps memory bounded on large
/// files.
pub(crate) const CHUNK_SIZE: usize = 8192;

/// Streams an already opened local file to a remote path. The remote
/// handle is released on every path out.
pub(crate) async fn copy_file_to_remote<S>(
    channel: &mut SftpChannel<S>,
    source: &mut File,
    local_path: &Path,
    remote_path: &str,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let handle = channel.open_write(remote_path).await?;

    let mut offset = 0u64;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let result = loop {
        let bytes = match source.read(&mut buffer).await {
            Ok(0) => break Ok(()),
            Ok(bytes) => bytes,
            Err(err) => {
                break Err(SftpError::LocalIo { path: local_path.display().to_string(), source: err });
            }
        };
        if let Err(err) = channel.write(&handle, offset, &buffer[..bytes]).await {
            break Err(err);
        }
        offset += bytes as u64;
    };

    match result {
        Ok(()) => {
            channel.close(&handle).await?;
            Ok(offset)
        }
        Err(err) => {
            if let Err(close_err) = channel.close(&handle).await {
                tracing::debug!("releasing remote handle failed: {}", close_err);
            }
            Err(err)
        }
    }
}

/// Streams a remote file to a local path. The remote file is opened first
/// so a missing remote path never creates or truncates the destination.
pub(crate) async fn copy_remote_to_local<S>(
    channel: &mut SftpChannel<S>,
    remote_path: &str,
    local_path: &Path,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let handle = channel.open_read(remote_path).await?;

    let target = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(local_path)
        .await
        .map_err(|err| SftpError::LocalIo { path: local_path.display().to_string(), source: err });
    let mut target = match target {
        Ok(target) => target,
        Err(err) => {
            if let Err(close_err) = channel.close(&handle).await {
                tracing::debug!("releasing remote handle failed: {}", close_err);
            }
            return Err(err);
        }
    };

    pump_to_local(channel, &handle, &mut target, local_path, 0).await
}

/// Continues an interrupted download. The remote size is read first and
/// the copy restarts at the byte count already present locally; a
/// destination that is already complete transfers nothing. A missing
/// destination downloads from the start.
pub(crate) async fn resume_remote_to_local<S>(
    channel: &mut SftpChannel<S>,
    remote_path: &str,
    local_path: &Path,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let attrs = channel.stat(remote_path).await?;
    let remote_size = attrs.size.unwrap_or(0);
    let local_size = match tokio::fs::metadata(local_path).await {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
        Err(err) => return Err(SftpError::LocalIo { path: local_path.display().to_string(), source: err }),
    };
    if local_size >= remote_size {
        return Ok(0);
    }

    let handle = channel.open_read(remote_path).await?;

    let target = OpenOptions::new()
        .create(true)
        .append(true)
        .open(local_path)
        .await
        .map_err(|err| SftpError::LocalIo { path: local_path.display().to_string(), source: err });
    let mut target = match target {
        Ok(target) => target,
        Err(err) => {
            if let Err(close_err) = channel.close(&handle).await {
                tracing::debug!("releasing remote handle failed: {}", close_err);
            }
            return Err(err);
        }
    };

    pump_to_local(channel, &handle, &mut target, local_path, local_size).await
}

/// Drains the remote handle into the local file starting at `start`,
/// then flushes and releases the handle on every path out. Returns the
/// byte count copied by this call.
async fn pump_to_local<S>(
    channel: &mut SftpChannel<S>,
    handle: &[u8],
    target: &mut File,
    local_path: &Path,
    start: u64,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut offset = start;
    let result = loop {
        match channel.read(handle, offset, CHUNK_SIZE as u32).await {
            Ok(Some(chunk)) => {
                if let Err(err) = target.write_all(&chunk).await {
                    break Err(SftpError::LocalIo { path: local_path.display().to_string(), source: err });
                }
                offset += chunk.len() as u64;
            }
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        }
    };

    let flushed = target
        .flush()
        .await
        .map_err(|err| SftpError::LocalIo { path: local_path.display().to_string(), source: err });
    let closed = channel.close(handle).await;

    result?;
    flushed?;
    closed?;
    Ok(offset - start)
}
