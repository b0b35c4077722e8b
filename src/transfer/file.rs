//! File Access & Error Mapping
//!
//! The only place where OS-level I/O errors are translated into transfer
//! error codes.

use std::io::{self, SeekFrom};
use std::path::Path;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncSeekExt;
use tracing::{error, warn};

use super::context::TransferContext;
use crate::model::{TransferError, TransferErrorCode};

/// Translate an I/O error into the transfer error taxonomy.
pub fn map_io_error(err: &io::Error) -> TransferError {
    match err.kind() {
        io::ErrorKind::NotFound => {
            TransferError::new(TransferErrorCode::FileNotFound, "file does not exist")
        }
        io::ErrorKind::PermissionDenied => {
            TransferError::new(TransferErrorCode::Forbidden, "permission to open file denied")
        }
        _ => TransferError::new(
            TransferErrorCode::Unknown,
            format!("unknown file error: {}", err),
        ),
    }
}

/// Open the transfer's local file, positioned at its current progress.
///
/// Send transfers open the source read-only and record its size. Receive
/// transfers create missing parent directories and open the destination
/// read-write without truncating a partial file left by a previous attempt.
pub async fn open_transfer_file(ctx: &mut TransferContext) -> Result<File, TransferError> {
    let transfer = &mut ctx.transfer;
    let path = transfer.local_path.clone();

    let mut file = if ctx.rule.is_send {
        let file = File::open(&path).await.map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to open source file");
            map_io_error(&e)
        })?;
        let metadata = file.metadata().await.map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to retrieve the file's info");
            map_io_error(&e)
        })?;
        transfer.filesize = i64::try_from(metadata.len()).unwrap_or(i64::MAX);
        file
    } else {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                error!(dir = %parent.display(), error = %e, "Failed to create directory");
                map_io_error(&e)
            })?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to create destination file");
                map_io_error(&e)
            })?
    };

    if transfer.progress != 0 {
        file.seek(SeekFrom::Start(transfer.progress))
            .await
            .map_err(|e| {
                error!(offset = transfer.progress, error = %e, "Failed to seek inside file");
                map_io_error(&e)
            })?;
    }

    Ok(file)
}

/// Move a completed file to its final destination.
///
/// Falls back to copy-then-delete when a rename is impossible, e.g. across
/// filesystems.
pub async fn move_file(from: &Path, to: &Path) -> Result<(), TransferError> {
    let finalization = |action: &str, e: io::Error| {
        error!(from = %from.display(), to = %to.display(), error = %e, "Failed to {}", action);
        TransferError::new(
            TransferErrorCode::Finalization,
            format!("failed to {}: {}", action, e),
        )
    };

    if let Some(parent) = to.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| finalization("create destination directory", e))?;
    }

    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }

    fs::copy(from, to)
        .await
        .map_err(|e| finalization("move temp file", e))?;
    fs::remove_file(from)
        .await
        .map_err(|e| finalization("remove temp file", e))?;
    Ok(())
}

/// Delete a partially received file. Failures are only logged.
pub async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete partial file"),
    }
}
