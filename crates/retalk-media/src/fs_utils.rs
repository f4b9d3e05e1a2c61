//! Filesystem helpers for placing inputs into a workspace.
//!
//! Moves fall back to copy-and-delete when source and destination live on
//! different filesystems (EXDEV).

use std::path::Path;
use tokio::fs;

use crate::error::{MediaError, MediaResult};

/// Move a file from `src` to `dst`, handling cross-device moves.
///
/// A rename is tried first. On EXDEV the file is copied next to `dst` under a
/// temporary name, renamed into place, and the source is removed.
pub async fn move_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> MediaResult<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();

    if !src.exists() {
        return Err(MediaError::FileNotFound(src.to_path_buf()));
    }
    ensure_parent(dst).await?;

    match fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device_error(&e) => {
            tracing::debug!(
                "Cross-device rename, falling back to copy+delete: {} -> {}",
                src.display(),
                dst.display()
            );
            copy_via_temp(src, dst).await?;
            if let Err(e) = fs::remove_file(src).await {
                tracing::warn!(
                    "Moved {} but could not remove the source: {}",
                    src.display(),
                    e
                );
            }
            Ok(())
        }
        Err(e) => Err(MediaError::workspace(dst, e)),
    }
}

/// Copy `src` to `dst`, leaving the source in place.
pub async fn copy_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> MediaResult<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();

    if !src.exists() {
        return Err(MediaError::FileNotFound(src.to_path_buf()));
    }
    ensure_parent(dst).await?;
    copy_via_temp(src, dst).await
}

async fn ensure_parent(path: &Path) -> MediaResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| MediaError::workspace(parent, e))?;
        }
    }
    Ok(())
}

/// EXDEV is 18 on Linux and macOS.
fn is_cross_device_error(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(18)
}

/// Copy to a sibling temp file, then rename so `dst` never appears half-written.
async fn copy_via_temp(src: &Path, dst: &Path) -> MediaResult<()> {
    let mut tmp_name = dst.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".partial");
    let tmp_dst = dst.with_file_name(tmp_name);

    if let Err(e) = fs::copy(src, &tmp_dst).await {
        let _ = fs::remove_file(&tmp_dst).await;
        return Err(MediaError::workspace(&tmp_dst, e));
    }

    if let Err(e) = fs::rename(&tmp_dst, dst).await {
        let _ = fs::remove_file(&tmp_dst).await;
        return Err(MediaError::workspace(dst, e));
    }

    Ok(())
}
