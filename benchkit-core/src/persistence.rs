//! Config files of a model directory.
//!
//! A server may mount the directory while it is being rewritten, so each file is
//! staged in a temporary file next to it and renamed over the old one.

use crate::error::Result;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Write `data` as pretty JSON to `dir/file_name`, replacing any previous file.
pub fn save_model_json<T: serde::Serialize + ?Sized>(
    dir: &Path,
    file_name: &str,
    data: &T,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let target = dir.join(file_name);

    let mut staged = tempfile::Builder::new()
        .prefix(&format!(".{file_name}"))
        .suffix(".tmp")
        .tempfile_in(dir)?;
    serde_json::to_writer_pretty(staged.as_file_mut(), data)?;
    staged.write_all(b"\n")?;
    staged.as_file().sync_all()?;
    staged.persist(&target).map_err(|e| e.error)?;

    trace!(path = %target.display(), "Saved model config file");
    Ok(target)
}
