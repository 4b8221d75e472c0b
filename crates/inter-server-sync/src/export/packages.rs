//! Copies the files of exported packages into the bundle.

use std::path::Path;

use tracing::{debug, info};

use crate::core::{Schema, SqlValue};
use crate::dump::{fetch_rows, ExportSet};
use crate::error::{Result, SyncError};
use crate::source::RowSource;

/// Package rows read per query while copying files.
pub const PACKAGE_FILE_BATCH: usize = 500;

/// Copy `<data_dir>/<path>` to `<bundle_dir>/<path>` for every exported package.
///
/// Returns the number of files copied.
pub async fn copy_package_files(
    source: &dyn RowSource,
    schema: &Schema,
    export_set: &ExportSet,
    data_dir: &Path,
    bundle_dir: &Path,
) -> Result<usize> {
    let Some(table) = schema.get("rhnpackage") else {
        return Ok(0);
    };
    let keys = export_set.keys("rhnpackage");
    if keys.is_empty() {
        return Ok(0);
    }
    debug!("Total package files to copy: {}", keys.len());

    let mut copied = 0;
    for batch in keys.chunks(PACKAGE_FILE_BATCH) {
        for row in fetch_rows(source, table, batch).await? {
            let SqlValue::Text(path) = row.value("path") else {
                continue;
            };
            let relative = path.trim_start_matches('/');
            let from = data_dir.join(relative);
            let to = bundle_dir.join(relative);
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&from, &to).await.map_err(|e| {
                SyncError::Io(std::io::Error::new(
                    e.kind(),
                    format!("could not copy {}: {}", from.display(), e),
                ))
            })?;
            copied += 1;
        }
        debug!("Copied {} of {} package files", copied, keys.len());
    }

    info!("Copied {} package files", copied);
    Ok(copied)
}
