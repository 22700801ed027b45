//! Retention enforcement.
//!
//! Prunes a sink listing under a prefix down to the newest `keep` entries.
//! Individual delete failures are logged per key and skipped; the first one
//! is reported back for signalling.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::BackupError;
use crate::storage::Storage;

/// Returns how many artifacts were deleted together with the first error
/// encountered, if any. A listing failure deletes nothing.
pub async fn enforce(
    store: &Arc<dyn Storage>,
    prefix: &str,
    keep: usize,
) -> (usize, Option<BackupError>) {
    let mut files = match store.list(prefix).await {
        Ok(files) => files,
        Err(err) => return (0, Some(err)),
    };

    if files.len() <= keep {
        return (0, None);
    }

    // Newest first; everything past the first `keep` entries goes.
    files.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));

    let mut deleted = 0;
    let mut first_error = None;
    for file in &files[keep..] {
        match store.delete(&file.key).await {
            Ok(()) => {
                deleted += 1;
                info!(key = %file.key, age = %file.last_modified, "deleted old backup");
            }
            Err(err) => {
                warn!(key = %file.key, error = %err, "failed to delete old backup");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }

    (deleted, first_error)
}
