//! Payload loading with bounded retry
//!
//! Reading a file that another part of the host is still writing (a save
//! being flushed, a mod archive being repacked) can fail transiently, so
//! reads are retried a fixed number of times with a fixed delay. A missing
//! file is a hard failure with no retry. This is the only place in the
//! subsystem that is allowed to block, and the retry bound keeps the worst
//! case at about a second.

use log::warn;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Extra attempts after the first failed read.
const MAX_RETRIES: u32 = 4;
const RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("file too large: {} is {} bytes (limit {})", .path.display(), .size, .limit)]
    TooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("failed to read {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Reads the whole payload into memory, retrying transient failures.
pub fn load_payload(path: &Path, max_size: u64) -> Result<Vec<u8>, LoadError> {
    let metadata = match path.metadata() {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(LoadError::NotFound(path.to_path_buf()));
        }
        Err(e) => {
            return Err(LoadError::Io {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };

    if metadata.len() > max_size {
        return Err(LoadError::TooLarge {
            path: path.to_path_buf(),
            size: metadata.len(),
            limit: max_size,
        });
    }

    let mut attempt = 0;
    loop {
        match std::fs::read(path) {
            Ok(data) => return Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // vanished between the metadata check and the read
                return Err(LoadError::NotFound(path.to_path_buf()));
            }
            Err(e) if attempt < MAX_RETRIES => {
                attempt += 1;
                warn!(
                    "failed to read {} ({}), retry {}/{} in {:?}",
                    path.display(),
                    e,
                    attempt,
                    MAX_RETRIES,
                    RETRY_DELAY
                );
                thread::sleep(RETRY_DELAY);
            }
            Err(e) => {
                return Err(LoadError::Io {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        }
    }
}
