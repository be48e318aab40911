use std::io::SeekFrom;
use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::BundleError;

/// Complete lines read from a log, and where the next read starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
  pub text: String,
  pub next_offset: u64,
}

/// Follows a log file that is still being written.
///
/// Reads only ever return whole lines, so a line half written when read
/// is returned by the next call instead.
#[derive(Debug, Clone)]
pub struct LogTail {
  path: PathBuf,
}

impl LogTail {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  /// Everything after `offset` up to the last complete line. An offset
  /// past the end of the file reads nothing.
  pub async fn read_from(&self, offset: u64) -> Result<LogChunk, BundleError> {
    let mut file = File::open(&self.path).await.map_err(|e| {
      if e.kind() == std::io::ErrorKind::NotFound {
        BundleError::NotFound(self.path.display().to_string())
      } else {
        BundleError::Io(e)
      }
    })?;
    let len = file.metadata().await?.len();
    if offset >= len {
      return Ok(LogChunk {
        text: String::new(),
        next_offset: offset.min(len),
      });
    }

    file.seek(SeekFrom::Start(offset)).await?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).await?;
    let complete = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    bytes.truncate(complete);

    Ok(LogChunk {
      next_offset: offset + complete as u64,
      text: String::from_utf8_lossy(&bytes).into_owned(),
    })
  }
}
