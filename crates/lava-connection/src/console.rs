//! Console connection over async byte streams.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use lava_config::ConnectionConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::Connection;
use crate::error::ConnectionError;
use crate::pattern::{ExpectMatch, Found, Pattern, describe, earliest_match};

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

const READ_CHUNK: usize = 4096;
/// How far back each search reaches into text that was already searched,
/// so a match split across reads is still found.
const SEARCH_WINDOW: usize = 4096;
/// Unmatched text kept for `before`. Older text is moved to the capture.
const MAX_BUFFER: usize = 1 << 20;

/// A device console: text in, text out.
///
/// Incoming bytes are decoded as UTF-8 (invalid sequences become U+FFFD) and
/// buffered until an `expect` consumes them. Each read only searches the new
/// text plus a window of what came before, and at most the last 1 MiB of
/// unmatched text is kept for [`ExpectMatch::before`].
pub struct Console {
  name: String,
  reader: Reader,
  writer: Writer,
  child: Option<Child>,
  buffer: String,
  pending: Vec<u8>,
  eof: bool,
  line_separator: String,
  character_delay: Duration,
  capture: Option<String>,
  search_window: usize,
  max_buffer: usize,
}

enum ReadEvent {
  Data(std::io::Result<usize>),
  Deadline,
  Cancelled,
}

impl Console {
  /// Wrap a reader/writer pair.
  pub fn new(
    name: impl Into<String>,
    reader: impl AsyncRead + Send + Unpin + 'static,
    writer: impl AsyncWrite + Send + Unpin + 'static,
  ) -> Self {
    Self {
      name: name.into(),
      reader: Box::new(reader),
      writer: Box::new(writer),
      child: None,
      buffer: String::new(),
      pending: Vec::new(),
      eof: false,
      line_separator: "\n".to_string(),
      character_delay: Duration::ZERO,
      capture: None,
      search_window: SEARCH_WINDOW,
      max_buffer: MAX_BUFFER,
    }
  }

  /// Wrap a single bidirectional stream, e.g. one end of `tokio::io::duplex`.
  pub fn from_stream(
    name: impl Into<String>,
    stream: impl AsyncRead + AsyncWrite + Send + 'static,
  ) -> Self {
    let (reader, writer) = tokio::io::split(stream);
    Self::new(name, reader, writer)
  }

  /// Run `command` through `sh -c` and use its stdio as the console.
  pub fn spawn(name: impl Into<String>, command: &str) -> Result<Self, ConnectionError> {
    let name = name.into();
    let mut child = Command::new("sh")
      .arg("-c")
      .arg(command)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::null())
      .kill_on_drop(true)
      .spawn()
      .map_err(|source| ConnectionError::Spawn {
        command: command.to_string(),
        source,
      })?;

    let (Some(stdout), Some(stdin)) = (child.stdout.take(), child.stdin.take()) else {
      return Err(ConnectionError::Spawn {
        command: command.to_string(),
        source: std::io::Error::other("console stdio not captured"),
      });
    };

    info!(connection = %name, command = %command, "console spawned");

    let mut console = Self::new(name, stdout, stdin);
    console.child = Some(child);
    Ok(console)
  }

  /// Spawn the console described by a device's connection settings.
  pub fn from_config(
    name: impl Into<String>,
    config: &ConnectionConfig,
  ) -> Result<Self, ConnectionError> {
    let Some(command) = config.command.as_deref() else {
      return Err(ConnectionError::Spawn {
        command: String::new(),
        source: std::io::Error::new(
          std::io::ErrorKind::NotFound,
          "device has no connection command",
        ),
      });
    };
    Ok(
      Self::spawn(name, command)?
        .with_line_separator(&config.line_separator)
        .with_character_delay(Duration::from_millis(config.character_delay_ms)),
    )
  }

  pub fn with_line_separator(mut self, separator: &str) -> Self {
    self.line_separator = separator.to_string();
    self
  }

  pub fn with_character_delay(mut self, delay: Duration) -> Self {
    self.character_delay = delay;
    self
  }

  /// Bytes of already searched text each search looks back over. Matches
  /// longer than this may be missed when they arrive in pieces.
  pub fn with_search_window(mut self, bytes: usize) -> Self {
    self.search_window = bytes;
    self
  }

  /// Most unmatched text kept in memory.
  pub fn with_max_buffer(mut self, bytes: usize) -> Self {
    self.max_buffer = bytes;
    self
  }

  async fn write(&mut self, text: &str) -> Result<(), ConnectionError> {
    if self.character_delay.is_zero() {
      self.writer.write_all(text.as_bytes()).await?;
    } else {
      let mut buf = [0u8; 4];
      for c in text.chars() {
        self.writer.write_all(c.encode_utf8(&mut buf).as_bytes()).await?;
        self.writer.flush().await?;
        tokio::time::sleep(self.character_delay).await;
      }
    }
    self.writer.flush().await?;
    Ok(())
  }

  fn consume(&mut self, index: usize, found: Found) -> ExpectMatch {
    let before = self.buffer[..found.start].to_string();
    let matched = self.buffer[found.start..found.end].to_string();
    let consumed: String = self.buffer.drain(..found.end).collect();
    self.record(&consumed);
    ExpectMatch {
      index,
      before,
      matched,
      groups: found.groups,
      named: found.named,
    }
  }

  fn record(&mut self, text: &str) {
    if let Some(capture) = self.capture.as_mut() {
      capture.push_str(text);
    }
  }

  fn take_buffer(&mut self) -> String {
    let before = std::mem::take(&mut self.buffer);
    self.record(&before);
    before
  }

  /// Drop the oldest unmatched text beyond the limit, keeping at least
  /// `keep` bytes. Returns how many bytes were dropped.
  fn trim(&mut self, keep: usize) -> usize {
    if self.buffer.len() <= self.max_buffer.max(keep) {
      return 0;
    }
    let cut = floor_char_boundary(&self.buffer, self.buffer.len() - self.max_buffer.max(keep));
    let dropped: String = self.buffer.drain(..cut).collect();
    self.record(&dropped);
    debug!(connection = %self.name, bytes = cut, "console buffer trimmed");
    cut
  }

  fn push_bytes(&mut self, bytes: &[u8]) {
    self.pending.extend_from_slice(bytes);
    let text = decode_utf8(&mut self.pending);
    trace!(connection = %self.name, data = %text.escape_debug(), "console received");
    self.buffer.push_str(&text);
  }
}

/// Decode as much of `pending` as possible, keeping an incomplete trailing
/// multi-byte sequence for the next read.
fn decode_utf8(pending: &mut Vec<u8>) -> String {
  let mut out = String::new();
  loop {
    match std::str::from_utf8(pending) {
      Ok(text) => {
        out.push_str(text);
        pending.clear();
        return out;
      }
      Err(e) => {
        let valid = e.valid_up_to();
        out.push_str(&String::from_utf8_lossy(&pending[..valid]));
        match e.error_len() {
          Some(len) => {
            out.push(char::REPLACEMENT_CHARACTER);
            pending.drain(..valid + len);
          }
          None => {
            pending.drain(..valid);
            return out;
          }
        }
      }
    }
  }
}

/// Largest char boundary of `text` at or below `index`.
fn floor_char_boundary(text: &str, index: usize) -> usize {
  let mut index = index.min(text.len());
  while !text.is_char_boundary(index) {
    index -= 1;
  }
  index
}

/// Byte for a control character: letters map to 1..=26, `[` to ESC.
fn control_byte(c: char) -> Option<u8> {
  match c.to_ascii_lowercase() {
    l @ 'a'..='z' => Some(l as u8 - b'a' + 1),
    '@' => Some(0),
    '[' => Some(27),
    '\\' => Some(28),
    ']' => Some(29),
    '^' => Some(30),
    '_' => Some(31),
    '?' => Some(127),
    _ => None,
  }
}

#[async_trait]
impl Connection for Console {
  fn name(&self) -> &str {
    &self.name
  }

  async fn send(&mut self, text: &str) -> Result<(), ConnectionError> {
    debug!(connection = %self.name, data = %text.escape_debug(), "console send");
    self.write(text).await
  }

  async fn send_line(&mut self, line: &str) -> Result<(), ConnectionError> {
    debug!(connection = %self.name, line = %line, "console send_line");
    let text = format!("{line}{}", self.line_separator);
    self.write(&text).await
  }

  async fn send_control(&mut self, c: char) -> Result<(), ConnectionError> {
    let byte = control_byte(c).ok_or_else(|| {
      ConnectionError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("'{c}' has no control character"),
      ))
    })?;
    debug!(connection = %self.name, control = %c, "console send_control");
    self.writer.write_all(&[byte]).await?;
    self.writer.flush().await?;
    Ok(())
  }

  async fn expect(
    &mut self,
    patterns: &[Pattern],
    timeout: Duration,
    cancel: &CancellationToken,
  ) -> Result<ExpectMatch, ConnectionError> {
    let deadline = Instant::now() + timeout;
    let mut chunk = [0u8; READ_CHUNK];
    let window = patterns
      .iter()
      .map(Pattern::literal_len)
      .fold(self.search_window, usize::max);
    // Everything before this offset has been searched with these patterns.
    let mut searched: usize = 0;

    loop {
      let from = floor_char_boundary(&self.buffer, searched.saturating_sub(window));
      if let Some((index, found)) = earliest_match(patterns, &self.buffer, from) {
        debug!(connection = %self.name, pattern = %patterns[index], "console matched");
        return Ok(self.consume(index, found));
      }
      searched = self.buffer.len();
      searched -= self.trim(window);

      if self.eof {
        let before = self.take_buffer();
        return match patterns.iter().position(Pattern::is_eof) {
          Some(index) => Ok(ExpectMatch::sentinel(index, before)),
          None => Err(ConnectionError::Eof),
        };
      }

      let event = tokio::select! {
        biased;
        _ = cancel.cancelled() => ReadEvent::Cancelled,
        _ = tokio::time::sleep_until(deadline) => ReadEvent::Deadline,
        read = self.reader.read(&mut chunk) => ReadEvent::Data(read),
      };

      match event {
        ReadEvent::Cancelled => {
          warn!(connection = %self.name, "expect cancelled");
          return Err(ConnectionError::Cancelled);
        }
        ReadEvent::Deadline => {
          let expected = describe(patterns);
          return match patterns.iter().position(Pattern::is_timeout) {
            Some(index) => Ok(ExpectMatch::sentinel(index, self.take_buffer())),
            None => Err(ConnectionError::Timeout { timeout, expected }),
          };
        }
        ReadEvent::Data(Ok(0)) => {
          debug!(connection = %self.name, "console reached end of stream");
          self.eof = true;
        }
        ReadEvent::Data(Ok(n)) => self.push_bytes(&chunk[..n]),
        ReadEvent::Data(Err(e)) => return Err(ConnectionError::Io(e)),
      }
    }
  }

  fn start_capture(&mut self) {
    self.capture = Some(String::new());
  }

  fn take_capture(&mut self) -> String {
    self.capture.take().unwrap_or_default()
  }

  async fn close(&mut self) -> Result<(), ConnectionError> {
    let _ = self.writer.shutdown().await;
    if let Some(mut child) = self.child.take() {
      info!(connection = %self.name, "terminating console process");
      child.kill().await?;
    }
    Ok(())
  }
}
