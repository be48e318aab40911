//! Console behaviour over an in-memory stream standing in for a serial line.

use std::time::Duration;

use lava_connection::{Connection, ConnectionError, Console, Pattern};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

const SHORT: Duration = Duration::from_millis(100);

fn console() -> (Console, DuplexStream) {
  let (ours, device) = tokio::io::duplex(4096);
  (Console::from_stream("test-console", ours), device)
}

#[tokio::test]
async fn test_expect_returns_match_and_before() {
  let (mut console, mut device) = console();
  device.write_all(b"U-Boot 2020.01\nHit any key to stop autoboot: 3").await.unwrap();

  let cancel = CancellationToken::new();
  let m = console
    .expect(&["Hit any key to stop autoboot".into()], SHORT, &cancel)
    .await
    .expect("prompt should match");

  assert_eq!(m.index, 0);
  assert_eq!(m.before, "U-Boot 2020.01\n");
  assert_eq!(m.matched, "Hit any key to stop autoboot");
}

#[tokio::test]
async fn test_data_split_across_reads() {
  let (mut console, mut device) = console();
  let cancel = CancellationToken::new();

  let writer = tokio::spawn(async move {
    device.write_all(b"login").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    device.write_all(b": ").await.unwrap();
    device
  });

  let m = console
    .expect(&["login:".into()], Duration::from_secs(2), &cancel)
    .await
    .unwrap();
  assert_eq!(m.matched, "login:");
  let _device = writer.await.unwrap();
}

#[tokio::test]
async fn test_timeout_without_sentinel_is_error() {
  let (mut console, _device) = console();
  let cancel = CancellationToken::new();

  let err = console
    .expect(&["root@".into()], SHORT, &cancel)
    .await
    .unwrap_err();
  assert!(matches!(err, ConnectionError::Timeout { .. }));
}

#[tokio::test]
async fn test_timeout_sentinel_matches() {
  let (mut console, mut device) = console();
  device.write_all(b"partial output").await.unwrap();
  let cancel = CancellationToken::new();

  let m = console
    .expect(&["root@".into(), Pattern::Timeout], SHORT, &cancel)
    .await
    .unwrap();
  assert_eq!(m.index, 1);
  assert_eq!(m.before, "partial output");
}

#[tokio::test]
async fn test_eof() {
  let (mut console, device) = console();
  drop(device);
  let cancel = CancellationToken::new();

  let err = console.expect(&["x".into()], SHORT, &cancel).await.unwrap_err();
  assert!(matches!(err, ConnectionError::Eof));

  let m = console
    .expect(&["x".into(), Pattern::Eof], SHORT, &cancel)
    .await
    .unwrap();
  assert_eq!(m.index, 1);
}

#[tokio::test]
async fn test_cancel_interrupts_wait() {
  let (mut console, _device) = console();
  let cancel = CancellationToken::new();

  let trigger = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(20)).await;
    trigger.cancel();
  });

  let err = console
    .expect(&["never".into()], Duration::from_secs(30), &cancel)
    .await
    .unwrap_err();
  assert!(matches!(err, ConnectionError::Cancelled));
}

#[tokio::test]
async fn test_send_line_and_control() {
  let (console, mut device) = console();
  let mut console = console.with_line_separator("\r\n");

  console.send_line("reboot").await.unwrap();
  console.send_control('c').await.unwrap();

  let mut buf = vec![0u8; 9];
  device.read_exact(&mut buf).await.unwrap();
  assert_eq!(&buf, b"reboot\r\n\x03");
}

#[tokio::test]
async fn test_capture_records_consumed_text() {
  let (mut console, mut device) = console();
  let cancel = CancellationToken::new();
  device.write_all(b"boot ok\nlogin: ").await.unwrap();

  console.start_capture();
  console.expect(&["login:".into()], SHORT, &cancel).await.unwrap();
  assert_eq!(console.take_capture(), "boot ok\nlogin:");
  assert_eq!(console.take_capture(), "");
}

#[tokio::test]
async fn test_regex_named_groups() {
  let (mut console, mut device) = console();
  let cancel = CancellationToken::new();
  device.write_all(b"<LAVA_SIGNAL_ENDRUN 0_smoke smoke>\n").await.unwrap();

  let pattern = Pattern::regex(r"<LAVA_SIGNAL_(?P<name>\S+) (?P<params>[^>]+)>").unwrap();
  let m = console.expect(&[pattern], SHORT, &cancel).await.unwrap();
  assert_eq!(m.name("name"), Some("ENDRUN"));
  assert_eq!(m.group(2), Some("0_smoke smoke"));
}

#[tokio::test]
async fn test_long_output_keeps_buffer_bounded() {
  let (console, mut device) = console();
  let mut console = console.with_max_buffer(64 * 1024);
  let cancel = CancellationToken::new();

  let line = "x".repeat(63) + "\n";
  let writer = tokio::spawn(async move {
    for _ in 0..8192 {
      device.write_all(line.as_bytes()).await.unwrap();
    }
    device.write_all(b"<LAVA_SIGNAL_ENDRUN 0_smoke smoke>\n").await.unwrap();
    device
  });

  console.start_capture();
  let pattern = Pattern::regex(r"<LAVA_SIGNAL_(\S+) ([^>]+)>").unwrap();
  let m = console
    .expect(&[pattern], Duration::from_secs(30), &cancel)
    .await
    .unwrap();
  assert_eq!(m.group(1), Some("ENDRUN"));
  // At most the limit plus one read.
  assert!(m.before.len() <= 64 * 1024 + 4096);
  assert!(m.before.ends_with("xxxx\n"));

  // Trimmed text still reaches the capture.
  let capture = console.take_capture();
  assert_eq!(capture.len(), 8192 * 64 + "<LAVA_SIGNAL_ENDRUN 0_smoke smoke>".len());
  let _device = writer.await.unwrap();
}

#[tokio::test]
async fn test_match_split_across_reads_within_window() {
  let (console, mut device) = console();
  let mut console = console.with_search_window(8);
  let cancel = CancellationToken::new();

  let writer = tokio::spawn(async move {
    device.write_all(b"noise <LAVA_").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    device.write_all(b"SIGNAL_STARTRUN 0_a a>").await.unwrap();
    device
  });

  let pattern = Pattern::regex(r"<LAVA_SIGNAL_(\S+) ([^>]+)>").unwrap();
  let m = console
    .expect(&[pattern], Duration::from_secs(2), &cancel)
    .await
    .unwrap();
  assert_eq!(m.before, "noise ");
  assert_eq!(m.group(2), Some("0_a a"));
  let _device = writer.await.unwrap();
}
