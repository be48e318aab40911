//! The test-shell loop against a scripted target on an in-memory console.

use std::time::Duration;

use lava_connection::Console;
use lava_pipeline::{Context, LavaError, ResultValue};
use lava_signals::{DirectorState, SessionOutcome, SignalDirector, TestShellSession, ack_command};
use lava_testdef::{PatternFixup, TestDefinition, TestSource, run_script};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

fn console() -> (Console, DuplexStream) {
  let (ours, target) = tokio::io::duplex(8192);
  (Console::from_stream("target", ours), target)
}

fn testdef(index: usize, name: &str) -> TestDefinition {
  TestDefinition::new(
    index,
    name,
    TestSource::Inline,
    json!({"metadata": {"name": name}, "run": {"steps": ["./run-tests.sh"]}}),
  )
}

/// Signal markers a run.sh prints, in order.
fn markers(testdef: &TestDefinition) -> Vec<String> {
  let target_dir = format!("/lava/tests/{}", testdef.run_id);
  run_script(&testdef.document, &testdef.run_id, &testdef.name, &target_dir, None)
    .lines()
    .filter_map(|line| line.strip_prefix("echo \"<LAVA_SIGNAL_"))
    .map(|rest| format!("<LAVA_SIGNAL_{}", rest.trim_end_matches('"')))
    .collect()
}

/// Print a marker and block until the dispatcher acknowledges it, the way
/// `read < /lava_ack.fifo` does on the target.
async fn signal(target: &mut DuplexStream, marker: &str) {
  target.write_all(format!("{marker}\n").as_bytes()).await.unwrap();
  let ack = format!("{}\n", ack_command());
  let mut seen = Vec::new();
  let mut buf = [0u8; 256];
  while !String::from_utf8_lossy(&seen).contains(&ack) {
    let n = target.read(&mut buf).await.unwrap();
    assert!(n > 0, "console closed before the ACK");
    seen.extend_from_slice(&buf[..n]);
  }
}

#[tokio::test]
async fn test_run_script_markers_round_trip() {
  let defs = [testdef(0, "smoke"), testdef(1, "net")];
  let (mut console, mut target) = console();

  let scripted = defs.iter().map(markers).collect::<Vec<_>>();
  assert_eq!(
    scripted[0],
    vec!["<LAVA_SIGNAL_STARTRUN 0_smoke smoke>", "<LAVA_SIGNAL_ENDRUN 0_smoke smoke>"]
  );

  let device = tokio::spawn(async move {
    signal(&mut target, &scripted[0][0]).await;
    target.write_all(b"uname : pass\n").await.unwrap();
    signal(&mut target, "<LAVA_SIGNAL_TESTCASE TEST_CASE_ID=boot RESULT=pass>").await;
    target.write_all(b"disk-space : fail\n").await.unwrap();
    signal(&mut target, &scripted[0][1]).await;

    signal(&mut target, &scripted[1][0]).await;
    target.write_all(b"ping : pass\n").await.unwrap();
    signal(&mut target, &scripted[1][1]).await;
    target.write_all(b"<LAVA_TEST_RUNNER>: exiting\n").await.unwrap();
    target
  });

  let mut session = defs.iter().fold(
    TestShellSession::new(SignalDirector::new(defs.len())),
    |session, def| session.with_fixup(def.run_id.clone(), def.pattern()),
  );
  let mut ctx = Context::new();
  let outcome = session
    .run(&mut console, &mut ctx, Duration::from_secs(5), &CancellationToken::new())
    .await
    .unwrap();
  let _target = device.await.unwrap();

  assert_eq!(outcome, SessionOutcome::Completed);
  assert_eq!(session.acks(), 5);
  assert_eq!(session.director().state(), &DirectorState::Done);
  assert_eq!(session.director().finished_runs(), ["0_smoke", "1_net"]);

  let results: Vec<_> = ctx
    .results()
    .iter()
    .map(|r| (r.suite.as_str(), r.test_case_id.as_str(), r.result))
    .collect();
  assert_eq!(
    results,
    vec![
      ("0_smoke", "boot", ResultValue::Pass),
      ("0_smoke", "uname", ResultValue::Pass),
      ("0_smoke", "disk-space", ResultValue::Fail),
      ("1_net", "ping", ResultValue::Pass),
    ]
  );
}

#[tokio::test]
async fn test_connection_lost_mid_run() {
  let (mut console, mut target) = console();
  let device = tokio::spawn(async move {
    signal(&mut target, "<LAVA_SIGNAL_STARTRUN 0_smoke smoke>").await;
    target.write_all(b"Kernel panic - not syncing\n").await.unwrap();
    drop(target);
  });

  let mut session = TestShellSession::new(SignalDirector::new(1));
  let mut ctx = Context::new();
  let outcome = session
    .run(&mut console, &mut ctx, Duration::from_secs(5), &CancellationToken::new())
    .await
    .unwrap();
  device.await.unwrap();

  assert_eq!(outcome, SessionOutcome::ConnectionLost);
  assert_eq!(session.acks(), 1);
  assert_eq!(session.director().current_run(), Some("0_smoke"));
}

#[tokio::test]
async fn test_silent_target_times_out() {
  let (mut console, _target) = console();
  let mut session = TestShellSession::new(SignalDirector::new(1));
  let mut ctx = Context::new();
  let outcome = session
    .run(&mut console, &mut ctx, Duration::from_millis(100), &CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(outcome, SessionOutcome::TimedOut);
  assert_eq!(session.acks(), 0);
}

#[tokio::test]
async fn test_cancel_interrupts_session() {
  let (mut console, _target) = console();
  let cancel = CancellationToken::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(20)).await;
    trigger.cancel();
  });

  let mut session = TestShellSession::new(SignalDirector::new(1));
  let mut ctx = Context::new();
  let err = session
    .run(&mut console, &mut ctx, Duration::from_secs(5), &cancel)
    .await
    .unwrap_err();
  assert!(matches!(err, LavaError::Cancelled));
}

#[tokio::test]
async fn test_custom_pattern_fixup() {
  let (mut console, mut target) = console();
  let device = tokio::spawn(async move {
    signal(&mut target, "<LAVA_SIGNAL_STARTRUN 0_ltp ltp>").await;
    target.write_all(b"mmap01 PASS\nmmap02 BROK\n").await.unwrap();
    signal(&mut target, "<LAVA_SIGNAL_ENDRUN 0_ltp ltp>").await;
    target.write_all(b"<LAVA_TEST_RUNNER>: exiting\n").await.unwrap();
    target
  });

  let fixup = PatternFixup::with_pattern(
    "0_ltp",
    r"^(?P<test_case_id>\S+) (?P<result>PASS|BROK)$",
    [("BROK".to_string(), "fail".to_string())].into_iter().collect(),
  );
  let mut session = TestShellSession::new(SignalDirector::new(1)).with_fixup("0_ltp", fixup);
  let mut ctx = Context::new();
  let outcome = session
    .run(&mut console, &mut ctx, Duration::from_secs(5), &CancellationToken::new())
    .await
    .unwrap();
  let _target = device.await.unwrap();

  assert_eq!(outcome, SessionOutcome::Completed);
  let results: Vec<_> = ctx.results().iter().map(|r| (r.test_case_id.as_str(), r.result)).collect();
  assert_eq!(results, vec![("mmap01", ResultValue::Pass), ("mmap02", ResultValue::Fail)]);
}
