mod common;

use common::fake_engine;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use wrestic::ResticError;
use wrestic::restic::command::{Command, CommandOptions, Sink};

fn command(engine: &std::path::Path, args: &[&str]) -> CommandOptions {
    CommandOptions::new(
        "test",
        engine,
        args.iter().map(|a| a.to_string()).collect(),
    )
}

#[tokio::test]
async fn test_exit_codes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fake_engine(dir.path(), "engine", "exit \"$1\"");

    let ok = Command::new(command(&engine, &["0"]), CancellationToken::new())
        .run()
        .await
        .unwrap();
    assert_eq!(ok.code, Some(0));

    let partial = Command::new(command(&engine, &["3"]), CancellationToken::new())
        .run()
        .await
        .unwrap();
    assert_eq!(partial.code, Some(3));

    let failed = Command::new(command(&engine, &["1"]), CancellationToken::new())
        .run()
        .await
        .unwrap_err();
    assert!(matches!(failed, ResticError::Execution { code: 1, .. }));
}

#[tokio::test]
async fn test_missing_binary() {
    let dir = tempfile::tempdir().unwrap();
    let err = Command::new(
        command(&dir.path().join("missing"), &[]),
        CancellationToken::new(),
    )
    .run()
    .await
    .unwrap_err();
    assert!(matches!(err, ResticError::Startup { .. }));
}

#[tokio::test]
async fn test_stdin_is_forwarded() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fake_engine(dir.path(), "engine", "cat");
    let input: &'static [u8] = b"line one\nline two\n";

    let options = command(&engine, &[])
        .stdin(Box::new(input))
        .stdout(Sink::Capture);
    let mut running = Command::new(options, CancellationToken::new())
        .start()
        .unwrap();
    running.input_done().await.unwrap();
    let output = running.wait().await.unwrap();
    assert_eq!(output.stdout, input);
}

#[tokio::test]
async fn test_both_streams_are_drained() {
    let dir = tempfile::tempdir().unwrap();
    // more than a pipe buffer on each stream
    let engine = fake_engine(
        dir.path(),
        "engine",
        r#"i=0
while [ $i -lt 5000 ]; do
  echo "out $i ................................"
  echo "err $i ................................" >&2
  i=$((i+1))
done"#,
    );

    let out = Arc::new(Mutex::new(0usize));
    let err = Arc::new(Mutex::new(0usize));
    let (o, e) = (out.clone(), err.clone());
    let options = command(&engine, &[])
        .stdout(Sink::lines(move |_: &str| *o.lock().unwrap() += 1))
        .stderr(Sink::lines(move |_: &str| *e.lock().unwrap() += 1));
    Command::new(options, CancellationToken::new())
        .run()
        .await
        .unwrap();

    assert_eq!(*out.lock().unwrap(), 5000);
    assert_eq!(*err.lock().unwrap(), 5000);
}

#[tokio::test]
async fn test_cancel_kills_process() {
    let dir = tempfile::tempdir().unwrap();
    let engine = fake_engine(dir.path(), "engine", "sleep 30");
    let cancel = CancellationToken::new();

    let running = Command::new(command(&engine, &[]), cancel.clone())
        .start()
        .unwrap();
    cancel.cancel();
    let err = running.wait().await.unwrap_err();
    assert!(matches!(err, ResticError::Cancelled { .. }));
}
