//! End-to-end pipeline tests against real external commands.
//!
//! These exercise the whole engine (spawn, channel wiring, backpressure,
//! limits, timeouts, stderr capture, stop) with ordinary PATH binaries
//! (`cat`, `sh`, `ls`, `sort`, `tr`, `seq`, `head`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use spindle::{FnStage, Pipeline, PipelineError, PipelineState, ProcessStage, Stage};

/// A process that writes forever, slowly enough to not flood memory.
fn endless_ticker() -> ProcessStage {
    ProcessStage::new("sh -c 'while true; do echo tick; sleep 0.01; done'")
        .expect("ticker command parses")
}

// ============================================================================
// Identity and Chaining
// ============================================================================

#[tokio::test]
async fn single_cat_echoes_message() {
    let pipeline = Pipeline::new().stage(ProcessStage::new("cat").unwrap());
    let out = pipeline.read_text(Some("sunflower")).await.unwrap();
    assert_eq!(out, "sunflower");
}

#[tokio::test]
async fn forwarding_chain_is_transparent() {
    // cat | cat | cat: output is exactly the final stage's bytes,
    // regardless of chain length.
    let pipeline = Pipeline::new()
        .stage(ProcessStage::new("cat").unwrap())
        .stage(ProcessStage::new("cat").unwrap())
        .stage(ProcessStage::new("cat").unwrap());
    let out = pipeline.run(Some(b"one\ntwo\nthree\n".to_vec())).await.unwrap();
    assert_eq!(out, b"one\ntwo\nthree\n");
}

#[tokio::test]
async fn two_stage_sort() {
    let pipeline = Pipeline::new()
        .stage(ProcessStage::new("cat").unwrap())
        .stage(ProcessStage::new("sort").unwrap());
    let out = pipeline
        .read_text(Some("cherry\napple\nbanana"))
        .await
        .unwrap();
    assert_eq!(out, "apple\nbanana\ncherry");
}

#[tokio::test]
async fn tr_transforms_piped_text() {
    let pipeline = Pipeline::new()
        .stage(ProcessStage::new("cat").unwrap())
        .stage(ProcessStage::new("tr a-z A-Z").unwrap());
    let out = pipeline.read_text(Some("shout")).await.unwrap();
    assert_eq!(out, "SHOUT");
}

#[tokio::test]
async fn function_stage_composes_with_processes() {
    let pipeline = Pipeline::new()
        .stage(ProcessStage::new("sh -c 'printf hello'").unwrap())
        .stage(FnStage::new(|bytes: Vec<u8>| bytes.to_ascii_uppercase()))
        .stage(ProcessStage::new("cat").unwrap());
    let out = pipeline.read_text(None).await.unwrap();
    assert_eq!(out, "HELLO");
}

// ============================================================================
// Text Contract
// ============================================================================

#[tokio::test]
async fn read_text_strips_single_trailing_newline() {
    // echo appends one newline; read_text removes exactly one.
    let pipeline = Pipeline::new().stage(ProcessStage::new("echo hello").unwrap());
    assert_eq!(pipeline.read_text(None).await.unwrap(), "hello");

    let double = Pipeline::new()
        .stage(ProcessStage::new(r#"sh -c 'printf "a\n\n"'"#).unwrap());
    assert_eq!(double.read_text(None).await.unwrap(), "a\n");
}

#[tokio::test]
async fn read_lines_splits_and_drops_trailing_empty() {
    let pipeline = Pipeline::new()
        .stage(ProcessStage::new(r#"sh -c 'printf "a\nb\nc\n"'"#).unwrap());
    assert_eq!(pipeline.read_lines().await.unwrap(), vec!["a", "b", "c"]);

    let no_trailing = Pipeline::new()
        .stage(ProcessStage::new(r#"sh -c 'printf "a\nb"'"#).unwrap());
    assert_eq!(no_trailing.read_lines().await.unwrap(), vec!["a", "b"]);
}

#[tokio::test]
async fn play_discards_output() {
    let pipeline = Pipeline::new().stage(ProcessStage::new("true").unwrap());
    pipeline.play().await.unwrap();
    assert_eq!(pipeline.state(), PipelineState::Done);
}

// ============================================================================
// Command Construction
// ============================================================================

#[tokio::test]
async fn appended_args_reach_the_command() {
    let pipeline = Pipeline::new().stage(
        ProcessStage::new("echo").unwrap().arg("hello").arg(42),
    );
    assert_eq!(pipeline.read_text(None).await.unwrap(), "hello 42");
}

#[tokio::test]
async fn env_override_is_visible_to_child_only() {
    let pipeline = Pipeline::new().stage(
        ProcessStage::new("sh -c 'echo $SPINDLE_TEST_VALUE'")
            .unwrap()
            .env("SPINDLE_TEST_VALUE", "forty-two"),
    );
    assert_eq!(pipeline.read_text(None).await.unwrap(), "forty-two");
    assert!(std::env::var("SPINDLE_TEST_VALUE").is_err());
}

// ============================================================================
// Limits and Timeouts
// ============================================================================

#[tokio::test]
async fn byte_limit_bounds_an_endless_source() {
    let pipeline = Pipeline::new().stage(
        ProcessStage::new("cat /dev/zero").unwrap().limit(65536),
    );
    let out = tokio::time::timeout(Duration::from_secs(10), pipeline.run(None))
        .await
        .expect("limited run must terminate")
        .unwrap();
    assert!(!out.is_empty(), "should capture something before the cap");
    assert!(out.len() <= 65536, "cap exceeded: {} bytes", out.len());
}

#[tokio::test]
async fn timeout_truncates_an_endless_source() {
    let stage = Arc::new(endless_ticker().timeout(Duration::from_millis(300)));
    let pipeline = Pipeline::new().stage_shared(stage.clone());

    let started = Instant::now();
    let out = tokio::time::timeout(Duration::from_secs(10), pipeline.run(None))
        .await
        .expect("timed run must terminate")
        .unwrap();
    assert!(!out.is_empty(), "should capture output before the cutoff");
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "run should return near the configured timeout"
    );
    // Truncation alone does not touch the process; the exit code is
    // recorded only once the stage is stopped.
    assert_eq!(stage.exit_code(), None);
    stage.stop().await;
    assert!(stage.exit_code().is_some());
}

#[tokio::test]
async fn timeout_closes_stderr_capture_too() {
    let stage = Arc::new(
        ProcessStage::new(
            "sh -c 'while true; do echo tick; echo moan >&2; sleep 0.01; done'",
        )
        .unwrap()
        .timeout(Duration::from_millis(200)),
    );
    let pipeline = Pipeline::new().stage_shared(stage.clone());
    tokio::time::timeout(Duration::from_secs(10), pipeline.run(None))
        .await
        .expect("timed run must terminate")
        .unwrap();

    // The cutoff closes our ends of stdout and stderr, so the captured
    // stderr is frozen even while the process keeps running.
    let captured = stage.stderr_text();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        stage.stderr_text(),
        captured,
        "stderr capture must stop at the timeout cutoff"
    );
    stage.stop().await;
}

#[tokio::test]
async fn limit_takes_precedence_over_timeout() {
    let pipeline = Pipeline::new().stage(
        ProcessStage::new("cat /dev/zero")
            .unwrap()
            .limit(4096)
            .timeout(Duration::from_secs(30)),
    );
    let out = tokio::time::timeout(Duration::from_secs(10), pipeline.run(None))
        .await
        .expect("run must end on the byte cap, not the timeout")
        .unwrap();
    assert!(out.len() <= 4096);
}

// ============================================================================
// Failure Modes
// ============================================================================

#[tokio::test]
async fn missing_binary_is_a_spawn_error() {
    let pipeline = Pipeline::new()
        .stage(ProcessStage::new("definitely_not_a_real_binary_4127").unwrap());
    match pipeline.run(None).await {
        Err(PipelineError::Spawn { command, .. }) => {
            assert_eq!(command, "definitely_not_a_real_binary_4127");
        }
        other => panic!("expected a spawn error, got {:?}", other.map(|b| b.len())),
    }
}

#[tokio::test]
async fn spawn_failure_mid_chain_tears_down_started_stages() {
    let pipeline = Pipeline::new()
        .stage(ProcessStage::new("cat").unwrap())
        .stage(ProcessStage::new("definitely_not_a_real_binary_4127").unwrap());
    assert!(matches!(
        pipeline.run(Some(b"data".to_vec())).await,
        Err(PipelineError::Spawn { .. })
    ));
    assert_eq!(pipeline.state(), PipelineState::Done);
}

#[tokio::test]
async fn failed_command_yields_stderr_and_nonzero_exit() {
    let stage = Arc::new(ProcessStage::new("ls /no_such_file_spindle_test").unwrap());
    let pipeline = Pipeline::new().stage_shared(stage.clone());

    let out = pipeline.read_text(None).await.unwrap();
    assert_eq!(out, "", "stdout should be empty");

    let code = stage.wait().await.expect("exit code after wait");
    assert_ne!(code, 0, "ls on a missing path should fail");
    let err = stage.stderr_text();
    assert!(
        err.contains("no_such_file_spindle_test"),
        "stderr should name the missing path: {err:?}"
    );
    assert!(stage.pid().is_some());
}

#[tokio::test]
async fn exit_codes_are_preserved() {
    let stage = Arc::new(ProcessStage::new("sh -c 'exit 42'").unwrap());
    let pipeline = Pipeline::new().stage_shared(stage.clone());
    pipeline.play().await.unwrap();
    assert_eq!(stage.wait().await, Some(42));
}

#[tokio::test]
async fn early_exiting_consumer_ends_the_chain_cleanly() {
    // seq floods; head takes five lines and exits. The broken pipe must
    // be absorbed, not surfaced.
    let pipeline = Pipeline::new()
        .stage(ProcessStage::new("seq 1 1000000").unwrap())
        .stage(ProcessStage::new("head -n 5").unwrap());
    let lines = tokio::time::timeout(Duration::from_secs(10), pipeline.read_lines())
        .await
        .expect("early consumer exit must not hang the pipeline")
        .unwrap();
    assert_eq!(lines, vec!["1", "2", "3", "4", "5"]);
}

// ============================================================================
// Stop, Wait, and Background Runs
// ============================================================================

#[tokio::test]
async fn stop_is_idempotent_and_wait_does_not_deadlock() {
    let pipeline = Arc::new(Pipeline::new().stage(endless_ticker()));
    let handle = pipeline.run_in_background(None);

    tokio::time::sleep(Duration::from_millis(100)).await;
    pipeline.stop().await;
    pipeline.stop().await;

    let out = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("stopped run must finish")
        .unwrap();
    assert!(out.starts_with(b"tick") || out.is_empty());

    tokio::time::timeout(Duration::from_secs(5), pipeline.wait())
        .await
        .expect("wait after stop must return");
    assert_eq!(pipeline.state(), PipelineState::Done);
}

#[tokio::test]
async fn stop_reaches_a_process_another_task_is_waiting_on() {
    let stage = Arc::new(endless_ticker());
    stage.start(None).await.unwrap();

    // The waiter holds the child for the whole wait; stop must still
    // get the process killed.
    let waiter = {
        let stage = stage.clone();
        tokio::spawn(async move { stage.wait().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    stage.stop().await;

    let code = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("wait must unblock once the stage is stopped")
        .unwrap();
    assert!(code.is_some(), "the waiter should observe the exit");
    assert_eq!(stage.exit_code(), code);
}

#[tokio::test]
async fn background_run_completes_and_reports_output() {
    let pipeline = Arc::new(
        Pipeline::new().stage(ProcessStage::new("sh -c 'sleep 0.1; echo done'").unwrap()),
    );
    let handle = pipeline.run_in_background(None);
    let out = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("background run must finish")
        .unwrap();
    assert_eq!(out, b"done\n");
    assert_eq!(pipeline.state(), PipelineState::Done);
}

#[tokio::test]
async fn cancelling_a_background_run_unblocks_it() {
    let pipeline = Arc::new(Pipeline::new().stage(endless_ticker()));
    let handle = pipeline.run_in_background(None);

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();

    let out = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("cancelled run must finish")
        .unwrap();
    // Cancellation is cooperative: the run unwinds with whatever was
    // accumulated; stop() is what kills the process.
    assert!(out.is_empty() || out.starts_with(b"tick"));
    pipeline.stop().await;
}
