//! Integration tests for the command pipeline executor.
//!
//! Stage scripts are run through `/bin/sh` rather than executed directly,
//! which avoids ETXTBSY races with freshly written files.

#![cfg(unix)]

use hopper::error::Error;
use hopper::executor::{PipelineDef, PipelineExecutor, StageDef, WorkExecutor};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["in", "out", "scratch", "hooks"] {
            std::fs::create_dir(dir.path().join(sub)).unwrap();
        }
        Self { dir }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn input(&self, name: &str, content: &str) -> PathBuf {
        let path = self.path("in").join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn stage(&self, name: &str, script: &str) -> StageDef {
        let path = self.path("hooks").join(format!("{name}.sh"));
        std::fs::write(&path, script).unwrap();
        StageDef {
            name: name.to_string(),
            command: PathBuf::from("/bin/sh"),
            args: vec![path.display().to_string()],
            timeout_ms: None,
        }
    }

    fn executor(&self, stages: Vec<StageDef>) -> PipelineExecutor {
        let def = PipelineDef {
            name: "test".to_string(),
            stages,
            base_dir: PathBuf::new(),
        };
        PipelineExecutor::new(
            def,
            self.path("out"),
            self.path("scratch"),
            Duration::from_secs(10),
        )
    }

    fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(self.path("scratch")).unwrap().next().is_none()
    }
}

fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn stages_run_in_order_and_result_is_published() {
    let fx = Fixture::new();
    let input = fx.input("doc.pdf", "original\n");
    let exec = fx.executor(vec![
        fx.stage("copy", "cp \"$HOPPER_INPUT\" \"$HOPPER_RESULT\"\n"),
        fx.stage("stamp", "echo \"stamped by $HOPPER_STAGE\" >> \"$HOPPER_RESULT\"\n"),
    ]);

    let completion = exec.run(&input).await.unwrap();

    let output = completion.output.expect("pipeline produces an output");
    assert_eq!(output, fx.path("out").join("doc.pdf"));
    assert_eq!(
        std::fs::read_to_string(&output).unwrap(),
        "original\nstamped by stamp\n"
    );
    assert_eq!(entries(&fx.path("out")), vec!["doc.pdf".to_string()]);
    assert!(fx.scratch_is_empty());
    // The input itself is left alone.
    assert!(input.exists());
}

#[tokio::test]
async fn stages_run_inside_a_fresh_scratch_dir() {
    let fx = Fixture::new();
    let input = fx.input("doc.pdf", "x");
    let exec = fx.executor(vec![fx.stage(
        "where",
        "pwd > \"$HOPPER_RESULT\"\necho \"$HOPPER_WORK_DIR\" >> \"$HOPPER_RESULT\"\necho \"$HOPPER_ATTEMPT_ID\" >> \"$HOPPER_RESULT\"\n",
    )]);

    let output = exec.run(&input).await.unwrap().output.unwrap();
    let content = std::fs::read_to_string(output).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 3);

    let scratch = fx.path("scratch").canonicalize().unwrap();
    assert!(Path::new(lines[0]).starts_with(&scratch));
    assert!(Path::new(lines[1]).ends_with(lines[2]));
    assert!(fx.scratch_is_empty());
}

#[tokio::test]
async fn failing_stage_names_the_stage_and_stops_the_pipeline() {
    let fx = Fixture::new();
    let input = fx.input("doc.pdf", "x");
    let exec = fx.executor(vec![
        fx.stage("validate", "echo 'not a pdf' >&2\nexit 3\n"),
        fx.stage("never", "touch \"$HOPPER_INPUT.ran\"\n"),
    ]);

    let err = exec.run(&input).await.unwrap_err();
    match err {
        Error::Stage { stage, message } => {
            assert_eq!(stage, "validate");
            assert!(message.contains("status 3"), "{message}");
            assert!(message.contains("not a pdf"), "{message}");
        }
        other => panic!("expected stage error, got {other:?}"),
    }
    assert!(!fx.path("in").join("doc.pdf.ran").exists());
    assert!(entries(&fx.path("out")).is_empty());
    assert!(fx.scratch_is_empty());
}

#[tokio::test]
async fn slow_stage_is_killed_at_its_timeout() {
    let fx = Fixture::new();
    let input = fx.input("doc.pdf", "x");
    let mut slow = fx.stage("slow", "exec sleep 10\n");
    slow.timeout_ms = Some(200);
    let exec = fx.executor(vec![slow]);

    let started = std::time::Instant::now();
    let err = exec.run(&input).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        err,
        Error::Timeout { ref stage, timeout_ms: 200 } if stage == "slow"
    ));
    assert!(fx.scratch_is_empty());
}

#[tokio::test]
async fn missing_result_file_is_a_failure() {
    let fx = Fixture::new();
    let input = fx.input("doc.pdf", "x");
    let exec = fx.executor(vec![fx.stage("noop", "exit 0\n")]);

    let err = exec.run(&input).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Stage { ref stage, ref message } if stage == "noop" && message.contains("result")
    ));
    assert!(entries(&fx.path("out")).is_empty());
}

#[tokio::test]
async fn missing_command_is_reported_as_stage_failure() {
    let fx = Fixture::new();
    let input = fx.input("doc.pdf", "x");
    let exec = fx.executor(vec![StageDef {
        name: "ghost".to_string(),
        command: fx.path("hooks/does-not-exist"),
        args: Vec::new(),
        timeout_ms: None,
    }]);

    let err = exec.run(&input).await.unwrap_err();
    assert!(matches!(err, Error::Stage { ref stage, .. } if stage == "ghost"));
    assert!(fx.scratch_is_empty());
}

#[tokio::test]
async fn rerun_replaces_previous_output() {
    let fx = Fixture::new();
    let input = fx.input("doc.pdf", "first");
    let exec = fx.executor(vec![fx.stage("copy", "cp \"$HOPPER_INPUT\" \"$HOPPER_RESULT\"\n")]);

    exec.run(&input).await.unwrap();
    std::fs::write(&input, "second").unwrap();
    let output = exec.run(&input).await.unwrap().output.unwrap();

    assert_eq!(std::fs::read_to_string(output).unwrap(), "second");
    assert_eq!(entries(&fx.path("out")), vec!["doc.pdf".to_string()]);
}
