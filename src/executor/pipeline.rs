//! Command pipeline executor.
//!
//! A pipeline is an ordered list of stages, each an external command. A run
//! gets a fresh scratch directory; every stage runs inside it with the
//! input path and a result path in its environment. When all stages succeed
//! the result file is published into the output folder under the input's
//! file name.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use opentelemetry::KeyValue;

use super::{Completion, WorkExecutor};
use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// Name of the file the last stage must leave in the scratch directory.
pub const RESULT_FILE: &str = "result";

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct PipelineFile {
    pipeline: PipelineDef,
}

/// A pipeline definition as loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineDef {
    pub name: String,
    #[serde(rename = "stage", default)]
    pub stages: Vec<StageDef>,
    /// Directory relative stage commands are resolved against. Set to the
    /// pipeline file's directory by [`PipelineDef::load`].
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// One stage: an executable plus optional arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct StageDef {
    pub name: String,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overrides the executor-wide stage timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl PipelineDef {
    /// Load and validate a pipeline file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read pipeline file {}: {e}", path.display()))
        })?;
        let mut def = Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad pipeline file {}: {e}", path.display())))?;
        def.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(def)
    }

    /// Parse and validate a pipeline from TOML text. Relative commands
    /// resolve against the process working directory.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: PipelineFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        let def = file.pipeline;
        def.validate()?;
        Ok(def)
    }

    fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::Config(format!(
                "pipeline {} has no stages",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(Error::Config(format!(
                    "pipeline {} has duplicate stage {}",
                    self.name, stage.name
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, command: &Path) -> Result<PathBuf> {
        if command.is_absolute() {
            return Ok(command.to_path_buf());
        }
        // Stages run with the scratch dir as CWD, so relative commands must
        // be made absolute first.
        let base = if self.base_dir.as_os_str().is_empty() {
            std::env::current_dir()?
        } else if self.base_dir.is_relative() {
            std::env::current_dir()?.join(&self.base_dir)
        } else {
            self.base_dir.clone()
        };
        Ok(base.join(command))
    }
}

/// Runs a [`PipelineDef`] for each file.
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    def: PipelineDef,
    output_dir: PathBuf,
    scratch_root: PathBuf,
    stage_timeout: Duration,
}

impl PipelineExecutor {
    pub fn new(
        def: PipelineDef,
        output_dir: impl Into<PathBuf>,
        scratch_root: impl Into<PathBuf>,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            def,
            output_dir: output_dir.into(),
            scratch_root: scratch_root.into(),
            stage_timeout,
        }
    }

    pub fn pipeline(&self) -> &PipelineDef {
        &self.def
    }

    async fn run_in(&self, scratch: &Path, input: &Path, attempt_id: Uuid) -> Result<Completion> {
        let start = Instant::now();

        for stage in &self.def.stages {
            let stage_start = Instant::now();
            let result = self.run_stage(stage, scratch, input, attempt_id).await;
            let stage_ms = stage_start.elapsed().as_millis() as u64;
            metrics::stage_duration_ms()
                .record(stage_ms as f64, &[KeyValue::new("stage", stage.name.clone())]);

            match result {
                Ok(()) => {
                    debug!(
                        attempt_id = %attempt_id,
                        stage = %stage.name,
                        duration_ms = stage_ms,
                        "stage completed"
                    );
                }
                Err(e) => {
                    warn!(
                        attempt_id = %attempt_id,
                        stage = %stage.name,
                        duration_ms = stage_ms,
                        error = %e,
                        "stage failed"
                    );
                    return Err(e);
                }
            }
        }

        let result_path = scratch.join(RESULT_FILE);
        if !tokio::fs::try_exists(&result_path).await? {
            let last = self
                .def
                .stages
                .last()
                .map(|s| s.name.clone())
                .unwrap_or_default();
            return Err(Error::Stage {
                stage: last,
                message: format!("no {RESULT_FILE} file was produced"),
            });
        }

        let output = self.publish(&result_path, input, attempt_id).await?;
        info!(
            pipeline = %self.def.name,
            output = %output.display(),
            duration_ms = start.elapsed().as_millis() as u64,
            "pipeline completed"
        );
        Ok(Completion {
            output: Some(output),
        })
    }

    /// Move the result into the output folder. The copy goes to a hidden
    /// temporary name first so the final name only ever holds a complete
    /// file.
    async fn publish(&self, result: &Path, input: &Path, attempt_id: Uuid) -> Result<PathBuf> {
        let name = input
            .file_name()
            .ok_or_else(|| Error::Other(format!("input has no file name: {}", input.display())))?;
        tokio::fs::create_dir_all(&self.output_dir).await?;

        let dest = self.output_dir.join(name);
        let tmp = self.output_dir.join(format!(
            ".{}.{attempt_id}.part",
            name.to_string_lossy()
        ));
        tokio::fs::copy(result, &tmp).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &dest).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(dest)
    }

    async fn run_stage(
        &self,
        stage: &StageDef,
        scratch: &Path,
        input: &Path,
        attempt_id: Uuid,
    ) -> Result<()> {
        let command = self.def.resolve(&stage.command)?;
        let timeout = stage
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.stage_timeout);

        debug!(
            attempt_id = %attempt_id,
            stage = %stage.name,
            command = %command.display(),
            "running stage"
        );

        let mut cmd = Command::new(&command);
        cmd.args(&stage.args)
            .current_dir(scratch)
            .env("HOPPER_INPUT", input)
            .env("HOPPER_STAGE", &stage.name)
            .env("HOPPER_WORK_DIR", scratch)
            .env("HOPPER_RESULT", scratch.join(RESULT_FILE))
            .env("HOPPER_ATTEMPT_ID", attempt_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Dropping the output future on timeout kills the child.
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::Stage {
                    stage: stage.name.clone(),
                    message: format!("failed to start {}: {e}", command.display()),
                });
            }
            Err(_) => {
                return Err(Error::Timeout {
                    stage: stage.name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().rev().find(|l| !l.trim().is_empty());
        let code = output.status.code().unwrap_or(-1);
        Err(Error::Stage {
            stage: stage.name.clone(),
            message: match detail {
                Some(line) => format!("exited with status {code}: {}", line.trim()),
                None => format!("exited with status {code}"),
            },
        })
    }
}

#[async_trait]
impl WorkExecutor for PipelineExecutor {
    async fn run(&self, path: &Path) -> Result<Completion> {
        let attempt_id = Uuid::new_v4();
        let scratch = self.scratch_root.join(attempt_id.to_string());
        tokio::fs::create_dir_all(&scratch).await?;

        let result = self.run_in(&scratch, path, attempt_id).await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            warn!(attempt_id = %attempt_id, "scratch cleanup error: {e}");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stages_in_order() {
        let def = PipelineDef::from_toml_str(
            r#"
            [pipeline]
            name = "endorse"

            [[pipeline.stage]]
            name = "render"
            command = "hooks/render.sh"

            [[pipeline.stage]]
            name = "merge"
            command = "/usr/local/bin/merge"
            args = ["--fast"]
            timeout_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(def.name, "endorse");
        assert_eq!(def.stages.len(), 2);
        assert_eq!(def.stages[0].name, "render");
        assert!(def.stages[0].args.is_empty());
        assert_eq!(def.stages[1].args, vec!["--fast".to_string()]);
        assert_eq!(def.stages[1].timeout_ms, Some(500));
    }

    #[test]
    fn rejects_empty_pipeline() {
        let err = PipelineDef::from_toml_str("[pipeline]\nname = \"nothing\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("no stages")));
    }

    #[test]
    fn rejects_duplicate_stage_names() {
        let err = PipelineDef::from_toml_str(
            r#"
            [pipeline]
            name = "dup"
            [[pipeline.stage]]
            name = "a"
            command = "x"
            [[pipeline.stage]]
            name = "a"
            command = "y"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("duplicate stage a")));
    }

    #[test]
    fn load_resolves_relative_commands_against_file_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pipeline.toml");
        std::fs::write(
            &file,
            "[pipeline]\nname = \"p\"\n[[pipeline.stage]]\nname = \"s\"\ncommand = \"hooks/s.sh\"\n",
        )
        .unwrap();

        let def = PipelineDef::load(&file).unwrap();
        let resolved = def.resolve(&def.stages[0].command).unwrap();
        assert_eq!(resolved, dir.path().join("hooks/s.sh"));
    }
}
