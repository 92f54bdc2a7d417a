//! Command-backed stage
//!
//! Runs the configured program once per attempt. The child sees:
//! - `CLASSICS_BOOK_ID`, `CLASSICS_STAGE`, `CLASSICS_ATTEMPT`
//! - `CLASSICS_INPUTS`: input artifact paths, newline-separated
//! - `CLASSICS_OUTPUT`: the declared artifact it must write
//! - `CLASSICS_BOOK_DIR`: the book's artifact directory
//!
//! and reports on stdout with one JSON object:
//! `{"status": "success"|"warning"|"transient"|"validation"|"fatal", ...}`.
//! A report on the last stdout line is accepted when the child also prints
//! progress text.

use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use classics_common::config::StageCommandConfig;
use classics_common::PipelineConfig;

use crate::error::{PipelineError, PipelineResult};
use crate::models::StageName;
use crate::workflow::registry::StageRegistry;
use crate::workflow::stage::{ReportedIssue, Stage, StageContext, StageResult};

const STDERR_TAIL_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ReportStatus {
    Success,
    Warning,
    Transient,
    Validation,
    Fatal,
}

/// JSON report printed by a stage command
#[derive(Debug, Deserialize)]
struct StageReport {
    status: ReportStatus,
    #[serde(default)]
    outputs: Vec<PathBuf>,
    #[serde(default)]
    warnings: Vec<String>,
    #[serde(default)]
    cost_usd: f64,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    issues: Vec<ReportedIssue>,
}

impl StageReport {
    fn into_result(self) -> StageResult {
        let error = self.error.unwrap_or_else(|| "no error message reported".to_string());
        match self.status {
            ReportStatus::Success => StageResult::Success {
                outputs: self.outputs,
                cost_usd: self.cost_usd,
            },
            ReportStatus::Warning => StageResult::SuccessWithWarnings {
                outputs: self.outputs,
                warnings: self.warnings,
                cost_usd: self.cost_usd,
            },
            ReportStatus::Transient => StageResult::TransientFailure {
                error,
                cost_usd: self.cost_usd,
            },
            ReportStatus::Validation => StageResult::ValidationFailure {
                issues: self.issues,
                cost_usd: self.cost_usd,
            },
            ReportStatus::Fatal => StageResult::FatalFailure { error },
        }
    }
}

/// Whole stdout, or failing that its last non-empty line
fn parse_report(stdout: &str) -> Option<StageReport> {
    let trimmed = stdout.trim();
    if let Ok(report) = serde_json::from_str(trimmed) {
        return Some(report);
    }
    trimmed
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| serde_json::from_str(line.trim()).ok())
}

fn tail(text: &str) -> &str {
    let text = text.trim_end();
    match text.char_indices().rev().nth(STDERR_TAIL_CHARS) {
        Some((index, _)) => &text[index..],
        None => text,
    }
}

/// Stage implemented by an external program
#[derive(Debug, Clone)]
pub struct CommandStage {
    name: StageName,
    program: String,
    args: Vec<String>,
    estimated_cost_usd: f64,
    timeout: Option<Duration>,
}

impl CommandStage {
    pub fn from_config(name: StageName, config: &StageCommandConfig) -> PipelineResult<Self> {
        let (program, args) = config.command.split_first().ok_or_else(|| {
            PipelineError::Common(classics_common::Error::Config(format!(
                "stages.{}.command must name a program",
                name
            )))
        })?;

        let estimated_cost_usd = match (name.is_paid(), config.estimated_cost_usd) {
            (_, Some(estimate)) => estimate,
            (true, None) => {
                return Err(PipelineError::Common(classics_common::Error::Config(format!(
                    "stages.{}.estimated_cost_usd is required for a paid stage",
                    name
                ))))
            }
            (false, None) => 0.0,
        };

        Ok(Self {
            name,
            program: program.clone(),
            args: args.to_vec(),
            estimated_cost_usd,
            timeout: config.timeout_secs.map(Duration::from_secs),
        })
    }

    fn command(&self, ctx: &StageContext) -> Command {
        let inputs: Vec<String> = ctx.inputs.iter().map(|p| p.display().to_string()).collect();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("CLASSICS_BOOK_ID", &ctx.book_id)
            .env("CLASSICS_STAGE", ctx.stage.as_str())
            .env("CLASSICS_ATTEMPT", ctx.attempt.to_string())
            .env("CLASSICS_INPUTS", inputs.join("\n"))
            .env("CLASSICS_OUTPUT", &ctx.output)
            .env("CLASSICS_BOOK_DIR", &ctx.book_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future on timeout kills the child
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait::async_trait]
impl Stage for CommandStage {
    fn name(&self) -> StageName {
        self.name
    }

    fn estimated_cost(&self) -> f64 {
        self.estimated_cost_usd
    }

    async fn run(&self, ctx: &StageContext) -> StageResult {
        if let Some(parent) = ctx.output.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return StageResult::transient(format!(
                    "failed to create {}: {}",
                    parent.display(),
                    e
                ));
            }
        }

        let child = match self.command(ctx).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(stage = %self.name, program = %self.program, error = %e, "Failed to spawn stage command");
                return StageResult::transient(format!("failed to spawn '{}': {}", self.program, e));
            }
        };

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output,
                Err(_) => {
                    return StageResult::transient(format!(
                        "'{}' timed out after {}s",
                        self.program,
                        limit.as_secs()
                    ))
                }
            },
            None => child.wait_with_output().await,
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => return StageResult::transient(format!("failed to read '{}' output: {}", self.program, e)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            stage = %self.name,
            book_id = %ctx.book_id,
            exit = ?output.status.code(),
            stdout_bytes = output.stdout.len(),
            "Stage command finished"
        );

        match parse_report(&stdout) {
            Some(report) => report.into_result(),
            None if !output.status.success() => StageResult::fatal(format!(
                "'{}' exited with {:?} without a report; stderr: {}",
                self.program,
                output.status.code(),
                tail(&stderr)
            )),
            None => StageResult::fatal(format!(
                "'{}' printed no parsable report; stdout: {}",
                self.program,
                tail(&stdout)
            )),
        }
    }
}

/// One `CommandStage` per configured `[stages.<name>]` table
pub fn registry_from_config(config: &PipelineConfig) -> PipelineResult<StageRegistry> {
    let mut registry = StageRegistry::new();
    for (name, stage_config) in &config.stages {
        let stage: StageName = name.parse().map_err(|e: String| {
            PipelineError::Common(classics_common::Error::Config(format!("[stages.{}]: {}", name, e)))
        })?;
        registry.register(std::sync::Arc::new(CommandStage::from_config(stage, stage_config)?));
    }
    Ok(registry)
}
