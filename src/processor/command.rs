//! A processor that runs an external program.

use std::path::PathBuf;
use std::process::Command;

use ingestd_common::{ArtifactTypeId, Result};

use super::{ProcessContext, ProcessingOutcome, Processor, TemplateContext};
use crate::config::{OutputConfig, ProcessorConfig};
use crate::finalizer::{OUT_OF_SPACE, PROCESSING_ERROR};

const MISSING_OUTPUT: &str = "Expected output was not produced.";
const PROCESSED: &str = "Processed.";
const REGISTERING: &str = "Registering outputs.";

/// Share of the reported percentage given to running the program; the rest
/// tracks output registration.
const RUN_SHARE: usize = 50;

fn registration_percentage(registered: usize, total: usize) -> i32 {
    let done = RUN_SHARE + (100 - RUN_SHARE) * registered / total.max(1);
    i32::try_from(done).unwrap_or(100)
}

/// Runs a configured program once per artifact and registers the files it
/// leaves in the working directory as derived artifacts.
///
/// Arguments and output names may use `{input}`, `{working_dir}` and
/// `{id}`. The program runs with the working directory as its current
/// directory.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
    outputs: Vec<OutputConfig>,
}

impl CommandProcessor {
    pub fn new(program: impl Into<String>, args: Vec<String>, outputs: Vec<OutputConfig>) -> Self {
        Self {
            program: program.into(),
            args,
            outputs,
        }
    }

    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone(), config.outputs.clone())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Resolve the program on `PATH`.
    pub fn locate_program(&self) -> Option<PathBuf> {
        which::which(&self.program).ok()
    }
}

impl Processor for CommandProcessor {
    fn process(&self, ctx: &ProcessContext<'_>) -> Result<ProcessingOutcome> {
        let id = ctx.artifact().id;
        let vars = TemplateContext::for_job(ctx.source_file(), ctx.working_dir(), id);
        let args = vars.substitute_all(&self.args);

        tracing::info!(artifact_id = %id, program = %self.program, ?args, "Running processor command");
        ctx.update_status(&format!("Running {}.", self.program), Some(0))?;

        let output = Command::new(&self.program)
            .args(&args)
            .current_dir(ctx.working_dir())
            .output()?;

        if !output.status.success() {
            tracing::warn!(
                artifact_id = %id,
                code = ?output.status.code(),
                stdout = %String::from_utf8_lossy(&output.stdout),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "Processor command failed"
            );
            return Ok(ctx.fail(PROCESSING_ERROR));
        }
        tracing::debug!(artifact_id = %id, stdout = %String::from_utf8_lossy(&output.stdout), "Processor command finished");

        let total = self.outputs.len();
        for (index, declared) in self.outputs.iter().enumerate() {
            ctx.update_status(REGISTERING, Some(registration_percentage(index, total)))?;
            let path = ctx.working_dir().join(vars.substitute(&declared.file));
            if !path.is_file() {
                if declared.optional {
                    continue;
                }
                tracing::warn!(artifact_id = %id, path = %path.display(), "Declared output missing");
                return Ok(ctx.fail(MISSING_OUTPUT));
            }

            if ctx.is_over_quota(0) {
                return Ok(ctx.fail(OUT_OF_SPACE));
            }

            let name = declared.name.as_deref().map(|n| vars.substitute(n));
            ctx.register_derived(&path, ArtifactTypeId::new(declared.type_id), name.as_deref())?;
        }

        ctx.update_status(REGISTERING, Some(100))?;
        Ok(ctx.succeed(PROCESSED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_percentage() {
        assert_eq!(registration_percentage(0, 0), 50);
        assert_eq!(registration_percentage(0, 4), 50);
        assert_eq!(registration_percentage(2, 4), 75);
        assert_eq!(registration_percentage(4, 4), 100);
    }
}
