//! An [`Engine`] which runs each command in an external program.

use std::{
    path::{Path, PathBuf},
    process::Command,
};

use log::trace;
use serde_json::Value;

use crate::job::{Engine, EngineError, Job};

/// Runs `<program> [extra args...] <command> key=value ...` for each job.
///
/// String arguments are passed verbatim, everything else as JSON. The program reports its result
/// as a single JSON document on standard output; empty output is read as `null`.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl CommandEngine {
    /// Create an engine which runs `program`.
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            extra_args: vec![],
        }
    }

    /// Arguments placed before the command name on every call.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command_for(&self, job: &Job) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.extra_args).arg(&job.command);
        for (key, value) in &job.args {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            cmd.arg(format!("{key}={value}"));
        }
        cmd
    }
}

impl Engine for CommandEngine {
    fn call(&self, job: &Job) -> Result<Value, EngineError> {
        let mut cmd = self.command_for(job);
        trace!("running {:?}", cmd);
        let output = cmd.output().map_err(|source| EngineError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;
        if !output.status.success() {
            return Err(EngineError::NonZeroExit {
                command: job.command.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(stdout).map_err(|source| EngineError::BadOutput {
            command: job.command.clone(),
            source,
        })
    }
}
