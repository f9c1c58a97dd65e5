//! Adapter Invocation Boundary
//!
//! The engine's only interface to the outside world. An [`Adapter`]
//! receives a task descriptor and its fully resolved inputs (defaults
//! applied, secondary files attached) and reports back the primary path
//! of every declared output, or an opaque failure.
//!
//! [`ShellAdapter`] is the reference implementation: it substitutes
//! placeholders into the task's command template, writes a temporary
//! bash script, and runs it locally.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::task::TaskDescriptor;
use crate::value::Value;

/// Shared directory for generated execution scripts.
static SCRIPT_DIR: Lazy<PathBuf> = Lazy::new(|| std::env::temp_dir().join("dagrun_scripts"));

/// Monotonic counter keeping concurrent script paths distinct.
static SCRIPT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Opaque failure reported by an external adapter.
///
/// The engine never interprets the message beyond logging it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("adapter for task '{task}' failed: {message}")]
pub struct AdapterFailure {
    /// Task whose invocation failed
    pub task: String,
    /// Adapter-defined diagnostic
    pub message: String,
}

impl AdapterFailure {
    /// Creates a failure for the given task.
    pub fn new(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            message: message.into(),
        }
    }
}

/// The external invocation behind a task.
///
/// Implementations receive resolved inputs and return the primary path
/// produced for each declared output; the engine attaches secondary
/// files afterwards. Implementations must be shareable across worker
/// threads.
pub trait Adapter: Send + Sync {
    /// Invokes the external tool for one (sub-)invocation.
    fn invoke(
        &self,
        task: &TaskDescriptor,
        inputs: &HashMap<String, Value>,
    ) -> Result<HashMap<String, String>, AdapterFailure>;
}

/// Substitutes `{name}` placeholders in a command template.
///
/// Inputs render via [`Value::to_command_string`]; outputs render as
/// their derived primary paths.
pub fn render_command(
    template: &str,
    inputs: &HashMap<String, Value>,
    outputs: &HashMap<String, String>,
) -> String {
    let mut command = template.to_string();
    for (name, value) in inputs {
        command = command.replace(&format!("{{{}}}", name), &value.to_command_string());
    }
    for (name, path) in outputs {
        command = command.replace(&format!("{{{}}}", name), path);
    }
    command
}

/// Runs task commands locally through bash.
///
/// The container image in the task's adapter reference is logged but not
/// launched; container runtimes are a deployment concern layered on top.
pub struct ShellAdapter {
    working_dir: Option<PathBuf>,
}

impl ShellAdapter {
    /// Creates an adapter running in the current directory.
    pub fn new() -> Self {
        Self { working_dir: None }
    }

    /// Sets the working directory for executed commands.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Derives the primary path of every declared output.
    fn derive_outputs(
        &self,
        task: &TaskDescriptor,
        inputs: &HashMap<String, Value>,
    ) -> Result<HashMap<String, String>, AdapterFailure> {
        let mut outputs = HashMap::with_capacity(task.outputs.len());
        for spec in &task.outputs {
            let path = spec
                .derivation
                .derive(inputs)
                .map_err(|e| AdapterFailure::new(&task.name, e.to_string()))?;
            outputs.insert(spec.name.clone(), path);
        }
        Ok(outputs)
    }

    /// Creates parent directories for output files.
    fn ensure_output_directories(&self, outputs: &HashMap<String, String>) -> std::io::Result<()> {
        for path in outputs.values() {
            let full = match &self.working_dir {
                Some(dir) => dir.join(path),
                None => PathBuf::from(path),
            };
            if let Some(parent) = full.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent)?;
                    debug!("created directory: {}", parent.display());
                }
            }
        }
        Ok(())
    }

    /// Writes a temporary bash script for one invocation.
    fn create_script(&self, task: &str, command: &str) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&*SCRIPT_DIR)?;

        let seq = SCRIPT_SEQ.fetch_add(1, Ordering::Relaxed);
        let script_path = SCRIPT_DIR.join(format!("{}_{}_{}.sh", task, std::process::id(), seq));
        let mut file = File::create(&script_path)?;

        writeln!(file, "#!/bin/bash")?;
        writeln!(file, "set -e")?;
        writeln!(file, "{}", command)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
        }

        Ok(script_path)
    }
}

impl Default for ShellAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Adapter for ShellAdapter {
    fn invoke(
        &self,
        task: &TaskDescriptor,
        inputs: &HashMap<String, Value>,
    ) -> Result<HashMap<String, String>, AdapterFailure> {
        let outputs = self.derive_outputs(task, inputs)?;
        let command = render_command(&task.adapter.command, inputs, &outputs);

        if let Some(image) = &task.adapter.image {
            debug!("task '{}' declares image {} (running locally)", task.name, image);
        }

        self.ensure_output_directories(&outputs)
            .map_err(|e| AdapterFailure::new(&task.name, e.to_string()))?;

        let script_path = self
            .create_script(&task.name, &command)
            .map_err(|e| AdapterFailure::new(&task.name, e.to_string()))?;

        let mut cmd = Command::new("bash");
        cmd.arg(&script_path);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
            debug!("executing in directory: {}", dir.display());
        }

        let output = cmd
            .output()
            .map_err(|e| AdapterFailure::new(&task.name, e.to_string()))?;

        if let Err(e) = fs::remove_file(&script_path) {
            warn!("failed to clean up script {}: {}", script_path.display(), e);
        }

        if output.status.success() {
            debug!("task '{}' command succeeded", task.name);
            Ok(outputs)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(AdapterFailure::new(
                &task.name,
                format!(
                    "exit code {:?}: {}",
                    output.status.code(),
                    stderr.trim()
                ),
            ))
        }
    }
}
