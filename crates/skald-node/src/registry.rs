//! The node's registry of "worker classes": maps a task's
//! `className` to how this node starts that class's subprocess.
//!
//! The business logic behind a `className` is out of scope for this crate —
//! a node binary supplies this registry at startup, one [`WorkerSpec`] per
//! className it is willing to run.

use serde_json::value::RawValue;
use skald_core::{ErrorKind, SkaldError};
use std::collections::HashMap;
use tokio::process::{Child, Command};

/// How to start the subprocess for one registered `className`.
///
/// The task id and its opaque attachment blob are handed to the subprocess
/// via environment variables, so the handoff needs no IPC channel left open
/// across the fork/exec.
#[derive(Clone, Debug)]
pub struct WorkerSpec {
    program: String,
    args: Vec<String>,
}

impl WorkerSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub(crate) fn spawn(&self, task_id: &str, attachments: &RawValue) -> Result<Child, SkaldError> {
        Command::new(&self.program)
            .args(&self.args)
            .env("SKALD_TASK_ID", task_id)
            .env("SKALD_TASK_ATTACHMENTS", attachments.get())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SkaldError::new(ErrorKind::SubprocessFailure, err))
    }
}

/// The set of `className`s this node is willing to instantiate.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    specs: HashMap<String, WorkerSpec>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, class_name: impl Into<String>, spec: WorkerSpec) -> Self {
        self.specs.insert(class_name.into(), spec);
        self
    }

    pub fn get(&self, class_name: &str) -> Option<&WorkerSpec> {
        self.specs.get(class_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_registered_class_names_resolve() {
        let registry = WorkerRegistry::new().register("Camera", WorkerSpec::new("true"));
        assert!(registry.get("Camera").is_some());
        assert!(registry.get("Unknown").is_none());
    }
}
