//! The controller's run-mode switch: narrows which of the node monitor, task
//! monitor and dispatcher a given controller process runs.
//!
//! Operators may run several controllers in [`RunMode::Monitor`] for
//! read-side observability, as long as at most one runs [`RunMode::Dispatcher`]
//! — the dispatcher is the only component that requires a single writer
//! assigning tasks at a time.

use std::fmt;
use std::str::FromStr;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunMode {
    /// No monitoring loops; reserved for a future API-only deployment. Today
    /// this just idles.
    Controller,
    /// Runs the node monitor and task monitor, no dispatching.
    Monitor,
    /// Runs the node monitor, task monitor and dispatcher: the full control
    /// plane. Default.
    Dispatcher,
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::Dispatcher
    }
}

impl RunMode {
    pub fn runs_node_monitor(self) -> bool {
        matches!(self, RunMode::Monitor | RunMode::Dispatcher)
    }

    pub fn runs_task_monitor(self) -> bool {
        matches!(self, RunMode::Monitor | RunMode::Dispatcher)
    }

    pub fn runs_dispatcher(self) -> bool {
        matches!(self, RunMode::Dispatcher)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunMode::Controller => "controller",
            RunMode::Monitor => "monitor",
            RunMode::Dispatcher => "dispatcher",
        };
        f.write_str(name)
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(RunMode::Controller),
            "monitor" => Ok(RunMode::Monitor),
            "dispatcher" => Ok(RunMode::Dispatcher),
            other => Err(format!("unknown controller run mode: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_mode_runs_nothing() {
        let mode = RunMode::Controller;
        assert!(!mode.runs_node_monitor());
        assert!(!mode.runs_task_monitor());
        assert!(!mode.runs_dispatcher());
    }

    #[test]
    fn monitor_mode_skips_the_dispatcher() {
        let mode = RunMode::Monitor;
        assert!(mode.runs_node_monitor());
        assert!(mode.runs_task_monitor());
        assert!(!mode.runs_dispatcher());
    }

    #[test]
    fn round_trips_through_display_and_from_str() {
        for mode in [RunMode::Controller, RunMode::Monitor, RunMode::Dispatcher] {
            assert_eq!(mode.to_string().parse::<RunMode>().unwrap(), mode);
        }
    }
}
