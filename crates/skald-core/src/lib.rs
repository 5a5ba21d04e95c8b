//! Shared data model, adapter contracts and control-plane primitives for the
//! skald task-execution fabric.
//!
//! This crate contains no network code of its own. It defines the `Task` data
//! model and lifecycle state machine, the `KvStore` / `Bus` /
//! `TaskRepository` trait contracts that the controller and node crates
//! program against, the shutdown/backoff/survive primitives used by every
//! periodic loop, and an in-memory implementation of the three traits for use
//! in tests.

pub mod backoff;
pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod flag;
pub mod kv;
pub mod model;
pub mod sentinel;
pub mod survive;
pub mod testutil;
mod util;

pub use backoff::{retry, Backoff};
pub use bus::{Bus, BusConsumer, BusMessage, Topic};
pub use config::SkaldConfig;
pub use db::{AssignmentOrder, TaskRepository};
pub use error::{ErrorKind, SkaldError};
pub use flag::ShutdownFlag;
pub use kv::KvStore;
pub use model::{
    LifecycleStatus, NodeMode, NodeRecord, NodeTaskSummary, Task, TaskHeartbeatRecord, TaskMode,
    UpdateTaskWorkerEvent,
};
pub use sentinel::HeartbeatSentinel;
pub use survive::SurviveHandler;
pub use util::now_ms;
