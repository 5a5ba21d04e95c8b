//! The task worker skeleton: the subprocess lifecycle every registered
//! worker class runs inside.
//!
//! A worker class implements [`TaskWorker`] (an interface with optional
//! hooks and a default base) and hands it to
//! [`TaskWorkerRuntime::run`], which drives the deterministic
//! `run_before -> run_main -> run_after` sequence, wraps all three in an
//! error handler that converts any failure into the FAILED heartbeat
//! sentinel, and guarantees `release()` runs exactly once no matter which
//! exit path is taken — normal return, a hook's error, or SIGINT/SIGTERM.
//!
//! The task id and its opaque attachment blob arrive via the
//! `SKALD_TASK_ID`/`SKALD_TASK_ATTACHMENTS` environment variables a node's
//! worker registry sets when it spawns this subprocess (see
//! `skald_node::registry::WorkerSpec::spawn`); [`task_id_from_env`] and
//! [`attachments_from_env`] read them back out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::value::RawValue;
use skald_core::{
    Bus, BusConsumer, ErrorKind, HeartbeatSentinel, KvStore, SkaldConfig, SkaldError, SurviveHandler, Topic,
    UpdateTaskWorkerEvent,
};
use tokio::task::JoinHandle;

/// Everything a worker's hooks need: the task id, its opaque attachments,
/// and handles to the KV store and bus this task was started with. The core
/// never interprets `attachments`; a class-specific worker decodes it
/// itself.
pub struct TaskContext<K, B> {
    pub task_id: String,
    pub attachments: Box<RawValue>,
    pub kv: Arc<K>,
    pub bus: Arc<B>,
}

impl<K, B> TaskContext<K, B> {
    /// Convenience accessor mirroring [`skald_core::Task::attachment_str`]
    /// for the common case of a single scalar field, e.g. a resource id.
    pub fn attachment_str(&self, key: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(self.attachments.get()).ok()?;
        value.get(key)?.as_str().map(str::to_owned)
    }
}

/// A registered worker class's business logic, expressed as five hooks:
/// `run_before`, `run_main` (the only one without a default —
/// at most one per worker class, enforced by this being a single required
/// trait method rather than a registry), `run_after`, `release` and
/// `update_event`. Registration order among the optional hooks is not
/// meaningful since each is a distinct method, not a tagged callback list.
#[async_trait]
pub trait TaskWorker<K, B>: Send + Sync
where
    K: KvStore,
    B: Bus,
{
    /// Default: no-op. The runtime itself handles the contract (clear
    /// the exception key, start the heartbeat, subscribe to
    /// `taskworker.update`) before calling this; override for class-specific
    /// setup that needs the context's KV/bus handles.
    async fn run_before(&self, ctx: &TaskContext<K, B>) -> Result<(), SkaldError> {
        let _ = ctx;
        Ok(())
    }

    /// The task's actual business logic. No default: every worker class
    /// must supply one.
    async fn run_main(&self, ctx: &TaskContext<K, B>) -> Result<(), SkaldError>;

    /// Default: no-op. The runtime stops the heartbeat and pushes the
    /// SUCCESS sentinel after this returns `Ok`.
    async fn run_after(&self, ctx: &TaskContext<K, B>) -> Result<(), SkaldError> {
        let _ = ctx;
        Ok(())
    }

    /// Default: no-op. Runs once per process, after the runtime's own
    /// release steps (closing the bus consumer, and on a signal, pushing
    /// CANCELLED); override to release class-specific resources. Must be
    /// safe to call with no open connections.
    async fn release(&self, ctx: &TaskContext<K, B>) {
        let _ = ctx;
    }

    /// Default: no-op. Delivered for every `taskworker.update` message keyed
    /// to this task, decoded off the intra-task update topic.
    async fn update_event(&self, ctx: &TaskContext<K, B>, event: UpdateTaskWorkerEvent) {
        let _ = (ctx, event);
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum TerminationSignal {
    Sigint,
    Sigterm,
}

/// Drives one [`TaskWorker`] through its lifecycle until it naturally
/// completes or a termination signal arrives. Not a singleton: one instance
/// per task subprocess, which is itself one OS process.
pub struct TaskWorkerRuntime<K, B, W> {
    ctx: TaskContext<K, B>,
    worker: Arc<W>,
    config: SkaldConfig,
    is_done: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
    heartbeat: Arc<tokio::sync::Mutex<SurviveHandler<K>>>,
}

impl<K, B, W> TaskWorkerRuntime<K, B, W>
where
    K: KvStore + 'static,
    B: Bus + 'static,
    W: TaskWorker<K, B> + 'static,
{
    pub fn new(
        kv: Arc<K>,
        bus: Arc<B>,
        task_id: impl Into<String>,
        attachments: Box<RawValue>,
        worker: Arc<W>,
        config: SkaldConfig,
    ) -> Self {
        let task_id = task_id.into();
        let heartbeat_key = format!("task:{task_id}:heartbeat");
        let heartbeat = SurviveHandler::new(Arc::clone(&kv), heartbeat_key, "task", config.survive_period);

        Self {
            ctx: TaskContext {
                task_id,
                attachments,
                kv,
                bus,
            },
            worker,
            config,
            is_done: Arc::new(AtomicBool::new(false)),
            released: Arc::new(AtomicBool::new(false)),
            heartbeat: Arc::new(tokio::sync::Mutex::new(heartbeat)),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.ctx.task_id
    }

    /// Run the full lifecycle: `run_before`, `run_main`, `run_after`,
    /// with every hook's error routed through the error handler, and
    /// `release()` run exactly once regardless of how this returns.
    ///
    /// `Ok(())` means the task completed and pushed SUCCESS (or was already
    /// cancelled by a signal); `Err` means some hook failed and FAILED was
    /// pushed. A worker binary's own `main()` should map the two to exit
    /// codes 0 and 1 respectively.
    pub async fn run(self: Arc<Self>) -> Result<(), SkaldError> {
        let span = tracing::info_span!("task_worker", task = %self.ctx.task_id);
        let _enter = span.enter();

        let exception_key = format!("task:{}:exception", self.ctx.task_id);
        let update_reader: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>> =
            Arc::new(tokio::sync::Mutex::new(None));

        let outcome = match self.setup(&exception_key, &update_reader).await {
            Ok(signal_task) => {
                let outcome = self.run_body(&exception_key).await;
                signal_task.abort();
                outcome
            }
            Err(err) => {
                self.error_handler(&exception_key, &err).await;
                Err(err)
            }
        };

        self.release(None, &update_reader).await;

        outcome
    }

    /// Clear the stale exception key, start the heartbeat and subscribe to
    /// `taskworker.update`, in that order. Any failure here is treated the
    /// same as a `run_before` failure: the caller routes it through
    /// [`Self::error_handler`] rather than letting it escape `run()` with
    /// the heartbeat left running and no FAILED sentinel pushed.
    async fn setup(
        self: &Arc<Self>,
        exception_key: &str,
        update_reader: &Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
    ) -> Result<JoinHandle<()>, SkaldError> {
        self.ctx.kv.delete(exception_key).await?;
        self.heartbeat.lock().await.start();

        let handle = self.spawn_update_reader().await?;
        *update_reader.lock().await = Some(handle);

        Ok(self.spawn_signal_handler(Arc::clone(update_reader)))
    }

    async fn run_body(&self, exception_key: &str) -> Result<(), SkaldError> {
        if let Err(err) = self.worker.run_before(&self.ctx).await {
            self.error_handler(exception_key, &err).await;
            return Err(err);
        }

        match self.worker.run_main(&self.ctx).await {
            Ok(()) => {
                if let Err(err) = self.worker.run_after(&self.ctx).await {
                    self.error_handler(exception_key, &err).await;
                    return Err(err);
                }

                self.heartbeat.lock().await.stop(self.config.shutdown_join_timeout).await;
                if !self.is_done.load(Ordering::Acquire) {
                    self.heartbeat.lock().await.push_terminal(HeartbeatSentinel::Success).await;
                }
                Ok(())
            }
            Err(err) => {
                self.error_handler(exception_key, &err).await;
                Err(err)
            }
        }
    }

    /// `error_handler`: stop the heartbeat, record the exception,
    /// push FAILED.
    async fn error_handler(&self, exception_key: &str, err: &SkaldError) {
        self.heartbeat.lock().await.stop(self.config.shutdown_join_timeout).await;
        if let Err(write_err) = self.ctx.kv.set(exception_key, &err.to_string()).await {
            tracing::warn!(?write_err, "failed to record task exception");
        }
        self.heartbeat.lock().await.push_terminal(HeartbeatSentinel::Failed).await;
        tracing::error!(%err, "task worker failed");
    }

    /// `release(signal?)`: idempotent under concurrent invocation
    /// from the normal exit path and the signal handler (testable
    /// property). Closes the `taskworker.update` consumer; on a signal,
    /// additionally stops the heartbeat and pushes CANCELLED. Always runs
    /// the worker's own `release` hook exactly once.
    async fn release(&self, signal: Option<TerminationSignal>, update_reader: &tokio::sync::Mutex<Option<JoinHandle<()>>>) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = update_reader.lock().await.take() {
            handle.abort();
        }

        if signal.is_some() {
            self.heartbeat.lock().await.stop(self.config.shutdown_join_timeout).await;
            self.heartbeat.lock().await.push_terminal(HeartbeatSentinel::Cancelled).await;
        }

        self.worker.release(&self.ctx).await;
    }

    async fn spawn_update_reader(self: &Arc<Self>) -> Result<JoinHandle<()>, SkaldError> {
        let mut consumer = self.ctx.bus.subscribe(&[Topic::TaskWorkerUpdate]).await?;
        let this = Arc::clone(self);

        Ok(tokio::spawn(async move {
            loop {
                match consumer.next().await {
                    Ok(Some(msg)) if msg.key == this.ctx.task_id => {
                        match serde_json::from_str::<UpdateTaskWorkerEvent>(&msg.value) {
                            Ok(event) => this.worker.update_event(&this.ctx, event).await,
                            Err(err) => tracing::error!(?err, "malformed taskworker.update payload, dropping"),
                        }
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(err) => tracing::warn!(?err, "taskworker.update consumer error, continuing"),
                }
            }
            let _ = consumer.close().await;
        }))
    }

    #[cfg(unix)]
    fn spawn_signal_handler(
        self: &Arc<Self>,
        update_reader: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut sigint, mut sigterm) = match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(a), Ok(b)) => (a, b),
                _ => return,
            };

            let received = tokio::select! {
                _ = sigint.recv() => TerminationSignal::Sigint,
                _ = sigterm.recv() => TerminationSignal::Sigterm,
            };

            tracing::info!(?received, "task worker received signal, releasing");
            this.is_done.store(true, Ordering::Release);
            this.release(Some(received), &update_reader).await;
            std::process::exit(0);
        })
    }

    #[cfg(not(unix))]
    fn spawn_signal_handler(
        self: &Arc<Self>,
        update_reader: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            this.is_done.store(true, Ordering::Release);
            this.release(Some(TerminationSignal::Sigint), &update_reader).await;
            std::process::exit(0);
        })
    }
}

/// Read the task id a node's worker registry set via `SKALD_TASK_ID` (see
/// `skald_node::registry::WorkerSpec::spawn`).
pub fn task_id_from_env() -> Result<String, SkaldError> {
    std::env::var("SKALD_TASK_ID").map_err(|err| SkaldError::new(ErrorKind::ProgrammerError, err))
}

/// Read the opaque attachment blob a node's worker registry set via
/// `SKALD_TASK_ATTACHMENTS`.
pub fn attachments_from_env() -> Result<Box<RawValue>, SkaldError> {
    let raw = std::env::var("SKALD_TASK_ATTACHMENTS").unwrap_or_else(|_| "{}".to_string());
    RawValue::from_string(raw).map_err(SkaldError::malformed)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use skald_core::testutil::{MemoryBus, MemoryKv};

    use super::*;

    struct RecordingWorker {
        main_result: Result<(), ()>,
        release_calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskWorker<MemoryKv, MemoryBus> for RecordingWorker {
        async fn run_main(&self, _ctx: &TaskContext<MemoryKv, MemoryBus>) -> Result<(), SkaldError> {
            self.main_result.clone().map_err(|()| SkaldError::malformed("boom"))
        }

        async fn release(&self, _ctx: &TaskContext<MemoryKv, MemoryBus>) {
            self.release_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn runtime(
        main_result: Result<(), ()>,
    ) -> (Arc<TaskWorkerRuntime<MemoryKv, MemoryBus, RecordingWorker>>, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        let bus = Arc::new(MemoryBus::new());
        let worker = Arc::new(RecordingWorker {
            main_result,
            release_calls: AtomicUsize::new(0),
        });
        let runtime = Arc::new(TaskWorkerRuntime::new(
            Arc::clone(&kv),
            bus,
            "t1",
            RawValue::from_string("{}".to_string()).unwrap(),
            worker,
            SkaldConfig::default().with_survive_period(Duration::from_millis(10)),
        ));
        (runtime, kv)
    }

    #[tokio::test]
    async fn successful_run_pushes_success_sentinel() {
        let (runtime, kv) = runtime(Ok(()));
        runtime.run().await.unwrap();

        let heartbeat: i64 = kv.get("task:t1:heartbeat").await.unwrap().unwrap().parse().unwrap();
        assert_eq!(heartbeat, HeartbeatSentinel::Success.as_value());
        assert_eq!(kv.get("task:t1:exception").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failing_main_pushes_failed_sentinel_and_records_exception() {
        let (runtime, kv) = runtime(Err(()));
        let result = runtime.run().await;
        assert!(result.is_err());

        let heartbeat: i64 = kv.get("task:t1:heartbeat").await.unwrap().unwrap().parse().unwrap();
        assert_eq!(heartbeat, HeartbeatSentinel::Failed.as_value());
        assert!(kv.get("task:t1:exception").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_runs_exactly_once_under_double_invocation() {
        let (runtime, _kv) = runtime(Ok(()));
        let update_reader = Arc::new(tokio::sync::Mutex::new(None));

        runtime.release(None, &update_reader).await;
        runtime.release(Some(TerminationSignal::Sigterm), &update_reader).await;

        assert_eq!(runtime.worker.release_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_clears_stale_exception_before_starting() {
        let (runtime, kv) = runtime(Ok(()));
        kv.set("task:t1:exception", "stale").await.unwrap();

        runtime.run().await.unwrap();

        assert_eq!(kv.get("task:t1:exception").await.unwrap(), None);
    }

    /// A bus whose `subscribe` always fails, standing in for a broker outage
    /// hit while the runtime is setting up `taskworker.update`.
    struct UnsubscribableBus;

    #[async_trait]
    impl Bus for UnsubscribableBus {
        async fn produce(&self, _topic: Topic, _key: &str, _value: &str) -> Result<(), SkaldError> {
            Ok(())
        }

        async fn subscribe(&self, _topics: &[Topic]) -> Result<Box<dyn BusConsumer>, SkaldError> {
            Err(SkaldError::new(ErrorKind::TransientIo, anyhow::anyhow!("broker unreachable")))
        }
    }

    #[tokio::test]
    async fn setup_failure_pushes_failed_sentinel_and_still_releases() {
        let kv = Arc::new(MemoryKv::new());
        let bus = Arc::new(UnsubscribableBus);
        let worker = Arc::new(RecordingWorker {
            main_result: Ok(()),
            release_calls: AtomicUsize::new(0),
        });
        let runtime = Arc::new(TaskWorkerRuntime::new(
            Arc::clone(&kv),
            bus,
            "t1",
            RawValue::from_string("{}".to_string()).unwrap(),
            Arc::clone(&worker),
            SkaldConfig::default().with_survive_period(Duration::from_millis(10)),
        ));

        let result = runtime.run().await;
        assert!(result.is_err());

        let heartbeat: i64 = kv.get("task:t1:heartbeat").await.unwrap().unwrap().parse().unwrap();
        assert_eq!(heartbeat, HeartbeatSentinel::Failed.as_value());
        assert!(kv.get("task:t1:exception").await.unwrap().is_some());
        assert_eq!(worker.release_calls.load(Ordering::SeqCst), 1);
    }
}
