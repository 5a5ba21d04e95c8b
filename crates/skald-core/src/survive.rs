//! The survive handler: a periodic heartbeat writer shared by node
//! processes (writing `node:{id}:heartbeat`) and task worker subprocesses
//! (writing `task:{id}:heartbeat`).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::flag::ShutdownFlag;
use crate::kv::KvStore;
use crate::sentinel::HeartbeatSentinel;

/// Writes the current monotonic millisecond timestamp to a fixed KV key every
/// `period`, until stopped.
///
/// `start()`/`stop()` form a singleton loop per instance: starting twice is a
/// programmer error, and `stop()` is idempotent and guarantees no
/// further writes once it returns.
pub struct SurviveHandler<K> {
    kv: Arc<K>,
    key: String,
    role: String,
    period: Duration,
    flag: ShutdownFlag,
    handle: Option<JoinHandle<()>>,
}

impl<K: KvStore + 'static> SurviveHandler<K> {
    pub fn new(kv: Arc<K>, key: impl Into<String>, role: impl Into<String>, period: Duration) -> Self {
        Self {
            kv,
            key: key.into(),
            role: role.into(),
            period,
            flag: ShutdownFlag::new(),
            handle: None,
        }
    }

    /// Start the periodic writer. Panics if this handler is already started;
    /// double-starting a singleton loop is a programmer error, not something
    /// to silently tolerate.
    pub fn start(&mut self) {
        assert!(
            self.handle.is_none(),
            "survive handler for {} started twice",
            self.key
        );

        let kv = Arc::clone(&self.kv);
        let key = self.key.clone();
        let role = self.role.clone();
        let period = self.period;
        let flag = self.flag.clone();

        self.handle = Some(tokio::spawn(async move {
            let span = tracing::info_span!("survive", role = %role, key = %key);
            let _enter = span.enter();

            loop {
                let now_ms = crate::util::now_ms();
                if let Err(err) = kv.set(&key, &now_ms.to_string()).await {
                    tracing::warn!(?err, "survive handler heartbeat write failed");
                }

                tokio::select! {
                    _ = flag.wait() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
        }));
    }

    /// Write a terminal sentinel instead of a timestamp. Safe to call
    /// whether or not the periodic loop is running.
    pub async fn push_terminal(&self, kind: HeartbeatSentinel) {
        if let Err(err) = self.kv.set(&self.key, &kind.as_value().to_string()).await {
            tracing::warn!(?err, ?kind, "survive handler terminal write failed");
        }
    }

    /// Stop the periodic loop and wait for it to exit, bounded by
    /// `join_timeout`. Idempotent: calling `stop` more than once, or before
    /// `start`, is a no-op.
    pub async fn stop(&mut self, join_timeout: Duration) {
        self.flag.raise();
        if let Some(handle) = self.handle.take() {
            if tokio::time::timeout(join_timeout, handle).await.is_err() {
                tracing::warn!(key = %self.key, "survive handler did not join within timeout");
            }
        }
    }
}

impl<K> Drop for SurviveHandler<K> {
    fn drop(&mut self) {
        self.flag.raise();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testutil::MemoryKv;

    #[tokio::test]
    async fn writes_timestamps_on_a_period() {
        let kv = Arc::new(MemoryKv::new());
        let mut handler = SurviveHandler::new(
            Arc::clone(&kv),
            "task:t1:heartbeat",
            "task",
            Duration::from_millis(10),
        );
        handler.start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        handler.stop(Duration::from_secs(1)).await;

        let value = kv.get("task:t1:heartbeat").await.unwrap().unwrap();
        assert!(value.parse::<i64>().unwrap() > 0);
    }

    #[tokio::test]
    #[should_panic(expected = "started twice")]
    async fn double_start_panics() {
        let kv = Arc::new(MemoryKv::new());
        let mut handler = SurviveHandler::new(kv, "k", "role", Duration::from_secs(1));
        handler.start();
        handler.start();
    }

    #[tokio::test]
    async fn push_terminal_writes_sentinel() {
        let kv = Arc::new(MemoryKv::new());
        let handler = SurviveHandler::new(Arc::clone(&kv), "task:t1:heartbeat", "task", Duration::from_secs(1));
        handler.push_terminal(HeartbeatSentinel::Cancelled).await;

        let value = kv.get("task:t1:heartbeat").await.unwrap().unwrap();
        assert_eq!(value.parse::<i64>().unwrap(), HeartbeatSentinel::Cancelled.as_value());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let kv = Arc::new(MemoryKv::new());
        let mut handler = SurviveHandler::new(kv, "k", "role", Duration::from_millis(10));
        handler.start();
        handler.stop(Duration::from_secs(1)).await;
        handler.stop(Duration::from_secs(1)).await;
    }
}
