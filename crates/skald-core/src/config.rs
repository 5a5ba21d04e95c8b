use std::time::Duration;

/// Every tunable period, timeout and limit the fabric needs, with sensible
/// defaults.
///
/// Construct with [`SkaldConfig::default`] and override individual fields, or
/// use the `with_*` setters for a fluent builder style. Nothing in this crate
/// reads environment variables or YAML directly — that wiring belongs in a
/// binary's `main.rs` (see the `skald-controller` and `skald-node` crates),
/// keeping this type usable from tests without touching the process
/// environment.
#[derive(Clone, Debug)]
pub struct SkaldConfig {
    /// How long a node record may go unseen in `nodes:hash` before the node
    /// monitor considers it offline and evicts it.
    ///
    /// Default: 10s.
    pub liveness_timeout: Duration,

    /// How often a node refreshes `nodes:hash[id]` and its survive-handler
    /// heartbeat.
    ///
    /// Default: 3s.
    pub activity_period: Duration,

    /// How often the controller's node monitor reconciles KV into its
    /// in-memory node store.
    ///
    /// Default: 4s.
    pub monitor_skald_interval: Duration,

    /// How often the controller's task monitor reconciles the database
    /// into its in-memory heartbeat store.
    ///
    /// Default: 3s.
    pub monitor_task_interval: Duration,

    /// How often the dispatcher looks for unassigned tasks.
    ///
    /// Default: 3s.
    pub dispatcher_interval: Duration,

    /// How often a node's task worker manager republishes its live task
    /// list to KV.
    ///
    /// Default: 3s.
    pub kv_sync_period: Duration,

    /// The period of a survive handler's heartbeat writes.
    ///
    /// Default: 1s.
    pub survive_period: Duration,

    /// Number of samples kept in a task's heartbeat sliding window.
    ///
    /// A worker must publish at least 3 distinct values within this many
    /// observations to be classified as alive.
    ///
    /// Default: 5.
    pub heartbeat_window: usize,

    /// How long a graceful stop (SIGTERM) is given to succeed before the task
    /// worker manager escalates to a hard stop (SIGKILL).
    ///
    /// Default: 5s.
    pub graceful_kill_ms: Duration,

    /// Finite timeout applied to every KV/BUS/DB call.
    ///
    /// Default: 10s.
    pub io_timeout: Duration,

    /// Base delay, multiplier and cap for the exponential backoff applied to
    /// transient I/O retries.
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    pub backoff_max: Duration,

    /// Maximum attempts (including the first) an adapter crate gives a
    /// single transient-I/O call before surfacing the error to its caller.
    ///
    /// Default: 5.
    pub backoff_max_attempts: u32,

    /// Bounded wait `stop()` gives a component to shut down before giving up
    /// on a clean join.
    ///
    /// Default: 10s.
    pub shutdown_join_timeout: Duration,

    /// The attachment-blob key used as a node's secondary "resource id" index,
    /// generalising a deployment's domain-specific field such as `cameraId`.
    ///
    /// Default: `"resourceId"`.
    pub resource_id_key: String,

    /// Partition count used when the bus adapter creates its control topics.
    ///
    /// Default: 6.
    pub bus_partitions: i32,

    /// Replication factor used when the bus adapter creates its control
    /// topics.
    ///
    /// Default: 3.
    pub bus_replication_factor: i32,
}

impl Default for SkaldConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_millis(10_000),
            activity_period: Duration::from_secs(3),
            monitor_skald_interval: Duration::from_secs(4),
            monitor_task_interval: Duration::from_secs(3),
            dispatcher_interval: Duration::from_secs(3),
            kv_sync_period: Duration::from_secs(3),
            survive_period: Duration::from_secs(1),
            heartbeat_window: 5,
            graceful_kill_ms: Duration::from_millis(5_000),
            io_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            backoff_max: Duration::from_secs(30),
            backoff_max_attempts: 5,
            shutdown_join_timeout: Duration::from_secs(10),
            resource_id_key: "resourceId".to_string(),
            bus_partitions: 6,
            bus_replication_factor: 3,
        }
    }
}

impl SkaldConfig {
    pub fn with_liveness_timeout(mut self, value: Duration) -> Self {
        self.liveness_timeout = value;
        self
    }

    pub fn with_activity_period(mut self, value: Duration) -> Self {
        self.activity_period = value;
        self
    }

    pub fn with_monitor_skald_interval(mut self, value: Duration) -> Self {
        self.monitor_skald_interval = value;
        self
    }

    pub fn with_monitor_task_interval(mut self, value: Duration) -> Self {
        self.monitor_task_interval = value;
        self
    }

    pub fn with_dispatcher_interval(mut self, value: Duration) -> Self {
        self.dispatcher_interval = value;
        self
    }

    pub fn with_kv_sync_period(mut self, value: Duration) -> Self {
        self.kv_sync_period = value;
        self
    }

    pub fn with_survive_period(mut self, value: Duration) -> Self {
        self.survive_period = value;
        self
    }

    pub fn with_heartbeat_window(mut self, value: usize) -> Self {
        self.heartbeat_window = value;
        self
    }

    pub fn with_graceful_kill_ms(mut self, value: Duration) -> Self {
        self.graceful_kill_ms = value;
        self
    }

    pub fn with_io_timeout(mut self, value: Duration) -> Self {
        self.io_timeout = value;
        self
    }

    pub fn with_resource_id_key(mut self, value: impl Into<String>) -> Self {
        self.resource_id_key = value.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design() {
        let config = SkaldConfig::default();
        assert_eq!(config.liveness_timeout, Duration::from_millis(10_000));
        assert_eq!(config.heartbeat_window, 5);
    }

    #[test]
    fn builder_overrides_single_field() {
        let config = SkaldConfig::default().with_heartbeat_window(10);
        assert_eq!(config.heartbeat_window, 10);
        assert_eq!(config.activity_period, Duration::from_secs(3));
    }
}
