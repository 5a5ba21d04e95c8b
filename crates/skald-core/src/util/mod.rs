/// Current wall-clock time as milliseconds since the Unix epoch, the unit
/// every heartbeat/liveness timestamp in this crate is expressed in.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
