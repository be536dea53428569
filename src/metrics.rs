//! Process-wide counters for the link and the DM pipeline.
//! Read with [`snapshot`]; the `probe` command prints them.
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static POLLS_OK: AtomicU64 = AtomicU64::new(0);
static POLLS_FAILED: AtomicU64 = AtomicU64::new(0);
static FRAMES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static DECODE_FAILED: AtomicU64 = AtomicU64::new(0);
static FRAMES_SENT: AtomicU64 = AtomicU64::new(0);
static SEND_FAILED: AtomicU64 = AtomicU64::new(0);
static DM_SENT: AtomicU64 = AtomicU64::new(0);
static DM_ACKED: AtomicU64 = AtomicU64::new(0);
static DM_FAILED: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn inc_polls_ok() {
    POLLS_OK.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_polls_failed() {
    POLLS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_frames_received() {
    FRAMES_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_decode_failed() {
    DECODE_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_frames_sent() {
    FRAMES_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_send_failed() {
    SEND_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_dm_sent() {
    DM_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_dm_failed() {
    DM_FAILED.fetch_add(1, Ordering::Relaxed);
}

/// Count an acknowledged DM along with how long the ack took.
pub fn observe_dm_ack(latency: Duration) {
    DM_ACKED.fetch_add(1, Ordering::Relaxed);
    ACK_LATENCY_SUM_MS.fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
    ACK_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Snapshot {
    pub polls_ok: u64,
    pub polls_failed: u64,
    pub frames_received: u64,
    pub decode_failed: u64,
    pub frames_sent: u64,
    pub send_failed: u64,
    pub dm_sent: u64,
    pub dm_acked: u64,
    pub dm_failed: u64,
    pub ack_latency_avg_ms: Option<u64>,
}

pub fn snapshot() -> Snapshot {
    let sum = ACK_LATENCY_SUM_MS.load(Ordering::Relaxed);
    let count = ACK_LATENCY_COUNT.load(Ordering::Relaxed);
    Snapshot {
        polls_ok: POLLS_OK.load(Ordering::Relaxed),
        polls_failed: POLLS_FAILED.load(Ordering::Relaxed),
        frames_received: FRAMES_RECEIVED.load(Ordering::Relaxed),
        decode_failed: DECODE_FAILED.load(Ordering::Relaxed),
        frames_sent: FRAMES_SENT.load(Ordering::Relaxed),
        send_failed: SEND_FAILED.load(Ordering::Relaxed),
        dm_sent: DM_SENT.load(Ordering::Relaxed),
        dm_acked: DM_ACKED.load(Ordering::Relaxed),
        dm_failed: DM_FAILED.load(Ordering::Relaxed),
        ack_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
    }
}
